//! Job CRD types
//!
//! A `Job` declares a container image, its arguments, and how many worker
//! Pods should run it. Its `state` records how far the controller has
//! driven the Job toward that declaration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{APP_LABEL_KEY, APP_LABEL_VALUE, JOB_LABEL_KEY};

// =============================================================================
// State
// =============================================================================

/// Reconciliation state of a Job
///
/// States are ordered: a Job only moves forward, except that a change to
/// `desired` (or the loss of a Pod) sends it back to `PodCreation`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Newly observed, no transition driven yet
    #[default]
    Undefined,
    /// Pods are being created or deleted to match `desired`
    PodCreation,
    /// Observed Pod count matches `desired`
    Ready,
}

impl JobState {
    /// Whether this is the terminal state
    pub fn is_terminal(self) -> bool {
        self == Self::Ready
    }

    /// Wire name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "UNDEFINED",
            Self::PodCreation => "POD_CREATION",
            Self::Ready => "READY",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Declared intent for a set of identical worker Pods
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cadence.dev",
    version = "v1",
    kind = "Job",
    plural = "cadencejobs",
    shortname = "cj",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.state"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.desired"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Reconciliation state, written by the controller
    #[serde(default)]
    pub state: JobState,

    /// Number of Pods that should exist for this Job
    #[serde(default)]
    pub desired: u32,

    /// Container image every Pod runs
    pub image: String,

    /// Command line of the container, in order
    #[serde(default)]
    pub args: Vec<String>,
}

impl JobSpec {
    /// Create a spec in the `Undefined` state
    pub fn new(image: impl Into<String>, desired: u32) -> Self {
        Self {
            state: JobState::Undefined,
            desired,
            image: image.into(),
            args: Vec::new(),
        }
    }

    /// Set the container command line
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Job {
    /// Label selector matching every Pod correlated to this Job
    pub fn pod_selector(&self) -> String {
        format!(
            "{}={},{}={}",
            APP_LABEL_KEY,
            APP_LABEL_VALUE,
            JOB_LABEL_KEY,
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
