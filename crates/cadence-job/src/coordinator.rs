//! Apply-then-wait-for-convergence
//!
//! [`Coordinator::apply`] runs a [`Command`] against a target resource and,
//! when the command issued a mutation, suspends the caller until a watch
//! notification for the same resource satisfies [`Command::check`], the
//! resource is deleted, the timeout expires, or the coordinator shuts down.
//!
//! At most one command may be outstanding per target identity
//! (`namespace/name`). A second `apply` for a busy identity fails fast with
//! [`CoordinatorError::Reentrant`] instead of queueing behind the first.
//!
//! The coordinator learns about changes by being registered as an
//! [`EventListener`] on the dispatcher of the target kind. Delivery is
//! acknowledged: `on_event` returns only after the waiter has checked the
//! change, and a waiter that finishes releases its identity before
//! acknowledging. Listeners registered after the coordinator therefore never
//! see a change while the command it completed still holds the identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cadence_common::ChangeEvent;

use crate::dispatcher::EventListener;

/// Outcome of one command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandStatus {
    /// No outcome recorded; never a legitimate final value
    #[default]
    Unknown,
    /// The mutation was observed to converge
    Success,
    /// The mutation failed, did not converge in time, or was interrupted
    Failure,
    /// The target does not exist
    JobNotFound,
    /// The target was already in the requested state
    NoChangeNeeded,
}

impl CommandStatus {
    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }

    /// `Success` and `NoChangeNeeded` are indistinguishable to callers
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::NoChangeNeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::JobNotFound => "JobNotFound",
            Self::NoChangeNeeded => "NoChangeNeeded",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the coordinator should do after [`Command::run`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Decided without a mutation to observe
    Remove(CommandStatus),
    /// A mutation was issued; wait for it to be observed
    Wait,
}

/// One unit of work driven by the coordinator
#[async_trait]
pub trait Command<K>: Send + Sync {
    /// Perform the mutation, or short-circuit with a final status
    async fn run(&self) -> Action;

    /// Whether the change from `prior` to `current` shows convergence
    fn check(&self, prior: &K, current: &K) -> bool;
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a command is already pending for '{identity}'")]
    Reentrant { identity: String },
}

enum Change<K> {
    Modified { prior: K, current: K },
    Deleted,
}

/// A change for a pending identity, acknowledged once the waiter has seen it
struct Observation<K> {
    change: Change<K>,
    seen: oneshot::Sender<()>,
}

type PendingMap<K> = Mutex<HashMap<String, mpsc::UnboundedSender<Observation<K>>>>;

/// `namespace/name` of a resource
pub fn identity_of<K: ResourceExt>(resource: &K) -> String {
    format!(
        "{}/{}",
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    )
}

/// Releases the pending entry however `apply` exits
struct PendingSlot<'a, K> {
    pending: &'a PendingMap<K>,
    identity: String,
    released: AtomicBool,
}

impl<K> PendingSlot<'_, K> {
    /// At most once; a later claim for the same identity is left alone
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pending.lock().remove(&self.identity);
        }
    }
}

impl<K> Drop for PendingSlot<'_, K> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Synchronization engine for commands over resources of kind `K`
pub struct Coordinator<K> {
    pending: PendingMap<K>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl<K> Coordinator<K>
where
    K: ResourceExt + Clone + Send + Sync + 'static,
{
    /// `timeout` bounds each wait; cancelling `shutdown` interrupts every wait
    pub fn new(timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            shutdown,
        }
    }

    /// Whether a command is outstanding for `identity`
    pub fn is_pending(&self, identity: &str) -> bool {
        self.pending.lock().contains_key(identity)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run `command` against `target` and wait for its outcome
    pub async fn apply<C>(&self, target: &K, command: &C) -> Result<CommandStatus, CoordinatorError>
    where
        C: Command<K> + ?Sized,
    {
        let identity = identity_of(target);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = self.claim(&identity, tx)?;

        let status = match command.run().await {
            Action::Remove(status) => status,
            Action::Wait => self.await_convergence(&slot, command, &mut rx).await,
        };

        debug!(target = %identity, %status, "command finished");
        Ok(status)
    }

    fn claim(
        &self,
        identity: &str,
        tx: mpsc::UnboundedSender<Observation<K>>,
    ) -> Result<PendingSlot<'_, K>, CoordinatorError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(identity) {
            return Err(CoordinatorError::Reentrant {
                identity: identity.to_string(),
            });
        }
        pending.insert(identity.to_string(), tx);
        Ok(PendingSlot {
            pending: &self.pending,
            identity: identity.to_string(),
            released: AtomicBool::new(false),
        })
    }

    async fn await_convergence<C>(
        &self,
        slot: &PendingSlot<'_, K>,
        command: &C,
        rx: &mut mpsc::UnboundedReceiver<Observation<K>>,
    ) -> CommandStatus
    where
        C: Command<K> + ?Sized,
    {
        let identity = slot.identity.as_str();
        let observe = async {
            let mut status = CommandStatus::Unknown;
            while let Some(Observation { change, seen }) = rx.recv().await {
                let outcome = match change {
                    Change::Modified { prior, current } if command.check(&prior, &current) => {
                        Some(CommandStatus::Success)
                    }
                    Change::Modified { .. } => None,
                    Change::Deleted => Some(CommandStatus::JobNotFound),
                };
                let Some(outcome) = outcome else {
                    // provisional; a later notification may still converge
                    status = CommandStatus::Failure;
                    let _ = seen.send(());
                    continue;
                };
                slot.release();
                let _ = seen.send(());
                return outcome;
            }
            status
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(target = %identity, "wait interrupted by shutdown");
                CommandStatus::Failure
            }
            result = tokio::time::timeout(self.timeout, observe) => match result {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        target = %identity,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "command did not converge in time"
                    );
                    CommandStatus::Failure
                }
            },
        }
    }
}

#[async_trait]
impl<K> EventListener<K> for Coordinator<K>
where
    K: ResourceExt + Clone + Send + Sync + 'static,
{
    async fn on_event(&self, event: &ChangeEvent<K>) {
        if matches!(event, ChangeEvent::Addition(_)) {
            return;
        }
        let identity = identity_of(event.resource());
        let Some(tx) = self.pending.lock().get(&identity).cloned() else {
            return;
        };
        let change = match event {
            ChangeEvent::Modification { prior, current } => Change::Modified {
                prior: prior.clone(),
                current: current.clone(),
            },
            _ => Change::Deleted,
        };
        let (seen, acked) = oneshot::channel();
        if tx.send(Observation { change, seen }).is_err() {
            return;
        }
        // an Err means the waiter finished (timeout, shutdown) without reading it
        let _ = acked.await;
    }
}
