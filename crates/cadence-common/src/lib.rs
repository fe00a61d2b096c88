//! Common types for cadence: the Job CRD, resource stores, change events,
//! configuration, and errors

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub use events::ChangeEvent;
pub use store::{Store, StoreWriter};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the cadence custom resources
pub const API_GROUP: &str = "cadence.dev";

/// API version of the cadence custom resources
pub const API_VERSION: &str = "v1";

/// Name of the Job CRD as registered with the API server
pub const JOB_CRD_NAME: &str = "cadencejobs.cadence.dev";

/// Label key correlating a Pod to its owning Job (value is the Job name)
pub const JOB_LABEL_KEY: &str = "cadence.dev/job";

/// Label key marking Pods managed by cadence
pub const APP_LABEL_KEY: &str = "app";

/// Label value marking Pods managed by cadence
pub const APP_LABEL_VALUE: &str = "cadence";

/// Label selector for Pods managed by cadence (for Kubernetes API queries)
pub const APP_LABEL_SELECTOR: &str = "app=cadence";

/// Field manager used for every patch issued by the operator
pub const FIELD_MANAGER: &str = "cadence-controller";
