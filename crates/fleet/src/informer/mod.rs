//! Deployment cache for a single cluster.
//!
//! The main components are:
//! - [`DeploymentInformer`]: drives the watch, applies notifications in order
//!   and forwards the resulting [`DeploymentEvent`]s
//! - [`DeploymentStore`]: the indexed, cache-only read side shared with the
//!   HTTP API
//! - [`LabelSelector`]: label matching for cache queries

pub mod deployment_informer;
pub mod selector;
pub mod store;
pub mod types;

pub use deployment_informer::DeploymentInformer;
pub use deployment_informer::InformerOptions;
pub use deployment_informer::InformerPhase;
pub use selector::LabelSelector;
pub use store::DeploymentStore;
pub use types::DeletedObject;
pub use types::DeploymentEvent;
pub use types::DeploymentRecord;
pub use types::InformerError;
pub use types::ObjectKey;
