//! Core of the Cinder bridge: lets an agent drive a single-threaded scene
//! engine through a closed catalogue of tools.
//!
//! A call flows through [`dispatch::Dispatcher`], which validates it against
//! its [`contract::ToolContract`] and routes it to the
//! [`engine::EngineAdapter`], the [`batch::BatchExecutor`] or the
//! [`jobs::JobRegistry`]. Every engine access goes through the adapter's
//! single lock.

pub mod addressing;
pub mod batch;
pub mod catalogue;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod invocation;
pub mod jobs;
pub mod metrics;
pub mod validate;

pub use addressing::{EntityHandle, EntityPath};
pub use catalogue::Catalogue;
pub use config::CinderConfig;
pub use dispatch::Dispatcher;
pub use error::{BridgeError, EngineError, RollbackOutcome};
pub use invocation::{Invocation, Outcome};
pub use jobs::{Job, JobKind, JobState};
