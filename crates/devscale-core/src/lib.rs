pub mod error;
pub mod metrics;
pub mod proto;
pub mod queue;
pub mod signal;
pub mod telemetry;
pub mod wire;

pub use error::{ConfigError, ProtoError};
pub use proto::{Reply, ServiceRequest, WorkItem, WorkRequest, TCP_MSG_SIZE};
pub use queue::{DispatchQueue, Pull, QueueItem, QueueSet, QueueSnapshot};
