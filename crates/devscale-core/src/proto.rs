use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Maximum space for one TCP message. Both sides read once into a buffer
/// of this size and parse the whole buffer, so larger messages are not
/// transportable.
pub const TCP_MSG_SIZE: usize = 1024;

/// Client service request: one workload invocation to queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceRequest {
    /// Queue name.
    pub queue: String,
    /// Extra workload arguments.
    pub args: Vec<String>,
    /// Workload run-time limit, in seconds (0 = default).
    pub limit: f64,
}

/// Worker pull request for one work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkRequest {
    /// Queue name.
    pub queue: String,
}

/// Work handed to a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkItem {
    /// Non-empty on errors.
    pub error: String,
    /// Extra workload arguments.
    pub args: Vec<String>,
    /// Run-time limit in seconds (0 = default).
    pub limit: f64,
    /// True when the error is due to the queue being empty.
    pub empty: bool,
}

/// Reply traveling worker -> frontend -> client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Reply {
    /// Which pod did the work.
    pub pod: String,
    /// On which node.
    pub node: String,
    /// Device mapped to the worker, if any.
    pub device: String,
    /// Non-empty on errors.
    pub error: String,
    /// > 0 when the workload timed out.
    pub timeout: f64,
    /// Queue wait time in seconds; the frontend's measurement is
    /// authoritative and overwrites whatever the worker sent.
    #[serde(rename = "Waittime")]
    pub wait_time: f64,
    /// Workload run time in seconds.
    pub runtime: f64,
    /// Workload return code.
    pub retcode: i32,
}

impl Reply {
    /// An error reply carrying `msg`, as produced for per-request failures.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            retcode: 1,
            ..Self::default()
        }
    }
}

/// Encode a record as indented JSON, enforcing the transport cap.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let data = serde_json::to_vec_pretty(value).map_err(ProtoError::Encode)?;
    if data.len() > TCP_MSG_SIZE {
        return Err(ProtoError::Oversize(data.len()));
    }
    Ok(data)
}

/// Decode a record from one received buffer. Missing fields default and
/// unknown fields are ignored, so peers can evolve independently.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtoError> {
    serde_json::from_slice(data).map_err(ProtoError::Decode)
}
