use crate::proto::TCP_MSG_SIZE;

/// Errors of the one-shot wire codec. Encoding failures of well-typed
/// records indicate a bug; decoding failures are peer input errors and
/// are reported back to the peer as structured replies.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("message encoding failed: {0}")]
    Encode(serde_json::Error),

    #[error("message decoding failed: {0}")]
    Decode(serde_json::Error),

    #[error("encoded message is {0} bytes, over the {TCP_MSG_SIZE} byte transport cap")]
    Oversize(usize),
}

/// Startup configuration errors. These terminate the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no queue names specified")]
    NoQueues,

    #[error("invalid queue name ''")]
    EmptyQueueName,
}
