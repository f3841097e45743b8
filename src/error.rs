use thiserror::Error;

/// Errors raised while moving a [`Message`](crate::protocol::Message) on or off the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// NaN and infinities have no JSON representation.
    #[error("unsupported value for {field}: {value}")]
    UnsupportedValue { field: &'static str, value: f64 },

    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors surfaced by the hub coordinator.
#[derive(Debug, Error)]
pub enum HubError {
    /// The coordinator loop has stopped and no longer accepts commands.
    #[error("hub is not running")]
    Closed,

    /// A broadcast could not be serialized; the registry was left untouched.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}
