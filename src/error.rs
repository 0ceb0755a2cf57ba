use thiserror::Error;

/// Failures a subscriber can observe, plus the local usage errors raised
/// before anything reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Stream does not exist")]
    NotFound,

    #[error("{0}")]
    Remote(String),

    #[error("Service {0} does not exist")]
    ServiceNotFound(String),

    #[error("Connection lost to remote service, the channel has shut down due to a transport failure")]
    ConnectionFailure,

    #[error("An unknown step in the protocol [{0}] has been sent, this is a bug")]
    UnknownStep(String),

    #[error("Protocol step [{step}] arrived while {state}, this is a bug")]
    UnexpectedStep { step: String, state: String },

    #[error("malformed stream uri: {0}")]
    MalformedUri(String),

    #[error("demand must be positive, got {0}")]
    InvalidDemand(u64),

    #[error("codec failure: {0}")]
    Codec(String),
}
