/// Coarse error shared between the relay and its clients.
#[derive(Debug, thiserror::Error)]
pub enum ChatKeyError {
    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("recipient unreachable")]
    Unreachable,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}
