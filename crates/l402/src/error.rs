use thiserror::Error;

/// Errors returned by L402 operations.
///
/// Verification failures are deliberately coarse: callers mapping these to
/// HTTP responses must not let a client distinguish a bad signature from a
/// bad preimage. Both are [`Error::InvalidToken`] / [`Error::InvalidPreimage`]
/// internally but collapse to the same 402 challenge at the edge.
#[derive(Debug, Error)]
pub enum Error {
    #[error("secret already exists for this token id")]
    AlreadyExists,

    #[error("no secret found for this token id")]
    NotFound,

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("invalid preimage")]
    InvalidPreimage,

    #[error("payment not settled yet")]
    PaymentPending,

    #[error("payment invoice was canceled")]
    PaymentCanceled,

    #[error("caveat not satisfied: {0}")]
    CaveatNotSatisfied(String),

    #[error("challenger unavailable: {0}")]
    ChallengerUnavailable(String),

    #[error("secret store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("malformed L402 authorization header")]
    MalformedHeader,

    #[error("token decode error: {0}")]
    Decode(String),

    #[error("system randomness unavailable: {0}")]
    Rng(String),
}
