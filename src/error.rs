use thiserror::Error;

use crate::crypto::CryptoError;
use crate::resolver::AuthError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid JSON body")]
    InvalidJson,
    #[error("request body exceeds {max} bytes")]
    BodyTooLarge { max: usize },
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("no upstream API keys available")]
    NoUpstreamKeys,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
