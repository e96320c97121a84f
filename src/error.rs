use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("registration store error: {0}")]
    Store(String),

    #[error("registration record codec error: {0}")]
    Codec(String),

    #[error("sip message error: {0}")]
    SipStack(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    pub fn sip_stack<E: std::fmt::Display>(err: E) -> Self {
        Self::SipStack(err.to_string())
    }

    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::Store(err.to_string())
    }

    pub fn codec<E: std::fmt::Display>(err: E) -> Self {
        Self::Codec(err.to_string())
    }

    pub fn runtime<E: std::fmt::Display>(err: E) -> Self {
        Self::Runtime(err.to_string())
    }
}
