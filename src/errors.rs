//! Error taxonomy for the core (spec §7). These are the kinds the rest of
//! the crate maps failures into; call sites decide the user-visible
//! fallback (intercept fallback, fail-closed block, SERVFAIL, 502 page).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KProxyError {
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("policy evaluator error: {0}")]
    Evaluator(String),

    #[error("certificate authority error: {0}")]
    Certificate(String),

    #[error("operational store error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl KProxyError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn evaluator(msg: impl Into<String>) -> Self {
        Self::Evaluator(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
