//! Error taxonomy for the port pool, the resource manager, and the allocation service.
//!
//! Lower layers (`queue`, `pool`, `storage`) return this enum directly so callers can
//! match on the exact failure. The socket server and CLI glue collapse it into `anyhow`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no available resource")]
    NoAvailableResource,

    #[error("invalid state")]
    InvalidState,

    #[error("not found")]
    NotFound,

    #[error("context done")]
    ContextDone,

    #[error("static ip unavailable: {0}")]
    StaticIpUnavailable(String),

    #[error("factory error: {0}")]
    Factory(#[source] anyhow::Error),

    #[error("ledger error: {0}")]
    Ledger(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
