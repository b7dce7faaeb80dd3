use thiserror::Error;

use crate::provider::SlotId;

pub type TkResult<T> = Result<T, TkError>;

/// Error taxonomy for everything the core can fail at.
///
/// A "signature invalid" verdict from the provider is deliberately not part
/// of this taxonomy: verification returns a plain boolean instead.
#[derive(Error, Debug)]
pub enum TkError {
    #[error("{0}")]
    Default(String),

    #[error("{call}: provider returned status {rv:#06x}")]
    Provider { call: &'static str, rv: u64 },

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("no token present in slot {0}")]
    NoTokenPresent(SlotId),

    #[error("unrecognized object class {0:#010x}")]
    Taxonomy(u64),

    #[error("attribute query failed: {call} returned status {rv:#06x}")]
    QueryFailed { call: &'static str, rv: u64 },

    #[error("no object matched the search template: {0}")]
    NotFound(&'static str),

    #[error("error loading the PKCS#11 library: {0}")]
    LibLoading(#[from] libloading::Error),

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
}

impl From<std::convert::Infallible> for TkError {
    fn from(value: std::convert::Infallible) -> Self {
        match value {}
    }
}
