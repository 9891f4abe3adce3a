//! Domain types: image references and content digests
//!
//! These are the two value types the pinner maps between. Both carry a
//! canonical string form that round-trips through the durable store.

mod digest;
mod reference;

pub use digest::Digest;
pub use reference::ImageRef;

use thiserror::Error;

/// Errors from parsing canonical string forms
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid image reference {0:?}")]
    Reference(String),

    #[error("invalid digest {0:?} (expected \"<algorithm>:<value>\")")]
    Digest(String),
}
