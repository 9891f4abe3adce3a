//! Wire contract with the external digest resolver
//!
//! The resolver itself lives outside this crate; the pinner only knows the
//! message shapes. Requests go out over a channel handed to the pinner at
//! construction; replies come back through the pinner's own inbox (see
//! [`crate::pinner::PinMsg::Resolver`]). Every reply quotes the originating
//! request, which is what the pinner correlates on.

use serde::{Deserialize, Serialize};

use crate::domain::{Digest, ImageRef};

/// A digest lookup forwarded to the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub reference: ImageRef,
}

impl ResolveRequest {
    pub fn new(reference: ImageRef) -> Self {
        Self { reference }
    }
}

/// A resolver's answer to a [`ResolveRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResolveReply {
    /// The reference resolved to a digest
    Success { request: ResolveRequest, digest: Digest },

    /// The resolver could not resolve the reference
    Failure { request: ResolveRequest, reason: String },

    /// The resolver is overloaded and refused the request; the pinner
    /// re-sends after a backoff delay
    BackPressure { request: ResolveRequest },
}

impl ResolveReply {
    /// The reference the reply is about
    pub fn reference(&self) -> &ImageRef {
        match self {
            Self::Success { request, .. } | Self::Failure { request, .. } | Self::BackPressure { request } => {
                &request.reference
            }
        }
    }
}
