//! tagpin - per-workflow container-image digest pinning
//!
//! Workflows refer to container images by mutable tags (`ubuntu:latest`).
//! To stay reproducible, every tag is resolved to an immutable content
//! digest exactly once per workflow, persisted before anyone sees it, and
//! served from memory afterwards. On workflow restart the persisted
//! resolutions are replayed so running tasks observe identical digests.
//!
//! # Core Concepts
//!
//! - **One resolution per tag**: concurrent lookups for the same reference
//!   share a single resolver request and its outcome
//! - **Persist then publish**: a digest is durable before any client sees it
//! - **Transient failures don't poison**: a failed tag is evicted and can
//!   simply be looked up again
//! - **Restart is all-or-nothing**: a cache that doesn't replay cleanly
//!   fails the workflow instead of silently re-resolving
//!
//! # Modules
//!
//! - [`domain`] - image references and digest records
//! - [`pinner`] - the per-workflow coordinator actor
//! - [`resolver`] - wire contract with the external digest resolver
//! - [`store`] - durable pin storage
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod pinner;
pub mod resolver;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use domain::{Digest, ImageRef, ParseError};
pub use pinner::{LookupError, LookupResult, PinMsg, Pinner, PinnerConfig, PinnerHandle, PinnerMetrics};
pub use resolver::{ResolveReply, ResolveRequest};
pub use store::{DigestStore, JsonlDigestStore, PinnedRow, StoreError};
