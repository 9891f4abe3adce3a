//! Content digest records

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ParseError;

/// An immutable content digest, e.g. `sha256:a1b2…`
///
/// Opaque to the pinner apart from its canonical `"<algorithm>:<value>"`
/// form, which is what gets persisted. Resolvers may attach side
/// information (platform, media type, …) that the pinner carries along but
/// never inspects; it is not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: String,
    pub value: String,

    /// Resolver-supplied side information, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Digest {
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            value: value.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The persisted string form
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.algorithm, self.value)
    }

    /// Parse the canonical form back into a digest
    ///
    /// Splits on the first `:`; both sides must be non-empty. Side
    /// information does not survive the round trip.
    pub fn parse_canonical(s: &str) -> Result<Self, ParseError> {
        match s.split_once(':') {
            Some((algorithm, value)) if !algorithm.is_empty() && !value.is_empty() => {
                Ok(Self::new(algorithm, value))
            }
            _ => Err(ParseError::Digest(s.to_string())),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
