//! Image reference parsing and canonical form

use std::fmt;
use std::str::FromStr;

use super::ParseError;

/// A tagged image reference, e.g. `ubuntu:latest`
///
/// The repository may carry a registry host and port
/// (`localhost:5000/app:v2`), so the tag separator is the last `:` that
/// appears after the last `/`. A reference without a tag gets `latest`.
///
/// Canonical form is `"<repository>:<tag>"` and round-trips through
/// [`FromStr`]/[`fmt::Display`]; the store relies on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    repository: String,
    tag: String,
}

impl ImageRef {
    /// Build a reference from already-split parts
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl FromStr for ImageRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Reference(s.to_string()));
        }

        match s.rfind(':') {
            // A ':' inside the repository path (registry port) is not a tag
            // separator.
            Some(idx) if !s[idx + 1..].contains('/') => {
                let (repository, tag) = (&s[..idx], &s[idx + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return Err(ParseError::Reference(s.to_string()));
                }
                Ok(Self::new(repository, tag))
            }
            _ => Ok(Self::new(s, "latest")),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl serde::Serialize for ImageRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ImageRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
