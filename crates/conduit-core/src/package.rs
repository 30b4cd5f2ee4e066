//! Connector package references.
//!
//! A package arrives either as inline bytes or as a URL. Supported URL
//! schemes are `http://`, `file://` and `builtin://` (a connector shipped in
//! the builtin catalog).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme prefix for packages held in the package store.
pub const STORED_SCHEME: &str = "package://";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PackageUrl {
    /// Plain HTTP: http://artifacts.internal/kafka-source.nar
    Http { url: String },
    /// Local file: file:///opt/connectors/kafka-source.nar
    File { path: String },
    /// Builtin catalog entry: builtin://kafka
    Builtin { name: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
    #[error("unsupported package url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid package url: {0}")]
    InvalidUrl(String),
    #[error("either package data or a package url must be supplied")]
    Missing,
    #[error("package data and package url are mutually exclusive")]
    Ambiguous,
    #[error("package data is empty")]
    Empty,
}

impl PackageUrl {
    pub fn parse(url: &str) -> Result<Self, PackageError> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix("builtin://") {
            if rest.is_empty() || rest.contains('/') {
                return Err(PackageError::InvalidUrl(url.to_string()));
            }
            Ok(PackageUrl::Builtin {
                name: rest.to_string(),
            })
        } else if let Some(rest) = url.strip_prefix("file://") {
            if rest.is_empty() {
                return Err(PackageError::InvalidUrl(url.to_string()));
            }
            Ok(PackageUrl::File {
                path: rest.to_string(),
            })
        } else if let Some(rest) = url.strip_prefix("http://") {
            if rest.is_empty() || rest.starts_with('/') {
                return Err(PackageError::InvalidUrl(url.to_string()));
            }
            Ok(PackageUrl::Http {
                url: url.to_string(),
            })
        } else {
            Err(PackageError::UnsupportedScheme(url.to_string()))
        }
    }
}

/// Package supplied with a register or update request.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageInput {
    Inline(Vec<u8>),
    Url(PackageUrl),
}

impl PackageInput {
    /// Build from the two optional request fields; exactly one must be set.
    pub fn from_parts(data: Option<Vec<u8>>, url: Option<&str>) -> Result<Self, PackageError> {
        Self::optional_from_parts(data, url)?.ok_or(PackageError::Missing)
    }

    /// Like [`PackageInput::from_parts`] but supplying neither is allowed.
    pub fn optional_from_parts(
        data: Option<Vec<u8>>,
        url: Option<&str>,
    ) -> Result<Option<Self>, PackageError> {
        let url = url.map(str::trim).filter(|u| !u.is_empty());
        match (data, url) {
            (Some(_), Some(_)) => Err(PackageError::Ambiguous),
            (Some(bytes), None) if bytes.is_empty() => Err(PackageError::Empty),
            (Some(bytes), None) => Ok(Some(PackageInput::Inline(bytes))),
            (None, Some(url)) => Ok(Some(PackageInput::Url(PackageUrl::parse(url)?))),
            (None, None) => Ok(None),
        }
    }
}
