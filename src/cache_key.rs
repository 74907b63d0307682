//! Cache keys derived from the `date` query parameter of a target URL.

use crate::PreviewError;
use std::fmt;
use url::Url;

/// Query parameter whose value identifies an artifact.
pub const CACHE_KEY_PARAM: &str = "date";

/// Identifier of one artifact slot.
///
/// The value is used verbatim as the file stem of `{key}.png`, so two
/// spellings of the same calendar date are two different keys. The only
/// values refused are those that cannot be a plain file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(value: impl Into<String>) -> Result<Self, PreviewError> {
        let value = value.into();
        if is_safe_file_stem(&value) {
            Ok(Self(value))
        } else {
            Err(PreviewError::InvalidCacheKey(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.png", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extract the raw `date` value from an absolute URL.
///
/// Returns `Ok(None)` when the URL has no `date` parameter and
/// [`PreviewError::MalformedUrl`] when it does not parse. Only the first
/// `date` value counts, and it is returned verbatim; turning it into a
/// [`CacheKey`] is a separate step.
///
/// ```rust
/// use og_preview::{extract_cache_key, CacheKey};
///
/// let date = extract_cache_key("https://example.com/?date=2024-05-01").unwrap();
/// assert_eq!(date.as_deref(), Some("2024-05-01"));
/// assert!(CacheKey::new(date.unwrap()).is_ok());
/// assert!(extract_cache_key("https://example.com/").unwrap().is_none());
/// ```
pub fn extract_cache_key(url: &str) -> Result<Option<String>, PreviewError> {
    let parsed = Url::parse(url).map_err(|e| PreviewError::MalformedUrl(format!("{url}: {e}")))?;

    Ok(parsed
        .query_pairs()
        .find(|(name, _)| *name == CACHE_KEY_PARAM)
        .map(|(_, value)| value.into_owned()))
}

fn is_safe_file_stem(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.starts_with('.')
        && !value
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_control())
}
