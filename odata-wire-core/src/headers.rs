//! Ordered header storage for batch operations.
//!
//! Operation headers keep their insertion order (they are written back to the
//! wire in that order) and are looked up case-sensitively first. Only when no
//! exact match exists does a single case-insensitive scan run over the stored
//! names; if that scan finds more than one candidate the lookup fails instead
//! of picking one.
//!
//! Most operations carry a handful of headers, so storage is a `SmallVec`
//! scanned linearly rather than a hash map.

use crate::error::{BatchError, Result};
use smallvec::SmallVec;
use std::fmt;

/// Number of headers stored inline before spilling to the heap.
pub const INLINE_HEADERS: usize = 8;

/// `Content-Type` header name.
pub const CONTENT_TYPE: &str = "Content-Type";
/// `Content-Length` header name.
pub const CONTENT_LENGTH: &str = "Content-Length";
/// `Content-ID` header name.
pub const CONTENT_ID: &str = "Content-ID";
/// `Content-Transfer-Encoding` header name.
pub const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
/// `Host` header name.
pub const HOST: &str = "Host";

#[derive(Clone, PartialEq, Eq)]
struct Header {
    name: String,
    value: String,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Ordered header dictionary of a single batch operation.
///
/// # Example
///
/// ```
/// use odata_wire_core::OperationHeaders;
///
/// let mut headers = OperationHeaders::new();
/// headers.add("Content-Type", "application/json").unwrap();
///
/// assert_eq!(headers.get("content-type").unwrap(), Some("application/json"));
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OperationHeaders {
    inner: SmallVec<[Header; INLINE_HEADERS]>,
}

impl OperationHeaders {
    /// Create an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored headers.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn exact_index(&self, name: &str) -> Option<usize> {
        self.inner.iter().position(|h| h.name == name)
    }

    /// Case-insensitive fallback; more than one hit is a corrupt state.
    fn fallback_index(&self, name: &str) -> Result<Option<usize>> {
        let mut found = None;
        for (index, header) in self.inner.iter().enumerate() {
            if header.name.eq_ignore_ascii_case(name) {
                if found.is_some() {
                    return Err(BatchError::AmbiguousHeader(name.to_string()));
                }
                found = Some(index);
            }
        }
        Ok(found)
    }

    fn find(&self, name: &str) -> Result<Option<usize>> {
        match self.exact_index(name) {
            Some(index) => Ok(Some(index)),
            None => self.fallback_index(name),
        }
    }

    /// Look up a header value.
    ///
    /// An exact (case-sensitive) match always wins, even when differently
    /// cased duplicates exist.
    pub fn get(&self, name: &str) -> Result<Option<&str>> {
        Ok(self.find(name)?.map(|index| self.inner[index].value.as_str()))
    }

    /// Look up a header value, treating ambiguity as absence.
    pub fn try_get(&self, name: &str) -> Option<&str> {
        self.get(name).ok().flatten()
    }

    /// Check if a header resolves for `name`.
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.find(name)?.is_some())
    }

    /// Add a new header. Fails if the exact same name is already present.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.exact_index(&name).is_some() {
            return Err(BatchError::DuplicateHeader(name));
        }
        self.inner.push(Header {
            name,
            value: value.into(),
        });
        Ok(())
    }

    /// Set a header, replacing the value stored under the exact same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.exact_index(&name) {
            Some(index) => self.inner[index].value = value,
            None => self.inner.push(Header { name, value }),
        }
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.find(name)?.map(|index| self.inner.remove(index).value))
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_str()))
    }

    /// The `Content-Type` header, if present.
    pub fn content_type(&self) -> Result<Option<&str>> {
        self.get(CONTENT_TYPE)
    }

    /// The `Content-ID` header, if present.
    pub fn content_id(&self) -> Result<Option<&str>> {
        self.get(CONTENT_ID)
    }

    /// The parsed `Content-Length` header.
    ///
    /// Negative or non-numeric values are an error rather than "absent".
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.get(CONTENT_LENGTH)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| BatchError::InvalidContentLength(raw.to_string())),
        }
    }
}

impl fmt::Debug for OperationHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a OperationHeaders {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
