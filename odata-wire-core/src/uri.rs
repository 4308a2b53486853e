//! Operation URL resolution and Content-ID reference scoping.

use crate::error::{BatchError, Result};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Custom conversion of URLs found in (or written to) a batch payload.
///
/// A converter that returns `Some` wins unconditionally; no further
/// validation is applied to its result.
pub trait PayloadUriConverter: Send + Sync {
    /// Convert `payload_uri`, or return `None` to fall back to default resolution.
    fn convert_payload_uri(&self, base_uri: Option<&Url>, payload_uri: &str) -> Option<Url>;
}

impl<F> PayloadUriConverter for F
where
    F: Fn(Option<&Url>, &str) -> Option<Url> + Send + Sync,
{
    fn convert_payload_uri(&self, base_uri: Option<&Url>, payload_uri: &str) -> Option<Url> {
        self(base_uri, payload_uri)
    }
}

/// Shared handle to a custom converter.
#[derive(Clone)]
pub struct SharedUriConverter(pub Arc<dyn PayloadUriConverter>);

impl fmt::Debug for SharedUriConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedUriConverter(..)")
    }
}

/// How request URLs are rendered on a request line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadUriOption {
    /// `GET http://host/service/Customers HTTP/1.1`
    #[default]
    AbsoluteUri,
    /// `GET /service/Customers HTTP/1.1` plus a `Host` header.
    AbsoluteResourcePathAndHost,
    /// `GET Customers HTTP/1.1`, relative to the base URI.
    RelativeToBaseUri,
}

/// Resolve an operation's request URL.
///
/// 1. A converter returning `Some` is used as-is.
/// 2. Absolute URLs are returned unchanged.
/// 3. Relative URLs are joined with `base_uri`; without one this fails, with
///    a distinct error for `$`-prefixed URLs.
pub fn create_operation_request_uri(
    uri: &str,
    base_uri: Option<&Url>,
    converter: Option<&dyn PayloadUriConverter>,
) -> Result<Url> {
    if let Some(converted) = converter.and_then(|c| c.convert_payload_uri(base_uri, uri)) {
        return Ok(converted);
    }

    match Url::parse(uri) {
        Ok(url) => return Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {}
        Err(err) => return Err(err.into()),
    }

    match base_uri {
        Some(base) => Ok(base.join(uri)?),
        None if uri.starts_with('$') => {
            Err(BatchError::ContentIdReferenceWithoutBase(uri.to_string()))
        }
        None => Err(BatchError::RelativeUriWithoutBase(uri.to_string())),
    }
}

/// Append a trailing slash to the path so relative joins keep the last segment.
pub fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Split `$<id><rest>` into the Content-ID and the remainder.
fn split_reference(reference: &str) -> Option<(&str, &str)> {
    let body = reference.strip_prefix('$')?;
    let end = body.find(['/', '?', '#']).unwrap_or(body.len());
    if end == 0 {
        return None;
    }
    Some((&body[..end], &body[end..]))
}

/// Content-IDs seen in the current changeset, mapped to their operation URL.
#[derive(Debug, Clone, Default)]
pub struct ContentIdScope {
    entries: Vec<(String, Url)>,
}

impl ContentIdScope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered Content-IDs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no Content-ID is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if `content_id` is registered.
    pub fn contains(&self, content_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == content_id)
    }

    /// Register a Content-ID. Fails if it is already in scope.
    pub fn add(&mut self, content_id: &str, url: Url) -> Result<()> {
        if self.contains(content_id) {
            return Err(BatchError::DuplicateContentId(content_id.to_string()));
        }
        self.entries.push((content_id.to_string(), url));
        Ok(())
    }

    /// Forget every Content-ID (a changeset ended).
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// URL registered for `content_id`.
    pub fn url_of(&self, content_id: &str) -> Option<&Url> {
        self.entries
            .iter()
            .find(|(id, _)| id == content_id)
            .map(|(_, url)| url)
    }

    /// Check if `reference` is a `$<id>` reference to a registered Content-ID.
    pub fn is_reference(&self, reference: &str) -> bool {
        split_reference(reference).is_some_and(|(id, _)| self.contains(id))
    }

    /// Resolve `$<id>` or `$<id>/segment` against the registered URLs.
    pub fn resolve(&self, reference: &str) -> Option<Url> {
        let (id, rest) = split_reference(reference)?;
        let target = self.url_of(id)?;
        if rest.is_empty() {
            return Some(target.clone());
        }
        let joined = format!("{}{}", target.as_str().trim_end_matches('/'), rest);
        Url::parse(&joined).ok()
    }
}

/// Converter used by readers and writers: the user's converter first, then
/// the Content-ID scope of the open changeset.
pub(crate) struct ScopedUriConverter<'a> {
    pub(crate) custom: Option<&'a dyn PayloadUriConverter>,
    pub(crate) scope: &'a ContentIdScope,
}

impl PayloadUriConverter for ScopedUriConverter<'_> {
    fn convert_payload_uri(&self, base_uri: Option<&Url>, payload_uri: &str) -> Option<Url> {
        self.custom
            .and_then(|c| c.convert_payload_uri(base_uri, payload_uri))
            .or_else(|| self.scope.resolve(payload_uri))
    }
}

/// Request-line target (and optional `Host` header) for a resolved URL.
pub(crate) fn request_target(
    raw: &str,
    resolved: &Url,
    base_uri: Option<&Url>,
    option: PayloadUriOption,
    scope: &ContentIdScope,
) -> (String, Option<String>) {
    if scope.is_reference(raw) {
        return (raw.to_string(), None);
    }
    match option {
        PayloadUriOption::AbsoluteUri => (resolved.to_string(), None),
        PayloadUriOption::AbsoluteResourcePathAndHost => {
            let mut target = resolved.path().to_string();
            if let Some(query) = resolved.query() {
                target.push('?');
                target.push_str(query);
            }
            let host = resolved.host_str().map(|host| match resolved.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            });
            (target, host)
        }
        PayloadUriOption::RelativeToBaseUri => {
            let relative = base_uri.and_then(|base| resolved.as_str().strip_prefix(base.as_str()));
            match relative {
                Some(relative) => (relative.to_string(), None),
                None => (resolved.to_string(), None),
            }
        }
    }
}

/// Rebuild an absolute URL from a path-only request target and a `Host` header.
pub(crate) fn url_from_host(target: &str, host: &str, base_uri: Option<&Url>) -> Result<Url> {
    let scheme = base_uri.map(Url::scheme).unwrap_or("http");
    Ok(Url::parse(&format!("{scheme}://{host}{target}"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://host/service/").unwrap()
    }

    #[test]
    fn test_absolute_uri_is_returned_unchanged() {
        let url = create_operation_request_uri("http://other/Customers", Some(&base()), None).unwrap();
        assert_eq!(url.as_str(), "http://other/Customers");
    }

    #[test]
    fn test_relative_uri_joined_with_base() {
        let url = create_operation_request_uri("Customers(1)", Some(&base()), None).unwrap();
        assert_eq!(url.as_str(), "http://host/service/Customers(1)");
    }

    #[test]
    fn test_missing_base_errors_differ_for_dollar_uris() {
        assert!(matches!(
            create_operation_request_uri("Customers", None, None),
            Err(BatchError::RelativeUriWithoutBase(_))
        ));
        assert!(matches!(
            create_operation_request_uri("$1/Orders", None, None),
            Err(BatchError::ContentIdReferenceWithoutBase(_))
        ));
    }

    #[test]
    fn test_converter_wins_unconditionally() {
        let converter = |_: Option<&Url>, uri: &str| {
            (uri == "magic").then(|| Url::parse("urn:converted").unwrap())
        };
        let url = create_operation_request_uri("magic", None, Some(&converter)).unwrap();
        assert_eq!(url.as_str(), "urn:converted");

        assert!(create_operation_request_uri("plain", None, Some(&converter)).is_err());
    }

    #[test]
    fn test_scope_resolves_references() {
        let mut scope = ContentIdScope::new();
        scope
            .add("1", Url::parse("http://host/service/Customers(1)").unwrap())
            .unwrap();

        assert_eq!(
            scope.resolve("$1").unwrap().as_str(),
            "http://host/service/Customers(1)"
        );
        assert_eq!(
            scope.resolve("$1/Orders").unwrap().as_str(),
            "http://host/service/Customers(1)/Orders"
        );
        assert!(scope.resolve("$2").is_none());
        assert!(scope.resolve("$").is_none());
        assert!(scope.is_reference("$1/Orders"));
        assert!(!scope.is_reference("Customers"));
    }

    #[test]
    fn test_scope_rejects_duplicates_until_reset() {
        let mut scope = ContentIdScope::new();
        let url = Url::parse("http://host/a").unwrap();
        scope.add("1", url.clone()).unwrap();
        assert!(matches!(
            scope.add("1", url.clone()),
            Err(BatchError::DuplicateContentId(_))
        ));
        scope.reset();
        scope.add("1", url).unwrap();
    }

    #[test]
    fn test_request_target_options() {
        let scope = ContentIdScope::new();
        let resolved = Url::parse("http://host:8080/service/Customers?$top=1").unwrap();
        let base = Url::parse("http://host:8080/service/").unwrap();

        let (target, host) = request_target(
            "Customers",
            &resolved,
            Some(&base),
            PayloadUriOption::AbsoluteUri,
            &scope,
        );
        assert_eq!(target, "http://host:8080/service/Customers?$top=1");
        assert!(host.is_none());

        let (target, host) = request_target(
            "Customers",
            &resolved,
            Some(&base),
            PayloadUriOption::AbsoluteResourcePathAndHost,
            &scope,
        );
        assert_eq!(target, "/service/Customers?$top=1");
        assert_eq!(host.as_deref(), Some("host:8080"));

        let (target, _) = request_target(
            "Customers",
            &resolved,
            Some(&base),
            PayloadUriOption::RelativeToBaseUri,
            &scope,
        );
        assert_eq!(target, "Customers?$top=1");
    }

    #[test]
    fn test_url_from_host() {
        let url = url_from_host("/service/Customers", "host:81", None).unwrap();
        assert_eq!(url.as_str(), "http://host:81/service/Customers");
    }

    #[test]
    fn test_ensure_trailing_slash() {
        let url = ensure_trailing_slash(Url::parse("http://host/service").unwrap());
        assert_eq!(url.as_str(), "http://host/service/");
    }
}
