//! The immutable request record.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::uri::Scheme;
use http::{Method, Uri};

use crate::body::Body;
use crate::error::{Error, Result};

type TagMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable HTTP request.
///
/// Created by a caller through [`Request::builder`], never mutated by the
/// engine; follow-ups and bridge rewrites derive new instances through
/// [`Request::to_builder`].
#[derive(Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Body>,
    tags: Arc<TagMap>,
}

impl Request {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Shorthand for a GET request to `uri`.
    pub fn get<U>(uri: U) -> Result<Request>
    where
        Uri: TryFrom<U>,
    {
        Builder::new().uri(uri).build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub(crate) fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Looks up the tag attached under the type `T`.
    pub fn tag<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.tags
            .get(&TypeId::of::<T>())
            .and_then(|tag| tag.downcast_ref())
    }

    /// Derives a builder seeded with this request's fields.
    ///
    /// The tag map is shared, not copied; tags added to the derived request
    /// are not observable on this one.
    pub fn to_builder(&self) -> Builder {
        Builder {
            method: self.method.clone(),
            uri: Ok(self.uri.clone()),
            headers: Ok(self.headers.clone()),
            body: self.body.clone(),
            tags: Some(self.tags.clone()),
            new_tags: HashMap::new(),
        }
    }

    pub(crate) fn host(&self) -> &str {
        self.uri.host().unwrap_or("")
    }

    pub(crate) fn is_https(&self) -> bool {
        self.uri.scheme() == Some(&Scheme::HTTPS)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Builds a [`Request`].
pub struct Builder {
    method: Method,
    uri: crate::Result<Uri>,
    headers: crate::Result<HeaderMap>,
    body: Option<Body>,
    tags: Option<Arc<TagMap>>,
    new_tags: TagMap,
}

impl Builder {
    fn new() -> Builder {
        Builder {
            method: Method::GET,
            uri: Err(Error::new_user_scheme()),
            headers: Ok(HeaderMap::new()),
            body: None,
            tags: None,
            new_tags: HashMap::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Builder {
        self.method = method;
        self
    }

    pub fn uri<U>(mut self, uri: U) -> Builder
    where
        Uri: TryFrom<U>,
    {
        self.uri = Uri::try_from(uri).map_err(|_| Error::new_user_scheme());
        self
    }

    /// Appends a header, preserving insertion order for repeated names.
    pub fn header<N, V>(mut self, name: N, value: V) -> Builder
    where
        HeaderName: TryFrom<N>,
        HeaderValue: TryFrom<V>,
    {
        if let Ok(ref mut headers) = self.headers {
            match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => self.headers = Err(Error::new_header()),
            }
        }
        self
    }

    /// Replaces every value previously set for `name`.
    pub fn set_header<N, V>(mut self, name: N, value: V) -> Builder
    where
        HeaderName: TryFrom<N>,
        HeaderValue: TryFrom<V>,
    {
        if let Ok(ref mut headers) = self.headers {
            match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => self.headers = Err(Error::new_header()),
            }
        }
        self
    }

    pub fn remove_header(mut self, name: &str) -> Builder {
        if let Ok(ref mut headers) = self.headers {
            headers.remove(name);
        }
        self
    }

    pub fn body(mut self, body: Body) -> Builder {
        self.body = Some(body);
        self
    }

    pub fn no_body(mut self) -> Builder {
        self.body = None;
        self
    }

    /// Attaches an opaque tag keyed by its type.
    pub fn tag<T: Any + Send + Sync>(mut self, tag: T) -> Builder {
        self.new_tags.insert(TypeId::of::<T>(), Arc::new(tag));
        self
    }

    pub fn build(self) -> Result<Request> {
        let uri = self.uri?;
        let headers = self.headers?;

        match uri.scheme_str() {
            Some("http") | Some("https") => (),
            _ => return Err(Error::new_user_scheme()),
        }
        if uri.host().is_none() {
            return Err(Error::new_user_scheme());
        }

        let tags = if self.new_tags.is_empty() {
            self.tags.unwrap_or_default()
        } else {
            // Copy-on-write: the derived map never aliases the original.
            let mut map: TagMap = self.tags.map(|t| (*t).clone()).unwrap_or_default();
            map.extend(self.new_tags);
            Arc::new(map)
        };

        Ok(Request {
            method: self.method,
            uri,
            headers,
            body: self.body,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme() {
        let err = Request::builder()
            .uri("ftp://example.com/")
            .build()
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::Kind::User(crate::error::User::UnsupportedScheme)
        ));
    }

    #[test]
    fn header_order_preserved() {
        let req = Request::builder()
            .uri("http://example.com/")
            .header("x-a", "1")
            .header("x-a", "2")
            .build()
            .unwrap();
        let values: Vec<_> = req
            .headers()
            .get_all("x-a")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, ["1", "2"]);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = Request::builder()
            .uri("http://example.com/")
            .header("X-Thing", "yes")
            .build()
            .unwrap();
        assert_eq!(req.header("x-thing").unwrap(), "yes");
    }

    #[test]
    fn derived_tags_do_not_alias() {
        #[derive(Debug, PartialEq)]
        struct Marker(u32);

        let original = Request::builder().uri("http://example.com/").build().unwrap();
        let derived = original.to_builder().tag(Marker(7)).build().unwrap();

        assert_eq!(derived.tag::<Marker>(), Some(&Marker(7)));
        assert_eq!(original.tag::<Marker>(), None);
    }
}
