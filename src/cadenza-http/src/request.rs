use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;

use crate::error::HttpError;

/// An outbound call description, independent of any particular transport.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    endpoint: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            endpoint: None,
        }
    }

    pub fn get(url: &str) -> Result<Self, HttpError> {
        Ok(Self::new(Method::GET, parse_url(url)?))
    }

    pub fn post(url: &str) -> Result<Self, HttpError> {
        Ok(Self::new(Method::POST, parse_url(url)?))
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            HttpError::InvalidRequest {
                message: format!("invalid header name {name:?}"),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| HttpError::InvalidRequest {
            message: format!("invalid value for header {name}"),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Names the logical endpoint ("search", "album-details") used to scope cache policy.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn endpoint_name(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Gate/cooldown key: lowercase host plus effective port.
    pub fn host_key(&self) -> Option<String> {
        host_key(&self.url)
    }

    /// Whether the response may be served from or stored in the cache.
    pub fn is_cacheable_method(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }
}

pub(crate) fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

fn parse_url(raw: &str) -> Result<Url, HttpError> {
    let url = Url::parse(raw).map_err(|error| HttpError::InvalidRequest {
        message: format!("invalid url: {error}"),
    })?;
    if url.host_str().is_none() {
        return Err(HttpError::InvalidRequest {
            message: "url has no host".to_string(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_includes_default_port() {
        let request = HttpRequest::get("https://API.Example.com/v1/search").expect("request");
        assert_eq!(request.host_key().as_deref(), Some("api.example.com:443"));
    }

    #[test]
    fn host_key_keeps_explicit_port() {
        let request = HttpRequest::get("http://127.0.0.1:8080/x").expect("request");
        assert_eq!(request.host_key().as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn rejects_urls_without_host() {
        assert!(matches!(
            HttpRequest::get("mailto:someone@example.com"),
            Err(HttpError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn rejects_invalid_header_values() {
        let request = HttpRequest::get("https://api.example.com/").expect("request");
        assert!(request.header("accept", "bad\nvalue").is_err());
    }

    #[test]
    fn only_safe_methods_are_cacheable() {
        assert!(HttpRequest::get("https://a.example/")
            .expect("get")
            .is_cacheable_method());
        assert!(!HttpRequest::post("https://a.example/")
            .expect("post")
            .is_cacheable_method());
    }
}
