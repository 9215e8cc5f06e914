//! Request identity used for single-flight grouping and cache lookup.

use http::header::HeaderName;
use url::Url;

use crate::request::HttpRequest;

/// Stable, in-memory-only identity of a logical request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Which request headers participate in the key. Empty by default so that
/// volatile auth headers never split otherwise identical requests.
#[derive(Clone, Debug, Default)]
pub struct KeyPolicy {
    headers: Vec<HeaderName>,
}

impl KeyPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName) -> Self {
        if !self.headers.contains(&name) {
            self.headers.push(name);
            self.headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        }
        self
    }

    /// Builds a policy from configured names; names that are not valid headers are skipped.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| HeaderName::from_bytes(name.as_ref().as_bytes()).ok())
            .fold(Self::default(), Self::with_header)
    }

    pub fn headers(&self) -> &[HeaderName] {
        &self.headers
    }
}

/// Derive the canonical key: method, normalized URL with sorted query, the
/// policy-selected header values, and a digest of the body when one is present.
pub fn canonicalize(request: &HttpRequest, policy: &KeyPolicy) -> CanonicalKey {
    let mut key = String::with_capacity(128);
    key.push_str(request.method().as_str());
    key.push(' ');
    key.push_str(&normalize_url(request.url()));

    for (name, value) in selected_headers(request, policy) {
        key.push('|');
        key.push_str(&name);
        key.push('=');
        key.push_str(&value);
    }

    if let Some(body) = request.body_bytes() {
        key.push_str("|body=");
        key.push_str(blake3::hash(body).to_hex().as_str());
    }

    CanonicalKey(key)
}

/// The policy-selected headers as `(name, values)`, values sorted and comma-joined.
/// Absent headers yield an empty value.
pub fn selected_headers(request: &HttpRequest, policy: &KeyPolicy) -> Vec<(String, String)> {
    policy
        .headers()
        .iter()
        .map(|name| {
            let mut values: Vec<String> = request
                .headers()
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect();
            values.sort_unstable();
            (name.as_str().to_string(), values.join(","))
        })
        .collect()
}

/// Query pairs sorted by name, then by value.
pub fn sorted_query_pairs(url: &Url) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();
    pairs
}

fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let pairs = sorted_query_pairs(url);
    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        normalized.query_pairs_mut().clear().extend_pairs(pairs);
    }
    normalized.to_string()
}
