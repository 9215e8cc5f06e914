use async_trait::async_trait;
use http::HeaderValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential refresh rejected: {0}")]
    Rejected(String),
    #[error("credential refresh unavailable: {0}")]
    Unavailable(String),
}

/// Obtains a fresh `Authorization` value after the origin answered 401.
///
/// The executor calls this at most once per logical call and then makes one
/// extra attempt with the returned value.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, host: &str) -> Result<HeaderValue, CredentialError>;
}

/// Refresher that hands out a fixed bearer token; handy for static API keys.
#[derive(Clone, Debug)]
pub struct StaticBearer {
    value: HeaderValue,
}

impl StaticBearer {
    pub fn new(token: &str) -> Result<Self, CredentialError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| CredentialError::Rejected("token is not a valid header value".into()))?;
        value.set_sensitive(true);
        Ok(Self { value })
    }
}

#[async_trait]
impl CredentialRefresher for StaticBearer {
    async fn refresh(&self, _host: &str) -> Result<HeaderValue, CredentialError> {
        Ok(self.value.clone())
    }
}
