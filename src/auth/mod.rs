use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::ProxyError;

/// A bearer token for the control-plane API.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Unknown for tokens minted out-of-band (service keys, static tokens).
    pub expires_at: Option<SystemTime>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(t) => SystemTime::now() >= t,
            None => false,
        }
    }
}

/// Credential seam. The proxy never handles raw credentials itself; it asks
/// this source for tokens and attaches them to control-plane requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current token, possibly cached.
    async fn token(&self) -> Result<AccessToken, ProxyError>;

    /// Force a refresh so the returned token's expiry is as distant as the
    /// issuer allows. Used when binding certificates to the token identity.
    async fn refresh(&self) -> Result<AccessToken, ProxyError>;
}

/// Token source backed by a fixed token from a flag or the environment.
/// Suitable for development and tests; production deployments wire in an
/// ambient credential source instead.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<AccessToken, ProxyError> {
        if self.token.is_empty() {
            return Err(ProxyError::auth("no credentials configured"));
        }
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }

    async fn refresh(&self) -> Result<AccessToken, ProxyError> {
        // A static token cannot be refreshed; hand back what we have.
        self.token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn static_source_returns_token_without_expiry() {
        let src = StaticTokenSource::new("tok");
        let t = src.token().await.unwrap();
        assert_eq!(t.token, "tok");
        assert!(t.expires_at.is_none());
        assert!(!t.is_expired());
    }

    #[tokio::test]
    async fn static_source_rejects_empty_token() {
        let src = StaticTokenSource::new("");
        assert!(src.token().await.is_err());
    }

    #[test]
    fn expiry_in_the_past_is_expired() {
        let t = AccessToken {
            token: "tok".into(),
            expires_at: Some(SystemTime::now() - Duration::from_secs(1)),
        };
        assert!(t.is_expired());
    }
}
