//! HTTP transport factory.
//!
//! The single place outbound clients are constructed, so proxy and TLS
//! concerns stay local. TLS verification is always on, trusting the OS
//! certificate store (the `rustls-tls-native-roots` backend). Clients are
//! cached per proxy URL and reused for connection pooling.

use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use tracing::instrument;

use super::error::FetchError;

/// TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-chunk idle read timeout. There is intentionally no overall response
/// timeout; transfers are long-lived.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Redirect bound; exceeding it fails the request.
const MAX_REDIRECTS: usize = 10;

/// Default User-Agent unless a header rule overrides it.
#[must_use]
pub fn default_user_agent() -> String {
    format!("z-dmr/{}", env!("CARGO_PKG_VERSION"))
}

/// Factory and cache for configured HTTP clients.
#[derive(Debug, Clone)]
pub struct Transport {
    direct: Client,
    proxied: Arc<DashMap<String, Client>>,
}

impl Transport {
    /// Builds the factory and its direct (proxy-less) client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidProxy`] if the static client
    /// configuration is rejected, which does not happen in practice.
    pub fn new() -> Result<Self, FetchError> {
        Ok(Self {
            direct: build_client(None)?,
            proxied: Arc::new(DashMap::new()),
        })
    }

    /// Returns a client routed through `proxy_url`, or the direct client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidProxy`] when the proxy URL is rejected.
    #[instrument(skip(self))]
    pub fn client_for(&self, proxy_url: Option<&str>) -> Result<Client, FetchError> {
        let Some(proxy) = proxy_url else {
            return Ok(self.direct.clone());
        };
        if let Some(cached) = self.proxied.get(proxy) {
            return Ok(cached.clone());
        }
        let client = build_client(Some(proxy))?;
        self.proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

fn build_client(proxy_url: Option<&str>) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .user_agent(default_user_agent())
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT);

    if let Some(proxy) = proxy_url {
        let parsed = reqwest::Proxy::all(proxy).map_err(|_| FetchError::InvalidProxy {
            url: proxy.to_string(),
        })?;
        builder = builder.proxy(parsed);
    }

    builder.build().map_err(|_| FetchError::InvalidProxy {
        url: proxy_url.unwrap_or("<direct>").to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_carries_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("z-dmr/"));
        assert!(ua.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_direct_client_is_shared() {
        let transport = Transport::new().unwrap();
        let a = transport.client_for(None).unwrap();
        let b = transport.client_for(None).unwrap();
        // Clones of the same reqwest client share a pool; just verify both build.
        drop((a, b));
    }

    #[test]
    fn test_proxy_client_cached_per_url() {
        let transport = Transport::new().unwrap();
        transport
            .client_for(Some("http://proxy.local:3128"))
            .unwrap();
        transport
            .client_for(Some("http://proxy.local:3128"))
            .unwrap();
        assert_eq!(transport.proxied.len(), 1);

        transport
            .client_for(Some("http://other.local:3128"))
            .unwrap();
        assert_eq!(transport.proxied.len(), 2);
    }

    #[test]
    fn test_invalid_proxy_url_rejected() {
        let transport = Transport::new().unwrap();
        let result = transport.client_for(Some("::not a proxy::"));
        assert!(matches!(result, Err(FetchError::InvalidProxy { .. })));
    }
}
