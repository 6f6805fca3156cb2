//! HTTP driver
//!
//! Sessions backed by a `reqwest` client. Each identity gets its own client so
//! proxy settings, cookies and connection pools never leak between identities.

use super::{DriverProvider, Session};
use crate::config::SessionConfig;
use crate::identity::Identity;
use crate::{FetchError, FetchResult};
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use std::time::Duration;

/// Builds a client for one identity
///
/// The identity's proxy (with credentials, if any) applies to every scheme.
pub fn build_http_client(
    identity: &Identity,
    user_agent: &str,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .cookie_store(true)
        .gzip(true)
        .brotli(true);

    if let Some(proxy_url) = &identity.proxy {
        let mut proxy = Proxy::all(proxy_url)?;
        if let (Some(user), Some(pass)) = (&identity.username, &identity.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        builder = builder.proxy(proxy);
    }

    builder.build()
}

/// Opens [`HttpSession`]s
#[derive(Debug, Clone)]
pub struct HttpDriver {
    user_agent: String,
    timeout: Duration,
}

impl HttpDriver {
    pub fn new(config: &SessionConfig, timeout: Duration) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl DriverProvider for HttpDriver {
    async fn new_session(&self, identity: &Identity) -> FetchResult<Box<dyn Session>> {
        let client = build_http_client(identity, &self.user_agent, self.timeout)
            .map_err(|e| FetchError::FatalSession(format!("client setup failed: {}", e)))?;
        tracing::debug!("Opened HTTP session for identity {}", identity);
        Ok(Box::new(HttpSession {
            client: Some(client),
        }))
    }
}

/// A session that fetches pages with plain GET requests
pub struct HttpSession {
    client: Option<Client>,
}

impl HttpSession {
    fn client(&self) -> FetchResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| FetchError::FatalSession("session closed".to_string()))
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn probe(&mut self) -> FetchResult<()> {
        self.client().map(|_| ())
    }

    async fn navigate(&mut self, url: &str) -> FetchResult<String> {
        let response = self.client()?.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }

    async fn close(&mut self) {
        self.client = None;
    }
}
