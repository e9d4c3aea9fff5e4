//! Replica identity used for key affinity.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

/// Fixed identity, from configuration or tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

const CHECKIP_URL: &str = "http://checkip.dyndns.org/";
const PLAIN_IP_URLS: [&str; 3] = [
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://ifconfig.io/ip",
];

/// Public address of this host, looked up once and cached.
///
/// The HTML echo service is asked first; the plain-text services are tried in
/// order if it fails.
#[derive(Debug)]
pub struct PublicIpIdentity {
    client: reqwest::Client,
    html_service: String,
    plain_services: Vec<String>,
    resolved: OnceCell<String>,
}

impl PublicIpIdentity {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            html_service: CHECKIP_URL.to_string(),
            plain_services: PLAIN_IP_URLS.iter().map(|s| (*s).to_string()).collect(),
            resolved: OnceCell::new(),
        })
    }

    pub fn with_services(mut self, html_service: impl Into<String>, plain: Vec<String>) -> Self {
        self.html_service = html_service.into();
        self.plain_services = plain;
        self
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        match ClientError::from_status(status, &body) {
            Some(err) => Err(err),
            None => Ok(body),
        }
    }

    async fn lookup(&self) -> Result<String> {
        match self.fetch(&self.html_service).await {
            Ok(body) => {
                if let Some(ip) = parse_checkip(&body) {
                    return Ok(ip);
                }
                warn!(target: "keyward::identity", service = %self.html_service, "Unparseable address page");
            },
            Err(e) => {
                debug!(target: "keyward::identity", service = %self.html_service, error = %e, "Address lookup failed");
            },
        }

        for service in &self.plain_services {
            match self.fetch(service).await {
                Ok(body) => {
                    if let Some(ip) = parse_plain(&body) {
                        return Ok(ip);
                    }
                },
                Err(e) => {
                    debug!(target: "keyward::identity", service = %service, error = %e, "Address lookup failed");
                },
            }
        }

        Err(ClientError::Transport(
            "no address service answered with an address".to_string(),
        ))
    }
}

#[async_trait]
impl IdentityResolver for PublicIpIdentity {
    async fn resolve(&self) -> Result<String> {
        self.resolved
            .get_or_try_init(|| self.lookup())
            .await
            .cloned()
    }
}

/// Extract the address from `<body>Current IP Address: 1.2.3.4</body>`.
pub fn parse_checkip(body: &str) -> Option<String> {
    let after_colon = body.split(':').nth(1)?;
    let candidate = after_colon.split('<').next()?.trim();
    parse_plain(candidate)
}

pub fn parse_plain(body: &str) -> Option<String> {
    body.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checkip_page() {
        let page = "<html><head><title>Current IP Check</title></head>\
                    <body>Current IP Address: 203.0.113.7</body></html>\r\n";
        assert_eq!(parse_checkip(page).as_deref(), Some("203.0.113.7"));
        assert_eq!(parse_checkip("no address here"), None);
        assert_eq!(parse_checkip("Address: not-an-ip</body>"), None);
    }

    #[test]
    fn test_parse_plain() {
        assert_eq!(parse_plain("198.51.100.4\n").as_deref(), Some("198.51.100.4"));
        assert_eq!(parse_plain(" 2001:db8::1 ").as_deref(), Some("2001:db8::1"));
        assert_eq!(parse_plain("<html>"), None);
    }

    #[tokio::test]
    async fn test_static_identity() {
        let identity = StaticIdentity::new("replica-a");
        assert_eq!(identity.resolve().await.unwrap(), "replica-a");
    }

    #[tokio::test]
    async fn test_unreachable_services_fail() {
        let identity = PublicIpIdentity::new(Duration::from_millis(200))
            .unwrap()
            .with_services("http://127.0.0.1:9/", vec!["http://127.0.0.1:9/ip".into()]);
        assert!(identity.resolve().await.is_err());
    }
}
