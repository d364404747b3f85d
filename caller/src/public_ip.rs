//! Public IP discovery for NAT traversal.
//!
//! The address only populates Via, Contact and SDP; when it is unknown the
//! engine advertises its local address instead, so every failure here
//! degrades to `None`.

use anyhow::{bail, Context, Result};
use hyper::{Client, Uri};
use sipbridge_common::CallSettings;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Plain-text "what is my IP" service.
pub const DEFAULT_LOOKUP_URL: &str = "http://api.ipify.org";

pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Where the public address comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicIpDiscovery {
    /// Configured address
    Static(IpAddr),

    /// HTTP GET returning the address as the whole body
    Http { url: String, timeout: Duration },

    Disabled,
}

impl PublicIpDiscovery {
    // ---
    pub fn from_settings(call: &CallSettings) -> Self {
        // ---
        match call.public_ip {
            Some(ip) => Self::Static(ip),
            None if call.discover_public_ip => Self::Http {
                url: DEFAULT_LOOKUP_URL.to_string(),
                timeout: LOOKUP_TIMEOUT,
            },
            None => Self::Disabled,
        }
    }

    /// Resolves the public address, or `None`.
    pub async fn discover(&self) -> Option<IpAddr> {
        // ---
        match self {
            Self::Static(ip) => Some(*ip),
            Self::Disabled => None,
            Self::Http { url, timeout } => match lookup(url, *timeout).await {
                Ok(ip) => {
                    info!("Public IP {} (from {})", ip, url);
                    Some(ip)
                }
                Err(e) => {
                    warn!("Public IP lookup failed, using local address: {:#}", e);
                    None
                }
            },
        }
    }
}

async fn lookup(url: &str, timeout: Duration) -> Result<IpAddr> {
    // ---
    let uri: Uri = url.parse().with_context(|| format!("invalid lookup URL {url}"))?;
    let client = Client::new();

    let fetch = async {
        let response = client.get(uri).await.context("request failed")?;
        if !response.status().is_success() {
            bail!("lookup returned {}", response.status());
        }
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .context("failed to read body")?;
        Ok::<_, anyhow::Error>(body)
    };

    let body = tokio::time::timeout(timeout, fetch)
        .await
        .context("lookup timed out")??;
    let text = std::str::from_utf8(&body).context("body is not UTF-8")?;
    text.trim()
        .parse()
        .with_context(|| format!("not an IP address: {:?}", text.trim()))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    /// Serves `body` with `status` for every request; returns the lookup URL.
    fn serve(status: StatusCode, body: &'static str, delay: Duration) -> String {
        // ---
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |_req| async move {
                tokio::time::sleep(delay).await;
                let mut resp = Response::new(Body::from(body));
                *resp.status_mut() = status;
                Ok::<_, Infallible>(resp)
            }))
        });

        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let server = Server::bind(&addr).serve(make_svc);
        let url = format!("http://{}/", server.local_addr());
        tokio::spawn(server);
        url
    }

    fn http(url: String, timeout: Duration) -> PublicIpDiscovery {
        PublicIpDiscovery::Http { url, timeout }
    }

    #[tokio::test]
    async fn test_http_lookup() {
        // ---
        let url = serve(StatusCode::OK, "203.0.113.9\n", Duration::ZERO);
        assert_eq!(
            http(url, LOOKUP_TIMEOUT).discover().await,
            Some("203.0.113.9".parse().expect("ip"))
        );
    }

    #[tokio::test]
    async fn test_http_failures_degrade_to_none() {
        // ---
        let garbage = serve(StatusCode::OK, "<html>nope</html>", Duration::ZERO);
        assert_eq!(http(garbage, LOOKUP_TIMEOUT).discover().await, None);

        let error = serve(StatusCode::SERVICE_UNAVAILABLE, "down", Duration::ZERO);
        assert_eq!(http(error, LOOKUP_TIMEOUT).discover().await, None);

        let slow = serve(StatusCode::OK, "203.0.113.9", Duration::from_secs(2));
        assert_eq!(http(slow, Duration::from_millis(100)).discover().await, None);
    }

    #[tokio::test]
    async fn test_static_and_disabled() {
        // ---
        let mut call = CallSettings::default();
        assert_eq!(PublicIpDiscovery::from_settings(&call), PublicIpDiscovery::Disabled);
        assert_eq!(PublicIpDiscovery::Disabled.discover().await, None);

        call.discover_public_ip = true;
        assert!(matches!(
            PublicIpDiscovery::from_settings(&call),
            PublicIpDiscovery::Http { .. }
        ));

        call.public_ip = Some("198.51.100.4".parse().expect("ip"));
        let discovery = PublicIpDiscovery::from_settings(&call);
        assert_eq!(discovery.discover().await, call.public_ip);
    }
}
