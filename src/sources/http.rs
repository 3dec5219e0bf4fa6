//! HTTP report delivery.
//!
//! Report threads are plain OS threads, so delivery drives the async
//! `reqwest` client on the agent's tokio runtime through `Handle::block_on`.

use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::ReportTransport;
use crate::config::HttpConfig;
use crate::error::{DeliveryError, DeliveryResult};

/// Content type of MessagePack payloads
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Content type of JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ----------------------------------------------------------------------------
// Interface Binding
// ----------------------------------------------------------------------------

/// First address of `interface`, IPv4 preferred
pub fn interface_address(interface: &str) -> Option<IpAddr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;

    let mut v6 = None;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            return Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        }
        if v6.is_none() {
            if let Some(sin6) = address.as_sockaddr_in6() {
                v6 = Some(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
            }
        }
    }
    v6
}

// ----------------------------------------------------------------------------
// HTTP Transport
// ----------------------------------------------------------------------------

/// Default [`ReportTransport`]: one POST per attempt, no internal retry
#[derive(Debug)]
pub struct HttpTransport {
    runtime: Handle,
    timeout: Duration,
    interface: Option<String>,
    /// Shared client when no interface binding is configured
    client: HttpClient,
}

impl HttpTransport {
    /// Fails if the TLS backend or resolver cannot be initialised
    pub fn new(config: &HttpConfig, runtime: Handle) -> DeliveryResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| DeliveryError::request(format!("unable to build HTTP client: {e}")))?;

        Ok(Self {
            runtime,
            timeout: config.timeout,
            interface: config.interface.clone(),
            client,
        })
    }

    /// Client bound to the configured interface's current address
    fn client(&self) -> DeliveryResult<HttpClient> {
        let Some(interface) = &self.interface else {
            return Ok(self.client.clone());
        };

        let address =
            interface_address(interface).ok_or_else(|| DeliveryError::InterfaceUnavailable {
                interface: interface.clone(),
            })?;

        HttpClient::builder()
            .timeout(self.timeout)
            .local_address(address)
            .build()
            .map_err(|e| DeliveryError::request(e.to_string()))
    }
}

impl ReportTransport for HttpTransport {
    fn deliver(&self, url: &str, payload: &[u8], content_type: &str) -> DeliveryResult<()> {
        let parsed = reqwest::Url::parse(url).map_err(|e| DeliveryError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let client = self.client()?;
        let body = payload.to_vec();

        let status = self.runtime.block_on(async move {
            client
                .post(parsed)
                .header(ACCEPT, JSON_CONTENT_TYPE)
                .header(CONTENT_TYPE, content_type)
                .body(body)
                .send()
                .await
                .map(|response| response.status())
        });

        match status {
            Ok(status) if status.is_success() => {
                debug!(
                    target: "telemetry::http",
                    status = status.as_u16(),
                    bytes = payload.len(),
                    "Report delivered"
                );
                Ok(())
            }
            Ok(status) => {
                warn!(target: "telemetry::http", status = status.as_u16(), "Delivery rejected");
                Err(DeliveryError::Status {
                    status_code: status.as_u16(),
                })
            }
            Err(e) => {
                warn!(target: "telemetry::http", error = %e, "Delivery failed");
                Err(DeliveryError::request(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_has_no_address() {
        assert!(interface_address("no-such-if0").is_none());
    }

    #[test]
    fn test_unknown_interface_fails_delivery() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = HttpConfig {
            timeout: Duration::from_secs(1),
            interface: Some("no-such-if0".into()),
        };
        let transport = HttpTransport::new(&config, runtime.handle().clone()).unwrap();

        let err = transport
            .deliver("http://127.0.0.1:9/report", b"{}", JSON_CONTENT_TYPE)
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InterfaceUnavailable { .. }));
    }

    #[test]
    fn test_invalid_url_fails_delivery() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let transport =
            HttpTransport::new(&HttpConfig::default(), runtime.handle().clone()).unwrap();

        let err = transport
            .deliver("not a url", b"{}", JSON_CONTENT_TYPE)
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidUrl { .. }));
    }

    #[test]
    fn test_new_returns_configured_transport() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = HttpConfig {
            timeout: Duration::from_secs(7),
            interface: None,
        };

        let transport = HttpTransport::new(&config, runtime.handle().clone()).unwrap();
        assert_eq!(transport.timeout, Duration::from_secs(7));
        assert!(transport.client().is_ok());
    }
}
