use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rustls::client::{EchConfig, EchMode};
use rustls::crypto::aws_lc_rs::{self, hpke};
use rustls::pki_types::{EchConfigListBytes, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::ech::EchProvider;
use crate::{Error, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the framed transport a tunnel session runs over.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// At least one attempt is made even when `max_retries` is 0.
    async fn dial_with_ech(&self, max_retries: usize) -> Result<WebSocketStream<Self::Io>>;
}

/// WebSocket over TLS with an encrypted ClientHello.
pub struct WsDialer {
    endpoint: Endpoint,
    server_ip: Option<IpAddr>,
    token: Option<String>,
    ech: Arc<dyn EchProvider>,
}

impl WsDialer {
    pub fn new(
        endpoint: Endpoint,
        server_ip: Option<IpAddr>,
        token: Option<String>,
        ech: Arc<dyn EchProvider>,
    ) -> Self {
        Self {
            endpoint,
            server_ip,
            token,
            ech,
        }
    }

    async fn dial_once(&self) -> Result<WebSocketStream<TlsStream<TcpStream>>> {
        let config_list = self
            .ech
            .config_list()
            .ok_or_else(|| Error::Ech("config not loaded".into()))?;
        let connector = TlsConnector::from(Arc::new(tls_config(config_list)?));

        let port = self.endpoint.port;
        let connect = match self.server_ip {
            Some(ip) => time::timeout(DIAL_TIMEOUT, TcpStream::connect(SocketAddr::new(ip, port))).await,
            None => {
                time::timeout(DIAL_TIMEOUT, TcpStream::connect((self.endpoint.host.as_str(), port)))
                    .await
            }
        };
        let tcp = connect.map_err(|_| io::Error::new(ErrorKind::TimedOut, "tcp connect timed out"))??;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(self.endpoint.host.clone())
            .map_err(|e| Error::Config(format!("server name {:?}: {e}", self.endpoint.host)))?;
        let tls = connector.connect(server_name, tcp).await?;

        let mut request = self.endpoint.url().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| Error::Config(format!("token: {e}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (ws, _) = client_async(request, tls).await?;
        debug!(server = %self.endpoint.url(), "tunnel transport open");
        Ok(ws)
    }
}

#[async_trait]
impl TunnelDialer for WsDialer {
    type Io = TlsStream<TcpStream>;

    async fn dial_with_ech(&self, max_retries: usize) -> Result<WebSocketStream<Self::Io>> {
        let attempts = max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.dial_once().await {
                Ok(ws) => return Ok(ws),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "tunnel dial failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                // the published ECH keys may have rotated since startup
                if let Err(e) = self.ech.prepare().await {
                    warn!(error = %e, "ech config refresh failed");
                }
                time::sleep(backoff(attempt)).await;
            }
        }

        Err(Error::Dial {
            attempts,
            reason: last_error,
        })
    }
}

fn tls_config(config_list: Vec<u8>) -> Result<ClientConfig> {
    let ech = EchConfig::new(EchConfigListBytes::from(config_list), hpke::ALL_SUPPORTED_SUITES)?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_ech(EchMode::from(ech))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn backoff(attempt: usize) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..200);
    Duration::from_millis(300 * attempt as u64 + jitter)
}
