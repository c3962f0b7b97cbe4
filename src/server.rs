use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, info, warn};

use crate::dialer::TunnelDialer;
use crate::http::HttpProxy;
use crate::pool::BufferPool;
use crate::request::ParsedRequest;
use crate::socks5::{self, Socks5};
use crate::tunnel::Tunnel;
use crate::Result;

/// Budget for reading and parsing the client's proxy request.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Local SOCKS5 + HTTP proxy that carries every connection over its own
/// tunnel transport.
pub struct ProxyServer<D> {
    listen_addr: String,
    dialer: D,
    fallback_ip: Option<String>,
    pool: BufferPool,
}

impl<D> ProxyServer<D>
where
    D: TunnelDialer + 'static,
{
    pub fn new(listen_addr: impl Into<String>, dialer: D, fallback_ip: Option<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dialer,
            fallback_ip,
            pool: BufferPool::default(),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen = %self.listen_addr, "proxy listening (socks5 + http)");
        if let Some(ip) = &self.fallback_ip {
            info!(fallback_ip = %ip, "fallback proxy ip");
        }
        self.serve(listener).await
    }

    /// Accept forever. A failed accept is logged and skipped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(socket, peer.to_string()).await;
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    pub async fn handle_connection<S>(&self, socket: S, client_addr: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut client = BufReader::new(socket);

        let request = match time::timeout(SNIFF_TIMEOUT, self.sniff(&mut client, &client_addr)).await
        {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(client = %client_addr, error = %e, "client request dropped");
                return;
            }
            Err(_) => {
                debug!(client = %client_addr, "protocol detection timed out");
                return;
            }
        };

        let mode = request.mode;
        let mut tunnel = Tunnel::new(
            &self.dialer,
            &self.pool,
            self.fallback_ip.as_deref(),
            &client_addr,
        );
        if let Err(e) = tunnel.run(client, request).await {
            if e.is_normal_close() {
                debug!(client = %client_addr, mode = %mode, error = %e, "tunnel ended");
            } else {
                warn!(client = %client_addr, mode = %mode, error = %e, "proxy failed");
            }
        }
    }

    /// Route on the first byte without consuming it.
    async fn sniff<S>(
        &self,
        client: &mut BufReader<S>,
        client_addr: &str,
    ) -> Result<Option<ParsedRequest>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = match client.fill_buf().await {
            Ok([first, ..]) => *first,
            _ => return Ok(None),
        };

        match first {
            socks5::VERSION5 => Socks5::new(client, client_addr).process().await.map(Some),
            // CONNECT GET POST PUT PATCH HEAD DELETE OPTIONS TRACE
            b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => {
                HttpProxy::new(client, client_addr).process().await.map(Some)
            }
            _ => {
                warn!(
                    client = client_addr,
                    first_byte = format_args!("0x{first:02x}"),
                    "unknown protocol"
                );
                Ok(None)
            }
        }
    }
}
