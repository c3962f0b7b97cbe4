use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use strum_macros::Display;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::dialer::TunnelDialer;
use crate::msg::{self, Reply};
use crate::pool::BufferPool;
use crate::reply;
use crate::request::{ParsedRequest, ProxyMode};
use crate::{Error, Result};

pub const DIAL_RETRIES: usize = 2;
pub const PING_INTERVAL: Duration = Duration::from_secs(10);
pub const EARLY_DATA_TIMEOUT: Duration = Duration::from_secs(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of the transport. Every outbound frame goes through this lock.
type Sink<T> = Arc<Mutex<SplitSink<WebSocketStream<T>, Message>>>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
enum State {
    Dialing,
    Handshaking,
    Relaying,
    Closed,
}

/// Single-fire completion signal shared by the tasks of one session.
#[derive(Default)]
pub struct Completion {
    fired: AtomicBool,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// One client connection carried over one tunnel transport.
pub struct Tunnel<'a, D> {
    dialer: &'a D,
    pool: &'a BufferPool,
    fallback_ip: Option<&'a str>,
    client_addr: &'a str,
    state: State,
}

impl<'a, D> Tunnel<'a, D>
where
    D: TunnelDialer,
{
    pub fn new(
        dialer: &'a D,
        pool: &'a BufferPool,
        fallback_ip: Option<&'a str>,
        client_addr: &'a str,
    ) -> Self {
        Self {
            dialer,
            pool,
            fallback_ip,
            client_addr,
            state: State::Dialing,
        }
    }

    /// Dial, handshake, then relay until either side ends. Failures before
    /// relaying starts are reported to the client in its own protocol.
    pub async fn run<S>(&mut self, mut client: S, req: ParsedRequest) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ParsedRequest {
            target,
            mode,
            first_frame,
        } = req;

        let ws = match self.dialer.dial_with_ech(DIAL_RETRIES).await {
            Ok(ws) => ws,
            Err(e) => {
                reply::send_failure(&mut client, mode).await;
                self.enter(State::Closed);
                return Err(e);
            }
        };

        self.enter(State::Handshaking);
        let (sink, mut stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let done = Arc::new(Completion::new());
        // pings start with the transport, the reply wait is covered too
        let pinger = tokio::spawn(keepalive(Arc::clone(&sink), Arc::clone(&done)));

        let first_frame = match first_frame {
            Some(frame) => frame,
            None if mode == ProxyMode::Socks5 => self.read_early_data(&mut client).await,
            None => Vec::new(),
        };

        if let Err(e) = handshake(&sink, &mut stream, &target, &first_frame, self.fallback_ip).await
        {
            pinger.abort();
            reply::send_failure(&mut client, mode).await;
            self.enter(State::Closed);
            return Err(e);
        }
        if let Err(e) = reply::send_success(&mut client, mode).await {
            pinger.abort();
            self.enter(State::Closed);
            return Err(e);
        }

        info!(client = self.client_addr, target = %target, mode = %mode, "tunnel established");
        self.enter(State::Relaying);

        relay(client, sink, stream, pinger, done, self.pool.clone(), self.client_addr).await;

        self.enter(State::Closed);
        info!(client = self.client_addr, target = %target, "tunnel closed");
        Ok(())
    }

    fn enter(&mut self, state: State) {
        debug!(client = self.client_addr, from = %self.state, to = %state, "tunnel state");
        self.state = state;
    }

    /// Grab whatever the client already sent so it rides on the connect
    /// frame. Nothing within the window is normal for server-first protocols.
    async fn read_early_data<R>(&self, client: &mut R) -> Vec<u8>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = self.pool.get();
        match time::timeout(EARLY_DATA_TIMEOUT, client.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                debug!(client = self.client_addr, bytes = n, "early data captured");
                buf[..n].to_vec()
            }
            _ => Vec::new(),
        }
    }
}

async fn handshake<T>(
    sink: &Sink<T>,
    stream: &mut SplitStream<WebSocketStream<T>>,
    target: &str,
    first_frame: &[u8],
    fallback_ip: Option<&str>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    sink.lock()
        .await
        .send(msg::connect_message(target, first_frame, fallback_ip))
        .await?;

    let payload = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => break data.to_vec(),
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::UnexpectedReply("transport closed before reply".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };

    match Reply::parse(&payload) {
        Reply::Connected => Ok(()),
        Reply::Error(text) => Err(Error::Remote(text)),
        Reply::Unexpected(text) => Err(Error::UnexpectedReply(text)),
    }
}

async fn relay<S, T>(
    client: S,
    sink: Sink<T>,
    stream: SplitStream<WebSocketStream<T>>,
    pinger: JoinHandle<()>,
    done: Arc<Completion>,
    pool: BufferPool,
    client_addr: &str,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let label: Arc<str> = Arc::from(client_addr);
    let (client_rd, client_wr) = io::split(client);

    let tasks = [
        pinger,
        tokio::spawn(client_to_tunnel(
            client_rd,
            Arc::clone(&sink),
            pool,
            Arc::clone(&done),
            Arc::clone(&label),
        )),
        tokio::spawn(tunnel_to_client(stream, client_wr, Arc::clone(&done), label)),
    ];

    done.wait().await;

    // Dropping the tasks releases both client halves and the read side of
    // the transport, which closes the client socket.
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
    let mut sink = sink.lock().await;
    let _ = time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}

async fn keepalive<T>(sink: Sink<T>, done: Arc<Completion>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = sink.lock().await.send(Message::Ping(Bytes::new())).await {
            debug!(error = %e, "keepalive ping failed");
            done.fire();
            return;
        }
    }
}

async fn client_to_tunnel<R, T>(
    mut reader: ReadHalf<R>,
    sink: Sink<T>,
    pool: BufferPool,
    done: Arc<Completion>,
    client: Arc<str>,
) where
    R: AsyncRead,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let read_end = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(Error::from(e)),
        };
        let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
        if let Err(e) = sink.lock().await.send(frame).await {
            log_relay_end(&client, "client->tunnel", &e.into());
            done.fire();
            return;
        }
    };

    if let Some(e) = read_end {
        log_relay_end(&client, "client->tunnel", &e);
    }
    // let the remote side release its upstream connection
    let _ = sink.lock().await.send(msg::close_message()).await;
    done.fire();
}

async fn tunnel_to_client<T, W>(
    mut stream: SplitStream<WebSocketStream<T>>,
    mut writer: WriteHalf<W>,
    done: Arc<Completion>,
    client: Arc<str>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite,
{
    let result: Result<()> = async {
        while let Some(frame) = stream.next().await {
            match frame? {
                Message::Binary(data) => writer.write_all(&data).await?,
                Message::Text(text) if text.as_str() == msg::CLOSE => return Ok(()),
                Message::Text(text) => writer.write_all(text.as_bytes()).await?,
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        log_relay_end(&client, "tunnel->client", &e);
    }
    done.fire();
}

fn log_relay_end(client: &str, direction: &str, err: &Error) {
    if err.is_normal_close() {
        debug!(client, direction, error = %err, "relay ended");
    } else {
        warn!(client, direction, error = %err, "relay failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Remote relay that answers the connect frame with a fixed reply.
    struct Replying(&'static str);

    #[async_trait]
    impl TunnelDialer for Replying {
        type Io = DuplexStream;

        async fn dial_with_ech(&self, _: usize) -> Result<WebSocketStream<DuplexStream>> {
            let (near, far) = io::duplex(64 * 1024);
            let reply = self.0;
            tokio::spawn(async move {
                let mut remote = WebSocketStream::from_raw_socket(far, Role::Server, None).await;
                let _ = remote.next().await;
                let _ = remote.send(Message::text(reply)).await;
                while let Some(Ok(_)) = remote.next().await {}
            });
            Ok(WebSocketStream::from_raw_socket(near, Role::Client, None).await)
        }
    }

    struct Refused;

    #[async_trait]
    impl TunnelDialer for Refused {
        type Io = DuplexStream;

        async fn dial_with_ech(&self, n: usize) -> Result<WebSocketStream<DuplexStream>> {
            Err(Error::Dial {
                attempts: n,
                reason: "refused".into(),
            })
        }
    }

    async fn written_by_proxy(mut client: DuplexStream) -> Vec<u8> {
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        written
    }

    #[tokio::test]
    async fn dial_failure_closes_from_dialing() {
        let pool = BufferPool::default();
        let mut tunnel = Tunnel::new(&Refused, &pool, None, "test");
        assert_eq!(tunnel.state, State::Dialing);

        let (client, proxy) = io::duplex(1024);
        let req = ParsedRequest::new("example.com:443", ProxyMode::Socks5);
        let result = tunnel.run(proxy, req).await;

        assert!(matches!(result, Err(Error::Dial { attempts: DIAL_RETRIES, .. })));
        assert_eq!(tunnel.state, State::Closed);
        assert_eq!(written_by_proxy(client).await, reply::failure(ProxyMode::Socks5));
    }

    #[tokio::test]
    async fn remote_error_never_relays() {
        let pool = BufferPool::default();
        let dialer = Replying("ERROR:upstream refused");
        let mut tunnel = Tunnel::new(&dialer, &pool, None, "test");

        let (client, proxy) = io::duplex(1024);
        let req = ParsedRequest::new("example.com:443", ProxyMode::HttpConnect);
        let result = tunnel.run(proxy, req).await;

        assert!(matches!(result, Err(Error::Remote(ref text)) if text == "ERROR:upstream refused"));
        assert_eq!(tunnel.state, State::Closed);
        assert_eq!(written_by_proxy(client).await, reply::HTTP_BAD_GATEWAY);
    }

    #[tokio::test]
    async fn connected_session_relays_then_closes() {
        let pool = BufferPool::default();
        let dialer = Replying("CONNECTED");
        let mut tunnel = Tunnel::new(&dialer, &pool, None, "test");

        let (client, proxy) = io::duplex(1024);
        let req = ParsedRequest::new("example.com:443", ProxyMode::HttpConnect);
        let client_side = async move {
            let (mut rd, wr) = io::split(client);
            let mut established = vec![0; reply::HTTP_ESTABLISHED.len()];
            rd.read_exact(&mut established).await.unwrap();
            assert_eq!(established, reply::HTTP_ESTABLISHED);
            // hang up: the session sends CLOSE and tears down
            drop((rd, wr));
        };

        let (result, ()) = tokio::join!(tunnel.run(proxy, req), client_side);
        assert!(result.is_ok());
        assert_eq!(tunnel.state, State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_fires_completion() {
        let (near, far) = io::duplex(1024);
        drop(far);
        let ws = WebSocketStream::from_raw_socket(near, Role::Client, None).await;
        let (sink, _stream) = ws.split();

        let done = Arc::new(Completion::new());
        keepalive(Arc::new(Mutex::new(sink)), Arc::clone(&done)).await;
        assert!(done.is_fired());
    }

    #[tokio::test]
    async fn completion_fires_once() {
        let done = Arc::new(Completion::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let done = Arc::clone(&done);
            tasks.push(tokio::spawn(async move { done.fire() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(done.is_fired());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_race_across_threads() {
        for _ in 0..100 {
            let done = Arc::new(Completion::new());
            let a = tokio::spawn({
                let done = Arc::clone(&done);
                async move { done.fire() }
            });
            let b = tokio::spawn({
                let done = Arc::clone(&done);
                async move { done.fire() }
            });
            let (a, b) = (a.await.unwrap(), b.await.unwrap());
            assert!(a ^ b);
        }
    }

    #[tokio::test]
    async fn wait_after_fire_returns() {
        let done = Completion::new();
        done.fire();
        time::timeout(Duration::from_secs(1), done.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_wakes_on_fire() {
        let done = Arc::new(Completion::new());
        let waiter = tokio::spawn({
            let done = Arc::clone(&done);
            async move { done.wait().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        done.fire();
        time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
