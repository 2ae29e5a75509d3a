//! TCP acceptor and dialer
//!
//! Thin glue between sockets and the session engine: accepted connections
//! become managed sessions handed to a [`Handler`]; dialed connections become
//! standalone sessions.

use crate::codec::{Codec, Protocol};
use crate::config::ServerConfig;
use crate::error::{NetError, Result};
use crate::manager::Manager;
use crate::session::{wait_true, EngineContext, Session};
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;

const MIN_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_millis(100);

/// Per-connection entry point for accepted sessions
#[async_trait]
pub trait Handler<C: Codec>: Send + Sync + 'static {
    async fn handle_session(&self, session: Arc<Session<C>>);
}

#[async_trait]
impl<C, F, Fut> Handler<C> for F
where
    C: Codec,
    F: Fn(Arc<Session<C>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle_session(&self, session: Arc<Session<C>>) {
        (self)(session).await
    }
}

/// Accept loop registering every connection with one [`Manager`]
pub struct Server<P: Protocol<TcpStream>> {
    listener: TcpListener,
    protocol: Arc<P>,
    manager: Manager<P::Codec>,
    handler: Arc<dyn Handler<P::Codec>>,
    config: ServerConfig,
    shutdown: watch::Sender<bool>,
}

impl<P: Protocol<TcpStream>> std::fmt::Debug for Server<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P> Server<P>
where
    P: Protocol<TcpStream> + 'static,
{
    /// Wrap a bound listener, drawing session ids from a fresh context
    pub fn new<H>(listener: TcpListener, protocol: P, config: ServerConfig, handler: H) -> Self
    where
        H: Handler<P::Codec>,
    {
        Self::with_context(&EngineContext::new(), listener, protocol, config, handler)
    }

    /// Wrap a bound listener, drawing session ids from `ctx`
    pub fn with_context<H>(
        ctx: &EngineContext,
        listener: TcpListener,
        protocol: P,
        config: ServerConfig,
        handler: H,
    ) -> Self
    where
        H: Handler<P::Codec>,
    {
        let manager = Manager::new(ctx, &config.manager);
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            protocol: Arc::new(protocol),
            manager,
            handler: Arc::new(handler),
            config,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Manager holding this server's sessions
    pub fn manager(&self) -> &Manager<P::Codec> {
        &self.manager
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Returns `Ok(())` on shutdown and an error only for a non-transient
    /// accept failure.
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Server accepting connections");

        while let Some((stream, peer)) = accept_with_backoff(&self.listener, &mut shutdown_rx).await? {
            let protocol = Arc::clone(&self.protocol);
            let manager = self.manager.clone();
            let handler = Arc::clone(&self.handler);
            let capacity = self.config.send_queue_capacity;

            tokio::spawn(async move {
                let codec = match protocol.new_codec(stream) {
                    Ok(codec) => codec,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Failed to build codec, dropping connection");
                        return;
                    }
                };
                let session = manager.new_session(codec, capacity).await;
                tracing::debug!(peer = %peer, session_id = session.id(), "Accepted session");
                handler.handle_session(session).await;
            });
        }

        tracing::info!("Server stopped accepting");
        Ok(())
    }

    /// Stop the accept loop and close every session of this server.
    ///
    /// Returns once all sessions have finished closing.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.manager.dispose().await;
    }
}

/// Next accept retry delay: 5ms first, doubling, capped at 100ms
fn next_delay(previous: Duration) -> Duration {
    if previous.is_zero() {
        MIN_ACCEPT_DELAY
    } else {
        (previous * 2).min(MAX_ACCEPT_DELAY)
    }
}

/// Accept errors worth retrying; anything else ends the accept loop
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // ENFILE, EMFILE
    cfg!(unix) && matches!(e.raw_os_error(), Some(23) | Some(24))
}

/// Accept one connection, retrying transient failures with backoff.
///
/// `Ok(None)` means the shutdown signal fired.
async fn accept_with_backoff(
    listener: &TcpListener,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Option<(TcpStream, SocketAddr)>> {
    let mut delay = Duration::ZERO;
    loop {
        let result = tokio::select! {
            _ = wait_true(shutdown_rx) => return Ok(None),
            result = listener.accept() => result,
        };
        match result {
            Ok(conn) => return Ok(Some(conn)),
            Err(e) if is_transient(&e) => {
                delay = next_delay(delay);
                tracing::warn!(error = %e, retry_in = ?delay, "Accept failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Bind `addr` and build a [`Server`] around it
pub async fn listen<A, P, H>(addr: A, protocol: P, config: ServerConfig, handler: H) -> Result<Server<P>>
where
    A: ToSocketAddrs,
    P: Protocol<TcpStream> + 'static,
    H: Handler<P::Codec>,
{
    let listener = TcpListener::bind(addr).await?;
    Ok(Server::new(listener, protocol, config, handler))
}

/// Connect to `addr` and wrap the connection in a standalone session
pub async fn dial<A, P>(
    ctx: &EngineContext,
    addr: A,
    protocol: &P,
    send_queue_capacity: usize,
) -> Result<Arc<Session<P::Codec>>>
where
    A: ToSocketAddrs,
    P: Protocol<TcpStream>,
{
    let stream = TcpStream::connect(addr).await?;
    session_for(ctx, stream, protocol, send_queue_capacity)
}

/// [`dial`] with a bound on connection setup time
pub async fn dial_timeout<A, P>(
    ctx: &EngineContext,
    addr: A,
    timeout: Duration,
    protocol: &P,
    send_queue_capacity: usize,
) -> Result<Arc<Session<P::Codec>>>
where
    A: ToSocketAddrs,
    P: Protocol<TcpStream>,
{
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetError::Timeout(format!("connect timed out after {:?}", timeout)))??;
    session_for(ctx, stream, protocol, send_queue_capacity)
}

fn session_for<P: Protocol<TcpStream>>(
    ctx: &EngineContext,
    stream: TcpStream,
    protocol: &P,
    send_queue_capacity: usize,
) -> Result<Arc<Session<P::Codec>>> {
    let codec = protocol.new_codec(stream)?;
    let session = Session::new(ctx, codec, send_queue_capacity);
    tracing::debug!(session_id = session.id(), "Dialed session");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawProtocol;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut delay = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..7 {
            delay = next_delay(delay);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test]
    async fn test_shutdown_ends_serve() {
        let server = Arc::new(
            listen(
                "127.0.0.1:0",
                RawProtocol,
                ServerConfig::default(),
                |_session: Arc<Session<crate::codec::RawCodec<TcpStream>>>| async {},
            )
            .await
            .unwrap(),
        );
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        server.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(&EngineContext::new(), addr, &RawProtocol, 0).await;
        assert!(matches!(result, Err(NetError::Io(_))));
    }
}
