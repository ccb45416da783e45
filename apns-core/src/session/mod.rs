//! HTTP/2 session lifecycle: `Idle -> Connecting -> Open -> {Closing ->
//! Closed | Destroyed}`, driven by [`Session::acquire`] rather than an
//! event emitter. Concurrent callers racing to establish the same session
//! share one in-flight connect future.

mod tls;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use h2::client::SendRequest;
use h2::Ping;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use apns_proxy::{BoxedStream, Dialer, DirectDialer, Endpoint, HttpConnectDialer};

use crate::config::ResolvedConfig;
use crate::error::{ConfigError, SessionError};

/// Which of the two independent HTTP/2 sessions a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Push,
    Manage,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Push => f.write_str("push"),
            SessionKind::Manage => f.write_str("manage"),
        }
    }
}

type ConnectResult = Result<SendRequest<Bytes>, Arc<SessionError>>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectResult>>;

enum State {
    Idle,
    Connecting(ConnectFuture),
    Open(SendRequest<Bytes>),
    Destroyed,
}

/// A live, borrowed handle to an `Open` session, bundled with the authority
/// string the [`crate::requester::Requester`] needs for the `:authority`
/// pseudo-header.
pub struct H2Session {
    pub(crate) send_request: SendRequest<Bytes>,
    pub(crate) authority: String,
    pub(crate) kind: SessionKind,
}

struct Session {
    kind: SessionKind,
    endpoint: Endpoint,
    dialer: Arc<dyn Dialer>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    heartbeat_interval: std::time::Duration,
    state: Mutex<State>,
    destroyed: AtomicBool,
}

impl Session {
    fn new(
        kind: SessionKind,
        endpoint: Endpoint,
        dialer: Arc<dyn Dialer>,
        tls_config: Option<Arc<rustls::ClientConfig>>,
        heartbeat_interval: std::time::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            endpoint,
            dialer,
            tls_config,
            heartbeat_interval,
            state: Mutex::new(State::Idle),
            destroyed: AtomicBool::new(false),
        })
    }

    fn is_shutdown(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    async fn acquire(self: &Arc<Self>) -> Result<H2Session, SessionError> {
        loop {
            let fut = {
                let mut state = self.state.lock();
                match &*state {
                    State::Open(send_request) => {
                        return Ok(H2Session {
                            send_request: send_request.clone(),
                            authority: self.endpoint.authority(),
                            kind: self.kind,
                        })
                    }
                    State::Connecting(shared) => shared.clone(),
                    State::Idle | State::Destroyed => {
                        let session = self.clone();
                        let shared: ConnectFuture = Self::connect(session).boxed().shared();
                        *state = State::Connecting(shared.clone());
                        shared
                    }
                }
            };

            match fut.await {
                Ok(send_request) => {
                    let mut state = self.state.lock();
                    *state = State::Open(send_request.clone());
                    return Ok(H2Session {
                        send_request,
                        authority: self.endpoint.authority(),
                        kind: self.kind,
                    });
                }
                Err(error) => {
                    let mut state = self.state.lock();
                    *state = State::Destroyed;
                    return Err(SessionError::Shared(error.to_string()));
                }
            }
        }
    }

    fn destroy(&self) {
        *self.state.lock() = State::Destroyed;
    }

    fn shutdown(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.destroy();
    }

    async fn connect(session: Arc<Session>) -> ConnectResult {
        Self::connect_inner(session).await.map_err(Arc::new)
    }

    async fn connect_inner(session: Arc<Session>) -> Result<SendRequest<Bytes>, SessionError> {
        let stream: BoxedStream = session.dialer.dial(&session.endpoint).await?;

        match &session.tls_config {
            Some(tls_config) => {
                let server_name = rustls_pki_types::ServerName::try_from(session.endpoint.host.clone())
                    .map_err(|_| SessionError::InvalidServerName(session.endpoint.host.clone()))?;
                let connector = tokio_rustls::TlsConnector::from(tls_config.clone());
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(SessionError::Tls)?;
                Self::handshake(session, tls_stream).await
            }
            None => Self::handshake(session, stream).await,
        }
    }

    async fn handshake<S>(session: Arc<Session>, io: S) -> Result<SendRequest<Bytes>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_request, mut connection) = h2::client::Builder::new()
            .handshake(io)
            .await
            .map_err(SessionError::Handshake)?;

        let ping_pong = connection.ping_pong();

        let connection_session = session.clone();
        tokio::spawn(async move {
            match connection.await {
                Ok(()) => tracing::debug!(kind = %connection_session.kind, "HTTP/2 connection closed"),
                Err(error) => tracing::warn!(kind = %connection_session.kind, %error, "HTTP/2 connection terminated"),
            }
            connection_session.destroy();
        });

        if let Some(ping_pong) = ping_pong {
            tokio::spawn(Self::heartbeat_loop(session, ping_pong));
        }

        Ok(send_request)
    }

    async fn heartbeat_loop(session: Arc<Session>, mut ping_pong: h2::PingPong) {
        let mut interval = tokio::time::interval(session.heartbeat_interval);
        interval.tick().await; // first tick fires immediately

        loop {
            interval.tick().await;
            if session.is_shutdown() {
                return;
            }
            let started = std::time::Instant::now();
            match ping_pong.ping(Ping::opaque()).await {
                Ok(_) => tracing::debug!(kind = %session.kind, rtt = ?started.elapsed(), "ping"),
                Err(error) => {
                    tracing::warn!(kind = %session.kind, %error, "ping failed");
                    return;
                }
            }
        }
    }
}

/// Owns the `push` and `manage` sessions and builds the `Dialer`/TLS stack
/// for each from a [`ResolvedConfig`].
pub struct SessionManager {
    push: Arc<Session>,
    manage: Arc<Session>,
}

impl SessionManager {
    pub fn new(resolved: &ResolvedConfig) -> Result<Self, ConfigError> {
        let tls_config = tls::build_client_config(resolved)?;

        let push_dialer = build_dialer(resolved.push_proxy.as_ref());
        let manage_dialer = build_dialer(resolved.manage_proxy.as_ref());

        Ok(Self::with_dialers(resolved, push_dialer, manage_dialer, Some(tls_config)))
    }

    /// Constructs a manager over caller-supplied dialers, bypassing TLS
    /// when `tls_config` is `None`. The seam integration tests use to drive
    /// the client against an in-process `h2::server` double over plain TCP.
    pub fn with_dialers(
        resolved: &ResolvedConfig,
        push_dialer: Arc<dyn Dialer>,
        manage_dialer: Arc<dyn Dialer>,
        tls_config: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            push: Session::new(
                SessionKind::Push,
                resolved.push_endpoint.clone(),
                push_dialer,
                tls_config.clone(),
                resolved.heartbeat_interval,
            ),
            manage: Session::new(
                SessionKind::Manage,
                resolved.manage_endpoint.clone(),
                manage_dialer,
                tls_config,
                resolved.heartbeat_interval,
            ),
        }
    }

    pub async fn acquire(&self, kind: SessionKind) -> Result<H2Session, SessionError> {
        match kind {
            SessionKind::Push => self.push.acquire().await,
            SessionKind::Manage => self.manage.acquire().await,
        }
    }

    pub fn is_shutdown(&self, kind: SessionKind) -> bool {
        match kind {
            SessionKind::Push => self.push.is_shutdown(),
            SessionKind::Manage => self.manage.is_shutdown(),
        }
    }

    /// Tears down the session used by a request that just observed a 500,
    /// per the retry policy's teardown rule. Idempotent.
    pub fn destroy(&self, kind: SessionKind) {
        match kind {
            SessionKind::Push => self.push.destroy(),
            SessionKind::Manage => self.manage.destroy(),
        }
    }

    /// Idempotent: shuts down both sessions and prevents further
    /// reconnection attempts.
    pub fn shutdown(&self) {
        self.push.shutdown();
        self.manage.shutdown();
    }
}

fn build_dialer(proxy: Option<&Endpoint>) -> Arc<dyn Dialer> {
    match proxy {
        Some(proxy) => Arc::new(HttpConnectDialer::new(DirectDialer, proxy.clone())),
        None => Arc::new(DirectDialer),
    }
}
