//! Connection manager: owns the single realtime socket for a session.
//!
//! DESIGN
//! ======
//! `connect()` spawns one supervisor task guarded by a `CancellationToken`.
//! The supervisor opens the socket, runs a `select!` loop over inbound
//! frames, queued outbound frames, the keepalive tick, and cancellation, and
//! on close waits a fixed delay before opening again. `disconnect()` cancels
//! the token and awaits the task, so once it returns no reconnect or
//! keepalive can fire.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` → token resolved → supervisor spawned (`Connecting`)
//! 2. Open succeeds → `Connected`, keepalive armed, outbound sender installed
//! 3. Close or socket error → `Disconnected`, outbound sender removed
//! 4. Wait `reconnect_delay` (or `open_failure_delay` after a failed open),
//!    re-resolve the token, → `Reconnecting` → back to 2
//! 5. `disconnect` or a vanished token ends the loop at `Disconnected`
//!
//! ERROR HANDLING
//! ==============
//! Transport failures are logged and retried; nothing is returned to callers.
//! Retries are unbounded at a fixed delay.

use std::sync::{Arc, Mutex, MutexGuard};

use frames::{Message, MessageKind};
use futures_util::{SinkExt, StreamExt};
use url::Url;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{self, TokenStore};
use crate::config::RealtimeConfig;
use crate::registry::{HandlerId, Subscription, SubscriptionRegistry};
use crate::router::MessageRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RAW_FRAME_CAPACITY: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

/// Coarse connection indicator exposed to the UI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// First open attempt of a `connect` call.
    Connecting,
    Connected,
    /// Open attempt following a dropped connection or failed open.
    Reconnecting,
}

/// What a `connect` call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    /// A supervisor is already running; nothing was opened.
    AlreadyActive,
    /// No usable token; no attempt was made.
    MissingToken,
}

/// Application lifecycle transitions the manager reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
    SignedIn,
    SignedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("invalid base URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported base URL scheme: {0}")]
    Scheme(String),
    #[error("base URL cannot carry a path: {0}")]
    CannotBeBase(String),
}

/// Derive the socket URL from the HTTP(S) API base:
/// `https://host/api/v1` → `wss://host/api/v1/ws?token=<jwt>`.
///
/// # Errors
///
/// Returns [`UrlError`] for unparsable bases or non-HTTP(S)/WS(S) schemes.
pub fn transport_url(base: &str, token: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(UrlError::Scheme(other.to_owned())),
    };
    if url.set_scheme(scheme).is_err() {
        return Err(UrlError::Scheme(url.scheme().to_owned()));
    }
    url.path_segments_mut()
        .map_err(|()| UrlError::CannotBeBase(base.to_owned()))?
        .pop_if_empty()
        .push("ws");
    url.set_fragment(None);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

// =============================================================================
// MANAGER
// =============================================================================

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: RealtimeConfig,
    tokens: Arc<dyn TokenStore>,
    registry: Arc<SubscriptionRegistry>,
    router: MessageRouter,
    state: watch::Sender<ConnectionState>,
    /// Inbound text exactly as received, for observers that need the envelope.
    raw_frames: broadcast::Sender<String>,
    /// Present only while a socket is open. Dropping it discards queued frames.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?current, to = ?state, "connection state");
            *current = state;
            true
        });
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Cheap to clone; all clones share one socket and one registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: RealtimeConfig, tokens: Arc<dyn TokenStore>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (raw_frames, _) = broadcast::channel(RAW_FRAME_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                router: MessageRouter::new(Arc::clone(&registry)),
                registry,
                state,
                raw_frames,
                outbound: Mutex::new(None),
                supervisor: tokio::sync::Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Receive every inbound text frame verbatim, server timestamp included,
    /// before it is dispatched. Malformed frames are delivered too.
    #[must_use]
    pub fn watch_raw_frames(&self) -> broadcast::Receiver<String> {
        self.inner.raw_frames.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn on(&self, kind: MessageKind, handler: impl Fn(&Message) + Send + Sync + 'static) -> HandlerId {
        self.inner.registry.on(kind, handler)
    }

    pub fn off(&self, kind: &MessageKind, id: HandlerId) -> bool {
        self.inner.registry.off(kind, id)
    }

    pub fn subscribe(&self, kind: MessageKind, handler: impl Fn(&Message) + Send + Sync + 'static) -> Subscription {
        self.inner.registry.subscribe(kind, handler)
    }

    /// Start the supervisor unless one is already running.
    ///
    /// Concurrent callers are serialized, so at most one socket exists.
    pub async fn connect(&self) -> ConnectOutcome {
        let mut slot = self.inner.supervisor.lock().await;
        if slot.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return ConnectOutcome::AlreadyActive;
        }
        let Some(token) = auth::resolve_token(self.inner.tokens.as_ref()).await else {
            debug!("connect skipped: no usable token");
            self.inner.set_state(ConnectionState::Disconnected);
            return ConnectOutcome::MissingToken;
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), token, cancel.clone()));
        *slot = Some(Supervisor { cancel, task });
        ConnectOutcome::Started
    }

    /// Stop the supervisor and close the socket without scheduling a reconnect.
    ///
    /// The supervisor slot stays locked until the old task has finished, so a
    /// racing `connect` starts its session only after this one is torn down.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.supervisor.lock().await;
        if let Some(Supervisor { cancel, task }) = slot.take() {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "realtime supervisor ended abnormally");
            }
        }
        self.inner.outbound().take();
        self.inner.set_state(ConnectionState::Disconnected);
        drop(slot);
    }

    /// Queue `message` on the open socket. No-op returning `false` when not
    /// connected; nothing is buffered for later.
    pub fn send(&self, message: &Message) -> bool {
        let outbound = self.inner.outbound();
        let Some(tx) = outbound.as_ref() else {
            debug!(kind = %message.kind(), "send skipped: not connected");
            return false;
        };
        tx.send(frames::encode_frame(message)).is_ok()
    }

    /// React to foreground/background and sign-in/sign-out transitions.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Foreground | LifecycleEvent::SignedIn => {
                let outcome = self.connect().await;
                debug!(?event, ?outcome, "lifecycle connect");
            }
            LifecycleEvent::Background => self.disconnect().await,
            LifecycleEvent::SignedOut => {
                self.disconnect().await;
                if let Err(e) = self.inner.tokens.clear().await {
                    warn!(error = %e, "failed to clear token store on sign-out");
                }
                self.inner.registry.clear();
                info!("realtime session torn down");
            }
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

enum SessionEnd {
    Closed,
    Cancelled,
}

async fn supervise(inner: Arc<Inner>, mut token: String, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        inner.set_state(if attempt == 0 { ConnectionState::Connecting } else { ConnectionState::Reconnecting });

        let url = match transport_url(&inner.config.api_base_url, &token) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, base = %inner.config.api_base_url, "cannot derive realtime URL");
                break;
            }
        };

        let opened = tokio::select! {
            () = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        let delay = match opened {
            Ok((stream, _)) => match run_session(&inner, stream, &cancel).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Closed => inner.config.reconnect_delay,
            },
            Err(e) => {
                warn!(error = %e, attempt, "realtime connect failed");
                inner.config.open_failure_delay
            }
        };

        inner.set_state(ConnectionState::Disconnected);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        match auth::resolve_token(inner.tokens.as_ref()).await {
            Some(fresh) => token = fresh,
            None => {
                info!("access token gone; reconnect suspended until next connect");
                break;
            }
        }
        attempt = attempt.saturating_add(1);
    }
    inner.outbound().take();
    inner.set_state(ConnectionState::Disconnected);
}

async fn run_session(inner: &Inner, stream: WsStream, cancel: &CancellationToken) -> SessionEnd {
    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *inner.outbound() = Some(tx);
    inner.set_state(ConnectionState::Connected);
    info!("realtime connected");

    let period = inner.config.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Frames already accepted by `send` go out before the close.
                while let Ok(text) = rx.try_recv() {
                    if write.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = write.send(WsMessage::Close(None)).await;
                break SessionEnd::Cancelled;
            }
            _ = keepalive.tick() => {
                if write.send(WsMessage::Text(frames::encode_frame(&Message::Ping).into())).await.is_err() {
                    break SessionEnd::Closed;
                }
            }
            Some(text) = rx.recv() => {
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    warn!(error = %e, "realtime write failed");
                    break SessionEnd::Closed;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if inner.raw_frames.receiver_count() > 0 {
                        let _ = inner.raw_frames.send(text.as_str().to_owned());
                    }
                    inner.router.dispatch(text.as_str());
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "server closed realtime socket");
                    break SessionEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "realtime socket error");
                    break SessionEnd::Closed;
                }
                None => break SessionEnd::Closed,
            },
        }
    };

    inner.outbound().take();
    if matches!(end, SessionEnd::Closed) {
        info!("realtime disconnected");
    }
    end
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
