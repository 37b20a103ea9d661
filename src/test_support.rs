//! Test fixtures shared across module tests: JWT builders and an in-process
//! websocket server that records what the client sends.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use frames::NotificationPayload;

use crate::api::{ActionItemSummary, ApiError, Backstop};
use crate::auth::MemoryTokenStore;
use crate::config::RealtimeConfig;
use crate::connection::{ConnectionManager, ConnectionState};

/// Unsigned JWT with the given claims.
pub fn jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{claims}.c2ln")
}

/// JWT valid for another hour.
pub fn fresh_jwt() -> String {
    jwt(&serde_json::json!({ "sub": "u-1", "exp": crate::auth::now_secs() + 3600 }))
}

/// JWT that expired a minute ago.
pub fn expired_jwt() -> String {
    jwt(&serde_json::json!({ "sub": "u-1", "exp": crate::auth::now_secs() - 60 }))
}

/// How the test server treats each accepted connection.
#[derive(Clone, Debug)]
pub enum Script {
    /// Keep the socket open and record inbound text frames.
    Hold,
    /// Drop the first connection without a close frame, hold the rest.
    DropFirst,
    /// Push these frames right after the handshake, then hold.
    Push(Vec<String>),
}

pub struct TestServer {
    pub base_url: String,
    accepted: Arc<AtomicUsize>,
    uris: Arc<Mutex<Vec<String>>>,
    pub frames: mpsc::UnboundedReceiver<String>,
}

impl TestServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let uris = Arc::new(Mutex::new(Vec::new()));
        let (tx, frames) = mpsc::unbounded_channel();

        let accepted_task = Arc::clone(&accepted);
        let uris_task = Arc::clone(&uris);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = accepted_task.fetch_add(1, Ordering::SeqCst);
                let uris = Arc::clone(&uris_task);
                let tx = tx.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let callback = move |req: &Request, resp: Response| {
                        uris.lock().expect("uri lock").push(req.uri().to_string());
                        Ok::<Response, ErrorResponse>(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    match script {
                        Script::DropFirst if index == 0 => return,
                        Script::Push(frames) => {
                            for frame in frames {
                                if write.send(WsMessage::Text(frame.into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                        _ => {}
                    }
                    while let Some(Ok(msg)) = read.next().await {
                        match msg {
                            WsMessage::Text(text) => {
                                let _ = tx.send(text.as_str().to_owned());
                            }
                            WsMessage::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        Self { base_url: format!("http://{addr}/api/v1"), accepted, uris, frames }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().expect("uri lock").clone()
    }

    /// Next text frame the client sent, parsed as JSON.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("server frame channel closed");
        serde_json::from_str(&text).expect("client frame should be JSON")
    }

    /// Next client frame whose `type` is not a keepalive ping.
    pub async fn next_non_ping(&mut self) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] != "ping" {
                return frame;
            }
        }
    }
}

/// Config with delays short enough for tests.
pub fn fast_config(base_url: &str) -> RealtimeConfig {
    RealtimeConfig {
        reconnect_delay: Duration::from_millis(50),
        open_failure_delay: Duration::from_millis(50),
        keepalive_interval: Duration::from_secs(60),
        ..RealtimeConfig::default()
    }
    .with_api_base_url(base_url)
}

/// Manager holding a fresh token, pointed at `base_url`.
pub fn manager_for(base_url: &str) -> ConnectionManager {
    ConnectionManager::new(fast_config(base_url), Arc::new(MemoryTokenStore::new(Some(fresh_jwt()))))
}

/// Wait until the manager reports `state`.
pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .expect("state channel closed");
}

/// In-memory [`Backstop`] that records calls and can be told to fail.
#[derive(Default)]
pub struct FakeBackstop {
    pub notifications: Mutex<Vec<NotificationPayload>>,
    pub unread: AtomicU64,
    pub action_items: Mutex<ActionItemSummary>,
    pub action_item_calls: AtomicUsize,
    pub marked: Mutex<Vec<String>>,
    pub read_conversations: Mutex<Vec<String>>,
    pub unread_messages: AtomicU64,
    pub fail: AtomicBool,
}

impl FakeBackstop {
    fn check(&self, path: &str) -> Result<(), ApiError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::Status { status: 503, path: path.to_owned() });
        }
        Ok(())
    }

    pub fn marked(&self) -> Vec<String> {
        self.marked.lock().expect("marked").clone()
    }

    pub fn read_conversations(&self) -> Vec<String> {
        self.read_conversations.lock().expect("read conversations").clone()
    }
}

#[async_trait]
impl Backstop for FakeBackstop {
    async fn notifications(&self, limit: usize) -> Result<Vec<NotificationPayload>, ApiError> {
        self.check("/notifications")?;
        Ok(self.notifications.lock().expect("notifications").iter().take(limit).cloned().collect())
    }

    async fn notification_unread_count(&self) -> Result<u64, ApiError> {
        self.check("/notifications/unread-count")?;
        Ok(self.unread.load(Ordering::SeqCst))
    }

    async fn mark_notification_read(&self, id: &str) -> Result<(), ApiError> {
        self.check("/notifications/read")?;
        self.marked.lock().expect("marked").push(id.to_owned());
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        self.check("/notifications/mark-all-read")?;
        self.marked.lock().expect("marked").push("*".to_owned());
        Ok(())
    }

    async fn message_unread_count(&self) -> Result<u64, ApiError> {
        self.check("/messaging/unread-count")?;
        Ok(self.unread_messages.load(Ordering::SeqCst))
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), ApiError> {
        self.check("/messaging/conversations/read")?;
        self.read_conversations.lock().expect("read conversations").push(conversation_id.to_owned());
        Ok(())
    }

    async fn action_items(&self) -> Result<ActionItemSummary, ApiError> {
        self.action_item_calls.fetch_add(1, Ordering::SeqCst);
        self.check("/action-items")?;
        Ok(self.action_items.lock().expect("action items").clone())
    }
}

/// Manager with no token, for exercising handlers through its router.
pub fn offline_manager() -> ConnectionManager {
    ConnectionManager::new(RealtimeConfig::default(), Arc::new(MemoryTokenStore::default()))
}

/// Poll `cond` every few milliseconds for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}
