//! Binding between the axum WebSocket sink and the connection manager's
//! transport contract.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::SinkExt as _;
use futures::stream::SplitSink;

use crate::connection::SessionTransport;

pub struct WsTransport {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    open: AtomicBool,
    /// Bytes handed over but not yet flushed; the connection manager's
    /// high-water mark reads this.
    buffered: AtomicUsize,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            open: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionTransport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send_text(&self, payload: String) -> bool {
        let size = payload.len();
        self.buffered.fetch_add(size, Ordering::SeqCst);

        let result = self.sink.lock().await.send(Message::Text(payload.into())).await;

        self.buffered.fetch_sub(size, Ordering::SeqCst);

        match result {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "WebSocket write failed");
                self.open.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn send_ping(&self) -> bool {
        let result = self.sink.lock().await.send(Message::Ping(Vec::new().into())).await;

        match result {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "WebSocket ping failed");
                self.open.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };

        if let Err(error) = self.sink.lock().await.send(Message::Close(Some(frame))).await {
            trace!(%error, "WebSocket close failed (peer already gone)");
        }
    }
}
