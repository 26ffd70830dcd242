use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};

use crate::error::{ClientError, Result};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    /// Terminal; nothing follows on the same channel.
    Closed { code: u16, was_clean: bool },
}

pub trait ChannelWriter: Send + Sync {
    fn send_text(&self, text: String) -> Result<()>;

    fn close(&self);
}

pub struct Channel {
    pub writer: Box<dyn ChannelWriter>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Channel>;
}

pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

struct WsWriter {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelWriter for WsWriter {
    fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::Transport { message: "channel closed".to_string() })
    }

    fn close(&self) {
        let frame = CloseFrame { code: CloseCode::Normal, reason: "client shutdown".into() };
        let _ = self.tx.send(Message::Close(Some(frame)));
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Channel> {
        let (ws, resp) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                ClientError::TransportOpen(format!(
                    "handshake timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;
        log::debug!("ws.handshake status={}", resp.status());

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    log::warn!("ws.write.error {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut code = CLOSE_ABNORMAL;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(t)) => {
                        if ev_tx.send(TransportEvent::Message(t.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                        Ok(s) => {
                            if ev_tx.send(TransportEvent::Message(s)).is_err() {
                                return;
                            }
                        }
                        Err(_) => log::warn!("ws.read.binary_not_utf8 len={}", b.len()),
                    },
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("ws.read.error {}", e);
                        break;
                    }
                }
            }
            let _ = ev_tx.send(TransportEvent::Closed { code, was_clean: code == CLOSE_NORMAL });
        });

        Ok(Channel { writer: Box::new(WsWriter { tx: out_tx }), events: ev_rx })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeTransport {
        pub script: Mutex<VecDeque<std::result::Result<(), String>>>,
        pub opens: Mutex<Vec<tokio::time::Instant>>,
        pub writes: Arc<Mutex<Vec<String>>>,
        pub events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        pub closed_by_client: Arc<Mutex<u32>>,
        pub fail_writes: Arc<AtomicBool>,
    }

    struct FakeWriter {
        writes: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<u32>>,
        fail: Arc<AtomicBool>,
    }

    impl ChannelWriter for FakeWriter {
        fn send_text(&self, text: String) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Transport { message: "socket write failed".to_string() });
            }
            self.writes.lock().push(text);
            Ok(())
        }

        fn close(&self) {
            *self.closes.lock() += 1;
        }
    }

    impl FakeTransport {
        pub fn scripted(outcomes: Vec<std::result::Result<(), String>>) -> Arc<Self> {
            let t = Self::default();
            *t.script.lock() = outcomes.into();
            Arc::new(t)
        }

        pub fn push_event(&self, ev: TransportEvent) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(ev);
            }
        }

        pub fn written_types(&self) -> Vec<String> {
            self.writes
                .lock()
                .iter()
                .map(|w| {
                    let v: serde_json::Value = serde_json::from_str(w).unwrap();
                    v["type"].as_str().unwrap().to_string()
                })
                .collect()
        }

        pub fn open_count(&self) -> usize {
            self.opens.lock().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(&self, _url: &str) -> Result<Channel> {
            self.opens.lock().push(tokio::time::Instant::now());
            let next = self.script.lock().pop_front().unwrap_or(Err("refused".to_string()));
            match next {
                Ok(()) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.events.lock() = Some(tx);
                    Ok(Channel {
                        writer: Box::new(FakeWriter {
                            writes: self.writes.clone(),
                            closes: self.closed_by_client.clone(),
                            fail: self.fail_writes.clone(),
                        }),
                        events: rx,
                    })
                }
                Err(e) => Err(ClientError::TransportOpen(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn serve_once(close_code: CloseCode) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"welcome","message":"hi"}"#.into()))
                .await
                .unwrap();
            // Echo the first client frame back, then close.
            if let Some(Ok(Message::Text(t))) = ws.next().await {
                ws.send(Message::Text(t)).await.unwrap();
            }
            ws.close(Some(CloseFrame { code: close_code, reason: "bye".into() }))
                .await
                .ok();
        });
        format!("ws://{addr}/ws")
    }

    #[tokio::test]
    async fn delivers_frames_then_abnormal_close() {
        let url = serve_once(CloseCode::Error).await;
        let mut ch = WsTransport::new(Duration::from_secs(5)).open(&url).await.unwrap();

        assert_eq!(
            ch.events.recv().await,
            Some(TransportEvent::Message(r#"{"type":"welcome","message":"hi"}"#.to_string()))
        );
        ch.writer.send_text("ping".to_string()).unwrap();
        assert_eq!(ch.events.recv().await, Some(TransportEvent::Message("ping".to_string())));
        assert_eq!(
            ch.events.recv().await,
            Some(TransportEvent::Closed { code: 1011, was_clean: false })
        );
    }

    #[tokio::test]
    async fn normal_close_is_clean() {
        let url = serve_once(CloseCode::Normal).await;
        let mut ch = WsTransport::new(Duration::from_secs(5)).open(&url).await.unwrap();
        ch.writer.send_text("x".to_string()).unwrap();
        let mut last = None;
        while let Some(ev) = ch.events.recv().await {
            last = Some(ev);
        }
        assert_eq!(last, Some(TransportEvent::Closed { code: CLOSE_NORMAL, was_clean: true }));
    }

    #[tokio::test]
    async fn refused_connection_is_open_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = WsTransport::new(Duration::from_secs(5))
            .open(&format!("ws://{addr}/ws"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "transport_open");
    }
}
