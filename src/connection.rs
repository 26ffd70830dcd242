use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::SmallRng, SeedableRng};
use serde_json::{json, Map, Value};

use crate::{
    observer::{ConnectionState, Notice, SessionObserver},
    protocol::{InboundMessage, OutboundKind, OutboundMessage},
    timer::Timer,
    transport::{Channel, ChannelWriter, Transport, TransportEvent, CLOSE_ABNORMAL},
    utils::{now_iso, request_id},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub symbol: String,
    pub policy: ReconnectPolicy,
}

enum Retry {
    Scheduled { attempt: u32, delay: Duration, generation: u64 },
    Exhausted,
}

struct Inner {
    state: ConnectionState,
    attempts: u32,
    // Bumped by every connect cycle and by disconnect; events and timers
    // tagged with an older generation are dropped.
    generation: u64,
    writer: Option<Box<dyn ChannelWriter>>,
    reconnect_timer: Option<Timer>,
    periodic: Vec<Timer>,
    rng: SmallRng,
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn SessionObserver>,
    inner: Mutex<Inner>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let inner = Inner {
            state: ConnectionState::Disconnected,
            attempts: 0,
            generation: 0,
            writer: None,
            reconnect_timer: None,
            periodic: Vec::new(),
            rng: SmallRng::seed_from_u64(rand::random()),
        };
        Self {
            shared: Arc::new(Shared { config, transport, observer, inner: Mutex::new(inner) }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.shared.inner.lock().attempts
    }

    /// Start a connect cycle. No-op while connecting or connected. A pending
    /// reconnect timer is cancelled; the new cycle replaces it.
    pub fn connect(&self) {
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Disconnected {
                return;
            }
            if let Some(t) = inner.reconnect_timer.take() {
                t.cancel();
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.writer = None;
            inner.generation
        };

        log::info!("ws.connect url={} generation={}", self.shared.config.url, generation);
        self.emit_state(ConnectionState::Connecting, "Connecting...");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_channel(generation).await;
        });
    }

    pub fn disconnect(&self) {
        let writer = {
            let mut inner = self.shared.inner.lock();
            if let Some(t) = inner.reconnect_timer.take() {
                t.cancel();
            }
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            inner.writer.take()
        };
        if let Some(w) = writer {
            w.close();
        }
        log::info!("ws.disconnect reason=client");
        self.emit_state(ConnectionState::Disconnected, "Disconnected");
    }

    /// The single outbound path. Returns false, without writing anything,
    /// unless the channel is connected.
    pub fn send(&self, kind: OutboundKind, payload: Map<String, Value>) -> bool {
        let outcome = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            match (inner.state, inner.writer.as_ref()) {
                (ConnectionState::Connected, Some(writer)) => {
                    let msg = OutboundMessage::new(kind, payload, request_id(&mut inner.rng));
                    let sent = msg.to_frame().and_then(|frame| writer.send_text(frame));
                    Some(sent.map(|()| msg.correlation_id))
                }
                _ => None,
            }
        };

        match outcome {
            None => {
                log::warn!("ws.send.not_connected type={}", kind.as_str());
                self.notice(Notice::error("Not connected to trading system"));
                false
            }
            Some(Err(e)) => {
                log::error!("ws.send.error type={} {}", kind.as_str(), e);
                self.notice(Notice::error("Failed to send message"));
                false
            }
            Some(Ok(request_id)) => {
                log::debug!("ws.send type={} request_id={}", kind.as_str(), request_id);
                true
            }
        }
    }

    pub fn start_periodic(&self, poll: Duration, heartbeat: Duration) {
        let poller = {
            let this = self.clone();
            Timer::every(poll, move || {
                let this = this.clone();
                async move {
                    if this.is_connected() {
                        this.send(OutboundKind::GetAccountInfo, Map::new());
                        this.send(OutboundKind::GetPositions, Map::new());
                    }
                }
            })
        };
        let pinger = {
            let this = self.clone();
            Timer::every(heartbeat, move || {
                let this = this.clone();
                async move {
                    if this.is_connected() {
                        let mut data = Map::new();
                        data.insert("timestamp".to_string(), json!(now_iso()));
                        this.send(OutboundKind::Ping, data);
                    }
                }
            })
        };

        let old = std::mem::replace(&mut self.shared.inner.lock().periodic, vec![poller, pinger]);
        for t in old {
            t.cancel();
        }
    }

    pub fn stop_periodic(&self) {
        let old = std::mem::take(&mut self.shared.inner.lock().periodic);
        for t in old {
            t.cancel();
        }
    }

    async fn run_channel(self, generation: u64) {
        let url = self.shared.config.url.clone();
        let Channel { writer, mut events } = match self.shared.transport.open(&url).await {
            Ok(ch) => ch,
            Err(e) => {
                self.on_open_failed(generation, &e.to_string());
                return;
            }
        };

        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                // Superseded while the handshake was in flight.
                writer.close();
                return;
            }
            inner.writer = Some(writer);
            inner.state = ConnectionState::Connected;
            inner.attempts = 0;
        }
        self.on_open();

        while let Some(ev) = events.recv().await {
            if !self.is_current(generation) {
                return;
            }
            match ev {
                TransportEvent::Message(raw) => self.on_message(&raw),
                TransportEvent::Closed { code, was_clean } => {
                    self.on_close(generation, code, was_clean);
                    return;
                }
            }
        }
        self.on_close(generation, CLOSE_ABNORMAL, false);
    }

    fn on_open(&self) {
        log::info!("ws.open url={}", self.shared.config.url);
        self.emit_state(ConnectionState::Connected, "Connected");
        self.notice(Notice::success("Connected to trading system"));

        let mut sub = Map::new();
        sub.insert("symbol".to_string(), json!(self.shared.config.symbol));
        self.send(OutboundKind::Subscribe, sub);
        self.send(OutboundKind::GetAccountInfo, Map::new());
        self.send(OutboundKind::GetPositions, Map::new());
        self.send(OutboundKind::GetOrderHistory, Map::new());
    }

    fn on_open_failed(&self, generation: u64, reason: &str) {
        let retry = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.writer = None;
            self.schedule_reconnect(&mut inner)
        };
        log::error!("ws.open.error url={} {}", self.shared.config.url, reason);
        self.emit_state(ConnectionState::Disconnected, "Connection Failed");
        self.notice(Notice::error(format!("WebSocket connection error: {reason}")));
        self.report_retry(retry);
    }

    fn on_close(&self, generation: u64, code: u16, was_clean: bool) {
        let retry = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.writer = None;
            (!was_clean).then(|| self.schedule_reconnect(&mut inner))
        };
        log::warn!("ws.close code={} clean={}", code, was_clean);
        self.emit_state(ConnectionState::Disconnected, "Disconnected");
        if let Some(retry) = retry {
            self.report_retry(retry);
        }
    }

    fn on_message(&self, raw: &str) {
        match InboundMessage::parse(raw) {
            Err(e) => {
                log::warn!("ws.message.parse_error {} len={}", e, raw.len());
                self.notice(Notice::error(format!("Error parsing message: {e}")));
            }
            Ok(InboundMessage::Unknown { kind }) => {
                log::debug!("ws.message.unknown type={}", kind);
            }
            Ok(msg) => {
                log::debug!("ws.message type={}", msg.kind());
                self.shared.observer.on_message(&msg);
            }
        }
    }

    // Runs under the same lock as the transition to Disconnected, so a
    // manual connect() cannot slip in between the decision and the timer.
    fn schedule_reconnect(&self, inner: &mut Inner) -> Retry {
        let policy = self.shared.config.policy;
        if inner.attempts >= policy.max_attempts {
            return Retry::Exhausted;
        }
        inner.attempts += 1;
        let attempt = inner.attempts;
        let delay = policy.delay_for(attempt);
        let generation = inner.generation;
        let this = self.clone();
        let timer = Timer::once(delay, move || async move {
            this.fire_reconnect(generation);
        });
        if let Some(old) = inner.reconnect_timer.replace(timer) {
            old.cancel();
        }
        Retry::Scheduled { attempt, delay, generation }
    }

    fn report_retry(&self, retry: Retry) {
        let max = self.shared.config.policy.max_attempts;
        match retry {
            Retry::Scheduled { attempt, delay, generation } => {
                if !self.is_current(generation) {
                    // A manual connect already replaced the pending retry.
                    return;
                }
                log::warn!(
                    "ws.reconnect attempt={}/{} delay_ms={}",
                    attempt,
                    max,
                    delay.as_millis()
                );
                // Display only; the state stays Disconnected until the timer fires.
                self.emit_state(
                    ConnectionState::Connecting,
                    &format!("Reconnecting... ({}/{})", attempt, max),
                );
            }
            Retry::Exhausted => {
                log::error!("ws.reconnect.exhausted max_attempts={}", max);
                self.emit_state(ConnectionState::Disconnected, "Connection Failed");
                self.notice(Notice::error("Failed to reconnect to trading system"));
            }
        }
    }

    fn fire_reconnect(&self, generation: u64) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            // Already running; forget the handle rather than aborting ourselves.
            inner.reconnect_timer = None;
        }
        self.connect();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.inner.lock().generation == generation
    }

    fn emit_state(&self, state: ConnectionState, status: &str) {
        self.shared.observer.on_state_change(state, status);
    }

    fn notice(&self, notice: Notice) {
        self.shared.observer.on_notice(&notice);
    }
}
