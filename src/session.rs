use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::{
    config::Settings,
    connection::{ConnectionConfig, ConnectionManager, ReconnectPolicy},
    error::{ClientError, Result},
    gateway::RequestGateway,
    observer::{ConnectionState, Notice, SessionObserver},
    order::OrderForm,
    protocol::{payload, InboundMessage, MarketQuote, OutboundKind},
    transport::{Transport, WsTransport},
    utils::today_ymd,
};

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub status: String,
    pub quotes: HashMap<String, MarketQuote>,
    pub account: Option<Value>,
    pub positions: Option<Value>,
    pub orders: Option<Value>,
    pub last_account_update: Option<Map<String, Value>>,
    pub last_position_update: Option<Map<String, Value>>,
}

impl SessionSnapshot {
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.quotes.get(symbol).map(|q| q.last)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderRoute {
    PushChannel,
    Http(Value),
}

#[derive(Debug, Clone)]
pub struct TradeExport {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

struct Dispatcher {
    host: Arc<dyn SessionObserver>,
    snapshot: RwLock<SessionSnapshot>,
    quote_arrived: Notify,
}

impl Dispatcher {
    fn notice(&self, notice: Notice) {
        self.host.on_notice(&notice);
    }
}

impl SessionObserver for Dispatcher {
    fn on_state_change(&self, state: ConnectionState, status: &str) {
        {
            let mut snap = self.snapshot.write();
            snap.state = state;
            snap.status = status.to_string();
        }
        self.host.on_state_change(state, status);
    }

    fn on_message(&self, msg: &InboundMessage) {
        match msg {
            InboundMessage::Welcome { message } => {
                log::info!("session.welcome {}", message);
                self.notice(Notice::info(message.clone()));
            }
            InboundMessage::MarketData { symbol, quote } => {
                self.snapshot.write().quotes.insert(symbol.clone(), quote.clone());
                self.quote_arrived.notify_waiters();
            }
            InboundMessage::OrderUpdate { order_id, status } => {
                log::info!("session.order_update order_id={} status={}", order_id, status);
                self.notice(Notice::info(format!("Order {order_id}: {status}")));
            }
            InboundMessage::PositionUpdate(fields) => {
                self.snapshot.write().last_position_update = Some(fields.clone());
            }
            InboundMessage::AccountUpdate(fields) => {
                self.snapshot.write().last_account_update = Some(fields.clone());
            }
            InboundMessage::OrderConfirmation { success: true, order_id, .. } => {
                let id = order_id.as_deref().unwrap_or("Unknown ID");
                log::info!("session.order_confirmed order_id={}", id);
                self.notice(Notice::success(format!("Order placed successfully: {id}")));
            }
            InboundMessage::OrderConfirmation { success: false, message, .. } => {
                let reason = message.as_deref().unwrap_or("Unknown error");
                log::warn!("session.order_rejected {}", reason);
                self.notice(Notice::error(format!("Order failed: {reason}")));
            }
            InboundMessage::Error { message } => {
                log::error!("session.server_error {}", message);
                self.notice(Notice::error(format!("Error: {message}")));
            }
            InboundMessage::Unknown { .. } => {}
        }
        self.host.on_message(msg);
    }

    fn on_notice(&self, notice: &Notice) {
        self.host.on_notice(notice);
    }

    fn on_call_result(&self, endpoint: &str, outcome: std::result::Result<(), &ClientError>) {
        self.host.on_call_result(endpoint, outcome);
    }
}

pub struct TradingSession {
    settings: Settings,
    connection: ConnectionManager,
    gateway: RequestGateway,
    dispatcher: Arc<Dispatcher>,
}

impl TradingSession {
    pub fn new(settings: Settings, observer: Arc<dyn SessionObserver>) -> Result<Self> {
        let transport = Arc::new(WsTransport::new(settings.ws_connect_timeout()));
        Self::with_transport(settings, transport, observer)
    }

    pub fn with_transport(
        settings: Settings,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher {
            host: observer,
            snapshot: RwLock::new(SessionSnapshot {
                status: "Disconnected".to_string(),
                ..SessionSnapshot::default()
            }),
            quote_arrived: Notify::new(),
        });
        let config = ConnectionConfig {
            url: settings.ws_url.clone(),
            symbol: settings.market_symbol.clone(),
            policy: ReconnectPolicy {
                max_attempts: settings.max_reconnect_attempts,
                base_delay: settings.reconnect_delay(),
            },
        };
        let connection = ConnectionManager::new(config, transport, dispatcher.clone());
        let gateway = RequestGateway::new(&settings.api_base, settings.http_timeout(), dispatcher.clone())?;
        Ok(Self { settings, connection, gateway, dispatcher })
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.dispatcher.snapshot.read().clone()
    }

    pub async fn wait_for_quote(&self, symbol: &str, timeout: Duration) -> Option<MarketQuote> {
        let wait = async {
            loop {
                let notified = self.dispatcher.quote_arrived.notified();
                let quote = self.dispatcher.snapshot.read().quotes.get(symbol).cloned();
                if let Some(q) = quote {
                    return q;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    pub async fn start(&self) {
        log::info!(
            "session.start api={} ws={} symbol={}",
            self.settings.api_base,
            self.settings.ws_url,
            self.settings.market_symbol
        );
        self.connection.connect();
        if let Err(e) = self.load_initial_data().await {
            log::error!("session.initial_load.error {}", e);
        }
        self.connection
            .start_periodic(self.settings.poll_interval(), self.settings.heartbeat_interval());
    }

    pub async fn load_initial_data(&self) -> Result<()> {
        let account = self.gateway.account_info().await?;
        self.dispatcher.snapshot.write().account = Some(account);

        let positions = self.gateway.positions().await?;
        self.dispatcher.snapshot.write().positions = Some(positions);

        let orders = self.gateway.order_history(self.settings.order_history_limit).await?;
        self.dispatcher.snapshot.write().orders = Some(orders);
        Ok(())
    }

    pub async fn refresh_data(&self) {
        log::info!("session.refresh");
        if let Err(e) = self.load_initial_data().await {
            log::error!("session.refresh.error {}", e);
        }
        self.dispatcher.notice(Notice::info("Data refreshed"));
    }

    /// Validate, then send on the push channel, falling back to HTTP when
    /// the channel is not connected or the write fails.
    pub async fn place_order(&self, form: &OrderForm) -> Result<OrderRoute> {
        let order = match form.validate() {
            Ok(o) => o,
            Err(e) => {
                log::warn!("order.invalid {}", e);
                self.dispatcher.notice(Notice::error(e.to_string()));
                return Err(e.into());
            }
        };

        if self.connection.send(OutboundKind::Order, payload(&order)?) {
            log::info!(
                "order.sent route=ws symbol={} side={} type={} qty={}",
                order.symbol,
                order.side,
                order.order_type,
                order.quantity
            );
            return Ok(OrderRoute::PushChannel);
        }

        match self.gateway.place_order(&order).await {
            Ok(body) => {
                log::info!("order.sent route=http symbol={} side={}", order.symbol, order.side);
                self.dispatcher.notice(Notice::success("Order placed successfully"));
                Ok(OrderRoute::Http(body))
            }
            Err(e) => {
                self.dispatcher.notice(Notice::error(format!("Order failed: {e}")));
                Err(e)
            }
        }
    }

    pub async fn close_all_positions(&self) -> Result<()> {
        match self.gateway.close_all_positions().await {
            Ok(_) => {
                self.dispatcher.notice(Notice::success("All positions closed"));
                Ok(())
            }
            Err(e) => {
                self.dispatcher.notice(Notice::error("Failed to close positions"));
                Err(e)
            }
        }
    }

    pub async fn cancel_all_orders(&self) -> Result<()> {
        match self.gateway.cancel_all_orders().await {
            Ok(_) => {
                self.dispatcher.notice(Notice::success("All orders cancelled"));
                Ok(())
            }
            Err(e) => {
                self.dispatcher.notice(Notice::error("Failed to cancel orders"));
                Err(e)
            }
        }
    }

    pub async fn export_trades(&self) -> Result<TradeExport> {
        match self.gateway.export_orders().await {
            Ok(bytes) => {
                self.dispatcher.notice(Notice::success("Trades exported successfully"));
                Ok(TradeExport { file_name: format!("trades_{}.csv", today_ymd()), bytes })
            }
            Err(e) => {
                self.dispatcher.notice(Notice::error("Failed to export trades"));
                Err(e)
            }
        }
    }

    pub fn shutdown(&self) {
        self.connection.stop_periodic();
        self.connection.disconnect();
        log::info!("session.shutdown");
    }
}
