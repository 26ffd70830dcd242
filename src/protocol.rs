use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKind {
    Subscribe,
    GetAccountInfo,
    GetPositions,
    GetOrderHistory,
    Order,
    Ping,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Subscribe => "subscribe",
            OutboundKind::GetAccountInfo => "get_account_info",
            OutboundKind::GetPositions => "get_positions",
            OutboundKind::GetOrderHistory => "get_order_history",
            OutboundKind::Order => "order",
            OutboundKind::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: OutboundKind,
    pub payload: Map<String, Value>,
    pub issued_at: DateTime<Utc>,
    pub correlation_id: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a Map<String, Value>,
    timestamp: String,
    request_id: &'a str,
}

impl OutboundMessage {
    pub fn new(kind: OutboundKind, payload: Map<String, Value>, correlation_id: String) -> Self {
        Self { kind, payload, issued_at: Utc::now(), correlation_id }
    }

    pub fn to_frame(&self) -> Result<String> {
        let env = Envelope {
            kind: self.kind.as_str(),
            data: &self.payload,
            timestamp: self.issued_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: &self.correlation_id,
        };
        Ok(serde_json::to_string(&env)?)
    }
}

pub fn payload<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(m) => Ok(m),
        Value::Null => Ok(Map::new()),
        other => Err(ClientError::Parse(format!("payload must be an object, got {other}"))),
    }
}

// Missing, null, string-encoded or otherwise odd numbers read as 0.0.
fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    })
}

// Backends disagree on whether ids are strings or integers.
fn id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, got {other}"))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub last: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub bid: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub ask: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub volume: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub change: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub change_percent: f64,
}

impl MarketQuote {
    /// `+1.25 (0.03%)` / `-0.50 (-0.01%)`
    pub fn change_text(&self) -> String {
        let sign = if self.change >= 0.0 { "+" } else { "" };
        format!("{sign}{:.2} ({:.2}%)", self.change, self.change_percent)
    }
}

#[derive(Deserialize)]
struct WelcomeFrame {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct MarketDataFrame {
    symbol: String,
    #[serde(default)]
    data: MarketQuote,
}

#[derive(Deserialize)]
struct OrderUpdateFrame {
    #[serde(deserialize_with = "id_string")]
    order_id: String,
    status: String,
}

#[derive(Deserialize, Default)]
struct ConfirmationData {
    #[serde(default, deserialize_with = "opt_id_string")]
    order_id: Option<String>,
}

#[derive(Deserialize)]
struct OrderConfirmationFrame {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Option<ConfirmationData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Welcome { message: String },
    MarketData { symbol: String, quote: MarketQuote },
    OrderUpdate { order_id: String, status: String },
    PositionUpdate(Map<String, Value>),
    AccountUpdate(Map<String, Value>),
    OrderConfirmation { success: bool, order_id: Option<String>, message: Option<String> },
    Error { message: String },
    Unknown { kind: String },
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Welcome { .. } => "welcome",
            InboundMessage::MarketData { .. } => "market_data",
            InboundMessage::OrderUpdate { .. } => "order_update",
            InboundMessage::PositionUpdate(_) => "position_update",
            InboundMessage::AccountUpdate(_) => "account_update",
            InboundMessage::OrderConfirmation { .. } => "order_confirmation",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Unknown { kind } => kind,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(mut obj) = value else {
            return Err(ClientError::Parse("frame is not a JSON object".to_string()));
        };
        let kind = match obj.remove("type") {
            Some(Value::String(s)) => s,
            Some(other) => return Err(ClientError::Parse(format!("type must be a string, got {other}"))),
            None => return Err(ClientError::Parse("frame has no type".to_string())),
        };

        let msg = match kind.as_str() {
            "welcome" => {
                let f: WelcomeFrame = from_fields(&kind, obj)?;
                InboundMessage::Welcome { message: f.message }
            }
            "market_data" => {
                let f: MarketDataFrame = from_fields(&kind, obj)?;
                InboundMessage::MarketData { symbol: f.symbol, quote: f.data }
            }
            "order_update" => {
                let f: OrderUpdateFrame = from_fields(&kind, obj)?;
                InboundMessage::OrderUpdate { order_id: f.order_id, status: f.status }
            }
            "position_update" => InboundMessage::PositionUpdate(obj),
            "account_update" => InboundMessage::AccountUpdate(obj),
            "order_confirmation" => {
                let f: OrderConfirmationFrame = from_fields(&kind, obj)?;
                InboundMessage::OrderConfirmation {
                    success: f.status == "success",
                    order_id: f.data.unwrap_or_default().order_id,
                    message: f.message.filter(|m| !m.is_empty()),
                }
            }
            "error" => {
                let f: WelcomeFrame = from_fields(&kind, obj)?;
                InboundMessage::Error { message: f.message }
            }
            _ => InboundMessage::Unknown { kind },
        };
        Ok(msg)
    }
}

fn from_fields<T: for<'de> Deserialize<'de>>(kind: &str, obj: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(obj)).map_err(|e| ClientError::Parse(format!("{kind}: {e}")))
}
