 use std::fmt;
 use std::str::FromStr;

 use serde::{Deserialize, Serialize};

 use crate::error::ValidationError;

 #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
 #[serde(rename_all = "lowercase")]
 pub enum Side {
     #[default]
     Buy,
     Sell,
 }

 impl Side {
     pub fn as_str(&self) -> &'static str {
         match self {
             Side::Buy => "buy",
             Side::Sell => "sell",
         }
     }
 }

 impl FromStr for Side {
     type Err = String;

     fn from_str(s: &str) -> Result<Self, Self::Err> {
         match s.trim().to_lowercase().as_str() {
             "buy" => Ok(Side::Buy),
             "sell" => Ok(Side::Sell),
             other => Err(format!("unknown side {other} (expected buy|sell)")),
         }
     }
 }

 impl fmt::Display for Side {
     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
         f.write_str(self.as_str())
     }
 }

 #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
 #[serde(rename_all = "snake_case")]
 pub enum OrderType {
     #[default]
     Market,
     Limit,
     Stop,
     StopLimit,
 }

 impl OrderType {
     pub fn as_str(&self) -> &'static str {
         match self {
             OrderType::Market => "market",
             OrderType::Limit => "limit",
             OrderType::Stop => "stop",
             OrderType::StopLimit => "stop_limit",
         }
     }

     pub fn needs_price(&self) -> bool {
         matches!(self, OrderType::Limit | OrderType::StopLimit)
     }

     pub fn needs_stop_price(&self) -> bool {
         matches!(self, OrderType::Stop | OrderType::StopLimit)
     }
 }

 impl FromStr for OrderType {
     type Err = String;

     fn from_str(s: &str) -> Result<Self, Self::Err> {
         match s.trim().to_lowercase().as_str() {
             "market" => Ok(OrderType::Market),
             "limit" => Ok(OrderType::Limit),
             "stop" => Ok(OrderType::Stop),
             "stop_limit" | "stop-limit" => Ok(OrderType::StopLimit),
             other => Err(format!(
                 "unknown order type {other} (expected market|limit|stop|stop_limit)"
             )),
         }
     }
 }

 impl fmt::Display for OrderType {
     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
         f.write_str(self.as_str())
     }
 }

 #[derive(Debug, Clone, Default)]
 pub struct OrderForm {
     pub symbol: String,
     pub side: Side,
     pub order_type: OrderType,
     pub quantity: Option<i64>,
     pub price: Option<f64>,
     pub stop_price: Option<f64>,
 }

 #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
 pub struct OrderRequest {
     pub symbol: String,
     pub side: Side,
     pub order_type: OrderType,
     pub quantity: u64,
     pub price: Option<f64>,
     pub stop_price: Option<f64>,
 }

 // Zero and NaN count as "not entered", same as an empty input box.
 fn entered(px: Option<f64>) -> Option<f64> {
     px.filter(|p| p.is_finite() && *p != 0.0)
 }

 impl OrderForm {
     pub fn validate(&self) -> Result<OrderRequest, ValidationError> {
         let symbol = self.symbol.trim();
         if symbol.is_empty() {
             return Err(ValidationError::MissingSymbol);
         }

         let quantity = match self.quantity {
             Some(q) if q > 0 => q as u64,
             _ => return Err(ValidationError::InvalidQuantity),
         };

         let price = entered(self.price);
         if self.order_type.needs_price() && price.is_none() {
             return Err(ValidationError::MissingPrice);
         }

         let stop_price = entered(self.stop_price);
         if self.order_type.needs_stop_price() && stop_price.is_none() {
             return Err(ValidationError::MissingStopPrice);
         }

         Ok(OrderRequest {
             symbol: symbol.to_string(),
             side: self.side,
             order_type: self.order_type,
             quantity,
             price,
             stop_price,
         })
     }
 }
