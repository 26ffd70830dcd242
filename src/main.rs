mod config;
mod connection;
mod error;
mod gateway;
mod observer;
mod order;
mod protocol;
mod session;
mod timer;
mod transport;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    config::{derive_ws_url, Settings},
    error::ClientError,
    observer::{ConnectionState, Notice, NoticeLevel, SessionObserver},
    order::{OrderForm, OrderType, Side},
    protocol::InboundMessage,
    session::{OrderRoute, TradingSession},
};

#[derive(Debug, Parser)]
#[command(name = "tradedesk", version)]
struct Cli {
    /// Override API_BASE (http[s]://host:port)
    #[arg(long)]
    api_base: Option<String>,

    /// Override WS_URL (defaults to API_BASE with ws scheme and /ws path)
    #[arg(long)]
    ws_url: Option<String>,

    /// Override MARKET_SYMBOL
    #[arg(long)]
    symbol: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stay connected and print live notices until Ctrl-C (default)
    Watch,
    /// Print account info
    Account,
    /// Print open positions
    Positions,
    /// Reload account, positions and orders, wait for a quote and print a summary
    Snapshot,
    /// Print recent orders
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Validate and place an order (HTTP fallback when the push channel is down)
    Place {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        side: Side,
        #[arg(long = "type", default_value = "market")]
        order_type: OrderType,
        #[arg(long)]
        quantity: i64,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        stop_price: Option<f64>,
    },
    /// Cancel every open order
    CancelAll,
    /// Flatten every open position
    CloseAll,
    /// Download the order history as CSV
    Export {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_state_change(&self, state: ConnectionState, status: &str) {
        println!("[{}] {}", state, status);
    }

    fn on_message(&self, msg: &InboundMessage) {
        if let InboundMessage::MarketData { symbol, quote } = msg {
            println!(
                "{} {:.2} {}  bid {:.2} / ask {:.2}  vol {}",
                symbol,
                quote.last,
                quote.change_text(),
                quote.bid,
                quote.ask,
                quote.volume
            );
        }
    }

    fn on_notice(&self, notice: &Notice) {
        match notice.level {
            NoticeLevel::Error => eprintln!("[{}] {}", notice.level.as_str(), notice.message),
            _ => println!("[{}] {}", notice.level.as_str(), notice.message),
        }
    }

    fn on_call_result(&self, endpoint: &str, outcome: std::result::Result<(), &ClientError>) {
        if let Err(e) = outcome {
            log::debug!("cli.call_failed endpoint={} kind={}", endpoint, e.kind());
        }
    }
}

fn print_json(v: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(base) = cli.api_base {
        settings.api_base = base.trim_end_matches('/').to_string();
        settings.ws_url = derive_ws_url(&settings.api_base)?;
    }
    if let Some(ws) = cli.ws_url {
        settings.ws_url = ws;
    }
    if let Some(sym) = cli.symbol {
        settings.market_symbol = sym.to_uppercase();
    }
    settings.validate()?;

    log::info!(
        "app.start api={} ws={} symbol={} max_reconnect_attempts={} reconnect_delay_ms={}",
        settings.api_base,
        settings.ws_url,
        settings.market_symbol,
        settings.max_reconnect_attempts,
        settings.reconnect_delay_ms
    );

    let history_limit = settings.order_history_limit;
    let symbol = settings.market_symbol.clone();
    let quote_wait = settings.ws_connect_timeout();
    let session = TradingSession::new(settings, Arc::new(ConsoleObserver))?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => {
            session.start().await;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            log::info!(
                "app.stop state={} reconnect_attempts={} pending_http={}",
                session.connection().state(),
                session.connection().attempts(),
                session.gateway().pending_count()
            );
            session.shutdown();
        }
        Command::Snapshot => {
            session.connection().connect();
            session.refresh_data().await;
            let quote = session.wait_for_quote(&symbol, quote_wait).await;
            if quote.is_none() {
                log::warn!("snapshot.no_quote symbol={} waited_ms={}", symbol, quote_wait.as_millis());
            }
            session.shutdown();
            let snap = session.snapshot();
            let summary = serde_json::json!({
                "symbol": symbol,
                "last_price": snap.last_price(&symbol),
                "change": quote.map(|q| q.change_text()),
                "account": snap.account,
                "positions": snap.positions,
                "orders": snap.orders,
            });
            print_json(&summary)?;
        }
        Command::Account => print_json(&session.gateway().account_info().await?)?,
        Command::Positions => print_json(&session.gateway().positions().await?)?,
        Command::History { limit } => {
            print_json(&session.gateway().order_history(limit.unwrap_or(history_limit)).await?)?
        }
        Command::Place { symbol, side, order_type, quantity, price, stop_price } => {
            let form = OrderForm {
                symbol,
                side,
                order_type,
                quantity: Some(quantity),
                price,
                stop_price,
            };
            match session.place_order(&form).await? {
                OrderRoute::Http(body) => print_json(&body)?,
                OrderRoute::PushChannel => println!("order sent on push channel"),
            }
        }
        Command::CancelAll => session.cancel_all_orders().await?,
        Command::CloseAll => session.close_all_positions().await?,
        Command::Export { out_dir } => {
            let export = session.export_trades().await?;
            let dest = out_dir.join(&export.file_name);
            std::fs::write(&dest, &export.bytes)
                .with_context(|| format!("writing {}", dest.display()))?;
            println!("wrote {} ({} bytes)", dest.display(), export.bytes.len());
        }
    }
    Ok(())
}
