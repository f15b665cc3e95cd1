//! Minimal initiator: connects, logs on, subscribes to a couple of symbols,
//! and prints every event as it arrives. Point `FIX_HOST`/`FIX_PORT` at
//! `toy_gateway` (or a real PSX gateway) to try it, or override on the
//! command line.

use clap::Parser;
use psxfix::messages::MarketDataSubscription;
use psxfix::{ConnectionConfig, Event, PsxConnectorHandle};

/// Command-line overrides layered on top of the `FIX_*` environment
/// variables (spec.md §6); anything left unset falls through to `from_env`.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "FIX_HOST")]
    host: Option<String>,
    #[arg(long, env = "FIX_PORT")]
    port: Option<u16>,
    #[arg(long, env = "FIX_SENDER")]
    sender: Option<String>,
    #[arg(long, env = "FIX_TARGET")]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let cfg = ConnectionConfig::from_env().unwrap_or_else(|_| {
        eprintln!("FIX_* env vars not set; falling back to the local toy_gateway defaults");
        ConnectionConfig::builder()
            .host(cli.host.unwrap_or_else(|| "127.0.0.1".to_string()))
            .port(cli.port.unwrap_or(9876))
            .sender_comp_id(cli.sender.unwrap_or_else(|| "realtime".to_string()))
            .target_comp_id(cli.target.unwrap_or_else(|| "NMDUFISQ0001".to_string()))
            .heartbeat_interval_secs(30)
            .reset_on_logon(true)
            .build()
            .expect("default config is valid")
    });

    let handle = PsxConnectorHandle::connect(cfg).await?;
    let mut events = handle.subscribe();

    tokio::spawn({
        let handle = handle.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            println!("shutting down");
            let _ = handle.shutdown().await;
        }
    });

    loop {
        match events.recv().await {
            Ok(Event::Logon) => {
                println!("logged in; requesting LUCK/OGDC market data");
                let sub = MarketDataSubscription::snapshot_plus_updates(vec![
                    "LUCK".to_string(),
                    "OGDC".to_string(),
                ]);
                let _ = handle.request_market_data(sub).await;
            }
            Ok(Event::MarketData { symbol, items }) => {
                println!("market data for {symbol}: {items:?}");
            }
            Ok(Event::TradingSessionStatus(info)) => {
                println!("trading session status: {info:?}");
            }
            Ok(Event::SecurityList { entries, .. }) => {
                println!("security list: {} entries", entries.len());
            }
            Ok(Event::Disconnected { reason }) => {
                println!("disconnected: {reason:?}");
            }
            Ok(Event::Error { message }) => {
                println!("error: {message}");
            }
            Ok(other) => {
                println!("{other:?}");
            }
            Err(err) => {
                println!("event stream closed: {err}");
                break;
            }
        }
    }

    Ok(())
}
