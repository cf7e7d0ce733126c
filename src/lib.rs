pub mod config;      // Configuration management
pub mod coordinator; // Daemon poll loop
pub mod database;    // Generation sample storage
pub mod options;     // Command line options parsing
pub mod prelude;     // Common imports and types
pub mod pvoutput;    // pvoutput.org upload client
pub mod sma;         // SMA Bluetooth protocol implementation

use crate::prelude::*;

use anyhow::Context;
use chrono::{Local, TimeZone};
use tokio::net::TcpStream;

use crate::options::Command;
use crate::sma::connection::Connection;
use crate::sma::packet::LinkAddr;

/// Opens a fully established session: TCP connect, hello handshake,
/// logon.
pub async fn connect(config: &Config) -> Result<Connection<TcpStream>> {
    let inverter = config.inverter();
    let remote = LinkAddr::from_str(inverter.address())?;
    let local = LinkAddr::from_str(inverter.local_address())?;

    let mut sma = Connection::connect(inverter.host(), inverter.port(), remote, local).await?;
    sma.set_timeout(Duration::from_secs(inverter.read_timeout()));

    sma.hello().await?;
    sma.logon(inverter.password(), inverter.logon_timeout())
        .await?;

    Ok(sma)
}

pub fn format_time(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("@{}", timestamp),
    }
}

fn parse_date(date: &str) -> Result<i64> {
    let date = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("bad date {:?}", date))?;
    let datetime = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("bad date {:?}", date))?;
    match datetime.and_local_timezone(Local) {
        chrono::LocalResult::Single(dt) => Ok(dt.timestamp()),
        chrono::LocalResult::Ambiguous(dt, _) => Ok(dt.timestamp()),
        chrono::LocalResult::None => bail!("bad date {:?}", date),
    }
}

fn historic_range(
    config: &Config,
    from: Option<String>,
    to: Option<String>,
) -> Result<(u32, u32)> {
    let from = match from {
        Some(date) => parse_date(&date)?,
        None => config.inverter().start_timestamp()?,
    };
    let to = match to {
        Some(date) => parse_date(&date)?,
        None => chrono::Utc::now().timestamp(),
    };
    Ok((from as u32, to as u32))
}

pub async fn app(options: Options, config: Config) -> Result<()> {
    match options.command {
        Command::Total => {
            let mut sma = connect(&config).await?;
            let reading = sma.total_yield().await?;
            println!(
                "{}: Total generation to-date {} Wh",
                format_time(i64::from(reading.timestamp)),
                reading.value
            );
        }

        Command::Daily => {
            let mut sma = connect(&config).await?;
            let reading = sma.daily_yield().await?;
            println!(
                "{}: Daily generation {} Wh",
                format_time(i64::from(reading.timestamp)),
                reading.value
            );
        }

        Command::Signal => {
            let mut sma = connect(&config).await?;
            let signal = sma.signal_strength().await?;
            println!("Signal strength {:.0}%", signal * 100.0);
        }

        Command::Historic { from, to } => {
            let (from, to) = historic_range(&config, from, to)?;
            let mut sma = connect(&config).await?;
            for point in sma.historic(from, to).await? {
                println!(
                    "[{}] {}: Total generation {} Wh",
                    point.timestamp,
                    format_time(i64::from(point.timestamp)),
                    point.value
                );
            }
        }

        Command::HistoricDaily { from, to } => {
            let (from, to) = historic_range(&config, from, to)?;
            let mut sma = connect(&config).await?;
            for point in sma.historic_daily(from, to).await? {
                println!(
                    "[{}] {}: Total generation {} Wh",
                    point.timestamp,
                    format_time(i64::from(point.timestamp)),
                    point.value
                );
            }
        }

        Command::SetTime => {
            let mut sma = connect(&config).await?;
            let now = Local::now();
            let tzoffset = (now.offset().local_minus_utc() / 60) as i16 as u16;
            sma.set_time(now.timestamp() as u32, tzoffset).await?;
            println!("Inverter clock set to {}", now.format("%Y-%m-%d %H:%M:%S"));
        }

        Command::Daemon => {
            let database = Database::connect(config.database().url()).await?;
            let coordinator = coordinator::Coordinator::new(config, database);

            tokio::select! {
                res = coordinator.start() => res?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
        }
    }

    Ok(())
}
