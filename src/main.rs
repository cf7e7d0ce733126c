use std::io::Write;

use anyhow::Result;
use log::{error, info};

use sma_bridge::config::Config;
use sma_bridge::options::Options;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let config = Config::new(&options.config_file).unwrap_or_else(|err| {
        eprintln!("Failed to load config: {:?}", err);
        std::process::exit(255);
    });

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.loglevel()))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    info!("sma-bridge {} starting", CARGO_PKG_VERSION);

    if let Err(e) = sma_bridge::app(options, config).await {
        error!("{:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
