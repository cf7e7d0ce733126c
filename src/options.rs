use clap::{Parser, Subcommand};

/// SMA Bridge - reads production data from Bluetooth-enabled SMA inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print total generation to date
    Total,

    /// Print generation so far today
    Daily,

    /// Print the radio signal strength of the inverter link
    Signal,

    /// Fetch fine-grained historic generation
    Historic {
        /// Start date (YYYY-MM-DD), defaults to the configured start time
        from: Option<String>,
        /// End date (YYYY-MM-DD), defaults to now
        to: Option<String>,
    },

    /// Fetch daily historic generation
    HistoricDaily {
        /// Start date (YYYY-MM-DD), defaults to the configured start time
        from: Option<String>,
        /// End date (YYYY-MM-DD), defaults to now
        to: Option<String>,
    },

    /// Set the inverter clock from the local clock
    SetTime,

    /// Poll the inverter on an interval, storing and uploading readings
    Daemon,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
