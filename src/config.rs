use crate::prelude::*;

use anyhow::Context;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,
    pub database: DatabaseConfig,
    pub pvoutput: Option<PvOutput>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    /// Bluetooth address of the inverter
    pub address: String,
    /// Host and port of the serial-over-TCP bridge fronting the
    /// inverter's RFCOMM channel
    pub host: String,
    pub port: u16,
    /// Bluetooth address of the local adapter behind the bridge
    #[serde(default = "Config::default_local_address")]
    pub local_address: String,
    pub serial: u32,

    #[serde(default = "Config::default_password")]
    pub password: String,

    pub logon_timeout: Option<u32>,
    pub read_timeout: Option<u64>,
    pub poll_interval: Option<u64>,
    /// Earliest date historic backfill will reach back to
    pub start_time: Option<String>,
}

impl Inverter {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn logon_timeout(&self) -> u32 {
        self.logon_timeout.unwrap_or(900) // 15 minutes
    }

    pub fn read_timeout(&self) -> u64 {
        self.read_timeout.unwrap_or(30)
    }

    pub fn poll_interval(&self) -> u64 {
        self.poll_interval.unwrap_or(300)
    }

    pub fn start_time(&self) -> &str {
        self.start_time.as_deref().unwrap_or("2013-01-01")
    }

    pub fn start_timestamp(&self) -> Result<i64> {
        let date = chrono::NaiveDate::parse_from_str(self.start_time(), "%Y-%m-%d")
            .with_context(|| format!("bad start_time {:?}", self.start_time()))?;
        let datetime = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("bad start_time {:?}", self.start_time()))?;
        match datetime.and_local_timezone(chrono::Local) {
            chrono::LocalResult::Single(dt) => Ok(dt.timestamp()),
            chrono::LocalResult::Ambiguous(dt, _) => Ok(dt.timestamp()),
            chrono::LocalResult::None => bail!("bad start_time {:?}", self.start_time()),
        }
    }
} // }}}

// DatabaseConfig {{{
#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

// PvOutput {{{
#[derive(Clone, Debug, Deserialize)]
pub struct PvOutput {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub api_key: String,
    pub system_id: String,

    #[serde(default = "Config::default_pvoutput_url")]
    pub url: String,
}

impl PvOutput {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

impl Config {
    pub fn new(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("error reading {}", file))?;
        let config: Self =
            serde_yaml::from_str(&content).with_context(|| format!("error parsing {}", file))?;
        Ok(config)
    }

    pub fn inverter(&self) -> &Inverter {
        &self.inverter
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.database
    }

    pub fn pvoutput(&self) -> Option<&PvOutput> {
        self.pvoutput.as_ref()
    }

    pub fn loglevel(&self) -> String {
        self.loglevel.clone()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_password() -> String {
        "0000".to_string()
    }

    fn default_local_address() -> String {
        "00:00:00:00:00:00".to_string()
    }

    fn default_pvoutput_url() -> String {
        "https://pvoutput.org".to_string()
    }
}
