//! The daemon mode: polls the inverter on an interval, stores readings
//! and pushes deltas to pvoutput.org.

use crate::prelude::*;

use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

use crate::pvoutput::PvOutput;
use crate::sma::connection::Connection;

const RECONNECT_DELAY_SECS: u64 = 5; // Delay before reconnection attempts

pub struct Coordinator {
    config: Config,
    database: Database,
}

impl Coordinator {
    pub fn new(config: Config, database: Database) -> Self {
        Self { config, database }
    }

    pub async fn start(&self) -> Result<()> {
        loop {
            if let Err(e) = self.poll_loop().await {
                error!("inverter {}: {:?}", self.config.inverter().serial(), e);
                info!(
                    "inverter {}: reconnecting in {}s",
                    self.config.inverter().serial(),
                    RECONNECT_DELAY_SECS
                );
                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        }
    }

    async fn poll_loop(&self) -> Result<()> {
        let mut sma = crate::connect(&self.config).await?;

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.inverter().poll_interval()));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.poll(&mut sma).await?;

            if let Err(e) = self.upload().await {
                // the inverter link is still fine, retry next tick
                warn!("pvoutput upload failed: {:?}", e);
            }
        }
    }

    async fn poll(&self, sma: &mut Connection<TcpStream>) -> Result<()> {
        let serial = self.config.inverter().serial();

        let reading = sma.total_yield().await?;
        info!(
            "inverter {}: total yield {} Wh at {}",
            serial,
            reading.value,
            crate::format_time(i64::from(reading.timestamp))
        );
        self.database
            .add_historic(serial, i64::from(reading.timestamp), i64::from(reading.value))
            .await?;

        // backfill everything newer than what is already stored
        let from = match self.database.get_last_historic(serial).await? {
            Some(latest) => latest + 1,
            None => self.config.inverter().start_timestamp()?,
        };
        let to = chrono::Utc::now().timestamp();
        if from < to {
            let points = sma.historic(from as u32, to as u32).await?;
            for point in &points {
                self.database
                    .add_historic(serial, i64::from(point.timestamp), i64::from(point.value))
                    .await?;
            }
            info!("inverter {}: stored {} historic samples", serial, points.len());
        }

        Ok(())
    }

    async fn upload(&self) -> Result<()> {
        let Some(pvoutput) = self.config.pvoutput() else {
            return Ok(());
        };
        if !pvoutput.enabled() {
            return Ok(());
        }

        let serial = self.config.inverter().serial();
        let api = PvOutput::new(pvoutput);

        let hwm = match self.database.pvoutput_get_hwm(serial).await? {
            Some(hwm) => hwm,
            None => {
                // first run: prime the high-water mark at the newest
                // sample rather than replaying the whole history
                if let Some(last) = self.database.get_last_entry(serial).await? {
                    info!("priming pvoutput high-water mark at {}", last.timestamp);
                    self.database.pvoutput_set_hwm(serial, last.timestamp).await?;
                }
                return Ok(());
            }
        };

        let entries = self
            .database
            .get_entries_younger_than(serial, hwm.timestamp)
            .await?;
        if entries.is_empty() {
            return Ok(());
        }

        let readings: Vec<(i64, i64)> = entries
            .iter()
            .map(|entry| (entry.timestamp, entry.total_yield))
            .collect();
        api.add_batch_status(&readings).await?;

        let newest = readings[readings.len() - 1].0;
        self.database.pvoutput_set_hwm(serial, newest).await?;
        info!(
            "uploaded {} readings to pvoutput, high-water mark now {}",
            readings.len(),
            newest
        );
        Ok(())
    }
}
