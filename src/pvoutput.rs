//! Client for the pvoutput.org r2 upload API.

use crate::prelude::*;

use chrono::{Local, TimeZone};

/// addbatchstatus accepts at most this many readings per request.
const BATCH_LIMIT: usize = 30;

pub struct PvOutput {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    system_id: String,
}

impl PvOutput {
    pub fn new(config: &config::PvOutput) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.url().trim_end_matches('/').to_string(),
            api_key: config.api_key().to_string(),
            system_id: config.system_id().to_string(),
        }
    }

    async fn request(&self, script: &str, params: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{}", self.base_url, script);
        let response = self
            .client
            .post(&url)
            .header("X-Pvoutput-Apikey", &self.api_key)
            .header("X-Pvoutput-SystemId", &self.system_id)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("pvoutput request {} failed: {} ({})", script, status, body.trim());
        }
        Ok(body)
    }

    /// Uploads a single cumulative energy reading.
    pub async fn add_status(&self, timestamp: i64, total_yield: i64) -> Result<()> {
        let (date, time) = format_datetime(timestamp)?;
        debug!("uploading {} {} = {} Wh", date, time, total_yield);
        self.request(
            "/service/r2/addstatus.jsp",
            &[
                ("d", date),
                ("t", time),
                ("v1", total_yield.to_string()),
                ("c1", "1".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Uploads cumulative energy readings, splitting into requests of
    /// at most the service's batch limit.
    pub async fn add_batch_status(&self, readings: &[(i64, i64)]) -> Result<()> {
        for chunk in readings.chunks(BATCH_LIMIT) {
            let data = chunk
                .iter()
                .map(|&(timestamp, total_yield)| {
                    let (date, time) = format_datetime(timestamp)?;
                    Ok(format!("{},{},{}", date, time, total_yield))
                })
                .collect::<Result<Vec<_>>>()?
                .join(";");

            debug!("uploading batch of {} readings", chunk.len());
            self.request(
                "/service/r2/addbatchstatus.jsp",
                &[("data", data), ("c1", "1".to_string())],
            )
            .await?;
        }
        Ok(())
    }
}

fn format_datetime(timestamp: i64) -> Result<(String, String)> {
    let dt = Local
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| anyhow!("timestamp {} out of range", timestamp))?;
    Ok((
        dt.format("%Y%m%d").to_string(),
        dt.format("%H:%M").to_string(),
    ))
}
