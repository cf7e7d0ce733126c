use crate::prelude::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};

/// One stored generation sample.
#[derive(Clone, Copy, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct Reading {
    pub timestamp: i64,
    pub total_yield: i64,
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("initializing database");

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("db/migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Historic re-fetches overlap what is already stored; replayed
    /// samples are silently dropped.
    pub async fn add_historic(&self, serial: u32, timestamp: i64, total_yield: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO generation (inverter_serial, timestamp, total_yield) \
             VALUES (?, ?, ?)",
        )
        .bind(i64::from(serial))
        .bind(timestamp)
        .bind(total_yield)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_entry(&self, serial: u32, timestamp: i64) -> Result<Option<Reading>> {
        let entry = sqlx::query_as::<_, Reading>(
            "SELECT timestamp, total_yield FROM generation \
             WHERE inverter_serial = ? AND timestamp = ?",
        )
        .bind(i64::from(serial))
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn get_last_entry(&self, serial: u32) -> Result<Option<Reading>> {
        let entry = sqlx::query_as::<_, Reading>(
            "SELECT timestamp, total_yield FROM generation \
             WHERE inverter_serial = ? \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(i64::from(serial))
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Timestamp of the newest stored sample, if any.
    pub async fn get_last_historic(&self, serial: u32) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT max(timestamp) AS latest FROM generation WHERE inverter_serial = ?",
        )
        .bind(i64::from(serial))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("latest")?)
    }

    pub async fn get_entries_younger_than(
        &self,
        serial: u32,
        timestamp: i64,
    ) -> Result<Vec<Reading>> {
        let entries = sqlx::query_as::<_, Reading>(
            "SELECT timestamp, total_yield FROM generation \
             WHERE inverter_serial = ? AND timestamp > ? \
             ORDER BY timestamp ASC",
        )
        .bind(i64::from(serial))
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// The sample the upload high-water mark points at.
    pub async fn pvoutput_get_hwm(&self, serial: u32) -> Result<Option<Reading>> {
        let row = sqlx::query("SELECT hwm FROM pvoutput WHERE inverter_serial = ?")
            .bind(i64::from(serial))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => match row.try_get::<Option<i64>, _>("hwm")? {
                Some(hwm) => self.get_entry(serial, hwm).await,
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub async fn pvoutput_set_hwm(&self, serial: u32, hwm: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO pvoutput (inverter_serial, hwm) VALUES (?, ?) \
             ON CONFLICT (inverter_serial) DO UPDATE SET hwm = excluded.hwm",
        )
        .bind(i64::from(serial))
        .bind(hwm)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
