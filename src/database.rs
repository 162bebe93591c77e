//! Database writer for the candle store.
//!
//! Handles:
//! - Connection pooling over TimescaleDB/PostgreSQL
//! - Transactional batch inserts with an idempotent conflict key
//! - Connectivity checks for health reporting

use crate::config::DatabaseConfig;
use crate::dxlink::CandleRecord;
use crate::errors::{FeederError, Result};
use crate::pipeline::CandleSink;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{types::ToSql, NoTls};
use tracing::{debug, info};

/// Prepared statement for inserting candles. Re-delivered rows under the
/// at-least-once contract hit the conflict key and are ignored.
const INSERT_CANDLE_SQL: &str = r#"
    INSERT INTO candle_data (
        event_symbol, event_time, time, sequence, count,
        open, high, low, close, volume, vwap,
        bid_volume, ask_volume, imp_volatility, open_interest, event_flags
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ON CONFLICT (event_symbol, time, sequence) DO NOTHING
"#;

/// Storage sink backed by a PostgreSQL connection pool.
pub struct DatabaseWriter {
    pool: Pool,
}

impl DatabaseWriter {
    /// Create a writer with a connection pool and verify connectivity.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pg_config = config.to_pool_config();

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(
            pg_config
                .get_pg_config()
                .map_err(|e| FeederError::config(format!("Invalid PG config: {e}")))?,
            NoTls,
            mgr_config,
        );

        let pool = Pool::builder(mgr)
            .max_size(config.pool_max)
            .wait_timeout(Some(Duration::from_secs(10)))
            .create_timeout(Some(Duration::from_secs(10)))
            .recycle_timeout(Some(Duration::from_secs(10)))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| FeederError::config(format!("Failed to create pool: {e}")))?;

        // Test connection
        let client = pool.get().await?;
        let _ = client.simple_query("SELECT 1").await?;
        info!("database connection pool established");

        Ok(Self { pool })
    }

    /// Ping the database to check connectivity.
    pub async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CandleSink for DatabaseWriter {
    /// Insert a batch inside one transaction. Any failure rolls the whole
    /// batch back so the flusher can requeue it intact; duplicate rows are
    /// skipped by the conflict key and simply not counted.
    async fn insert_batch(&self, records: &[CandleRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(INSERT_CANDLE_SQL).await?;

        let mut written = 0usize;
        for record in records {
            let params: &[&(dyn ToSql + Sync)] = &[
                &record.event_symbol,
                &record.event_time,
                &record.time,
                &record.sequence,
                &record.count,
                &record.open,
                &record.high,
                &record.low,
                &record.close,
                &record.volume,
                &record.vwap,
                &record.bid_volume,
                &record.ask_volume,
                &record.imp_volatility,
                &record.open_interest,
                &record.event_flags,
            ];
            written += transaction.execute(&statement, params).await? as usize;
        }

        transaction.commit().await?;
        debug!("inserted {written} of {} candles", records.len());
        Ok(written)
    }
}
