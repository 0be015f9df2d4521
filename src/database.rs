use crate::prelude::*;
use crate::coordinator::BridgeStats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelData {
    StateChanged(ChannelAddress, PersistedChannelState),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

/// What survives a restart for one channel: `{"status":"5"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChannelState {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl PersistedChannelState {
    pub fn new(state: ChannelState) -> Self {
        Self {
            status: state.status(),
            value: None,
        }
    }

    pub fn state(&self) -> Option<ChannelState> {
        ChannelState::from_status(&self.status).ok()
    }
}

// StateStore {{{
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_raw(&self, addr: &ChannelAddress) -> Result<Option<String>>;

    async fn save_raw(&self, addr: &ChannelAddress, value: &str) -> Result<()>;

    async fn load(&self, addr: &ChannelAddress) -> Result<Option<PersistedChannelState>> {
        match self.load_raw(addr).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .map_err(|err| anyhow!("stored state for {} is malformed: {}", addr, err))?,
            )),
            None => Ok(None),
        }
    }

    async fn save(&self, addr: &ChannelAddress, state: &PersistedChannelState) -> Result<()> {
        self.save_raw(addr, &serde_json::to_string(state)?).await
    }
}

/// Used when no database is configured; state is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_raw(&self, addr: &ChannelAddress) -> Result<Option<String>> {
        Ok(self.values().get(&addr.to_string()).cloned())
    }

    async fn save_raw(&self, addr: &ChannelAddress, value: &str) -> Result<()> {
        self.values().insert(addr.to_string(), value.to_owned());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("db/migrations/sqlite").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load_raw(&self, addr: &ChannelAddress) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM channel_state WHERE addr = ?")
            .bind(addr.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    async fn save_raw(&self, addr: &ChannelAddress, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_state (addr, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(addr) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(addr.to_string())
        .bind(value)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub async fn open_store(config: &ConfigWrapper) -> Result<Arc<dyn StateStore>> {
    match config.enabled_database() {
        Some(db) => {
            info!("opening channel state database {}", db.url());
            Ok(Arc::new(SqliteStore::connect(db.url()).await?))
        }
        None => {
            info!("no database configured, channel state kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
} // }}}

/// Writes channel state changes coming from the reader loops.
#[derive(Clone)]
pub struct Database {
    channels: Channels,
    store: Arc<dyn StateStore>,
    shared_stats: Arc<Mutex<BridgeStats>>,
}

impl Database {
    pub fn new(channels: Channels, store: Arc<dyn StateStore>, shared_stats: Arc<Mutex<BridgeStats>>) -> Self {
        Self {
            channels,
            store,
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        info!("database writer starting");

        self.inserter().await?;

        info!("database loop exiting");

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_database.send(ChannelData::Shutdown);
    }

    async fn inserter(&self) -> Result<()> {
        let mut receiver = self.channels.to_database.subscribe();

        loop {
            use ChannelData::*;

            let (addr, state) = match receiver.recv().await {
                Ok(Shutdown) => break,
                Ok(StateChanged(addr, state)) => (addr, state),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("database writer lagged, {} state updates dropped", n);
                    continue;
                }
                Err(err) => bail!("to_database closed: {}", err),
            };

            let max_retries = 3;
            let mut retry_count = 0;
            let mut backoff = 1;

            while retry_count < max_retries {
                match self.store.save(&addr, &state).await {
                    Ok(_) => {
                        debug!("stored {} = {:?}", addr, state);
                        self.stats().database_writes += 1;
                        break;
                    }
                    Err(err) => {
                        error!("storing {} failed: {:?} - retrying in {}s", addr, err, backoff);
                        self.stats().database_errors += 1;
                        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                        retry_count += 1;
                        backoff *= 2;
                    }
                }
            }

            if retry_count == max_retries {
                error!("Failed to store {} after {} retries", addr, max_retries);
            }
        }

        Ok(())
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, BridgeStats> {
        self.shared_stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> ChannelAddress {
        ChannelAddress::from_str("ch:m1:2").unwrap()
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryStore::new();

        assert_eq!(store.load(&addr()).await.unwrap(), None);

        store
            .save(&addr(), &PersistedChannelState::new(ChannelState::On))
            .await
            .unwrap();
        assert_eq!(store.load_raw(&addr()).await.unwrap().as_deref(), Some(r#"{"status":"5"}"#));
        assert_eq!(
            store.load(&addr()).await.unwrap().and_then(|s| s.state()),
            Some(ChannelState::On)
        );
    }

    #[tokio::test]
    async fn malformed_value() {
        let store = MemoryStore::new();
        store.save_raw(&addr(), "{status: 5").await.unwrap();

        assert!(store.load(&addr()).await.is_err());
    }

    #[test]
    fn persisted_state() {
        let state: PersistedChannelState =
            serde_json::from_str(r#"{"status":"2","value":"x"}"#).unwrap();

        assert_eq!(state.state(), Some(ChannelState::Fault));
        assert_eq!(state.value.as_deref(), Some("x"));

        let state = PersistedChannelState {
            status: "on".to_owned(),
            value: None,
        };
        assert_eq!(state.state(), None);
    }
}
