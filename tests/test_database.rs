mod common;
use common::*;

use axiom_bridge::coordinator::BridgeStats;
use axiom_bridge::database::{Database, MemoryStore, PersistedChannelState, SqliteStore, StateStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn sqlite_store_round_trip() -> Result<()> {
    common_setup();

    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("axiom.db").display());
    let addr = Factory::addr("ch:m1:1");

    let store = SqliteStore::connect(&url).await?;
    assert_eq!(store.load(&addr).await?, None);

    store.save(&addr, &PersistedChannelState::new(ChannelState::On)).await?;
    store.save(&addr, &PersistedChannelState::new(ChannelState::Off)).await?;

    // reopened, as after a restart
    let store = SqliteStore::connect(&url).await?;
    assert_eq!(
        store.load(&addr).await?.and_then(|s| s.state()),
        Some(ChannelState::Off)
    );
    assert_eq!(store.load(&Factory::addr("ch:m1:2")).await?, None);

    store.save_raw(&addr, "not json").await?;
    assert!(store.load(&addr).await.is_err());

    Ok(())
}

#[tokio::test]
async fn writer_persists_state_changes() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let store = Arc::new(MemoryStore::new());
    let stats = Arc::new(Mutex::new(BridgeStats::default()));
    let database = Database::new(channels.clone(), store.clone(), stats.clone());

    let writer = {
        let database = database.clone();
        tokio::spawn(async move { database.start().await })
    };
    // let the writer subscribe
    assert!(wait_for(Duration::from_secs(1), || channels.to_database.receiver_count() > 0).await);

    channels.to_database.send(database::ChannelData::StateChanged(
        Factory::addr("ch:m2:1"),
        PersistedChannelState::new(ChannelState::Fault),
    ))?;
    database.stop();
    writer.await??;

    assert_eq!(
        store.load_raw(&Factory::addr("ch:m2:1")).await?.as_deref(),
        Some(r#"{"status":"2"}"#)
    );
    assert_eq!(stats.lock().unwrap().database_writes, 1);

    Ok(())
}
