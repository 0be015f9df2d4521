pub mod channels;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod scheduler;
pub mod supervisor;
pub mod telemetry;
pub mod unit;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::coordinator::Coordinator;
use crate::database::Database;
use crate::mqtt::Mqtt;
use crate::scheduler::Scheduler;
use crate::supervisor::Supervisor;
use crate::unit::port::RunFlag;
use crate::unit::UnitRegistry;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn init_logger(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
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
        .try_init();

    if let Err(err) = result {
        eprintln!("logger already initialized: {}", err);
    }
}

/// Main application entry point: loads the config, then runs the bridge
/// until ctrl-c or the optional runtime limit.
pub async fn app(options: Options) -> Result<()> {
    let config = Config::read(&options.config_file)?;

    init_logger(&config.loglevel);
    info!("axiom-bridge {} starting with config file: {}", CARGO_PKG_VERSION, options.config_file);
    config.log_summary();

    run(ConfigWrapper::from_config(config), options.runtime).await
}

pub async fn run(config: ConfigWrapper, runtime: Option<u64>) -> Result<()> {
    info!("Initializing channels...");
    let channels = Channels::new();
    let running = RunFlag::new();

    info!("Initializing components...");
    let store = database::open_store(&config).await?;

    let units = Arc::new(UnitRegistry::new(&config));
    units.open_all().await;

    let coordinator = Coordinator::new(
        config.clone(),
        channels.clone(),
        units.clone(),
        store.clone(),
        running.clone(),
    );
    let database = Database::new(channels.clone(), store, coordinator.shared_stats.clone());
    let mqtt = Mqtt::new(
        config.clone(),
        channels.clone(),
        running.clone(),
        coordinator.shared_stats.clone(),
    );
    let scheduler = Scheduler::new(config.clone(), channels.clone(), units.clone(), running.clone());

    // listeners first, the readers start producing as soon as they run
    let mut supervisor = Supervisor::new(running.clone(), config.timeouts().supervisor());
    {
        let database = database.clone();
        supervisor.add("database", move || {
            let database = database.clone();
            async move { database.start().await }
        });
    }
    {
        let mqtt = mqtt.clone();
        supervisor.add("mqtt", move || {
            let mqtt = mqtt.clone();
            async move { mqtt.start().await }
        });
    }
    {
        let coordinator = coordinator.clone();
        supervisor.add("coordinator", move || {
            let coordinator = coordinator.clone();
            async move { coordinator.start().await }
        });
    }
    for reader in coordinator.readers() {
        let name = format!("reader {}", reader.address());
        supervisor.add(&name, move || {
            let reader = reader.clone();
            async move { reader.run().await }
        });
    }
    {
        let scheduler = scheduler.clone();
        supervisor.add("scheduler", move || {
            let scheduler = scheduler.clone();
            async move { scheduler.start().await }
        });
    }

    let supervisor = tokio::spawn(supervisor.run());
    info!("axiom-bridge running");

    match runtime {
        Some(secs) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("runtime of {}s reached", secs),
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutdown signal received, stopping components...");
    running.stop();
    coordinator.stop();
    database.stop();
    mqtt.stop();

    match supervisor.await {
        Ok(restarts) => {
            for (name, count) in restarts.into_iter().filter(|(_, count)| *count > 0) {
                info!("{} was restarted {} times", name, count);
            }
        }
        Err(err) => error!("supervisor failed: {}", err),
    }

    units.close_all().await;
    coordinator.stats().print_summary(&units);

    info!("Shutdown complete");
    Ok(())
}
