use crate::prelude::*;

use crate::unit::port::RunFlag;

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

type TaskFactory = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Task {
    name: String,
    factory: TaskFactory,
    handle: Option<JoinHandle<()>>,
    restarts: u64,
}

impl Task {
    fn spawn(&mut self) {
        let name = self.name.clone();
        let future = (self.factory)();

        self.handle = Some(tokio::spawn(async move {
            if let Err(err) = future.await {
                error!("{} failed: {}", name, err);
            }
        }));
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

/// Keeps the long-running loops alive: any task found finished while the
/// bridge is still running is started again.
pub struct Supervisor {
    tasks: Vec<Task>,
    running: RunFlag,
    interval: Duration,
}

impl Supervisor {
    pub fn new(running: RunFlag, interval: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            running,
            interval,
        }
    }

    pub fn add<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(Task {
            name: name.to_owned(),
            factory: Box::new(move || factory().boxed()),
            handle: None,
            restarts: 0,
        });
    }

    /// Starts every task and watches them until the running flag clears.
    /// Returns the number of restarts per task.
    pub async fn run(mut self) -> Vec<(String, u64)> {
        for task in &mut self.tasks {
            info!("starting {}", task.name);
            task.spawn();
        }

        while self.running.is_running() {
            tokio::time::sleep(self.interval).await;
            if !self.running.is_running() {
                break;
            }

            for task in &mut self.tasks {
                if task.is_finished() {
                    warn!("{} exited, restarting", task.name);
                    task.restarts += 1;
                    task.spawn();
                }
            }
        }

        debug!("supervisor exiting");
        self.tasks.into_iter().map(|t| (t.name, t.restarts)).collect()
    }
}
