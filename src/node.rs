use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MasterConfig, WorkerConfig};
use crate::error::{CronError, Result};
use crate::logs::{LogSink, SharedLogStore};
use crate::master::{run_api, ApiState, JobManager};
use crate::scheduler::{JobEvent, Scheduler};
use crate::store::SharedStore;
use crate::worker::register::local_ip;
use crate::worker::{JobExecutor, JobWatcher, Register};

/// A worker process: watches jobs, schedules them, races other workers for
/// each execution, and ships execution logs.
pub struct WorkerNode {
    config: WorkerConfig,
    store: SharedStore,
    log_store: SharedLogStore,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig, store: SharedStore, log_store: SharedLogStore) -> Self {
        Self {
            config,
            store,
            log_store,
        }
    }

    /// Run all worker components until `shutdown` fires.
    ///
    /// Startup order matters: the scheduler is consuming events before the
    /// watcher emits the initial listing into its bounded channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial watch cannot be established, no
    /// advertise address can be determined, or the scheduler stops on its
    /// own.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let node_shutdown = shutdown.child_token();

        // The sink outlives the scheduler so the last results still get flushed.
        let sink_shutdown = CancellationToken::new();
        let (sink, sink_handle) = LogSink::new(self.log_store.clone(), &self.config.log_sink);
        let sink_task = tokio::spawn(sink.run(sink_shutdown.clone()));

        let executor = JobExecutor::new(self.store.clone(), self.config.lock_ttl_secs)
            .with_shell(self.config.shell.clone());
        let (scheduler, event_tx) = Scheduler::new(executor, sink_handle);
        let mut scheduler_task = tokio::spawn(scheduler.run(node_shutdown.clone()));

        let startup = self.start_background(event_tx, &node_shutdown).await;
        let (watcher_task, register_task) = match startup {
            Ok(tasks) => tasks,
            Err(e) => {
                node_shutdown.cancel();
                let _ = scheduler_task.await;
                sink_shutdown.cancel();
                let _ = sink_task.await;
                return Err(e);
            }
        };

        tracing::info!("Worker started");

        let outcome = tokio::select! {
            _ = node_shutdown.cancelled() => match scheduler_task.await {
                Ok(result) => result,
                Err(e) => Err(CronError::Internal(format!("scheduler task failed: {}", e))),
            },
            joined = &mut scheduler_task => {
                node_shutdown.cancel();
                match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(CronError::Internal(format!("scheduler task failed: {}", e))),
                }
            }
        };

        let _ = watcher_task.await;
        let _ = register_task.await;
        sink_shutdown.cancel();
        let _ = sink_task.await;

        tracing::info!("Worker stopped");
        outcome
    }

    async fn start_background(
        &self,
        event_tx: mpsc::Sender<JobEvent>,
        shutdown: &CancellationToken,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>)> {
        let addr = match &self.config.advertise_addr {
            Some(addr) => addr.clone(),
            None => local_ip()?.to_string(),
        };

        let watcher_task = JobWatcher::new(self.store.clone(), event_tx)
            .start(shutdown.clone())
            .await?;

        let register = Register::new(self.store.clone(), addr, self.config.register_ttl_secs);
        let register_task = tokio::spawn(register.run(shutdown.clone()));

        Ok((watcher_task, register_task))
    }
}

/// The control plane process: serves the HTTP API.
pub struct MasterNode {
    config: MasterConfig,
    store: SharedStore,
    log_store: SharedLogStore,
}

impl MasterNode {
    pub fn new(config: MasterConfig, store: SharedStore, log_store: SharedLogStore) -> Self {
        Self {
            config,
            store,
            log_store,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let state = ApiState {
            jobs: JobManager::new(self.store, self.config.kill_ttl_secs),
            logs: self.log_store,
        };
        run_api(self.config.listen_addr, state, shutdown).await
    }
}
