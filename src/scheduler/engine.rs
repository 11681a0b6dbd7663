use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::logs::{LogEntry, LogSinkHandle};
use crate::scheduler::job::{
    ExecutionRecord, ExecutionResult, Job, JobEvent, JobEventKind, SchedulePlan,
};
use crate::scheduler::table::{ExecutingTable, PlanTable};
use crate::worker::JobExecutor;

/// Wait used when no job is scheduled. Job events wake the loop regardless.
const IDLE_WAIT: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 1000;
const RESULT_CHANNEL_CAPACITY: usize = 1000;

/// Single-threaded scheduling loop.
///
/// Sole owner of the plan table and the executing table: every mutation
/// happens inside one iteration of [`Scheduler::run`], so neither table needs
/// a lock. Executions run on their own tasks and report back only through
/// the result channel.
pub struct Scheduler {
    plans: PlanTable,
    executing: ExecutingTable,
    event_rx: mpsc::Receiver<JobEvent>,
    result_tx: mpsc::Sender<ExecutionResult>,
    result_rx: mpsc::Receiver<ExecutionResult>,
    executor: JobExecutor,
    log_sink: LogSinkHandle,
    idle_wait: Duration,
}

impl Scheduler {
    /// Create a scheduler and the sender used to feed it job events.
    pub fn new(executor: JobExecutor, log_sink: LogSinkHandle) -> (Self, mpsc::Sender<JobEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

        let scheduler = Self {
            plans: PlanTable::new(),
            executing: ExecutingTable::new(),
            event_rx,
            result_tx,
            result_rx,
            executor,
            log_sink,
            idle_wait: IDLE_WAIT,
        };

        (scheduler, event_tx)
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    pub fn executing(&self) -> &ExecutingTable {
        &self.executing
    }

    /// Run the event loop until `shutdown` fires.
    ///
    /// Each iteration handles exactly one of: a job event, an execution
    /// result, or the timer. The schedule is then recomputed and the timer
    /// re-armed to the soonest fire time.
    ///
    /// # Errors
    ///
    /// Returns an error if the job event channel closes, meaning the watch
    /// translator is gone and the schedule can no longer be kept current.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let delay = self.try_schedule(Utc::now());
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        tracing::info!("Scheduler loop started");

        loop {
            tokio::select! {
                // Shutdown first: the watcher drops its sender once cancelled.
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!(in_flight = self.executing.len(), "Scheduler shutting down");
                    self.interrupt_all();
                    return Ok(());
                }
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_job_event(event, Utc::now()),
                    None => {
                        self.interrupt_all();
                        return Err(CronError::Internal("job event channel closed".to_string()));
                    }
                },
                Some(result) = self.result_rx.recv() => {
                    self.handle_job_result(result);
                }
                _ = &mut timer => {}
            }

            let delay = self.try_schedule(Utc::now());
            timer.as_mut().reset(Instant::now() + delay);
        }
    }

    /// Apply a job event to the plan table (or signal a kill).
    pub fn handle_job_event(&mut self, event: JobEvent, now: DateTime<Utc>) {
        let name = event.job.name.clone();

        match event.kind {
            JobEventKind::Upserted => match SchedulePlan::build(event.job, now) {
                Ok(plan) => {
                    tracing::info!(job = %name, next_time = %plan.next_time, "Job scheduled");
                    self.plans.upsert(plan);
                }
                Err(e) => {
                    tracing::warn!(job = %name, error = %e, "Dropping job event with unusable schedule");
                }
            },
            JobEventKind::Deleted => {
                if self.plans.remove(&name).is_some() {
                    tracing::info!(job = %name, "Job unscheduled");
                }
            }
            JobEventKind::KillRequested => match self.executing.get(&name) {
                Some(record) => {
                    tracing::info!(job = %name, execution_id = %record.id, "Killing running job");
                    record.cancel.cancel();
                }
                None => {
                    tracing::debug!(job = %name, "Kill requested for job not running on this node");
                }
            },
        }
    }

    /// Dispatch every due plan, advance it past `now`, and return how long to
    /// sleep until the next fire time.
    pub fn try_schedule(&mut self, now: DateTime<Utc>) -> Duration {
        if self.plans.is_empty() {
            return self.idle_wait;
        }

        for name in self.plans.due(now) {
            let Some(plan) = self.plans.get(&name) else {
                continue;
            };
            let job = plan.job.clone();
            let plan_time = plan.next_time;

            self.try_start_job(job, plan_time, now);

            let exhausted = self
                .plans
                .get_mut(&name)
                .is_some_and(|plan| !plan.advance(now));
            if exhausted {
                tracing::warn!(job = %name, "Schedule has no further occurrences, removing plan");
                self.plans.remove(&name);
            }
        }

        match self.plans.nearest() {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
            None => self.idle_wait,
        }
    }

    /// Start an execution unless one is already in flight for this job.
    /// Returns whether a dispatch happened.
    pub fn try_start_job(&mut self, job: Job, plan_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.executing.contains(&job.name) {
            tracing::debug!(job = %job.name, "Previous run still executing, skipping tick");
            return false;
        }

        let record = ExecutionRecord::new(job, plan_time, now);
        tracing::info!(
            job = %record.job.name,
            execution_id = %record.id,
            plan_time = %record.plan_time,
            "Dispatching job"
        );

        self.executing.insert(record.clone());
        self.executor.spawn(record, self.result_tx.clone());
        true
    }

    /// Retire a finished execution and forward its log entry.
    pub fn handle_job_result(&mut self, result: ExecutionResult) {
        let name = &result.record.job.name;
        self.executing.remove(name);

        match &result.error {
            None => tracing::info!(
                job = %name,
                execution_id = %result.record.id,
                duration_ms = (result.end_time - result.start_time).num_milliseconds(),
                "Job completed"
            ),
            Some(e) if e.is_lock_contention() => {
                tracing::debug!(job = %name, "Another worker holds the lock, run skipped");
            }
            Some(e) => tracing::warn!(
                job = %name,
                execution_id = %result.record.id,
                error = %e,
                "Job failed"
            ),
        }

        if let Some(entry) = LogEntry::from_result(&result) {
            self.log_sink.append(entry);
        }
    }

    /// Stop every in-flight run on shutdown. Their results are not logged:
    /// the loop exits before executors post them.
    fn interrupt_all(&self) {
        for record in self.executing.records() {
            record.interrupt.cancel();
        }
    }
}
