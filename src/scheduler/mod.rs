//! Node-local scheduling.
//!
//! The [`Scheduler`] is a single-threaded event loop that exclusively owns
//! the plan table and the executing table. It reacts to three inputs:
//!
//! - job events from the watch translator (upsert / delete / kill)
//! - execution results posted back by executor tasks
//! - a timer re-armed to the soonest pending fire time
//!
//! Due jobs are handed to the [`JobExecutor`](crate::worker::JobExecutor),
//! which races other nodes for the job's distributed lock before running it.

pub mod engine;
pub mod job;
pub mod table;

pub use engine::Scheduler;
pub use job::{
    ExecutionRecord, ExecutionResult, Job, JobEvent, JobEventKind, SchedulePlan,
};
pub use table::{ExecutingTable, PlanTable};
