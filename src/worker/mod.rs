//! Worker-side components.
//!
//! - [`JobWatcher`]: turns store changes into scheduler job events
//! - [`JobExecutor`]: takes a job's distributed lock and runs its command
//! - [`JobLock`]: the lease-backed per-job lock
//! - [`Register`]: publishes this worker under `/cron/workers/`
//!
//! # Execution Flow
//!
//! 1. The scheduler dispatches a due job to [`JobExecutor::spawn`]
//! 2. The executor races other workers for `/cron/lock/<name>`
//! 3. The winner runs `sh -c <command>` and captures its output
//! 4. The lock is released and the result posted back to the scheduler
//!
//! # Security Note
//!
//! Commands are executed directly via shell without sandboxing.

pub mod executor;
pub mod lock;
pub mod register;
pub mod watch;

pub use executor::JobExecutor;
pub use lock::{JobLock, LockGuard};
pub use register::Register;
pub use watch::JobWatcher;
