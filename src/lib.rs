pub mod config;
pub mod error;
pub mod logs;
pub mod master;
pub mod node;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{CronError, Result};
