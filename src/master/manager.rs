use crate::error::Result;
use crate::scheduler::Job;
use crate::store::{extract_name, SharedStore, JOB_KILLER_DIR, JOB_SAVE_DIR, JOB_WORKER_DIR};

/// Job CRUD and kill requests against the coordination store. Workers pick
/// every change up through their watches.
#[derive(Clone)]
pub struct JobManager {
    store: SharedStore,
    kill_ttl_secs: i64,
}

impl JobManager {
    pub fn new(store: SharedStore, kill_ttl_secs: i64) -> Self {
        Self {
            store,
            kill_ttl_secs,
        }
    }

    /// Create or replace a job. Returns the definition it replaced, if that
    /// one was readable.
    pub async fn save_job(&self, job: &Job) -> Result<Option<Job>> {
        job.validate()?;

        let key = format!("{}{}", JOB_SAVE_DIR, job.name);
        let previous = self.store.put(&key, job.encode()?, None).await?;

        tracing::info!(job = %job.name, cron_expr = %job.cron_expr, "Job saved");
        Ok(previous.and_then(|kv| Job::decode(&kv.value).ok()))
    }

    /// Delete a job. Returns the deleted definition, if there was one.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>> {
        let key = format!("{}{}", JOB_SAVE_DIR, name);
        let previous = self.store.delete(&key).await?;

        if previous.is_some() {
            tracing::info!(job = %name, "Job deleted");
        }
        Ok(previous.and_then(|kv| Job::decode(&kv.value).ok()))
    }

    /// All decodable job definitions.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let response = self.store.get_prefix(JOB_SAVE_DIR).await?;

        let jobs = response
            .kvs
            .iter()
            .filter_map(|kv| match Job::decode(&kv.value) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Ask whichever worker is running `name` to kill it. The marker lives on
    /// a short lease and disappears by itself.
    pub async fn kill_job(&self, name: &str) -> Result<()> {
        let lease_id = self.store.grant_lease(self.kill_ttl_secs).await?;
        let key = format!("{}{}", JOB_KILLER_DIR, name);
        self.store.put(&key, Vec::new(), Some(lease_id)).await?;

        tracing::info!(job = %name, "Kill requested");
        Ok(())
    }

    /// Addresses of registered workers.
    pub async fn list_workers(&self) -> Result<Vec<String>> {
        let response = self.store.get_prefix(JOB_WORKER_DIR).await?;
        Ok(response
            .kvs
            .iter()
            .map(|kv| extract_name(&kv.key, JOB_WORKER_DIR).to_string())
            .collect())
    }
}
