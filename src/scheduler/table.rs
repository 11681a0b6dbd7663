use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::scheduler::job::{ExecutionRecord, SchedulePlan};

/// Job name -> schedule plan for every job known to this node.
#[derive(Debug, Default)]
pub struct PlanTable {
    plans: HashMap<String, SchedulePlan>,
}

impl PlanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the plan for the job's name. Returns the replaced plan.
    pub fn upsert(&mut self, plan: SchedulePlan) -> Option<SchedulePlan> {
        self.plans.insert(plan.job.name.clone(), plan)
    }

    pub fn remove(&mut self, name: &str) -> Option<SchedulePlan> {
        self.plans.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&SchedulePlan> {
        self.plans.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SchedulePlan> {
        self.plans.get_mut(name)
    }

    /// Names of plans whose next fire time is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.plans
            .values()
            .filter(|plan| plan.is_due(now))
            .map(|plan| plan.job.name.clone())
            .collect()
    }

    /// Soonest next fire time across all plans.
    pub fn nearest(&self) -> Option<DateTime<Utc>> {
        self.plans.values().map(|plan| plan.next_time).min()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Job name -> in-flight execution on this node. A name is present exactly
/// while an execution for it is running.
#[derive(Debug, Default)]
pub struct ExecutingTable {
    records: HashMap<String, ExecutionRecord>,
}

impl ExecutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Track a new execution. Refuses (returns false) when the job already
    /// has one in flight.
    pub fn insert(&mut self, record: ExecutionRecord) -> bool {
        if self.records.contains_key(&record.job.name) {
            return false;
        }
        self.records.insert(record.job.name.clone(), record);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ExecutionRecord> {
        self.records.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ExecutionRecord> {
        self.records.remove(name)
    }

    pub fn records(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
