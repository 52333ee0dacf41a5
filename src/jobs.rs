//! Background batch jobs: the in-process queue, its registry, and the
//! worker that drains it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::state::AppState;
use crate::store::Row;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One submitted batch job. `Completed` still covers batches whose
/// rows partially failed; the per-row outcomes live in `result`.
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub entity: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request-time switches for one batch run. Multipart form fields may
/// override the entity-level defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchFlags {
    pub update_only: bool,
    pub create_only: bool,
    pub skip_before_hooks: bool,
    pub skip_after_hooks: bool,
}

/// What travels over the queue to the worker.
pub struct BatchTask {
    pub job_id: Uuid,
    pub slug: String,
    pub rows: Vec<Row>,
    pub flags: BatchFlags,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry::default()
    }

    pub fn enqueue(&self, slug: &str) -> JobRecord {
        let record = JobRecord {
            id: Uuid::new_v4(),
            entity: slug.to_string(),
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        record
    }

    pub fn mark_running(&self, id: Uuid) {
        if let Some(job) = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&self, id: Uuid, result: Value) {
        if let Some(job) = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            job.status = JobStatus::Completed;
            job.finished_at = Some(Utc::now());
            job.result = Some(result);
        }
    }

    pub fn fail(&self, id: Uuid, error: String) {
        if let Some(job) = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            job.error = Some(error);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

/// Drains the batch queue one task at a time, running the same row
/// pipeline the synchronous path uses. Exits when every sender is gone.
pub async fn batch_worker(mut rx: UnboundedReceiver<BatchTask>, state: AppState) {
    while let Some(task) = rx.recv().await {
        tracing::debug!(job_id = %task.job_id, slug = %task.slug, rows = task.rows.len(), "batch job start");
        state.jobs.mark_running(task.job_id);
        match crate::handlers::batch_save::execute_batch(&state, &task.slug, task.rows, task.flags)
            .await
        {
            Ok(response) => state.jobs.complete(task.job_id, response.body),
            Err(e) => {
                tracing::warn!(job_id = %task.job_id, error = %e, "batch job failed");
                state.jobs.fail(task.job_id, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_transitions_stamp_times() {
        let registry = JobRegistry::new();
        let record = registry.enqueue("tasks");
        assert_eq!(record.status, JobStatus::Queued);
        assert!(registry.get(&record.id).is_some());

        registry.mark_running(record.id);
        let running = registry.get(&record.id).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        registry.complete(record.id, json!({"status": "success"}));
        let done = registry.get(&record.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.finished_at.is_some());
        assert_eq!(done.result, Some(json!({"status": "success"})));
    }

    #[test]
    fn failure_keeps_the_error_message() {
        let registry = JobRegistry::new();
        let record = registry.enqueue("tasks");
        registry.fail(record.id, "boom".to_string());
        let failed = registry.get(&record.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
