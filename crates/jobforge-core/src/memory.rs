//! In-process `JobStore`. Used for `queue.driver = memory` (the default)
//! and as the fast fixture backing most of this crate's own unit tests.
//! `RwLock<HashMap<...>>` plus an atomic id counter, the same shape as the
//! teacher family's in-memory store implementations — a transaction here
//! is just "hold the write lock for the duration of the mutation".

use crate::clock::Clock;
use crate::error::JobforgeError;
use crate::job::{
    BackoffStrategy, DeadLetterRecord, Job, JobId, JobSpec, JobStatus, LogEntry, QueueStats,
    RetryHistoryEntry,
};
use crate::retry;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Fallback attempt/backoff parameters applied to a `jobs` row created by
/// [`JobStore::retry_failed`], since a `failed_jobs` record does not carry
/// the original `max_attempts`/`timeout`/`backoff_strategy`/`retry_delay`
/// (only `JobSpec` does).
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub max_attempts: i32,
    pub retry_delay: i64,
    pub backoff_strategy: BackoffStrategy,
    pub timeout: i64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self { max_attempts: 3, retry_delay: 60, backoff_strategy: BackoffStrategy::Exponential, timeout: 300 }
    }
}

struct State {
    jobs: HashMap<i64, Job>,
    failed: HashMap<i64, DeadLetterRecord>,
    retry_histories: HashMap<i64, Vec<RetryHistoryEntry>>,
    logs: Vec<LogEntry>,
}

pub struct MemoryJobStore {
    clock: Arc<dyn Clock>,
    next_id: AtomicI64,
    defaults: JobDefaults,
    state: RwLock<State>,
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>, defaults: JobDefaults) -> Self {
        Self {
            clock,
            next_id: AtomicI64::new(1),
            defaults,
            state: RwLock::new(State {
                jobs: HashMap::new(),
                failed: HashMap::new(),
                retry_histories: HashMap::new(),
                logs: Vec::new(),
            }),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("memory store lock poisoned")
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("memory store lock poisoned")
    }

    fn move_to_dead_letter(
        state: &mut State,
        job: Job,
        error: &str,
        stack_trace: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let mut history = state.retry_histories.remove(&job.id.0).unwrap_or_default();
        history.push(RetryHistoryEntry { attempt: job.attempts, error: error.to_string(), at: now });
        state.failed.insert(
            job.id.0,
            DeadLetterRecord {
                id: job.id,
                queue: job.queue.clone(),
                task: job.task.clone(),
                payload: job.payload.clone(),
                exception: error.to_string(),
                stack_trace: stack_trace.map(str::to_string),
                failed_at: now,
                total_attempts: job.attempts,
                retry_history: history,
                original_job_id: job.id,
                priority: job.priority,
                tags: job.tags.clone(),
            },
        );
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, spec: JobSpec) -> Result<JobId, JobforgeError> {
        let now = self.clock.now();
        let id = JobId(self.allocate_id());
        let job = Job {
            id,
            queue: spec.queue,
            priority: spec.priority,
            task: spec.task,
            payload: spec.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: spec.max_attempts,
            retry_delay: spec.retry_delay,
            backoff_strategy: spec.backoff_strategy,
            created_at: now,
            updated_at: now,
            available_at: now + spec.delay,
            reserved_at: None,
            last_error: None,
            timeout: spec.timeout,
            tags: spec.tags,
        };
        self.lock_write().jobs.insert(id.0, job);
        Ok(id)
    }

    async fn reserve(&self, queues: &[String], batch_size: i64) -> Result<Vec<Job>, JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();

        let mut candidates: Vec<i64> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.available_at <= now)
            .filter(|job| queues.is_empty() || queues.iter().any(|q| q == &job.queue))
            .map(|job| job.id.0)
            .collect();

        candidates.sort_by(|a, b| {
            let job_a = &state.jobs[a];
            let job_b = &state.jobs[b];
            job_a
                .priority
                .cmp(&job_b.priority)
                .then(job_a.available_at.cmp(&job_b.available_at))
                .then(job_a.id.cmp(&job_b.id))
        });
        candidates.truncate(batch_size.max(0) as usize);

        let mut reserved = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Reserved;
                job.reserved_at = Some(now);
                job.attempts += 1;
                job.updated_at = now;
                reserved.push(job.clone());
            }
        }
        Ok(reserved)
    }

    async fn complete(&self, id: JobId) -> Result<(), JobforgeError> {
        let mut state = self.lock_write();
        state.jobs.remove(&id.0);
        state.retry_histories.remove(&id.0);
        Ok(())
    }

    async fn fail_retry(
        &self,
        id: JobId,
        error: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<(), JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();
        let attempt = state.jobs.get(&id.0).map(|job| job.attempts).unwrap_or(0);
        state
            .retry_histories
            .entry(id.0)
            .or_default()
            .push(RetryHistoryEntry { attempt, error: error.to_string(), at: now });

        if let Some(job) = state.jobs.get_mut(&id.0) {
            job.status = JobStatus::Pending;
            job.reserved_at = None;
            job.available_at = next_available_at;
            job.last_error = Some(crate::job::truncate_error(error));
            job.updated_at = now;
        }
        Ok(())
    }

    async fn fail_terminal(
        &self,
        id: JobId,
        error: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();
        if let Some(job) = state.jobs.remove(&id.0) {
            Self::move_to_dead_letter(&mut state, job, error, stack_trace, now);
        }
        Ok(())
    }

    async fn release(&self, id: JobId, available_at: DateTime<Utc>) -> Result<(), JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();
        if let Some(job) = state.jobs.get_mut(&id.0) {
            job.status = JobStatus::Pending;
            job.reserved_at = None;
            job.available_at = available_at;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn reclaim_expired_leases(&self, grace: ChronoDuration) -> Result<u64, JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();

        let expired: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Reserved)
            .filter(|job| {
                job.reserved_at
                    .map(|reserved_at| now - reserved_at > ChronoDuration::seconds(job.timeout) + grace)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let count = expired.len() as u64;
        for job in expired {
            if job.attempts < job.max_attempts {
                let delay = retry::jittered_delay_secs(
                    job.backoff_strategy,
                    job.retry_delay.max(0) as u64,
                    job.attempts as u32,
                );
                let next_available_at = now + ChronoDuration::seconds(delay as i64);
                state
                    .retry_histories
                    .entry(job.id.0)
                    .or_default()
                    .push(RetryHistoryEntry { attempt: job.attempts, error: "lease expired".to_string(), at: now });
                if let Some(row) = state.jobs.get_mut(&job.id.0) {
                    row.status = JobStatus::Pending;
                    row.reserved_at = None;
                    row.available_at = next_available_at;
                    row.last_error = Some("lease expired".to_string());
                    row.updated_at = now;
                }
            } else {
                state.jobs.remove(&job.id.0);
                Self::move_to_dead_letter(&mut state, job, "lease expired", None, now);
            }
        }
        Ok(count)
    }

    async fn purge_old(&self, age: ChronoDuration) -> Result<u64, JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();
        let before = state.logs.len();
        state.logs.retain(|entry| now - entry.created_at <= age);
        Ok((before - state.logs.len()) as u64)
    }

    async fn get_failed(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterRecord>, JobforgeError> {
        let state = self.lock_read();
        let mut records: Vec<DeadLetterRecord> = state.failed.values().cloned().collect();
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(a.id.cmp(&b.id)));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get_failed_one(&self, id: JobId) -> Result<Option<DeadLetterRecord>, JobforgeError> {
        Ok(self.lock_read().failed.get(&id.0).cloned())
    }

    async fn retry_failed(&self, id: JobId) -> Result<Option<JobId>, JobforgeError> {
        let now = self.clock.now();
        let mut state = self.lock_write();
        let Some(record) = state.failed.remove(&id.0) else {
            return Ok(None);
        };
        let new_id = JobId(self.allocate_id());
        let job = Job {
            id: new_id,
            queue: record.queue,
            priority: record.priority,
            task: record.task,
            payload: record.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.defaults.max_attempts,
            retry_delay: self.defaults.retry_delay,
            backoff_strategy: self.defaults.backoff_strategy,
            created_at: now,
            updated_at: now,
            available_at: now,
            reserved_at: None,
            last_error: None,
            timeout: self.defaults.timeout,
            tags: record.tags,
        };
        state.jobs.insert(new_id.0, job);
        Ok(Some(new_id))
    }

    async fn retry_all_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        let ids: Vec<i64> = {
            let state = self.lock_read();
            state
                .failed
                .values()
                .filter(|record| queue.map(|q| q == record.queue).unwrap_or(true))
                .map(|record| record.id.0)
                .collect()
        };
        let mut count = 0u64;
        for id in ids {
            if self.retry_failed(JobId(id)).await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        let mut state = self.lock_write();
        let ids: Vec<i64> = state
            .failed
            .values()
            .filter(|record| queue.map(|q| q == record.queue).unwrap_or(true))
            .map(|record| record.id.0)
            .collect();
        for id in &ids {
            state.failed.remove(id);
            state.retry_histories.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, JobforgeError> {
        let now = self.clock.now();
        let state = self.lock_read();
        let in_scope = |q: &str| queue.map(|filter| filter == q).unwrap_or(true);

        let mut stats = QueueStats::default();
        for job in state.jobs.values().filter(|job| in_scope(&job.queue)) {
            match job.status {
                JobStatus::Pending if job.available_at <= now => stats.pending_now += 1,
                JobStatus::Pending => stats.pending_later += 1,
                JobStatus::Reserved => stats.reserved += 1,
                _ => {}
            }
        }
        stats.dead_letter = state.failed.values().filter(|record| in_scope(&record.queue)).count() as i64;
        Ok(stats)
    }

    async fn log(&self, entry: LogEntry) -> Result<(), JobforgeError> {
        self.lock_write().logs.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock_at(secs: i64) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.timestamp_opt(secs, 0).unwrap()))
    }

    fn spec(task: &str, priority: i16) -> JobSpec {
        JobSpec {
            queue: "default".to_string(),
            priority,
            task: task.to_string(),
            payload: serde_json::json!({}),
            max_attempts: 3,
            retry_delay: 10,
            backoff_strategy: BackoffStrategy::Exponential,
            timeout: 30,
            tags: None,
            delay: ChronoDuration::zero(),
        }
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let clock = clock_at(1_000);
        let store = MemoryJobStore::new(clock.clone(), JobDefaults::default());

        store.insert(spec("A", 5)).await.unwrap();
        store.insert(spec("B", 1)).await.unwrap();
        store.insert(spec("C", 5)).await.unwrap();

        let reserved = store.reserve(&[], 10).await.unwrap();
        let order: Vec<&str> = reserved.iter().map(|job| job.task.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn reserved_row_is_not_reserved_twice() {
        let clock = clock_at(1_000);
        let store = MemoryJobStore::new(clock, JobDefaults::default());
        store.insert(spec("only", 5)).await.unwrap();

        let first = store.reserve(&[], 10).await.unwrap();
        let second = store.reserve(&[], 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn fail_terminal_moves_row_to_dead_letter() {
        let clock = clock_at(1_000);
        let store = MemoryJobStore::new(clock, JobDefaults::default());
        let id = store.insert(spec("boom", 5)).await.unwrap();
        store.reserve(&[], 10).await.unwrap();

        store.fail_terminal(id, "kaboom", None).await.unwrap();

        assert!(store.get_failed_one(id).await.unwrap().is_some());
        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.pending_now + stats.pending_later + stats.reserved, 0);
    }

    #[tokio::test]
    async fn retry_failed_creates_new_row_with_zero_attempts() {
        let clock = clock_at(1_000);
        let store = MemoryJobStore::new(clock, JobDefaults::default());
        let id = store.insert(spec("boom", 5)).await.unwrap();
        store.reserve(&[], 10).await.unwrap();
        store.fail_terminal(id, "kaboom", None).await.unwrap();

        let new_id = store.retry_failed(id).await.unwrap().unwrap();
        assert_ne!(new_id, id);
        assert!(store.get_failed_one(id).await.unwrap().is_none());

        let reserved = store.reserve(&[], 10).await.unwrap();
        assert_eq!(reserved[0].id, new_id);
        assert_eq!(reserved[0].attempts, 1);
    }

    #[tokio::test]
    async fn available_at_floor_is_respected() {
        let clock = clock_at(1_000);
        let store = MemoryJobStore::new(clock.clone(), JobDefaults::default());
        let mut delayed = spec("later", 5);
        delayed.delay = ChronoDuration::seconds(10);
        store.insert(delayed).await.unwrap();

        assert!(store.reserve(&[], 10).await.unwrap().is_empty());
        clock.advance(ChronoDuration::seconds(11));
        assert_eq!(store.reserve(&[], 10).await.unwrap().len(), 1);
    }
}
