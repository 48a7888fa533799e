//! Redis-based backing store with reliable dequeue.
//!
//! Each queue partition uses these keys under a shared prefix:
//!
//! - `{prefix}:{queue}:waiting`: main list, LPUSH on enqueue, BRPOPLPUSH on dequeue
//! - `{prefix}:{queue}:active`: jobs being processed (for crash recovery)
//! - `{prefix}:{queue}:active_since`: hash of job id to delivery time (ms)
//! - `{prefix}:{queue}:delayed`: sorted set scored by due time (ms)
//! - `{prefix}:{queue}:completed` / `:failed`: retained history lists
//! - `{prefix}:{queue}:completed_total` / `:failed_total`: counters
//! - `{prefix}:{queue}:dead_letter`: jobs that will not be retried
//! - `{prefix}:{queue}:paused`: present while the queue is paused
//!
//! Jobs are atomically moved from the waiting list to the active list when
//! dequeued. If a worker crashes, `recover` moves them back.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;

use super::job::{Job, JobOutcome};
use super::queue::{
    QueueBackend, QueueCounts, QueueError, QueueName, QueueSettings, RetryDecision, RetryPolicy,
};

/// Key names for one queue partition.
#[derive(Debug, Clone)]
struct PartitionKeys {
    waiting: String,
    active: String,
    active_since: String,
    delayed: String,
    completed: String,
    failed: String,
    completed_total: String,
    failed_total: String,
    dead_letter: String,
    paused: String,
}

impl PartitionKeys {
    fn new(prefix: &str, queue: QueueName) -> Self {
        let base = format!("{}:{}", prefix, queue);
        Self {
            waiting: format!("{}:waiting", base),
            active: format!("{}:active", base),
            active_since: format!("{}:active_since", base),
            delayed: format!("{}:delayed", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            completed_total: format!("{}:completed_total", base),
            failed_total: format!("{}:failed_total", base),
            dead_letter: format!("{}:dead_letter", base),
            paused: format!("{}:paused", base),
        }
    }
}

/// Redis-backed queue store.
///
/// The connection manager reconnects automatically; cloning it is cheap.
pub struct RedisBackend {
    redis: ConnectionManager,
    keys: HashMap<QueueName, PartitionKeys>,
    settings: HashMap<QueueName, QueueSettings>,
    stall_after: Duration,
}

impl RedisBackend {
    /// Connects to Redis and prepares keys for all five queues.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        settings: HashMap<QueueName, QueueSettings>,
        stall_after: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix, settings, stall_after))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(
        redis: ConnectionManager,
        prefix: &str,
        settings: HashMap<QueueName, QueueSettings>,
        stall_after: Duration,
    ) -> Self {
        let keys = QueueName::ALL
            .iter()
            .map(|q| (*q, PartitionKeys::new(prefix, *q)))
            .collect();
        Self {
            redis,
            keys,
            settings,
            stall_after,
        }
    }

    fn keys(&self, queue: QueueName) -> &PartitionKeys {
        &self.keys[&queue]
    }

    fn settings_for(&self, queue: QueueName) -> QueueSettings {
        self.settings
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| QueueSettings::defaults_for(queue))
    }

    fn policy_for(&self, job: &Job, queue: QueueName) -> RetryPolicy {
        self.settings_for(job.metadata.origin_queue.unwrap_or(queue))
            .retry
    }

    /// Moves due jobs from the delayed set to the waiting list.
    async fn promote_due(&self, queue: QueueName) -> Result<usize, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore(&keys.delayed, "-inf", now_ms)
            .await?;

        let mut promoted = 0;
        for member in due {
            // Only the worker that removes the member pushes it, so a job is
            // never promoted twice.
            let removed: i64 = conn.zrem(&keys.delayed, &member).await?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(&keys.waiting, &member).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Removes a job from the active list by ID.
    async fn remove_from_active(&self, queue: QueueName, job_id: Uuid) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let jobs: Vec<String> = conn.lrange(&keys.active, 0, -1).await?;
        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<Job>(&job_data) {
                if job.id == job_id {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .lrem(&keys.active, 1, &job_data)
                        .hdel(&keys.active_since, job_id.to_string());
                    pipe.query_async::<_, ()>(&mut conn).await?;
                    return Ok(());
                }
            }
        }

        // Not found is not an error; recovery may already have moved it.
        conn.hdel::<_, _, ()>(&keys.active_since, job_id.to_string())
            .await?;
        Ok(())
    }

    /// Peeks at dead-lettered entries of a queue.
    pub async fn peek_dead_letter(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let Some(stop) = lrange_stop(limit) else {
            return Ok(Vec::new());
        };
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.keys(queue).dead_letter, 0, stop)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    /// Deletes every key of a queue.
    ///
    /// **Warning**: This permanently deletes all jobs. Use with caution.
    pub async fn clear(&self, queue: QueueName) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&keys.waiting)
            .del(&keys.active)
            .del(&keys.active_since)
            .del(&keys.delayed)
            .del(&keys.completed)
            .del(&keys.failed)
            .del(&keys.completed_total)
            .del(&keys.failed_total)
            .del(&keys.dead_letter)
            .del(&keys.paused);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(
        &self,
        queue: QueueName,
        mut job: Job,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if job.metadata.origin_queue.is_none() {
            job.metadata.origin_queue = Some(queue);
        }
        let keys = self.keys(queue);
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();

        if delay.is_zero() {
            conn.lpush::<_, _, ()>(&keys.waiting, serialized).await?;
        } else {
            let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            conn.zadd::<_, _, _, ()>(&keys.delayed, serialized, due_ms)
                .await?;
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        if self.is_paused(queue).await? {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        self.promote_due(queue).await?;

        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        // BRPOPLPUSH atomically pops from source and pushes to destination
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&keys.waiting)
            .arg(&keys.active)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(data) = result else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&data)?;
        job.metadata.attempts += 1;

        // Keep the active entry in sync with the attempt count so recovery
        // sees the delivery that was made.
        let updated = serde_json::to_string(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&keys.active, 1, &data)
            .lpush(&keys.active, &updated)
            .hset(
                &keys.active_since,
                job.id.to_string(),
                Utc::now().timestamp_millis(),
            );
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(Some(job))
    }

    async fn complete(&self, queue: QueueName, outcome: &JobOutcome) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let keep = self.settings_for(queue).keep_completed;
        let mut conn = self.redis.clone();

        self.remove_from_active(queue, outcome.job_id).await?;

        let serialized = serde_json::to_string(outcome)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&keys.completed, serialized)
            .ltrim(&keys.completed, 0, keep as isize - 1)
            .incr(&keys.completed_total, 1);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        job: Job,
        error: &JobError,
    ) -> Result<RetryDecision, QueueError> {
        let policy = self.policy_for(&job, queue);
        let attempts = job.metadata.attempts;

        self.remove_from_active(queue, job.id).await?;

        if error.is_retryable() && policy.allows_retry(attempts) {
            let delay = policy.delay_for(attempts);
            self.enqueue(QueueName::Retry, job, delay).await?;
            return Ok(RetryDecision::Retry {
                attempt: attempts,
                delay,
                queue: QueueName::Retry,
            });
        }

        let keys = self.keys(queue);
        let keep = self.settings_for(queue).keep_failed;
        let mut conn = self.redis.clone();

        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&keys.dead_letter, &serialized)
            .lpush(&keys.failed, &serialized)
            .ltrim(&keys.failed, 0, keep as isize - 1)
            .incr(&keys.failed_total, 1);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(RetryDecision::DeadLettered { attempts })
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let waiting: u64 = conn.llen(&keys.waiting).await?;
        let active: u64 = conn.llen(&keys.active).await?;
        let delayed: u64 = conn.zcard(&keys.delayed).await?;
        let completed: Option<u64> = conn.get(&keys.completed_total).await?;
        let failed: Option<u64> = conn.get(&keys.failed_total).await?;

        let since: HashMap<String, i64> = conn.hgetall(&keys.active_since).await?;
        let cutoff = Utc::now().timestamp_millis() - self.stall_after.as_millis() as i64;
        let stalled = since.values().filter(|started| **started < cutoff).count() as u64;

        Ok(QueueCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            delayed,
            stalled,
        })
    }

    async fn pause(&self, queue: QueueName) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(&self.keys(queue).paused, 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.keys(queue).paused).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: QueueName) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let paused: bool = conn.exists(&self.keys(queue).paused).await?;
        Ok(paused)
    }

    async fn memory_usage(&self) -> Result<Option<u64>, QueueError> {
        let mut conn = self.redis.clone();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await?;
        Ok(parse_used_memory(&info))
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;

        for queue in QueueName::ALL {
            let keys = self.keys(queue);
            let mut conn = self.redis.clone();
            let jobs: Vec<String> = conn.lrange(&keys.active, 0, -1).await?;

            for job_data in jobs {
                let Ok(job) = serde_json::from_str::<Job>(&job_data) else {
                    warn!(queue = %queue, "Dropping unparseable active entry");
                    conn.lrem::<_, _, ()>(&keys.active, 1, &job_data).await?;
                    continue;
                };

                // The interrupted delivery already counted as an attempt.
                if self.policy_for(&job, queue).allows_retry(job.metadata.attempts) {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .lrem(&keys.active, 1, &job_data)
                        .hdel(&keys.active_since, job.id.to_string())
                        .rpush(&keys.waiting, &job_data);
                    pipe.query_async::<_, ()>(&mut conn).await?;
                    recovered += 1;
                } else {
                    self.fail(
                        queue,
                        job,
                        &JobError::Fatal("recovered from active list after max attempts".into()),
                    )
                    .await?;
                }
            }
        }

        debug!(recovered = recovered, "Active list recovery finished");
        Ok(recovered)
    }
}

/// Extracts `used_memory` from the output of `INFO memory`.
/// Inclusive LRANGE stop index for the first `limit` entries.
///
/// `None` for a zero limit, since a stop of -1 would select the whole list.
fn lrange_stop(limit: usize) -> Option<isize> {
    match limit {
        0 => None,
        n => Some(isize::try_from(n).map_or(-1, |n| n - 1)),
    }
}

fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix("used_memory:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_keys() {
        let keys = PartitionKeys::new("applyflow", QueueName::High);
        assert_eq!(keys.waiting, "applyflow:high:waiting");
        assert_eq!(keys.active, "applyflow:high:active");
        assert_eq!(keys.delayed, "applyflow:high:delayed");
        assert_eq!(keys.dead_letter, "applyflow:high:dead_letter");
        assert_eq!(keys.paused, "applyflow:high:paused");
    }

    #[test]
    fn test_parse_used_memory() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        assert_eq!(parse_used_memory(info), Some(1_048_576));
        assert_eq!(parse_used_memory("# Memory\r\n"), None);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let job = Job::new(
            "user-1",
            "posting-1",
            crate::scheduler::JobKind::Standard,
            serde_json::Value::Null,
        );
        let error = JobError::Fatal("form changed".into());

        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: serde_json::Value =
            serde_json::from_str(&serialized).expect("should parse back");

        assert!(parsed.get("job").is_some());
        assert_eq!(parsed["error"]["kind"], "fatal");
        assert!(parsed.get("moved_at").is_some());
    }

    #[test]
    fn test_lrange_stop() {
        assert_eq!(lrange_stop(0), None);
        assert_eq!(lrange_stop(1), Some(0));
        assert_eq!(lrange_stop(10), Some(9));
        assert_eq!(lrange_stop(usize::MAX), Some(-1));
    }
}
