//! Redis-backed variant of the job store, for several broker instances
//! sharing one farm. Consistency rests on redis primitives only: `INCR` for
//! id allocation, `SPOP` for the atomically-race-free random dequeue, one
//! hash per job for lease metadata. New submissions are published on a
//! pub/sub channel so idle brokers can flush their waitlists instead of
//! busy-polling.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use protocol::{JobAssignment, JobId, JobSpec};
use rand::seq::SliceRandom;
use redis::AsyncCommands;
use tracing::{error, warn};
use utils::db_pools::redis::redis_conn;

pub const SUBMISSION_CHANNEL: &str = "maru:submitted";

const ID_KEY: &str = "maru:id";
const ASSIGNED_KEY: &str = "maru:assigned";

fn avail_key(ty: &str) -> String {
    format!("maru:avail:{ty}")
}

fn job_key(id: JobId) -> String {
    format!("maru:job:{id}")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

#[derive(Default)]
pub struct SharedStore {}

impl SharedStore {
    pub fn new() -> Self {
        Self {}
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let mut conn = redis_conn().await?;
        let raw: u64 = conn.incr(ID_KEY, 1u64).await?;
        let id = JobId::from(raw);

        let payload = serde_json::to_string(&spec)?;
        let expiry = spec.expiry_secs.to_string();
        let _: () = conn
            .hset_multiple(
                job_key(id),
                &[("spec", payload.as_str()), ("expiry", expiry.as_str())],
            )
            .await?;
        let _: () = conn.sadd(avail_key(&spec.ty), id.to_string()).await?;
        let _: () = conn
            .publish(SUBMISSION_CHANNEL, format!("{id}:{}", spec.ty))
            .await?;
        Ok(id)
    }

    pub async fn acquire(
        &self,
        worker: &str,
        types: &[String],
        exclude: &HashSet<JobId>,
    ) -> Result<Option<JobAssignment>> {
        let mut conn = redis_conn().await?;

        // SPOP is the atomic dequeue: concurrent brokers can never pop the
        // same id. Excluded ids are set aside and restored afterwards so the
        // exclusion does not bias future polls.
        let mut order: Vec<&String> = types.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        // Excluded ids leave the set while we scan; they must go back even
        // when a later command fails, or they stay invisible until a requeue.
        let mut taken: Option<(JobId, String)> = None;
        let mut stashed: Vec<(String, String)> = Vec::new();
        let mut scan_err: Option<redis::RedisError> = None;
        'types: for ty in order {
            let key = avail_key(ty);
            loop {
                let popped: Option<String> = match redis::cmd("SPOP")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                {
                    Ok(popped) => popped,
                    Err(err) => {
                        scan_err = Some(err);
                        break 'types;
                    }
                };
                let Some(raw) = popped else { break };
                let Ok(id) = raw.parse::<JobId>() else {
                    warn!(%raw, "dropping unparsable id in available set");
                    continue;
                };
                if exclude.contains(&id) {
                    stashed.push((key.clone(), raw));
                } else {
                    taken = Some((id, ty.clone()));
                    break 'types;
                }
            }
        }
        for (key, raw) in stashed {
            let _: () = conn.sadd(key, raw).await?;
        }
        if let Some(err) = scan_err {
            return Err(err.into());
        }

        let Some((id, _ty)) = taken else {
            return Ok(None);
        };

        let payload: Option<String> = conn.hget(job_key(id), "spec").await?;
        let payload = payload.context("leased job has no spec")?;
        let spec: JobSpec = serde_json::from_str(&payload)?;

        let assigned_at = unix_now().to_string();
        let _: () = conn
            .hset_multiple(
                job_key(id),
                &[("worker", worker), ("assigned_at", assigned_at.as_str())],
            )
            .await?;
        let _: () = conn.sadd(ASSIGNED_KEY, id.to_string()).await?;

        Ok(Some(JobAssignment { id, spec }))
    }

    async fn owns(conn: &mut deadpool_redis::Connection, worker: &str, id: JobId) -> Result<bool> {
        let assignee: Option<String> = conn.hget(job_key(id), "worker").await?;
        Ok(assignee.as_deref() == Some(worker))
    }

    pub async fn complete(&self, worker: &str, id: JobId) -> Result<bool> {
        let mut conn = redis_conn().await?;
        if !Self::owns(&mut conn, worker, id).await? {
            return Ok(false);
        }
        let _: () = conn.del(job_key(id)).await?;
        let _: () = conn.srem(ASSIGNED_KEY, id.to_string()).await?;
        Ok(true)
    }

    pub async fn fail(&self, worker: &str, id: JobId, message: &str) -> Result<bool> {
        let mut conn = redis_conn().await?;
        if !Self::owns(&mut conn, worker, id).await? {
            return Ok(false);
        }
        let _: () = conn.hset(job_key(id), "failed", message).await?;
        let _: () = conn.hdel(job_key(id), &["worker", "assigned_at"]).await?;
        let _: () = conn.srem(ASSIGNED_KEY, id.to_string()).await?;
        Ok(true)
    }

    pub async fn reject(&self, worker: &str, id: JobId) -> Result<bool> {
        let mut conn = redis_conn().await?;
        if !Self::owns(&mut conn, worker, id).await? {
            return Ok(false);
        }
        Self::requeue(&mut conn, id).await?;
        Ok(true)
    }

    pub async fn abort(&self, id: JobId) -> Result<Option<String>> {
        let mut conn = redis_conn().await?;
        let assignee: Option<String> = conn.hget(job_key(id), "worker").await?;
        let spec: Option<String> = conn.hget(job_key(id), "spec").await?;
        if let Some(payload) = spec {
            if let Ok(spec) = serde_json::from_str::<JobSpec>(&payload) {
                let _: () = conn.srem(avail_key(&spec.ty), id.to_string()).await?;
            }
        }
        let _: () = conn.del(job_key(id)).await?;
        let _: () = conn.srem(ASSIGNED_KEY, id.to_string()).await?;
        Ok(assignee)
    }

    pub async fn reap_expired(&self) -> Result<Vec<(JobId, String)>> {
        let mut conn = redis_conn().await?;
        let assigned: Vec<String> = conn.smembers(ASSIGNED_KEY).await?;
        let now = unix_now();

        let mut reaped = Vec::new();
        for raw in assigned {
            let Ok(id) = raw.parse::<JobId>() else {
                continue;
            };
            let assigned_at: Option<u64> = conn.hget(job_key(id), "assigned_at").await?;
            let expiry: Option<u64> = conn.hget(job_key(id), "expiry").await?;
            let (Some(assigned_at), Some(expiry)) = (assigned_at, expiry) else {
                let _: () = conn.srem(ASSIGNED_KEY, raw).await?;
                continue;
            };
            if now.saturating_sub(assigned_at) > expiry {
                if let Some(ty) = Self::requeue(&mut conn, id).await? {
                    reaped.push((id, ty));
                }
            }
        }
        Ok(reaped)
    }

    pub async fn release_worker(&self, worker: &str) -> Result<Vec<(JobId, String)>> {
        let mut conn = redis_conn().await?;
        let assigned: Vec<String> = conn.smembers(ASSIGNED_KEY).await?;

        let mut released = Vec::new();
        for raw in assigned {
            let Ok(id) = raw.parse::<JobId>() else {
                continue;
            };
            if Self::owns(&mut conn, worker, id).await? {
                if let Some(ty) = Self::requeue(&mut conn, id).await? {
                    released.push((id, ty));
                }
            }
        }
        Ok(released)
    }

    /// Back to "available": clear the lease fields and re-add the id to its
    /// type set. Returns the job type.
    async fn requeue(conn: &mut deadpool_redis::Connection, id: JobId) -> Result<Option<String>> {
        let payload: Option<String> = conn.hget(job_key(id), "spec").await?;
        let Some(payload) = payload else {
            // job vanished (completed by its real owner meanwhile)
            let _: () = conn.srem(ASSIGNED_KEY, id.to_string()).await?;
            return Ok(None);
        };
        let spec: JobSpec = serde_json::from_str(&payload)?;
        let _: () = conn.hdel(job_key(id), &["worker", "assigned_at"]).await?;
        let _: () = conn.srem(ASSIGNED_KEY, id.to_string()).await?;
        let _: () = conn.sadd(avail_key(&spec.ty), id.to_string()).await?;
        Ok(Some(spec.ty))
    }
}

/// Subscribe to the submission channel and flush the local waitlist for each
/// announced type. Runs until the process exits; reconnects on error.
pub async fn run_submission_listener(url: String, broker: super::Broker) {
    loop {
        if let Err(err) = listen_once(&url, &broker).await {
            error!(?err, "submission listener lost, reconnecting");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn listen_once(url: &str, broker: &super::Broker) -> Result<()> {
    use futures::StreamExt;

    let client = redis::Client::open(url)?;
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(SUBMISSION_CHANNEL).await?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = msg.get_payload()?;
        match payload.split_once(':') {
            Some((_id, ty)) => broker.notify_type(ty),
            None => warn!(%payload, "malformed submission notice"),
        }
    }
    Ok(())
}
