//! Job persistence. `Local` keeps everything in one process; `Shared` puts
//! the queues in redis so several broker instances can serve one farm. Both
//! uphold the same invariant: removing a job from "available" is atomic, so
//! no two calls can lease the same job.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use protocol::{JobAssignment, JobId, JobSpec};
use rand::seq::SliceRandom;

use super::shared::SharedStore;

pub enum Store {
    Local(LocalStore),
    Shared(SharedStore),
}

impl Store {
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        match self {
            Store::Local(s) => Ok(s.submit(spec)),
            Store::Shared(s) => s.submit(spec).await,
        }
    }

    pub async fn acquire(
        &self,
        worker: &str,
        types: &[String],
        exclude: &HashSet<JobId>,
    ) -> Result<Option<JobAssignment>> {
        match self {
            Store::Local(s) => Ok(s.acquire(worker, types, exclude)),
            Store::Shared(s) => s.acquire(worker, types, exclude).await,
        }
    }

    /// Ownership-checked; `false` means the job was not assigned to this
    /// worker and nothing happened.
    pub async fn complete(&self, worker: &str, id: JobId) -> Result<bool> {
        match self {
            Store::Local(s) => Ok(s.complete(worker, id)),
            Store::Shared(s) => s.complete(worker, id).await,
        }
    }

    pub async fn fail(&self, worker: &str, id: JobId, message: &str) -> Result<bool> {
        match self {
            Store::Local(s) => Ok(s.fail(worker, id, message)),
            Store::Shared(s) => s.fail(worker, id, message).await,
        }
    }

    /// Explicit forfeiture back to "available".
    pub async fn reject(&self, worker: &str, id: JobId) -> Result<bool> {
        match self {
            Store::Local(s) => Ok(s.reject(worker, id)),
            Store::Shared(s) => s.reject(worker, id).await,
        }
    }

    /// Force-fail a job regardless of assignee (producer abort).
    pub async fn abort(&self, id: JobId) -> Result<Option<String>> {
        match self {
            Store::Local(s) => Ok(s.abort(id)),
            Store::Shared(s) => s.abort(id).await,
        }
    }

    /// Requeue every assignment whose lease has run out; returns the
    /// requeued jobs as `(id, type)`.
    pub async fn reap_expired(&self) -> Result<Vec<(JobId, String)>> {
        match self {
            Store::Local(s) => Ok(s.reap_expired(Instant::now())),
            Store::Shared(s) => s.reap_expired().await,
        }
    }

    /// Release everything a disconnected worker held, without penalty.
    pub async fn release_worker(&self, worker: &str) -> Result<Vec<(JobId, String)>> {
        match self {
            Store::Local(s) => Ok(s.release_worker(worker)),
            Store::Shared(s) => s.release_worker(worker).await,
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobState {
    Available,
    Assigned { worker: String, assigned_at: Instant },
    Failed { message: String },
}

#[derive(Debug)]
struct Job {
    spec: JobSpec,
    state: JobState,
}

#[derive(Default)]
struct LocalInner {
    jobs: HashMap<JobId, Job>,
    /// Per-type ids currently in `Available` state.
    available: HashMap<String, Vec<JobId>>,
}

#[derive(Default)]
pub struct LocalStore {
    inner: RwLock<LocalInner>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, spec: JobSpec) -> JobId {
        let id = JobId::next_id();
        let mut inner = self.inner.write();
        inner.available.entry(spec.ty.clone()).or_default().push(id);
        inner.jobs.insert(
            id,
            Job {
                spec,
                state: JobState::Available,
            },
        );
        id
    }

    pub fn acquire(
        &self,
        worker: &str,
        types: &[String],
        exclude: &HashSet<JobId>,
    ) -> Option<JobAssignment> {
        let mut inner = self.inner.write();

        // Uniform-random over the union of the requested types, minus the
        // caller's exclusions. Random, not FIFO: a job one worker cannot run
        // must not block the head of the queue for everyone.
        let candidates: Vec<JobId> = types
            .iter()
            .flat_map(|ty| inner.available.get(ty).into_iter().flatten())
            .filter(|id| !exclude.contains(id))
            .copied()
            .collect();
        let id = *candidates.choose(&mut rand::thread_rng())?;

        let job = inner.jobs.get_mut(&id).expect("available id has a job");
        job.state = JobState::Assigned {
            worker: worker.to_string(),
            assigned_at: Instant::now(),
        };
        let assignment = JobAssignment {
            id,
            spec: job.spec.clone(),
        };
        let queue = inner
            .available
            .get_mut(&assignment.spec.ty)
            .expect("type queue exists");
        queue.retain(|qid| *qid != id);
        Some(assignment)
    }

    pub fn complete(&self, worker: &str, id: JobId) -> bool {
        let mut inner = self.inner.write();
        if !owns(&inner, worker, id) {
            return false;
        }
        inner.jobs.remove(&id);
        true
    }

    pub fn fail(&self, worker: &str, id: JobId, message: &str) -> bool {
        let mut inner = self.inner.write();
        if !owns(&inner, worker, id) {
            return false;
        }
        let job = inner.jobs.get_mut(&id).expect("owned id has a job");
        job.state = JobState::Failed {
            message: message.to_string(),
        };
        true
    }

    pub fn reject(&self, worker: &str, id: JobId) -> bool {
        let mut inner = self.inner.write();
        if !owns(&inner, worker, id) {
            return false;
        }
        requeue(&mut inner, id);
        true
    }

    pub fn abort(&self, id: JobId) -> Option<String> {
        let mut inner = self.inner.write();
        let job = inner.jobs.remove(&id)?;
        if let JobState::Available = job.state {
            if let Some(queue) = inner.available.get_mut(&job.spec.ty) {
                queue.retain(|qid| *qid != id);
            }
            return None;
        }
        match job.state {
            JobState::Assigned { worker, .. } => Some(worker),
            _ => None,
        }
    }

    pub fn reap_expired(&self, now: Instant) -> Vec<(JobId, String)> {
        let mut inner = self.inner.write();
        let expired: Vec<JobId> = inner
            .jobs
            .iter()
            .filter_map(|(id, job)| match &job.state {
                JobState::Assigned { assigned_at, .. }
                    if now.duration_since(*assigned_at)
                        > Duration::from_secs(job.spec.expiry_secs) =>
                {
                    Some(*id)
                }
                _ => None,
            })
            .collect();
        expired
            .into_iter()
            .map(|id| (id, requeue(&mut inner, id)))
            .collect()
    }

    pub fn release_worker(&self, worker: &str) -> Vec<(JobId, String)> {
        let mut inner = self.inner.write();
        let held: Vec<JobId> = inner
            .jobs
            .iter()
            .filter_map(|(id, job)| match &job.state {
                JobState::Assigned { worker: w, .. } if w == worker => Some(*id),
                _ => None,
            })
            .collect();
        held.into_iter()
            .map(|id| (id, requeue(&mut inner, id)))
            .collect()
    }

    /// Test/introspection hook: who currently holds `id`?
    pub fn assignee(&self, id: JobId) -> Option<String> {
        let inner = self.inner.read();
        match &inner.jobs.get(&id)?.state {
            JobState::Assigned { worker, .. } => Some(worker.clone()),
            _ => None,
        }
    }

    pub fn available_count(&self, ty: &str) -> usize {
        self.inner
            .read()
            .available
            .get(ty)
            .map_or(0, |queue| queue.len())
    }
}

fn owns(inner: &LocalInner, worker: &str, id: JobId) -> bool {
    matches!(
        inner.jobs.get(&id).map(|job| &job.state),
        Some(JobState::Assigned { worker: w, .. }) if w == worker
    )
}

fn requeue(inner: &mut LocalInner, id: JobId) -> String {
    let job = inner.jobs.get_mut(&id).expect("requeued id has a job");
    job.state = JobState::Available;
    let ty = job.spec.ty.clone();
    inner.available.entry(ty.clone()).or_default().push(id);
    ty
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(ty: &str) -> JobSpec {
        JobSpec {
            ty: ty.into(),
            destination: "out".into(),
            description: json!({"frame": 1}),
            prerequisites: vec![],
            expiry_secs: 60,
        }
    }

    fn spec_with_expiry(ty: &str, expiry_secs: u64) -> JobSpec {
        JobSpec {
            expiry_secs,
            ..spec(ty)
        }
    }

    #[test]
    fn acquire_assigns_and_dequeues() {
        let store = LocalStore::new();
        let id = store.submit(spec("render"));
        let got = store
            .acquire("w1", &["render".into()], &HashSet::new())
            .unwrap();
        assert_eq!(got.id, id);
        assert_eq!(store.assignee(id).as_deref(), Some("w1"));
        assert_eq!(store.available_count("render"), 0);
        // a second worker finds nothing
        assert!(store
            .acquire("w2", &["render".into()], &HashSet::new())
            .is_none());
    }

    #[test]
    fn exclusion_list_skips_poisoned_jobs() {
        let store = LocalStore::new();
        let poisoned = store.submit(spec("render"));
        let exclude: HashSet<JobId> = [poisoned].into();
        assert!(store.acquire("w1", &["render".into()], &exclude).is_none());

        let fresh = store.submit(spec("render"));
        let got = store.acquire("w1", &["render".into()], &exclude).unwrap();
        assert_eq!(got.id, fresh);
    }

    #[test]
    fn acquire_spans_requested_types() {
        let store = LocalStore::new();
        store.submit(spec("primes"));
        let got = store
            .acquire("w1", &["render".into(), "primes".into()], &HashSet::new())
            .unwrap();
        assert_eq!(got.spec.ty, "primes");
    }

    #[test]
    fn ownership_guard_makes_mismatches_noops() {
        let store = LocalStore::new();
        let id = store.submit(spec("render"));
        store
            .acquire("worker-a", &["render".into()], &HashSet::new())
            .unwrap();

        assert!(!store.complete("worker-b", id));
        assert!(!store.fail("worker-b", id, "nope"));
        assert!(!store.reject("worker-b", id));
        assert_eq!(store.assignee(id).as_deref(), Some("worker-a"));

        assert!(store.complete("worker-a", id));
        // stale duplicate after completion is also a no-op
        assert!(!store.complete("worker-a", id));
    }

    #[test]
    fn reject_returns_job_to_available() {
        let store = LocalStore::new();
        let id = store.submit(spec("render"));
        store
            .acquire("w1", &["render".into()], &HashSet::new())
            .unwrap();
        assert!(store.reject("w1", id));
        assert_eq!(store.available_count("render"), 1);

        let again = store
            .acquire("w2", &["render".into()], &HashSet::new())
            .unwrap();
        assert_eq!(again.id, id);
    }

    #[test]
    fn expired_leases_are_reaped() {
        let store = LocalStore::new();
        let id = store.submit(spec_with_expiry("render", 0));
        let keeper = store.submit(spec_with_expiry("render", 3600));
        store
            .acquire("w1", &["render".into()], &[keeper].into())
            .unwrap();
        store
            .acquire("w1", &["render".into()], &HashSet::new())
            .unwrap();

        let reaped = store.reap_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(reaped, vec![(id, "render".to_string())]);
        assert_eq!(store.assignee(id), None);
        // leasable by anyone again
        let again = store
            .acquire("w2", &["render".into()], &HashSet::new())
            .unwrap();
        assert_eq!(again.id, id);
        // the unexpired lease survived
        assert_eq!(store.assignee(keeper).as_deref(), Some("w1"));
    }

    #[test]
    fn worker_disconnect_releases_assignments() {
        let store = LocalStore::new();
        let id = store.submit(spec("render"));
        store
            .acquire("w1", &["render".into()], &HashSet::new())
            .unwrap();
        let released = store.release_worker("w1");
        assert_eq!(released, vec![(id, "render".to_string())]);
        assert_eq!(store.available_count("render"), 1);
    }

    #[test]
    fn abort_removes_assigned_job_and_names_the_worker() {
        let store = LocalStore::new();
        let id = store.submit(spec("render"));
        store
            .acquire("w1", &["render".into()], &HashSet::new())
            .unwrap();
        assert_eq!(store.abort(id).as_deref(), Some("w1"));
        // worker's stale completion is now a no-op
        assert!(!store.complete("w1", id));
    }
}
