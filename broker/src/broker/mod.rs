//! The scheduling engine: job/worker state, lifecycle transitions, lease
//! reaping, and the per-type waitlists that let idle connections sleep until
//! work of their type shows up.

pub mod shared;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use protocol::frame::Command;
use protocol::{CmdError, ErrorKind, JobAssignment, JobId, JobSpec};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use store::Store;

/// Handle for pushing unsolicited commands (JOB_AVAILABLE, ABORT) to a
/// connection's write task. Each transport converts to its own framing.
pub type Outbound = UnboundedSender<Command>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Registered,
    Ready,
    Busy,
}

pub struct WorkerEntry {
    pub owner: String,
    pub state: WorkerState,
    pub jobs: HashSet<JobId>,
    conn: Outbound,
}

struct Waiter {
    worker: String,
    conn: Outbound,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<String, WorkerEntry>,
    waitlists: HashMap<String, Vec<Waiter>>,
}

struct BrokerInner {
    name: String,
    store: Store,
    /// Shared-store mode: submissions are announced via pub/sub, so local
    /// submit must not double-notify.
    shared: bool,
    registry: RwLock<Registry>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(name: String, store: Store) -> Self {
        let shared = matches!(store, Store::Shared(_));
        Self {
            inner: Arc::new(BrokerInner {
                name,
                store,
                shared,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn register_worker(&self, name: &str, owner: &str, conn: Outbound) {
        let mut registry = self.inner.registry.write();
        if registry.workers.contains_key(name) {
            warn!(worker = name, "re-registering worker, replacing connection");
        }
        let jobs = registry
            .workers
            .remove(name)
            .map(|entry| entry.jobs)
            .unwrap_or_default();
        registry.workers.insert(
            name.to_string(),
            WorkerEntry {
                owner: owner.to_string(),
                state: WorkerState::Registered,
                jobs,
                conn,
            },
        );
    }

    /// Worker finished its side of the handshake and may poll.
    pub fn mark_ready(&self, name: &str) {
        if let Some(entry) = self.inner.registry.write().workers.get_mut(name) {
            if entry.state == WorkerState::Registered {
                entry.state = WorkerState::Ready;
            }
        }
    }

    /// Disconnect: drop the entry and put its leases back, no penalty.
    pub async fn unregister_worker(&self, name: &str) {
        self.inner.registry.write().workers.remove(name);
        match self.inner.store.release_worker(name).await {
            Ok(released) => {
                for (id, ty) in released {
                    info!(worker = name, %id, %ty, "released lease of departed worker");
                    self.notify_type(&ty);
                }
            }
            Err(err) => error!(?err, worker = name, "failed to release worker leases"),
        }
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let ty = spec.ty.clone();
        let id = self.inner.store.submit(spec).await?;
        info!(%id, %ty, "job submitted");
        if !self.inner.shared {
            // shared mode hears about this through the pub/sub channel
            self.notify_type(&ty);
        }
        Ok(id)
    }

    pub async fn get(
        &self,
        worker: &str,
        types: &[String],
        exclude: &HashSet<JobId>,
        conn: &Outbound,
    ) -> Result<JobAssignment, CmdError> {
        let acquired = self
            .inner
            .store
            .acquire(worker, types, exclude)
            .await
            .map_err(internal)?;

        match acquired {
            Some(assignment) => {
                let mut registry = self.inner.registry.write();
                if let Some(entry) = registry.workers.get_mut(worker) {
                    entry.jobs.insert(assignment.id);
                    entry.state = WorkerState::Busy;
                }
                info!(worker, id = %assignment.id, ty = %assignment.spec.ty, "job leased");
                Ok(assignment)
            }
            None => {
                self.park(worker, types, conn);
                Err(CmdError::new(ErrorKind::NoJobsAvailable, "no jobs available"))
            }
        }
    }

    pub async fn complete(&self, worker: &str, id: JobId) -> Result<bool, CmdError> {
        let done = self
            .inner
            .store
            .complete(worker, id)
            .await
            .map_err(internal)?;
        if done {
            info!(worker, %id, "job completed");
            self.clear_assignment(worker, id);
        }
        Ok(done)
    }

    pub async fn fail(&self, worker: &str, id: JobId, message: &str) -> Result<bool, CmdError> {
        let done = self
            .inner
            .store
            .fail(worker, id, message)
            .await
            .map_err(internal)?;
        if done {
            warn!(worker, %id, message, "job failed");
            self.clear_assignment(worker, id);
        }
        Ok(done)
    }

    pub async fn reject(&self, worker: &str, id: JobId) -> Result<bool, CmdError> {
        let done = self
            .inner
            .store
            .reject(worker, id)
            .await
            .map_err(internal)?;
        if done {
            info!(worker, %id, "job forfeited");
            self.clear_assignment(worker, id);
        }
        Ok(done)
    }

    /// Producer abort. The job is removed outright; if a worker held it, an
    /// `ABORT` is pushed down its connection and any later completion from it
    /// falls into the ownership-guard no-op.
    pub async fn abort(&self, id: JobId) -> Result<(), CmdError> {
        let assignee = self.inner.store.abort(id).await.map_err(internal)?;
        if let Some(worker) = assignee {
            let mut registry = self.inner.registry.write();
            if let Some(entry) = registry.workers.get_mut(&worker) {
                entry.jobs.remove(&id);
                if entry.jobs.is_empty() && entry.state == WorkerState::Busy {
                    entry.state = WorkerState::Ready;
                }
                let abort = Command::new("ABORT", vec![id.to_string().into_bytes()]);
                if entry.conn.send(abort).is_err() {
                    warn!(%worker, %id, "worker connection gone, abort dropped");
                }
            }
        }
        Ok(())
    }

    /// Flush the waitlist for `ty`: every parked connection gets one
    /// `JOB_AVAILABLE` nudge to re-poll.
    pub fn notify_type(&self, ty: &str) {
        let waiters = {
            let mut registry = self.inner.registry.write();
            registry.waitlists.remove(ty).unwrap_or_default()
        };
        for waiter in waiters {
            let nudge = Command::new("JOB_AVAILABLE", vec![ty.as_bytes().to_vec()]);
            // send failure just means the connection died while parked
            let _ = waiter.conn.send(nudge);
        }
    }

    pub fn worker_state(&self, name: &str) -> Option<WorkerState> {
        self.inner
            .registry
            .read()
            .workers
            .get(name)
            .map(|entry| entry.state)
    }

    /// Fixed-interval lease sweep. One iteration's error is logged and must
    /// never stop subsequent sweeps.
    pub fn start_reaper(&self, interval: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match broker.inner.store.reap_expired().await {
                    Ok(reaped) => {
                        for (id, ty) in reaped {
                            // the presumed-dead worker is not notified
                            warn!(%id, %ty, "lease expired, job requeued");
                            broker.drop_assignment_records(id);
                            broker.notify_type(&ty);
                        }
                    }
                    Err(err) => error!(?err, "lease sweep iteration failed"),
                }
            }
        });
    }

    fn park(&self, worker: &str, types: &[String], conn: &Outbound) {
        let mut registry = self.inner.registry.write();
        if let Some(entry) = registry.workers.get_mut(worker) {
            if entry.jobs.is_empty() {
                entry.state = WorkerState::Ready;
            }
        }
        for ty in types {
            let waitlist = registry.waitlists.entry(ty.clone()).or_default();
            waitlist.retain(|w| w.worker != worker);
            waitlist.push(Waiter {
                worker: worker.to_string(),
                conn: conn.clone(),
            });
        }
    }

    fn clear_assignment(&self, worker: &str, id: JobId) {
        let mut registry = self.inner.registry.write();
        if let Some(entry) = registry.workers.get_mut(worker) {
            entry.jobs.remove(&id);
            if entry.jobs.is_empty() && entry.state == WorkerState::Busy {
                entry.state = WorkerState::Ready;
            }
        }
    }

    fn drop_assignment_records(&self, id: JobId) {
        let mut registry = self.inner.registry.write();
        for entry in registry.workers.values_mut() {
            if entry.jobs.remove(&id) && entry.jobs.is_empty() {
                entry.state = WorkerState::Ready;
            }
        }
    }
}

fn internal(err: anyhow::Error) -> CmdError {
    CmdError::new(ErrorKind::Internal, format!("{err:#}"))
}
