//! The polling loop: rotate across brokers, lease at most `max_jobs` at a
//! time, and keep a per-broker blacklist of jobs this host cannot stage.

pub mod pipeline;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::{JobAssignment, JobId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::{BrokerClient, ClientEvent, ConnectOptions};
use crate::config::Config;
use pipeline::{JobOutcome, Registry};

struct Slot {
    addr: String,
    client: Option<BrokerClient>,
    /// Jobs this worker rejected; never re-polled from this broker.
    blacklist: HashSet<JobId>,
}

struct RunningJob {
    cancel: oneshot::Sender<()>,
}

pub struct DispatchLoop {
    opts: ConnectOptions,
    poll_interval: Duration,
    max_jobs: usize,
    workdir: PathBuf,
    registry: Arc<Registry>,
    http: reqwest::Client,
    slots: Vec<Slot>,
    cursor: usize,
    running: HashMap<JobId, RunningJob>,
    events_tx: UnboundedSender<(usize, ClientEvent)>,
    events_rx: Option<UnboundedReceiver<(usize, ClientEvent)>>,
    outcomes_tx: UnboundedSender<(usize, JobOutcome)>,
    outcomes_rx: Option<UnboundedReceiver<(usize, JobOutcome)>>,
}

impl DispatchLoop {
    pub fn new(config: &Config, registry: Arc<Registry>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            opts: ConnectOptions {
                name: config.name.clone(),
                owner: config.owner.clone(),
                shared_secret: config.shared_secret.clone(),
            },
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_jobs: config.max_jobs.max(1),
            workdir: config.workdir.clone(),
            registry,
            http: reqwest::Client::new(),
            slots: config
                .brokers
                .iter()
                .map(|addr| Slot {
                    addr: addr.clone(),
                    client: None,
                    blacklist: HashSet::new(),
                })
                .collect(),
            cursor: 0,
            running: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            outcomes_tx,
            outcomes_rx: Some(outcomes_rx),
        }
    }

    /// Poll until `shutdown` resolves. Running jobs are cancelled on the way
    /// out; their leases lapse at the brokers and get requeued by the sweep.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        // receivers leave self so select arms do not hold it borrowed
        let (Some(mut events_rx), Some(mut outcomes_rx)) =
            (self.events_rx.take(), self.outcomes_rx.take())
        else {
            return;
        };
        loop {
            let mut acquired = false;
            if self.running.len() < self.max_jobs {
                acquired = self.poll_once().await;
            }
            if acquired {
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                Some((tag, event)) = events_rx.recv() => self.on_event(tag, event),
                Some((tag, outcome)) = outcomes_rx.recv() => self.on_outcome(tag, outcome),
                _ = tokio::time::sleep(self.poll_interval),
                    if self.running.len() < self.max_jobs => {}
            }
        }
        info!("dispatch loop stopping");
        for (id, job) in self.running.drain() {
            debug!(%id, "cancelling running job");
            let _ = job.cancel.send(());
        }
    }

    /// One rotation over the brokers, starting past the last acquisition so
    /// a busy broker cannot starve the others.
    async fn poll_once(&mut self) -> bool {
        let types = self.registry.types();
        let n = self.slots.len();
        for idx in rotation_order(self.cursor, n) {
            if let Some(assignment) = self.try_acquire(idx, &types).await {
                self.cursor = (idx + 1) % n;
                self.spawn_job(idx, assignment);
                return true;
            }
        }
        false
    }

    async fn try_acquire(&mut self, idx: usize, types: &[String]) -> Option<JobAssignment> {
        let slot = &mut self.slots[idx];
        if slot.client.as_ref().map(|c| c.is_closed()).unwrap_or(true) {
            match BrokerClient::connect(&slot.addr, &self.opts, self.events_tx.clone(), idx).await {
                Ok(client) => {
                    info!(addr = %slot.addr, broker = client.broker_name(), "connected");
                    slot.client = Some(client);
                }
                Err(err) => {
                    warn!(addr = %slot.addr, err = %format!("{err:#}"), "broker unreachable");
                    slot.client = None;
                    return None;
                }
            }
        }
        let client = self.slots[idx].client.clone()?;
        match client.get(types, &self.slots[idx].blacklist).await {
            Ok(found) => found,
            Err(err) => {
                warn!(addr = %self.slots[idx].addr, %err, "poll failed");
                None
            }
        }
    }

    fn spawn_job(&mut self, idx: usize, assignment: JobAssignment) {
        let Some(client) = self.slots[idx].client.clone() else {
            return;
        };
        let id = assignment.id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running.insert(id, RunningJob { cancel: cancel_tx });

        let http = self.http.clone();
        let registry = self.registry.clone();
        let workdir = self.workdir.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let outcome =
                pipeline::run_job(client, http, registry, workdir, assignment, cancel_rx).await;
            let _ = outcomes.send((idx, outcome));
        });
    }

    fn on_event(&mut self, tag: usize, event: ClientEvent) {
        match event {
            ClientEvent::JobAvailable(ty) => {
                // the wake alone matters; the next rotation polls everyone
                debug!(addr = %self.slots[tag].addr, ty, "job available nudge");
            }
            ClientEvent::Abort(id) => {
                if let Some(job) = self.running.remove(&id) {
                    info!(%id, "broker aborted job");
                    let _ = job.cancel.send(());
                }
            }
            ClientEvent::Closed => {
                warn!(addr = %self.slots[tag].addr, "broker connection lost");
                self.slots[tag].client = None;
            }
        }
    }

    fn on_outcome(&mut self, tag: usize, outcome: JobOutcome) {
        self.running.remove(&outcome.id());
        if let JobOutcome::Rejected(id) = outcome {
            self.slots[tag].blacklist.insert(id);
        }
    }
}

fn rotation_order(cursor: usize, n: usize) -> impl Iterator<Item = usize> {
    (0..n).map(move |i| (cursor + i) % n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_starts_at_the_cursor_and_wraps() {
        assert_eq!(rotation_order(0, 3).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(rotation_order(2, 3).collect::<Vec<_>>(), vec![2, 0, 1]);
        assert_eq!(rotation_order(5, 1).collect::<Vec<_>>(), vec![0]);
        assert_eq!(rotation_order(0, 0).count(), 0);
    }
}
