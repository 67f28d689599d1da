//! Request/reply correlation over a single connection.
//!
//! Outbound requests that expect a reply get the connection's next trigger
//! id; the pending future lives exactly as long as the reply is outstanding.
//! Ids grow monotonically and are never recycled while outstanding; a u64
//! gives enough headroom that wraparound is not a concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::frame::Command;
use crate::{CmdError, ErrorKind};

pub type ReplyPayload = Vec<Vec<u8>>;
pub type Reply = Result<ReplyPayload, CmdError>;

pub struct Correlator {
    next: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next trigger and register its pending future.
    pub fn register(&self) -> (u64, oneshot::Receiver<Reply>) {
        let trigger = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(trigger, tx);
        (trigger, rx)
    }

    /// Settle the future for `trigger`. Unknown ids (duplicate or late
    /// replies) are silently ignored; returns whether anything was resolved.
    pub fn resolve(&self, trigger: u64, reply: Reply) -> bool {
        let sender = self.pending.lock().remove(&trigger);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Interpret an inbound `RESULT`/`ERROR` frame: the first argument is the
    /// trigger, the rest is payload.
    pub fn resolve_from_wire(&self, cmd: &Command) -> bool {
        let Some(trigger) = cmd
            .args
            .first()
            .and_then(|arg| std::str::from_utf8(arg).ok())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            return false;
        };
        match cmd.name.as_str() {
            "RESULT" => self.resolve(trigger, Ok(cmd.args[1..].to_vec())),
            "ERROR" => {
                let kind = cmd
                    .args
                    .get(1)
                    .and_then(|arg| std::str::from_utf8(arg).ok())
                    .and_then(|s| s.parse::<ErrorKind>().ok())
                    .unwrap_or(ErrorKind::Internal);
                let message = cmd
                    .args
                    .get(2)
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .unwrap_or_default();
                self.resolve(trigger, Err(CmdError::new(kind, message)))
            }
            _ => false,
        }
    }

    /// Connection teardown: settle every pending future as failed so no
    /// caller waits forever. Dropping the senders cancels the receivers.
    pub fn fail_all(&self) {
        self.pending.lock().clear();
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_are_distinct_and_increasing() {
        let correlator = Correlator::new();
        let mut last = 0;
        for _ in 0..16 {
            let (trigger, _rx) = correlator.register();
            assert!(trigger > last);
            last = trigger;
        }
        assert_eq!(correlator.outstanding(), 16);
    }

    #[tokio::test]
    async fn second_resolution_has_no_effect() {
        let correlator = Correlator::new();
        let (trigger, rx) = correlator.register();
        assert!(correlator.resolve(trigger, Ok(vec![b"one".to_vec()])));
        assert!(!correlator.resolve(trigger, Ok(vec![b"two".to_vec()])));
        assert_eq!(rx.await.unwrap().unwrap(), vec![b"one".to_vec()]);
    }

    #[test]
    fn unknown_trigger_is_ignored() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(99, Ok(vec![])));
    }

    #[tokio::test]
    async fn wire_result_and_error_settle_futures() {
        let correlator = Correlator::new();
        let (t1, rx1) = correlator.register();
        let (t2, rx2) = correlator.register();

        let result = Command::new(
            "RESULT",
            vec![t1.to_string().into_bytes(), b"PONG".to_vec()],
        );
        assert!(correlator.resolve_from_wire(&result));
        assert_eq!(rx1.await.unwrap().unwrap(), vec![b"PONG".to_vec()]);

        let error = Command::new(
            "ERROR",
            vec![
                t2.to_string().into_bytes(),
                b"NoJobsAvailable".to_vec(),
                b"nothing to do".to_vec(),
            ],
        );
        assert!(correlator.resolve_from_wire(&error));
        let err = rx2.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoJobsAvailable);
    }

    #[tokio::test]
    async fn teardown_settles_pending_futures() {
        let correlator = Correlator::new();
        let (_t, rx) = correlator.register();
        correlator.fail_all();
        assert!(rx.await.is_err());
        assert_eq!(correlator.outstanding(), 0);
    }
}
