//! Client side of a broker connection: framed transport, trigger
//! correlation, and the auto-answered housekeeping commands (PING, the
//! broker's CHALLENGE). Unsolicited notifications are surfaced as events
//! tagged with the connection's slot index.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use protocol::frame::{Command, CommandCodec};
use protocol::handshake;
use protocol::rpc::Correlator;
use protocol::{CmdError, ErrorKind, JobAssignment, JobId, StoredFile};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

/// Unsolicited traffic pushed by the broker, plus the connection obituary.
#[derive(Debug)]
pub enum ClientEvent {
    JobAvailable(String),
    Abort(JobId),
    Closed,
}

pub struct ConnectOptions {
    pub name: String,
    pub owner: String,
    pub shared_secret: Option<String>,
}

#[derive(Clone)]
pub struct BrokerClient {
    broker_name: String,
    out: UnboundedSender<Command>,
    correlator: Arc<Correlator>,
    closed: Arc<AtomicBool>,
}

impl BrokerClient {
    /// Connect, identify as a worker, and complete the mutual challenge if a
    /// secret is configured. Events are tagged with `tag` so one receiver can
    /// serve every broker connection.
    pub async fn connect(
        addr: &str,
        opts: &ConnectOptions,
        events: UnboundedSender<(usize, ClientEvent)>,
        tag: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        let framed = Framed::new(stream, CommandCodec::new());
        let (mut sink, mut frames) = framed.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if sink.send(cmd).await.is_err() {
                    break;
                }
            }
        });

        let correlator = Arc::new(Correlator::new());
        let closed = Arc::new(AtomicBool::new(false));
        {
            let correlator = correlator.clone();
            let closed = closed.clone();
            let out = tx.clone();
            let secret = opts.shared_secret.clone();
            let addr = addr.to_string();
            tokio::spawn(async move {
                read_loop(&mut frames, &out, &correlator, secret.as_deref(), &events, tag).await;
                closed.store(true, Ordering::SeqCst);
                correlator.fail_all();
                debug!(%addr, "broker connection closed");
                let _ = events.send((tag, ClientEvent::Closed));
            });
        }

        let client = Self {
            broker_name: String::new(),
            out: tx,
            correlator,
            closed,
        };

        let identity = client
            .call(
                "IDENTIFY",
                vec![
                    b"worker".to_vec(),
                    opts.name.clone().into_bytes(),
                    opts.owner.clone().into_bytes(),
                ],
            )
            .await
            .map_err(|err| anyhow::anyhow!("identify refused: {err}"))?;
        let broker_name = identity
            .first()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .unwrap_or_default();

        // our half of the mutual proof: challenge the broker and check the
        // digest before trusting anything it assigns us
        if let Some(secret) = &opts.shared_secret {
            let nonce = handshake::new_challenge();
            let reply = client
                .call("CHALLENGE", vec![nonce.clone().into_bytes()])
                .await
                .map_err(|err| anyhow::anyhow!("challenge refused: {err}"))?;
            let verified = reply
                .first()
                .and_then(|arg| std::str::from_utf8(arg).ok())
                .map(|digest| handshake::verify_response(secret, &nonce, digest))
                .unwrap_or(false);
            if !verified {
                bail!("broker {addr} failed the challenge, refusing to poll it");
            }
        }

        Ok(Self {
            broker_name,
            ..client
        })
    }

    pub fn broker_name(&self) -> &str {
        &self.broker_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn call(&self, name: &str, args: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CmdError> {
        let gone = || CmdError::new(ErrorKind::Internal, "broker connection closed");
        if self.is_closed() {
            return Err(gone());
        }
        let (trigger, rx) = self.correlator.register();
        // re-check after registering: the read loop fails all pending
        // futures it saw, this covers a racing registration
        if self.is_closed() {
            self.correlator.fail_all();
            return Err(gone());
        }
        self.out
            .send(Command::with_trigger(name, args, trigger))
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Poll for a job. `None` means the queue was empty and the broker
    /// parked us for a JOB_AVAILABLE nudge.
    pub async fn get(
        &self,
        types: &[String],
        exclude: &HashSet<JobId>,
    ) -> Result<Option<JobAssignment>, CmdError> {
        let exclude_csv = exclude
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let outcome = self
            .call(
                "GET",
                vec![types.join(",").into_bytes(), exclude_csv.into_bytes()],
            )
            .await;
        match outcome {
            Ok(payload) => {
                let body = payload
                    .first()
                    .ok_or_else(|| CmdError::new(ErrorKind::Internal, "empty GET reply"))?;
                let assignment = serde_json::from_slice(body).map_err(|err| {
                    CmdError::new(ErrorKind::Internal, format!("bad assignment: {err}"))
                })?;
                Ok(Some(assignment))
            }
            Err(err) if err.kind == ErrorKind::NoJobsAvailable => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn complete(&self, id: JobId, results: &serde_json::Value) -> Result<(), CmdError> {
        let body = serde_json::to_vec(results)
            .map_err(|err| CmdError::new(ErrorKind::Internal, err.to_string()))?;
        self.call("COMPLETE", vec![id.to_string().into_bytes(), body])
            .await
            .map(|_| ())
    }

    pub async fn fail(&self, id: JobId, message: &str) -> Result<(), CmdError> {
        self.call(
            "FAIL",
            vec![id.to_string().into_bytes(), message.as_bytes().to_vec()],
        )
        .await
        .map(|_| ())
    }

    pub async fn reject(&self, id: JobId) -> Result<(), CmdError> {
        self.call("REJECT", vec![id.to_string().into_bytes()])
            .await
            .map(|_| ())
    }

    pub async fn store(
        &self,
        scope: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredFile, CmdError> {
        let payload = self
            .call(
                "STORE",
                vec![scope.as_bytes().to_vec(), name.as_bytes().to_vec(), bytes],
            )
            .await?;
        match (payload.first(), payload.get(1)) {
            (Some(url), Some(sha256)) => Ok(StoredFile {
                url: String::from_utf8_lossy(url).into_owned(),
                sha256: String::from_utf8_lossy(sha256).into_owned(),
            }),
            _ => Err(CmdError::new(ErrorKind::Internal, "short STORE reply")),
        }
    }
}

async fn read_loop<S>(
    frames: &mut S,
    out: &UnboundedSender<Command>,
    correlator: &Correlator,
    secret: Option<&str>,
    events: &UnboundedSender<(usize, ClientEvent)>,
    tag: usize,
) where
    S: futures::Stream<Item = Result<Command, protocol::frame::WireError>> + Unpin,
{
    while let Some(item) = frames.next().await {
        let cmd = match item {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(%err, "broker sent a malformed frame, dropping connection");
                return;
            }
        };
        match cmd.name.as_str() {
            "RESULT" | "ERROR" => {
                correlator.resolve_from_wire(&cmd);
            }
            "PING" => {
                if let Some(trigger) = cmd.trigger {
                    let ts = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let _ = out.send(Command::new(
                        "RESULT",
                        vec![
                            trigger.to_string().into_bytes(),
                            b"PONG".to_vec(),
                            ts.to_string().into_bytes(),
                        ],
                    ));
                }
            }
            "CHALLENGE" => {
                let Some(trigger) = cmd.trigger else { continue };
                match (secret, cmd.arg_str(0)) {
                    (Some(secret), Ok(challenge)) => {
                        let digest = handshake::challenge_response(secret, challenge);
                        let _ = out.send(Command::new(
                            "RESULT",
                            vec![trigger.to_string().into_bytes(), digest.into_bytes()],
                        ));
                    }
                    _ => {
                        let _ = out.send(Command::new(
                            "ERROR",
                            vec![
                                trigger.to_string().into_bytes(),
                                ErrorKind::AuthenticationFailure.to_string().into_bytes(),
                                b"no shared secret configured".to_vec(),
                            ],
                        ));
                    }
                }
            }
            "JOB_AVAILABLE" => {
                if let Ok(ty) = cmd.arg_str(0) {
                    let _ = events.send((tag, ClientEvent::JobAvailable(ty.to_string())));
                }
            }
            "ABORT" => {
                if let Ok(id) = cmd.arg_str(0).and_then(|s| {
                    s.parse::<JobId>()
                        .map_err(|_| CmdError::invalid_argument("bad id"))
                }) {
                    let _ = events.send((tag, ClientEvent::Abort(id)));
                }
            }
            "CRITICAL" => {
                let reason = cmd
                    .args
                    .first()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .unwrap_or_default();
                error!(reason, "broker terminated the connection");
                return;
            }
            other => {
                if let Some(trigger) = cmd.trigger {
                    let err = CmdError::unrecognized(other);
                    let _ = out.send(Command::new(
                        "ERROR",
                        vec![
                            trigger.to_string().into_bytes(),
                            err.kind.to_string().into_bytes(),
                            err.message.into_bytes(),
                        ],
                    ));
                }
            }
        }
    }
}
