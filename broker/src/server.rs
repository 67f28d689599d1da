//! Connection handling: the two listeners, per-connection dispatch, and the
//! server side of the challenge handshake.
//!
//! Each accepted socket gets a read loop plus a write task fed by an
//! unbounded channel; the broker pushes unsolicited commands (JOB_AVAILABLE,
//! ABORT) through the same channel, so frame writes never interleave.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use protocol::frame::{Command, CommandCodec};
use protocol::handshake::{self, AuthState};
use protocol::json::{JsonCodec, JsonError, JsonMsg};
use protocol::rpc::Correlator;
use protocol::{CmdError, ErrorKind, JobId, JobSpec, Role};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Outbound};
use crate::filestore::DirStore;

pub struct Server {
    pub broker: Broker,
    pub files: DirStore,
    /// Absent means the broker runs open and no challenge is issued.
    pub shared_secret: Option<String>,
}

impl Server {
    pub fn new(broker: Broker, files: DirStore, shared_secret: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            files,
            shared_secret,
        })
    }

    pub async fn serve_text(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "text listener up");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move { handle_text(server, stream, peer).await });
        }
    }

    pub async fn serve_json(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "json listener up");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move { handle_json(server, stream, peer).await });
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone)]
struct Identity {
    role: Role,
    name: String,
}

/// An outstanding challenge we issued; the peer's RESULT for this trigger is
/// consumed by the handshake instead of the correlator.
struct PendingChallenge {
    trigger: u64,
    nonce: String,
    secret: String,
    role: Role,
    name: String,
}

enum Flow {
    Continue,
    Close,
}

/// Per-connection state shared by both wire formats.
struct Session {
    server: Arc<Server>,
    out: Outbound,
    correlator: Arc<Correlator>,
    auth: Mutex<AuthState>,
    pending_challenge: Option<PendingChallenge>,
    identity: Option<Identity>,
    peer: SocketAddr,
}

impl Session {
    fn new(server: Arc<Server>, out: Outbound, peer: SocketAddr) -> Self {
        Self {
            server,
            out,
            correlator: Arc::new(Correlator::new()),
            auth: Mutex::new(AuthState::default()),
            pending_challenge: None,
            identity: None,
            peer,
        }
    }

    /// Route one inbound command. `reply_to` is the peer's trigger (or JSON
    /// request id); without one, outcomes are dropped rather than answered.
    async fn on_command(&mut self, cmd: Command, reply_to: Option<String>) -> Flow {
        match cmd.name.as_str() {
            "RESULT" | "ERROR" => {
                if let Some(flow) = self.on_challenge_reply(&cmd) {
                    return flow;
                }
                self.correlator.resolve_from_wire(&cmd);
                Flow::Continue
            }
            "CRITICAL" => {
                warn!(peer = %self.peer, "peer sent critical, closing");
                Flow::Close
            }
            "PING" => {
                if let Some(reply_to) = reply_to {
                    self.reply_ok(
                        reply_to,
                        vec![b"PONG".to_vec(), unix_now().to_string().into_bytes()],
                    );
                }
                Flow::Continue
            }
            _ => {
                let outcome = self.dispatch(&cmd).await;
                match (reply_to, outcome) {
                    (Some(reply_to), Ok(payload)) => self.reply_ok(reply_to, payload),
                    (Some(reply_to), Err(err)) => self.reply_err(reply_to, &err),
                    (None, Ok(_)) => {}
                    (None, Err(err)) => {
                        debug!(name = %cmd.name, %err, "command failed with no trigger to answer")
                    }
                }
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, cmd: &Command) -> Result<Vec<Vec<u8>>, CmdError> {
        match cmd.name.as_str() {
            "IDENTIFY" => self.identify(cmd),
            "CHALLENGE" => self.answer_challenge(cmd),
            name => {
                let Some(identity) = self.identity.clone() else {
                    return Err(CmdError::forbidden("identify first"));
                };
                self.require_proven()?;
                match identity.role {
                    Role::Worker => self.dispatch_worker(&identity.name, name, cmd).await,
                    Role::Producer | Role::Network => {
                        self.dispatch_producer(name, cmd).await
                    }
                }
            }
        }
    }

    fn identify(&mut self, cmd: &Command) -> Result<Vec<Vec<u8>>, CmdError> {
        if self.identity.is_some() {
            return Err(CmdError::invalid_argument("already identified"));
        }
        let role: Role = cmd.arg_str(0)?.parse()?;
        let name = cmd.arg_str(1)?.to_string();
        let owner = cmd.arg_str(2)?.to_string();
        if name.is_empty() {
            return Err(CmdError::invalid_argument("empty peer name"));
        }

        if role == Role::Worker {
            self.server.broker.register_worker(&name, &owner, self.out.clone());
        }
        info!(peer = %self.peer, %role, name, owner, "peer identified");
        self.identity = Some(Identity {
            role,
            name: name.clone(),
        });

        match self.server.shared_secret.clone() {
            Some(secret) => self.issue_challenge(secret, role, name),
            None => {
                if role == Role::Worker {
                    self.server.broker.mark_ready(&name);
                }
            }
        }
        Ok(vec![self.server.broker.name().as_bytes().to_vec()])
    }

    /// Challenge the peer after it identifies; until its response verifies,
    /// role commands stay locked out.
    fn issue_challenge(&mut self, secret: String, role: Role, name: String) {
        // register to claim the trigger; the reply is intercepted before it
        // reaches the correlator, so the receiver is not kept
        let (trigger, _rx) = self.correlator.register();
        let nonce = handshake::new_challenge();
        let cmd = Command::with_trigger("CHALLENGE", vec![nonce.clone().into_bytes()], trigger);
        if self.out.send(cmd).is_err() {
            return;
        }
        self.pending_challenge = Some(PendingChallenge {
            trigger,
            nonce,
            secret,
            role,
            name,
        });
    }

    /// Handled inline in the read loop, so commands the peer sends after its
    /// response observe the verification outcome. Failure is terminal.
    fn on_challenge_reply(&mut self, cmd: &Command) -> Option<Flow> {
        let trigger = cmd
            .args
            .first()
            .and_then(|arg| std::str::from_utf8(arg).ok())
            .and_then(|s| s.parse::<u64>().ok())?;
        if self.pending_challenge.as_ref()?.trigger != trigger {
            return None;
        }
        let pending = self.pending_challenge.take()?;
        let verified = cmd.name == "RESULT"
            && cmd
                .args
                .get(1)
                .and_then(|arg| std::str::from_utf8(arg).ok())
                .map(|response| {
                    handshake::verify_response(&pending.secret, &pending.nonce, response)
                })
                .unwrap_or(false);
        if verified {
            self.auth.lock().peer_proven = true;
            if pending.role == Role::Worker {
                self.server.broker.mark_ready(&pending.name);
            }
            Some(Flow::Continue)
        } else {
            warn!(peer = %pending.name, "challenge verification failed, closing");
            let critical = Command::new(
                "CRITICAL",
                vec![ErrorKind::AuthenticationFailure.to_string().into_bytes()],
            );
            let _ = self.out.send(critical);
            Some(Flow::Close)
        }
    }

    /// The peer's half of mutual proof: it challenges us, we return the
    /// digest. Refused when no secret is configured, so a peer cannot fish
    /// for digests on an open broker.
    fn answer_challenge(&self, cmd: &Command) -> Result<Vec<Vec<u8>>, CmdError> {
        let challenge = cmd.arg_str(0)?;
        let secret = self
            .server
            .shared_secret
            .as_deref()
            .ok_or_else(|| CmdError::forbidden("no shared secret configured"))?;
        self.auth.lock().self_proven = true;
        Ok(vec![handshake::challenge_response(secret, challenge).into_bytes()])
    }

    fn require_proven(&self) -> Result<(), CmdError> {
        if self.server.shared_secret.is_some() && !self.auth.lock().peer_proven {
            return Err(CmdError::new(
                ErrorKind::AuthenticationFailure,
                "channel not authenticated",
            ));
        }
        Ok(())
    }

    async fn dispatch_worker(
        &self,
        worker: &str,
        name: &str,
        cmd: &Command,
    ) -> Result<Vec<Vec<u8>>, CmdError> {
        let broker = &self.server.broker;
        match name {
            "GET" => {
                let types = split_csv(cmd.arg_str(0)?);
                if types.is_empty() {
                    return Err(CmdError::invalid_argument("no job types requested"));
                }
                let exclude = match cmd.args.get(1) {
                    Some(_) => parse_id_csv(cmd.arg_str(1)?)?,
                    None => HashSet::new(),
                };
                let assignment = broker.get(worker, &types, &exclude, &self.out).await?;
                let body = serde_json::to_vec(&assignment)
                    .map_err(|err| CmdError::new(ErrorKind::Internal, err.to_string()))?;
                Ok(vec![body])
            }
            "COMPLETE" => {
                let id = parse_id(cmd.arg_str(0)?)?;
                if let Some(results) = cmd.args.get(1) {
                    debug!(worker, %id, bytes = results.len(), "completion results attached");
                }
                broker.complete(worker, id).await?;
                Ok(vec![b"OK".to_vec()])
            }
            "FAIL" => {
                let id = parse_id(cmd.arg_str(0)?)?;
                let message = cmd.arg_str(1).unwrap_or("");
                broker.fail(worker, id, message).await?;
                Ok(vec![b"OK".to_vec()])
            }
            "REJECT" => {
                let id = parse_id(cmd.arg_str(0)?)?;
                broker.reject(worker, id).await?;
                Ok(vec![b"OK".to_vec()])
            }
            "STORE" => self.store_file(cmd),
            "DELETE" => self.delete_file(cmd),
            other => Err(CmdError::unrecognized(other)),
        }
    }

    async fn dispatch_producer(
        &self,
        name: &str,
        cmd: &Command,
    ) -> Result<Vec<Vec<u8>>, CmdError> {
        let broker = &self.server.broker;
        match name {
            "SUBMIT" => {
                let spec: JobSpec = serde_json::from_slice(
                    cmd.args
                        .first()
                        .ok_or_else(|| CmdError::invalid_argument("missing job spec"))?,
                )
                .map_err(|err| CmdError::invalid_argument(format!("bad job spec: {err}")))?;
                let id = broker
                    .submit(spec)
                    .await
                    .map_err(|err| CmdError::new(ErrorKind::Internal, format!("{err:#}")))?;
                Ok(vec![id.to_string().into_bytes()])
            }
            "ABORT" => {
                let id = parse_id(cmd.arg_str(0)?)?;
                broker.abort(id).await?;
                Ok(vec![b"OK".to_vec()])
            }
            "STORE" => self.store_file(cmd),
            "DELETE" => self.delete_file(cmd),
            other => Err(CmdError::unrecognized(other)),
        }
    }

    fn store_file(&self, cmd: &Command) -> Result<Vec<Vec<u8>>, CmdError> {
        let scope = cmd.arg_str(0)?.to_string();
        let name = cmd.arg_str(1)?.to_string();
        let bytes = cmd
            .args
            .get(2)
            .ok_or_else(|| CmdError::invalid_argument("missing file bytes"))?;
        let stored = self
            .server
            .files
            .store(bytes, &name, &scope)
            .map_err(|err| match err.downcast::<CmdError>() {
                Ok(cmd_err) => cmd_err,
                Err(other) => CmdError::new(ErrorKind::Internal, format!("{other:#}")),
            })?;
        Ok(vec![stored.url.into_bytes(), stored.sha256.into_bytes()])
    }

    fn delete_file(&self, cmd: &Command) -> Result<Vec<Vec<u8>>, CmdError> {
        let scope = cmd.arg_str(0)?;
        let name = cmd.arg_str(1)?;
        self.server
            .files
            .delete(name, scope)
            .map_err(|err| match err.downcast::<CmdError>() {
                Ok(cmd_err) => cmd_err,
                Err(other) => CmdError::new(ErrorKind::Internal, format!("{other:#}")),
            })?;
        Ok(vec![b"OK".to_vec()])
    }

    fn reply_ok(&self, reply_to: String, mut payload: Vec<Vec<u8>>) {
        let mut args = vec![reply_to.into_bytes()];
        args.append(&mut payload);
        let _ = self.out.send(Command::new("RESULT", args));
    }

    fn reply_err(&self, reply_to: String, err: &CmdError) {
        let args = vec![
            reply_to.into_bytes(),
            err.kind.to_string().into_bytes(),
            err.message.clone().into_bytes(),
        ];
        let _ = self.out.send(Command::new("ERROR", args));
    }

    async fn teardown(&mut self) {
        self.correlator.fail_all();
        if let Some(Identity {
            role: Role::Worker,
            name,
        }) = self.identity.take()
        {
            self.server.broker.unregister_worker(&name).await;
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_id(raw: &str) -> Result<JobId, CmdError> {
    raw.parse()
        .map_err(|_| CmdError::invalid_argument(format!("bad job id {raw:?}")))
}

fn parse_id_csv(raw: &str) -> Result<HashSet<JobId>, CmdError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_id)
        .collect()
}

async fn handle_text(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    debug!(%peer, "text connection accepted");
    let framed = Framed::new(stream, CommandCodec::new());
    let (mut sink, mut frames) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    // The write half stays alive until every Outbound clone is gone, so a
    // queued CRITICAL still reaches the peer after the read loop exits.
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if sink.send(cmd).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(server, tx, peer);
    while let Some(item) = frames.next().await {
        match item {
            Ok(cmd) => {
                let reply_to = cmd.trigger.map(|t| t.to_string());
                if matches!(session.on_command(cmd, reply_to).await, Flow::Close) {
                    break;
                }
            }
            Err(err) => {
                // malformed frame: drop the connection, say nothing
                debug!(%peer, %err, "dropping text connection");
                break;
            }
        }
    }
    session.teardown().await;
    debug!(%peer, "text connection closed");
}

async fn handle_json(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    debug!(%peer, "json connection accepted");
    let framed = Framed::new(stream, JsonCodec::new());
    let (mut sink, mut lines) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if sink.send(command_to_json(cmd)).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(server, tx, peer);
    while let Some(item) = lines.next().await {
        match item {
            Ok(msg) => {
                if matches!(on_json_msg(&mut session, msg).await, Flow::Close) {
                    break;
                }
            }
            Err(err) => {
                debug!(%peer, %err, "dropping json connection");
                break;
            }
        }
    }
    session.teardown().await;
    debug!(%peer, "json connection closed");
}

async fn on_json_msg(session: &mut Session, msg: JsonMsg) -> Flow {
    match msg {
        JsonMsg::Critical { critical } => {
            warn!(peer = %session.peer, critical, "peer sent critical, closing");
            Flow::Close
        }
        JsonMsg::ReplyOk { reply, result } => {
            let mut args = vec![reply.into_bytes()];
            match result {
                Value::Array(items) => args.extend(items.iter().map(json_arg_bytes)),
                other => args.push(json_arg_bytes(&other)),
            }
            session.on_command(Command::new("RESULT", args), None).await
        }
        JsonMsg::ReplyErr { reply, error } => {
            let args = vec![
                reply.into_bytes(),
                error.name.into_bytes(),
                error.message.into_bytes(),
            ];
            session.on_command(Command::new("ERROR", args), None).await
        }
        JsonMsg::Request {
            command,
            arguments,
            id,
        } => {
            let cmd = match request_to_command(&command, &arguments) {
                Ok(cmd) => cmd,
                Err(err) => {
                    if let Some(id) = id {
                        session.reply_err(id, &err);
                    }
                    return Flow::Continue;
                }
            };
            session.on_command(cmd, id).await
        }
    }
}

/// JSON requests reuse the text-command vocabulary, lowercased. `hello` is
/// the one structured exception: its single object argument carries the
/// identity fields.
fn request_to_command(command: &str, arguments: &[Value]) -> Result<Command, CmdError> {
    if command.eq_ignore_ascii_case("hello") {
        let Some(Value::Object(fields)) = arguments.first() else {
            return Err(CmdError::invalid_argument("hello takes an identity object"));
        };
        let field = |key: &str| -> Result<Vec<u8>, CmdError> {
            match fields.get(key) {
                Some(Value::String(s)) => Ok(s.clone().into_bytes()),
                _ => Err(CmdError::invalid_argument(format!("hello is missing {key:?}"))),
            }
        };
        // only `type` and `name` are required; `owner` defaults to empty and
        // `extensions` is ignored
        let owner = match fields.get("owner") {
            Some(Value::String(s)) => s.clone().into_bytes(),
            _ => Vec::new(),
        };
        return Ok(Command::new(
            "IDENTIFY",
            vec![field("type")?, field("name")?, owner],
        ));
    }
    Ok(Command::new(
        command,
        arguments.iter().map(json_arg_bytes).collect(),
    ))
}

fn json_arg_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

fn command_to_json(cmd: Command) -> JsonMsg {
    fn lossy(arg: &[u8]) -> String {
        String::from_utf8_lossy(arg).into_owned()
    }
    fn value(arg: &[u8]) -> Value {
        serde_json::from_slice(arg).unwrap_or_else(|_| Value::String(lossy(arg)))
    }
    match cmd.name.as_str() {
        "RESULT" if !cmd.args.is_empty() => JsonMsg::ReplyOk {
            reply: lossy(&cmd.args[0]),
            result: Value::Array(cmd.args[1..].iter().map(|a| value(a)).collect()),
        },
        "ERROR" if cmd.args.len() >= 3 => JsonMsg::ReplyErr {
            reply: lossy(&cmd.args[0]),
            error: JsonError {
                name: lossy(&cmd.args[1]),
                message: lossy(&cmd.args[2]),
            },
        },
        "CRITICAL" => JsonMsg::Critical {
            critical: cmd.args.first().map(|a| lossy(a)).unwrap_or_default(),
        },
        _ => JsonMsg::Request {
            command: cmd.name.to_lowercase(),
            arguments: cmd.args.iter().map(|a| Value::String(lossy(a))).collect(),
            id: cmd.trigger.map(|t| t.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn csv_parsing() {
        assert_eq!(split_csv("render, probe ,"), vec!["render", "probe"]);
        assert!(split_csv("").is_empty());
        let ids = parse_id_csv("3,17").unwrap();
        assert!(ids.contains(&JobId(3)) && ids.contains(&JobId(17)));
        assert!(parse_id_csv("3,x").is_err());
    }

    #[test]
    fn hello_maps_to_identify() {
        let args = vec![json!({"type": "worker", "name": "w1", "owner": "lab"})];
        let cmd = request_to_command("hello", &args).unwrap();
        assert_eq!(cmd.name, "IDENTIFY");
        assert_eq!(
            cmd.args,
            vec![b"worker".to_vec(), b"w1".to_vec(), b"lab".to_vec()]
        );
        assert!(request_to_command("hello", &[]).is_err());
    }

    #[test]
    fn hello_without_owner_identifies_with_empty_owner() {
        let args = vec![json!({"type": "worker", "name": "w1", "extensions": []})];
        let cmd = request_to_command("hello", &args).unwrap();
        assert_eq!(cmd.name, "IDENTIFY");
        assert_eq!(cmd.args, vec![b"worker".to_vec(), b"w1".to_vec(), vec![]]);
    }

    #[test]
    fn reply_commands_map_to_json_replies() {
        let result = Command::new(
            "RESULT",
            vec![b"7".to_vec(), b"PONG".to_vec(), b"1712345678".to_vec()],
        );
        assert_eq!(
            command_to_json(result),
            JsonMsg::ReplyOk {
                reply: "7".into(),
                result: json!(["PONG", 1712345678]),
            }
        );

        let error = Command::new(
            "ERROR",
            vec![
                b"8".to_vec(),
                b"Forbidden".to_vec(),
                b"not yours".to_vec(),
            ],
        );
        assert!(matches!(command_to_json(error), JsonMsg::ReplyErr { .. }));

        let nudge = Command::new("JOB_AVAILABLE", vec![b"render".to_vec()]);
        assert_eq!(
            command_to_json(nudge),
            JsonMsg::Request {
                command: "job_available".into(),
                arguments: vec![json!("render")],
                id: None,
            }
        );
    }
}
