use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod handshake;
pub mod json;
pub mod rpc;

utils::id_new_type!(JobId);

pub const DEFAULT_EXPIRY_SECS: u64 = 600;

fn default_expiry_secs() -> u64 {
    DEFAULT_EXPIRY_SECS
}

/// One input a worker must fetch and checksum-verify before running a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prerequisite {
    pub url: String,
    pub sha256: String,
}

/// Producer-supplied job description. The `description` payload is opaque to
/// the broker; only the processor named by `ty` interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "type")]
    pub ty: String,
    pub destination: String,
    pub description: serde_json::Value,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

/// A leased job as handed to a worker by `GET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignment {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
}

/// A stored result file, as returned by `STORE`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Worker,
    Producer,
    Network,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Worker => "worker",
            Role::Producer => "producer",
            Role::Network => "network",
        };
        f.write_str(s)
    }
}

impl FromStr for Role {
    type Err = CmdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "worker" => Ok(Role::Worker),
            "producer" => Ok(Role::Producer),
            "network" => Ok(Role::Network),
            other => Err(CmdError::invalid_argument(format!("unknown role {other:?}"))),
        }
    }
}

/// Closed vocabulary of error kinds that cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoJobsAvailable,
    UnrecognizedCommand,
    InvalidArgument,
    Forbidden,
    AuthenticationFailure,
    PrerequisiteAcquisitionFailed,
    PrerequisiteChecksumFailed,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NoJobsAvailable => "NoJobsAvailable",
            ErrorKind::UnrecognizedCommand => "UnrecognizedCommand",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::AuthenticationFailure => "AuthenticationFailure",
            ErrorKind::PrerequisiteAcquisitionFailed => "PrerequisiteAcquisitionFailed",
            ErrorKind::PrerequisiteChecksumFailed => "PrerequisiteChecksumFailed",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "NoJobsAvailable" => ErrorKind::NoJobsAvailable,
            "UnrecognizedCommand" => ErrorKind::UnrecognizedCommand,
            "InvalidArgument" => ErrorKind::InvalidArgument,
            "Forbidden" => ErrorKind::Forbidden,
            "AuthenticationFailure" => ErrorKind::AuthenticationFailure,
            "PrerequisiteAcquisitionFailed" => ErrorKind::PrerequisiteAcquisitionFailed,
            "PrerequisiteChecksumFailed" => ErrorKind::PrerequisiteChecksumFailed,
            _ => ErrorKind::Internal,
        };
        Ok(kind)
    }
}

/// An application-level failure carried back in an `ERROR` reply.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CmdError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CmdError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn unrecognized(name: &str) -> Self {
        Self::new(
            ErrorKind::UnrecognizedCommand,
            format!("unrecognized command {name:?}"),
        )
    }
}
