//! What happens to one leased job: prerequisite staging, processor
//! execution, result upload, and the final verdict back to the broker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use protocol::{CmdError, ErrorKind, JobAssignment, JobId, Prerequisite};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use utils::log_if_err;

use crate::client::BrokerClient;

/// Everything a processor gets to work with. `inputs` are the staged,
/// checksum-verified prerequisite files.
pub struct JobContext {
    pub assignment: JobAssignment,
    pub workdir: PathBuf,
    pub inputs: Vec<PathBuf>,
}

/// One job type's implementation. Returns the output files to upload.
pub trait Processor: Send + Sync {
    fn run(&self, ctx: JobContext) -> BoxFuture<'static, Result<Vec<PathBuf>>>;
}

#[derive(Default)]
pub struct Registry {
    procs: HashMap<String, Arc<dyn Processor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ty: &str, processor: Arc<dyn Processor>) {
        self.procs.insert(ty.to_string(), processor);
    }

    pub fn get(&self, ty: &str) -> Option<Arc<dyn Processor>> {
        self.procs.get(ty).cloned()
    }

    /// Sorted so the GET argument is stable across polls.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.procs.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Runs an external program in the job's workdir. The job description is
/// written to `job.json` and outputs are collected from `out/`; the program
/// finds both through `MARU_JOB` and `MARU_OUT`.
pub struct ExecProcessor {
    program: String,
    args: Vec<String>,
}

impl ExecProcessor {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl Processor for ExecProcessor {
    fn run(&self, ctx: JobContext) -> BoxFuture<'static, Result<Vec<PathBuf>>> {
        let program = self.program.clone();
        let args = self.args.clone();
        Box::pin(async move {
            let spec_path = ctx.workdir.join("job.json");
            let body = serde_json::to_vec_pretty(&ctx.assignment)?;
            tokio::fs::write(&spec_path, body).await.context("write job.json")?;

            let out_dir = ctx.workdir.join("out");
            tokio::fs::create_dir_all(&out_dir).await.context("create out dir")?;

            let status = async_process::Command::new(&program)
                .args(&args)
                .current_dir(&ctx.workdir)
                .env("MARU_JOB", &spec_path)
                .env("MARU_OUT", &out_dir)
                .status()
                .await
                .with_context(|| format!("spawn {program}"))?;
            if !status.success() {
                bail!("{program} exited with {status}");
            }

            let mut outputs = Vec::new();
            let mut entries = tokio::fs::read_dir(&out_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    outputs.push(entry.path());
                }
            }
            outputs.sort();
            Ok(outputs)
        })
    }
}

/// Stage every prerequisite into `<workdir>/inputs`, verifying digests.
/// Failures carry the error kind the broker vocabulary expects, so the
/// caller can decide between rejecting and failing.
pub async fn fetch_prerequisites(
    http: &reqwest::Client,
    workdir: &Path,
    prerequisites: &[Prerequisite],
) -> Result<Vec<PathBuf>, CmdError> {
    let internal = |err: String| CmdError::new(ErrorKind::Internal, err);
    let dir = workdir.join("inputs");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| internal(err.to_string()))?;

    let mut staged = Vec::with_capacity(prerequisites.len());
    for (i, prerequisite) in prerequisites.iter().enumerate() {
        let bytes = fetch_one(http, &prerequisite.url).await.map_err(|err| {
            CmdError::new(
                ErrorKind::PrerequisiteAcquisitionFailed,
                format!("{}: {err}", prerequisite.url),
            )
        })?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if !digest.eq_ignore_ascii_case(&prerequisite.sha256) {
            return Err(CmdError::new(
                ErrorKind::PrerequisiteChecksumFailed,
                format!("{}: got {digest}", prerequisite.url),
            ));
        }

        let path = dir.join(input_filename(&prerequisite.url, i));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| internal(err.to_string()))?;
        debug!(url = %prerequisite.url, path = %path.display(), "prerequisite staged");
        staged.push(path);
    }
    Ok(staged)
}

async fn fetch_one(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, reqwest::Error> {
    let response = http.get(url).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// Derive a collision-free local name from the url's last path segment.
fn input_filename(url: &str, index: usize) -> String {
    let tail = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("input");
    format!("{index:02}-{tail}")
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobId),
    Failed(JobId),
    /// Prerequisites could not be staged here; the job went back to the
    /// queue and must not be re-polled by this worker.
    Rejected(JobId),
    Cancelled(JobId),
}

impl JobOutcome {
    pub fn id(&self) -> JobId {
        match self {
            JobOutcome::Completed(id)
            | JobOutcome::Failed(id)
            | JobOutcome::Rejected(id)
            | JobOutcome::Cancelled(id) => *id,
        }
    }
}

/// Drive one job to a verdict. `cancel` fires when the broker aborts the
/// job; nothing is reported back in that case because the broker has
/// already dropped it.
pub async fn run_job(
    client: BrokerClient,
    http: reqwest::Client,
    registry: Arc<Registry>,
    workdir_root: PathBuf,
    assignment: JobAssignment,
    cancel: oneshot::Receiver<()>,
) -> JobOutcome {
    let id = assignment.id;
    let workdir = workdir_root.join(format!("job-{id}"));
    let outcome = drive(&client, &http, &registry, &workdir, assignment, cancel).await;
    if workdir.exists() {
        log_if_err!(tokio::fs::remove_dir_all(&workdir).await);
    }
    outcome
}

async fn drive(
    client: &BrokerClient,
    http: &reqwest::Client,
    registry: &Registry,
    workdir: &Path,
    assignment: JobAssignment,
    cancel: oneshot::Receiver<()>,
) -> JobOutcome {
    let id = assignment.id;
    let ty = assignment.spec.ty.clone();

    if let Err(err) = tokio::fs::create_dir_all(workdir).await {
        warn!(%id, %err, "cannot create workdir");
        log_if_err!(
            client.fail(id, &format!("workdir: {err}")).await,
            "report workdir failure"
        );
        return JobOutcome::Failed(id);
    }

    let inputs = match fetch_prerequisites(http, workdir, &assignment.spec.prerequisites).await {
        Ok(inputs) => inputs,
        Err(err) => {
            warn!(%id, %err, "prerequisites unavailable, forfeiting job");
            log_if_err!(client.reject(id).await);
            return JobOutcome::Rejected(id);
        }
    };

    let Some(processor) = registry.get(&ty) else {
        log_if_err!(
            client.fail(id, &format!("no processor for type {ty:?}")).await,
            "report missing processor"
        );
        return JobOutcome::Failed(id);
    };

    let ctx = JobContext {
        assignment,
        workdir: workdir.to_path_buf(),
        inputs,
    };
    let work = processor.run(ctx);
    tokio::pin!(work);

    let result = tokio::select! {
        _ = cancel => {
            info!(%id, "job aborted mid-run");
            return JobOutcome::Cancelled(id);
        }
        result = &mut work => result,
    };

    match result {
        Ok(outputs) => {
            let scope = id.to_string();
            let mut stored = Vec::with_capacity(outputs.len());
            for path in &outputs {
                let upload = upload_output(client, &scope, path).await;
                match upload {
                    Ok(file) => stored.push(file),
                    Err(err) => {
                        warn!(%id, path = %path.display(), %err, "output upload failed");
                        log_if_err!(
                            client.fail(id, &format!("upload: {err}")).await,
                            "report upload failure"
                        );
                        return JobOutcome::Failed(id);
                    }
                }
            }
            let results = serde_json::json!(stored);
            info!(%id, %ty, outputs = stored.len(), "job done");
            log_if_err!(client.complete(id, &results).await);
            JobOutcome::Completed(id)
        }
        Err(err) => {
            warn!(%id, %ty, err = %format!("{err:#}"), "processor failed");
            log_if_err!(
                client.fail(id, &format!("{err:#}")).await,
                "report processor failure"
            );
            JobOutcome::Failed(id)
        }
    }
}

async fn upload_output(
    client: &BrokerClient,
    scope: &str,
    path: &Path,
) -> Result<protocol::StoredFile> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("output file has no utf-8 name")?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(client.store(scope, name, bytes).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::JobSpec;
    use serde_json::json;

    #[test]
    fn input_filenames_keep_the_url_tail() {
        assert_eq!(input_filename("http://x/a/b/scene.blend", 0), "00-scene.blend");
        assert_eq!(input_filename("http://x/file.bin?sig=abc", 3), "03-file.bin");
        assert_eq!(input_filename("http://x/dir/", 1), "01-input");
    }

    #[test]
    fn registry_types_are_sorted() {
        struct Nop;
        impl Processor for Nop {
            fn run(&self, _ctx: JobContext) -> BoxFuture<'static, Result<Vec<PathBuf>>> {
                Box::pin(async { Ok(vec![]) })
            }
        }
        let mut registry = Registry::new();
        registry.register("render", Arc::new(Nop));
        registry.register("probe", Arc::new(Nop));
        assert_eq!(registry.types(), vec!["probe", "render"]);
        assert!(registry.get("render").is_some());
        assert!(registry.get("mux").is_none());
    }

    #[tokio::test]
    async fn exec_processor_collects_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = JobAssignment {
            id: protocol::JobId(7),
            spec: JobSpec {
                ty: "render".into(),
                destination: "d".into(),
                description: json!({"scene": "intro"}),
                prerequisites: vec![],
                expiry_secs: 60,
            },
        };
        let processor = ExecProcessor::new(
            "sh".into(),
            vec!["-c".into(), "cp \"$MARU_JOB\" \"$MARU_OUT/result.json\"".into()],
        );
        let outputs = processor
            .run(JobContext {
                assignment,
                workdir: dir.path().to_path_buf(),
                inputs: vec![],
            })
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].ends_with("out/result.json"));
        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&outputs[0]).unwrap()).unwrap();
        assert_eq!(body["type"], "render");
    }

    #[tokio::test]
    async fn exec_processor_propagates_exit_failure() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = JobAssignment {
            id: protocol::JobId(8),
            spec: JobSpec {
                ty: "render".into(),
                destination: "d".into(),
                description: json!({}),
                prerequisites: vec![],
                expiry_secs: 60,
            },
        };
        let processor = ExecProcessor::new("sh".into(), vec!["-c".into(), "exit 3".into()]);
        let err = processor
            .run(JobContext {
                assignment,
                workdir: dir.path().to_path_buf(),
                inputs: vec![],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit"));
    }
}
