//! Isolated execution worker
//!
//! `ntquery worker` runs the interpreter in a child process speaking JSON
//! lines on stdin/stdout. Killing the child is the only way to cancel a
//! statement that is already running; the host respawns it on next use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};

use crate::executor::{ExecOutcome, LocalSandbox, Sandbox};
use crate::{Error, Result};

/// Host to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Init,
    Exec { code: String },
    Reset,
}

/// Worker to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Status { message: String },
    Ready,
    Result { result: ExecOutcome },
    Error { error: String },
}

async fn write_line<W: AsyncWrite + Unpin, T: Serialize>(out: &mut W, msg: &T) -> Result<()> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    out.write_all(line.as_bytes())
        .await
        .map_err(|e| Error::Worker(e.to_string()))?;
    out.flush().await.map_err(|e| Error::Worker(e.to_string()))
}

/// Worker side: answer requests until stdin closes
pub async fn serve<R, W>(input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let sandbox = LocalSandbox::new();
    let mut lines = input.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| Error::Worker(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let error = format!("bad request: {}", e);
                write_line(&mut output, &Response::Error { error }).await?;
                continue;
            }
        };

        match request {
            Request::Init => {
                write_line(
                    &mut output,
                    &Response::Status {
                        message: "Loading interpreter ...".into(),
                    },
                )
                .await?;
                sandbox.reset_now();
                write_line(&mut output, &Response::Ready).await?;
            }
            Request::Exec { code } => {
                let result = sandbox.execute_now(&code);
                write_line(&mut output, &Response::Result { result }).await?;
            }
            Request::Reset => {
                sandbox.reset_now();
                write_line(&mut output, &Response::Ready).await?;
            }
        }
    }
    Ok(())
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    async fn send(&mut self, request: &Request) -> Result<()> {
        write_line(&mut self.stdin, request).await
    }

    async fn recv(&mut self) -> Result<Response> {
        let line = self
            .stdout
            .next_line()
            .await
            .map_err(|e| Error::Worker(e.to_string()))?
            .ok_or_else(|| Error::Worker("worker exited".into()))?;
        serde_json::from_str(&line).map_err(|e| Error::Worker(format!("bad reply: {}", e)))
    }
}

type StatusHook = Arc<dyn Fn(String) + Send + Sync>;

/// Host side: a `Sandbox` backed by a child process
pub struct WorkerSandbox {
    program: PathBuf,
    args: Vec<String>,
    process: Mutex<Option<WorkerProcess>>,
    cancel: watch::Sender<u64>,
    on_status: Option<StatusHook>,
}

impl WorkerSandbox {
    /// `program worker` is spawned lazily on first use
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            program: program.into(),
            args: vec!["worker".into()],
            process: Mutex::new(None),
            cancel,
            on_status: None,
        }
    }

    /// Receive the worker's `status` messages while it initialises
    pub fn on_status(mut self, hook: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(hook));
        self
    }

    async fn spawn(&self) -> Result<WorkerProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Worker(format!("failed to spawn {}: {}", self.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Worker("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("worker stdout unavailable".into()))?;

        let mut process = WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        process.send(&Request::Init).await?;
        self.await_ready(&mut process).await?;
        tracing::debug!(pid = ?process.child.id(), "worker ready");
        Ok(process)
    }

    async fn await_ready(&self, process: &mut WorkerProcess) -> Result<()> {
        loop {
            match process.recv().await? {
                Response::Ready => return Ok(()),
                Response::Status { message } => self.report(message),
                Response::Error { error } => return Err(Error::Worker(error)),
                Response::Result { .. } => {
                    return Err(Error::Worker("unexpected result while initialising".into()))
                }
            }
        }
    }

    fn report(&self, message: String) {
        tracing::debug!(%message, "worker status");
        if let Some(hook) = &self.on_status {
            hook(message);
        }
    }

    /// The process is owned by this future while a request is in flight, so
    /// dropping the future (cancellation, abort) kills the child.
    async fn exec_on(&self, slot: &mut Option<WorkerProcess>, expr: &str) -> Result<ExecOutcome> {
        let mut process = match slot.take() {
            Some(p) => p,
            None => self.spawn().await?,
        };

        process
            .send(&Request::Exec {
                code: expr.to_string(),
            })
            .await?;
        let outcome = loop {
            match process.recv().await? {
                Response::Result { result } => break result,
                Response::Error { error } => break ExecOutcome::Failed(error),
                Response::Status { message } => self.report(message),
                Response::Ready => {}
            }
        };
        *slot = Some(process);
        Ok(outcome)
    }

    async fn reset_on(&self, slot: &mut Option<WorkerProcess>) -> Result<()> {
        let mut process = match slot.take() {
            Some(p) => p,
            // A freshly spawned worker starts with an empty environment
            None => {
                *slot = Some(self.spawn().await?);
                return Ok(());
            }
        };
        process.send(&Request::Reset).await?;
        self.await_ready(&mut process).await?;
        *slot = Some(process);
        Ok(())
    }
}

#[async_trait]
impl Sandbox for WorkerSandbox {
    async fn reset(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.reset_on(&mut slot).await
    }

    async fn execute(&self, expr: &str) -> ExecOutcome {
        let mut cancelled = self.cancel.subscribe();
        let mut slot = self.process.lock().await;

        let result = tokio::select! {
            r = self.exec_on(&mut slot, expr) => Some(r),
            _ = cancelled.changed() => None,
        };

        match result {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "worker failed, it will be respawned");
                ExecOutcome::Failed(e.to_string())
            }
            None => ExecOutcome::Failed("Execution cancelled".into()),
        }
    }

    async fn terminate(&self) {
        self.cancel.send_modify(|epoch| *epoch += 1);
        // An in-flight execute owns the process and drops (kills) it itself
        if let Ok(mut slot) = self.process.try_lock() {
            if let Some(mut process) = slot.take() {
                let _ = process.child.start_kill();
                tracing::debug!("worker terminated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn converse(input: &str) -> Vec<Response> {
        let mut output = Vec::new();
        serve(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_message_shapes() {
        assert_eq!(
            serde_json::to_string(&Request::Exec { code: "1".into() }).unwrap(),
            r#"{"type":"exec","code":"1"}"#
        );
        assert_eq!(serde_json::to_string(&Response::Ready).unwrap(), r#"{"type":"ready"}"#);
        let reply: Response =
            serde_json::from_str(r#"{"type":"result","result":{"ok":false,"error":"x"}}"#).unwrap();
        assert_eq!(
            reply,
            Response::Result {
                result: ExecOutcome::Failed("x".into())
            }
        );
    }

    #[tokio::test]
    async fn test_init_reports_status_then_ready() {
        let replies = converse("{\"type\":\"init\"}\n").await;
        assert!(matches!(replies[0], Response::Status { .. }));
        assert_eq!(replies[1], Response::Ready);
    }

    #[tokio::test]
    async fn test_environment_spans_exec_messages() {
        let replies = converse(concat!(
            "{\"type\":\"init\"}\n",
            "{\"type\":\"exec\",\"code\":\"n = 12\"}\n",
            "{\"type\":\"exec\",\"code\":\"totient(n)\"}\n",
            "{\"type\":\"reset\"}\n",
            "{\"type\":\"exec\",\"code\":\"n\"}\n",
        ))
        .await;

        let results: Vec<&ExecOutcome> = replies
            .iter()
            .filter_map(|r| match r {
                Response::Result { result } => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 3);
        assert_eq!(
            *results[1],
            ExecOutcome::Ok(vec![crate::block::DisplayBlock::text("4")])
        );
        assert_eq!(*results[2], ExecOutcome::Failed("name 'n' is not defined".into()));
    }

    #[tokio::test]
    async fn test_garbage_gets_an_error_reply() {
        let replies = converse("not json\n").await;
        assert!(matches!(&replies[0], Response::Error { error } if error.starts_with("bad request")));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_worker_failure() {
        let sandbox = WorkerSandbox::new("/nonexistent/ntquery");
        let outcome = sandbox.execute("1").await;
        assert!(matches!(outcome, ExecOutcome::Failed(msg) if msg.contains("failed to spawn")));
        assert!(sandbox.reset().await.is_err());
    }
}
