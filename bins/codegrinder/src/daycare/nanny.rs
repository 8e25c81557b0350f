/// Nanny - Per-Session Orchestrator
///
/// **Responsibility:**
/// Drive one session's lifecycle inside one sandbox: materialize the
/// student's files, run the action's exec steps, stream events to the
/// client, build the report card, and sign the graded bundle.
///
/// **Architecture:**
/// 1. Interactive actions run a single exec and forward client stdin
/// 2. Staged actions run the configured command sequence with stdin closed
/// 3. Every emitted event is recorded in the commit transcript
/// 4. Per-step deadlines kill the step; the session deadline ends the run
///
/// The nanny never touches the WebSocket: events go out through a bounded
/// channel drained by the single writer task, which is where backpressure
/// against the container comes from.
use bollard::container::LogOutput;
use chrono::Utc;
use codegrinder_common::{signing, ActionConfig, CommitBundle, EventMessage};
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::report;
use super::sandbox::{Sandbox, SandboxError};

/// Frames queued for the session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Event(EventMessage),
    /// The graded bundle, emitted as the terminal frame before shutdown.
    Bundle(Box<CommitBundle>),
    /// Send the shutdown event and close the socket with this code.
    Shutdown { close: u16 },
}

/// Client frames relevant to the nanny.
#[derive(Debug)]
pub enum Inbound {
    Stdin(Vec<u8>),
    StdinClosed,
    /// The client sent something the protocol forbids.
    Violation(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("session deadline exceeded")]
    DeadlineExceeded,
    #[error("client disconnected")]
    ClientDisconnect,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wait until the session's cancel signal trips. A dropped sender counts as
/// cancelled: the socket layer owns it, so losing it means the session ended.
pub async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Tracks the session's aggregate stdout+stderr byte budget.
///
/// Once a chunk would push past the limit, it and everything after it is
/// dropped; the caller emits exactly one truncation warning.
struct OutputBudget {
    limit: u64,
    sent: u64,
    truncated: bool,
}

#[derive(Debug, PartialEq)]
enum Admission {
    Forward,
    /// First over-budget chunk: drop it and warn.
    Truncate,
    /// Already truncated: drop silently.
    Drop,
}

impl OutputBudget {
    fn new(limit_mib: u64) -> Self {
        OutputBudget {
            limit: limit_mib * 1024 * 1024,
            sent: 0,
            truncated: false,
        }
    }

    fn admit(&mut self, len: u64) -> Admission {
        if self.sent + len > self.limit {
            if self.truncated {
                Admission::Drop
            } else {
                self.truncated = true;
                Admission::Truncate
            }
        } else {
            self.sent += len;
            Admission::Forward
        }
    }
}

enum Wake {
    Cancelled,
    Deadline,
    Output(Option<Result<LogOutput, bollard::errors::Error>>),
    Client(Option<Inbound>),
}

pub struct Nanny {
    sandbox: Sandbox,
    bundle: CommitBundle,
    action: ActionConfig,
    events: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<Inbound>,
    cancel: watch::Receiver<bool>,
    budget: OutputBudget,
}

impl Nanny {
    pub fn new(
        sandbox: Sandbox,
        bundle: CommitBundle,
        action: ActionConfig,
        events: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<Inbound>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let budget = OutputBudget::new(action.max_file_size);
        Nanny {
            sandbox,
            bundle,
            action,
            events,
            inbound,
            cancel,
            budget,
        }
    }

    /// Run the session to completion. The sandbox is destroyed on every exit
    /// path, including the session deadline and cancellation.
    pub async fn run(mut self, secret: &[u8]) -> Result<(), SessionError> {
        let session_limit = Duration::from_secs(self.action.max_session);
        let outcome = match tokio::time::timeout(session_limit, self.drive(secret)).await {
            Ok(result) => result,
            Err(_) => {
                // Best-effort warning: a stalled writer must not delay the
                // container teardown below.
                let event = EventMessage::error("session deadline exceeded");
                let _ = self.events.try_send(Outbound::Event(event));
                Err(SessionError::DeadlineExceeded)
            }
        };
        self.sandbox.destroy().await;
        outcome
    }

    async fn drive(&mut self, secret: &[u8]) -> Result<(), SessionError> {
        self.bundle
            .commit
            .validate_file_paths()
            .map_err(|err| SessionError::BadRequest(err.to_string()))?;
        self.sandbox.put_files(&self.bundle.commit.files).await?;

        if self.action.interactive {
            let argv = self
                .action
                .commands
                .first()
                .cloned()
                .ok_or_else(|| SessionError::Internal("action has no command".to_string()))?;
            return self.run_step(argv, true, None).await;
        }

        // Staged action: run every step, keeping stdout for the parser.
        let started = Instant::now();
        let mut captured = Vec::new();
        for argv in self.action.commands.clone() {
            self.run_step(argv, false, Some(&mut captured)).await?;
        }

        let (card, score) = report::grade(
            self.action.parser,
            &captured,
            &self.bundle.commit.files,
            started.elapsed().as_secs_f64(),
        );
        debug!(score = score, passed = card.passed, "grading finished");

        let nonce = self
            .bundle
            .nonce
            .clone()
            .ok_or_else(|| SessionError::BadRequest("bundle has no nonce".to_string()))?;
        let problem_signature = self
            .bundle
            .problem_signature
            .clone()
            .ok_or_else(|| SessionError::BadRequest("bundle has no problem signature".to_string()))?;

        let commit = &mut self.bundle.commit;
        commit.report_card = Some(card);
        commit.score = score;
        commit.updated_at = Utc::now();
        self.bundle.commit_signature = Some(signing::sign_commit(
            secret,
            &self.bundle.commit,
            &nonce,
            &problem_signature,
        ));

        self.events
            .send(Outbound::Bundle(Box::new(self.bundle.clone())))
            .await
            .map_err(|_| SessionError::ClientDisconnect)?;
        Ok(())
    }

    /// Run one exec step under the per-step deadline. A deadline kill ends
    /// only this step; the caller decides whether more steps follow.
    async fn run_step(
        &mut self,
        argv: Vec<String>,
        interactive: bool,
        mut captured: Option<&mut Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.emit(EventMessage::exec(argv.clone())).await?;
        let mut handle = self.sandbox.exec(&argv, interactive).await?;
        if !interactive {
            // stdin is pre-closed for staged actions
            let _ = handle.input.shutdown().await;
        }
        let mut stdin_open = interactive;
        let mut timed_out = false;

        let deadline = tokio::time::sleep(Duration::from_secs(self.action.max_timeout));
        tokio::pin!(deadline);

        loop {
            let wake = {
                let cancel = &mut self.cancel;
                let inbound = &mut self.inbound;
                tokio::select! {
                    _ = wait_cancelled(cancel) => Wake::Cancelled,
                    _ = &mut deadline => Wake::Deadline,
                    chunk = handle.output.next() => Wake::Output(chunk),
                    message = inbound.recv() => Wake::Client(message),
                }
            };
            match wake {
                Wake::Cancelled => return Err(SessionError::ClientDisconnect),
                Wake::Deadline => {
                    self.sandbox.kill_student_processes().await;
                    timed_out = true;
                    break;
                }
                Wake::Output(None) => break,
                Wake::Output(Some(Err(err))) => {
                    self.emit(EventMessage::error(format!(
                        "error reading container output: {err}"
                    )))
                    .await?;
                    break;
                }
                Wake::Output(Some(Ok(LogOutput::StdOut { message }))) => {
                    self.forward(true, message.to_vec(), &mut captured).await?;
                }
                Wake::Output(Some(Ok(LogOutput::StdErr { message }))) => {
                    self.forward(false, message.to_vec(), &mut captured).await?;
                }
                Wake::Output(Some(Ok(_))) => {}
                Wake::Client(None) => return Err(SessionError::ClientDisconnect),
                Wake::Client(Some(Inbound::Stdin(data))) => {
                    if stdin_open {
                        self.emit(EventMessage::stdin(data.clone())).await?;
                        if let Err(err) = handle.input.write_all(&data).await {
                            self.emit(EventMessage::error(format!(
                                "error writing to stdin: {err}"
                            )))
                            .await?;
                            stdin_open = false;
                        }
                    } else {
                        self.emit(EventMessage::error("stdin ignored: input is closed"))
                            .await?;
                    }
                }
                Wake::Client(Some(Inbound::StdinClosed)) => {
                    if stdin_open {
                        stdin_open = false;
                        self.emit(EventMessage::stdinclosed()).await?;
                        let _ = handle.input.shutdown().await;
                    }
                }
                Wake::Client(Some(Inbound::Violation(message))) => {
                    return Err(SessionError::BadRequest(message));
                }
            }
        }

        let status = if timed_out {
            "killed: deadline exceeded".to_string()
        } else {
            match self.sandbox.exec_exit_code(&handle.id).await {
                Ok(Some(code)) => format!("exit status {code}"),
                Ok(None) => "exit status unknown".to_string(),
                Err(err) => format!("exit status unknown ({err})"),
            }
        };
        self.emit(EventMessage::exit(status)).await?;
        Ok(())
    }

    /// Stream one chunk to the client inside the output budget, retaining
    /// stdout for the grader when requested.
    async fn forward(
        &mut self,
        is_stdout: bool,
        data: Vec<u8>,
        captured: &mut Option<&mut Vec<u8>>,
    ) -> Result<(), SessionError> {
        match self.budget.admit(data.len() as u64) {
            Admission::Forward => {}
            Admission::Truncate => {
                return self.emit(EventMessage::error("output truncated")).await;
            }
            Admission::Drop => return Ok(()),
        }
        if is_stdout {
            if let Some(buffer) = captured.as_deref_mut() {
                buffer.extend_from_slice(&data);
            }
        }
        let event = if is_stdout {
            EventMessage::stdout(data)
        } else {
            EventMessage::stderr(data)
        };
        self.emit(event).await
    }

    /// Record the event in the transcript and hand it to the writer task.
    /// A closed channel means the socket is gone.
    async fn emit(&mut self, event: EventMessage) -> Result<(), SessionError> {
        self.bundle.commit.transcript.push(event.clone());
        self.events
            .send(Outbound::Event(event))
            .await
            .map_err(|_| SessionError::ClientDisconnect)
    }
}
