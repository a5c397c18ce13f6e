// ABOUTME: Lifecycle of one assistant engine subprocess bound to a session
// ABOUTME: An actor task owns the child; handles send prompts and stop it from any task

mod protocol;

pub use protocol::{parse_line, EngineInput, EngineOutput, HistoryEntry};

use crate::config::EngineConfig;
use crate::error::{Result, RoostError};
use crate::registry::ExtensionRegistry;
use crate::relay::StreamRelay;
use crate::store::SessionStore;
use crate::types::{EngineState, RelayEvent, SendReceipt, TokenEvent};
use futures::TryStreamExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot, watch};

/// Current engine state and when it was entered.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatus {
    pub state: EngineState,
    pub since: Instant,
}

impl EngineStatus {
    fn now(state: EngineState) -> Self {
        Self {
            state,
            since: Instant::now(),
        }
    }
}

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running engine. Clones share the same subprocess.
#[derive(Clone)]
pub struct EngineProcess {
    session_id: String,
    pid: Option<u32>,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineProcess {
    /// Spawn the engine for a session and hand it the session's context.
    ///
    /// The process gets the full history and the resolved extension set as a
    /// single context frame. Returns once the engine is Idle and ready for a
    /// prompt; anything that keeps that from happening within the start
    /// timeout is an `EngineSpawn` error and the child is killed.
    pub async fn start(
        session_id: &str,
        store: SessionStore,
        registry: &ExtensionRegistry,
        relay: Arc<StreamRelay>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let (status_tx, status_rx) = watch::channel(EngineStatus::now(EngineState::Starting));

        let session = store.require(session_id).await?;
        let history: Vec<HistoryEntry> = store
            .load(session_id)
            .await?
            .stream()
            .map_ok(HistoryEntry::from)
            .try_collect()
            .await?;

        let context = EngineInput::Context {
            session_id: session.id.clone(),
            title: session.title.clone(),
            provider: session.provider.provider.clone(),
            model: session.provider.model.clone(),
            extensions: registry.resolve(&session.extensions),
            history,
        };

        tracing::info!(
            session_id = %session_id,
            binary = %config.binary,
            cwd = %config.working_dir.display(),
            "Starting engine"
        );

        let launched = tokio::time::timeout(config.start_timeout, launch(session_id, config, &context))
            .await
            .map_err(|_| {
                RoostError::EngineSpawn(format!(
                    "engine did not become ready within {}s",
                    config.start_timeout.as_secs_f32()
                ))
            })?;
        let (child, stdin, stdout) = match launched {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Engine failed to start");
                return Err(e);
            }
        };

        let pid = child.id();
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let actor = EngineActor {
            session_id: session_id.to_string(),
            child,
            stdin: Some(stdin),
            stdout,
            commands: commands_rx,
            status: status_tx,
            store,
            relay,
            end_marker: config.end_marker.clone(),
            stop_grace: config.stop_grace,
            turn: None,
        };
        actor.set_state(EngineState::Idle);
        tokio::spawn(actor.run());

        tracing::info!(session_id = %session_id, pid = ?pid, "Engine ready");
        Ok(Self {
            session_id: session_id.to_string(),
            pid,
            commands: commands_tx,
            status: status_rx,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> EngineState {
        self.status.borrow().state
    }

    /// False once the subprocess has exited and its actor shut down
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// How long the engine has been Idle, if it is Idle
    pub fn idle_for(&self) -> Option<Duration> {
        let status = *self.status.borrow();
        (status.state == EngineState::Idle && self.is_running()).then(|| status.since.elapsed())
    }

    /// Submit one user turn.
    ///
    /// Persists the user message and an in-flight assistant message, then
    /// returns while the response streams through the relay. Fails with
    /// `EngineBusy` if a response is already streaming.
    pub async fn send(&self, text: &str) -> Result<SendReceipt> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| RoostError::EngineStopped(self.session_id.clone()))?;
        rx.await
            .map_err(|_| RoostError::EngineStopped(self.session_id.clone()))?
    }

    /// Terminate the engine: graceful signal first, forced kill after the grace period.
    ///
    /// A response still streaming is persisted as interrupted. Safe to call
    /// from any task and more than once.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until the actor has shut down, for whatever reason
    pub async fn exited(&self) {
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
    }
}

async fn launch(
    session_id: &str,
    config: &EngineConfig,
    context: &EngineInput,
) -> Result<(Child, ChildStdin, OutputReader)> {
    tracing::debug!(args = ?config.args, "Spawning engine");

    let mut child = ProcessCommand::new(&config.binary)
        .args(&config.args)
        .current_dir(&config.working_dir)
        .env("ROOST_SESSION_ID", session_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RoostError::EngineSpawn(format!("failed to spawn {}: {e}", config.binary)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| RoostError::EngineSpawn("engine stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RoostError::EngineSpawn("engine stdout not captured".to_string()))?;

    if let Some(stderr) = child.stderr.take() {
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while matches!(reader.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                let line = String::from_utf8_lossy(&buf);
                if !line.trim().is_empty() {
                    tracing::debug!(session_id = %session_id, stderr = %line.trim_end(), "Engine stderr");
                }
                buf.clear();
            }
        });
    }

    let frame = context
        .to_line()
        .map_err(|e| RoostError::EngineSpawn(format!("failed to encode context: {e}")))?;
    write_line(&mut stdin, &frame)
        .await
        .map_err(|e| RoostError::EngineSpawn(format!("failed to write context: {e}")))?;

    let mut output = OutputReader::new(stdout);
    if config.await_ready {
        loop {
            let line = output
                .next_line()
                .await
                .map_err(|e| RoostError::EngineSpawn(format!("failed to read engine output: {e}")))?
                .ok_or_else(|| RoostError::EngineSpawn("engine exited before ready".to_string()))?;
            match parse_line(&line, &config.end_marker) {
                EngineOutput::Ready => break,
                EngineOutput::Error(message) => return Err(RoostError::EngineSpawn(message)),
                _ => tracing::debug!(line = %line.trim_end(), "Ignoring engine output before ready"),
            }
        }
    }

    Ok((child, stdin, output))
}

/// Line reader over engine stdout that tolerates bytes that are not UTF-8.
struct OutputReader {
    reader: BufReader<ChildStdout>,
    buf: Vec<u8>,
}

impl OutputReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            reader: BufReader::new(stdout),
            buf: Vec::new(),
        }
    }

    /// Next line with its terminator, or None at end of output.
    ///
    /// Cancel safe: a partial line read before cancellation stays buffered
    /// and is completed by the next call.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.reader.read_until(b'\n', &mut self.buf).await?;
        if self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Response currently streaming.
struct Turn {
    seq: i64,
    text: String,
}

struct EngineActor {
    session_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: OutputReader,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<EngineStatus>,
    store: SessionStore,
    relay: Arc<StreamRelay>,
    end_marker: String,
    stop_grace: Duration,
    turn: Option<Turn>,
}

impl EngineActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { text, reply }) => {
                        let _ = reply.send(self.begin_turn(text).await);
                    }
                    Some(Command::Stop { reply }) => {
                        self.shutdown().await;
                        self.commands.close();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        tracing::debug!(session_id = %self.session_id, "All engine handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                line = self.stdout.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => {
                        self.handle_exit("engine closed its output".to_string()).await;
                        break;
                    }
                    Err(e) => {
                        self.handle_exit(format!("failed to read engine output: {e}")).await;
                        break;
                    }
                },
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        self.status.send_replace(EngineStatus::now(state));
    }

    async fn begin_turn(&mut self, text: String) -> Result<SendReceipt> {
        if self.turn.is_some() {
            return Err(RoostError::EngineBusy(self.session_id.clone()));
        }
        if self.stdin.is_none() {
            return Err(RoostError::EngineStopped(self.session_id.clone()));
        }

        let (user_seq, response_seq) = self.store.append_turn(&self.session_id, &text).await?;
        self.relay.publish(RelayEvent::UserMessage {
            session_id: self.session_id.clone(),
            seq: user_seq,
            body: text.clone(),
        });

        let frame = EngineInput::Prompt { text }.to_line();
        let written = match frame {
            Ok(frame) => match self.stdin.as_mut() {
                Some(stdin) => write_line(stdin, &frame).await.map_err(|e| e.to_string()),
                None => Err("stdin closed".to_string()),
            },
            Err(e) => Err(e.to_string()),
        };
        if let Err(detail) = written {
            tracing::error!(session_id = %self.session_id, error = %detail, "Failed to write prompt");
            if let Err(e) = self.store.interrupt(&self.session_id, response_seq, "").await {
                tracing::error!(session_id = %self.session_id, error = %e, "Failed to mark response interrupted");
            }
            return Err(RoostError::EngineCrashed {
                session_id: self.session_id.clone(),
                detail: format!("failed to write prompt: {detail}"),
            });
        }

        self.turn = Some(Turn {
            seq: response_seq,
            text: String::new(),
        });
        self.set_state(EngineState::Streaming);
        self.relay.publish(RelayEvent::ResponseStarted {
            session_id: self.session_id.clone(),
            seq: response_seq,
        });

        tracing::debug!(session_id = %self.session_id, user_seq, response_seq, "Prompt sent");
        Ok(SendReceipt {
            user_seq,
            response_seq,
        })
    }

    async fn handle_line(&mut self, line: &str) {
        match parse_line(line, &self.end_marker) {
            EngineOutput::Ready => {}
            EngineOutput::Error(message) => {
                tracing::warn!(session_id = %self.session_id, error = %message, "Engine reported an error");
                self.relay.publish(RelayEvent::EngineError {
                    session_id: self.session_id.clone(),
                    message,
                });
            }
            EngineOutput::Delta(delta) => {
                let Some(turn) = self.turn.as_mut() else {
                    if !delta.trim().is_empty() {
                        tracing::debug!(session_id = %self.session_id, "Engine output outside a turn");
                    }
                    return;
                };
                turn.text.push_str(&delta);
                let seq = turn.seq;
                self.relay.publish(RelayEvent::Token(TokenEvent {
                    session_id: self.session_id.clone(),
                    seq,
                    delta,
                    is_final: false,
                }));
            }
            EngineOutput::End(full_text) => {
                let Some(turn) = self.turn.take() else {
                    return;
                };
                let body = full_text.unwrap_or(turn.text);
                if let Err(e) = self.store.finalize(&self.session_id, turn.seq, &body).await {
                    tracing::error!(session_id = %self.session_id, seq = turn.seq, error = %e, "Failed to finalize response");
                    self.relay.publish(RelayEvent::EngineError {
                        session_id: self.session_id.clone(),
                        message: e.to_string(),
                    });
                }
                self.relay.publish(RelayEvent::Token(TokenEvent {
                    session_id: self.session_id.clone(),
                    seq: turn.seq,
                    delta: String::new(),
                    is_final: true,
                }));
                self.set_state(EngineState::Idle);
                tracing::debug!(session_id = %self.session_id, seq = turn.seq, chars = body.len(), "Response complete");
            }
        }
    }

    /// The engine went away on its own.
    async fn handle_exit(&mut self, reason: String) {
        // Handles see the engine as gone before observers hear about it
        self.commands.close();
        self.stdin = None;
        let status = match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to reap engine");
                None
            }
            Err(_) => {
                terminate(&mut self.child, Duration::ZERO).await;
                None
            }
        };
        let detail = match status {
            Some(status) => format!("{reason} ({status})"),
            None => reason,
        };
        let clean = status.is_some_and(|s| s.success());

        match self.turn.take() {
            Some(turn) => {
                self.set_state(EngineState::Failed);
                tracing::warn!(session_id = %self.session_id, seq = turn.seq, detail = %detail, "Engine crashed while streaming");
                if let Err(e) = self
                    .store
                    .interrupt(&self.session_id, turn.seq, &turn.text)
                    .await
                {
                    tracing::error!(session_id = %self.session_id, error = %e, "Failed to mark response interrupted");
                }
                self.relay.publish(RelayEvent::EngineCrashed {
                    session_id: self.session_id.clone(),
                    seq: Some(turn.seq),
                    detail,
                });
            }
            None if !clean => {
                self.set_state(EngineState::Failed);
                tracing::warn!(session_id = %self.session_id, detail = %detail, "Engine exited unexpectedly");
                self.relay.publish(RelayEvent::EngineCrashed {
                    session_id: self.session_id.clone(),
                    seq: None,
                    detail,
                });
            }
            None => tracing::info!(session_id = %self.session_id, "Engine exited"),
        }
        self.set_state(EngineState::Idle);
    }

    /// Requested shutdown.
    async fn shutdown(&mut self) {
        // EOF on stdin is the polite request
        self.stdin = None;
        terminate(&mut self.child, self.stop_grace).await;

        if let Some(turn) = self.turn.take() {
            tracing::info!(session_id = %self.session_id, seq = turn.seq, "Response interrupted by stop");
            if let Err(e) = self
                .store
                .interrupt(&self.session_id, turn.seq, &turn.text)
                .await
            {
                tracing::error!(session_id = %self.session_id, error = %e, "Failed to mark response interrupted");
            }
            self.relay.publish(RelayEvent::Interrupted {
                session_id: self.session_id.clone(),
                seq: turn.seq,
            });
        }
        self.set_state(EngineState::Idle);
        tracing::info!(session_id = %self.session_id, "Engine stopped");
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is our own unreaped child, so it cannot have been recycled
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(grace_ms = grace.as_millis() as u64, "Engine ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Failed to kill engine");
        }
    }
}
