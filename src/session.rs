//! The VM session: one QEMU subprocess bound to a terminal emulator.
//!
//! Architecture (data flows):
//!
//! ```text
//! [QEMU process] ── stdout ──► [pump task] ──SessionEvent::Output──► controller
//!       ▲                           │                                   │
//!       │                           └──SessionEvent::Exited (last)──►   │ feed()
//!       │                                                               ▼
//!   [stdin writer task] ◄──StdinOp── write()/paste()       alacritty_terminal::Term
//!                                        ▲                              │
//!                                        └──── PtyWrite replies ◄───────┘
//! ```
//!
//! The emulator is owned by the session and only touched from the controller's
//! task, so it needs no lock. Out-of-band events raised while parsing (bell,
//! OSC 52 clipboard stores, terminal replies) are collected through the event
//! listener and returned from [`Session::feed`] in the order they were raised.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alacritty_terminal::Term;
use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Point};
use alacritty_terminal::term::{Config, TermMode};
use alacritty_terminal::vte::ansi::Processor;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::vm::LaunchPlan;

/// Serial console grid. QEMU's stdio chardev has no window-size channel.
pub const DEFAULT_COLUMNS: usize = 80;
pub const DEFAULT_LINES: usize = 24;

const READ_CHUNK: usize = 4096;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// --- Events -----------------------------------------------------------------

/// Raw events from a session's background tasks, marshalled to the controller.
#[derive(Debug)]
pub enum SessionEvent {
    /// A chunk read from the process stdout.
    Output { id: u64, bytes: Vec<u8> },
    /// The process was reaped. Always the last event for `id`.
    Exited {
        id: u64,
        status: Option<ExitStatus>,
    },
}

/// Observable results of feeding bytes through the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorEvent {
    TextChanged,
    Bell,
    ClipboardText(String),
}

#[derive(Debug)]
enum StdinOp {
    Data(Vec<u8>),
    Close,
}

// --- TermSize helper --------------------------------------------------------

struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }
    fn screen_lines(&self) -> usize {
        self.screen_lines
    }
    fn columns(&self) -> usize {
        self.columns
    }
}

// --- EventListener ----------------------------------------------------------

#[derive(Clone)]
struct EmulatorListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventListener for EmulatorListener {
    fn send_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

// --- Session ----------------------------------------------------------------

/// A live VM process and the emulator state of its serial console.
pub struct Session {
    id: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,

    term: Term<EmulatorListener>,
    processor: Processor,
    emulator_rx: mpsc::UnboundedReceiver<Event>,

    stdin_tx: mpsc::UnboundedSender<StdinOp>,
    kill: Arc<Notify>,

    alive: bool,
    finishing: bool,
    exit_status: Option<ExitStatus>,
}

impl Session {
    /// Spawn the process described by `plan`.
    ///
    /// Output and the final exit are delivered on `events`, tagged with this
    /// session's id. Must be called from within a tokio runtime.
    pub fn start(plan: &LaunchPlan, events: mpsc::UnboundedSender<SessionEvent>) -> Result<Self> {
        let mut cmd = Command::new(&plan.program);
        #[cfg(unix)]
        if let Some(arg0) = plan.argv.first() {
            cmd.arg0(arg0);
        }
        cmd.args(plan.args())
            .env_clear()
            .envs(&plan.env)
            .current_dir(&plan.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: plan.program.clone(),
            source,
        })?;

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(plan, "stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing_pipe(plan, "stdout"))?;

        info!(id, pid, program = %plan.program.display(), "VM process spawned");

        // Stdin writer: applies writes in call order, drops the pipe on Close.
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<StdinOp>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(op) = stdin_rx.recv().await {
                match op {
                    StdinOp::Data(bytes) => {
                        if let Err(e) = stdin.write_all(&bytes).await {
                            debug!(id, error = %e, "stdin closed by VM");
                            break;
                        }
                        let _ = stdin.flush().await;
                    }
                    StdinOp::Close => break,
                }
            }
            debug!(id, "stdin writer exiting");
        });

        // Pump: stdout chunks, then the reaped status.
        let kill = Arc::new(Notify::new());
        let pump_kill = kill.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let _ = events.send(SessionEvent::Output { id, bytes: buf[..n].to_vec() });
                        }
                        Err(e) => {
                            warn!(id, error = %e, "error reading VM console");
                            break;
                        }
                    },
                    _ = pump_kill.notified() => {
                        warn!(id, "VM did not exit within grace window, killing");
                        let _ = child.start_kill();
                    }
                }
            }

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status.ok(),
                    _ = pump_kill.notified() => {
                        warn!(id, "VM did not exit within grace window, killing");
                        let _ = child.start_kill();
                    }
                }
            };
            info!(id, exit_status = ?status, "VM process exited");
            let _ = events.send(SessionEvent::Exited { id, status });
        });

        let (emulator_tx, emulator_rx) = mpsc::unbounded_channel();
        let size = TermSize {
            columns: DEFAULT_COLUMNS,
            screen_lines: DEFAULT_LINES,
        };
        let term = Term::new(Config::default(), &size, EmulatorListener { tx: emulator_tx });

        Ok(Self {
            id,
            pid,
            started_at: Utc::now(),
            term,
            processor: Processor::new(),
            emulator_rx,
            stdin_tx,
            kill,
            alive: true,
            finishing: false,
            exit_status: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Exit status once reaped; `None` while running or if reaping failed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Run stdout bytes through the emulator.
    ///
    /// Returns the out-of-band events the chunk produced, followed by
    /// `TextChanged`. Terminal replies are written straight back to stdin.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<EmulatorEvent> {
        self.processor.advance(&mut self.term, bytes);

        let mut out = Vec::new();
        while let Ok(event) = self.emulator_rx.try_recv() {
            match event {
                Event::Bell => out.push(EmulatorEvent::Bell),
                Event::ClipboardStore(_, text) => out.push(EmulatorEvent::ClipboardText(text)),
                Event::PtyWrite(reply) => self.write(reply.as_bytes()),
                _ => {}
            }
        }
        out.push(EmulatorEvent::TextChanged);
        out
    }

    /// Queue bytes for the process stdin. Ignored once the session is dead.
    pub fn write(&self, bytes: &[u8]) {
        if !self.alive || bytes.is_empty() {
            return;
        }
        let _ = self.stdin_tx.send(StdinOp::Data(bytes.to_vec()));
    }

    /// Write pasted text, honoring the guest's bracketed-paste mode.
    pub fn paste(&self, text: &str) {
        let bracketed = self.term.mode().contains(TermMode::BRACKETED_PASTE);
        self.write(prepare_paste(text, bracketed).as_bytes());
    }

    /// Resynchronize the emulator. The process is left running.
    ///
    /// A soft reset drops any half-parsed escape sequence; a hard reset also
    /// performs a full terminal reset and clears scrollback.
    pub fn reset(&mut self, hard: bool) {
        self.processor = Processor::new();
        if hard {
            self.processor.advance(&mut self.term, b"\x1bc");
            self.term.grid_mut().clear_history();
            // RIS raises no events worth reporting.
            while self.emulator_rx.try_recv().is_ok() {}
        }
        debug!(id = self.id, hard, "emulator reset");
    }

    pub fn resize(&mut self, columns: usize, lines: usize) {
        self.term.resize(TermSize {
            columns: columns.max(2),
            screen_lines: lines.max(1),
        });
    }

    /// Ask the process to exit: newline, then EOF on stdin, then a kill once
    /// `grace` has elapsed. Repeated calls are no-ops.
    pub fn finish_if_running(&mut self, grace: Duration) {
        if !self.alive || self.finishing {
            return;
        }
        self.finishing = true;
        let _ = self.stdin_tx.send(StdinOp::Data(b"\n".to_vec()));
        let _ = self.stdin_tx.send(StdinOp::Close);

        let kill = self.kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            kill.notify_one();
        });
        info!(id = self.id, grace_ms = grace.as_millis() as u64, "VM finish requested");
    }

    /// Kill immediately, without the polite phase.
    pub fn kill(&mut self) {
        if self.alive {
            self.finishing = true;
            self.kill.notify_one();
        }
    }

    /// Record the reaped status. Called by the controller on `Exited`.
    pub fn mark_exited(&mut self, status: Option<ExitStatus>) {
        self.alive = false;
        self.exit_status = status;
    }

    /// Scrollback plus visible screen as plain text.
    pub fn screen_transcript(&self) -> String {
        let start = Point::new(self.term.topmost_line(), Column(0));
        let end = Point::new(self.term.bottommost_line(), self.term.last_column());
        self.term.bounds_to_string(start, end)
    }
}

fn missing_pipe(plan: &LaunchPlan, which: &str) -> Error {
    Error::Spawn {
        program: plan.program.clone(),
        source: std::io::Error::other(format!("{which} pipe unavailable")),
    }
}

/// Sanitize pasted text the way a terminal would before sending it.
///
/// Strips ESC and C1 controls, converts line endings to carriage returns,
/// and wraps in bracketed-paste markers when the guest asked for them.
pub fn prepare_paste(text: &str, bracketed: bool) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\u{1b}' && !('\u{80}'..='\u{9f}').contains(c))
        .collect();
    let cleaned = cleaned.replace("\r\n", "\r").replace('\n', "\r");
    if bracketed {
        format!("\x1b[200~{cleaned}\x1b[201~")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paste_strips_escape_and_c1() {
        assert_eq!(prepare_paste("a\u{1b}[31mb\u{9b}c", false), "a[31mbc");
    }

    #[test]
    fn paste_normalizes_newlines() {
        assert_eq!(prepare_paste("ls\r\npwd\nexit", false), "ls\rpwd\rexit");
    }

    #[test]
    fn paste_wraps_when_bracketed() {
        assert_eq!(prepare_paste("echo hi\n", true), "\x1b[200~echo hi\r\x1b[201~");
    }

    #[test]
    fn paste_keeps_unicode() {
        assert_eq!(prepare_paste("héllo ✓", false), "héllo ✓");
    }
}
