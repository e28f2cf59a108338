//! VM lifecycle controller.
//!
//! Owns the single [`Session`], the lifecycle state machine, the foreground
//! status registration and the wake holds. All state changes happen on the
//! controller's own task: session pumps and [`ControllerHandle`]s only send
//! messages to it.
//!
//! ## Architecture
//!
//! ```text
//! ControllerHandle ──ControlCommand──┐
//!                                    ▼
//!                     LifecycleController::run()  ◄──SessionEvent── Session pump
//!                        │        │        │
//!                        │        │        └─► SessionObserver (when visible)
//!                        │        └─► StatusSink (foreground status line)
//!                        └─► lifecycle_sm (Idle → Launching → Running → ShuttingDown → Terminated)
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use statig::blocking::StateMachine;
use statig::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Preferences;
use crate::error::{Error, Result};
use crate::session::{EmulatorEvent, Session, SessionEvent};
use crate::state_machine::lifecycle_sm::{LifecycleEvent, LifecycleMachine, State};
use crate::vm::args::{ArgBuilder, LaunchLayout};
use crate::vm::budget::{BudgetLimits, MemoryProbe, ProcMeminfo, ResourceBudget};
use crate::vm::foreground::{self, StatusSink, TracingStatusSink, WakeHolds};
use crate::vm::ports::PortMap;

/// Time between EOF on the VM's stdin and a forced kill.
pub const FINISH_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Observed lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Launching,
    Running,
    ShuttingDown,
    Terminated,
}

impl From<&State> for ControllerState {
    fn from(state: &State) -> Self {
        match state {
            State::Idle {} => ControllerState::Idle,
            State::Launching {} => ControllerState::Launching,
            State::Running {} => ControllerState::Running,
            State::ShuttingDown {} => ControllerState::ShuttingDown,
            State::Terminated {} => ControllerState::Terminated,
        }
    }
}

/// Foreground consumer of session events.
///
/// Callbacks other than `on_session_finished` are only delivered while
/// `is_visible` returns true.
pub trait SessionObserver: Send {
    fn is_visible(&self) -> bool {
        true
    }
    fn on_text_changed(&mut self, session: &Session);
    fn on_session_finished(&mut self, session: &Session);
    fn on_clipboard_text(&mut self, session: &Session, text: &str);
    fn on_bell(&mut self, session: &Session);
    /// A launch was aborted before the VM started.
    fn on_launch_error(&mut self, error: &Error) {
        let _ = error;
    }
}

/// Named inbound control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stop,
    WakeLockEnable,
    WakeLockDisable,
}

impl ControlAction {
    pub const STOP: &'static str = "vshell.action.STOP";
    pub const WAKELOCK_ENABLE: &'static str = "vshell.action.WAKELOCK_ENABLE";
    pub const WAKELOCK_DISABLE: &'static str = "vshell.action.WAKELOCK_DISABLE";

    /// Accepts the qualified action names and their bare suffixes.
    pub fn parse(action: &str) -> Option<Self> {
        let bare = action.strip_prefix("vshell.action.").unwrap_or(action);
        match bare {
            "STOP" => Some(ControlAction::Stop),
            "WAKELOCK_ENABLE" => Some(ControlAction::WakeLockEnable),
            "WAKELOCK_DISABLE" => Some(ControlAction::WakeLockDisable),
            _ => None,
        }
    }
}

/// Static inputs of a controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub layout: LaunchLayout,
    pub limits: BudgetLimits,
    pub finish_grace: Duration,
    /// Keep the foreground registration and session after an unexpected exit.
    pub debug: bool,
    /// Host environment the pass-through variables are taken from.
    pub inherited_env: BTreeMap<String, String>,
    pub local_ip: fn() -> Option<IpAddr>,
}

impl ControllerOptions {
    pub fn new(layout: LaunchLayout) -> Self {
        Self {
            layout,
            limits: BudgetLimits::default(),
            finish_grace: FINISH_GRACE,
            debug: false,
            inherited_env: std::env::vars().collect(),
            local_ip: foreground::local_ip,
        }
    }
}

/// Messages accepted from [`ControllerHandle`]s.
pub enum ControlCommand {
    Start(oneshot::Sender<Result<()>>),
    Stop,
    Action(String),
    SetWakeLock(bool),
    Write(Vec<u8>),
    Paste(String),
    Reset(bool),
    Attach(Box<dyn SessionObserver>),
    Detach,
}

/// Cloneable sender for driving a controller from other tasks.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ControllerHandle {
    /// Request a launch and wait for its outcome.
    pub async fn start(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ControlCommand::Start(reply_tx))?;
        reply_rx.await.map_err(|_| Error::ControllerTerminated)?
    }

    pub fn stop(&self) -> Result<()> {
        self.send(ControlCommand::Stop)
    }

    pub fn action(&self, action: impl Into<String>) -> Result<()> {
        self.send(ControlCommand::Action(action.into()))
    }

    pub fn set_wake_lock(&self, enabled: bool) -> Result<()> {
        self.send(ControlCommand::SetWakeLock(enabled))
    }

    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(ControlCommand::Write(bytes.into()))
    }

    pub fn paste(&self, text: impl Into<String>) -> Result<()> {
        self.send(ControlCommand::Paste(text.into()))
    }

    pub fn reset(&self, hard: bool) -> Result<()> {
        self.send(ControlCommand::Reset(hard))
    }

    pub fn attach(&self, observer: Box<dyn SessionObserver>) -> Result<()> {
        self.send(ControlCommand::Attach(observer))
    }

    pub fn detach(&self) -> Result<()> {
        self.send(ControlCommand::Detach)
    }

    fn send(&self, command: ControlCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::ControllerTerminated)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct LifecycleController {
    options: ControllerOptions,
    preferences: Preferences,
    probe: Box<dyn MemoryProbe>,
    status: Box<dyn StatusSink>,
    holds: WakeHolds,
    machine: StateMachine<LifecycleMachine>,

    observer: Option<Box<dyn SessionObserver>>,
    session: Option<Session>,
    /// Forwards of the current session; preference edits apply next launch.
    active_ports: Option<PortMap>,
    wants_to_stop: bool,
    foreground_registered: bool,
    finished_delivered: bool,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    commands_tx: mpsc::UnboundedSender<ControlCommand>,
    commands_rx: mpsc::UnboundedReceiver<ControlCommand>,
}

impl LifecycleController {
    pub fn new(options: ControllerOptions, preferences: Preferences) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            options,
            preferences,
            probe: Box::new(ProcMeminfo::default()),
            status: Box::new(TracingStatusSink::default()),
            holds: WakeHolds::default(),
            machine: LifecycleMachine.state_machine(),
            observer: None,
            session: None,
            active_ports: None,
            wants_to_stop: false,
            foreground_registered: false,
            finished_delivered: false,
            events_tx,
            events_rx,
            commands_tx,
            commands_rx,
        }
    }

    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_status_sink(mut self, status: Box<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_wake_holds(mut self, holds: WakeHolds) -> Self {
        self.holds = holds;
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.commands_tx.clone(),
        }
    }

    // --- Accessors ----------------------------------------------------------

    pub fn state(&self) -> ControllerState {
        self.machine.state().into()
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn preferences_mut(&mut self) -> &mut Preferences {
        &mut self.preferences
    }

    pub fn active_ports(&self) -> Option<&PortMap> {
        self.active_ports.as_ref()
    }

    pub fn is_forwarded_port(&self, port: u16) -> bool {
        self.active_ports
            .as_ref()
            .is_some_and(|ports| ports.is_forwarded_port(port))
    }

    /// SSH URI for the running session and the configured default user.
    pub fn ssh_uri(&self) -> Option<String> {
        self.active_ports
            .as_ref()
            .map(|ports| ports.ssh_uri(self.preferences.default_ssh_user()))
    }

    pub fn wake_lock_held(&self) -> bool {
        self.holds.is_held()
    }

    pub fn wants_to_stop(&self) -> bool {
        self.wants_to_stop
    }

    /// Terminated with the foreground registration and session released.
    pub fn is_released(&self) -> bool {
        self.state() == ControllerState::Terminated
            && !self.foreground_registered
            && self.session.is_none()
    }

    // --- Observer -----------------------------------------------------------

    /// Attach `observer`, returning the previously attached one.
    pub fn attach_observer(
        &mut self,
        observer: Box<dyn SessionObserver>,
    ) -> Option<Box<dyn SessionObserver>> {
        debug!("observer attached");
        self.observer.replace(observer)
    }

    pub fn detach_observer(&mut self) -> Option<Box<dyn SessionObserver>> {
        debug!("observer detached");
        self.observer.take()
    }

    // --- Transitions --------------------------------------------------------

    /// Launch the VM. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        match self.state() {
            ControllerState::Idle => {}
            ControllerState::Terminated => return Err(Error::ControllerTerminated),
            _ => return Err(Error::AlreadyRunning),
        }

        self.machine.handle(&LifecycleEvent::Start);
        self.register_foreground();

        match self.launch() {
            Ok((session, ports)) => {
                info!(
                    id = session.id(),
                    pid = session.pid(),
                    ssh_port = ports.host_port(crate::vm::Service::Ssh),
                    "VM running"
                );
                self.session = Some(session);
                self.active_ports = Some(ports);
                self.finished_delivered = false;
                self.machine.handle(&LifecycleEvent::SpawnSucceeded);
                self.refresh_status();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "VM launch failed");
                self.machine.handle(&LifecycleEvent::SpawnFailed);
                self.status
                    .update(&format!("Failed to start virtual machine: {e}"));
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_launch_error(&e);
                }
                self.teardown();
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> Result<(Session, PortMap)> {
        let ports = PortMap::resolve(self.preferences.values())?;
        let budget = ResourceBudget::from_probe(self.probe.as_ref(), &self.options.limits);

        let layout = &self.options.layout;
        let plan = ArgBuilder::new(layout).with_limits(self.options.limits).build(
            &budget,
            &ports,
            layout.host_share_available(),
            &self.options.inherited_env,
        )?;
        info!(program = %plan.program.display(), argv = ?plan.argv, "launching VM");

        let session = Session::start(&plan, self.events_tx.clone())?;
        Ok((session, ports))
    }

    /// Request shutdown. Safe to call in any state, any number of times.
    pub fn stop(&mut self) {
        self.wants_to_stop = true;
        match self.state() {
            ControllerState::Idle => {
                self.machine.handle(&LifecycleEvent::Stop);
                self.teardown();
            }
            ControllerState::Launching | ControllerState::Running => {
                self.machine.handle(&LifecycleEvent::Stop);
                if let Some(session) = self.session.as_mut() {
                    session.finish_if_running(self.options.finish_grace);
                }
                self.refresh_status();
            }
            ControllerState::ShuttingDown => {
                debug!("stop already in progress");
            }
            ControllerState::Terminated => {
                // Debug mode may still hold the registration after a crash.
                self.teardown();
            }
        }
    }

    /// Dispatch a named control action. Unknown actions are logged and ignored.
    pub fn handle_action(&mut self, action: &str) {
        let result = match ControlAction::parse(action) {
            Some(ControlAction::Stop) => {
                self.stop();
                Ok(())
            }
            Some(ControlAction::WakeLockEnable) => self.set_wake_lock(true),
            Some(ControlAction::WakeLockDisable) => self.set_wake_lock(false),
            None => {
                warn!(action, "unknown control action");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(action, error = %e, "control action failed");
        }
    }

    /// Take or drop the wake and wifi holds together.
    pub fn set_wake_lock(&mut self, enabled: bool) -> Result<()> {
        if self.state() == ControllerState::Terminated {
            return Err(Error::NotRunning);
        }
        if enabled == self.holds.is_held() {
            return Ok(());
        }
        if enabled {
            self.holds.acquire()?;
        } else {
            self.holds.release();
        }
        self.machine.handle(&LifecycleEvent::WakeLockToggled);
        self.refresh_status();
        Ok(())
    }

    pub fn toggle_wake_lock(&mut self) -> Result<()> {
        self.set_wake_lock(!self.holds.is_held())
    }

    // --- Session input ------------------------------------------------------

    fn live_session(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .filter(|s| s.is_alive())
            .ok_or(Error::NotRunning)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.live_session()?.write(bytes);
        Ok(())
    }

    pub fn paste(&mut self, text: &str) -> Result<()> {
        self.live_session()?.paste(text);
        Ok(())
    }

    pub fn reset(&mut self, hard: bool) -> Result<()> {
        self.live_session()?.reset(hard);
        Ok(())
    }

    pub fn resize(&mut self, columns: usize, lines: usize) -> Result<()> {
        self.live_session()?.resize(columns, lines);
        Ok(())
    }

    // --- Event loop ---------------------------------------------------------

    /// Process commands and session events until the controller is
    /// terminated and released.
    pub async fn run(&mut self) {
        while !self.is_released() {
            self.process_next_event().await;
        }
        info!("controller released");
    }

    /// Wait for and apply the next command or session event.
    pub async fn process_next_event(&mut self) {
        tokio::select! {
            Some(event) = self.events_rx.recv() => self.handle_session_event(event),
            Some(command) = self.commands_rx.recv() => self.handle_command(command),
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand) {
        let result = match command {
            ControlCommand::Start(reply) => {
                let _ = reply.send(self.start());
                Ok(())
            }
            ControlCommand::Stop => {
                self.stop();
                Ok(())
            }
            ControlCommand::Action(action) => {
                self.handle_action(&action);
                Ok(())
            }
            ControlCommand::SetWakeLock(enabled) => self.set_wake_lock(enabled),
            ControlCommand::Write(bytes) => self.write(&bytes),
            ControlCommand::Paste(text) => self.paste(&text),
            ControlCommand::Reset(hard) => self.reset(hard),
            ControlCommand::Attach(observer) => {
                self.attach_observer(observer);
                Ok(())
            }
            ControlCommand::Detach => {
                self.detach_observer();
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "control command rejected");
        }
    }

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        let current = self.session.as_ref().map(Session::id);
        match event {
            SessionEvent::Output { id, bytes } if current == Some(id) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let derived = session.feed(&bytes);
                self.dispatch(&derived);
            }
            SessionEvent::Exited { id, status } if current == Some(id) => {
                if let Some(session) = self.session.as_mut() {
                    session.mark_exited(status);
                }
                self.on_session_finished();
            }
            other => debug!(event = ?other, "event from a released session dropped"),
        }
    }

    fn dispatch(&mut self, events: &[EmulatorEvent]) {
        if self.finished_delivered {
            return;
        }
        let ignore_bell = self.preferences.ignore_bell();
        let (Some(session), Some(observer)) = (self.session.as_ref(), self.observer.as_mut()) else {
            return;
        };
        if !observer.is_visible() {
            return;
        }
        for event in events {
            match event {
                EmulatorEvent::TextChanged => observer.on_text_changed(session),
                EmulatorEvent::Bell if !ignore_bell => observer.on_bell(session),
                EmulatorEvent::Bell => {}
                EmulatorEvent::ClipboardText(text) => observer.on_clipboard_text(session, text),
            }
        }
    }

    fn on_session_finished(&mut self) {
        self.machine.handle(&LifecycleEvent::SessionFinished);

        if !self.finished_delivered {
            self.finished_delivered = true;
            if let (Some(session), Some(observer)) = (self.session.as_ref(), self.observer.as_mut()) {
                observer.on_session_finished(session);
            }
        }

        let status = self.session.as_ref().and_then(Session::exit_status);
        if self.wants_to_stop {
            info!(exit_status = ?status, "VM stopped");
            self.teardown();
        } else if self.options.debug {
            warn!(exit_status = ?status, "VM exited unexpectedly, keeping status for inspection");
            self.active_ports = None;
            self.refresh_status();
        } else {
            warn!(exit_status = ?status, "VM exited unexpectedly");
            self.teardown();
        }
    }

    // --- Foreground ---------------------------------------------------------

    fn register_foreground(&mut self) {
        if self.foreground_registered {
            return;
        }
        let text = self.status_line();
        self.status.register(&text);
        self.foreground_registered = true;
    }

    fn refresh_status(&mut self) {
        if self.foreground_registered {
            let text = self.status_line();
            self.status.update(&text);
        }
    }

    /// Current foreground status text.
    pub fn status_line(&self) -> String {
        let running = self.session.as_ref().is_some_and(Session::is_alive);
        let ports = self.active_ports.as_ref().filter(|_| running);
        let ip = ports.and_then(|_| (self.options.local_ip)());
        foreground::status_text(ports, ip, self.holds.is_held())
    }

    /// Release everything this controller holds. Idempotent.
    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.is_alive() {
                session.kill();
            }
        }
        self.active_ports = None;
        self.holds.release();
        if std::mem::take(&mut self.foreground_registered) {
            self.status.unregister();
        }
        debug!("controller torn down");
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.teardown();
    }
}
