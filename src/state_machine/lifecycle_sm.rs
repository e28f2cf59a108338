//! VM lifecycle state machine.
//!
//! ```text
//! Idle ──Start──► Launching ──SpawnSucceeded──► Running ──Stop──► ShuttingDown
//!   │                 │                            │                  │
//!   │ Stop            │ SpawnFailed                │ SessionFinished  │ SessionFinished
//!   ▼                 ▼                            ▼                  ▼
//!   └──────────────────────────────► Terminated ◄─────────────────────┘
//! ```
//!
//! Only the transition table lives here; the controller performs the effects
//! and consults the resulting state.

use statig::prelude::*;
use tracing::info;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    SpawnSucceeded,
    SpawnFailed,
    Stop,
    SessionFinished,
    WakeLockToggled,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LifecycleMachine;

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl LifecycleMachine {
    /// No session has been requested yet.
    #[state]
    fn idle(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Start => Transition(State::launching()),
            LifecycleEvent::Stop => Transition(State::terminated()),
            _ => Handled,
        }
    }

    /// Budget, ports and launch plan are being prepared and the process spawned.
    #[state(entry_action = "enter_launching")]
    fn launching(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::SpawnSucceeded => Transition(State::running()),
            LifecycleEvent::SpawnFailed => Transition(State::terminated()),
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Superstate: Live (a session process exists)
    // ------------------------------------------------------------------

    #[superstate]
    fn live(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::SessionFinished => Transition(State::terminated()),
            _ => Handled,
        }
    }

    #[state(superstate = "live", entry_action = "enter_running")]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Stop => Transition(State::shutting_down()),
            _ => Super,
        }
    }

    /// Stop requested; waiting for the process to exit.
    #[state(superstate = "live", entry_action = "enter_shutting_down")]
    fn shutting_down(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Super
    }

    /// Final state. Every event is absorbed.
    #[state(entry_action = "enter_terminated")]
    fn terminated(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_launching(&mut self) {
        info!(target: "lifecycle", "Launching");
    }

    #[action]
    fn enter_running(&mut self) {
        info!(target: "lifecycle", "Running");
    }

    #[action]
    fn enter_shutting_down(&mut self) {
        info!(target: "lifecycle", "ShuttingDown");
    }

    #[action]
    fn enter_terminated(&mut self) {
        info!(target: "lifecycle", "Terminated");
    }
}
