//! Generic protocol state machine.
//!
//! A machine has named states and named events. Legal edges are declared with
//! [`StateMachine::add_transition`]; anything else is refused:
//!
//! - an event the machine was never told about is [`DcommError::UnknownEvent`],
//!   a protocol-definition bug;
//! - a declared event with no edge from the current state is
//!   [`DcommError::ProtocolAnomaly`], an out-of-order message from a peer.
//!
//! Before-hooks may veto a transition. Every attempt on a declared event runs
//! the after-hooks exactly once, whether it moved, was vetoed, or was illegal.
//! Error-hooks run only for vetoed or illegal attempts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DcommError, DcommResult};

/// What a hook sees about the attempt in progress.
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub protocol: &'a str,
    pub role: &'a str,
    pub event: &'a str,
    pub source: &'a str,
    /// Destination of the matched edge; `None` when no edge matched.
    pub dest: Option<&'a str>,
    /// Whether the state actually changed. Always false for before-hooks.
    pub moved: bool,
}

/// Runs before a transition; an `Err` reason aborts it.
pub type Guard = Arc<dyn Fn(&HookContext<'_>) -> Result<(), String> + Send + Sync>;

/// Runs after an attempt (or on failure, for error-hooks).
pub type Hook = Arc<dyn Fn(&HookContext<'_>) + Send + Sync>;

/// Result of a legal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Moved { from: String, to: String },
    /// A before-hook vetoed the transition. State is unchanged.
    Aborted { reason: String },
}

#[derive(Clone)]
struct Edge {
    sources: Vec<String>,
    dest: String,
    before: Vec<Guard>,
    after: Vec<Hook>,
}

/// Persisted form: exactly `{protocol, role, state}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub protocol: String,
    pub role: String,
    pub state: String,
}

#[derive(Clone)]
pub struct StateMachine {
    protocol: String,
    role: String,
    states: Vec<String>,
    events: Vec<String>,
    state: String,
    edges: HashMap<String, Vec<Edge>>,
    after_hooks: Vec<Hook>,
    error_hooks: Vec<Hook>,
}

impl StateMachine {
    pub fn new(
        protocol: impl Into<String>,
        role: impl Into<String>,
        states: &[&str],
        events: &[&str],
        start: &str,
    ) -> DcommResult<Self> {
        let machine = Self {
            protocol: protocol.into(),
            role: role.into(),
            states: states.iter().map(|s| s.to_string()).collect(),
            events: events.iter().map(|e| e.to_string()).collect(),
            state: start.to_string(),
            edges: HashMap::new(),
            after_hooks: Vec::new(),
            error_hooks: Vec::new(),
        };
        machine.check_state(start)?;
        Ok(machine)
    }

    fn check_state(&self, state: &str) -> DcommResult<()> {
        if self.states.iter().any(|s| s == state) {
            Ok(())
        } else {
            Err(DcommError::Format(format!(
                "\"{state}\" is not a state of {}@{}",
                self.role, self.protocol
            )))
        }
    }

    fn unknown_event(&self, event: &str) -> DcommError {
        DcommError::UnknownEvent {
            protocol: self.protocol.clone(),
            role: self.role.clone(),
            event: event.to_string(),
        }
    }

    /// Declare a legal edge. Repeated calls for one event accumulate.
    pub fn add_transition(&mut self, event: &str, sources: &[&str], dest: &str) -> DcommResult<()> {
        self.add_transition_with_hooks(event, sources, dest, Vec::new(), Vec::new())
    }

    pub fn add_transition_with_hooks(
        &mut self,
        event: &str,
        sources: &[&str],
        dest: &str,
        before: Vec<Guard>,
        after: Vec<Hook>,
    ) -> DcommResult<()> {
        if !self.events.iter().any(|e| e == event) {
            return Err(self.unknown_event(event));
        }
        for state in sources.iter().chain(std::iter::once(&dest)) {
            self.check_state(state)?;
        }
        self.edges.entry(event.to_string()).or_default().push(Edge {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            dest: dest.to_string(),
            before,
            after,
        });
        Ok(())
    }

    /// Hook run once after every attempt on a declared event.
    pub fn on_after(&mut self, hook: Hook) {
        self.after_hooks.push(hook);
    }

    /// Hook run when an attempt is vetoed or illegal.
    pub fn on_error(&mut self, hook: Hook) {
        self.error_hooks.push(hook);
    }

    /// Attempt `event` from the current state.
    pub fn handle(&mut self, event: &str) -> DcommResult<Outcome> {
        if !self.events.iter().any(|e| e == event) {
            return Err(self.unknown_event(event));
        }

        let source = self.state.clone();
        let edge = self
            .edges
            .get(event)
            .and_then(|edges| edges.iter().find(|e| e.sources.iter().any(|s| *s == source)))
            .cloned();

        let Some(edge) = edge else {
            let ctx = HookContext {
                protocol: &self.protocol,
                role: &self.role,
                event,
                source: &source,
                dest: None,
                moved: false,
            };
            self.error_hooks.iter().for_each(|h| h(&ctx));
            self.after_hooks.iter().for_each(|h| h(&ctx));
            return Err(DcommError::ProtocolAnomaly {
                protocol: self.protocol.clone(),
                role: self.role.clone(),
                state: source.clone(),
                detail: format!("Can't {event} from {source}."),
            });
        };

        let mut ctx = HookContext {
            protocol: &self.protocol,
            role: &self.role,
            event,
            source: &source,
            dest: Some(&edge.dest),
            moved: false,
        };
        let veto = edge.before.iter().find_map(|guard| guard(&ctx).err());

        let outcome = match veto {
            Some(reason) => {
                debug!(protocol = %self.protocol, role = %self.role, event, %reason, "Transition aborted");
                self.error_hooks.iter().for_each(|h| h(&ctx));
                Outcome::Aborted { reason }
            }
            None => {
                debug!(
                    protocol = %self.protocol,
                    role = %self.role,
                    from = %source,
                    to = %edge.dest,
                    "State transition"
                );
                ctx.moved = true;
                Outcome::Moved {
                    from: source.clone(),
                    to: edge.dest.clone(),
                }
            }
        };
        edge.after.iter().for_each(|h| h(&ctx));
        self.after_hooks.iter().for_each(|h| h(&ctx));

        if let Outcome::Moved { to, .. } = &outcome {
            self.state = to.clone();
        }
        Ok(outcome)
    }

    /// Force the current state without consulting the transition table.
    ///
    /// Only for restoring a persisted machine. Use [`StateMachine::handle`]
    /// for anything a peer caused.
    pub fn set_state_by_short_circuit(&mut self, state: &str) -> DcommResult<()> {
        self.check_state(state)?;
        self.state = state.to_string();
        Ok(())
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Events with an edge leaving the current state.
    pub fn legal_events(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| {
                self.edges
                    .get(e.as_str())
                    .is_some_and(|edges| edges.iter().any(|edge| edge.sources.contains(&self.state)))
            })
            .map(String::as_str)
            .collect()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            protocol: self.protocol.clone(),
            role: self.role.clone(),
            state: self.state.clone(),
        }
    }

    /// Restore from a snapshot taken of a machine with the same protocol and role.
    pub fn restore(&mut self, snapshot: &MachineSnapshot) -> DcommResult<()> {
        if snapshot.protocol != self.protocol || snapshot.role != self.role {
            return Err(DcommError::Format(format!(
                "snapshot of {}@{} can't restore {}@{}",
                snapshot.role, snapshot.protocol, self.role, self.protocol
            )));
        }
        self.set_state_by_short_circuit(&snapshot.state)
    }

    pub fn to_json(&self) -> DcommResult<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }
}

impl fmt::Display for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}: {}", self.role, self.protocol, self.state)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("protocol", &self.protocol)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
