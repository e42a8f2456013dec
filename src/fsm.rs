//! Connection and command state machine.
//!
//! Commands are never written the moment they are requested. The analyzer
//! cannot send and receive at the same time, so a requested command waits in
//! a queued state and goes out right after the next response frame arrives.
//!
//! The machine is a static transition table keyed by state and event kind.
//! Timed fallbacks are ordinary rows keyed by [`EventKind::DeadlineElapsed`],
//! armed on entry to a state that has a timeout. What a transition does is
//! described by [`Effect`]s; running them is up to the owner.

use crate::constants::*;
use log::debug;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Disconnected,
    Connecting,
    /// Connecting only to load a program, disconnects afterwards
    ConnectingWhileLoadPending,
    Connected,
    CommandQueued,
    CommandIssued,
    DisconnectQueued,
    Disconnecting,
    /// Program runs a step without a device command, e.g. a wait
    Running,
    RunningCommandQueued,
    RunningCommandIssued,
    /// Program runs a device command
    RunningActive,
    RunningActiveCommandQueued,
    RunningActiveCommandIssued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Init,
    Connect,
    Disconnect,
    CommandRequested,
    CommandFinished,
    /// Response that only shows the device is there
    TelemetryUnclassified,
    /// Response valid for the active command
    TelemetryClassified,
    LoadProgram,
    RunProgram,
    StopProgram,
    ProgramEnded,
    /// Timeout of the current state
    DeadlineElapsed,
}

/// Condition on the owner's state a row additionally requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    /// A requested command has not been written yet
    CommandPending,
    /// Nothing requested or about to be requested
    NothingPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Publish the initial property values
    Initialize,
    /// Reset displayed device state
    ResetDisplay,
    /// Publish the connection as established
    MarkConnected,
    SendConnect,
    SendDisconnect,
    /// Publish model and measurements after the first response
    FirstTelemetry,
    /// Publish measurements that changed
    PublishChanges,
    /// Remember the requested command
    QueueCommand,
    /// Write the queued command and make it the active one
    IssueCommand,
    /// Publish changes and hand the response to a running program
    Inject,
    /// The program's device command is done
    Finish,
    /// Keep a program until the device schema is known
    StashProgram,
    Load,
    Run,
    /// Stop the program, which may request a Stop command
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub event: EventKind,
    pub guard: Guard,
    pub to: State,
    pub effects: &'static [Effect],
}

const fn on(from: State, event: EventKind, to: State, effects: &'static [Effect]) -> Transition {
    Transition {
        from,
        event,
        guard: Guard::Always,
        to,
        effects,
    }
}

const fn guarded(
    from: State,
    event: EventKind,
    guard: Guard,
    to: State,
    effects: &'static [Effect],
) -> Transition {
    Transition {
        from,
        event,
        guard,
        to,
        effects,
    }
}

use Effect::*;
use EventKind::*;
use State::*;

/// Rows are tried in order, the first one whose guard holds fires.
#[rustfmt::skip]
pub static TRANSITIONS: &[Transition] = &[
    on(Initial, Init, Disconnected, &[Initialize]),
    on(Initial, DeadlineElapsed, Disconnected, &[Initialize]),
    // idle
    on(Disconnected, TelemetryUnclassified, Connected, &[]),
    on(Disconnected, TelemetryClassified, Connected, &[FirstTelemetry]),
    on(Disconnected, Connect, Connecting, &[SendConnect]),
    on(Connecting, DeadlineElapsed, Connecting, &[SendConnect]),
    on(Connecting, TelemetryClassified, Connected, &[FirstTelemetry]),
    on(Connecting, TelemetryUnclassified, Connected, &[FirstTelemetry]),
    on(Connecting, Disconnect, Disconnected, &[SendDisconnect]),
    on(Connected, CommandRequested, CommandQueued, &[QueueCommand]),
    on(Connected, TelemetryClassified, Connected, &[PublishChanges]),
    on(Connected, LoadProgram, Connected, &[Load]),
    on(Connected, RunProgram, Running, &[Run]),
    on(Connected, StopProgram, Connected, &[Halt]),
    on(Connected, ProgramEnded, Connected, &[]),
    on(Connected, Disconnect, DisconnectQueued, &[Halt]),
    on(CommandQueued, TelemetryUnclassified, CommandIssued, &[IssueCommand]),
    on(CommandQueued, TelemetryClassified, CommandIssued, &[IssueCommand]),
    on(CommandQueued, CommandRequested, CommandQueued, &[QueueCommand]),
    on(CommandIssued, DeadlineElapsed, CommandQueued, &[]),
    on(CommandIssued, TelemetryClassified, Connected, &[PublishChanges]),
    on(CommandIssued, CommandRequested, CommandQueued, &[QueueCommand]),
    // program between device commands
    on(Running, StopProgram, Connected, &[Halt]),
    on(Running, CommandRequested, RunningCommandQueued, &[QueueCommand]),
    on(Running, TelemetryClassified, Running, &[PublishChanges]),
    on(Running, ProgramEnded, Connected, &[]),
    on(Running, Disconnect, DisconnectQueued, &[Halt]),
    on(RunningCommandQueued, TelemetryUnclassified, RunningCommandIssued, &[IssueCommand]),
    on(RunningCommandQueued, TelemetryClassified, RunningCommandIssued, &[IssueCommand]),
    on(RunningCommandQueued, CommandRequested, RunningCommandQueued, &[QueueCommand]),
    on(RunningCommandQueued, StopProgram, CommandQueued, &[Halt]),
    on(RunningCommandQueued, ProgramEnded, CommandQueued, &[]),
    on(RunningCommandIssued, DeadlineElapsed, RunningCommandQueued, &[]),
    on(RunningCommandIssued, TelemetryClassified, RunningActive, &[Inject]),
    on(RunningCommandIssued, CommandRequested, RunningCommandQueued, &[QueueCommand]),
    on(RunningCommandIssued, StopProgram, CommandIssued, &[Halt]),
    on(RunningCommandIssued, ProgramEnded, CommandIssued, &[]),
    // program with a device command running
    on(RunningActive, TelemetryClassified, RunningActive, &[Inject]),
    on(RunningActive, CommandFinished, Running, &[Finish]),
    on(RunningActive, StopProgram, Connected, &[Halt]),
    on(RunningActive, Disconnect, DisconnectQueued, &[Halt]),
    on(RunningActive, CommandRequested, RunningActiveCommandQueued, &[QueueCommand]),
    on(RunningActive, ProgramEnded, Connected, &[]),
    on(RunningActiveCommandQueued, TelemetryUnclassified, RunningActiveCommandIssued, &[IssueCommand]),
    on(RunningActiveCommandQueued, TelemetryClassified, RunningActiveCommandIssued, &[IssueCommand]),
    on(RunningActiveCommandQueued, CommandRequested, RunningActiveCommandQueued, &[QueueCommand]),
    on(RunningActiveCommandQueued, StopProgram, CommandQueued, &[Halt]),
    on(RunningActiveCommandQueued, ProgramEnded, CommandQueued, &[]),
    on(RunningActiveCommandIssued, DeadlineElapsed, RunningActiveCommandQueued, &[]),
    on(RunningActiveCommandIssued, TelemetryClassified, RunningActive, &[Inject]),
    on(RunningActiveCommandIssued, CommandRequested, RunningActiveCommandQueued, &[QueueCommand]),
    on(RunningActiveCommandIssued, StopProgram, CommandIssued, &[Halt]),
    on(RunningActiveCommandIssued, ProgramEnded, CommandIssued, &[]),
    // disconnect handshake, a pending Stop goes out first
    on(DisconnectQueued, CommandRequested, DisconnectQueued, &[QueueCommand]),
    guarded(DisconnectQueued, TelemetryUnclassified, Guard::CommandPending, DisconnectQueued, &[IssueCommand]),
    guarded(DisconnectQueued, TelemetryClassified, Guard::CommandPending, DisconnectQueued, &[IssueCommand]),
    guarded(DisconnectQueued, TelemetryClassified, Guard::NothingPending, Disconnecting, &[SendDisconnect]),
    on(Disconnecting, TelemetryUnclassified, Disconnecting, &[SendDisconnect]),
    on(Disconnecting, TelemetryClassified, Disconnecting, &[SendDisconnect]),
    on(Disconnecting, DeadlineElapsed, Disconnected, &[]),
    // load only
    on(Disconnected, LoadProgram, ConnectingWhileLoadPending, &[StashProgram, SendConnect]),
    on(ConnectingWhileLoadPending, DeadlineElapsed, ConnectingWhileLoadPending, &[SendConnect]),
    on(ConnectingWhileLoadPending, TelemetryClassified, Disconnecting, &[Load, SendDisconnect]),
    on(ConnectingWhileLoadPending, TelemetryUnclassified, Disconnecting, &[Load, SendDisconnect]),
];

/// How long a state may last before its deadline row fires
pub fn timeout_for(state: State) -> Option<Duration> {
    let ms = match state {
        Initial => INIT_TIMEOUT_MS,
        Connecting | ConnectingWhileLoadPending => CONNECT_RETRY_MS,
        CommandIssued | RunningCommandIssued | RunningActiveCommandIssued => COMMAND_RETRY_MS,
        Disconnecting => DISCONNECT_TIMEOUT_MS,
        _ => return None,
    };
    Some(Duration::from_millis(ms))
}

/// Effects run whenever `state` is entered from another state
pub fn entry_effects(state: State) -> &'static [Effect] {
    match state {
        Disconnected => &[ResetDisplay],
        Connected => &[MarkConnected],
        CommandIssued | RunningCommandIssued | RunningActiveCommandIssued => &[PublishChanges],
        _ => &[],
    }
}

/// Current state plus the deadline of its timeout
#[derive(Debug)]
pub struct Fsm {
    state: State,
    deadline: Option<Instant>,
}

impl Fsm {
    pub fn new(now: Instant) -> Self {
        Self {
            state: Initial,
            deadline: timeout_for(Initial).map(|t| now + t),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_elapsed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|at| at <= now)
    }

    /// First row for `event` in the current state whose guard holds
    pub fn find(&self, event: EventKind, guard: impl Fn(Guard) -> bool) -> Option<&'static Transition> {
        TRANSITIONS
            .iter()
            .find(|t| t.from == self.state && t.event == event && guard(t.guard))
    }

    /// Take `transition` and return the effects to run, in order.
    ///
    /// Entry effects and a fresh deadline only come with a change of state,
    /// or with a deadline row that loops back to its own state.
    pub fn apply(&mut self, transition: &Transition, now: Instant) -> Vec<Effect> {
        let mut effects = transition.effects.to_vec();
        let changed = transition.to != self.state;
        if changed {
            debug!("fsm: {:?} -> {:?} on {:?}", self.state, transition.to, transition.event);
            effects.extend_from_slice(entry_effects(transition.to));
        }
        if changed || transition.event == DeadlineElapsed {
            self.deadline = timeout_for(transition.to).map(|t| now + t);
        }
        self.state = transition.to;
        effects
    }
}
