//! The control loop tying link, state machine and executor together.
//!
//! Everything that happens, host requests, decoded responses and executor
//! milestones alike, is pushed into one FIFO queue. Each [`Session::tick`]
//! polls the link for a frame, handles at most one queued event (or the
//! state's elapsed deadline) and lets the executor fire its own deadline.
//! All protocol state is owned by the session, hosts only hold a
//! [`SessionHandle`].

use crate::device::{Command, Device, DeviceRegistry, Telemetry};
use crate::executor::Executor;
use crate::fsm::{Effect, EventKind, Fsm, Guard, State};
use crate::host::{CommandSender, EventNotifier, ExecutorEvent, ReportSink};
use crate::transport::Link;
use crate::types::{names, ParameterStore};
use log::{debug, error, info};
use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

/// Input of the state machine, with its payload
#[derive(Debug, Clone)]
pub enum Event {
    Init,
    Connect,
    Disconnect,
    CommandRequested(Command),
    CommandFinished,
    TelemetryUnclassified(Telemetry),
    TelemetryClassified(Telemetry),
    /// Program document as JSON
    LoadProgram(String),
    RunProgram,
    StopProgram,
    ProgramEnded,
    DeadlineElapsed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Init => EventKind::Init,
            Event::Connect => EventKind::Connect,
            Event::Disconnect => EventKind::Disconnect,
            Event::CommandRequested(_) => EventKind::CommandRequested,
            Event::CommandFinished => EventKind::CommandFinished,
            Event::TelemetryUnclassified(_) => EventKind::TelemetryUnclassified,
            Event::TelemetryClassified(_) => EventKind::TelemetryClassified,
            Event::LoadProgram(_) => EventKind::LoadProgram,
            Event::RunProgram => EventKind::RunProgram,
            Event::StopProgram => EventKind::StopProgram,
            Event::ProgramEnded => EventKind::ProgramEnded,
            Event::DeadlineElapsed => EventKind::DeadlineElapsed,
        }
    }
}

/// Cloneable entry point into a session's event queue
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: Sender<Event>,
}

impl SessionHandle {
    /// Returns false once the session is gone
    pub fn send(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    /// The host side is ready
    pub fn init(&self) -> bool {
        self.send(Event::Init)
    }

    pub fn connect(&self) -> bool {
        self.send(Event::Connect)
    }

    pub fn disconnect(&self) -> bool {
        self.send(Event::Disconnect)
    }

    /// Queue `command` for the device
    pub fn request(&self, command: Command) -> bool {
        self.send(Event::CommandRequested(command))
    }

    pub fn load(&self, program: impl Into<String>) -> bool {
        self.send(Event::LoadProgram(program.into()))
    }

    pub fn run(&self) -> bool {
        self.send(Event::RunProgram)
    }

    pub fn stop(&self) -> bool {
        self.send(Event::StopProgram)
    }

    /// Map the `connection` property (on/off) to an event
    pub fn set_connection(&self, value: &str) -> bool {
        match value {
            "on" => self.connect(),
            "off" => self.disconnect(),
            _ => false,
        }
    }

    /// Map the `run` property (on/off) to an event
    pub fn set_run(&self, value: &str) -> bool {
        match value {
            "on" => self.run(),
            "off" => self.stop(),
            _ => false,
        }
    }
}

impl CommandSender for SessionHandle {
    fn send_command(&mut self, command: &Command) -> bool {
        self.request(command.clone())
    }
}

impl EventNotifier for SessionHandle {
    fn notify(&mut self, event: ExecutorEvent) {
        let event = match event {
            ExecutorEvent::CommandFinished => Event::CommandFinished,
            ExecutorEvent::ProgramEnded => Event::ProgramEnded,
        };
        self.send(event);
    }
}

pub struct Session<T> {
    link: Link<T>,
    fsm: Fsm,
    queue: Receiver<Event>,
    handle: SessionHandle,
    registry: DeviceRegistry,
    /// Schema of the last device heard from
    device: Device,
    store: ParameterStore,
    /// Command waiting for the next response frame
    next: Option<Command>,
    next_sent: bool,
    /// The executor asked for a Stop that has not reached the queue yet
    stop_outstanding: bool,
    /// Last command written, responses are classified against it
    active: Option<Command>,
    stashed_program: Option<String>,
    executor: Executor,
    reports: Box<dyn ReportSink + Send>,
}

impl<T: Read + Write> Session<T> {
    /// `controller` receives the device properties, `program` the program
    /// properties.
    pub fn new<C, P>(port: T, controller: C, program: P, now: Instant) -> Self
    where
        C: ReportSink + Send + 'static,
        P: ReportSink + Send + 'static,
    {
        let (events, queue) = mpsc::channel();
        let handle = SessionHandle { events };
        let executor = Executor::new(
            Box::new(handle.clone()),
            Box::new(program),
            Box::new(handle.clone()),
        );
        Self {
            link: Link::new(port),
            fsm: Fsm::new(now),
            queue,
            handle,
            registry: DeviceRegistry::default(),
            device: Device::Unknown,
            store: ParameterStore::new(),
            next: None,
            next_sent: false,
            stop_outstanding: false,
            active: None,
            stashed_program: None,
            executor,
            reports: Box::new(controller),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> State {
        self.fsm.state()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn link(&self) -> &Link<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link<T> {
        &mut self.link
    }

    /// One pass of the control loop
    pub fn tick(&mut self, now: Instant) {
        self.receive();
        match self.queue.try_recv() {
            Ok(event) => self.dispatch(event, now),
            Err(_) if self.fsm.deadline_elapsed(now) => {
                self.dispatch(Event::DeadlineElapsed, now)
            }
            Err(_) => {}
        }
        self.executor.tick(now);
    }

    fn publish(&mut self, key: &str, value: &str) {
        if !self.reports.report(key, value) {
            error!("cannot send property {} ({})", key, value);
        }
    }

    fn publish_value(&mut self, key: &str, name: &str) {
        let value = format!("{:.3}", self.store.value(name));
        self.publish(key, &value);
    }

    /// Decode the next frame, if any, and queue the matching event
    fn receive(&mut self) {
        let Some(frame) = self.link.poll() else {
            return;
        };
        let hex = frame.to_hex();
        debug!("received {}", hex);
        self.publish("raw_in", &hex);

        self.device = self.registry.lookup(frame.device_id());
        let telemetry = self.device.decode_response(&frame);
        let active = self.active.as_ref().map(Command::code);

        if telemetry.classify(active).valid {
            self.store.push(telemetry.parameters.clone());
            self.publish("mode", telemetry.mode_name());
            let response = telemetry.to_json().to_string();
            self.publish("response", &response);
            self.handle.send(Event::TelemetryClassified(telemetry));
        } else if self.device.confirms_connection(telemetry.mode) {
            self.handle.send(Event::TelemetryUnclassified(telemetry));
        }
    }

    fn guard(&self, guard: Guard) -> bool {
        let pending = self.next.is_some() && !self.next_sent;
        match guard {
            Guard::Always => true,
            Guard::CommandPending => pending,
            Guard::NothingPending => !pending && !self.stop_outstanding,
        }
    }

    fn dispatch(&mut self, event: Event, now: Instant) {
        let kind = event.kind();
        let Some(transition) = self.fsm.find(kind, |g| self.guard(g)) else {
            debug!("fsm: {:?} ignored in {:?}", kind, self.fsm.state());
            return;
        };
        for effect in self.fsm.apply(transition, now) {
            self.run_effect(effect, &event, now);
        }
    }

    fn transmit(&mut self, command: &Command) -> bool {
        let sent = self.link.send_command(command);
        if sent {
            self.publish("raw_out", &command.to_hex());
        }
        sent
    }

    fn run_effect(&mut self, effect: Effect, event: &Event, now: Instant) {
        match effect {
            Effect::Initialize => {
                self.publish("response", "{}");
                self.executor.publish_initial();
            }
            Effect::ResetDisplay => {
                self.publish("connection", "off");
                self.publish("mode", "");
                self.publish("model", "");
                self.publish("voltage", "0.0");
                self.publish("current", "0.0");
                self.publish("capacity", "0.0");
                self.active = None;
                self.next = None;
                self.stop_outstanding = false;
                self.store.clear();
            }
            Effect::MarkConnected => self.publish("connection", "on"),
            Effect::SendConnect => {
                let command = self.device.connect();
                self.transmit(&command);
            }
            Effect::SendDisconnect => {
                let command = self.device.disconnect();
                self.transmit(&command);
            }
            Effect::FirstTelemetry => {
                self.publish("model", self.device.model());
                self.publish_value("voltage", names::VOLTAGE_V);
                self.publish_value("current", names::CURRENT_A);
                self.publish_value("capacity", names::CAPACITY_AH);
            }
            Effect::PublishChanges => self.publish_changes(),
            Effect::QueueCommand => {
                if let Event::CommandRequested(command) = event {
                    self.next = Some(command.clone());
                    self.next_sent = false;
                    self.stop_outstanding = false;
                }
            }
            Effect::IssueCommand => {
                if let Some(command) = self.next.clone() {
                    self.transmit(&command);
                    debug!("command {} started", command.name());
                    self.active = Some(command);
                    self.next_sent = true;
                }
            }
            Effect::Inject => {
                self.publish_changes();
                if let Event::TelemetryClassified(telemetry) = event {
                    if self.executor.is_running() {
                        self.executor.inject(telemetry, now);
                    }
                }
            }
            Effect::Finish => {
                if let Some(command) = &self.active {
                    debug!("command {} finished", command.name());
                }
            }
            Effect::StashProgram => {
                if let Event::LoadProgram(json) = event {
                    self.stashed_program = Some(json.clone());
                }
            }
            Effect::Load => {
                let json = match event {
                    Event::LoadProgram(json) => Some(json.clone()),
                    _ => self.stashed_program.take(),
                };
                if let Some(json) = json {
                    // the executor already reported the rejection as state idle
                    if let Err(e) = self.executor.load(self.device, &json) {
                        debug!("program not loaded on {}: {}", self.device.model(), e);
                    }
                }
            }
            Effect::Run => {
                info!("running program on {}", self.device.model());
                self.executor.run(now);
            }
            Effect::Halt => {
                if self.executor.stop() {
                    self.stop_outstanding = true;
                }
            }
        }
    }

    fn publish_changes(&mut self) {
        for (key, name) in [
            ("voltage", names::VOLTAGE_V),
            ("current", names::CURRENT_A),
            ("capacity", names::CAPACITY_AH),
        ] {
            if self.store.has_changed(name) {
                self.publish_value(key, name);
            }
        }
    }
}
