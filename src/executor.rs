//! Program executor.
//!
//! Steps advance only from the outside: [`Executor::tick`] fires the pending
//! deadline (settle delay or wait step) and [`Executor::inject`] feeds the
//! telemetry classified for the running command step. Nothing here blocks.

use crate::constants::STEP_SETTLE_MS;
use crate::device::{Device, Telemetry};
use crate::error::Result;
use crate::host::{CommandSender, EventNotifier, ExecutorEvent, ReportSink};
use crate::program::{format_duration, Program, Step, StepDetail, StepRecord, StopCondition};
use crate::types::names;
use chrono::Utc;
use log::{debug, error, info};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Perform the current step
    Perform,
    /// The current wait step is over
    WaitElapsed,
}

pub struct Executor {
    name: String,
    steps: Vec<Step>,
    current: usize,
    running: bool,
    results: Vec<StepRecord>,
    deadline: Option<(Instant, Pending)>,
    device: Device,
    commands: Box<dyn CommandSender + Send>,
    reports: Box<dyn ReportSink + Send>,
    events: Box<dyn EventNotifier + Send>,
}

impl Executor {
    pub fn new(
        commands: Box<dyn CommandSender + Send>,
        reports: Box<dyn ReportSink + Send>,
        events: Box<dyn EventNotifier + Send>,
    ) -> Self {
        Self {
            name: String::new(),
            steps: Vec::new(),
            current: 0,
            running: false,
            results: Vec::new(),
            deadline: None,
            device: Device::Unknown,
            commands,
            reports,
            events,
        }
    }

    /// Publish the values of an empty, idle executor
    pub fn publish_initial(&mut self) {
        self.report("run", "off");
        self.report("state", "idle");
        self.report("program", "{}");
        self.report("result", "[]");
    }

    fn report(&mut self, key: &str, value: &str) -> bool {
        let sent = self.reports.report(key, value);
        if !sent {
            debug!("report of {} failed", key);
        }
        sent
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Index of the current step
    pub fn current_step(&self) -> usize {
        self.current
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn results(&self) -> &[StepRecord] {
        &self.results
    }

    /// Drop the program, stopping it first if it runs
    pub fn clear(&mut self) {
        if self.running {
            self.stop();
        }
        self.steps.clear();
        self.current = 0;
        self.results.clear();
        self.name.clear();
        self.report("state", "idle");
    }

    /// Replace the program with the one in `json`.
    ///
    /// On any error the executor is left empty.
    pub fn load(&mut self, device: Device, json: &str) -> Result<()> {
        self.clear();
        let program = match Program::parse(device, json) {
            Ok(program) => program,
            Err(e) => {
                error!("program rejected: {}", e);
                self.clear();
                return Err(e);
            }
        };
        self.name = program.name;
        self.steps = program.steps;
        self.device = device;

        if self.report("program", json) {
            self.report("state", "loaded");
            info!(
                "program \"{}\": has {} steps, controller is {}",
                self.name,
                self.steps.len(),
                device.model()
            );
        } else {
            debug!("program \"{}\": report failed", self.name);
        }
        Ok(())
    }

    pub fn run(&mut self, now: Instant) -> bool {
        self.results.clear();
        self.report("state", "running");
        self.report("run", "on");
        self.running = true;
        for step in &mut self.steps {
            reset(step);
        }
        self.start_step(0, now, Duration::ZERO);
        true
    }

    /// Stop the program and cancel its deadline.
    ///
    /// Returns true if a Stop command was requested for an active command step.
    pub fn stop(&mut self) -> bool {
        self.deadline = None;
        self.running = false;
        let mut stop_requested = false;
        let mut command_active = false;
        if let Some(Step::Command { active, .. }) = self.steps.get_mut(self.current) {
            command_active = std::mem::take(active);
        }
        if command_active {
            stop_requested = self.commands.send_command(&self.device.stop());
            self.report("state", "stopped");
        }
        self.report("run", "off");
        stop_requested
    }

    /// Fire the pending deadline if it has elapsed
    pub fn tick(&mut self, now: Instant) {
        let Some((at, pending)) = self.deadline else {
            return;
        };
        if now < at {
            return;
        }
        self.deadline = None;
        match pending {
            Pending::Perform => self.perform_step(now),
            Pending::WaitElapsed => {
                self.record_step(self.current);
                self.start_step(self.current + 1, now, settle_delay());
            }
        }
    }

    /// Feed telemetry that was classified for the running command.
    pub fn inject(&mut self, telemetry: &Telemetry, now: Instant) {
        let index = self.current;
        let reference = self.reference_capacity(index);
        let name = self.name.clone();

        let Some(Step::Command {
            command,
            stop,
            active,
            stop_issued,
            capacity,
        }) = self.steps.get_mut(index)
        else {
            return;
        };
        if !*active {
            return;
        }

        let class = telemetry.classify(Some(command.code()));
        if class.active {
            if let Some(value) = telemetry.value(names::CAPACITY_AH) {
                *capacity = value;
            }
        }

        if !*stop_issued && stop_condition_hit(stop, reference, telemetry) {
            debug!("program \"{}\": step {}: {} hit", name, index, stop);
            self.commands.send_command(&telemetry.device.stop());
            *stop_issued = true;
        }

        if class.finished || class.stopped {
            if class.stopped && !*stop_issued {
                debug!(
                    "program \"{}\": step {}: missed finished message for command {}",
                    name,
                    index,
                    command.name()
                );
            }
            *active = false;
            self.events.notify(ExecutorEvent::CommandFinished);
            self.record_step(index);
            self.start_step(index + 1, now, settle_delay());
        }
    }

    /// Capacity recorded by the nearest command step before `index`
    fn reference_capacity(&self, index: usize) -> f64 {
        self.steps[..index.min(self.steps.len())]
            .iter()
            .rev()
            .find_map(|s| match s {
                Step::Command { capacity, .. } => Some(*capacity),
                _ => None,
            })
            .unwrap_or(0.0)
    }

    fn start_step(&mut self, index: usize, now: Instant, delay: Duration) {
        self.current = index;
        if self.running {
            self.deadline = Some((now + delay, Pending::Perform));
        }
    }

    fn perform_step(&mut self, now: Instant) {
        let index = self.current;
        if index >= self.steps.len() {
            info!("program \"{}\": end", self.name);
            self.report("step", "");
            self.report("run", "off");
            self.report("state", "end");
            self.running = false;
            self.events.notify(ExecutorEvent::ProgramEnded);
            return;
        }
        self.report("step", &index.to_string());

        match &mut self.steps[index] {
            Step::Wait { seconds } => {
                let seconds = *seconds;
                info!(
                    "program \"{}\": perform step {}: Wait {}",
                    self.name,
                    index,
                    format_duration(seconds)
                );
                self.deadline = Some((
                    now + Duration::from_secs(seconds as u64),
                    Pending::WaitElapsed,
                ));
            }
            Step::Cycle {
                target,
                count,
                completed,
            } => {
                if *completed == *count {
                    *completed = 0;
                    info!(
                        "program \"{}\": perform step {}: Cycle elapsed",
                        self.name, index
                    );
                    self.record_step(index);
                    self.start_step(index + 1, now, settle_delay());
                } else {
                    *completed += 1;
                    let target = *target;
                    info!(
                        "program \"{}\": perform step {}: Cycle to step {} ({}/{})",
                        self.name, index, target, completed, count
                    );
                    self.record_step(index);
                    self.start_step(target, now, settle_delay());
                }
            }
            Step::Command {
                command,
                active,
                stop_issued,
                ..
            } => {
                info!(
                    "program \"{}\": perform step {}: Command {}",
                    self.name,
                    index,
                    command.name()
                );
                *active = true;
                *stop_issued = false;
                let command = command.clone();
                if !self.commands.send_command(&command) {
                    error!(
                        "program \"{}\": step {}: failed to send command",
                        self.name, index
                    );
                    self.stop();
                }
            }
        }
    }

    /// Append the record of a completed step and publish the whole list
    fn record_step(&mut self, index: usize) {
        let Some(step) = self.steps.get(index) else {
            return;
        };
        let detail = match step {
            Step::Wait { seconds } => StepDetail::Wait {
                duration: format_duration(*seconds),
            },
            Step::Cycle {
                target,
                count,
                completed,
            } => StepDetail::Cycle {
                cycle_step: *target,
                // an elapsed cycle has already been reset
                num: if *completed == 0 { *count } else { *completed },
                count: *count,
            },
            Step::Command { capacity, .. } => StepDetail::Command {
                capacity_ah: *capacity,
            },
        };
        self.results.push(StepRecord {
            step: index,
            command: step.name().to_string(),
            detail,
            finished_at: Utc::now(),
        });
        match serde_json::to_string(&self.results) {
            Ok(json) => {
                self.report("result", &json);
            }
            Err(e) => error!("cannot serialize step results: {}", e),
        }
    }
}

fn settle_delay() -> Duration {
    Duration::from_millis(STEP_SETTLE_MS)
}

fn reset(step: &mut Step) {
    match step {
        Step::Wait { .. } => {}
        Step::Cycle { completed, .. } => *completed = 0,
        Step::Command {
            active,
            stop_issued,
            capacity,
            ..
        } => {
            *active = false;
            *stop_issued = false;
            *capacity = 0.0;
        }
    }
}

fn stop_condition_hit(stop: &StopCondition, reference: f64, telemetry: &Telemetry) -> bool {
    let Some(observed) = stop.parameter().and_then(|p| telemetry.value(p)) else {
        return false;
    };
    match stop {
        StopCondition::None => false,
        StopCondition::Absolute { threshold, .. } => *threshold <= observed,
        StopCondition::Percent { percent, .. } => reference * percent / 100.0 <= observed,
    }
}
