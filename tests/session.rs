//! End-to-end tests of the control loop against an in-memory analyzer link.

use ebc_protocol::constants::*;
use ebc_protocol::frame::{to_hex, ResponseFrame};
use ebc_protocol::fsm::State;
use ebc_protocol::{Device, ReportSink, Reports, Session, SessionHandle};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CONNECT: &str = "fa0500000000000005f8";
const DISCONNECT: &str = "fa0600000000000006f8";
const STOP: &str = "fa0200000000000002f8";
const CHARGE: &str = "fa21006401b4000a0af8";
const DISCHARGE: &str = "fa010064010a00006ef8";

#[derive(Default)]
struct Wire {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

/// Serial port stand-in; reads time out when nothing is buffered
#[derive(Clone, Default)]
struct MockPort(Arc<Mutex<Wire>>);

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.lock().unwrap();
        if wire.rx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(wire.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = wire.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Reports>>);

impl ReportSink for Shared {
    fn report(&mut self, key: &str, value: &str) -> bool {
        self.0.lock().unwrap().report(key, value)
    }
}

impl Shared {
    fn get(&self, key: &str) -> String {
        self.0
            .lock()
            .unwrap()
            .get(key)
            .map(str::to_string)
            .unwrap_or_default()
    }
}

struct Bench {
    session: Session<MockPort>,
    handle: SessionHandle,
    port: MockPort,
    controller: Shared,
    program: Shared,
    now: Instant,
}

impl Bench {
    fn new() -> Self {
        let port = MockPort::default();
        let controller = Shared::default();
        let program = Shared::default();
        let now = Instant::now();
        let session = Session::new(port.clone(), controller.clone(), program.clone(), now);
        let handle = session.handle();
        Self {
            session,
            handle,
            port,
            controller,
            program,
            now,
        }
    }

    /// Run a few ticks without advancing time to drain the event queue
    fn settle(&mut self) {
        for _ in 0..4 {
            self.session.tick(self.now);
        }
    }

    fn advance(&mut self, ms: u64) {
        self.now += Duration::from_millis(ms);
        self.settle();
    }

    /// Deliver one response frame from the analyzer
    fn respond(&mut self, mode: u8, capacity_raw: u16) {
        self.respond_from(DEVICE_ID_EBC_A20, mode, capacity_raw);
    }

    fn respond_from(&mut self, id: u8, mode: u8, capacity_raw: u16) {
        let frame = ResponseFrame::new(mode, [0x0064, 0x1096, capacity_raw, 0, 0x0064, 0x010a, 0], id);
        self.port.0.lock().unwrap().rx.extend(frame.as_bytes());
        self.settle();
    }

    /// Frames written since the last call, as hex
    fn sent(&mut self) -> Vec<String> {
        let bytes = std::mem::take(&mut self.port.0.lock().unwrap().tx);
        bytes.chunks(COMMAND_FRAME_LEN).map(to_hex).collect()
    }

    fn connected() -> Self {
        let mut bench = Bench::new();
        bench.handle.init();
        bench.handle.connect();
        bench.settle();
        bench.respond(MODE_D_CC_STOPPED, 0);
        assert_eq!(bench.session.state(), State::Connected);
        bench.sent();
        bench
    }
}

fn program(steps: &str) -> String {
    format!(r#"{{"name": "bench", "steps": [{}]}}"#, steps)
}

#[test]
fn test_initial_state_times_out() {
    let mut bench = Bench::new();
    bench.advance(4_999);
    assert_eq!(bench.session.state(), State::Initial);
    bench.advance(1);
    assert_eq!(bench.session.state(), State::Disconnected);
    assert_eq!(bench.controller.get("response"), "{}");
    assert_eq!(bench.controller.get("connection"), "off");
    assert_eq!(bench.program.get("state"), "idle");
    assert_eq!(bench.program.get("result"), "[]");
}

#[test]
fn test_connect_handshake_retries() {
    let mut bench = Bench::new();
    bench.handle.init();
    bench.handle.connect();
    bench.settle();
    assert_eq!(bench.session.state(), State::Connecting);
    assert_eq!(bench.sent(), vec![CONNECT]);

    bench.advance(2_999);
    assert!(bench.sent().is_empty());
    bench.advance(1);
    assert_eq!(bench.sent(), vec![CONNECT]);

    bench.respond(MODE_C_CV_STOPPED, 0);
    assert_eq!(bench.session.state(), State::Connected);
    assert_eq!(bench.controller.get("connection"), "on");
    assert_eq!(bench.controller.get("model"), "EBC-A20");
    assert_eq!(bench.controller.get("voltage"), "3.990");
    assert_eq!(bench.controller.get("mode"), "C-CV (stopped)");
    assert!(bench.controller.get("raw_in").starts_with("fa02"));
    assert_eq!(bench.controller.get("raw_out"), CONNECT);
}

#[test]
fn test_commands_wait_for_the_next_frame() {
    let mut bench = Bench::connected();
    let charge = Device::EbcA20
        .command_from_json(
            serde_json::json!({
                "command": "C-CV",
                "parameters": {"currentA": 1.0, "voltageV": 4.2, "cutoffA": 0.1}
            })
            .as_object()
            .unwrap(),
        )
        .unwrap();
    bench.handle.request(charge);
    bench.advance(1_000);
    assert_eq!(bench.session.state(), State::CommandQueued);
    assert!(bench.sent().is_empty());

    bench.respond(MODE_C_CV_STOPPED, 0);
    assert_eq!(bench.session.state(), State::CommandIssued);
    assert_eq!(bench.sent(), vec![CHARGE]);

    // no answer: requeue without writing, then retry on the next frame
    bench.advance(3_000);
    assert_eq!(bench.session.state(), State::CommandQueued);
    assert!(bench.sent().is_empty());
    bench.respond(MODE_D_CC_STOPPED, 0);
    assert_eq!(bench.sent(), vec![CHARGE]);

    bench.respond(MODE_C_CV_ACTIVE, 0);
    assert_eq!(bench.session.state(), State::Connected);
    assert_eq!(bench.controller.get("mode"), "C-CV (active)");
}

#[test]
fn test_program_with_percent_stop_condition() {
    let mut bench = Bench::connected();
    let discharge = r#"{"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5}}"#;
    let limited = r#"{"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5},
                      "stopCondition": {"capacityAh": "50%"}}"#;
    bench
        .handle
        .load(program(&format!("{},{}", discharge, limited)));
    bench.settle();
    assert_eq!(bench.program.get("state"), "loaded");

    bench.handle.run();
    bench.settle();
    assert_eq!(bench.session.state(), State::RunningCommandQueued);
    assert!(bench.sent().is_empty());

    bench.respond(MODE_D_CC_STOPPED, 0);
    assert_eq!(bench.sent(), vec![DISCHARGE]);
    // 0x0850 = 2.0 Ah
    bench.respond(MODE_D_CC_ACTIVE, 0x0850);
    assert_eq!(bench.session.state(), State::RunningActive);
    assert_eq!(bench.controller.get("capacity"), "2.000");
    bench.respond(MODE_D_CC_FINISHED, 0x0850);
    assert_eq!(bench.session.state(), State::Running);
    assert!(bench.program.get("result").contains(r#""capacityAh":2.0"#));

    bench.advance(STEP_SETTLE_MS);
    assert_eq!(bench.program.get("step"), "1");
    bench.respond(MODE_D_CC_FINISHED, 0x0850);
    assert_eq!(bench.sent(), vec![DISCHARGE]);

    // 0x0427 = 0.999 Ah, 0x0428 = 1.0 Ah
    bench.respond(MODE_D_CC_ACTIVE, 0x0427);
    assert!(bench.sent().is_empty());
    bench.respond(MODE_D_CC_ACTIVE, 0x0428);
    assert_eq!(bench.session.state(), State::RunningActiveCommandQueued);
    bench.respond(MODE_D_CC_ACTIVE, 0x0429);
    assert_eq!(bench.sent(), vec![STOP]);

    bench.respond(MODE_D_CC_STOPPED, 0x0429);
    assert_eq!(bench.session.state(), State::Running);

    bench.advance(STEP_SETTLE_MS);
    assert_eq!(bench.session.state(), State::Connected);
    assert_eq!(bench.program.get("state"), "end");
    assert_eq!(bench.program.get("run"), "off");
    assert_eq!(bench.session.executor().results().len(), 2);
    assert!(bench.sent().is_empty());
}

#[test]
fn test_disconnect_stops_running_command_first() {
    let mut bench = Bench::connected();
    let discharge = r#"{"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5}}"#;
    bench.handle.load(program(discharge));
    bench.handle.run();
    bench.settle();
    bench.respond(MODE_D_CC_STOPPED, 0);
    bench.respond(MODE_D_CC_ACTIVE, 0x0100);
    assert_eq!(bench.session.state(), State::RunningActive);
    assert_eq!(bench.sent(), vec![DISCHARGE]);

    bench.handle.disconnect();
    bench.settle();
    assert_eq!(bench.session.state(), State::DisconnectQueued);
    assert_eq!(bench.program.get("state"), "stopped");
    assert!(bench.sent().is_empty());

    bench.respond(MODE_D_CC_ACTIVE, 0x0101);
    assert_eq!(bench.sent(), vec![STOP]);
    assert_eq!(bench.session.state(), State::DisconnectQueued);

    bench.respond(MODE_D_CC_STOPPED, 0x0101);
    assert_eq!(bench.session.state(), State::Disconnecting);
    assert_eq!(bench.sent(), vec![DISCONNECT]);

    // repeated on every frame until the fixed timeout
    bench.advance(1_000);
    bench.respond(MODE_D_CC_STOPPED, 0x0101);
    assert_eq!(bench.sent(), vec![DISCONNECT]);
    bench.advance(2_000);
    assert_eq!(bench.session.state(), State::Disconnected);
    assert_eq!(bench.controller.get("connection"), "off");
    assert_eq!(bench.controller.get("voltage"), "0.0");
    assert_eq!(bench.controller.get("model"), "");
}

#[test]
fn test_disconnecting_answers_unclassified_frames() {
    let mut bench = Bench::connected();
    let discharge = r#"{"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5}}"#;
    bench.handle.load(program(discharge));
    bench.handle.run();
    bench.settle();
    bench.respond(MODE_D_CC_STOPPED, 0);
    bench.respond(MODE_D_CC_ACTIVE, 0x0100);
    bench.sent();

    bench.handle.disconnect();
    bench.settle();
    bench.respond(MODE_D_CC_ACTIVE, 0x0101);
    assert_eq!(bench.sent(), vec![STOP]);
    bench.respond(MODE_D_CC_STOPPED, 0x0101);
    assert_eq!(bench.session.state(), State::Disconnecting);
    assert_eq!(bench.sent(), vec![DISCONNECT]);

    // an active mode is not a valid answer to Stop, but the device is still there
    bench.respond(MODE_D_CC_ACTIVE, 0x0101);
    assert_eq!(bench.session.state(), State::Disconnecting);
    assert_eq!(bench.sent(), vec![DISCONNECT]);
    assert_eq!(bench.controller.get("mode"), "D-CC (stopped)");

    bench.advance(3_000);
    assert_eq!(bench.session.state(), State::Disconnected);
}

#[test]
fn test_running_program_retries_unanswered_commands() {
    let mut bench = Bench::connected();
    let limited = r#"{"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5},
                      "stopCondition": {"capacityAh": 1.5}}"#;
    bench.handle.load(program(limited));
    bench.handle.run();
    bench.settle();
    assert_eq!(bench.session.state(), State::RunningCommandQueued);

    bench.respond(MODE_D_CC_STOPPED, 0);
    assert_eq!(bench.session.state(), State::RunningCommandIssued);
    assert_eq!(bench.sent(), vec![DISCHARGE]);
    bench.advance(3_000);
    assert_eq!(bench.session.state(), State::RunningCommandQueued);
    assert!(bench.sent().is_empty());
    bench.respond(MODE_D_CC_STOPPED, 0);
    assert_eq!(bench.session.state(), State::RunningCommandIssued);
    assert_eq!(bench.sent(), vec![DISCHARGE]);

    bench.respond(MODE_D_CC_ACTIVE, 0x0100);
    assert_eq!(bench.session.state(), State::RunningActive);
    // 0x0850 = 2.0 Ah, past the limit
    bench.respond(MODE_D_CC_ACTIVE, 0x0850);
    assert_eq!(bench.session.state(), State::RunningActiveCommandQueued);
    bench.respond(MODE_D_CC_ACTIVE, 0x0851);
    assert_eq!(bench.session.state(), State::RunningActiveCommandIssued);
    assert_eq!(bench.sent(), vec![STOP]);

    bench.advance(3_000);
    assert_eq!(bench.session.state(), State::RunningActiveCommandQueued);
    assert!(bench.sent().is_empty());
    bench.respond(MODE_D_CC_ACTIVE, 0x0852);
    assert_eq!(bench.session.state(), State::RunningActiveCommandIssued);
    assert_eq!(bench.sent(), vec![STOP]);

    bench.respond(MODE_D_CC_STOPPED, 0x0852);
    assert_eq!(bench.session.state(), State::Running);
    bench.advance(STEP_SETTLE_MS);
    assert_eq!(bench.session.state(), State::Connected);
    assert_eq!(bench.program.get("state"), "end");
    assert!(bench.sent().is_empty());
}

#[test]
fn test_load_while_disconnected() {
    let mut bench = Bench::new();
    bench.handle.init();
    bench.settle();
    bench.handle.load(program(r#"{"command": "Wait", "minutes": 2}"#));
    bench.settle();
    assert_eq!(bench.session.state(), State::ConnectingWhileLoadPending);
    assert_eq!(bench.sent(), vec![CONNECT]);

    bench.respond(MODE_D_CP_STOPPED, 0);
    assert_eq!(bench.session.state(), State::Disconnecting);
    assert_eq!(bench.sent(), vec![DISCONNECT]);
    assert_eq!(bench.program.get("state"), "loaded");
    assert_eq!(bench.session.executor().steps().len(), 1);

    bench.advance(3_000);
    assert_eq!(bench.session.state(), State::Disconnected);
}

#[test]
fn test_unknown_device_falls_back() {
    let mut bench = Bench::new();
    bench.handle.init();
    bench.handle.connect();
    bench.settle();
    bench.respond_from(0x42, MODE_D_CC_STOPPED, 0);
    assert_eq!(bench.session.state(), State::Connected);
    assert_eq!(bench.session.device(), Device::Unknown);
    assert_eq!(bench.controller.get("model"), "EBC-???");

    let discharge = r#"{"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5}}"#;
    bench.handle.load(program(discharge));
    bench.settle();
    assert_eq!(bench.program.get("state"), "idle");
    assert!(bench.session.executor().steps().is_empty());
}

#[test]
fn test_noise_and_bad_checksums_are_dropped() {
    let mut bench = Bench::new();
    bench.handle.init();
    bench.handle.connect();
    bench.settle();

    let mut frame = ResponseFrame::new(MODE_D_CC_STOPPED, [0; 7], DEVICE_ID_EBC_A20)
        .as_bytes()
        .to_vec();
    frame[3] ^= 0x01;
    {
        let mut wire = bench.port.0.lock().unwrap();
        wire.rx.extend([0x00, 0x13, 0x37]);
        wire.rx.extend(&frame);
    }
    bench.settle();
    assert_eq!(bench.session.state(), State::Connecting);
    assert!(bench.session.link().verifies_checksums());
}
