//! Monitor Example
//!
//! Connects to an EBC analyzer, prints every published property and,
//! if a program file is given, loads and runs it until it ends.
//!
//! Usage:
//!   cargo run --example monitor                              # Interactive port selection
//!   cargo run --example monitor -- /dev/ttyUSB0              # Specify port
//!   cargo run --example monitor -- /dev/ttyUSB0 program.json # Run a test program
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example monitor

use ebc_protocol::fsm::State;
use ebc_protocol::{transport, ReportSink, Result, Session};
use inquire::Select;
use log::info;
use std::time::{Duration, Instant};

/// Prints properties as they are published
struct Printer(&'static str);

impl ReportSink for Printer {
    fn report(&mut self, key: &str, value: &str) -> bool {
        info!("{}/{} = {}", self.0, key, value);
        true
    }
}

/// Interactive serial port selection using inquire
fn select_port() -> Result<String> {
    let ports = transport::list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let port_names: Vec<String> = ports
        .iter()
        .map(|p| format!("{} - {:?}", p.port_name, p.port_type))
        .collect();

    let selection = Select::new("Select a serial port:", port_names)
        .prompt()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Selection cancelled: {}", e),
            )
        })?;

    let port_name = selection
        .split(" - ")
        .next()
        .unwrap_or(&selection)
        .to_string();
    Ok(port_name)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let port_name = match args.next() {
        Some(name) => name,
        None => select_port()?,
    };
    let mut program = args.next().map(std::fs::read_to_string).transpose()?;

    info!("Connecting to EBC analyzer on {}...", port_name);
    let port = transport::open(&port_name)?;
    let mut session = Session::new(port, Printer("controller"), Printer("cpu"), Instant::now());
    let handle = session.handle();
    handle.init();
    handle.connect();

    // Without a program the monitor runs until interrupted
    let mut seen_running = false;
    let mut finished = false;
    loop {
        session.tick(Instant::now());

        let running = session.executor().is_running();
        seen_running |= running || session.state() == State::Running;
        match session.state() {
            State::Connected if program.is_some() => {
                if let Some(json) = program.take() {
                    handle.load(json);
                    handle.run();
                }
            }
            State::Connected if seen_running && !running && !finished => {
                info!("=== Program finished ===");
                handle.disconnect();
                finished = true;
            }
            State::Disconnected if finished => break,
            _ => {}
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
