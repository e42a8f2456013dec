//! # EBC Protocol Library
//!
//! A Rust library for driving ZKETECH EBC battery analyzers (EBC-A20) over
//! their half-duplex serial link. It decodes the analyzer's binary telemetry
//! frames and runs automated multi-step test programs such as "charge, rest
//! 5 minutes, discharge at 1 A down to 2.5 V, repeat 3 times".
//!
//! ## Features
//!
//! - Encode commands and decode response frames, including the analyzer's
//!   base-240 value packing and checksum quirks
//! - Connect/disconnect handshakes with timed retries
//! - Queue commands so they never collide with incoming telemetry
//! - Execute wait, cycle and command steps with capacity based stop conditions
//!
//! ## Example
//!
//! ```no_run
//! use ebc_protocol::{transport, Reports, Session};
//! use std::time::{Duration, Instant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = transport::open("/dev/ttyUSB0")?;
//!     let mut session = Session::new(port, Reports::default(), Reports::default(), Instant::now());
//!     let handle = session.handle();
//!     handle.init();
//!     handle.connect();
//!     loop {
//!         session.tick(Instant::now());
//!         std::thread::sleep(Duration::from_millis(10));
//!     }
//! }
//! ```

pub mod codec;
pub mod constants;
pub mod device;
pub mod error;
pub mod executor;
pub mod frame;
pub mod fsm;
pub mod host;
pub mod program;
pub mod session;
pub mod transport;
pub mod types;

pub use device::{Command, Device, DeviceRegistry, Telemetry};
pub use error::{EbcError, Result};
pub use executor::Executor;
pub use host::{CommandSender, EventNotifier, ExecutorEvent, ReportSink, Reports};
pub use program::{Program, Step, StopCondition};
pub use session::{Event, Session, SessionHandle};
pub use types::*;
