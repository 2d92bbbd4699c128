//! # uartfw
//!
//! A library for updating devices that run a small UART bootloader.
//!
//! The bootloader understands a handful of text commands (`getlist`, `info`,
//! `check`, `flash`, `write`, `read <file>`, `remove <file>`, `boot`, `hold`)
//! and moves files with YMODEM-1K. This crate provides:
//!
//! - A request/response command channel with quiet-period reply detection
//! - A YMODEM sender and receiver with a pluggable block check
//! - A bridge that runs lrzsz (`sb`/`rb`) against the serial link
//! - A [`Session`] tying it together: flash, write, read, remove, list, boot
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization of [`RemoteFile`] and [`PortInfo`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use uartfw::{InProcessAgent, SerialConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = SerialConfig::new("ttyUSB0", 115200);
//!     let mut session = Session::new(device, Box::new(InProcessAgent::default()))?;
//!
//!     let report = session.flash(Path::new("app_main.bin"))?;
//!     for line in report.lines() {
//!         println!(">>> {line}");
//!     }
//!
//!     if report.success() {
//!         session.boot()?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod bridge;
pub mod error;
pub mod firmware;
pub mod port;
pub mod protocol;
pub mod session;

// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, list_ports};
pub use {
    agent::{AgentCommand, AgentKind, ExternalAgent, InProcessAgent, TransferAgent, TransferReport},
    bridge::{BridgeConfig, BridgeReport, StrandExit, TransferBridge},
    error::{Error, Result},
    firmware::{PackageExtractor, transfer_timeout, validate_firmware_name},
    port::{Port, PortInfo, PortOpener, SerialConfig},
    protocol::{
        BlockCheck, ChannelConfig, CommandChannel, RemoteFile, Response, YmodemConfig, YmodemTransfer,
    },
    session::{Listing, Report, Session, SessionConfig},
};
