//! Port abstraction for the bootloader serial link.
//!
//! The protocol layer never touches the `serialport` crate directly. It talks
//! to a [`Port`], which is opened through a [`PortOpener`] for the duration of
//! a single command or transfer and closed right after:
//!
//! ```text
//! +-------------------+   +-------------------+   +-------------------+
//! |  CommandChannel   |   |   YModemEngine    |   |  TransferBridge   |
//! +---------+---------+   +---------+---------+   +---------+---------+
//!           |                       |                       |
//!           +-----------------------+-----------------------+
//!                                   |
//!                                   v
//!                         +-------------------+
//!                         |    Port trait     |
//!                         +---------+---------+
//!                                   |
//!                                   v
//!                         +-------------------+
//!                         |    NativePort     |
//!                         |   (serialport)    |
//!                         +-------------------+
//! ```
//!
//! Opening and closing the device toggles DTR/RTS on most USB-serial
//! adapters, which resets some boards. Callers that open a fresh handle for a
//! transfer prime the bootloader with a newline first.
//!
//! ## Example
//!
//! ```rust,no_run
//! use uartfw::port::{Port, PortOpener, SerialConfig};
//! use std::time::Duration;
//!
//! fn example() -> uartfw::Result<()> {
//!     let config = SerialConfig::new("/dev/ttyUSB0", 115200);
//!     let mut port = config.open_port(Duration::from_secs(2))?;
//!     port.write_all_bytes(b"info\r\n")?;
//!     port.close()?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate the bootloader UART runs at.
pub const BOOTLOADER_BAUD: u32 = 115200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BOOTLOADER_BAUD,
            timeout: Duration::from_secs(3),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    ///
    /// Bare device names are resolved under `/dev/` on unix, so `ttyUSB0`
    /// and `/dev/ttyUSB0` name the same device.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: resolve_device_path(&port_name.into()),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Resolve a bare device name (`ttyUSB0`) to its `/dev` path on unix.
pub fn resolve_device_path(name: &str) -> String {
    if cfg!(unix) && !name.is_empty() && !name.contains('/') {
        format!("/dev/{name}")
    } else {
        name.to_string()
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// An open serial link to the bootloader.
///
/// The trait is object safe: the transfer agents and the bridge work on
/// `&mut dyn Port`, so the session keeps exclusive ownership of the handle
/// while borrowing it out for one transfer.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Discard pending input (reset_input_buffer).
    fn clear_input(&mut self) -> Result<()>;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Open a second handle on the same device.
    ///
    /// Used by the transfer bridge to read and write from separate threads.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Something that can open a fresh [`Port`] on demand.
///
/// The session reopens the device for every command and every transfer;
/// handles are never kept across calls.
pub trait PortOpener {
    /// Concrete port type produced by this opener.
    type Port: Port + 'static;

    /// Open the device with the given read timeout.
    fn open_port(&self, timeout: Duration) -> Result<Self::Port>;

    /// Device name used in log messages.
    fn device_name(&self) -> &str;
}

#[cfg(feature = "native")]
pub use native::{NativePort, list_ports};
