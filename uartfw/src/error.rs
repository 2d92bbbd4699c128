//! Error types for uartfw.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for uartfw operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uartfw operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, pipes, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial device path does not exist.
    #[error("Device \"{0}\" does not exist")]
    DeviceNotFound(String),

    /// The external transfer agent is not installed.
    #[error("Transfer agent `{0}` not found in PATH (install lrzsz)")]
    AgentUnavailable(String),

    /// The bootloader did not answer a command in time.
    #[error("Timeout: no reply to `{0}`")]
    CommandTimeout(String),

    /// A protocol peer stayed silent.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The bootloader kept rejecting a command.
    #[error("Bootloader does not recognize `{0}`")]
    UnrecognizedCommand(String),

    /// Firmware file name does not follow the `app*.bin` convention.
    #[error("\"{0}\" is not a valid binary name, needs to be \"app_*.bin\"")]
    InvalidBinaryName(String),

    /// Local file to transfer is missing.
    #[error("No file found at {}", .0.display())]
    FileNotFound(PathBuf),

    /// Requested file is not in the device file system.
    #[error("File \"{0}\" not in device file system")]
    RemoteFileNotFound(String),

    /// Transfer cancelled by the receiver or retry budget exhausted.
    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    /// YMODEM protocol violation.
    #[error("YMODEM error: {0}")]
    Ymodem(String),

    /// Firmware package could not be unpacked.
    #[error("Package error: {0}")]
    Package(String),

    /// External transfer agent failed.
    #[error("Transfer agent error: {0}")]
    Agent(String),
}
