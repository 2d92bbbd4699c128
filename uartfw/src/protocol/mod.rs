//! Wire protocols spoken by the bootloader.
//!
//! - [`command`]: CRLF-terminated text commands with quiet-period replies
//! - [`ymodem`]: YMODEM-1K file transfer
//! - [`listing`]: `getlist` reply parser

pub mod command;
pub mod crc;
pub mod listing;
pub mod retry;
pub mod ymodem;

pub use command::{ChannelConfig, CommandChannel, Response};
pub use listing::RemoteFile;
pub use ymodem::{BlockCheck, Packet, Phase, TransferState, YmodemConfig, YmodemTransfer};
