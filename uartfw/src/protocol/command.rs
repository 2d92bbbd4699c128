//! Line-oriented text command channel.
//!
//! The bootloader reads commands one character at a time from a slow UART
//! and answers with free-form text of unknown length. A command is sent byte
//! by byte with a short pause between bytes, terminated with CRLF; the reply
//! is considered complete once the line has been quiet for
//! [`QUIET_INTERVAL`].
//!
//! ```text
//! host                                   bootloader
//!  | -- 'g' .. 'e' .. 't' .. ... \r\n -->  |
//!  |                                       |
//!  | <------ "app_main.bin, size: 4096" -- |
//!  | <------ "config.dat, size: 12"     -- |
//!  |          (50 ms without new bytes)    |
//! ```

use crate::error::{Error, Result};
use crate::port::{Port, PortOpener};
use crate::protocol::retry::{Attempt, retry_bounded};
use log::{debug, trace, warn};
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

/// Marker the bootloader prints when it did not understand a command.
pub const UNKNOWN_COMMAND: &str = "Unknown command";

/// Default time to wait for the first reply byte.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between command bytes; protects the bootloader UART from overrun.
pub const INTER_BYTE_DELAY: Duration = Duration::from_millis(2);

/// A reply is complete after this long without new bytes.
pub const QUIET_INTERVAL: Duration = Duration::from_millis(50);

/// Sleep between polls while waiting for the first reply byte.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on [`CommandChannel::send_with_retry`] attempts.
pub const MAX_COMMAND_ATTEMPTS: u32 = 5;

/// Timing parameters of the command channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Time to wait for the first reply byte.
    pub timeout: Duration,
    /// Pause after every transmitted command byte.
    pub inter_byte_delay: Duration,
    /// Silence that ends a reply.
    pub quiet_interval: Duration,
    /// Attempts made by `send_with_retry`.
    pub max_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            inter_byte_delay: INTER_BYTE_DELAY,
            quiet_interval: QUIET_INTERVAL,
            max_attempts: MAX_COMMAND_ATTEMPTS,
        }
    }
}

/// Reply to a bootloader command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    command: String,
    bytes: Vec<u8>,
    timed_out: bool,
}

impl Response {
    /// Wrap raw reply bytes.
    pub fn new(command: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            bytes,
            timed_out: false,
        }
    }

    /// An empty reply recorded for a command that timed out.
    pub fn timeout(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            bytes: Vec::new(),
            timed_out: true,
        }
    }

    /// Command this reply answers.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Raw reply bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the reply and return its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Whether the command went unanswered.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// False when the bootloader answered "Unknown command".
    pub fn recognized(&self) -> bool {
        !contains(&self.bytes, UNKNOWN_COMMAND.as_bytes())
    }

    /// Whether the reply contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        contains(&self.bytes, needle.as_bytes())
    }

    /// Reply decoded as text; invalid UTF-8 is replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Reply split into lines.
    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }

    /// True when nothing was received.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Request/response channel to the bootloader.
///
/// Every call opens the link, exchanges one command and closes the link
/// again. The channel owns the [`PortOpener`]; transfers borrow it through
/// [`CommandChannel::opener`].
pub struct CommandChannel<O: PortOpener> {
    opener: O,
    config: ChannelConfig,
}

impl<O: PortOpener> CommandChannel<O> {
    /// Create a channel with default timing.
    pub fn new(opener: O) -> Self {
        Self::with_config(opener, ChannelConfig::default())
    }

    /// Create a channel with custom timing.
    pub fn with_config(opener: O, config: ChannelConfig) -> Self {
        Self { opener, config }
    }

    /// The opener used to reach the device.
    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Timing parameters.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Send `cmd` and collect the reply.
    ///
    /// Fails with [`Error::CommandTimeout`] if no byte arrives within
    /// `timeout`. The link is closed on every path.
    pub fn send(&self, cmd: &str, timeout: Duration) -> Result<Vec<u8>> {
        let mut port = self.opener.open_port(timeout)?;
        let result = self.exchange(&mut port, cmd, timeout);
        let closed = port.close();
        let reply = result?;
        closed?;
        Ok(reply)
    }

    /// Send `cmd`, repeating while the bootloader answers "Unknown command".
    ///
    /// The bootloader sometimes drops the first character of a command when
    /// woken from idle. At most `max_attempts` sends are made; the last reply
    /// is returned whatever it contains.
    pub fn send_with_retry(&self, cmd: &str) -> Result<Response> {
        let max_attempts = self.config.max_attempts;
        retry_bounded(max_attempts, |attempt| {
            match self.send(cmd, self.config.timeout) {
                Ok(bytes) => {
                    let response = Response::new(cmd, bytes);
                    if response.recognized() {
                        Attempt::Done(response)
                    } else {
                        warn!("`{cmd}` not recognized (attempt {attempt}/{max_attempts})");
                        Attempt::Retry(response)
                    }
                },
                Err(e) => Attempt::Fatal(e),
            }
        })
    }

    fn exchange(&self, port: &mut O::Port, cmd: &str, timeout: Duration) -> Result<Vec<u8>> {
        port.clear_input()?;

        debug!("> {}", cmd.escape_debug());
        for byte in cmd.bytes() {
            port.write_all_bytes(&[byte])?;
            thread::sleep(self.config.inter_byte_delay);
        }
        port.write_all_bytes(b"\r\n")?;

        let start = Instant::now();
        while port.bytes_to_read()? == 0 {
            if start.elapsed() > timeout {
                return Err(Error::CommandTimeout(cmd.escape_debug().to_string()));
            }
            thread::sleep(POLL_INTERVAL);
        }

        let mut reply = Vec::new();
        loop {
            let pending = port.bytes_to_read()?;
            if pending == 0 {
                break;
            }
            let mut buf = vec![0u8; pending];
            match port.read(&mut buf) {
                Ok(n) => reply.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                Err(e) => return Err(Error::Io(e)),
            }
            thread::sleep(self.config.quiet_interval);
        }
        trace!("< {} bytes", reply.len());

        port.clear_input()?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockDevice;

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            timeout: Duration::from_millis(100),
            inter_byte_delay: Duration::ZERO,
            quiet_interval: Duration::from_millis(5),
            max_attempts: MAX_COMMAND_ATTEMPTS,
        }
    }

    #[test]
    fn test_send_writes_command_then_crlf() {
        let device = MockDevice::with_replies(vec!["ok\r\n"]);
        let channel = CommandChannel::with_config(device.clone(), fast_config());

        let reply = channel.send("info", Duration::from_millis(100)).unwrap();

        assert_eq!(reply, b"ok\r\n");
        assert_eq!(device.tx(), b"info\r\n");
        assert_eq!(device.opens(), 1);
        assert_eq!(device.closes(), 1);
    }

    #[test]
    fn test_send_times_out_within_bound() {
        let device = MockDevice::new();
        let config = fast_config();
        let channel = CommandChannel::with_config(device.clone(), config.clone());

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let result = channel.send("info", timeout);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::CommandTimeout(ref c)) if c == "info"));
        assert!(elapsed >= timeout);
        // Generous margin for scheduler jitter on loaded CI machines.
        assert!(elapsed < timeout + config.quiet_interval + Duration::from_millis(200));
        assert_eq!(device.closes(), 1, "link must be closed after a timeout");
    }

    #[test]
    fn test_send_collects_reply_arriving_in_chunks() {
        let device = MockDevice::new();
        let feeder = device.clone();
        device.on_line(move |_| {
            let feeder = feeder.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                feeder.push_rx(b"second part");
            });
            Some(b"first part, ".to_vec())
        });
        let config = ChannelConfig {
            quiet_interval: Duration::from_millis(30),
            ..fast_config()
        };
        let channel = CommandChannel::with_config(device, config);

        let reply = channel.send("getlist", Duration::from_millis(100)).unwrap();
        assert_eq!(reply, b"first part, second part");
    }

    #[test]
    fn test_send_with_retry_stops_on_recognized_reply() {
        let device =
            MockDevice::with_replies(vec!["Unknown command\r\n", "Unknown command\r\n", "done\r\n"]);
        let channel = CommandChannel::with_config(device.clone(), fast_config());

        let response = channel.send_with_retry("check").unwrap();

        assert!(response.recognized());
        assert_eq!(response.text(), "done\r\n");
        assert_eq!(device.lines().len(), 3);
    }

    #[test]
    fn test_send_with_retry_gives_up_after_five_attempts() {
        let device = MockDevice::new();
        device.on_line(|_| Some(b"Unknown command\r\n".to_vec()));
        let channel = CommandChannel::with_config(device.clone(), fast_config());

        let response = channel.send_with_retry("hold").unwrap();

        assert!(!response.recognized());
        assert_eq!(device.lines().len(), 5);
    }

    #[test]
    fn test_send_with_retry_single_send_when_first_reply_ok() {
        let device = MockDevice::with_replies(vec!["Flash: 12 files\r\n"]);
        let channel = CommandChannel::with_config(device.clone(), fast_config());

        channel.send_with_retry("info").unwrap();
        assert_eq!(device.lines(), vec!["info".to_string()]);
    }

    #[test]
    fn test_send_with_retry_propagates_timeout() {
        let device = MockDevice::new();
        let channel = CommandChannel::with_config(device.clone(), fast_config());

        let result = channel.send_with_retry("info");
        assert!(matches!(result, Err(Error::CommandTimeout(_))));
        assert_eq!(device.opens(), 1);
    }

    #[test]
    fn test_response_lines() {
        let response = Response::new("getlist", b"a.bin, size: 1\r\nb.bin, size: 2\r\n".to_vec());
        assert_eq!(response.lines(), vec!["a.bin, size: 1", "b.bin, size: 2"]);
        assert!(response.recognized());
        assert!(!response.timed_out());
        assert!(Response::timeout("getlist").timed_out());
    }
}
