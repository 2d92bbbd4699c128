//! YMODEM-1K file transfer protocol implementation.
//!
//! The bootloader receives files (and sends them back on `read`) using
//! YMODEM batch framing with 1024-byte data blocks:
//!
//! ```text
//! Block format:
//! +---------+-----+------+--------------------+-------+
//! | SOH/STX | SEQ | ~SEQ |  DATA (128 / 1024) | CHECK |
//! +---------+-----+------+--------------------+-------+
//! | 1       | 1   | 1    |     128 / 1024     | 2     |
//! +---------+-----+------+--------------------+-------+
//! ```
//!
//! A send runs through the phases of [`Phase`]:
//!
//! ```text
//! sender                                  receiver
//!   |  <------------------------------ 'C'   |
//!   |  SOH 00 FF "name\0size " ------------>  |   Idle -> HeaderSent
//!   |  <------------------------------ ACK   |
//!   |  STX 01 FE data[1024] --------------->  |   DataInFlight
//!   |  <------------------------------ ACK   |
//!   |  ...                                    |
//!   |  EOT -------------------------------->  |   Closing
//!   |  <------------------------------ ACK   |
//!   |  SOH 00 FF 00...00 ------------------>  |   Done
//! ```
//!
//! The two check bytes are computed by a pluggable [`BlockCheck`]. The
//! bootloader has been driven with a placeholder (all zero) check field, so
//! that is the default; CRC16-XMODEM is available for receivers that verify it.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use log::{debug, trace, warn};
use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// YMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Block size for SOH packets.
pub const SOH_BLOCK_SIZE: usize = 128;

/// Block size for STX packets (YMODEM-1K).
pub const STX_BLOCK_SIZE: usize = 1024;

/// Marker, sequence, complement and two check bytes.
pub const PACKET_OVERHEAD: usize = 5;

/// Algorithm filling the two check bytes of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockCheck {
    /// Two zero bytes; receivers that verify the field will reject blocks.
    #[default]
    Placeholder,
    /// CRC16-XMODEM over the payload, big-endian.
    Crc16,
}

impl BlockCheck {
    /// Check bytes for `payload`.
    pub fn compute(self, payload: &[u8]) -> [u8; 2] {
        match self {
            Self::Placeholder => [0x00, 0x00],
            Self::Crc16 => crc16_xmodem(payload).to_be_bytes(),
        }
    }

    /// Whether `check` is acceptable for `payload`.
    ///
    /// A placeholder check carries no information and always passes.
    pub fn verify(self, payload: &[u8], check: [u8; 2]) -> bool {
        match self {
            Self::Placeholder => true,
            Self::Crc16 => self.compute(payload) == check,
        }
    }

    /// Parse a check name (`placeholder`, `none`, `crc16`, `crc`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "placeholder" | "none" | "zero" => Some(Self::Placeholder),
            "crc16" | "crc" => Some(Self::Crc16),
            _ => None,
        }
    }
}

impl fmt::Display for BlockCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder => write!(f, "placeholder"),
            Self::Crc16 => write!(f, "crc16"),
        }
    }
}

/// Phase of a single file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent yet.
    Idle,
    /// Header block exchanged or in flight.
    HeaderSent,
    /// Data blocks in flight.
    DataInFlight,
    /// EOT handshake.
    Closing,
    /// Transfer finished.
    Done,
    /// Transfer cancelled or failed.
    Aborted,
}

/// Per-transfer protocol state.
#[derive(Debug, Clone)]
pub struct TransferState {
    seq: u8,
    phase: Phase,
    retries: u32,
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferState {
    /// Fresh state: sequence 0 (header), idle.
    pub fn new() -> Self {
        Self {
            seq: 0,
            phase: Phase::Idle,
            retries: 0,
        }
    }

    /// Sequence number of the block in flight.
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Retries spent on the block in flight.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!("YMODEM phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn advance(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.retries = 0;
    }
}

/// A unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Block 0: file name and size. An empty name ends the batch.
    Header {
        /// File name.
        name: String,
        /// File size in bytes.
        size: u64,
    },
    /// Data block, always a full 1024 bytes on the wire.
    Data {
        /// Sequence number.
        seq: u8,
        /// Payload, at most 1024 bytes; shorter payloads are padded.
        payload: Vec<u8>,
    },
    /// End of transmission.
    Eot,
    /// Acknowledge.
    Ack,
    /// Not acknowledge.
    Nak,
    /// Cancel (sent as two CAN bytes).
    Cancel,
}

impl Packet {
    /// The empty header that closes a batch.
    pub fn end_of_batch() -> Self {
        Self::Header {
            name: String::new(),
            size: 0,
        }
    }

    /// Encode for the wire. `pad` fills short data payloads.
    ///
    /// A header or data payload that does not fit a 1024-byte block is an error.
    pub fn encode(&self, check: BlockCheck, pad: u8) -> Result<Vec<u8>> {
        match self {
            Self::Header { name, size } => {
                let mut payload = Vec::with_capacity(SOH_BLOCK_SIZE);
                if !name.is_empty() {
                    payload.extend_from_slice(name.as_bytes());
                    payload.push(0x00);
                    payload.extend_from_slice(size.to_string().as_bytes());
                    payload.push(b' ');
                }
                if payload.len() > STX_BLOCK_SIZE {
                    return Err(Error::Ymodem(format!(
                        "header for \"{name}\" takes {} bytes, limit is {STX_BLOCK_SIZE}",
                        payload.len()
                    )));
                }
                let block_size = if payload.len() <= SOH_BLOCK_SIZE {
                    SOH_BLOCK_SIZE
                } else {
                    STX_BLOCK_SIZE
                };
                build_block(0, &payload, block_size, 0x00, check)
            },
            Self::Data { seq, payload } => build_block(*seq, payload, STX_BLOCK_SIZE, pad, check),
            Self::Eot => Ok(vec![control::EOT]),
            Self::Ack => Ok(vec![control::ACK]),
            Self::Nak => Ok(vec![control::NAK]),
            Self::Cancel => Ok(vec![control::CAN, control::CAN]),
        }
    }
}

fn build_block(
    seq: u8,
    data: &[u8],
    block_size: usize,
    pad: u8,
    check: BlockCheck,
) -> Result<Vec<u8>> {
    if data.len() > block_size {
        return Err(Error::Ymodem(format!(
            "block {seq} payload of {} bytes exceeds {block_size}",
            data.len()
        )));
    }

    let marker = if block_size == STX_BLOCK_SIZE {
        control::STX
    } else {
        control::SOH
    };

    let mut block = Vec::with_capacity(block_size + PACKET_OVERHEAD);
    block.push(marker);
    block.push(seq);
    block.push(0xFF - seq);

    block.extend_from_slice(data);
    block.resize(3 + block_size, pad);

    let check = check.compute(&block[3..3 + block_size]);
    block.extend_from_slice(&check);
    Ok(block)
}

/// Parse a header payload into `(name, size)`. An empty name ends the batch.
pub fn parse_header(payload: &[u8]) -> Result<(String, u64)> {
    let name_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
    if name.is_empty() {
        return Ok((name, 0));
    }

    let rest = payload.get(name_end + 1..).unwrap_or_default();
    let digits: Vec<u8> = rest.iter().copied().take_while(u8::is_ascii_digit).collect();
    let size = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Ymodem(format!("header for \"{name}\" carries no size")))?;
    Ok((name, size))
}

/// YMODEM configuration options.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Time to wait for an acknowledgement or the next byte of a block.
    pub char_timeout: Duration,
    /// Time to wait for the peer to start the transfer.
    pub start_timeout: Duration,
    /// Retries per block before the transfer is aborted.
    pub max_retries: u32,
    /// Check field algorithm.
    pub check: BlockCheck,
    /// Fill byte for short data blocks.
    pub pad_byte: u8,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            char_timeout: Duration::from_millis(1000),
            start_timeout: Duration::from_secs(10),
            max_retries: 10,
            check: BlockCheck::Placeholder,
            pad_byte: 0x00,
        }
    }
}

/// File received by [`YmodemTransfer::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name announced by the sender.
    pub name: String,
    /// Size announced by the sender.
    pub size: u64,
    /// Bytes written to the sink.
    pub written: u64,
}

/// What the sender heard back after a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Ack,
    Nak,
    Cancel,
    Timeout,
}

/// What the receiver got from the line.
#[derive(Debug)]
enum Incoming {
    Block { seq: u8, payload: Vec<u8> },
    Eot,
    Cancel,
    Corrupt(&'static str),
    Timeout,
}

/// YMODEM transfer handler.
pub struct YmodemTransfer<'a, P: Read + Write + ?Sized> {
    port: &'a mut P,
    config: YmodemConfig,
    state: TransferState,
}

impl<'a, P: Read + Write + ?Sized> YmodemTransfer<'a, P> {
    /// Create a new YMODEM transfer handler.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, YmodemConfig::default())
    }

    /// Create a new YMODEM transfer handler with custom configuration.
    pub fn with_config(port: &'a mut P, config: YmodemConfig) -> Self {
        Self {
            port,
            config,
            state: TransferState::new(),
        }
    }

    /// State of the current (or last) transfer.
    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Read a single byte, giving up at `deadline`.
    fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.port.read(&mut buf) {
                Ok(1) => return Ok(Some(buf[0])),
                Ok(_) => {},
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn char_deadline(&self) -> Instant {
        Instant::now() + self.config.char_timeout
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn abort<T>(&mut self, reason: impl Into<String>) -> Result<T> {
        self.state.enter(Phase::Aborted);
        Err(Error::TransferAborted(reason.into()))
    }

    /// Wait for the receiver to request the transfer ('C' or NAK).
    pub fn wait_for_start(&mut self) -> Result<()> {
        debug!("Waiting for 'C' from receiver...");
        let deadline = Instant::now() + self.config.start_timeout;

        while let Some(byte) = self.read_byte(deadline)? {
            match byte {
                control::C | control::NAK => {
                    debug!("Receiver ready (0x{byte:02X}), starting transfer");
                    return Ok(());
                },
                control::CAN => {
                    if self.read_byte(self.char_deadline())? == Some(control::CAN) {
                        return self.abort("cancelled by receiver before start");
                    }
                },
                other => trace!("Skipping 0x{other:02X} while waiting for 'C'"),
            }
        }

        Err(Error::Timeout("Timeout waiting for 'C'".into()))
    }

    /// Wait for the response to a block or EOT.
    ///
    /// Stray bytes (a late 'C', console chatter) are skipped until the
    /// character timeout runs out.
    fn await_reply(&mut self) -> Result<Reply> {
        let deadline = self.char_deadline();
        while let Some(byte) = self.read_byte(deadline)? {
            match byte {
                control::ACK => return Ok(Reply::Ack),
                control::NAK => return Ok(Reply::Nak),
                control::CAN => {
                    if self.read_byte(self.char_deadline())? == Some(control::CAN) {
                        return Ok(Reply::Cancel);
                    }
                    trace!("Single CAN ignored");
                },
                other => trace!("Ignoring 0x{other:02X} while waiting for ACK"),
            }
        }
        Ok(Reply::Timeout)
    }

    /// Send a packet and wait for its ACK, resending on NAK or silence.
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let block = packet.encode(self.config.check, self.config.pad_byte)?;
        self.send_block(&block)
    }

    fn send_block(&mut self, block: &[u8]) -> Result<()> {
        self.state.retries = 0;

        loop {
            trace!(
                "Sending block {} (attempt {})",
                self.state.seq,
                self.state.retries + 1
            );
            self.write_bytes(block)?;

            match self.await_reply()? {
                Reply::Ack => {
                    trace!("Block {} ACKed", self.state.seq);
                    return Ok(());
                },
                Reply::Cancel => return self.abort("cancelled by receiver"),
                reply => {
                    self.state.retries += 1;
                    debug!(
                        "Block {} got {reply:?}, retry {}/{}",
                        self.state.seq, self.state.retries, self.config.max_retries
                    );
                    if self.state.retries > self.config.max_retries {
                        let seq = self.state.seq;
                        let retries = self.config.max_retries;
                        return self.abort(format!(
                            "block {seq} not acknowledged after {retries} retries"
                        ));
                    }
                },
            }
        }
    }

    /// Send EOT until the receiver acknowledges it.
    pub fn send_eot(&mut self) -> Result<()> {
        debug!("Sending EOT");
        self.state.enter(Phase::Closing);
        self.state.retries = 0;

        loop {
            self.write_bytes(&Packet::Eot.encode(self.config.check, self.config.pad_byte)?)?;
            match self.await_reply()? {
                Reply::Ack => {
                    debug!("EOT ACKed");
                    return Ok(());
                },
                Reply::Cancel => return self.abort("cancelled by receiver during EOT"),
                reply => {
                    self.state.retries += 1;
                    trace!("EOT got {reply:?}");
                    if self.state.retries > self.config.max_retries {
                        return self.abort("EOT not acknowledged");
                    }
                },
            }
        }
    }

    /// Send the empty header that ends the batch.
    ///
    /// The receiver's answer is left on the link; bootloaders may reply
    /// with text instead of an ACK.
    pub fn send_finish(&mut self) -> Result<()> {
        debug!("Sending finish block");
        self.state.seq = 0;
        let block = Packet::end_of_batch().encode(self.config.check, self.config.pad_byte)?;
        self.write_bytes(&block)
    }

    /// Send one file.
    ///
    /// # Arguments
    ///
    /// * `filename` - Name announced in the header block
    /// * `size` - Size announced in the header block
    /// * `source` - File contents, read in 1024-byte chunks
    /// * `progress` - Progress callback (bytes sent, total)
    pub fn send<R, F>(&mut self, filename: &str, size: u64, source: &mut R, progress: F) -> Result<()>
    where
        R: Read + ?Sized,
        F: FnMut(u64, u64),
    {
        self.state = TransferState::new();
        let result = self.run_send(filename, size, source, progress);
        if result.is_err() {
            self.state.enter(Phase::Aborted);
        }
        result
    }

    fn run_send<R, F>(
        &mut self,
        filename: &str,
        size: u64,
        source: &mut R,
        mut progress: F,
    ) -> Result<()>
    where
        R: Read + ?Sized,
        F: FnMut(u64, u64),
    {
        debug!("Starting YMODEM transfer: {filename} ({size} bytes)");

        let header = Packet::Header {
            name: filename.to_string(),
            size,
        }
        .encode(self.config.check, self.config.pad_byte)?;

        self.wait_for_start()?;

        self.state.enter(Phase::HeaderSent);
        self.send_block(&header)?;
        self.state.advance();

        let mut sent: u64 = 0;
        loop {
            let mut chunk = Vec::with_capacity(STX_BLOCK_SIZE);
            Read::take(&mut *source, STX_BLOCK_SIZE as u64).read_to_end(&mut chunk)?;
            if chunk.is_empty() {
                break;
            }

            self.state.enter(Phase::DataInFlight);
            let len = chunk.len() as u64;
            self.send_packet(&Packet::Data {
                seq: self.state.seq,
                payload: chunk,
            })?;
            self.state.advance();

            sent += len;
            progress(sent, size.max(sent));
        }

        self.send_eot()?;
        self.send_finish()?;
        self.state.enter(Phase::Done);

        debug!("YMODEM transfer complete ({sent} bytes)");
        Ok(())
    }

    /// Send one file held in memory.
    pub fn transfer<F>(&mut self, filename: &str, data: &[u8], progress: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        let mut source = data;
        self.send(filename, data.len() as u64, &mut source, progress)
    }

    /// Read exactly `buf.len()` bytes, each within the character timeout.
    fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<bool> {
        for slot in buf.iter_mut() {
            match self.read_byte(self.char_deadline())? {
                Some(b) => *slot = b,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn read_incoming(&mut self, wait: Duration) -> Result<Incoming> {
        let deadline = Instant::now() + wait;
        let block_size = loop {
            match self.read_byte(deadline)? {
                None => return Ok(Incoming::Timeout),
                Some(control::SOH) => break SOH_BLOCK_SIZE,
                Some(control::STX) => break STX_BLOCK_SIZE,
                Some(control::EOT) => return Ok(Incoming::Eot),
                Some(control::CAN) => {
                    if self.read_byte(self.char_deadline())? == Some(control::CAN) {
                        return Ok(Incoming::Cancel);
                    }
                },
                Some(other) => trace!("Skipping 0x{other:02X} while waiting for a block"),
            }
        };

        let mut rest = vec![0u8; block_size + PACKET_OVERHEAD - 1];
        if !self.read_exact_timed(&mut rest)? {
            return Ok(Incoming::Corrupt("short block"));
        }

        let seq = rest[0];
        if rest[1] != 0xFF - seq {
            return Ok(Incoming::Corrupt("sequence complement mismatch"));
        }
        let payload = rest[2..2 + block_size].to_vec();
        let check = [rest[2 + block_size], rest[3 + block_size]];
        if !self.config.check.verify(&payload, check) {
            return Ok(Incoming::Corrupt("check field mismatch"));
        }

        Ok(Incoming::Block { seq, payload })
    }

    fn cancel<T>(&mut self, reason: impl Into<String>) -> Result<T> {
        let _ = Packet::Cancel
            .encode(self.config.check, self.config.pad_byte)
            .and_then(|bytes| self.write_bytes(&bytes));
        self.abort(reason)
    }

    fn count_retry(&mut self, what: &str) -> Result<()> {
        self.state.retries += 1;
        debug!(
            "{what}, retry {}/{}",
            self.state.retries, self.config.max_retries
        );
        if self.state.retries > self.config.max_retries {
            return self.cancel(format!("{what} after {} retries", self.config.max_retries));
        }
        Ok(())
    }

    /// Receive one file into `sink`.
    ///
    /// Requests CRC mode with 'C', writes at most the announced size (block
    /// padding is dropped) and closes the batch after EOT.
    pub fn receive<W, F>(&mut self, sink: &mut W, progress: F) -> Result<ReceivedFile>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        self.state = TransferState::new();
        let result = self.run_receive(sink, progress);
        if result.is_err() {
            self.state.enter(Phase::Aborted);
        }
        result
    }

    fn run_receive<W, F>(&mut self, sink: &mut W, mut progress: F) -> Result<ReceivedFile>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        debug!("Waiting for YMODEM header...");
        let started = Instant::now();
        let (name, size) = loop {
            self.write_bytes(&[control::C])?;
            match self.read_incoming(self.config.char_timeout)? {
                Incoming::Block { seq: 0, payload } => break parse_header(&payload)?,
                Incoming::Cancel => return self.abort("cancelled by sender"),
                Incoming::Timeout if started.elapsed() < self.config.start_timeout => {},
                Incoming::Timeout => {
                    return Err(Error::Timeout("Timeout waiting for YMODEM header".into()));
                },
                other => {
                    trace!("Unexpected {other:?} while waiting for header");
                    self.write_bytes(&[control::NAK])?;
                    self.count_retry("bad header block")?;
                },
            }
        };

        if name.is_empty() {
            self.write_bytes(&[control::ACK])?;
            return Err(Error::Ymodem("sender has no file to send".into()));
        }

        debug!("Receiving {name} ({size} bytes)");
        self.state.enter(Phase::HeaderSent);
        self.write_bytes(&[control::ACK, control::C])?;
        self.state.advance();

        let mut written: u64 = 0;
        loop {
            match self.read_incoming(self.config.char_timeout)? {
                Incoming::Block { seq, payload } if seq == self.state.seq => {
                    self.state.enter(Phase::DataInFlight);
                    let keep = (size - written).min(payload.len() as u64) as usize;
                    sink.write_all(&payload[..keep])?;
                    written += keep as u64;
                    self.write_bytes(&[control::ACK])?;
                    self.state.advance();
                    progress(written, size);
                },
                Incoming::Block { seq, .. } if seq == self.state.seq.wrapping_sub(1) => {
                    trace!("Duplicate block {seq}, re-ACK");
                    self.write_bytes(&[control::ACK])?;
                },
                Incoming::Block { seq, .. } => {
                    let expected = self.state.seq;
                    return self.cancel(format!("expected block {expected}, got {seq}"));
                },
                Incoming::Eot => {
                    self.state.enter(Phase::Closing);
                    self.write_bytes(&[control::ACK])?;
                    break;
                },
                Incoming::Cancel => return self.abort("cancelled by sender"),
                Incoming::Corrupt(why) => {
                    self.write_bytes(&[control::NAK])?;
                    self.count_retry(why)?;
                },
                Incoming::Timeout => {
                    self.write_bytes(&[control::NAK])?;
                    self.count_retry("timeout waiting for block")?;
                },
            }
        }

        sink.flush()?;

        // Closing header; the file is complete even if it never arrives.
        self.write_bytes(&[control::C])?;
        match self.read_incoming(self.config.char_timeout)? {
            Incoming::Block { seq: 0, .. } => self.write_bytes(&[control::ACK])?,
            other => debug!("No closing header ({other:?}), ignoring"),
        }
        self.state.enter(Phase::Done);

        if written < size {
            warn!("{name}: received {written} of {size} bytes");
        }
        debug!("YMODEM receive complete ({written} bytes)");
        Ok(ReceivedFile {
            name,
            size,
            written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Mock serial port with separate read/write buffers for YMODEM testing.
    ///
    /// Unlike `Cursor<Vec<u8>>`, this keeps reads and writes independent.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockSerial {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                write_buf: Vec::new(),
            }
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> YmodemConfig {
        YmodemConfig {
            char_timeout: Duration::from_millis(20),
            start_timeout: Duration::from_millis(50),
            max_retries: 2,
            ..Default::default()
        }
    }

    /// Split what the sender wrote into wire units.
    fn split_packets(stream: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut i = 0;
        while i < stream.len() {
            let len = match stream[i] {
                control::SOH => SOH_BLOCK_SIZE + PACKET_OVERHEAD,
                control::STX => STX_BLOCK_SIZE + PACKET_OVERHEAD,
                _ => 1,
            };
            packets.push(stream[i..i + len].to_vec());
            i += len;
        }
        packets
    }

    fn acks(n: usize) -> Vec<u8> {
        let mut response = vec![control::C];
        response.extend(std::iter::repeat_n(control::ACK, n));
        response
    }

    #[test]
    fn test_build_block_soh() {
        let block = build_block(1, &[0x01, 0x02, 0x03], SOH_BLOCK_SIZE, 0x00, BlockCheck::Crc16).unwrap();

        assert_eq!(block[0], control::SOH);
        assert_eq!(block[1], 1);
        assert_eq!(block[2], 0xFE);
        assert_eq!(block.len(), 3 + SOH_BLOCK_SIZE + 2);
    }

    #[test]
    fn test_build_block_stx() {
        let data = vec![0xAA; STX_BLOCK_SIZE];
        let block = build_block(5, &data, STX_BLOCK_SIZE, 0x00, BlockCheck::Placeholder).unwrap();

        assert_eq!(block[0], control::STX);
        assert_eq!(block[1], 5);
        assert_eq!(block[2], 0xFA);
        assert_eq!(block.len(), 3 + STX_BLOCK_SIZE + 2);
        assert_eq!(&block[block.len() - 2..], &[0x00, 0x00]);
    }

    #[test]
    fn test_header_payload_layout() {
        let block = Packet::Header {
            name: "app_main.bin".into(),
            size: 4096,
        }
        .encode(BlockCheck::Placeholder, 0x1A).unwrap();

        assert_eq!(block.len(), SOH_BLOCK_SIZE + PACKET_OVERHEAD);
        assert_eq!(&block[..3], &[control::SOH, 0x00, 0xFF]);
        let expected = b"app_main.bin\x004096 ";
        assert_eq!(&block[3..3 + expected.len()], expected);
        // Header padding is always NUL, whatever the data pad byte is.
        assert!(block[3 + expected.len()..3 + SOH_BLOCK_SIZE].iter().all(|&b| b == 0));
        assert_eq!(
            parse_header(&block[3..3 + SOH_BLOCK_SIZE]).unwrap(),
            ("app_main.bin".to_string(), 4096)
        );
    }

    #[test]
    fn test_long_name_uses_stx_header() {
        let block = Packet::Header {
            name: "a".repeat(200),
            size: 1,
        }
        .encode(BlockCheck::Placeholder, 0).unwrap();
        assert_eq!(block[0], control::STX);
        assert_eq!(block.len(), STX_BLOCK_SIZE + PACKET_OVERHEAD);
    }

    #[test]
    fn test_end_of_batch_header_is_all_zero() {
        let block = Packet::end_of_batch().encode(BlockCheck::Placeholder, 0x1A).unwrap();
        assert_eq!(&block[..3], &[control::SOH, 0x00, 0xFF]);
        assert!(block[3..].iter().all(|&b| b == 0));
        assert_eq!(parse_header(&block[3..3 + SOH_BLOCK_SIZE]).unwrap().0, "");
    }

    #[test]
    fn test_cancel_encodes_double_can() {
        assert_eq!(
            Packet::Cancel.encode(BlockCheck::Placeholder, 0).unwrap(),
            vec![control::CAN, control::CAN]
        );
    }

    #[test]
    fn test_crc16_check_field() {
        let payload = vec![0x42; STX_BLOCK_SIZE];
        let block = Packet::Data { seq: 1, payload: payload.clone() }.encode(BlockCheck::Crc16, 0).unwrap();
        let crc = crc16_xmodem(&payload);
        assert_eq!(&block[block.len() - 2..], &crc.to_be_bytes());
        assert!(BlockCheck::Crc16.verify(&payload, crc.to_be_bytes()));
        assert!(!BlockCheck::Crc16.verify(&payload, [0, 0]));
        assert!(BlockCheck::Placeholder.verify(&payload, [0x12, 0x34]));
    }

    #[test]
    fn test_block_check_from_name() {
        assert_eq!(BlockCheck::from_name("CRC16"), Some(BlockCheck::Crc16));
        assert_eq!(BlockCheck::from_name("placeholder"), Some(BlockCheck::Placeholder));
        assert_eq!(BlockCheck::from_name("md5"), None);
    }

    #[test]
    fn test_empty_file_sends_header_then_eot() {
        // C, ACK(header), ACK(EOT), ACK(finish, left unread)
        let mut port = MockSerial::new(&acks(3));
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        ymodem.transfer("empty.bin", &[], |_, _| {}).unwrap();
        assert_eq!(ymodem.state().phase(), Phase::Done);

        let packets = split_packets(&port.write_buf);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][0], control::SOH);
        assert!(packets[0][3..].starts_with(b"empty.bin\x000 "));
        assert_eq!(packets[1], vec![control::EOT]);
        assert_eq!(packets[2][0], control::SOH);
        assert!(packets[2][3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_finish_leaves_receiver_answer_unread() {
        // C, ACK(header), ACK(data), ACK(EOT); the finish block is answered with text.
        let mut response = acks(3);
        response.extend_from_slice(b"File stored\r\n");
        let mut port = MockSerial::new(&response);
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        ymodem.transfer("app_a.bin", &[0x55; 100], |_, _| {}).unwrap();
        assert_eq!(ymodem.state().phase(), Phase::Done);

        let left: Vec<u8> = port.read_buf.iter().copied().collect();
        assert_eq!(left, b"File stored\r\n");
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let result = Packet::Header {
            name: "n".repeat(1100),
            size: 1,
        }
        .encode(BlockCheck::Placeholder, 0);
        assert!(matches!(result, Err(Error::Ymodem(_))));

        // Rejected before the receiver's 'C' is consumed.
        let mut port = MockSerial::new(&acks(3));
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());
        let result = ymodem.transfer(&"n".repeat(1100), &[1, 2, 3], |_, _| {});
        assert!(matches!(result, Err(Error::Ymodem(_))));
        assert_eq!(ymodem.state().phase(), Phase::Aborted);
        assert!(port.write_buf.is_empty());
        assert_eq!(port.read_buf.len(), 4);
    }

    #[test]
    fn test_oversized_data_payload_is_rejected() {
        let result = Packet::Data {
            seq: 1,
            payload: vec![0; STX_BLOCK_SIZE + 1],
        }
        .encode(BlockCheck::Placeholder, 0);
        assert!(matches!(result, Err(Error::Ymodem(_))));
    }

    #[test]
    fn test_short_final_chunk_padded_to_fixed_length() {
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8 + 1).collect();
        // C, ACK(header), ACK x2 (data), ACK(EOT), ACK(finish, left unread)
        let mut port = MockSerial::new(&acks(5));
        let config = YmodemConfig {
            pad_byte: 0x00,
            ..test_config()
        };
        let mut ymodem = YmodemTransfer::with_config(&mut port, config);

        ymodem.transfer("data.bin", &data, |_, _| {}).unwrap();

        let packets = split_packets(&port.write_buf);
        let data_packets: Vec<_> = packets.iter().filter(|p| p[0] == control::STX).collect();
        assert_eq!(data_packets.len(), 2);
        for p in &data_packets {
            assert_eq!(p.len(), STX_BLOCK_SIZE + PACKET_OVERHEAD);
        }
        let last = &data_packets[1][3..3 + STX_BLOCK_SIZE];
        assert_eq!(&last[..476], &data[1024..]);
        assert!(last[476..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn test_sequence_numbers_wrap_and_complement() {
        // 300 blocks crosses the 255 -> 0 boundary.
        let blocks = 300;
        let data = vec![0x5A; STX_BLOCK_SIZE * blocks];
        let mut port = MockSerial::new(&acks(blocks + 3));
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        ymodem.transfer("big.bin", &data, |_, _| {}).unwrap();

        let packets = split_packets(&port.write_buf);
        let data_packets: Vec<_> = packets.iter().filter(|p| p[0] == control::STX).collect();
        assert_eq!(data_packets.len(), blocks);
        for (i, p) in data_packets.iter().enumerate() {
            let expected = ((i + 1) % 256) as u8;
            assert_eq!(p[1], expected, "block {i}");
            assert_eq!(p[2], 255 - p[1]);
        }
    }

    #[test]
    fn test_nak_resends_identical_block() {
        let mut response = vec![control::C, control::ACK, control::NAK];
        response.extend([control::ACK, control::ACK, control::ACK]);
        let mut port = MockSerial::new(&response);
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        ymodem.transfer("nak.bin", &[1, 2, 3], |_, _| {}).unwrap();

        let packets = split_packets(&port.write_buf);
        let data_packets: Vec<_> = packets.iter().filter(|p| p[0] == control::STX).collect();
        assert_eq!(data_packets.len(), 2);
        assert_eq!(data_packets[0], data_packets[1]);
        assert_eq!(data_packets[0][1], 1);
    }

    #[test]
    fn test_double_cancel_aborts() {
        let response = vec![control::C, control::ACK, control::CAN, control::CAN];
        let mut port = MockSerial::new(&response);
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        let result = ymodem.transfer("cancel.bin", &[0u8; 10], |_, _| {});
        assert!(matches!(result, Err(Error::TransferAborted(_))));
        assert_eq!(ymodem.state().phase(), Phase::Aborted);
    }

    #[test]
    fn test_retry_budget_exhaustion_aborts() {
        // Header ACKed, then only NAKs.
        let mut response = vec![control::C, control::ACK];
        response.extend([control::NAK; 8]);
        let mut port = MockSerial::new(&response);
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        let result = ymodem.transfer("stuck.bin", &[0u8; 10], |_, _| {});
        assert!(matches!(result, Err(Error::TransferAborted(_))));
        assert_eq!(ymodem.state().phase(), Phase::Aborted);

        let packets = split_packets(&port.write_buf);
        let data_packets = packets.iter().filter(|p| p[0] == control::STX).count();
        // First send plus max_retries resends.
        assert_eq!(data_packets, 3);
    }

    #[test]
    fn test_start_skips_console_chatter() {
        let mut response = b"flash\r\nready\r\n".to_vec();
        response.extend(acks(4));
        let mut port = MockSerial::new(&response);
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        assert!(ymodem.transfer("app_x.bin", &[7u8; 3], |_, _| {}).is_ok());
    }

    #[test]
    fn test_no_start_request_times_out() {
        let mut port = MockSerial::new(&[]);
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        let result = ymodem.transfer("app_x.bin", &[7u8; 3], |_, _| {});
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(port.write_buf.is_empty());
    }

    #[test]
    fn test_ymodem_transfer_multi_block_progress() {
        let num_blocks = 3;
        let mut port = MockSerial::new(&acks(num_blocks + 3));
        let mut ymodem = YmodemTransfer::with_config(&mut port, test_config());

        let test_data = vec![0xDD; STX_BLOCK_SIZE * num_blocks];
        let mut progress_calls = 0;
        ymodem
            .transfer("multi_block.bin", &test_data, |current, total| {
                assert_eq!(total, (STX_BLOCK_SIZE * num_blocks) as u64);
                assert!(current <= total);
                progress_calls += 1;
            })
            .unwrap();

        assert_eq!(progress_calls, num_blocks, "Progress should be called once per block");
    }

    #[test]
    fn test_receive_scripted_stream() {
        let check = BlockCheck::Crc16;
        let mut stream = Packet::Header {
            name: "config.dat".into(),
            size: 12,
        }
        .encode(check, 0).unwrap();
        stream.extend(
            Packet::Data {
                seq: 1,
                payload: b"hello, world".to_vec(),
            }
            .encode(check, 0x1A).unwrap(),
        );
        stream.push(control::EOT);
        stream.extend(Packet::end_of_batch().encode(check, 0).unwrap());

        let mut port = MockSerial::new(&stream);
        let config = YmodemConfig {
            check,
            ..test_config()
        };
        let mut ymodem = YmodemTransfer::with_config(&mut port, config);
        let mut out = Vec::new();

        let file = ymodem.receive(&mut out, |_, _| {}).unwrap();

        assert_eq!(file.name, "config.dat");
        assert_eq!(file.size, 12);
        assert_eq!(file.written, 12);
        assert_eq!(out, b"hello, world");
        assert_eq!(ymodem.state().phase(), Phase::Done);
        assert_eq!(
            port.write_buf,
            vec![
                control::C,
                control::ACK,
                control::C,
                control::ACK,
                control::ACK,
                control::C,
                control::ACK
            ]
        );
    }

    #[test]
    fn test_receive_naks_corrupt_block_and_acks_duplicate() {
        let check = BlockCheck::Crc16;
        let mut stream = Packet::Header {
            name: "x.bin".into(),
            size: 4,
        }
        .encode(check, 0).unwrap();
        let good = Packet::Data {
            seq: 1,
            payload: b"abcd".to_vec(),
        }
        .encode(check, 0).unwrap();
        let mut corrupt = good.clone();
        corrupt[10] ^= 0xFF;
        stream.extend(&corrupt);
        stream.extend(&good);
        stream.extend(&good);
        stream.push(control::EOT);
        stream.extend(Packet::end_of_batch().encode(check, 0).unwrap());

        let mut port = MockSerial::new(&stream);
        let config = YmodemConfig {
            check,
            ..test_config()
        };
        let mut ymodem = YmodemTransfer::with_config(&mut port, config);
        let mut out = Vec::new();

        ymodem.receive(&mut out, |_, _| {}).unwrap();
        assert_eq!(out, b"abcd");
        assert_eq!(
            port.write_buf,
            vec![
                control::C,
                control::ACK,
                control::C,
                control::NAK,
                control::ACK,
                control::ACK,
                control::ACK,
                control::C,
                control::ACK
            ]
        );
    }

    /// One end of an in-memory full-duplex line.
    struct LineEnd {
        rx: Arc<Mutex<VecDeque<u8>>>,
        tx: Arc<Mutex<VecDeque<u8>>>,
    }

    fn line_pair() -> (LineEnd, LineEnd) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        (
            LineEnd {
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
            },
            LineEnd { rx: b, tx: a },
        )
    }

    impl Read for LineEnd {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut rx = self.rx.lock().unwrap();
            if rx.is_empty() {
                drop(rx);
                std::thread::sleep(Duration::from_millis(1));
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(rx.len());
            for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for LineEnd {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.tx.lock().unwrap().extend(buf.iter().copied());
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sender_and_receiver_agree() {
        for check in [BlockCheck::Placeholder, BlockCheck::Crc16] {
            let (mut host, mut device) = line_pair();
            let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
            let config = YmodemConfig {
                char_timeout: Duration::from_millis(500),
                start_timeout: Duration::from_secs(2),
                check,
                ..Default::default()
            };

            let receiver_config = config.clone();
            let receiver = std::thread::spawn(move || {
                let mut ymodem = YmodemTransfer::with_config(&mut device, receiver_config);
                let mut out = Vec::new();
                let file = ymodem.receive(&mut out, |_, _| {}).unwrap();
                (file, out)
            });

            let mut ymodem = YmodemTransfer::with_config(&mut host, config);
            ymodem.transfer("app_loop.bin", &data, |_, _| {}).unwrap();

            let (file, out) = receiver.join().unwrap();
            assert_eq!(file.name, "app_loop.bin");
            assert_eq!(file.size, 5000);
            assert_eq!(out, data, "check = {check}");
        }
    }
}
