use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::time::Duration;

use crate::constants::{CAN, XOFF, XON, ZBIN, ZBIN32, ZBINR32, ZCRCE, ZCRCG, ZCRCQ, ZCRCW, ZDLE, ZHEX, ZPAD, ZRUB0, ZRUB1, ZVBIN, ZVBIN32, ZVBINR32, ZVHEX};
use crate::error::{TransferResult, TransmissionError};
use crate::session::Transport;

const READ_BUF_SIZE: usize = 4096;

/// Incoming side of the framing codec: a read buffer plus ZDLE decode state,
/// XON/XOFF stripping, CAN abort counting and the garbage accounting used
/// while hunting for frame starts.
pub(crate) struct TransportReader {
    buf: VecDeque<u8>,
    chunk: [u8; READ_BUF_SIZE],
    timeout: Option<Duration>,
    garbage_count: usize,
    garbage_max: usize,
    can_count: usize,
    strip_flow: bool,
}

impl TransportReader {
    pub fn new(garbage_max: usize, timeout: Option<Duration>, strip_flow: bool) -> Self {
        Self {
            buf: VecDeque::with_capacity(READ_BUF_SIZE),
            chunk: [0; READ_BUF_SIZE],
            timeout,
            garbage_count: 0,
            garbage_max,
            can_count: 0,
            strip_flow,
        }
    }

    /// Number of bytes already pulled off the transport.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next chunk off the transport, arming the idle deadline first
    /// when the transport supports one.
    fn fill<T: Transport>(&mut self, io: &mut T) -> TransferResult<()> {
        if self.timeout.is_some() {
            io.set_read_deadline(self.timeout)?;
        }
        match io.read(&mut self.chunk) {
            Ok(0) => Err(TransmissionError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "transport closed",
            ))),
            Ok(n) => {
                self.buf.extend(&self.chunk[..n]);
                Ok(())
            }
            Err(err) => Err(TransmissionError::from_read(err)),
        }
    }

    /// Read one raw byte.
    pub fn read_byte<T: Transport>(&mut self, io: &mut T) -> TransferResult<u8> {
        loop {
            if let Some(b) = self.buf.pop_front() {
                return Ok(b);
            }
            self.fill(io)?;
        }
    }

    /// Read one byte, stripping XON/XOFF (and their parity variants) unless
    /// running in minimal-escape (DirZap) mode, where they are data.
    fn read_byte_strip<T: Transport>(&mut self, io: &mut T) -> TransferResult<u8> {
        loop {
            let b = self.read_byte(io)?;
            if self.strip_flow && matches!(b & 0x7f, XON | XOFF) {
                continue;
            }
            return Ok(b);
        }
    }

    /// Read one ZDLE-decoded byte. Returns `(byte, frame_end)` where
    /// `frame_end` is non-zero when a subpacket end marker
    /// (ZCRCE/ZCRCG/ZCRCQ/ZCRCW) was encountered instead of data.
    pub fn zdl_read<T: Transport>(&mut self, io: &mut T) -> TransferResult<(u8, u8)> {
        loop {
            let b = self.read_byte_strip(io)?;

            if b != ZDLE {
                self.can_count = 0;
                return Ok((b, 0));
            }

            // ZDLE == CAN == 0x18
            self.can_count += 1;
            if self.can_count >= 5 {
                return Err(TransmissionError::AbortReceived);
            }

            let c = self.read_byte_strip(io)?;
            match c {
                ZCRCE | ZCRCG | ZCRCQ | ZCRCW => {
                    self.can_count = 0;
                    return Ok((0, c));
                }
                ZRUB0 => {
                    self.can_count = 0;
                    return Ok((0x7f, 0));
                }
                ZRUB1 => {
                    self.can_count = 0;
                    return Ok((0xff, 0));
                }
                c if c >= 0x40 => {
                    self.can_count = 0;
                    return Ok((c ^ 0x40, 0));
                }
                c => {
                    // ZDLE followed by a raw control char is line noise;
                    // drop the pair and keep reading.
                    if c == CAN {
                        self.can_count += 1;
                        if self.can_count >= 5 {
                            return Err(TransmissionError::AbortReceived);
                        }
                    }
                    log::debug!("ZDLE noise: discarding 0x{c:02x}");
                }
            }
        }
    }

    /// Read two hex digits as one byte. Parity bits are stripped first,
    /// uppercase digits are tolerated.
    pub fn read_hex<T: Transport>(&mut self, io: &mut T) -> TransferResult<u8> {
        let hi = self.read_byte(io)? & 0x7f;
        let lo = self.read_byte(io)? & 0x7f;
        match (hex_val(hi), hex_val(lo)) {
            (Some(h), Some(l)) => Ok((h << 4) | l),
            _ => Err(TransmissionError::InvalidHexDigit(hi, lo)),
        }
    }

    /// Hunt for a frame start (ZPAD [ZPAD] ZDLE enc) and return the encoding
    /// byte. Everything else counts against the garbage threshold; five raw
    /// CANs abort.
    pub fn scan_for_pad<T: Transport>(&mut self, io: &mut T) -> TransferResult<u8> {
        self.can_count = 0;

        loop {
            let b = self.read_byte(io)?;

            if b == CAN {
                self.can_count += 1;
                if self.can_count >= 5 {
                    return Err(TransmissionError::AbortReceived);
                }
                self.count_garbage()?;
                continue;
            }
            self.can_count = 0;

            if b != ZPAD {
                self.count_garbage()?;
                continue;
            }

            // One ZPAD seen, a second is optional.
            let mut b = self.read_byte(io)?;
            if b == ZPAD {
                b = self.read_byte(io)?;
            }
            if b != ZDLE {
                self.count_garbage()?;
                continue;
            }

            let enc = self.read_byte(io)?;
            match enc {
                ZBIN | ZHEX | ZBIN32 => {
                    self.garbage_count = 0;
                    return Ok(enc);
                }
                ZBINR32 | ZVBIN | ZVHEX | ZVBIN32 | ZVBINR32 => {
                    return Err(TransmissionError::UnsupportedEncoding(enc));
                }
                _ => {
                    self.count_garbage()?;
                }
            }
        }
    }

    fn count_garbage(&mut self) -> TransferResult<()> {
        self.garbage_count += 1;
        if self.garbage_count > self.garbage_max {
            return Err(TransmissionError::GarbageOverflow);
        }
        Ok(())
    }

    /// Reset the garbage counter after a fully received frame.
    pub fn reset_garbage(&mut self) {
        self.garbage_count = 0;
    }

    /// Does the data already buffered contain a possible frame start or
    /// abort? Pure buffer inspection, never touches the transport.
    pub fn peek_for_zpad(&self) -> bool {
        self.buf.iter().any(|&b| b == ZPAD || b == CAN)
    }

    /// Next buffered byte, if any, without consuming it.
    pub fn peek_byte(&self) -> Option<u8> {
        self.buf.front().copied()
    }

    /// Drop everything buffered. Used before ZRPOS resynchronization.
    pub fn purge(&mut self) {
        self.buf.clear();
    }

    /// Remove any read deadline the session armed, so callers can reuse the
    /// transport afterwards.
    pub fn clear_deadline<T: Transport>(&mut self, io: &mut T) {
        if self.timeout.is_some() {
            let _ = io.set_read_deadline(None);
        }
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
