use std::io;

use crate::constants::ZDLE;
use crate::escape::{build_escape_table, escape_required, EscapeMode};
use crate::session::Transport;

const WRITE_BUF_SIZE: usize = 4096;

/// Outgoing side of the framing codec: a write buffer plus the ZDLE escape
/// state. The transport itself is passed in at flush time so the session can
/// hand out reader, writer and transport borrows independently.
pub(crate) struct TransportWriter {
    buf: Vec<u8>,
    table: [u8; 256],
    mode: EscapeMode,
    last_sent: u8,
}

impl TransportWriter {
    pub fn new(mode: EscapeMode) -> Self {
        Self {
            buf: Vec::with_capacity(WRITE_BUF_SIZE),
            table: build_escape_table(mode),
            mode,
            last_sent: 0,
        }
    }

    pub fn escape_mode(&self) -> EscapeMode {
        self.mode
    }

    /// Change the escape mode and rebuild the table.
    pub fn set_escape_mode(&mut self, mode: EscapeMode) {
        self.mode = mode;
        self.table = build_escape_table(mode);
    }

    /// Queue bytes without escaping.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if let Some(&last) = data.last() {
            self.last_sent = last;
        }
    }

    /// Queue a single raw byte.
    pub fn write_byte(&mut self, b: u8) {
        self.buf.push(b);
        self.last_sent = b;
    }

    /// Queue bytes with ZDLE escaping.
    pub fn write_escaped(&mut self, data: &[u8]) {
        for &b in data {
            self.write_escaped_byte(b);
        }
    }

    /// Queue a single byte, escaping if the table (and the last transmitted
    /// octet, for the CR rule) says so.
    pub fn write_escaped_byte(&mut self, b: u8) {
        if escape_required(&self.table, b, self.last_sent) {
            let esc = b ^ 0x40;
            self.buf.push(ZDLE);
            self.buf.push(esc);
            self.last_sent = esc;
        } else {
            self.buf.push(b);
            self.last_sent = b;
        }
    }

    /// Queue a byte as two lowercase hex digits.
    pub fn write_hex(&mut self, b: u8) {
        const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";
        self.buf.push(HEX_DIGITS[(b >> 4) as usize]);
        self.buf.push(HEX_DIGITS[(b & 0x0f) as usize]);
        self.last_sent = HEX_DIGITS[(b & 0x0f) as usize];
    }

    /// Push everything queued to the transport.
    pub fn flush<T: Transport>(&mut self, io: &mut T) -> io::Result<()> {
        if !self.buf.is_empty() {
            io.write_all(&self.buf)?;
            self.buf.clear();
        }
        io.flush()
    }

    #[cfg(test)]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}
