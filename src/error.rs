use std::io;

use thiserror::Error;

use crate::headers::ZFrameType;

pub type TransferResult<T> = Result<T, TransmissionError>;

/// Everything that can go wrong during a transfer.
///
/// `Io` surfaces transport failures immediately. `Timeout` is produced when a
/// read deadline expires and is counted against the retry budget by the state
/// machines. The CRC/frame variants are recoverable on the wire (ZNAK or
/// ZRPOS) until the retry caps run out. `Skipped`, `NotSeekable` and
/// `PrematureEnd` are per-file outcomes reported through
/// [`FileHandler::file_completed`](crate::FileHandler::file_completed).
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("read timed out")]
    Timeout,

    #[error("session aborted by remote (5x CAN)")]
    AbortReceived,

    #[error("garbage count exceeded threshold")]
    GarbageOverflow,

    #[error("unsupported frame encoding 0x{0:02X}")]
    UnsupportedEncoding(u8),

    #[error("invalid frame type 0x{0:02X}")]
    InvalidFrameType(u8),

    #[error("invalid hex digits 0x{0:02X} 0x{1:02X}")]
    InvalidHexDigit(u8, u8),

    #[error("crc16 mismatch (computed 0x{0:04X}, received 0x{1:04X})")]
    Crc16Mismatch(u16, u16),

    #[error("crc32 mismatch (computed 0x{0:08X}, received 0x{1:08X})")]
    Crc32Mismatch(u32, u32),

    #[error("unexpected frame end marker inside {0}")]
    UnexpectedFrameEnd(&'static str),

    #[error("subpacket exceeds max length {0}")]
    SubpacketTooLong(usize),

    #[error("expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: ZFrameType,
    },

    #[error("expected {0} after hex header, got 0x{1:02X}")]
    BadHexTerminator(&'static str, u8),

    #[error("file info subpacket missing null terminator")]
    MalformedFileInfo,

    #[error("max retries ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    #[error("{0} consecutive errors, peer is not speaking ZMODEM")]
    NotZmodemPeer(usize),

    #[error("file skipped")]
    Skipped,

    #[error("cannot resume: reader is not seekable")]
    NotSeekable,

    #[error("session ended prematurely")]
    PrematureEnd,

    #[error("session already active")]
    SessionActive,

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransmissionError {
    /// True for errors the state machines never retry past.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransmissionError::Io(_)
                | TransmissionError::AbortReceived
                | TransmissionError::GarbageOverflow
                | TransmissionError::Cancelled
        )
    }

    /// Fold transport timeouts into the dedicated `Timeout` variant so the
    /// retry logic can count them uniformly.
    pub(crate) fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransmissionError::Timeout,
            _ => TransmissionError::Io(err),
        }
    }
}
