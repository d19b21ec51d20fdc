use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::ABORT_SEQ;
use crate::error::{TransferResult, TransmissionError};
use crate::escape::EscapeMode;
use crate::reader::TransportReader;
use crate::writer::TransportWriter;
use crate::FileHandler;

/// A bidirectional octet stream the session runs over.
///
/// Anything `Read + Write` works (TCP socket, serial port, SSH channel).
/// Transports that can bound a blocking read should override
/// [`set_read_deadline`](Transport::set_read_deadline); without it the
/// `recv_timeout` config option has no effect and cancellation has to come
/// from outside (for example by closing the stream).
pub trait Transport: Read + Write + Send {
    /// Arm or clear an idle deadline for subsequent reads. Returns `false`
    /// when the transport has no deadline facility.
    fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let _ = timeout;
        Ok(false)
    }
}

impl Transport for TcpStream {
    fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.set_read_timeout(timeout)?;
        Ok(true)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.set_read_timeout(timeout)?;
        Ok(true)
    }
}

/// Session behavior knobs. `Config::default()` matches lrzsz-compatible
/// streaming operation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on data subpacket size (default 1024, capped at 8192 for
    /// ZedZap).
    pub max_block_size: usize,
    /// Receiver window advertised in ZRINIT; 0 means full streaming.
    pub window_size: usize,
    /// ZDLE escape coverage.
    pub escape_mode: EscapeMode,
    /// Prefer CRC-32 when the remote advertises CANFC32.
    pub use_32bit_crc: bool,
    /// Attention string announced via ZSINIT (truncated to 32 bytes).
    pub attn_sequence: Vec<u8>,
    /// Idle deadline for reads from the remote; `None` disables deadline
    /// management. Only effective on transports with deadline support.
    pub recv_timeout: Option<Duration>,
    /// Extra capability bits OR-ed into the advertised ZRINIT ZF0.
    pub capabilities: u8,
    /// Reject larger incoming files with ZSKIP; 0 means unlimited.
    pub max_file_size: u64,
    /// Retransmission cap outside the data phase (default 10).
    pub max_retries: usize,
    /// Non-frame octets tolerated while scanning for a frame start.
    pub garbage_threshold: usize,
    /// Leading zero octets before ZDATA headers, for modem turnaround.
    pub znulls: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_block_size: 1024,
            window_size: 0,
            escape_mode: EscapeMode::Standard,
            use_32bit_crc: false,
            attn_sequence: Vec::new(),
            recv_timeout: Some(Duration::from_secs(10)),
            capabilities: 0,
            max_file_size: 0,
            max_retries: 10,
            garbage_threshold: 1200,
            znulls: 0,
        }
    }
}

impl Config {
    fn normalized(mut self) -> Self {
        if self.max_block_size == 0 {
            self.max_block_size = 1024;
        }
        self.max_block_size = self.max_block_size.min(8192);
        if self.max_retries == 0 {
            self.max_retries = 10;
        }
        if self.garbage_threshold == 0 {
            self.garbage_threshold = 1200;
        }
        self
    }
}

/// Cloneable cancellation handle. The state machines poll it at every loop
/// iteration and bail out with [`TransmissionError::Cancelled`] without
/// emitting further frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> TransferResult<()> {
        if self.is_cancelled() {
            Err(TransmissionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A ZMODEM transfer session over a transport.
///
/// One session drives one batch in one direction; call [`send`](Session::send)
/// or [`receive`](Session::receive). The handler supplies outgoing files and
/// accepts incoming ones.
pub struct Session<T: Transport> {
    pub(crate) io: T,
    pub(crate) handler: Box<dyn FileHandler>,
    pub(crate) cfg: Config,
    pub(crate) tw: TransportWriter,
    pub(crate) tr: TransportReader,

    // Negotiated state
    pub(crate) use_crc32: bool,
    pub(crate) remote_flags: u8,
    pub(crate) attn_seq: Vec<u8>,
    pub(crate) remote_window: usize,

    active: AtomicBool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, handler: Box<dyn FileHandler>, cfg: Config) -> Self {
        let cfg = cfg.normalized();
        let tw = TransportWriter::new(cfg.escape_mode);
        let tr = TransportReader::new(
            cfg.garbage_threshold,
            cfg.recv_timeout,
            cfg.escape_mode != EscapeMode::Minimal,
        );
        Self {
            io: transport,
            handler,
            cfg,
            tw,
            tr,
            use_crc32: false,
            remote_flags: 0,
            attn_seq: Vec::new(),
            remote_window: 0,
            active: AtomicBool::new(false),
        }
    }

    /// Run a batch upload until the remote has everything or the session
    /// fails.
    pub fn send(&mut self, cancel: &CancelToken) -> TransferResult<()> {
        self.acquire()?;
        let res = self.run_sender(cancel);
        self.finish();
        res
    }

    /// Run a batch download until the remote signals ZFIN or the session
    /// fails.
    pub fn receive(&mut self, cancel: &CancelToken) -> TransferResult<()> {
        self.acquire()?;
        let res = self.run_receiver(cancel);
        self.finish();
        res
    }

    /// Write the abort sequence (eight CANs, ten backspaces) to the
    /// transport.
    pub fn abort(&mut self) -> io::Result<()> {
        self.io.write_all(&ABORT_SEQ)?;
        self.io.flush()
    }

    /// Attention sequence the sender announced via ZSINIT, if any.
    pub fn attn_sequence(&self) -> &[u8] {
        &self.attn_seq
    }

    /// Tear down the session and hand the transport back.
    pub fn into_transport(self) -> T {
        self.io
    }

    fn acquire(&self) -> TransferResult<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(TransmissionError::SessionActive);
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.tr.clear_deadline(&mut self.io);
        self.active.store(false, Ordering::Release);
    }
}
