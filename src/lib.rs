//!
//! ZMODEM batch file transfer over any bidirectional byte stream.
//! Protocol specification: http://cristal.inria.fr/~doligez/zmodem/zmodem.txt
//!
//! The engine speaks the full batch protocol against lrzsz `rz`/`sz`,
//! Mystic BBS, SyncTerm and HyperTerminal peers: negotiation, per-file
//! transfer with resume, streaming with ZCRCQ/ZCRCW checkpoints, window
//! flow control, ZRPOS error recovery and session teardown.
//!
//! ```no_run
//! use icy_zmodem::{CancelToken, Config, FileAccept, FileHandler, FileInfo,
//!                  FileOffer, Session, TransmissionError};
//! use std::net::TcpStream;
//!
//! struct Downloader;
//!
//! impl FileHandler for Downloader {
//!     fn next_file(&mut self) -> Option<FileOffer> {
//!         None
//!     }
//!     fn accept_file(&mut self, info: &FileInfo) -> std::io::Result<FileAccept> {
//!         let name = icy_zmodem::sanitize_filename(&info.name);
//!         let file = std::fs::File::create(name)?;
//!         Ok(FileAccept::Accept { sink: Box::new(file), offset: 0 })
//!     }
//!     fn file_completed(&mut self, info: &FileInfo, bytes: u64,
//!                       result: Result<(), TransmissionError>) {
//!         println!("{}: {} bytes, {result:?}", info.name, bytes);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("bbs.example.org:23")?;
//! let mut session = Session::new(stream, Box::new(Downloader), Config::default());
//! session.receive(&CancelToken::new())?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub use constants::*;

mod crc;
mod error;
mod escape;
mod fileinfo;
mod headers;
mod reader;
mod rz;
mod session;
mod subpacket;
mod sz;
mod writer;

#[cfg(test)]
mod tests;

pub use error::{TransferResult, TransmissionError};
pub use escape::EscapeMode;
pub use fileinfo::{sanitize_filename, FileInfo, FileOffer, ReadSeek};
pub use headers::{Header, HeaderType, ZFrameType};
pub use session::{CancelToken, Config, Session, Transport};

use std::io::{self, Write};

/// Application callbacks for file storage on both sides of a transfer.
///
/// The engine calls these synchronously from the state machine thread.
pub trait FileHandler: Send {
    /// Next file to send, or `None` when the batch is done.
    fn next_file(&mut self) -> Option<FileOffer>;

    /// Decide whether to take an incoming file.
    ///
    /// The engine does NOT sanitize `info.name`; it may contain `../`
    /// traversal. Run it through [`sanitize_filename`] (or stricter policy)
    /// before touching the filesystem.
    fn accept_file(&mut self, info: &FileInfo) -> io::Result<FileAccept>;

    /// Periodic progress during a transfer, with the running byte count.
    fn file_progress(&mut self, info: &FileInfo, bytes_transferred: u64) {
        let _ = (info, bytes_transferred);
    }

    /// A file finished: `Ok(())` on success, or `Err` carrying
    /// [`TransmissionError::Skipped`], [`TransmissionError::NotSeekable`],
    /// [`TransmissionError::PrematureEnd`] or the failure.
    fn file_completed(
        &mut self,
        info: &FileInfo,
        bytes_transferred: u64,
        result: Result<(), TransmissionError>,
    );
}

/// Answer from [`FileHandler::accept_file`].
pub enum FileAccept {
    /// Take the file, writing into `sink`. A nonzero `offset` resumes an
    /// interrupted transfer: the sender is positioned there via ZRPOS and
    /// only bytes from `offset` on are written.
    Accept {
        sink: Box<dyn Write + Send>,
        offset: u64,
    },
    /// Skip this file and move on with the batch.
    Skip,
}
