use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::crc::crc32_update;
use crate::error::{TransferResult, TransmissionError};

/// Object-safe Read + Seek, for seekable offer sources.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

enum OfferSource {
    /// Streaming only. A nonzero ZRPOS or a ZCRC query makes the file get
    /// skipped.
    Plain(Box<dyn Read + Send>),
    Seekable(Box<dyn ReadSeek + Send>),
}

/// A file to send.
pub struct FileOffer {
    pub name: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    /// Unix permission bits, sent octal in the ZFILE metadata.
    pub mode: u32,
    /// Batch hints carried in the ZFILE metadata: how many files follow this
    /// one and how many bytes they amount to. Zero means "not stated".
    pub files_remaining: usize,
    pub bytes_remaining: u64,
    source: OfferSource,
}

impl FileOffer {
    /// Offer from a plain reader. Resume and ZCRC queries are answered with
    /// ZSKIP for such offers.
    pub fn from_reader(
        name: impl Into<String>,
        size: u64,
        reader: impl Read + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mtime: None,
            mode: 0,
            files_remaining: 0,
            bytes_remaining: 0,
            source: OfferSource::Plain(Box::new(reader)),
        }
    }

    /// Offer from a seekable reader, enabling resume (nonzero ZRPOS) and
    /// ZCRC file-prefix queries.
    pub fn from_seekable(
        name: impl Into<String>,
        size: u64,
        reader: impl Read + Seek + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mtime: None,
            mode: 0,
            files_remaining: 0,
            bytes_remaining: 0,
            source: OfferSource::Seekable(Box::new(reader)),
        }
    }

    /// Offer a file from the filesystem, capturing size, modification time
    /// and permission bits.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = path.metadata()?;
        let file = File::open(path)?;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = 0o644;

        Ok(Self {
            name,
            size: meta.len(),
            mtime: meta.modified().ok(),
            mode,
            files_remaining: 0,
            bytes_remaining: 0,
            source: OfferSource::Seekable(Box::new(file)),
        })
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.source, OfferSource::Seekable(_))
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            OfferSource::Plain(r) => r.read(buf),
            OfferSource::Seekable(r) => r.read(buf),
        }
    }

    pub(crate) fn seek_to(&mut self, offset: u64) -> TransferResult<()> {
        match &mut self.source {
            OfferSource::Plain(_) => Err(TransmissionError::NotSeekable),
            OfferSource::Seekable(r) => {
                r.seek(SeekFrom::Start(offset))?;
                Ok(())
            }
        }
    }

    /// CRC-32 over the first `byte_count` bytes (0 means the whole file),
    /// leaving the read position where it was. Answers ZCRC queries.
    pub(crate) fn compute_crc(&mut self, byte_count: u64) -> TransferResult<u32> {
        let r = match &mut self.source {
            OfferSource::Plain(_) => return Err(TransmissionError::NotSeekable),
            OfferSource::Seekable(r) => r,
        };

        let saved = r.seek(SeekFrom::Current(0))?;
        r.seek(SeekFrom::Start(0))?;

        let mut crc = 0u32;
        let mut total: u64 = 0;
        let mut buf = [0u8; 8192];
        loop {
            let want = if byte_count > 0 {
                (byte_count - total).min(buf.len() as u64) as usize
            } else {
                buf.len()
            };
            if want == 0 {
                break;
            }
            let n = r.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            crc = crc32_update(crc, &buf[..n]);
            total += n as u64;
        }

        r.seek(SeekFrom::Start(saved))?;
        Ok(crc)
    }

    pub(crate) fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            size: self.size,
            mtime: self.mtime,
            mode: self.mode,
            files_remaining: self.files_remaining,
            bytes_remaining: self.bytes_remaining,
        }
    }
}

/// An incoming file, parsed from a ZFILE metadata subpacket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub mode: u32,
    pub files_remaining: usize,
    pub bytes_remaining: u64,
}

/// Encode file metadata for the ZFILE data subpacket:
/// `<filename>\0<size> <mtime-octal> <mode-octal> 0 [<files-remaining>
/// [<bytes-remaining>]]\0`. Filenames go lowercase with forward slashes per
/// historical ZMODEM convention.
pub(crate) fn marshal_file_info(offer: &FileOffer) -> Vec<u8> {
    let name = offer.name.to_lowercase().replace('\\', "/");

    let mtime_secs = offer
        .mtime
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());

    let mut meta = format!("{} {:o} {:o} 0", offer.size, mtime_secs, offer.mode);
    if offer.files_remaining > 0 {
        meta.push_str(&format!(" {}", offer.files_remaining));
        if offer.bytes_remaining > 0 {
            meta.push_str(&format!(" {}", offer.bytes_remaining));
        }
    }

    let mut result = Vec::with_capacity(name.len() + meta.len() + 2);
    result.extend_from_slice(name.as_bytes());
    result.push(0);
    result.extend_from_slice(meta.as_bytes());
    result.push(0);
    result
}

/// Parse a ZFILE metadata subpacket. Every field after the filename is
/// optional.
pub(crate) fn parse_file_info(data: &[u8]) -> TransferResult<FileInfo> {
    let null_idx = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(TransmissionError::MalformedFileInfo)?;

    let mut info = FileInfo {
        name: String::from_utf8_lossy(&data[..null_idx]).into_owned(),
        ..FileInfo::default()
    };

    let mut rest = &data[null_idx + 1..];
    while let [head @ .., 0] = rest {
        rest = head;
    }
    if rest.is_empty() {
        return Ok(info);
    }

    let rest = String::from_utf8_lossy(rest).into_owned();
    let mut fields = rest.split_whitespace();

    if let Some(f) = fields.next() {
        if let Ok(size) = f.parse::<u64>() {
            info.size = size;
        }
    }
    if let Some(f) = fields.next() {
        if let Ok(secs) = u64::from_str_radix(f, 8) {
            if secs > 0 {
                info.mtime = Some(UNIX_EPOCH + Duration::from_secs(secs));
            }
        }
    }
    if let Some(f) = fields.next() {
        if let Ok(mode) = u32::from_str_radix(f, 8) {
            info.mode = mode;
        }
    }
    // Field 3 is the serial number, always 0.
    let _ = fields.next();
    if let Some(f) = fields.next() {
        if let Ok(fr) = f.parse::<usize>() {
            info.files_remaining = fr;
        }
    }
    if let Some(f) = fields.next() {
        if let Ok(br) = f.parse::<u64>() {
            info.bytes_remaining = br;
        }
    }

    Ok(info)
}

/// Strip directory components from an incoming filename, leaving the last
/// path element. Incoming names may carry `../` traversal; the engine never
/// touches the filesystem with them, but handlers that do should pass names
/// through here (or their own policy) first.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return if name.starts_with('/') { "/" } else { "." }.to_string();
    }
    match trimmed.rsplit('/').next() {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => ".".to_string(),
    }
}
