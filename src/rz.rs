//! Receiver side: advertises ZRINIT, accepts ZFILE offers, drains data
//! subpackets with ZRPOS resynchronization, and answers ZFIN.

use std::io::Write;

use crate::constants::{
    zrinit_flag::CANFC32, zrinit_flag::CANFDX, zrinit_flag::CANOVIO, zrinit_flag::ESCCTL,
    zsinit_flag::TESCCTL, ZCRCG, ZCRCQ, ZCRCW,
};
use crate::error::{TransferResult, TransmissionError};
use crate::escape::EscapeMode;
use crate::fileinfo::{parse_file_info, FileInfo};
use crate::headers::{Header, HeaderType, ZFrameType};
use crate::session::{CancelToken, Session, Transport};
use crate::FileAccept;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// Advertise ZRINIT
    Init,
    /// Wait for ZFILE/ZSINIT/ZFIN
    FileWait,
    /// Ask the handler, reply ZRPOS or ZSKIP
    FileAccept,
    /// Receive ZDATA frames and subpackets
    Data,
    /// File complete, back to FileWait
    Eof,
    /// Answer ZFIN, consume "OO"
    Fin,
    Done,
}

/// Errors tolerated outside the data phase before concluding the peer does
/// not speak ZMODEM at all.
const MAX_CONSECUTIVE_ERR: usize = 15;

/// Retry cap inside the data phase; more forgiving than the control-phase
/// cap because every garbage-overflow cycle during resync burns one.
const MAX_DATA_RETRIES: usize = 25;

impl<T: Transport> Session<T> {
    pub(crate) fn run_receiver(&mut self, cancel: &CancelToken) -> TransferResult<()> {
        let mut state = RecvState::Init;

        let mut cur_info = FileInfo::default();
        let mut cur_writer: Option<Box<dyn Write + Send>> = None;
        let mut file_offset: u64 = 0;
        let mut bytes_received: u64 = 0;
        let mut retries: usize = 0;
        let mut consecutive_err: usize = 0;

        while state != RecvState::Done {
            cancel.check()?;

            match state {
                RecvState::Init => {
                    self.send_zrinit()?;
                    state = RecvState::FileWait;
                }

                RecvState::FileWait => {
                    let hdr = match self.recv_header() {
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            consecutive_err += 1;
                            if consecutive_err >= MAX_CONSECUTIVE_ERR {
                                return Err(TransmissionError::NotZmodemPeer(consecutive_err));
                            }
                            retries += 1;
                            if retries >= self.cfg.max_retries {
                                return Err(TransmissionError::MaxRetriesExceeded(
                                    self.cfg.max_retries,
                                ));
                            }
                            log::debug!("header error waiting for ZFILE: {err}");
                            self.send_hex_header(Header::empty(ZFrameType::Nak))?;
                            continue;
                        }
                        Ok(hdr) => hdr,
                    };
                    consecutive_err = 0;

                    match hdr.frame_type {
                        ZFrameType::RqInit => {
                            // Sender still initializing.
                            self.send_zrinit()?;
                        }

                        ZFrameType::SInit => {
                            if hdr.encoding == HeaderType::Bin32 {
                                self.use_crc32 = true;
                            }
                            let (mut data, _) = self.recv_subpacket(256)?;
                            while data.last() == Some(&0) {
                                data.pop();
                            }
                            self.attn_seq = data;

                            if hdr.f0() & TESCCTL != 0 {
                                self.tw.set_escape_mode(EscapeMode::All);
                            }
                            self.send_hex_header(Header::from_number(ZFrameType::Ack, 0))?;
                        }

                        ZFrameType::File => {
                            if hdr.encoding == HeaderType::Bin32 {
                                self.use_crc32 = true;
                            }
                            let (data, _) = self.recv_subpacket(2048)?;
                            cur_info = parse_file_info(&data)?;

                            if self.cfg.max_file_size > 0 && cur_info.size > self.cfg.max_file_size
                            {
                                log::warn!(
                                    "file '{}' ({} bytes) exceeds limit {}, skipping",
                                    cur_info.name,
                                    cur_info.size,
                                    self.cfg.max_file_size
                                );
                                self.send_hex_header(Header::empty(ZFrameType::Skip))?;
                                continue;
                            }
                            state = RecvState::FileAccept;
                        }

                        ZFrameType::Fin => state = RecvState::Fin,

                        ZFrameType::Command => {
                            // Never execute remote commands; acknowledge and
                            // move on.
                            log::warn!("ZCOMMAND received and rejected");
                            self.send_hex_header(Header::from_number(ZFrameType::Compl, 0))?;
                        }

                        ZFrameType::FreeCnt => {
                            self.send_hex_header(Header::from_number(
                                ZFrameType::Ack,
                                0x7FFF_FFFF,
                            ))?;
                        }

                        got => {
                            log::warn!("unexpected frame in file wait: {got}");
                            consecutive_err += 1;
                            if consecutive_err >= MAX_CONSECUTIVE_ERR {
                                return Err(TransmissionError::NotZmodemPeer(consecutive_err));
                            }
                        }
                    }
                }

                RecvState::FileAccept => {
                    match self.handler.accept_file(&cur_info)? {
                        FileAccept::Skip => {
                            self.send_hex_header(Header::empty(ZFrameType::Skip))?;
                            self.handler.file_completed(
                                &cur_info,
                                0,
                                Err(TransmissionError::Skipped),
                            );
                            state = RecvState::FileWait;
                        }
                        FileAccept::Accept { sink, offset } => {
                            cur_writer = Some(sink);
                            file_offset = offset;
                            bytes_received = offset;
                            retries = 0;
                            self.send_hex_header(Header::from_number(
                                ZFrameType::RPos,
                                file_offset as u32,
                            ))?;
                            state = RecvState::Data;
                        }
                    }
                }

                RecvState::Data => {
                    let hdr = match self.recv_header() {
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            retries += 1;
                            if retries > MAX_DATA_RETRIES {
                                cur_writer = None;
                                self.handler.file_completed(
                                    &cur_info,
                                    bytes_received,
                                    Err(TransmissionError::MaxRetriesExceeded(MAX_DATA_RETRIES)),
                                );
                                return Err(TransmissionError::MaxRetriesExceeded(
                                    MAX_DATA_RETRIES,
                                ));
                            }
                            log::debug!("header error in data phase: {err}, resyncing");
                            self.tr.purge();
                            self.send_hex_header(Header::from_number(
                                ZFrameType::RPos,
                                file_offset as u32,
                            ))?;
                            continue;
                        }
                        Ok(hdr) => hdr,
                    };

                    match hdr.frame_type {
                        ZFrameType::Data => {
                            if hdr.encoding == HeaderType::Bin32 {
                                self.use_crc32 = true;
                            }
                            let data_pos = u64::from(hdr.pos());
                            if data_pos != file_offset {
                                log::warn!(
                                    "ZDATA position mismatch: expected {file_offset}, got {data_pos}"
                                );
                                self.tr.purge();
                                self.send_hex_header(Header::from_number(
                                    ZFrameType::RPos,
                                    file_offset as u32,
                                ))?;
                                continue;
                            }

                            let Some(writer) = cur_writer.as_mut() else {
                                return Err(TransmissionError::UnexpectedFrame {
                                    expected: "ZFILE before ZDATA",
                                    got: ZFrameType::Data,
                                });
                            };

                            let res = recv_frame_subpackets(
                                self,
                                cancel,
                                &mut **writer,
                                &cur_info,
                                &mut file_offset,
                                &mut bytes_received,
                                &mut retries,
                            );
                            if let Err(err) = res {
                                if err.is_fatal() {
                                    return Err(err);
                                }
                                log::debug!("subpacket error at {file_offset}: {err}, resyncing");
                                self.tr.purge();
                                retries += 1;
                                if retries > MAX_DATA_RETRIES {
                                    cur_writer = None;
                                    self.handler.file_completed(
                                        &cur_info,
                                        bytes_received,
                                        Err(TransmissionError::MaxRetriesExceeded(
                                            MAX_DATA_RETRIES,
                                        )),
                                    );
                                    return Err(TransmissionError::MaxRetriesExceeded(
                                        MAX_DATA_RETRIES,
                                    ));
                                }
                                self.send_hex_header(Header::from_number(
                                    ZFrameType::RPos,
                                    file_offset as u32,
                                ))?;
                            }
                        }

                        ZFrameType::Eof => {
                            let eof_pos = u64::from(hdr.pos());
                            if eof_pos != file_offset {
                                // Mismatched ZEOF is ignored per the 1987
                                // protocol revision.
                                log::warn!(
                                    "ZEOF offset mismatch: expected {file_offset}, got {eof_pos}, ignoring"
                                );
                                continue;
                            }
                            state = RecvState::Eof;
                        }

                        ZFrameType::Nak => {
                            self.send_hex_header(Header::from_number(
                                ZFrameType::RPos,
                                file_offset as u32,
                            ))?;
                        }

                        ZFrameType::File => {
                            // Duplicate ZFILE after a lost ZRPOS: drain its
                            // metadata subpacket and re-request our offset.
                            let _ = self.recv_subpacket(2048);
                            self.send_hex_header(Header::from_number(
                                ZFrameType::RPos,
                                file_offset as u32,
                            ))?;
                        }

                        ZFrameType::Fin => {
                            cur_writer = None;
                            self.handler.file_completed(
                                &cur_info,
                                bytes_received,
                                Err(TransmissionError::PrematureEnd),
                            );
                            state = RecvState::Fin;
                        }

                        ZFrameType::Skip => {
                            // The sender cannot satisfy our ZRPOS (for
                            // example a non-seekable source).
                            cur_writer = None;
                            self.handler.file_completed(
                                &cur_info,
                                bytes_received,
                                Err(TransmissionError::Skipped),
                            );
                            state = RecvState::FileWait;
                        }

                        got => log::warn!("unexpected frame in data phase: {got}"),
                    }
                }

                RecvState::Eof => {
                    cur_writer = None;
                    self.handler.file_completed(&cur_info, bytes_received, Ok(()));

                    // Invite the next file.
                    self.send_zrinit()?;
                    state = RecvState::FileWait;
                }

                RecvState::Fin => {
                    self.send_hex_header(Header::empty(ZFrameType::Fin))?;

                    // Consume the trailing "OO" if it already arrived; never
                    // block for it.
                    if self.tr.buffered() >= 2 {
                        let _ = self.tr.read_byte(&mut self.io);
                        let _ = self.tr.read_byte(&mut self.io);
                    }
                    state = RecvState::Done;
                }

                RecvState::Done => {}
            }
        }

        Ok(())
    }

    /// Advertise our capabilities and window.
    fn send_zrinit(&mut self) -> TransferResult<()> {
        let mut hdr = Header::empty(ZFrameType::RInit);

        let mut caps = CANFDX | CANOVIO;
        if self.cfg.use_32bit_crc {
            caps |= CANFC32;
        }
        if self.cfg.escape_mode == EscapeMode::All {
            caps |= ESCCTL;
        }
        caps |= self.cfg.capabilities;
        hdr.set_f0(caps);

        // data[0..2]: receiver buffer size, 0 for full streaming.
        if self.cfg.window_size > 0 {
            hdr.data[0] = (self.cfg.window_size & 0xff) as u8;
            hdr.data[1] = ((self.cfg.window_size >> 8) & 0xff) as u8;
        }

        self.send_hex_header(hdr)
    }
}

/// Drain one ZDATA frame's subpackets into the sink, acknowledging ZCRCQ and
/// ZCRCW checkpoints. Returns when the frame ends (ZCRCE or ZCRCW).
#[allow(clippy::too_many_arguments)]
fn recv_frame_subpackets<T: Transport>(
    s: &mut Session<T>,
    cancel: &CancelToken,
    writer: &mut (dyn Write + Send),
    info: &FileInfo,
    offset: &mut u64,
    received: &mut u64,
    retries: &mut usize,
) -> TransferResult<()> {
    loop {
        cancel.check()?;

        let (data, end_type) = s.recv_subpacket(s.cfg.max_block_size + 256)?;

        if !data.is_empty() {
            writer.write_all(&data).map_err(TransmissionError::Io)?;
            *offset += data.len() as u64;
            *received = *offset;
            *retries = 0; // good data resets the budget

            s.handler.file_progress(info, *received);
        }

        match end_type {
            ZCRCG => {}
            ZCRCQ => {
                s.send_hex_header(Header::from_number(ZFrameType::Ack, *offset as u32))?;
            }
            ZCRCW => {
                s.send_hex_header(Header::from_number(ZFrameType::Ack, *offset as u32))?;
                return Ok(());
            }
            // ZCRCE: frame over, a header follows.
            _ => return Ok(()),
        }
    }
}
