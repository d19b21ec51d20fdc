//! Sender side: drives ZRQINIT negotiation, per-file ZFILE → ZDATA → ZEOF
//! flow, reverse-channel sampling, window flow control and ZRPOS recovery.

use crate::constants::{
    zfile_flag::ZCBIN, zrinit_flag::CANFC32, zrinit_flag::CANFDX, zrinit_flag::ESCCTL,
    zsinit_flag::TESCCTL, AUTO_DOWNLOAD, ZATTNLEN, ZCRCE, ZCRCG, ZCRCQ, ZCRCW,
};
use crate::error::{TransferResult, TransmissionError};
use crate::escape::EscapeMode;
use crate::fileinfo::{marshal_file_info, FileInfo, FileOffer};
use crate::headers::{Header, ZFrameType};
use crate::session::{CancelToken, Session, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    /// Send "rz\r" + ZRQINIT, wait for ZRINIT
    Init,
    /// Optional: announce the attention sequence via ZSINIT
    SInit,
    /// Ask the handler for the next file
    NextFile,
    /// Send ZFILE + metadata subpacket
    FileInfo,
    /// Wait for ZRPOS/ZSKIP/ZCRC
    FileInfoAck,
    /// Stream ZDATA subpackets
    Data,
    /// Send ZEOF
    Eof,
    /// Wait for ZRINIT (file done) or regression
    EofAck,
    /// Send ZFIN
    Fin,
    /// Wait for the ZFIN reply, send "OO"
    FinAck,
    Done,
}

/// Per-file adaptation state. Lives in the sender's loop frame, reset for
/// every file.
struct FlowState {
    block_size: usize,
    good_blocks: usize,
    unreliable: bool,
    zcrcw_next: bool,
    zcrcw_retries: usize,
}

impl FlowState {
    fn new() -> Self {
        Self {
            block_size: 256,
            good_blocks: 0,
            unreliable: false,
            zcrcw_next: false,
            zcrcw_retries: 0,
        }
    }

    /// The receiver rewound us (ZRPOS): halve the block size, demand a
    /// longer streak before growing again, and flush with ZCRCW on the next
    /// subpacket so both sides resynchronize.
    fn on_rewind(&mut self) {
        self.block_size = (self.block_size / 2).max(32);
        self.good_blocks = 0;
        self.unreliable = true;
        self.zcrcw_next = true;
        self.zcrcw_retries = 0;
    }

    /// Double the block size after enough consecutive good blocks: eight on
    /// a clean link, sixteen once the receiver has rewound us.
    fn adapt(&mut self, max_block_size: usize) {
        let needed = if self.unreliable { 16 } else { 8 };
        if self.good_blocks >= needed && self.block_size < max_block_size {
            self.block_size = (self.block_size * 2).min(max_block_size);
            self.good_blocks = 0;
        }
    }
}

const ZCRCQ_INTERVAL: usize = 8;

impl<T: Transport> Session<T> {
    pub(crate) fn run_sender(&mut self, cancel: &CancelToken) -> TransferResult<()> {
        let mut state = SendState::Init;

        let mut cur_offer: Option<FileOffer> = None;
        let mut cur_info = FileInfo::default();
        let mut file_offset: u64 = 0;
        let mut bytes_sent: u64 = 0;
        let mut retries: usize = 0;
        let mut flow = FlowState::new();

        'machine: while state != SendState::Done {
            cancel.check()?;

            match state {
                SendState::Init => {
                    // The literal "rz\r" triggers auto-download in terminal
                    // emulators before the first real frame.
                    self.tw.write_raw(AUTO_DOWNLOAD);
                    self.send_hex_header(Header::empty(ZFrameType::RqInit))?;

                    let rx = self.recv_header_retry(cancel, &mut retries)?;
                    match rx.frame_type {
                        ZFrameType::RInit => {
                            self.process_zrinit(&rx);
                            if self.cfg.attn_sequence.is_empty() {
                                state = SendState::NextFile;
                            } else {
                                state = SendState::SInit;
                            }
                        }
                        ZFrameType::Challenge => {
                            // Echo the challenge value back, keep waiting.
                            self.send_hex_header(Header::from_number(ZFrameType::Ack, rx.pos()))?;
                        }
                        got => {
                            return Err(TransmissionError::UnexpectedFrame {
                                expected: "ZRINIT",
                                got,
                            })
                        }
                    }
                }

                SendState::SInit => {
                    let mut hdr = Header::empty(ZFrameType::SInit);
                    if self.cfg.escape_mode == EscapeMode::All {
                        hdr.set_f0(TESCCTL);
                    }
                    self.send_bin_header(hdr)?;

                    // The attention subpacket always escapes control chars,
                    // whatever the session-wide mode.
                    let mut attn = self.cfg.attn_sequence.clone();
                    attn.truncate(ZATTNLEN);
                    attn.push(0);
                    let old_mode = self.tw.escape_mode();
                    self.tw.set_escape_mode(EscapeMode::All);
                    let res = self.send_subpacket(&attn, ZCRCW);
                    self.tw.set_escape_mode(old_mode);
                    res?;

                    let rx = self.recv_header_retry(cancel, &mut retries)?;
                    match rx.frame_type {
                        ZFrameType::Ack => state = SendState::NextFile,
                        ZFrameType::Nak => retries += 1, // resend ZSINIT
                        got => {
                            return Err(TransmissionError::UnexpectedFrame {
                                expected: "ZACK for ZSINIT",
                                got,
                            })
                        }
                    }
                }

                SendState::NextFile => {
                    cur_offer = self.handler.next_file();
                    match &cur_offer {
                        None => state = SendState::Fin,
                        Some(offer) => {
                            cur_info = offer.info();
                            file_offset = 0;
                            bytes_sent = 0;
                            retries = 0;
                            flow = FlowState::new();
                            state = SendState::FileInfo;
                        }
                    }
                }

                SendState::FileInfo => {
                    let Some(offer) = cur_offer.as_ref() else {
                        state = SendState::Fin;
                        continue;
                    };
                    let meta = marshal_file_info(offer);

                    let mut hdr = Header::empty(ZFrameType::File);
                    hdr.set_f0(ZCBIN); // binary transfer, no conversion
                    self.send_bin_header(hdr)?;
                    self.send_subpacket(&meta, ZCRCW)?;
                    state = SendState::FileInfoAck;
                }

                SendState::FileInfoAck => {
                    let rx = self.recv_header_retry(cancel, &mut retries)?;
                    match rx.frame_type {
                        ZFrameType::RPos => {
                            let Some(offer) = cur_offer.as_mut() else {
                                state = SendState::Fin;
                                continue;
                            };
                            let mut pos = u64::from(rx.pos());
                            if offer.size > 0 && pos > offer.size {
                                pos = 0;
                            }
                            if pos > 0 {
                                if let Err(err) = offer.seek_to(pos) {
                                    log::warn!(
                                        "cannot seek '{}' for resume, skipping: {err}",
                                        offer.name
                                    );
                                    self.send_hex_header(Header::empty(ZFrameType::Skip))?;
                                    self.handler.file_completed(
                                        &cur_info,
                                        0,
                                        Err(TransmissionError::NotSeekable),
                                    );
                                    state = SendState::NextFile;
                                    continue;
                                }
                            }
                            file_offset = pos;
                            bytes_sent = pos;
                            state = SendState::Data;
                        }
                        ZFrameType::Skip => {
                            self.handler.file_completed(
                                &cur_info,
                                0,
                                Err(TransmissionError::Skipped),
                            );
                            state = SendState::NextFile;
                        }
                        ZFrameType::Crc => {
                            let Some(offer) = cur_offer.as_mut() else {
                                state = SendState::Fin;
                                continue;
                            };
                            match offer.compute_crc(u64::from(rx.pos())) {
                                Ok(crc) => {
                                    self.send_hex_header(Header::from_number(
                                        ZFrameType::Crc,
                                        crc,
                                    ))?;
                                    // Stay here for the real ZRPOS.
                                }
                                Err(TransmissionError::NotSeekable) => {
                                    log::warn!(
                                        "cannot answer ZCRC for '{}', skipping",
                                        offer.name
                                    );
                                    self.send_hex_header(Header::empty(ZFrameType::Skip))?;
                                    self.handler.file_completed(
                                        &cur_info,
                                        0,
                                        Err(TransmissionError::NotSeekable),
                                    );
                                    state = SendState::NextFile;
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        ZFrameType::RInit => {
                            // The receiver answered our ZRQINIT again.
                            self.process_zrinit(&rx);
                        }
                        ZFrameType::Nak => {
                            retries += 1;
                            state = SendState::FileInfo;
                        }
                        got => {
                            return Err(TransmissionError::UnexpectedFrame {
                                expected: "ZRPOS/ZSKIP",
                                got,
                            })
                        }
                    }
                }

                SendState::Data => {
                    let Some(offer) = cur_offer.as_mut() else {
                        state = SendState::Fin;
                        continue;
                    };

                    self.send_bin_header_with_znulls(Header::from_number(
                        ZFrameType::Data,
                        file_offset as u32,
                    ))?;

                    let mut buf = vec![0u8; self.cfg.max_block_size];
                    let mut last_ack_offset = file_offset;
                    let mut subpacket_count: usize = 0;
                    let can_fdx = self.remote_flags & CANFDX != 0;

                    loop {
                        cancel.check()?;

                        // Opportunistic reverse-channel sample: only when
                        // something frame-like is already buffered.
                        if self.tr.peek_for_zpad() {
                            match self.recv_header() {
                                Err(err) if err.is_fatal() => return Err(err),
                                Err(err) => log::debug!("reverse channel read error: {err}"),
                                Ok(rx) => match rx.frame_type {
                                    ZFrameType::RPos => {
                                        let new_pos = u64::from(rx.pos());
                                        offer.seek_to(new_pos)?;
                                        file_offset = new_pos;
                                        bytes_sent = new_pos;
                                        flow.on_rewind();
                                        state = SendState::Data;
                                        continue 'machine;
                                    }
                                    ZFrameType::Ack => last_ack_offset = u64::from(rx.pos()),
                                    got => {
                                        log::debug!("unexpected reverse channel frame {got}");
                                    }
                                },
                            }
                        }

                        // Window gate: when the receiver advertised a finite
                        // buffer, never run more than a window ahead of its
                        // last acknowledged offset.
                        if self.remote_window > 0
                            && file_offset.saturating_sub(last_ack_offset)
                                >= self.remote_window as u64
                        {
                            // ZCRCQ needs CANFDX; otherwise close the frame
                            // with ZCRCW to force a response.
                            let window_end = if can_fdx { ZCRCQ } else { ZCRCW };
                            self.send_subpacket(&[], window_end)?;

                            let mut window_retries = 0;
                            loop {
                                match self.recv_header() {
                                    Err(err) if err.is_fatal() => return Err(err),
                                    Err(err) => {
                                        window_retries += 1;
                                        if window_retries >= self.cfg.max_retries {
                                            log::error!(
                                                "window flow control stalled: {err}"
                                            );
                                            return Err(TransmissionError::MaxRetriesExceeded(
                                                window_retries,
                                            ));
                                        }
                                        self.send_subpacket(&[], window_end)?;
                                        continue;
                                    }
                                    Ok(rx) => match rx.frame_type {
                                        ZFrameType::Ack => {
                                            last_ack_offset = u64::from(rx.pos());
                                            if window_end == ZCRCW {
                                                // ZCRCW ended the frame.
                                                state = SendState::Data;
                                                continue 'machine;
                                            }
                                        }
                                        ZFrameType::RPos => {
                                            let new_pos = u64::from(rx.pos());
                                            offer.seek_to(new_pos)?;
                                            file_offset = new_pos;
                                            bytes_sent = new_pos;
                                            flow.on_rewind();
                                            state = SendState::Data;
                                            continue 'machine;
                                        }
                                        got => {
                                            log::debug!("unexpected frame in window wait {got}");
                                            if window_end == ZCRCW {
                                                state = SendState::Data;
                                                continue 'machine;
                                            }
                                        }
                                    },
                                }
                                break;
                            }
                            if file_offset.saturating_sub(last_ack_offset)
                                >= self.remote_window as u64
                            {
                                continue;
                            }
                        }

                        let n = offer
                            .read(&mut buf[..flow.block_size])
                            .map_err(TransmissionError::Io)?;
                        if n == 0 {
                            // End of input: close the data frame, then ZEOF.
                            self.send_subpacket(&[], ZCRCE)?;
                            state = SendState::Eof;
                            continue 'machine;
                        }

                        let end_type = if flow.zcrcw_next {
                            ZCRCW
                        } else if can_fdx
                            && subpacket_count > 0
                            && subpacket_count % ZCRCQ_INTERVAL == 0
                        {
                            ZCRCQ
                        } else {
                            ZCRCG
                        };

                        self.send_subpacket(&buf[..n], end_type)?;
                        file_offset += n as u64;
                        bytes_sent = file_offset;
                        subpacket_count += 1;
                        flow.good_blocks += 1;

                        if end_type == ZCRCW {
                            // Synchronous checkpoint: wait for the matching
                            // ZACK before opening a fresh data frame.
                            loop {
                                match self.recv_header() {
                                    Err(err) if err.is_fatal() => return Err(err),
                                    Err(err) => {
                                        flow.zcrcw_retries += 1;
                                        if flow.zcrcw_retries >= self.cfg.max_retries {
                                            log::error!("ZCRCW flush stalled: {err}");
                                            return Err(TransmissionError::MaxRetriesExceeded(
                                                flow.zcrcw_retries,
                                            ));
                                        }
                                        continue;
                                    }
                                    Ok(rx) => match rx.frame_type {
                                        ZFrameType::Ack => {
                                            let ack_pos = u64::from(rx.pos());
                                            if ack_pos != file_offset {
                                                // Stale ZACK from before the
                                                // rewind; keep waiting.
                                                log::debug!(
                                                    "ignoring ZACK at {ack_pos}, want {file_offset}"
                                                );
                                                flow.zcrcw_retries += 1;
                                                if flow.zcrcw_retries >= self.cfg.max_retries {
                                                    return Err(
                                                        TransmissionError::MaxRetriesExceeded(
                                                            flow.zcrcw_retries,
                                                        ),
                                                    );
                                                }
                                                continue;
                                            }
                                            last_ack_offset = ack_pos;
                                            flow.zcrcw_next = false;
                                            flow.zcrcw_retries = 0;
                                        }
                                        ZFrameType::RPos => {
                                            let new_pos = u64::from(rx.pos());
                                            offer.seek_to(new_pos)?;
                                            file_offset = new_pos;
                                            bytes_sent = new_pos;
                                            flow.on_rewind();
                                        }
                                        got => {
                                            log::debug!("unexpected ZCRCW response {got}");
                                            flow.zcrcw_retries += 1;
                                            if flow.zcrcw_retries >= self.cfg.max_retries {
                                                return Err(
                                                    TransmissionError::MaxRetriesExceeded(
                                                        flow.zcrcw_retries,
                                                    ),
                                                );
                                            }
                                            continue;
                                        }
                                    },
                                }
                                break;
                            }
                            state = SendState::Data;
                            continue 'machine;
                        }

                        if end_type == ZCRCQ {
                            let mut zcrcq_retries = 0;
                            loop {
                                match self.recv_header() {
                                    Err(err) if err.is_fatal() => return Err(err),
                                    Err(_) => {
                                        zcrcq_retries += 1;
                                        if zcrcq_retries >= self.cfg.max_retries {
                                            return Err(TransmissionError::MaxRetriesExceeded(
                                                zcrcq_retries,
                                            ));
                                        }
                                        // Solicit again.
                                        self.send_subpacket(&[], ZCRCQ)?;
                                        continue;
                                    }
                                    Ok(rx) => match rx.frame_type {
                                        ZFrameType::Ack => {
                                            last_ack_offset = u64::from(rx.pos());
                                        }
                                        ZFrameType::RPos => {
                                            let new_pos = u64::from(rx.pos());
                                            offer.seek_to(new_pos)?;
                                            file_offset = new_pos;
                                            bytes_sent = new_pos;
                                            flow.on_rewind();
                                            state = SendState::Data;
                                            continue 'machine;
                                        }
                                        got => log::debug!("unexpected ZCRCQ response {got}"),
                                    },
                                }
                                break;
                            }
                        }

                        flow.adapt(self.cfg.max_block_size);
                        self.handler.file_progress(&cur_info, bytes_sent);
                    }
                }

                SendState::Eof => {
                    self.send_hex_header(Header::from_number(ZFrameType::Eof, file_offset as u32))?;
                    state = SendState::EofAck;
                }

                SendState::EofAck => {
                    let rx = self.recv_header_retry(cancel, &mut retries)?;
                    match rx.frame_type {
                        ZFrameType::RInit => {
                            self.handler.file_completed(&cur_info, bytes_sent, Ok(()));
                            self.process_zrinit(&rx);
                            state = SendState::NextFile;
                        }
                        ZFrameType::RPos => {
                            let Some(offer) = cur_offer.as_mut() else {
                                state = SendState::Fin;
                                continue;
                            };
                            let new_pos = u64::from(rx.pos());
                            offer.seek_to(new_pos)?;
                            file_offset = new_pos;
                            bytes_sent = new_pos;
                            flow.on_rewind();
                            state = SendState::Data;
                        }
                        ZFrameType::Nak => {
                            retries += 1;
                            state = SendState::Eof;
                        }
                        ZFrameType::Skip => {
                            self.handler.file_completed(
                                &cur_info,
                                bytes_sent,
                                Err(TransmissionError::Skipped),
                            );
                            state = SendState::NextFile;
                        }
                        got => {
                            return Err(TransmissionError::UnexpectedFrame {
                                expected: "ZRINIT after ZEOF",
                                got,
                            })
                        }
                    }
                }

                SendState::Fin => {
                    self.send_hex_header(Header::empty(ZFrameType::Fin))?;
                    state = SendState::FinAck;
                }

                SendState::FinAck => {
                    match self.recv_header_retry(cancel, &mut retries) {
                        Err(TransmissionError::Cancelled) => {
                            return Err(TransmissionError::Cancelled)
                        }
                        // No reply to ZFIN is fine; the batch is delivered.
                        Err(_) => state = SendState::Done,
                        Ok(rx) => match rx.frame_type {
                            ZFrameType::Fin => {
                                self.tw.write_raw(b"OO");
                                self.tw.flush(&mut self.io)?;
                                state = SendState::Done;
                            }
                            ZFrameType::Nak => {
                                retries += 1;
                                state = SendState::Fin;
                            }
                            _ => state = SendState::Done,
                        },
                    }
                }

                SendState::Done => {}
            }
        }

        Ok(())
    }

    /// Fold the receiver's ZRINIT into session state: capability flags,
    /// advertised window, CRC-32 and escape negotiation.
    fn process_zrinit(&mut self, hdr: &Header) {
        self.remote_flags = hdr.f0();
        self.remote_window = usize::from(hdr.data[0]) | usize::from(hdr.data[1]) << 8;

        if self.cfg.use_32bit_crc && self.remote_flags & CANFC32 != 0 {
            self.use_crc32 = true;
        }
        if self.remote_flags & ESCCTL != 0 {
            self.tw.set_escape_mode(EscapeMode::All);
        }
    }

    /// Receive a header, counting timeouts and garbled frames against the
    /// retry budget. Transport failures and aborts surface immediately.
    pub(crate) fn recv_header_retry(
        &mut self,
        cancel: &CancelToken,
        retries: &mut usize,
    ) -> TransferResult<Header> {
        loop {
            if *retries >= self.cfg.max_retries {
                return Err(TransmissionError::MaxRetriesExceeded(self.cfg.max_retries));
            }
            cancel.check()?;

            match self.recv_header() {
                Ok(hdr) => return Ok(hdr),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    *retries += 1;
                    log::debug!("header read error (retry {retries}): {err}");
                }
            }
        }
    }
}
