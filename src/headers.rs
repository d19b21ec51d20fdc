use std::fmt::Display;

use crate::constants::{frame_type_name, frame_types, CR, LF, XON, ZBIN, ZBIN32, ZDLE, ZHEX, ZPAD};
use crate::crc::{crc16_calc, crc16_verify, crc32_calc, crc32_verify};
use crate::error::{TransferResult, TransmissionError};
use crate::session::{Session, Transport};

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum HeaderType {
    Bin,
    Bin32,
    Hex,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ZFrameType {
    /// Request receive init (s->r)
    RqInit = 0,
    /// Receive init (r->s)
    RInit = 1,
    /// Send init sequence, optional (s->r)
    SInit = 2,
    /// ACK to RQInit, RInit or SInit (s<->r)
    Ack = 3,
    /// File name from sender (s->r)
    File = 4,
    /// To sender: skip this file (r->s)
    Skip = 5,
    /// Last packet was garbled
    Nak = 6,
    /// Abort batch transfers
    Abort = 7,
    /// Finish session (s<->r)
    Fin = 8,
    /// Resume data trans at this position (r->s)
    RPos = 9,
    /// Data packet(s) follow (s->r)
    Data = 10,
    /// End of file (s->r)
    Eof = 11,
    /// Fatal read or write error detected
    FErr = 12,
    /// Request for file CRC and response
    Crc = 13,
    /// Receiver's challenge (r->s)
    Challenge = 14,
    /// Request is complete
    Compl = 15,
    /// Other end canned session with CAN*5
    Can = 16,
    /// Request for free bytes on filesystem (s->r)
    FreeCnt = 17,
    /// Command from sending program (s->r)
    Command = 18,
    /// Output to standard error, data follows
    StdErr = 19,

    // Microsoft HyperTerminal extensions, recognized for logging only. The
    // state machines never expect them and fall through to their ordinary
    // unexpected-frame handling.
    /// Data packet format error
    BadFmt = 20,
    /// Reserved
    MdmAcked = 21,
    /// Error due to virus
    MdmVirus = 22,
    /// File refused, no reason given
    MdmRefuse = 23,
    /// File refused, older than existing
    MdmOlder = 24,
    /// File is currently in use
    MdmInUse = 25,
    /// Lost carrier
    MdmCarrier = 26,
}

impl Display for ZFrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(frame_type_name(*self as u8))
    }
}

/// A ZMODEM frame header: type plus 4 octets interpreted either as a
/// little-endian position or as the flag bytes ZF0..ZF3.
///
/// The two views run in opposite byte orders over the same payload:
/// position byte 0 is `data[0]`, but ZF0 is `data[3]` and ZF3 is `data[0]`.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Header {
    /// Wire encoding this header arrived in; `Hex` on locally built headers
    /// until a send routine picks the encoding.
    pub encoding: HeaderType,
    pub frame_type: ZFrameType,
    pub data: [u8; 4],
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.frame_type {
            ZFrameType::RPos | ZFrameType::Eof | ZFrameType::Data | ZFrameType::FreeCnt => {
                write!(f, "[{} pos={}]", self.frame_type, self.pos())
            }
            ZFrameType::Crc | ZFrameType::Challenge | ZFrameType::Ack => {
                write!(f, "[{} value=x{:08X}]", self.frame_type, self.pos())
            }
            _ => write!(
                f,
                "[{} flags=x{:02X},x{:02X},x{:02X},x{:02X}]",
                self.frame_type,
                self.f3(),
                self.f2(),
                self.f1(),
                self.f0()
            ),
        }
    }
}

impl Header {
    pub fn empty(frame_type: ZFrameType) -> Self {
        Self {
            encoding: HeaderType::Hex,
            frame_type,
            data: [0, 0, 0, 0],
        }
    }

    pub fn from_flags(frame_type: ZFrameType, f3: u8, f2: u8, f1: u8, f0: u8) -> Self {
        Self {
            encoding: HeaderType::Hex,
            frame_type,
            data: [f3, f2, f1, f0],
        }
    }

    pub fn from_number(frame_type: ZFrameType, number: u32) -> Self {
        Self {
            encoding: HeaderType::Hex,
            frame_type,
            data: u32::to_le_bytes(number),
        }
    }

    pub fn f0(&self) -> u8 {
        self.data[3]
    }
    pub fn f1(&self) -> u8 {
        self.data[2]
    }
    pub fn f2(&self) -> u8 {
        self.data[1]
    }
    pub fn f3(&self) -> u8 {
        self.data[0]
    }

    pub fn set_f0(&mut self, v: u8) {
        self.data[3] = v;
    }
    pub fn set_f1(&mut self, v: u8) {
        self.data[2] = v;
    }
    pub fn set_f2(&mut self, v: u8) {
        self.data[1] = v;
    }
    pub fn set_f3(&mut self, v: u8) {
        self.data[0] = v;
    }

    /// Header data as a 32-bit file position (little-endian).
    pub fn pos(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.data = u32::to_le_bytes(pos);
    }

    fn get_frame_type(ft: u8) -> TransferResult<ZFrameType> {
        match ft {
            frame_types::ZRQINIT => Ok(ZFrameType::RqInit),
            frame_types::ZRINIT => Ok(ZFrameType::RInit),
            frame_types::ZSINIT => Ok(ZFrameType::SInit),
            frame_types::ZACK => Ok(ZFrameType::Ack),
            frame_types::ZFILE => Ok(ZFrameType::File),
            frame_types::ZSKIP => Ok(ZFrameType::Skip),
            frame_types::ZNAK => Ok(ZFrameType::Nak),
            frame_types::ZABORT => Ok(ZFrameType::Abort),
            frame_types::ZFIN => Ok(ZFrameType::Fin),
            frame_types::ZRPOS => Ok(ZFrameType::RPos),
            frame_types::ZDATA => Ok(ZFrameType::Data),
            frame_types::ZEOF => Ok(ZFrameType::Eof),
            frame_types::ZFERR => Ok(ZFrameType::FErr),
            frame_types::ZCRC => Ok(ZFrameType::Crc),
            frame_types::ZCHALLENGE => Ok(ZFrameType::Challenge),
            frame_types::ZCOMPL => Ok(ZFrameType::Compl),
            frame_types::ZCAN => Ok(ZFrameType::Can),
            frame_types::ZFREECNT => Ok(ZFrameType::FreeCnt),
            frame_types::ZCOMMAND => Ok(ZFrameType::Command),
            frame_types::ZSTDERR => Ok(ZFrameType::StdErr),
            frame_types::ZBADFMT => Ok(ZFrameType::BadFmt),
            frame_types::ZMDM_ACKED => Ok(ZFrameType::MdmAcked),
            frame_types::ZMDM_VIRUS => Ok(ZFrameType::MdmVirus),
            frame_types::ZMDM_REFUSE => Ok(ZFrameType::MdmRefuse),
            frame_types::ZMDM_OLDER => Ok(ZFrameType::MdmOlder),
            frame_types::ZMDM_INUSE => Ok(ZFrameType::MdmInUse),
            frame_types::ZMDM_CARRIER => Ok(ZFrameType::MdmCarrier),
            _ => Err(TransmissionError::InvalidFrameType(ft)),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Send a HEX-encoded header:
    /// `ZPAD ZPAD ZDLE ZHEX <type> <data[0..3]> <crc16> CR LF [XON]`,
    /// everything as two lowercase hex digits, always CRC-16.
    pub(crate) fn send_hex_header(&mut self, hdr: Header) -> TransferResult<()> {
        log::debug!("send hex header {hdr}");

        self.tw.write_raw(&[ZPAD, ZPAD, ZDLE, ZHEX]);

        let mut payload = [0u8; 5];
        payload[0] = hdr.frame_type as u8;
        payload[1..].copy_from_slice(&hdr.data);

        let crc = crc16_calc(&payload);

        for b in payload {
            self.tw.write_hex(b);
        }
        // CRC high byte first
        self.tw.write_hex((crc >> 8) as u8);
        self.tw.write_hex((crc & 0xff) as u8);

        self.tw.write_byte(CR);
        self.tw.write_byte(LF);

        // XON wakes flow-controlled senders; ZACK and ZFIN go without.
        if hdr.frame_type != ZFrameType::Ack && hdr.frame_type != ZFrameType::Fin {
            self.tw.write_byte(XON);
        }

        self.tw.flush(&mut self.io)?;
        Ok(())
    }

    /// Send a binary header, ZBIN or ZBIN32 depending on the negotiated CRC
    /// mode: `ZPAD ZDLE <enc> <type-escaped> <data-escaped> <crc-escaped>`.
    pub(crate) fn send_bin_header(&mut self, hdr: Header) -> TransferResult<()> {
        log::debug!("send bin header {hdr} crc32={}", self.use_crc32);

        let enc = if self.use_crc32 { ZBIN32 } else { ZBIN };
        self.tw.write_raw(&[ZPAD, ZDLE, enc]);

        let mut payload = [0u8; 5];
        payload[0] = hdr.frame_type as u8;
        payload[1..].copy_from_slice(&hdr.data);

        self.tw.write_escaped(&payload);

        if self.use_crc32 {
            let crc = crc32_calc(&payload);
            self.tw.write_escaped(&crc.to_le_bytes());
        } else {
            let crc = crc16_calc(&payload);
            self.tw.write_escaped_byte((crc >> 8) as u8);
            self.tw.write_escaped_byte((crc & 0xff) as u8);
        }

        self.tw.flush(&mut self.io)?;
        Ok(())
    }

    /// Send `znulls` raw zero octets, then a binary header. Used before
    /// ZDATA for modem turnaround.
    pub(crate) fn send_bin_header_with_znulls(&mut self, hdr: Header) -> TransferResult<()> {
        if self.cfg.znulls > 0 {
            let nulls = vec![0u8; self.cfg.znulls];
            self.tw.write_raw(&nulls);
        }
        self.send_bin_header(hdr)
    }

    /// Receive and decode the next frame header, auto-detecting
    /// HEX/ZBIN/ZBIN32 encoding.
    pub(crate) fn recv_header(&mut self) -> TransferResult<Header> {
        let enc = self.tr.scan_for_pad(&mut self.io)?;

        let hdr = match enc {
            ZHEX => self.recv_hex_header()?,
            ZBIN => self.recv_bin_header(false)?,
            ZBIN32 => self.recv_bin_header(true)?,
            _ => return Err(TransmissionError::UnsupportedEncoding(enc)),
        };

        self.tr.reset_garbage();
        log::debug!("recv header {hdr} enc=0x{enc:02x}");

        if hdr.frame_type as u8 > frame_types::ZSTDERR {
            log::warn!("received HyperTerminal extended frame type {}", hdr.frame_type);
        }

        Ok(hdr)
    }

    fn recv_hex_header(&mut self) -> TransferResult<Header> {
        // type + 4 data bytes + 2 CRC bytes, hex-encoded
        let mut raw = [0u8; 7];
        for b in raw.iter_mut() {
            *b = self.tr.read_hex(&mut self.io)?;
        }

        if !crc16_verify(&raw) {
            let computed = crc16_calc(&raw[..5]);
            let received = u16::from_be_bytes([raw[5], raw[6]]);
            return Err(TransmissionError::Crc16Mismatch(computed, received));
        }

        let hdr = Header {
            encoding: HeaderType::Hex,
            frame_type: Header::get_frame_type(raw[0])?,
            data: [raw[1], raw[2], raw[3], raw[4]],
        };

        // CR LF terminator with parity stripped; a lone LF is tolerated.
        let cr = self.tr.read_byte(&mut self.io)? & 0x7f;
        if cr != CR {
            if cr == LF {
                return Ok(hdr);
            }
            return Err(TransmissionError::BadHexTerminator("CR", cr));
        }
        let lf = self.tr.read_byte(&mut self.io)? & 0x7f;
        if lf != LF {
            return Err(TransmissionError::BadHexTerminator("LF", lf));
        }

        // A trailing XON may follow (except after ZACK/ZFIN). Only consume
        // it when already buffered so we never block for it.
        if hdr.frame_type != ZFrameType::Ack && hdr.frame_type != ZFrameType::Fin {
            if let Some(b) = self.tr.peek_byte() {
                if b & 0x7f == XON {
                    let _ = self.tr.read_byte(&mut self.io)?;
                }
            }
        }

        Ok(hdr)
    }

    fn recv_bin_header(&mut self, crc32_mode: bool) -> TransferResult<Header> {
        let mut payload = [0u8; 5];
        for b in payload.iter_mut() {
            let (v, frame_end) = self.tr.zdl_read(&mut self.io)?;
            if frame_end != 0 {
                return Err(TransmissionError::UnexpectedFrameEnd("binary header"));
            }
            *b = v;
        }

        if crc32_mode {
            let mut crc_buf = [0u8; 4];
            for b in crc_buf.iter_mut() {
                let (v, frame_end) = self.tr.zdl_read(&mut self.io)?;
                if frame_end != 0 {
                    return Err(TransmissionError::UnexpectedFrameEnd("binary header CRC"));
                }
                *b = v;
            }
            let mut all = [0u8; 9];
            all[..5].copy_from_slice(&payload);
            all[5..].copy_from_slice(&crc_buf);
            if !crc32_verify(&all) {
                let computed = crc32_calc(&payload);
                let received = u32::from_le_bytes(crc_buf);
                return Err(TransmissionError::Crc32Mismatch(computed, received));
            }
        } else {
            let mut crc_buf = [0u8; 2];
            for b in crc_buf.iter_mut() {
                let (v, frame_end) = self.tr.zdl_read(&mut self.io)?;
                if frame_end != 0 {
                    return Err(TransmissionError::UnexpectedFrameEnd("binary header CRC"));
                }
                *b = v;
            }
            let mut all = [0u8; 7];
            all[..5].copy_from_slice(&payload);
            all[5..].copy_from_slice(&crc_buf);
            if !crc16_verify(&all) {
                let computed = crc16_calc(&payload);
                let received = u16::from_be_bytes(crc_buf);
                return Err(TransmissionError::Crc16Mismatch(computed, received));
            }
        }

        Ok(Header {
            encoding: if crc32_mode {
                HeaderType::Bin32
            } else {
                HeaderType::Bin
            },
            frame_type: Header::get_frame_type(payload[0])?,
            data: [payload[1], payload[2], payload[3], payload[4]],
        })
    }
}
