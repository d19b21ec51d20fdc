use crate::constants::{XON, ZCRCW, ZDLE};
use crate::crc::{crc16_finalize, crc16_update, crc32_update};
use crate::error::{TransferResult, TransmissionError};
use crate::session::{Session, Transport};

impl<T: Transport> Session<T> {
    /// Send a data subpacket closed by `end_type`. The CRC covers the data
    /// octets followed by the end-type octet.
    pub(crate) fn send_subpacket(&mut self, data: &[u8], end_type: u8) -> TransferResult<()> {
        self.tw.write_escaped(data);

        // The end marker travels as a ZDLE pair and is never escaped itself.
        self.tw.write_byte(ZDLE);
        self.tw.write_byte(end_type);

        if self.use_crc32 {
            let crc = crc32_update(crc32_update(0, data), &[end_type]);
            self.tw.write_escaped(&crc.to_le_bytes());
        } else {
            let crc = crc16_finalize(crc16_update(crc16_update(0, data), &[end_type]));
            self.tw.write_escaped_byte((crc >> 8) as u8);
            self.tw.write_escaped_byte((crc & 0xff) as u8);
        }

        // lrzsz expects an XON after ZCRCW so flow-controlled ttys resume.
        if end_type == ZCRCW {
            self.tw.write_byte(XON);
        }

        self.tw.flush(&mut self.io)?;
        Ok(())
    }

    /// Receive a data subpacket, returning its payload and end-type marker.
    /// `max_len` bounds the payload to keep a broken peer from growing the
    /// buffer without limit.
    pub(crate) fn recv_subpacket(&mut self, max_len: usize) -> TransferResult<(Vec<u8>, u8)> {
        let mut data = Vec::new();

        loop {
            let (b, frame_end) = self.tr.zdl_read(&mut self.io)?;

            if frame_end != 0 {
                self.verify_subpacket_crc(&data, frame_end)?;
                return Ok((data, frame_end));
            }

            if data.len() >= max_len {
                return Err(TransmissionError::SubpacketTooLong(max_len));
            }
            data.push(b);
        }
    }

    fn verify_subpacket_crc(&mut self, data: &[u8], end_type: u8) -> TransferResult<()> {
        if self.use_crc32 {
            let mut crc_buf = [0u8; 4];
            for b in crc_buf.iter_mut() {
                let (v, fe) = self.tr.zdl_read(&mut self.io)?;
                if fe != 0 {
                    return Err(TransmissionError::UnexpectedFrameEnd("subpacket CRC"));
                }
                *b = v;
            }
            let computed = crc32_update(crc32_update(0, data), &[end_type]);
            let received = u32::from_le_bytes(crc_buf);
            if computed != received {
                return Err(TransmissionError::Crc32Mismatch(computed, received));
            }
        } else {
            let mut crc_buf = [0u8; 2];
            for b in crc_buf.iter_mut() {
                let (v, fe) = self.tr.zdl_read(&mut self.io)?;
                if fe != 0 {
                    return Err(TransmissionError::UnexpectedFrameEnd("subpacket CRC"));
                }
                *b = v;
            }
            let computed = crc16_finalize(crc16_update(crc16_update(0, data), &[end_type]));
            let received = u16::from_be_bytes(crc_buf);
            if computed != received {
                return Err(TransmissionError::Crc16Mismatch(computed, received));
            }
        }
        Ok(())
    }
}
