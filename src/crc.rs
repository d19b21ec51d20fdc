//! CRC-16/XMODEM and CRC-32/IEEE as used on the ZMODEM wire.
//!
//! CRC-16 covers hex headers, ZBIN headers and CRC-16 subpackets. The wire
//! carries the *augmented* form: after the payload, two zero octets are fed
//! through the register, so a receiver running the payload followed by the
//! received (big-endian) CRC through the same register ends on zero.
//!
//! CRC-32 covers ZBIN32 headers and CRC-32 subpackets, little-endian on the
//! wire, standard init/final-XOR semantics.

/// CRC-16/XMODEM: polynomial 0x1021, init 0, no reflection.
const CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &b in data {
        crc = (crc << 8) ^ CRC16_TABLE[(((crc >> 8) as u8) ^ b) as usize];
    }
    crc
}

/// Run two zero octets through the register (message augmentation).
pub fn crc16_finalize(crc: u16) -> u16 {
    crc16_update(crc, &[0, 0])
}

pub fn crc16_calc(data: &[u8]) -> u16 {
    crc16_finalize(crc16_update(0, data))
}

/// Verify payload followed by its big-endian augmented CRC: the register
/// must end on zero.
pub fn crc16_verify(data_and_crc: &[u8]) -> bool {
    crc16_update(0, data_and_crc) == 0
}

pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

pub fn crc32_calc(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// Verify payload followed by its little-endian CRC-32 trailer.
pub fn crc32_verify(data_and_crc: &[u8]) -> bool {
    if data_and_crc.len() < 4 {
        return false;
    }
    let split = data_and_crc.len() - 4;
    let received = u32::from_le_bytes(data_and_crc[split..].try_into().unwrap());
    crc32_calc(&data_and_crc[..split]) == received
}
