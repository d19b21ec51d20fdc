//! ZDLE escape classification.

use crate::constants::{XOFF, XON, ZDLE};

/// Which bytes get ZDLE-escaped on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscapeMode {
    /// Standard ZMODEM/ZedZap set.
    #[default]
    Standard,
    /// Escape all control characters, for hostile transports (ESCCTL).
    All,
    /// DirZap: escape only ZDLE itself.
    Minimal,
}

/// Escape table values.
pub(crate) const ESC_SEND: u8 = 0; // send directly
pub(crate) const ESC_MUST: u8 = 1; // must escape (ZDLE + b^0x40)
pub(crate) const ESC_IF_AT_CR: u8 = 2; // escape only after '@'/0xC0 (Telenet CR protection)

/// Build the 256-entry ZDLE escape lookup table for a mode.
pub(crate) fn build_escape_table(mode: EscapeMode) -> [u8; 256] {
    let mut table = [ESC_SEND; 256];

    if mode == EscapeMode::Minimal {
        table[ZDLE as usize] = ESC_MUST;
        return table;
    }

    // Always escaped regardless of mode: ZDLE, DLE, XON, XOFF and their
    // high-bit variants.
    table[ZDLE as usize] = ESC_MUST; // 0x18
    table[0x10] = ESC_MUST; // DLE
    table[XON as usize] = ESC_MUST; // 0x11
    table[XOFF as usize] = ESC_MUST; // 0x13
    table[0x90] = ESC_MUST;
    table[0x91] = ESC_MUST;
    table[0x93] = ESC_MUST;
    table[0x98] = ESC_MUST;

    // CR and CR|0x80: escape only when the previously transmitted octet was
    // '@' or 0xC0.
    table[0x0d] = ESC_IF_AT_CR;
    table[0x8d] = ESC_IF_AT_CR;

    if mode == EscapeMode::All {
        // All control chars 0x00-0x1F and their high-bit variants. 0x7F and
        // 0xFF stay raw: ZDLE+XOR cannot represent them, lrzsz sends them
        // unescaped too.
        for i in 0..32 {
            if table[i] == ESC_SEND {
                table[i] = ESC_MUST;
            }
            if table[i | 0x80] == ESC_SEND {
                table[i | 0x80] = ESC_MUST;
            }
        }
    }

    table
}

/// Does `b` need escaping, given the last octet actually put on the wire?
pub(crate) fn escape_required(table: &[u8; 256], b: u8, last_sent: u8) -> bool {
    match table[b as usize] {
        ESC_MUST => true,
        ESC_IF_AT_CR => last_sent == b'@' || last_sent == 0xc0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table() {
        let table = build_escape_table(EscapeMode::Standard);

        for b in [ZDLE, 0x10, XON, XOFF, 0x90, 0x91, 0x93, 0x98] {
            assert_eq!(table[b as usize], ESC_MUST, "byte 0x{b:02X}");
        }
        assert_eq!(table[0x0d], ESC_IF_AT_CR);
        assert_eq!(table[0x8d], ESC_IF_AT_CR);
        assert_eq!(table[b'A' as usize], ESC_SEND);
        assert_eq!(table[0x7f], ESC_SEND);
        assert_eq!(table[0xff], ESC_SEND);
    }

    #[test]
    fn escape_all_table() {
        let table = build_escape_table(EscapeMode::All);

        for i in 0..32usize {
            if i == 0x0d {
                continue;
            }
            assert_eq!(table[i], ESC_MUST, "byte 0x{i:02X}");
            assert_eq!(table[i | 0x80], ESC_MUST, "byte 0x{:02X}", i | 0x80);
        }
        // DEL and 0xFF stay raw even here
        assert_eq!(table[0x7f], ESC_SEND);
        assert_eq!(table[0xff], ESC_SEND);
    }

    #[test]
    fn minimal_table() {
        let table = build_escape_table(EscapeMode::Minimal);

        assert_eq!(table[ZDLE as usize], ESC_MUST);
        for i in 0..256usize {
            if i == ZDLE as usize {
                continue;
            }
            assert_eq!(table[i], ESC_SEND, "byte 0x{i:02X}");
        }
    }

    #[test]
    fn conditional_cr() {
        let table = build_escape_table(EscapeMode::Standard);

        assert!(escape_required(&table, ZDLE, 0));
        assert!(escape_required(&table, 0x0d, b'@'));
        assert!(escape_required(&table, 0x0d, 0xc0));
        assert!(!escape_required(&table, 0x0d, b'A'));
        assert!(!escape_required(&table, b'Z', 0));
    }
}
