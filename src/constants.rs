#![allow(dead_code)]

//
// Constants taken from:
//
//   Z M O D E M . H     Manifest constants for ZMODEM
//    application to application file transfer protocol
//    04-17-89  Chuck Forsberg Omen Technology Inc
//

pub const ZPAD: u8 = b'*'; // 052 Padding character begins frames
pub const ZDLE: u8 = 0x18; // Ctrl-X Zmodem escape - `ala BISYNC DLE
pub const ZDLEE: u8 = 0x58; // Escaped ZDLE as transmitted
pub const ZBIN: u8 = b'A'; // Binary frame indicator (CRC-16)
pub const ZHEX: u8 = b'B'; // HEX frame indicator
pub const ZBIN32: u8 = b'C'; // Binary frame with 32 bit FCS
pub const ZBINR32: u8 = b'D'; // RLE packed Binary frame with 32 bit FCS
pub const ZVBIN: u8 = b'a'; // Variable length binary frame (CRC-16)
pub const ZVHEX: u8 = b'b'; // Variable length HEX frame
pub const ZVBIN32: u8 = b'c'; // Variable length binary frame with 32 bit FCS
pub const ZVBINR32: u8 = b'd'; // Variable length RLE packed binary frame, 32 bit FCS
pub const ZRESC: u8 = 0x7e; // RLE flag/escape character

/// CAN is the cancel character; five consecutive CANs abort a session.
/// Same octet as ZDLE.
pub const CAN: u8 = 0x18;

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;

/* ZDLE sequences */
/// CRC next, frame ends, header packet follows
pub const ZCRCE: u8 = b'h';
/// CRC next, frame continues nonstop
pub const ZCRCG: u8 = b'i';
/// CRC next, frame continues, ZACK expected
pub const ZCRCQ: u8 = b'j';
/// CRC next, ZACK expected, end of frame
pub const ZCRCW: u8 = b'k';
pub const ZRUB0: u8 = b'l'; /* Translate to rubout 0177 */
pub const ZRUB1: u8 = b'm'; /* Translate to rubout 0377 */

pub mod frame_types {
    pub const ZRQINIT: u8 = 0; // Request receive init
    pub const ZRINIT: u8 = 1; // Receive init
    pub const ZSINIT: u8 = 2; // Send init sequence (optional)
    pub const ZACK: u8 = 3; // ACK to above
    pub const ZFILE: u8 = 4; // File name from sender
    pub const ZSKIP: u8 = 5; // To sender: skip this file
    pub const ZNAK: u8 = 6; // Last packet was garbled
    pub const ZABORT: u8 = 7; // Abort batch transfers
    pub const ZFIN: u8 = 8; // Finish session
    pub const ZRPOS: u8 = 9; // Resume data trans at this position
    pub const ZDATA: u8 = 10; // Data packet(s) follow
    pub const ZEOF: u8 = 11; // End of file
    pub const ZFERR: u8 = 12; // Fatal Read or Write error Detected
    pub const ZCRC: u8 = 13; // Request for file CRC and response
    pub const ZCHALLENGE: u8 = 14; // Receiver's Challenge
    pub const ZCOMPL: u8 = 15; // Request is complete
    pub const ZCAN: u8 = 16; // Other end canned session with CAN*5
    pub const ZFREECNT: u8 = 17; // Request for free bytes on filesystem
    pub const ZCOMMAND: u8 = 18; // Command from sending program
    pub const ZSTDERR: u8 = 19; // Output to standard error, data follows

    // Microsoft HyperTerminal extensions, recognized for logging only.
    pub const ZBADFMT: u8 = 20; // Data packet format error
    pub const ZMDM_ACKED: u8 = 21; // Reserved
    pub const ZMDM_VIRUS: u8 = 22; // Error due to virus
    pub const ZMDM_REFUSE: u8 = 23; // File refused, no reason given
    pub const ZMDM_OLDER: u8 = 24; // File refused, older than existing
    pub const ZMDM_INUSE: u8 = 25; // File is currently in use
    pub const ZMDM_CARRIER: u8 = 26; // Lost carrier
}

pub mod zrinit_flag {
    // Bit Masks for ZRINIT flags byte ZF0
    pub const CANFDX: u8 = 0x01; // Rx can send and receive true full duplex
    pub const CANOVIO: u8 = 0x02; // Rx can receive data during disk I/O
    pub const CANBRK: u8 = 0x04; // Rx can send a break signal
    pub const CANCRY: u8 = 0x08; // Receiver can decrypt
    pub const CANLZW: u8 = 0x10; // Receiver can uncompress
    pub const CANFC32: u8 = 0x20; // Receiver can use 32 bit Frame Check
    pub const ESCCTL: u8 = 0x40; // Receiver expects ctl chars to be escaped
    pub const ESC8: u8 = 0x80; // Receiver expects 8th bit to be escaped
}

pub mod zfile_flag {
    /* Conversion options, one of these in ZF0 */
    pub const ZCBIN: u8 = 1; /* Binary transfer - inhibit conversion */
    pub const ZCNL: u8 = 2; /* Convert NL to local end of line convention */
    pub const ZCRESUM: u8 = 3; /* Resume interrupted file transfer */

    /* Management options, one of these in ZF1 */
    pub const ZMMASK: u8 = 0x1f; /* Mask for the management choices */
    pub const ZMNEWL: u8 = 1; /* Transfer if source newer or longer */
    pub const ZMCRC: u8 = 2; /* Transfer if different file CRC or length */
    pub const ZMAPND: u8 = 3; /* Append contents to existing file (if any) */
    pub const ZMCLOB: u8 = 4; /* Replace existing file */
    pub const ZMNEW: u8 = 5; /* Transfer if source newer */
    pub const ZMSKNOLOC: u8 = 0x80; /* Skip file if not present at rx */
}

pub mod zsinit_flag {
    pub const TESCCTL: u8 = 0x40; // Transmitter expects ctl chars to be escaped
    pub const TESC8: u8 = 0x80; // Transmitter expects 8th bit to be escaped
}

/// Max length of an attention string carried in a ZSINIT subpacket.
pub const ZATTNLEN: usize = 32;

/// Attention string meta-characters.
pub const ATTN_BREAK: u8 = 0xDD; // Send a break signal to the remote
pub const ATTN_PAUSE: u8 = 0xDE; // Pause one second

/// Sent before ZRQINIT so terminal emulators (minicom, SyncTerm, Tera Term)
/// trigger their auto-download.
pub const AUTO_DOWNLOAD: &[u8] = b"rz\r";

pub const ABORT_SEQ: [u8; 18] = [
    0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, /* 8 CAN */
    0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, /* 10 BS */
];

/// Human readable frame type name for logging.
pub fn frame_type_name(ft: u8) -> &'static str {
    use frame_types::*;
    match ft {
        ZRQINIT => "ZRQINIT",
        ZRINIT => "ZRINIT",
        ZSINIT => "ZSINIT",
        ZACK => "ZACK",
        ZFILE => "ZFILE",
        ZSKIP => "ZSKIP",
        ZNAK => "ZNAK",
        ZABORT => "ZABORT",
        ZFIN => "ZFIN",
        ZRPOS => "ZRPOS",
        ZDATA => "ZDATA",
        ZEOF => "ZEOF",
        ZFERR => "ZFERR",
        ZCRC => "ZCRC",
        ZCHALLENGE => "ZCHALLENGE",
        ZCOMPL => "ZCOMPL",
        ZCAN => "ZCAN",
        ZFREECNT => "ZFREECNT",
        ZCOMMAND => "ZCOMMAND",
        ZSTDERR => "ZSTDERR",
        ZBADFMT => "ZBADFMT",
        ZMDM_ACKED => "ZMDM_ACKED",
        ZMDM_VIRUS => "ZMDM_VIRUS",
        ZMDM_REFUSE => "ZMDM_REFUSE",
        ZMDM_OLDER => "ZMDM_OLDER",
        ZMDM_INUSE => "ZMDM_INUSE",
        ZMDM_CARRIER => "ZMDM_CARRIER",
        _ => "UNKNOWN",
    }
}
