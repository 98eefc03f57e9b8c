//! Wire-level constants of the XCP bootloader protocol.

/// Default max CTO/DTO length on byte-stream links.
pub const MAX_PACKET_SIZE: usize = 64;

/// Default max packet length on frame links (one CAN frame).
pub const MAX_FRAME_PACKET_SIZE: usize = 8;

/// XCP protocol layer version, 16 bit.
pub const PROTOCOL_LAYER_VERSION: u16 = 0x0100;
/// XCP transport layer version, 16 bit.
pub const TRANSPORT_LAYER_VERSION: u16 = 0x0100;

/// Station id reported by GET_ID unless configured otherwise.
pub const STATION_ID: &str = "XCPBOOT";

pub const RX_PACKET_TIMEOUT_MS: u32 = 100;
pub const BYTE_TX_TIMEOUT_MS: u32 = 10;
pub const BACKDOOR_ENTRY_TIMEOUT_MS: u32 = 500;

/// USB bulk interface of the bootloader
pub const USB_VENDOR_ID: u16 = 0x1d50;
pub const USB_PRODUCT_ID: u16 = 0x60ac;

pub mod commands {
    pub const CONNECT: u8 = 0xff;
    pub const DISCONNECT: u8 = 0xfe;
    pub const GET_STATUS: u8 = 0xfd;
    pub const SYNCH: u8 = 0xfc;
    pub const GET_ID: u8 = 0xfa;
    pub const GET_SEED: u8 = 0xf8;
    pub const UNLOCK: u8 = 0xf7;
    pub const SET_MTA: u8 = 0xf6;
    pub const UPLOAD: u8 = 0xf5;
    pub const SHORT_UPLOAD: u8 = 0xf4;
    pub const BUILD_CHECKSUM: u8 = 0xf3;
    pub const DOWNLOAD: u8 = 0xf0;
    pub const DOWNLOAD_MAX: u8 = 0xee;
    pub const SET_CAL_PAGE: u8 = 0xeb;
    pub const GET_CAL_PAGE: u8 = 0xea;
    pub const PROGRAM_START: u8 = 0xd2;
    pub const PROGRAM_CLEAR: u8 = 0xd1;
    pub const PROGRAM: u8 = 0xd0;
    pub const PROGRAM_RESET: u8 = 0xcf;
    pub const PROGRAM_PREPARE: u8 = 0xcc;
    pub const PROGRAM_MAX: u8 = 0xc9;
}

/// Packet identifiers of target to host packets
pub mod pid {
    pub const RES: u8 = 0xff;
    pub const ERR: u8 = 0xfe;
}

pub mod resources {
    /// CALibration and PAGing
    pub const CALPAG: u8 = 0x01;
    /// Data AcQuisition
    pub const DAQ: u8 = 0x04;
    /// data STIMulation
    pub const STIM: u8 = 0x08;
    /// ProGraMming
    pub const PGM: u8 = 0x10;
}

pub mod checksum_types {
    pub const ADD11: u8 = 0x01;
    pub const ADD12: u8 = 0x02;
    pub const ADD14: u8 = 0x03;
    pub const ADD22: u8 = 0x04;
    pub const ADD24: u8 = 0x05;
    pub const ADD44: u8 = 0x06;
    pub const CRC16: u8 = 0x07;
    pub const CRC16_CITT: u8 = 0x08;
    pub const CRC32: u8 = 0x09;
    pub const USER: u8 = 0xff;
}

/// Error codes of ERR packets
pub mod errors {
    pub const CMD_SYNCH: u8 = 0x00;
    pub const CMD_BUSY: u8 = 0x10;
    pub const CMD_UNKNOWN: u8 = 0x20;
    pub const OUT_OF_RANGE: u8 = 0x22;
    pub const ACCESS_LOCKED: u8 = 0x25;
    pub const PAGE_NOT_VALID: u8 = 0x26;
    pub const SEQUENCE: u8 = 0x29;
    pub const GENERIC: u8 = 0x31;
}
