//! Checksums over memory ranges, for BUILD_CHECKSUM and the image footer.

use anyhow::Result;
use crc::{CRC_16_ARC, CRC_16_IBM_3740, CRC_32_ISO_HDLC, Crc};
use scroll::{Endian, Pread, Pwrite};
use serde::{Deserialize, Serialize};

use crate::constants::checksum_types;

/// Checksum algorithms, named after their XCP checksum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// Bytes added into a byte
    Add11,
    /// Bytes added into a word
    Add12,
    /// Bytes added into a dword
    Add14,
    /// Words added into a word
    Add22,
    /// Words added into a dword
    Add24,
    /// Dwords added into a dword
    Add44,
    Crc16,
    Crc16Citt,
    Crc32,
    /// Product specific, see [`Checksum::with_user`]
    User,
}

impl ChecksumKind {
    pub fn code(self) -> u8 {
        match self {
            ChecksumKind::Add11 => checksum_types::ADD11,
            ChecksumKind::Add12 => checksum_types::ADD12,
            ChecksumKind::Add14 => checksum_types::ADD14,
            ChecksumKind::Add22 => checksum_types::ADD22,
            ChecksumKind::Add24 => checksum_types::ADD24,
            ChecksumKind::Add44 => checksum_types::ADD44,
            ChecksumKind::Crc16 => checksum_types::CRC16,
            ChecksumKind::Crc16Citt => checksum_types::CRC16_CITT,
            ChecksumKind::Crc32 => checksum_types::CRC32,
            ChecksumKind::User => checksum_types::USER,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            checksum_types::ADD11 => ChecksumKind::Add11,
            checksum_types::ADD12 => ChecksumKind::Add12,
            checksum_types::ADD14 => ChecksumKind::Add14,
            checksum_types::ADD22 => ChecksumKind::Add22,
            checksum_types::ADD24 => ChecksumKind::Add24,
            checksum_types::ADD44 => ChecksumKind::Add44,
            checksum_types::CRC16 => ChecksumKind::Crc16,
            checksum_types::CRC16_CITT => ChecksumKind::Crc16Citt,
            checksum_types::CRC32 => ChecksumKind::Crc32,
            checksum_types::USER => ChecksumKind::User,
            _ => return None,
        };
        Some(kind)
    }

    /// Granularity of the summed elements. Block sizes must be a multiple of it.
    pub fn element_size(self) -> usize {
        match self {
            ChecksumKind::Add22 | ChecksumKind::Add24 => 2,
            ChecksumKind::Add44 => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumError {
    /// Block size is not a multiple of the element size.
    Misaligned,
    /// [`ChecksumKind::User`] without a hook.
    NoUserHook,
}

/// Product specific checksum routine.
pub type UserChecksum = fn(&[u8]) -> u32;

#[derive(Debug, Clone, Copy)]
pub struct Checksum {
    kind: ChecksumKind,
    endian: Endian,
    user: Option<UserChecksum>,
}

impl Checksum {
    /// `endian` is used to assemble the words of the ADD2x and ADD44 variants.
    pub fn new(kind: ChecksumKind, endian: Endian) -> Self {
        Checksum {
            kind,
            endian,
            user: None,
        }
    }

    pub fn with_user(mut self, hook: UserChecksum) -> Self {
        self.user = Some(hook);
        self
    }

    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    pub fn compute(&self, data: &[u8]) -> Result<u32, ChecksumError> {
        if data.len() % self.kind.element_size() != 0 {
            return Err(ChecksumError::Misaligned);
        }
        let value = match self.kind {
            ChecksumKind::Add11 => add_bytes(data) & 0xff,
            ChecksumKind::Add12 => add_bytes(data) & 0xffff,
            ChecksumKind::Add14 => add_bytes(data),
            ChecksumKind::Add22 => self.add_words(data) & 0xffff,
            ChecksumKind::Add24 => self.add_words(data),
            ChecksumKind::Add44 => data
                .chunks_exact(4)
                .map(|c| {
                    let v: u32 = c.pread_with(0, self.endian).unwrap_or_default();
                    v
                })
                .fold(0u32, u32::wrapping_add),
            ChecksumKind::Crc16 => Crc::<u16>::new(&CRC_16_ARC).checksum(data) as u32,
            ChecksumKind::Crc16Citt => Crc::<u16>::new(&CRC_16_IBM_3740).checksum(data) as u32,
            ChecksumKind::Crc32 => Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data),
            ChecksumKind::User => match self.user {
                Some(hook) => hook(data),
                None => return Err(ChecksumError::NoUserHook),
            },
        };
        Ok(value)
    }

    fn add_words(&self, data: &[u8]) -> u32 {
        data.chunks_exact(2)
            .map(|c| {
                let v: u16 = c.pread_with(0, self.endian).unwrap_or_default();
                v as u32
            })
            .fold(0u32, u32::wrapping_add)
    }
}

fn add_bytes(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Integrity record stored behind the application image, checked on every boot.
///
/// Layout, little endian: magic:4, kind:1, reserved:3, start:4, length:4, value:4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub kind: ChecksumKind,
    pub start: u32,
    pub length: u32,
    pub value: u32,
}

impl ChecksumRecord {
    pub const MAGIC: u32 = 0x4250_4358;
    pub const SIZE: usize = 20;

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE]> {
        let mut buf = [0u8; Self::SIZE];
        buf.pwrite_with(Self::MAGIC, 0, scroll::LE)?;
        buf[4] = self.kind.code();
        buf.pwrite_with(self.start, 8, scroll::LE)?;
        buf.pwrite_with(self.length, 12, scroll::LE)?;
        buf.pwrite_with(self.value, 16, scroll::LE)?;
        Ok(buf)
    }

    /// None for erased or foreign footers.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let magic: u32 = raw.pread_with(0, scroll::LE).ok()?;
        if magic != Self::MAGIC {
            return None;
        }
        Some(ChecksumRecord {
            kind: ChecksumKind::from_code(*raw.get(4)?)?,
            start: raw.pread_with(8, scroll::LE).ok()?,
            length: raw.pread_with(12, scroll::LE).ok()?,
            value: raw.pread_with(16, scroll::LE).ok()?,
        })
    }
}
