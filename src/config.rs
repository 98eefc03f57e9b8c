//! Bootloader configuration and the simulated target profiles.
use std::path::Path;

use anyhow::Result;
use scroll::Endian;
use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumKind, ChecksumRecord};
use crate::constants::{
    BACKDOOR_ENTRY_TIMEOUT_MS, BYTE_TX_TIMEOUT_MS, MAX_PACKET_SIZE, RX_PACKET_TIMEOUT_MS,
    STATION_ID,
};
use crate::packet::Framing;

/// Byte order of multi-byte protocol fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Little endian
    #[default]
    Intel,
    /// Big endian
    Motorola,
}

impl ByteOrder {
    pub fn endian(self) -> Endian {
        match self {
            ByteOrder::Intel => scroll::LE,
            ByteOrder::Motorola => scroll::BE,
        }
    }

    /// Bit 0 of COMM_MODE_BASIC
    pub fn comm_mode(self) -> u8 {
        match self {
            ByteOrder::Intel => 0x00,
            ByteOrder::Motorola => 0x01,
        }
    }

    pub fn from_comm_mode(comm_mode: u8) -> Self {
        if comm_mode & 0x01 != 0 {
            ByteOrder::Motorola
        } else {
            ByteOrder::Intel
        }
    }
}

/// Settings of the bootloader engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Reported by GET_ID
    pub station_id: String,
    /// Max command packet length
    pub max_cto: usize,
    /// Max response packet length
    pub max_dto: usize,
    pub framing: Framing,
    pub byte_order: ByteOrder,

    pub programming: bool,
    pub calibration: bool,
    pub paging: bool,
    pub daq: bool,
    pub stim: bool,

    /// Protect the enabled resources with seed/key
    pub seed_key: bool,
    /// Disabled uploads answer with zeros
    pub upload: bool,

    /// Algorithm of BUILD_CHECKSUM
    pub build_checksum: ChecksumKind,
    /// Algorithm of the image checksum record
    pub image_checksum: ChecksumKind,

    pub rx_timeout_ms: u32,
    pub tx_timeout_ms: u32,
    pub backdoor_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            station_id: STATION_ID.to_string(),
            max_cto: MAX_PACKET_SIZE,
            max_dto: MAX_PACKET_SIZE,
            framing: Framing::default(),
            byte_order: ByteOrder::Intel,
            programming: true,
            calibration: false,
            paging: false,
            daq: false,
            stim: false,
            seed_key: false,
            upload: true,
            build_checksum: ChecksumKind::Add11,
            image_checksum: ChecksumKind::Crc32,
            rx_timeout_ms: RX_PACKET_TIMEOUT_MS,
            tx_timeout_ms: BYTE_TX_TIMEOUT_MS,
            backdoor_ms: BACKDOOR_ENTRY_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::format_err!("cannot read {}: {}", path.display(), e))?;
        Self::from_yaml_str(&raw)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (8..=255).contains(&self.max_cto),
            "max_cto must be within 8..=255, got {}",
            self.max_cto
        );
        anyhow::ensure!(
            (8..=255).contains(&self.max_dto),
            "max_dto must be within 8..=255, got {}",
            self.max_dto
        );
        anyhow::ensure!(!self.daq, "data acquisition is not supported");
        anyhow::ensure!(!self.stim, "data stimulation is not supported");
        anyhow::ensure!(
            self.station_id.is_ascii() && self.station_id.len() <= 255,
            "station id {:?} must be ASCII and at most 255 characters",
            self.station_id
        );
        anyhow::ensure!(
            self.rx_timeout_ms > 0 && self.tx_timeout_ms > 0,
            "timeouts must not be zero"
        );
        Ok(())
    }

    /// Resource bits reported by CONNECT
    pub fn resources(&self) -> u8 {
        use crate::constants::resources::*;

        let mut mask = 0;
        if self.calibration || self.paging {
            mask |= CALPAG;
        }
        if self.programming {
            mask |= PGM;
        }
        if self.daq {
            mask |= DAQ;
        }
        if self.stim {
            mask |= STIM;
        }
        mask
    }
}

/// A family of simulated targets, one YAML file each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub byte_order: ByteOrder,
    pub variants: Vec<Profile>,
}

/// Memory layout of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_base: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_size: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub sector_size: u32,
    /// Reserved at the start of flash
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub bootloader_size: u32,
    #[serde(default, deserialize_with = "parse_address_and_offset")]
    pub ram_base: u32,
    #[serde(default, deserialize_with = "parse_address_and_offset")]
    pub ram_size: u32,
    #[serde(default)]
    pub byte_order: ByteOrder,
}

impl ::std::fmt::Display for Profile {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}(flash 0x{:08x}+{}KiB)",
            self.name,
            self.flash_base,
            self.flash_size / 1024
        )
    }
}

impl Profile {
    pub fn flash_end(&self) -> u32 {
        self.flash_base + self.flash_size
    }

    /// First address available to the application.
    pub fn app_base(&self) -> u32 {
        self.flash_base + self.bootloader_size
    }

    /// The last sector holds the checksum record, the application ends before it.
    pub fn record_addr(&self) -> u32 {
        self.flash_end() - self.sector_size
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.sector_size > 0 && self.flash_size % self.sector_size == 0,
            "{}: flash size is not a multiple of the sector size",
            self.name
        );
        anyhow::ensure!(
            self.bootloader_size % self.sector_size == 0
                && self.bootloader_size + self.sector_size < self.flash_size,
            "{}: bootloader must occupy whole sectors",
            self.name
        );
        anyhow::ensure!(
            self.sector_size as usize >= ChecksumRecord::SIZE,
            "{}: sector too small for the checksum record",
            self.name
        );
        anyhow::ensure!(
            self.flash_base.checked_add(self.flash_size).is_some(),
            "{}: flash exceeds the address space",
            self.name
        );
        Ok(())
    }
}

pub struct ProfileDB {
    families: Vec<Family>,
}

impl ProfileDB {
    pub fn load() -> Result<Self> {
        Ok(ProfileDB {
            families: vec![
                serde_yaml::from_str(include_str!("../targets/stm32f1.yaml"))?,
                serde_yaml::from_str(include_str!("../targets/s32k14.yaml"))?,
            ],
        })
    }

    pub fn profiles(&self) -> impl Iterator<Item = (&Family, &Profile)> {
        self.families
            .iter()
            .flat_map(|f| f.variants.iter().map(move |p| (f, p)))
    }

    /// Case-insensitive lookup by variant name.
    pub fn find(name: &str) -> Result<Profile> {
        let db = ProfileDB::load()?;
        let (family, profile) = db
            .profiles()
            .find(|(_, p)| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow::format_err!("Cannot find target profile {:?}", name))?;
        log::debug!("Find target family: {}", family.name);

        let mut profile = profile.clone();
        if profile.byte_order == ByteOrder::default() {
            profile.byte_order = family.byte_order;
        }
        profile.validate()?;
        Ok(profile)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressOrOffset {
    Number(u32),
    Text(String),
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match AddressOrOffset::deserialize(deserializer)? {
        AddressOrOffset::Number(n) => Ok(n),
        AddressOrOffset::Text(s) => parse_number(&s).map_err(D::Error::custom),
    }
}

/// Parses `0x` hex, `K`/`KB`/`KiB` suffixed or decimal numbers.
pub fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(&hex.replace('_', ""), 16).ok()
    } else if let Some(kib) = ["KiB", "KB", "K"].iter().find_map(|sfx| s.strip_suffix(sfx)) {
        kib.trim()
            .parse::<u32>()
            .ok()
            .and_then(|k| k.checked_mul(1024))
    } else {
        s.replace('_', "").parse().ok()
    };
    parsed.ok_or_else(|| anyhow::format_err!("error while parsing {:?}", s))
}
