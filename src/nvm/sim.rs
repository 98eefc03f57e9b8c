//! Flash memory simulated in RAM, optionally backed by an image file.
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Result;

use super::{Nvm, NvmError, NvmRegion};
use crate::checksum::{Checksum, ChecksumKind, ChecksumRecord};
use crate::config::Profile;
use crate::hal::Memory;

const ERASED: u8 = 0xff;

pub struct FlashSim {
    profile: Profile,
    flash: Vec<u8>,
    ram: Vec<u8>,
    checksum: Checksum,
    /// Lowest and highest programmed address of the current session
    programmed: Option<(u32, u32)>,
    regions: Vec<Box<dyn NvmRegion>>,
    image: Option<PathBuf>,
}

impl FlashSim {
    /// Fully erased flash.
    pub fn new(profile: Profile, kind: ChecksumKind) -> Result<Self> {
        profile.validate()?;
        Ok(FlashSim {
            flash: vec![ERASED; profile.flash_size as usize],
            ram: vec![0; profile.ram_size as usize],
            checksum: Checksum::new(kind, profile.byte_order.endian()),
            programmed: None,
            regions: Vec::new(),
            image: None,
            profile,
        })
    }

    /// Flash contents are loaded from `path` if it exists, and saved back on `done`.
    pub fn with_image_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read(path)?;
            anyhow::ensure!(
                raw.len() == self.flash.len(),
                "image {} has {} bytes, expected {}",
                path.display(),
                raw.len(),
                self.flash.len()
            );
            self.flash = raw;
            log::info!("Loaded flash image {}", path.display());
        }
        self.image = Some(path.to_path_buf());
        Ok(self)
    }

    /// Chains a memory region in front of the flash.
    pub fn with_region(mut self, region: impl NvmRegion + 'static) -> Self {
        self.regions.push(Box::new(region));
        self
    }

    pub fn with_user_checksum(mut self, hook: crate::checksum::UserChecksum) -> Self {
        self.checksum = self.checksum.with_user(hook);
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    /// Addresses the host may program.
    pub fn app_range(&self) -> Range<u32> {
        self.profile.app_base()..self.profile.record_addr()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.image {
            std::fs::write(path, &self.flash)?;
            log::debug!("Saved flash image {}", path.display());
        }
        Ok(())
    }

    fn offset(&self, addr: u32) -> usize {
        (addr - self.profile.flash_base) as usize
    }

    fn contains(range: &Range<u32>, addr: u32, len: u32) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= range.start && end <= range.end,
            None => false,
        }
    }

    fn erase_sectors(&mut self, addr: u32, len: u32) {
        let sector = self.profile.sector_size;
        let base = self.profile.flash_base;
        let start = base + (addr - base) / sector * sector;
        let end = base + (addr + len - base).div_ceil(sector) * sector;
        let (start, end) = (self.offset(start), self.offset(end));
        self.flash[start..end].fill(ERASED);
        log::debug!("erased 0x{:08x}..0x{:08x}", base + start as u32, base + end as u32);
    }

    fn record(&self) -> Option<ChecksumRecord> {
        let at = self.offset(self.profile.record_addr());
        ChecksumRecord::from_bytes(&self.flash[at..at + ChecksumRecord::SIZE])
    }
}

impl Memory for FlashSim {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> bool {
        for region in self.regions.iter_mut() {
            if let Some(result) = region.read(addr, buf).into_result() {
                return result.is_ok();
            }
        }
        let len = buf.len() as u32;
        let flash = self.profile.flash_base..self.profile.flash_end();
        let ram = self.profile.ram_base..self.profile.ram_base + self.profile.ram_size;
        if Self::contains(&flash, addr, len) {
            let at = self.offset(addr);
            buf.copy_from_slice(&self.flash[at..at + buf.len()]);
            true
        } else if Self::contains(&ram, addr, len) {
            let at = (addr - ram.start) as usize;
            buf.copy_from_slice(&self.ram[at..at + buf.len()]);
            true
        } else {
            false
        }
    }

    fn store(&mut self, addr: u32, data: &[u8]) -> bool {
        let ram = self.profile.ram_base..self.profile.ram_base + self.profile.ram_size;
        if !Self::contains(&ram, addr, data.len() as u32) {
            return false;
        }
        let at = (addr - ram.start) as usize;
        self.ram[at..at + data.len()].copy_from_slice(data);
        true
    }
}

impl Nvm for FlashSim {
    fn init(&mut self) {
        self.programmed = None;
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), NvmError> {
        for region in self.regions.iter_mut() {
            if let Some(result) = region.write(addr, data).into_result() {
                return result;
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        if !Self::contains(&self.app_range(), addr, data.len() as u32) {
            log::warn!("write 0x{:08x}+{} out of range", addr, data.len());
            return Err(NvmError::OutOfRange);
        }
        let at = self.offset(addr);
        let target = &mut self.flash[at..at + data.len()];
        if let Some(i) = target
            .iter()
            .zip(data)
            .position(|(&cur, &new)| cur != ERASED && cur != new)
        {
            log::warn!("write to non-erased flash at 0x{:08x}", addr + i as u32);
            return Err(NvmError::Failed);
        }
        target.copy_from_slice(data);

        let last = addr + data.len() as u32 - 1;
        self.programmed = Some(match self.programmed {
            Some((lo, hi)) => (lo.min(addr), hi.max(last)),
            None => (addr, last),
        });
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), NvmError> {
        for region in self.regions.iter_mut() {
            if let Some(result) = region.erase(addr, len).into_result() {
                return result;
            }
        }
        if len == 0 {
            return Ok(());
        }
        if !Self::contains(&self.app_range(), addr, len) {
            log::warn!("erase 0x{:08x}+{} out of range", addr, len);
            return Err(NvmError::OutOfRange);
        }
        self.erase_sectors(addr, len);
        // the old record no longer describes the flash contents
        let record = self.profile.record_addr();
        self.erase_sectors(record, 1);
        Ok(())
    }

    fn write_checksum(&mut self) -> bool {
        let app = self.app_range();
        let (start, end) = match self.programmed {
            Some((lo, hi)) => (lo, hi + 1),
            None => (app.start, app.end),
        };
        let (from, to) = (self.offset(start), self.offset(end));
        let value = match self.checksum.compute(&self.flash[from..to]) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("cannot compute image checksum: {:?}", e);
                return false;
            }
        };
        let record = ChecksumRecord {
            kind: self.checksum.kind(),
            start,
            length: end - start,
            value,
        };
        let raw = match record.to_bytes() {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let at = self.profile.record_addr();
        self.erase_sectors(at, 1);
        let at = self.offset(at);
        self.flash[at..at + raw.len()].copy_from_slice(&raw);
        log::info!(
            "checksum record 0x{:08x}+{} = 0x{:08x}",
            record.start,
            record.length,
            record.value
        );
        true
    }

    fn verify_checksum(&mut self) -> bool {
        let Some(record) = self.record() else {
            log::debug!("no checksum record present");
            return false;
        };
        if !Self::contains(&self.app_range(), record.start, record.length) {
            return false;
        }
        let checksum = if record.kind == self.checksum.kind() {
            self.checksum
        } else {
            Checksum::new(record.kind, self.profile.byte_order.endian())
        };
        let from = self.offset(record.start);
        let data = &self.flash[from..from + record.length as usize];
        matches!(checksum.compute(data), Ok(value) if value == record.value)
    }

    fn done(&mut self) -> bool {
        let mut ok = true;
        for region in self.regions.iter_mut() {
            ok &= region.done();
        }
        if let Err(e) = self.save() {
            log::warn!("saving flash image failed: {}", e);
            ok = false;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileDB;
    use crate::nvm::NvmStatus;

    fn sim() -> FlashSim {
        let profile = ProfileDB::find("STM32F103C8").unwrap();
        FlashSim::new(profile, ChecksumKind::Crc32).unwrap()
    }

    #[test]
    fn starts_erased_without_valid_image() {
        let mut flash = sim();
        assert!(flash.flash().iter().all(|&b| b == 0xff));
        assert!(!flash.verify_checksum());
    }

    #[test]
    fn bootloader_area_is_out_of_range() {
        let mut flash = sim();
        assert_eq!(flash.erase(0x0800_0000, 1024), Err(NvmError::OutOfRange));
        assert_eq!(flash.write(0x0800_1ffc, &[0; 8]), Err(NvmError::OutOfRange));
        assert_eq!(flash.write(0x0800_fc00, &[0; 4]), Err(NvmError::OutOfRange));
    }

    #[test]
    fn erase_rounds_to_sectors() {
        let mut flash = sim();
        flash.init();
        flash.write(0x0800_2000, &[1, 2, 3, 4]).unwrap();
        flash.write(0x0800_2400, &[5, 6]).unwrap();
        flash.erase(0x0800_2002, 1).unwrap();
        let mut buf = [0u8; 4];
        assert!(flash.read(0x0800_2000, &mut buf));
        assert_eq!(buf, [0xff; 4]);
        assert!(flash.read(0x0800_2400, &mut buf[..2]));
        assert_eq!(buf[..2], [5, 6]);
    }

    #[test]
    fn repeated_write_is_idempotent() {
        let mut flash = sim();
        flash.write(0x0800_2000, &[0xaa, 0x55]).unwrap();
        flash.write(0x0800_2000, &[0xaa, 0x55]).unwrap();
        assert_eq!(flash.write(0x0800_2000, &[0xab, 0x55]), Err(NvmError::Failed));
    }

    #[test]
    fn checksum_record_round_trip() {
        let mut flash = sim();
        flash.init();
        flash.erase(0x0800_2000, 0x800).unwrap();
        flash.write(0x0800_2000, &[0x11; 64]).unwrap();
        flash.write(0x0800_2040, &[0x22; 16]).unwrap();
        assert!(flash.write_checksum());
        assert!(flash.done());
        assert!(flash.verify_checksum());

        let at = 0x2010;
        flash.flash_mut()[at] ^= 0x01;
        assert!(!flash.verify_checksum());
    }

    #[test]
    fn erase_invalidates_record() {
        let mut flash = sim();
        flash.write(0x0800_3000, &[1, 2, 3]).unwrap();
        assert!(flash.write_checksum());
        assert!(flash.verify_checksum());
        flash.erase(0x0800_8000, 1024).unwrap();
        assert!(!flash.verify_checksum());
    }

    #[test]
    fn ram_is_readable_and_writable() {
        let mut flash = sim();
        assert!(flash.store(0x2000_0010, &[9, 8, 7]));
        let mut buf = [0u8; 3];
        assert!(flash.read(0x2000_0010, &mut buf));
        assert_eq!(buf, [9, 8, 7]);
        assert!(!flash.store(0x0800_2000, &[1]));
        assert!(!flash.read(0x3000_0000, &mut buf));
    }

    struct Eeprom {
        base: u32,
        data: Vec<u8>,
    }

    impl NvmRegion for Eeprom {
        fn write(&mut self, addr: u32, data: &[u8]) -> NvmStatus {
            if addr < self.base || addr >= self.base + self.data.len() as u32 {
                return NvmStatus::NotInRange;
            }
            let at = (addr - self.base) as usize;
            match self.data.get_mut(at..at + data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    NvmStatus::Ok
                }
                None => NvmStatus::Error,
            }
        }

        fn erase(&mut self, addr: u32, _len: u32) -> NvmStatus {
            if addr < self.base {
                return NvmStatus::NotInRange;
            }
            NvmStatus::Ok
        }
    }

    #[test]
    fn chained_region_is_asked_first() {
        let mut flash = sim().with_region(Eeprom {
            base: 0x4000_0000,
            data: vec![0; 16],
        });
        assert_eq!(flash.write(0x4000_0000, &[1, 2]), Ok(()));
        assert_eq!(flash.write(0x4000_000f, &[1, 2]), Err(NvmError::Failed));
        assert_eq!(flash.write(0x0800_2000, &[1, 2]), Ok(()));
        assert_eq!(flash.flash()[0x2000..0x2002], [1, 2]);
    }
}
