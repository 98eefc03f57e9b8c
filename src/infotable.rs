//! Firmware info table check.
//!
//! Application images can carry a small table at a fixed address, e.g. a product id
//! and a version. While an image is programmed the bytes written into the table range
//! are collected, and before the checksum record is written the new table is compared
//! with the one of the firmware already present. A rejected image never gets a valid
//! checksum record, so the bootloader does not start it.

use std::fmt;

use crate::nvm::Nvm;

/// Decides whether a new firmware may replace the present one.
pub trait InfoTableCheck {
    fn check(&mut self, new: &[u8], current: &[u8]) -> bool;
}

impl<F: FnMut(&[u8], &[u8]) -> bool> InfoTableCheck for F {
    fn check(&mut self, new: &[u8], current: &[u8]) -> bool {
        self(new, current)
    }
}

pub struct InfoTable {
    addr: u32,
    new: Vec<u8>,
    /// Table of the firmware present at PROGRAM_START, if it was valid
    current: Option<Vec<u8>>,
    hook: Box<dyn InfoTableCheck>,
}

impl fmt::Debug for InfoTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoTable(0x{:08x}+{})", self.addr, self.new.len())
    }
}

impl InfoTable {
    pub fn new(addr: u32, len: usize, hook: impl InfoTableCheck + 'static) -> Self {
        InfoTable {
            addr,
            new: vec![0; len],
            current: None,
            hook: Box::new(hook),
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
    }

    /// Start of a programming session, before anything is erased.
    pub fn begin(&mut self, nvm: &mut dyn Nvm) {
        self.new.fill(0);
        self.current = None;
        if !nvm.verify_checksum() {
            log::debug!("no valid firmware present, info table not compared");
            return;
        }
        let mut current = vec![0; self.new.len()];
        if nvm.read(self.addr, &mut current) {
            self.current = Some(current);
        } else {
            log::warn!("reading the info table at 0x{:08x} failed", self.addr);
        }
    }

    /// Keeps the part of a written block that falls into the table.
    pub fn collect(&mut self, addr: u32, data: &[u8]) {
        let start = u64::from(self.addr);
        let end = start + self.new.len() as u64;
        let from = u64::from(addr).max(start);
        let to = (u64::from(addr) + data.len() as u64).min(end);
        if from >= to {
            return;
        }
        let src = (from - u64::from(addr)) as usize;
        let dst = (from - start) as usize;
        let n = (to - from) as usize;
        self.new[dst..dst + n].copy_from_slice(&data[src..src + n]);
    }

    /// True if the new firmware is accepted. Passes when no valid firmware was present.
    pub fn check(&mut self) -> bool {
        match &self.current {
            Some(current) => {
                let accepted = self.hook.check(&self.new, current);
                if !accepted {
                    log::warn!(
                        "info table {} rejected, present firmware has {}",
                        hex::encode(&self.new),
                        hex::encode(current)
                    );
                }
                accepted
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::hal::Memory;
    use crate::nvm::NvmError;

    struct Image {
        valid: bool,
        table: [u8; 4],
    }

    impl Memory for Image {
        fn read(&mut self, addr: u32, buf: &mut [u8]) -> bool {
            assert_eq!(addr, 0x100);
            buf.copy_from_slice(&self.table[..buf.len()]);
            true
        }
    }

    impl Nvm for Image {
        fn init(&mut self) {}

        fn write(&mut self, _addr: u32, _data: &[u8]) -> Result<(), NvmError> {
            Ok(())
        }

        fn erase(&mut self, _addr: u32, _len: u32) -> Result<(), NvmError> {
            Ok(())
        }

        fn write_checksum(&mut self) -> bool {
            true
        }

        fn verify_checksum(&mut self) -> bool {
            self.valid
        }

        fn done(&mut self) -> bool {
            true
        }
    }

    #[test]
    fn collects_overlapping_bytes() {
        let mut table = InfoTable::new(0x100, 4, |_: &[u8], _: &[u8]| true);
        table.collect(0xfe, &[1, 2, 3, 4]);
        table.collect(0x103, &[9, 8]);
        table.collect(0x200, &[7]);
        assert_eq!(table.new, [3, 4, 0, 9]);
    }

    #[test]
    fn hook_sees_new_and_current_table() {
        let seen = Rc::new(RefCell::new(vec![]));
        let log = seen.clone();
        let mut table = InfoTable::new(0x100, 4, move |new: &[u8], current: &[u8]| {
            log.borrow_mut().push((new.to_vec(), current.to_vec()));
            new[0] >= current[0]
        });
        let mut nvm = Image {
            valid: true,
            table: [2, 0, 0, 0],
        };

        table.begin(&mut nvm);
        table.collect(0x100, &[3, 1, 1, 1]);
        assert!(table.check());

        table.begin(&mut nvm);
        table.collect(0x100, &[1, 1, 1, 1]);
        assert!(!table.check());

        assert_eq!(
            *seen.borrow(),
            vec![
                (vec![3, 1, 1, 1], vec![2, 0, 0, 0]),
                (vec![1, 1, 1, 1], vec![2, 0, 0, 0])
            ]
        );
    }

    #[test]
    fn no_valid_firmware_skips_the_hook() {
        let mut table = InfoTable::new(0x100, 4, |_: &[u8], _: &[u8]| -> bool {
            panic!("hook called without a valid firmware")
        });
        let mut nvm = Image {
            valid: false,
            table: [0xff; 4],
        };
        table.begin(&mut nvm);
        table.collect(0x100, &[1, 2, 3, 4]);
        assert!(table.check());
    }
}
