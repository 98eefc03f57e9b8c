//! Non-volatile memory the bootloader programs.
use crate::hal::Memory;

pub use self::sim::FlashSim;

mod sim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmError {
    /// Address range not backed by any programmable memory
    OutOfRange,
    /// The memory was addressed but the operation failed
    Failed,
}

/// Answer of a [`NvmRegion`]: whether it handled the address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmStatus {
    Ok,
    NotInRange,
    Error,
}

impl NvmStatus {
    /// `None` if the next region should be asked.
    pub fn into_result(self) -> Option<Result<(), NvmError>> {
        match self {
            NvmStatus::Ok => Some(Ok(())),
            NvmStatus::Error => Some(Err(NvmError::Failed)),
            NvmStatus::NotInRange => None,
        }
    }
}

/// Additional memory, e.g. an external EEPROM, that is asked before the internal flash.
pub trait NvmRegion {
    fn write(&mut self, addr: u32, data: &[u8]) -> NvmStatus;
    fn erase(&mut self, addr: u32, len: u32) -> NvmStatus;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> NvmStatus {
        let _ = (addr, buf);
        NvmStatus::NotInRange
    }

    /// End of a programming session.
    fn done(&mut self) -> bool {
        true
    }
}

/// Programming primitives used by the bootloader engine.
///
/// Erase and write may take milliseconds and block until finished. Writing the same
/// bytes twice to the same address must succeed, hosts retry writes whose response
/// got lost.
pub trait Nvm: Memory {
    /// Start of a programming session.
    fn init(&mut self);

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), NvmError>;

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), NvmError>;

    /// Stores the checksum record of the programmed image.
    fn write_checksum(&mut self) -> bool;

    /// True if a valid application is present.
    fn verify_checksum(&mut self) -> bool;

    /// Flushes pending operations at the end of a programming session.
    fn done(&mut self) -> bool;
}
