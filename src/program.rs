//! Programming sequence: PROGRAM_START, PROGRAM_CLEAR, PROGRAM..., PROGRAM_RESET.

use crate::infotable::InfoTable;
use crate::nvm::{Nvm, NvmError};
use crate::protocol::ErrorCode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgramSession {
    #[default]
    Idle,
    Started,
    Cleared,
    InProgress,
}

#[derive(Debug, Default)]
pub struct Programmer {
    session: ProgramSession,
    /// At least one block was written since PROGRAM_START
    programmed: bool,
    info_table: Option<InfoTable>,
}

impl Programmer {
    pub fn with_info_table(mut self, table: InfoTable) -> Self {
        self.info_table = Some(table);
        self
    }

    pub fn set_info_table(&mut self, table: InfoTable) {
        self.info_table = Some(table);
    }

    pub fn session(&self) -> ProgramSession {
        self.session
    }

    pub fn start(&mut self, nvm: &mut dyn Nvm) -> Result<(), ErrorCode> {
        if self.session != ProgramSession::Idle {
            return Err(ErrorCode::Sequence);
        }
        if let Some(table) = &mut self.info_table {
            table.begin(nvm);
        }
        nvm.init();
        self.programmed = false;
        self.session = ProgramSession::Started;
        Ok(())
    }

    /// Erases `len` bytes at `addr`. Failures leave the session as it was.
    pub fn clear(&mut self, nvm: &mut dyn Nvm, addr: u32, len: u32) -> Result<(), ErrorCode> {
        match self.session {
            ProgramSession::Started | ProgramSession::Cleared => {}
            _ => return Err(ErrorCode::Sequence),
        }
        match nvm.erase(addr, len) {
            Ok(()) => {
                self.session = ProgramSession::Cleared;
                Ok(())
            }
            Err(NvmError::OutOfRange) => Err(ErrorCode::OutOfRange),
            Err(NvmError::Failed) => Err(ErrorCode::Generic),
        }
    }

    /// Writes a block. An empty block ends the sequence.
    pub fn program(&mut self, nvm: &mut dyn Nvm, addr: u32, data: &[u8]) -> Result<(), ErrorCode> {
        match self.session {
            ProgramSession::Cleared | ProgramSession::InProgress => {}
            _ => return Err(ErrorCode::Sequence),
        }
        if data.is_empty() {
            return self.finish(nvm);
        }
        if let Err(e) = nvm.write(addr, data) {
            log::debug!("write 0x{:08x}+{} failed: {:?}", addr, data.len(), e);
            return Err(ErrorCode::Generic);
        }
        if let Some(table) = &mut self.info_table {
            table.collect(addr, data);
        }
        self.programmed = true;
        self.session = ProgramSession::InProgress;
        Ok(())
    }

    /// Ends a running session before the reset: the checksum record is written when
    /// anything was programmed.
    pub fn reset(&mut self, nvm: &mut dyn Nvm) -> Result<(), ErrorCode> {
        if self.session == ProgramSession::Idle {
            return Ok(());
        }
        self.finish(nvm)
    }

    /// Back to idle without touching the memory.
    pub fn abort(&mut self) {
        if self.session != ProgramSession::Idle {
            log::debug!("programming session {:?} aborted", self.session);
        }
        self.session = ProgramSession::Idle;
        self.programmed = false;
    }

    fn finish(&mut self, nvm: &mut dyn Nvm) -> Result<(), ErrorCode> {
        let accepted = match &mut self.info_table {
            Some(table) if self.programmed => table.check(),
            _ => true,
        };
        if !accepted {
            return Err(ErrorCode::Generic);
        }
        if self.programmed && !nvm.write_checksum() {
            log::warn!("writing the checksum record failed");
            return Err(ErrorCode::Generic);
        }
        if !nvm.done() {
            log::warn!("finishing the programming session failed");
            return Err(ErrorCode::Generic);
        }
        self.programmed = false;
        self.session = ProgramSession::Idle;
        Ok(())
    }
}
