//! XCP command processor of the bootloader.
//!
//! [`Engine::handle`] takes one complete command packet and tells the caller what to
//! send back. Nothing is sent while disconnected, except the answer to CONNECT.

use anyhow::Result;
use scroll::{Endian, Pread, Pwrite};

use crate::checksum::{Checksum, ChecksumError, UserChecksum};
use crate::config::Config;
use crate::constants::{PROTOCOL_LAYER_VERSION, TRANSPORT_LAYER_VERSION, commands, pid};
use crate::hal::CalPages;
use crate::infotable::InfoTable;
use crate::nvm::Nvm;
use crate::program::{ProgramSession, Programmer};
use crate::protocol::ErrorCode;
use crate::security::{Resource, ResourceMask, SeedKey, Security};

/// Largest block BUILD_CHECKSUM reads at once.
const MAX_CHECKSUM_BLOCK: u32 = 16 * 1024 * 1024;

/// What the caller has to do with the result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send nothing.
    Silent,
    Respond(Vec<u8>),
    /// Send the response, wait for it to leave, then reset the target.
    RespondThenReset(Vec<u8>),
}

impl Outcome {
    pub fn response(&self) -> Option<&[u8]> {
        match self {
            Outcome::Silent => None,
            Outcome::Respond(r) | Outcome::RespondThenReset(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Memory transfer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mta {
    Memory(u32),
    /// Offset into the station id, after GET_ID could not answer inline
    StationId(usize),
}

pub struct Engine<N: Nvm> {
    config: Config,
    endian: Endian,
    nvm: N,
    cal_pages: Option<Box<dyn CalPages>>,
    security: Security,
    programmer: Programmer,
    build_checksum: Checksum,
    connection: ConnectionState,
    mta: Mta,
    /// The last response was not confirmed as transmitted yet
    cto_pending: bool,
    reset_pending: bool,
}

impl<N: Nvm> Engine<N> {
    pub fn new(config: Config, nvm: N, seed_key: Box<dyn SeedKey>) -> Result<Self> {
        config.validate()?;
        let endian = config.byte_order.endian();
        let available = ResourceMask::from_bits(config.resources());
        Ok(Engine {
            security: Security::new(available, config.seed_key, seed_key),
            build_checksum: Checksum::new(config.build_checksum, endian),
            endian,
            nvm,
            cal_pages: None,
            programmer: Programmer::default(),
            connection: ConnectionState::Disconnected,
            mta: Mta::Memory(0),
            cto_pending: false,
            reset_pending: false,
            config,
        })
    }

    /// Page switching for SET_CAL_PAGE and GET_CAL_PAGE.
    pub fn with_cal_pages(mut self, pages: impl CalPages + 'static) -> Self {
        self.cal_pages = Some(Box::new(pages));
        self
    }

    /// Routine for BUILD_CHECKSUM when configured as user checksum.
    pub fn with_user_checksum(mut self, hook: UserChecksum) -> Self {
        self.build_checksum = self.build_checksum.with_user(hook);
        self
    }

    /// Compares the info table of a new image with the present one before the
    /// checksum record is written.
    pub fn with_info_table(mut self, table: InfoTable) -> Self {
        self.programmer.set_info_table(table);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn session(&self) -> ProgramSession {
        self.programmer.session()
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    /// Current memory transfer address, if it points into memory.
    pub fn mta(&self) -> Option<u32> {
        match self.mta {
            Mta::Memory(addr) => Some(addr),
            Mta::StationId(_) => None,
        }
    }

    pub fn nvm(&self) -> &N {
        &self.nvm
    }

    pub fn nvm_mut(&mut self) -> &mut N {
        &mut self.nvm
    }

    pub fn into_nvm(self) -> N {
        self.nvm
    }

    /// The previous response has left the transmitter.
    pub fn packet_transmitted(&mut self) {
        self.cto_pending = false;
    }

    /// Processes one command packet.
    pub fn handle(&mut self, cto: &[u8]) -> Outcome {
        let Some(&cmd) = cto.first() else {
            return Outcome::Silent;
        };
        if cmd != commands::CONNECT && !self.is_connected() {
            log::debug!("ignoring 0x{:02x} while disconnected", cmd);
            return Outcome::Silent;
        }

        let mut response = match self.dispatch(cmd, cto) {
            Ok(response) => response,
            Err(ErrorCode::CmdSynch) => ErrorCode::CmdSynch.packet(),
            Err(code) => {
                log::debug!("command 0x{:02x} failed: {}", cmd, code);
                code.packet()
            }
        };
        if self.cto_pending {
            log::warn!("command overrun, previous response still pending");
            response = ErrorCode::CmdBusy.packet();
        }
        self.cto_pending = true;

        if std::mem::take(&mut self.reset_pending) {
            Outcome::RespondThenReset(response)
        } else {
            Outcome::Respond(response)
        }
    }

    fn dispatch(&mut self, cmd: u8, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let programming = self.config.programming;
        let calibration = self.config.calibration;
        let paging = self.config.paging;
        let seed_key = self.config.seed_key;

        match cmd {
            commands::CONNECT => self.cmd_connect(),
            commands::DISCONNECT => self.cmd_disconnect(),
            commands::GET_STATUS => self.cmd_get_status(),
            commands::SYNCH => self.cmd_synch(),
            commands::GET_ID => self.cmd_get_id(),
            commands::SET_MTA => self.cmd_set_mta(cto),
            commands::UPLOAD => self.cmd_upload(cto),
            commands::SHORT_UPLOAD => self.cmd_short_upload(cto),
            commands::BUILD_CHECKSUM => self.cmd_build_checksum(cto),
            commands::GET_SEED if seed_key => self.cmd_get_seed(cto),
            commands::UNLOCK if seed_key => self.cmd_unlock(cto),
            commands::DOWNLOAD if calibration => self.cmd_download(cto),
            commands::DOWNLOAD_MAX if calibration => self.cmd_download_max(cto),
            commands::SET_CAL_PAGE if paging => self.cmd_set_cal_page(cto),
            commands::GET_CAL_PAGE if paging => self.cmd_get_cal_page(cto),
            commands::PROGRAM_START if programming => self.cmd_program_start(),
            commands::PROGRAM_CLEAR if programming => self.cmd_program_clear(cto),
            commands::PROGRAM if programming => self.cmd_program(cto),
            commands::PROGRAM_MAX if programming => self.cmd_program_max(cto),
            commands::PROGRAM_RESET if programming => self.cmd_program_reset(),
            commands::PROGRAM_PREPARE if programming => self.cmd_program_prepare(),
            _ => Err(ErrorCode::CmdUnknown),
        }
    }

    fn require(&self, resource: Resource) -> Result<(), ErrorCode> {
        if self.security.is_unlocked(resource) {
            Ok(())
        } else {
            Err(ErrorCode::AccessLocked)
        }
    }

    fn mta_address(&self) -> Result<u32, ErrorCode> {
        self.mta().ok_or(ErrorCode::OutOfRange)
    }

    fn advance_mta(&mut self, len: usize) {
        self.mta = match self.mta {
            Mta::Memory(addr) => Mta::Memory(addr.wrapping_add(len as u32)),
            Mta::StationId(offset) => Mta::StationId(offset + len),
        };
    }

    fn read_u32(&self, cto: &[u8], offset: usize) -> Result<u32, ErrorCode> {
        cto.pread_with(offset, self.endian)
            .map_err(|_| ErrorCode::OutOfRange)
    }

    /// `[len, data..]` starting at offset 1, with at most `max_cto - 2` data bytes.
    fn counted_data<'a>(&self, cto: &'a [u8]) -> Result<&'a [u8], ErrorCode> {
        let len = *cto.get(1).ok_or(ErrorCode::OutOfRange)? as usize;
        if len > self.config.max_cto - 2 {
            return Err(ErrorCode::OutOfRange);
        }
        cto.get(2..2 + len).ok_or(ErrorCode::OutOfRange)
    }

    /// Everything after the command code, exactly `max_cto - 1` bytes.
    fn max_data<'a>(&self, cto: &'a [u8]) -> Result<&'a [u8], ErrorCode> {
        cto.get(1..self.config.max_cto).ok_or(ErrorCode::OutOfRange)
    }

    fn cmd_connect(&mut self) -> Result<Vec<u8>, ErrorCode> {
        self.security.reset();
        self.programmer.abort();
        self.mta = Mta::Memory(0);
        if !self.is_connected() {
            log::info!("host connected");
        }
        self.connection = ConnectionState::Connected;

        let mut res = vec![0u8; 8];
        res[0] = pid::RES;
        res[1] = self.config.resources();
        res[2] = self.config.byte_order.comm_mode();
        res[3] = self.config.max_cto as u8;
        res.pwrite_with(self.config.max_dto as u16, 4, self.endian)
            .map_err(|_| ErrorCode::Generic)?;
        res[6] = (PROTOCOL_LAYER_VERSION >> 8) as u8;
        res[7] = (TRANSPORT_LAYER_VERSION >> 8) as u8;
        Ok(res)
    }

    fn cmd_disconnect(&mut self) -> Result<Vec<u8>, ErrorCode> {
        self.connection = ConnectionState::Disconnected;
        self.security.reset();
        self.programmer.abort();
        log::info!("host disconnected");
        Ok(vec![pid::RES])
    }

    fn cmd_get_status(&mut self) -> Result<Vec<u8>, ErrorCode> {
        // session status and session configuration id are not used
        Ok(vec![
            pid::RES,
            0,
            self.security.protection().bits(),
            0,
            0,
            0,
        ])
    }

    fn cmd_synch(&mut self) -> Result<Vec<u8>, ErrorCode> {
        self.mta = Mta::Memory(0);
        self.programmer.abort();
        Err(ErrorCode::CmdSynch)
    }

    fn cmd_get_id(&mut self) -> Result<Vec<u8>, ErrorCode> {
        let id = self.config.station_id.as_bytes();
        let inline = 8 + id.len() <= self.config.max_dto;
        let mut res = vec![pid::RES, inline as u8, 0, 0, 0, 0, 0, 0];
        res.pwrite_with(id.len() as u32, 4, self.endian)
            .map_err(|_| ErrorCode::Generic)?;
        if inline {
            res.extend_from_slice(id);
        } else {
            self.mta = Mta::StationId(0);
        }
        Ok(res)
    }

    fn cmd_set_mta(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        // the address extension is not used
        self.mta = Mta::Memory(self.read_u32(cto, 4)?);
        Ok(vec![pid::RES])
    }

    fn cmd_upload(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let len = *cto.get(1).ok_or(ErrorCode::OutOfRange)? as usize;
        self.upload(len)
    }

    fn cmd_short_upload(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let len = *cto.get(1).ok_or(ErrorCode::OutOfRange)? as usize;
        self.mta = Mta::Memory(self.read_u32(cto, 4)?);
        self.upload(len)
    }

    fn upload(&mut self, len: usize) -> Result<Vec<u8>, ErrorCode> {
        if len > self.config.max_dto - 1 {
            return Err(ErrorCode::OutOfRange);
        }
        let mut res = vec![0u8; 1 + len];
        res[0] = pid::RES;
        if self.config.upload {
            match self.mta {
                Mta::Memory(addr) => {
                    if !self.nvm.read(addr, &mut res[1..]) {
                        return Err(ErrorCode::OutOfRange);
                    }
                }
                Mta::StationId(offset) => {
                    let id = self.config.station_id.as_bytes();
                    for (dst, src) in res[1..].iter_mut().zip(id.iter().skip(offset)) {
                        *dst = *src;
                    }
                }
            }
        }
        self.advance_mta(len);
        Ok(res)
    }

    fn cmd_build_checksum(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let size = self.read_u32(cto, 4)?;
        let addr = self.mta_address()?;
        if size > MAX_CHECKSUM_BLOCK {
            return Err(ErrorCode::OutOfRange);
        }
        let mut block = vec![0u8; size as usize];
        if !self.nvm.read(addr, &mut block) {
            return Err(ErrorCode::OutOfRange);
        }
        let value = self.build_checksum.compute(&block).map_err(|e| match e {
            ChecksumError::Misaligned => ErrorCode::OutOfRange,
            ChecksumError::NoUserHook => ErrorCode::Generic,
        })?;

        let mut res = vec![pid::RES, self.build_checksum.kind().code(), 0, 0, 0, 0, 0, 0];
        res.pwrite_with(value, 4, self.endian)
            .map_err(|_| ErrorCode::Generic)?;
        Ok(res)
    }

    fn cmd_get_seed(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let (mode, resource) = match cto {
            [_, mode, resource, ..] => (*mode, *resource),
            _ => return Err(ErrorCode::OutOfRange),
        };
        let max_part = self.config.max_dto - 2;
        let (remaining, part) = self.security.get_seed(mode, resource, max_part)?;
        let mut res = Vec::with_capacity(2 + part.len());
        res.push(pid::RES);
        res.push(remaining);
        res.extend(part);
        Ok(res)
    }

    fn cmd_unlock(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let len = *cto.get(1).ok_or(ErrorCode::OutOfRange)? as usize;
        if len > self.config.max_cto - 2 {
            return Err(ErrorCode::Sequence);
        }
        let key = cto.get(2..2 + len).ok_or(ErrorCode::OutOfRange)?;
        let protection = self.security.unlock(key)?;
        Ok(vec![pid::RES, protection.bits()])
    }

    fn download(&mut self, data: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        let addr = self.mta_address()?;
        if !self.nvm.store(addr, data) {
            return Err(ErrorCode::OutOfRange);
        }
        self.advance_mta(data.len());
        Ok(vec![pid::RES])
    }

    fn cmd_download(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::CalPag)?;
        let data = self.counted_data(cto)?;
        self.download(data)
    }

    fn cmd_download_max(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::CalPag)?;
        let data = self.max_data(cto)?;
        self.download(data)
    }

    fn cmd_set_cal_page(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::CalPag)?;
        // the mode is not used
        let (segment, page) = match cto {
            [_, _, segment, page, ..] => (*segment, *page),
            _ => return Err(ErrorCode::OutOfRange),
        };
        let pages = self.cal_pages.as_mut().ok_or(ErrorCode::PageNotValid)?;
        if !pages.set_page(segment, page) {
            return Err(ErrorCode::PageNotValid);
        }
        Ok(vec![pid::RES])
    }

    fn cmd_get_cal_page(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::CalPag)?;
        let segment = *cto.get(2).ok_or(ErrorCode::OutOfRange)?;
        let pages = self.cal_pages.as_mut().ok_or(ErrorCode::PageNotValid)?;
        Ok(vec![pid::RES, 0, 0, pages.get_page(segment)])
    }

    fn cmd_program_start(&mut self) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::Pgm)?;
        self.programmer.start(&mut self.nvm)?;
        log::info!("programming session started");
        // no special communication mode, block mode or queue during programming
        Ok(vec![pid::RES, 0, 0, self.config.max_cto as u8, 0, 0, 0])
    }

    fn cmd_program_clear(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::Pgm)?;
        let range = self.read_u32(cto, 4)?;
        let addr = self.mta_address()?;
        self.programmer.clear(&mut self.nvm, addr, range)?;
        log::info!("cleared 0x{:08x}+{}", addr, range);
        Ok(vec![pid::RES])
    }

    fn cmd_program(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::Pgm)?;
        let data = self.counted_data(cto)?;
        let addr = self.mta_address()?;
        self.programmer.program(&mut self.nvm, addr, data)?;
        self.advance_mta(data.len());
        Ok(vec![pid::RES])
    }

    fn cmd_program_max(&mut self, cto: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::Pgm)?;
        let data = self.max_data(cto)?;
        let addr = self.mta_address()?;
        self.programmer.program(&mut self.nvm, addr, data)?;
        self.advance_mta(data.len());
        Ok(vec![pid::RES])
    }

    fn cmd_program_reset(&mut self) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::Pgm)?;
        self.programmer.reset(&mut self.nvm)?;
        self.connection = ConnectionState::Disconnected;
        self.security.reset();
        self.reset_pending = true;
        log::info!("programming done, resetting");
        Ok(vec![pid::RES])
    }

    fn cmd_program_prepare(&mut self) -> Result<Vec<u8>, ErrorCode> {
        self.require(Resource::Pgm)?;
        // programming through a downloaded kernel is not supported
        Err(ErrorCode::Generic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::config::ProfileDB;
    use crate::nvm::FlashSim;
    use crate::security::DemoKey;

    fn engine_with(config: Config) -> Engine<FlashSim> {
        let profile = ProfileDB::find("STM32F103C8").unwrap();
        let flash = FlashSim::new(profile, ChecksumKind::Crc32).unwrap();
        Engine::new(config, flash, Box::new(DemoKey)).unwrap()
    }

    fn engine() -> Engine<FlashSim> {
        engine_with(Config::default())
    }

    fn send<N: Nvm>(engine: &mut Engine<N>, cto: &[u8]) -> Vec<u8> {
        let outcome = engine.handle(cto);
        engine.packet_transmitted();
        outcome.response().map(|r| r.to_vec()).unwrap_or_default()
    }

    #[test]
    fn connect_response() {
        let mut e = engine();
        assert_eq!(
            send(&mut e, &[0xff, 0x00]),
            [0xff, 0x10, 0x00, 64, 64, 0, 0x01, 0x01]
        );
        assert!(e.is_connected());
    }

    #[test]
    fn connect_response_motorola() {
        let mut e = engine_with(Config {
            byte_order: crate::config::ByteOrder::Motorola,
            max_dto: 200,
            ..Config::default()
        });
        assert_eq!(
            send(&mut e, &[0xff, 0x00]),
            [0xff, 0x10, 0x01, 64, 0, 200, 0x01, 0x01]
        );
    }

    #[test]
    fn silent_while_disconnected() {
        let mut e = engine();
        for cmd in 0x00..=0xfe_u8 {
            assert_eq!(e.handle(&[cmd, 0, 0, 0, 0, 0, 0, 0]), Outcome::Silent);
        }
        assert_eq!(e.handle(&[]), Outcome::Silent);
        assert!(!e.is_connected());
    }

    #[test]
    fn unknown_command() {
        let mut e = engine();
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0x42]), [0xfe, 0x20]);
        // disabled resources are unknown as well
        assert_eq!(send(&mut e, &[0xf0, 1, 0]), [0xfe, 0x20]);
        assert_eq!(send(&mut e, &[0xf8, 0, 0x10]), [0xfe, 0x20]);
    }

    #[test]
    fn busy_until_transmitted() {
        let mut e = engine();
        e.handle(&[0xff, 0x00]);
        assert_eq!(e.handle(&[0xfd]), Outcome::Respond(vec![0xfe, 0x10]));
        e.packet_transmitted();
        assert_eq!(send(&mut e, &[0xfd]), [0xff, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn disconnect() {
        let mut e = engine();
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xfe]), [0xff]);
        assert!(!e.is_connected());
        assert_eq!(e.handle(&[0xfd]), Outcome::Silent);
    }

    #[test]
    fn synch_resets_mta_and_session() {
        let mut e = engine();
        send(&mut e, &[0xff, 0x00]);
        send(&mut e, &[0xd2]);
        send(&mut e, &[0xf6, 0, 0, 0, 0x00, 0x20, 0x00, 0x08]);
        assert_eq!(e.mta(), Some(0x0800_2000));
        assert_eq!(send(&mut e, &[0xfc]), [0xfe, 0x00]);
        assert_eq!(e.mta(), Some(0));
        assert_eq!(e.session(), ProgramSession::Idle);
        assert!(e.is_connected());
    }

    #[test]
    fn get_id_inline_and_by_upload() {
        let mut e = engine();
        send(&mut e, &[0xff, 0x00]);
        let mut expected = vec![0xff, 0x01, 0, 0, 7, 0, 0, 0];
        expected.extend_from_slice(b"XCPBOOT");
        assert_eq!(send(&mut e, &[0xfa, 0x00]), expected);

        let mut e = engine_with(Config {
            max_dto: 8,
            max_cto: 8,
            ..Config::default()
        });
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xfa, 0x00]), [0xff, 0x00, 0, 0, 7, 0, 0, 0]);
        assert_eq!(e.mta(), None);
        assert_eq!(send(&mut e, &[0xf5, 5]), b"\xffXCPBO");
        assert_eq!(send(&mut e, &[0xf5, 5]), b"\xffOT\x00\x00\x00");
    }

    #[test]
    fn upload_reads_memory() {
        let mut e = engine();
        e.nvm_mut().flash_mut()[0x2000..0x2004].copy_from_slice(&[1, 2, 3, 4]);
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(
            send(&mut e, &[0xf4, 4, 0, 0, 0x00, 0x20, 0x00, 0x08]),
            [0xff, 1, 2, 3, 4]
        );
        assert_eq!(e.mta(), Some(0x0800_2004));
        assert_eq!(send(&mut e, &[0xf5, 64]), [0xfe, 0x22]);
        assert_eq!(send(&mut e, &[0xf4, 1, 0, 0, 0, 0, 0, 0x50]), [0xfe, 0x22]);
    }

    #[test]
    fn disabled_upload_returns_zeros() {
        let mut e = engine_with(Config {
            upload: false,
            ..Config::default()
        });
        e.nvm_mut().flash_mut()[0x2000..0x2004].copy_from_slice(&[1, 2, 3, 4]);
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(
            send(&mut e, &[0xf4, 4, 0, 0, 0x00, 0x20, 0x00, 0x08]),
            [0xff, 0, 0, 0, 0]
        );
    }

    #[test]
    fn build_checksum_of_mta_block() {
        let mut e = engine();
        e.nvm_mut().flash_mut()[0x2000..0x2004].copy_from_slice(&[0x80, 0x80, 0x01, 0x02]);
        send(&mut e, &[0xff, 0x00]);
        send(&mut e, &[0xf6, 0, 0, 0, 0x00, 0x20, 0x00, 0x08]);
        assert_eq!(
            send(&mut e, &[0xf3, 0, 0, 0, 4, 0, 0, 0]),
            [0xff, 0x01, 0, 0, 0x03, 0, 0, 0]
        );
        assert_eq!(e.mta(), Some(0x0800_2000));
    }

    #[test]
    fn program_reset_ends_in_reset() {
        let mut e = Engine::new(Config::default(), Recorder::default(), Box::new(DemoKey)).unwrap();
        send(&mut e, &[0xff, 0x00]);
        send(&mut e, &[0xd2]);
        let outcome = e.handle(&[0xcf]);
        assert_eq!(outcome, Outcome::RespondThenReset(vec![0xff]));
        assert!(!e.is_connected());
        assert_eq!(e.session(), ProgramSession::Idle);
        // nothing programmed, no checksum record
        assert_eq!(e.nvm().0, ["init", "done"]);
    }

    #[test]
    fn program_reset_writes_checksum_after_programming() {
        let mut e = Engine::new(Config::default(), Recorder::default(), Box::new(DemoKey)).unwrap();
        send(&mut e, &[0xff, 0x00]);
        send(&mut e, &[0xd2]);
        send(&mut e, &[0xd1, 0, 0, 0, 0x00, 0x04, 0, 0]);
        send(&mut e, &[0xd0, 2, 0xaa, 0xbb]);
        e.handle(&[0xcf]);
        assert_eq!(
            e.nvm().0,
            ["init", "erase", "write", "write_checksum", "done"]
        );
    }

    #[test]
    fn program_prepare_is_unsupported() {
        let mut e = engine();
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xcc, 0, 0, 0]), [0xfe, 0x31]);
    }

    #[test]
    fn locked_programming() {
        let mut e = engine_with(Config {
            seed_key: true,
            ..Config::default()
        });
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xfd]), [0xff, 0, 0x10, 0, 0, 0]);
        assert_eq!(send(&mut e, &[0xd2]), [0xfe, 0x25]);
        assert_eq!(e.session(), ProgramSession::Idle);

        assert_eq!(send(&mut e, &[0xf8, 0, 0x10]), [0xff, 1, 0x55]);
        assert_eq!(send(&mut e, &[0xf7, 1, 0x54]), [0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xd2]), [0xff, 0, 0, 64, 0, 0, 0]);

        // a new connection locks again
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xd2]), [0xfe, 0x25]);
    }

    #[test]
    fn unlock_key_too_long() {
        let mut e = engine_with(Config {
            seed_key: true,
            max_cto: 8,
            ..Config::default()
        });
        send(&mut e, &[0xff, 0x00]);
        send(&mut e, &[0xf8, 0, 0x10]);
        assert_eq!(send(&mut e, &[0xf7, 7, 0, 0, 0, 0, 0, 0]), [0xfe, 0x29]);
    }

    #[derive(Default)]
    struct Recorder(Vec<&'static str>);

    impl crate::hal::Memory for Recorder {
        fn read(&mut self, _: u32, buf: &mut [u8]) -> bool {
            buf.fill(0xff);
            true
        }
    }

    impl Nvm for Recorder {
        fn init(&mut self) {
            self.0.push("init");
        }

        fn write(&mut self, _: u32, _: &[u8]) -> Result<(), crate::nvm::NvmError> {
            self.0.push("write");
            Ok(())
        }

        fn erase(&mut self, _: u32, _: u32) -> Result<(), crate::nvm::NvmError> {
            self.0.push("erase");
            Ok(())
        }

        fn write_checksum(&mut self) -> bool {
            self.0.push("write_checksum");
            true
        }

        fn verify_checksum(&mut self) -> bool {
            self.0.push("verify_checksum");
            false
        }

        fn done(&mut self) -> bool {
            self.0.push("done");
            true
        }
    }

    struct Pages([u8; 2]);

    impl CalPages for Pages {
        fn set_page(&mut self, segment: u8, page: u8) -> bool {
            match self.0.get_mut(segment as usize) {
                Some(p) if page < 4 => {
                    *p = page;
                    true
                }
                _ => false,
            }
        }

        fn get_page(&mut self, segment: u8) -> u8 {
            self.0.get(segment as usize).copied().unwrap_or(0)
        }
    }

    #[test]
    fn calibration_and_paging() {
        let mut e = engine_with(Config {
            calibration: true,
            paging: true,
            ..Config::default()
        })
        .with_cal_pages(Pages([0, 0]));
        send(&mut e, &[0xff, 0x00]);
        assert_eq!(send(&mut e, &[0xeb, 0, 1, 3]), [0xff]);
        assert_eq!(send(&mut e, &[0xea, 0, 1]), [0xff, 0, 0, 3]);
        assert_eq!(send(&mut e, &[0xeb, 0, 2, 0]), [0xfe, 0x26]);

        send(&mut e, &[0xf6, 0, 0, 0, 0x00, 0x01, 0x00, 0x20]);
        assert_eq!(send(&mut e, &[0xf0, 2, 0xab, 0xcd]), [0xff]);
        let mut max = vec![0xee];
        max.extend(std::iter::repeat_n(0x11, 63));
        assert_eq!(send(&mut e, &max), [0xff]);
        assert_eq!(e.mta(), Some(0x2000_0100 + 65));
        assert_eq!(
            send(&mut e, &[0xf4, 3, 0, 0, 0x00, 0x01, 0x00, 0x20]),
            [0xff, 0xab, 0xcd, 0x11]
        );
        // flash is not writable through DOWNLOAD
        send(&mut e, &[0xf6, 0, 0, 0, 0x00, 0x20, 0x00, 0x08]);
        assert_eq!(send(&mut e, &[0xf0, 1, 0]), [0xfe, 0x22]);
    }
}
