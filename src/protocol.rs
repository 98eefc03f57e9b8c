//! The XCP packets exchanged with the bootloader, seen from the host.

use std::fmt;

use anyhow::Result;
use scroll::{Pread, Pwrite};

use crate::checksum::ChecksumKind;
use crate::config::ByteOrder;
use crate::constants::{commands, errors, pid};

/// Error code of an ERR packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Answer to SYNCH
    CmdSynch,
    /// Previous command still pending
    CmdBusy,
    CmdUnknown,
    OutOfRange,
    /// Resource is protected, seed/key unlock required
    AccessLocked,
    PageNotValid,
    /// Command issued in the wrong state
    Sequence,
    Generic,
    Other(u8),
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::CmdSynch => errors::CMD_SYNCH,
            ErrorCode::CmdBusy => errors::CMD_BUSY,
            ErrorCode::CmdUnknown => errors::CMD_UNKNOWN,
            ErrorCode::OutOfRange => errors::OUT_OF_RANGE,
            ErrorCode::AccessLocked => errors::ACCESS_LOCKED,
            ErrorCode::PageNotValid => errors::PAGE_NOT_VALID,
            ErrorCode::Sequence => errors::SEQUENCE,
            ErrorCode::Generic => errors::GENERIC,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            errors::CMD_SYNCH => ErrorCode::CmdSynch,
            errors::CMD_BUSY => ErrorCode::CmdBusy,
            errors::CMD_UNKNOWN => ErrorCode::CmdUnknown,
            errors::OUT_OF_RANGE => ErrorCode::OutOfRange,
            errors::ACCESS_LOCKED => ErrorCode::AccessLocked,
            errors::PAGE_NOT_VALID => ErrorCode::PageNotValid,
            errors::SEQUENCE => ErrorCode::Sequence,
            errors::GENERIC => ErrorCode::Generic,
            other => ErrorCode::Other(other),
        }
    }

    /// The `[ERR, code]` packet.
    pub fn packet(self) -> Vec<u8> {
        vec![pid::ERR, self.code()]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(code) => write!(f, "ERR_0x{:02x}", code),
            _ => write!(f, "{:?}(0x{:02x})", self, self.code()),
        }
    }
}

impl std::error::Error for ErrorCode {}

/// XCP command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Set up the session. Mode 0 is normal mode.
    Connect { mode: u8 },
    Disconnect,
    GetStatus,
    /// Resynchronize after a timeout, always answered with `ERR(CmdSynch)`.
    Synch,
    GetId { id_type: u8 },
    /// Mode 0 requests the first part of the seed, mode 1 the remaining parts.
    GetSeed { mode: u8, resource: u8 },
    Unlock { key: Vec<u8> },
    /// Set the memory transfer address. The address extension is not used.
    SetMta { address: u32 },
    /// Read `len` bytes at the MTA, the MTA is post incremented.
    Upload { len: u8 },
    ShortUpload { len: u8, address: u32 },
    /// Checksum of `size` bytes at the MTA.
    BuildChecksum { size: u32 },
    Download { data: Vec<u8> },
    /// `data` must be exactly max CTO - 1 bytes.
    DownloadMax { data: Vec<u8> },
    SetCalPage { mode: u8, segment: u8, page: u8 },
    GetCalPage { mode: u8, segment: u8 },
    ProgramStart,
    /// Erase `range` bytes at the MTA.
    ProgramClear { mode: u8, range: u32 },
    /// Program at the MTA. Empty data ends the programming sequence.
    Program { data: Vec<u8> },
    ProgramReset,
    ProgramPrepare { code_size: u16 },
    /// `data` must be exactly max CTO - 1 bytes.
    ProgramMax { data: Vec<u8> },
}

impl Command {
    pub fn connect() -> Self {
        Command::Connect { mode: 0 }
    }

    pub fn set_mta(address: u32) -> Self {
        Command::SetMta { address }
    }

    pub fn program(data: Vec<u8>) -> Self {
        Command::Program { data }
    }

    pub fn program_clear(range: u32) -> Self {
        Command::ProgramClear { mode: 0, range }
    }

    pub fn code(&self) -> u8 {
        match self {
            Command::Connect { .. } => commands::CONNECT,
            Command::Disconnect => commands::DISCONNECT,
            Command::GetStatus => commands::GET_STATUS,
            Command::Synch => commands::SYNCH,
            Command::GetId { .. } => commands::GET_ID,
            Command::GetSeed { .. } => commands::GET_SEED,
            Command::Unlock { .. } => commands::UNLOCK,
            Command::SetMta { .. } => commands::SET_MTA,
            Command::Upload { .. } => commands::UPLOAD,
            Command::ShortUpload { .. } => commands::SHORT_UPLOAD,
            Command::BuildChecksum { .. } => commands::BUILD_CHECKSUM,
            Command::Download { .. } => commands::DOWNLOAD,
            Command::DownloadMax { .. } => commands::DOWNLOAD_MAX,
            Command::SetCalPage { .. } => commands::SET_CAL_PAGE,
            Command::GetCalPage { .. } => commands::GET_CAL_PAGE,
            Command::ProgramStart => commands::PROGRAM_START,
            Command::ProgramClear { .. } => commands::PROGRAM_CLEAR,
            Command::Program { .. } => commands::PROGRAM,
            Command::ProgramReset => commands::PROGRAM_RESET,
            Command::ProgramPrepare { .. } => commands::PROGRAM_PREPARE,
            Command::ProgramMax { .. } => commands::PROGRAM_MAX,
        }
    }

    /// Serializes the command, multi-byte fields in the target's byte order.
    pub fn into_raw(self, order: ByteOrder) -> Result<Vec<u8>> {
        let endian = order.endian();
        let code = self.code();
        match self {
            Command::Connect { mode } => Ok(vec![code, mode]),
            Command::Disconnect
            | Command::GetStatus
            | Command::Synch
            | Command::ProgramStart
            | Command::ProgramReset => Ok(vec![code]),
            Command::GetId { id_type } => Ok(vec![code, id_type]),
            Command::GetSeed { mode, resource } => Ok(vec![code, mode, resource]),
            Command::Unlock { key } | Command::Download { data: key } | Command::Program { data: key } => {
                anyhow::ensure!(key.len() <= 0xff, "data too long: {} bytes", key.len());
                let mut buf = Vec::with_capacity(2 + key.len());
                buf.push(code);
                buf.push(key.len() as u8);
                buf.extend(key);
                Ok(buf)
            }
            Command::SetMta { address } => {
                // CMD, RESERVED:2, EXT, ADDR
                let mut buf = [code, 0, 0, 0, 0, 0, 0, 0];
                buf.pwrite_with(address, 4, endian)?;
                Ok(buf.to_vec())
            }
            Command::Upload { len } => Ok(vec![code, len]),
            Command::ShortUpload { len, address } => {
                let mut buf = [code, len, 0, 0, 0, 0, 0, 0];
                buf.pwrite_with(address, 4, endian)?;
                Ok(buf.to_vec())
            }
            Command::BuildChecksum { size } => {
                let mut buf = [code, 0, 0, 0, 0, 0, 0, 0];
                buf.pwrite_with(size, 4, endian)?;
                Ok(buf.to_vec())
            }
            Command::DownloadMax { data } | Command::ProgramMax { data } => {
                let mut buf = Vec::with_capacity(1 + data.len());
                buf.push(code);
                buf.extend(data);
                Ok(buf)
            }
            Command::SetCalPage {
                mode,
                segment,
                page,
            } => Ok(vec![code, mode, segment, page]),
            Command::GetCalPage { mode, segment } => Ok(vec![code, mode, segment]),
            Command::ProgramClear { mode, range } => {
                let mut buf = [code, mode, 0, 0, 0, 0, 0, 0];
                buf.pwrite_with(range, 4, endian)?;
                Ok(buf.to_vec())
            }
            Command::ProgramPrepare { code_size } => {
                let mut buf = [code, 0, 0, 0];
                buf.pwrite_with(code_size, 2, endian)?;
                Ok(buf.to_vec())
            }
        }
    }
}

/// Response to a Command, without the packet identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Response {
    /// PID = 0xFF
    Ok(Vec<u8>),
    /// PID = 0xFE
    Err(ErrorCode),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "RES[{}]", hex::encode(data)),
            Response::Err(code) => write!(f, "ERR({})", code),
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ok(payload) => payload,
            Response::Err(_) => &[],
        }
    }

    /// Turns an ERR packet into an error that can be downcast to [`ErrorCode`].
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Response::Ok(payload) => Ok(payload),
            Response::Err(code) => Err(code.into()),
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw.split_first() {
            Some((&pid::RES, payload)) => Ok(Response::Ok(payload.to_vec())),
            Some((&pid::ERR, rest)) => {
                let code = rest
                    .first()
                    .ok_or_else(|| anyhow::format_err!("ERR packet without error code"))?;
                Ok(Response::Err(ErrorCode::from_code(*code)))
            }
            Some((other, _)) => anyhow::bail!("unexpected packet identifier 0x{:02x}", other),
            None => anyhow::bail!("empty response packet"),
        }
    }
}

/// Payload of the CONNECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub resources: u8,
    pub comm_mode: u8,
    pub byte_order: ByteOrder,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

impl ConnectInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        anyhow::ensure!(payload.len() >= 7, "CONNECT response too short");
        let comm_mode = payload[1];
        let byte_order = ByteOrder::from_comm_mode(comm_mode);
        Ok(ConnectInfo {
            resources: payload[0],
            comm_mode,
            byte_order,
            max_cto: payload[2],
            max_dto: payload.pread_with(3, byte_order.endian())?,
            protocol_version: payload[5],
            transport_version: payload[6],
        })
    }
}

/// Payload of the GET_STATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub session: u8,
    /// Bits of the resources that are still locked
    pub protection: u8,
    pub config_id: u16,
}

impl StatusInfo {
    pub fn parse(payload: &[u8], order: ByteOrder) -> Result<Self> {
        anyhow::ensure!(payload.len() >= 5, "GET_STATUS response too short");
        Ok(StatusInfo {
            session: payload[0],
            protection: payload[1],
            config_id: payload.pread_with(3, order.endian())?,
        })
    }
}

/// Payload of the PROGRAM_START response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStartInfo {
    pub comm_mode_pgm: u8,
    pub max_cto_pgm: u8,
    pub max_bs_pgm: u8,
    pub min_st_pgm: u8,
    pub queue_size_pgm: u8,
}

impl ProgramStartInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        anyhow::ensure!(payload.len() >= 6, "PROGRAM_START response too short");
        Ok(ProgramStartInfo {
            comm_mode_pgm: payload[1],
            max_cto_pgm: payload[2],
            max_bs_pgm: payload[3],
            min_st_pgm: payload[4],
            queue_size_pgm: payload[5],
        })
    }
}

/// Payload of the GET_ID response. `id` is empty when it has to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdInfo {
    pub mode: u8,
    pub length: u32,
    pub id: Vec<u8>,
}

impl IdInfo {
    pub fn parse(payload: &[u8], order: ByteOrder) -> Result<Self> {
        anyhow::ensure!(payload.len() >= 7, "GET_ID response too short");
        let length: u32 = payload.pread_with(3, order.endian())?;
        let id = if payload[0] & 0x01 != 0 {
            let id = &payload[7..];
            anyhow::ensure!(id.len() >= length as usize, "GET_ID response truncated");
            id[..length as usize].to_vec()
        } else {
            Vec::new()
        };
        Ok(IdInfo {
            mode: payload[0],
            length,
            id,
        })
    }
}

/// Payload of the BUILD_CHECKSUM response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumInfo {
    pub kind: ChecksumKind,
    pub value: u32,
}

impl ChecksumInfo {
    pub fn parse(payload: &[u8], order: ByteOrder) -> Result<Self> {
        anyhow::ensure!(payload.len() >= 7, "BUILD_CHECKSUM response too short");
        let kind = ChecksumKind::from_code(payload[0])
            .ok_or_else(|| anyhow::format_err!("unknown checksum type 0x{:02x}", payload[0]))?;
        Ok(ChecksumInfo {
            kind,
            value: payload.pread_with(3, order.endian())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layouts() {
        let intel = ByteOrder::Intel;
        let motorola = ByteOrder::Motorola;
        assert_eq!(Command::connect().into_raw(intel).unwrap(), [0xff, 0x00]);
        assert_eq!(
            Command::set_mta(0x0800_0000).into_raw(intel).unwrap(),
            [0xf6, 0, 0, 0, 0x00, 0x00, 0x00, 0x08]
        );
        assert_eq!(
            Command::set_mta(0x0800_0000).into_raw(motorola).unwrap(),
            [0xf6, 0, 0, 0, 0x08, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            Command::program_clear(256).into_raw(intel).unwrap(),
            [0xd1, 0, 0, 0, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            Command::program(vec![1, 2, 3]).into_raw(intel).unwrap(),
            [0xd0, 3, 1, 2, 3]
        );
        assert_eq!(
            Command::GetSeed {
                mode: 0,
                resource: 0x10
            }
            .into_raw(intel)
            .unwrap(),
            [0xf8, 0, 0x10]
        );
        assert_eq!(
            Command::ProgramMax { data: vec![7; 3] }
                .into_raw(intel)
                .unwrap(),
            [0xc9, 7, 7, 7]
        );
    }

    #[test]
    fn responses() {
        assert_eq!(
            Response::from_raw(&[0xff, 1, 2]).unwrap(),
            Response::Ok(vec![1, 2])
        );
        assert_eq!(
            Response::from_raw(&[0xfe, 0x29]).unwrap(),
            Response::Err(ErrorCode::Sequence)
        );
        assert!(Response::from_raw(&[0xfe]).is_err());
        assert!(Response::from_raw(&[0x12]).is_err());
        assert!(Response::from_raw(&[]).is_err());

        let err = Response::Err(ErrorCode::AccessLocked).into_result().unwrap_err();
        assert_eq!(err.downcast_ref::<ErrorCode>(), Some(&ErrorCode::AccessLocked));
    }

    #[test]
    fn error_codes_map_to_wire_values() {
        for code in [0x00, 0x10, 0x20, 0x22, 0x25, 0x26, 0x29, 0x31, 0x77] {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
        assert_eq!(ErrorCode::from_code(0x77), ErrorCode::Other(0x77));
    }

    #[test]
    fn connect_info() {
        let info = ConnectInfo::parse(&[0x10, 0x01, 0x08, 0x00, 0x08, 0x01, 0x01]).unwrap();
        assert_eq!(info.byte_order, ByteOrder::Motorola);
        assert_eq!(info.max_cto, 8);
        assert_eq!(info.max_dto, 8);
        assert!(ConnectInfo::parse(&[0x10]).is_err());
    }

    #[test]
    fn id_info() {
        let mut payload = vec![0x01, 0, 0, 3, 0, 0, 0];
        payload.extend_from_slice(b"ABC");
        let info = IdInfo::parse(&payload, ByteOrder::Intel).unwrap();
        assert_eq!(info.id, b"ABC");

        let info = IdInfo::parse(&[0x00, 0, 0, 3, 0, 0, 0], ByteOrder::Intel).unwrap();
        assert_eq!(info.length, 3);
        assert!(info.id.is_empty());
    }
}
