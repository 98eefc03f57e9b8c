//! Host side programming sequence.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::ByteOrder;
use crate::format::Segment;
use crate::protocol::{
    ChecksumInfo, Command, ConnectInfo, ErrorCode, IdInfo, ProgramStartInfo, Response, StatusInfo,
};
use crate::security::{KeyAlgorithm, Resource, ResourceMask};
use crate::transport::{Transport, UsbTransport};

pub const CONNECT_RETRIES: usize = 5;

/// Response timeouts of the XCP commands.
pub mod timeouts {
    use std::time::Duration;

    /// Most commands
    pub const T1: Duration = Duration::from_millis(1000);
    /// PROGRAM_START
    pub const T3: Duration = Duration::from_millis(2000);
    /// PROGRAM_CLEAR
    pub const T4: Duration = Duration::from_millis(10000);
    /// PROGRAM, PROGRAM_MAX and PROGRAM_RESET
    pub const T5: Duration = Duration::from_millis(1000);
    /// CONNECT
    pub const T6: Duration = Duration::from_millis(50);
    /// Waiting after ERR(CMD_BUSY)
    pub const T7: Duration = Duration::from_millis(2000);
}

pub struct XcpLoader<T: Transport> {
    transport: T,
    info: ConnectInfo,
    key: Option<Box<dyn KeyAlgorithm>>,
}

impl XcpLoader<UsbTransport> {
    pub fn new_from_usb() -> Result<Self> {
        Self::connect(UsbTransport::open_any()?)
    }
}

impl<T: Transport> XcpLoader<T> {
    /// Connects to the bootloader, retrying while it does not answer.
    pub fn connect(mut transport: T) -> Result<Self> {
        let mut last_error = None;
        for attempt in 1..=CONNECT_RETRIES {
            match transport.transfer(Command::connect(), ByteOrder::Intel, timeouts::T6) {
                Ok(Response::Ok(payload)) => {
                    let info = ConnectInfo::parse(&payload)?;
                    log::debug!("connected: {:?}", info);
                    anyhow::ensure!(
                        info.max_cto >= 8 && info.max_dto >= 8,
                        "unusable packet sizes: max CTO {}, max DTO {}",
                        info.max_cto,
                        info.max_dto
                    );
                    anyhow::ensure!(
                        ResourceMask::from_bits(info.resources).contains(Resource::Pgm),
                        "target does not support programming"
                    );
                    return Ok(XcpLoader {
                        transport,
                        info,
                        key: None,
                    });
                }
                Ok(resp) => anyhow::bail!("connect failed: {:?}", resp),
                Err(e) => {
                    log::debug!("connect attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow::format_err!("no response"))
            .context(format!("no connection after {} attempts", CONNECT_RETRIES)))
    }

    /// Algorithm used when the programming resource is protected.
    pub fn with_key_algorithm(mut self, key: Box<dyn KeyAlgorithm>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn info(&self) -> &ConnectInfo {
        &self.info
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.info.byte_order
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn max_cto(&self) -> usize {
        self.info.max_cto as usize
    }

    fn max_dto(&self) -> usize {
        self.info.max_dto as usize
    }

    /// Sends a command, repeating it once when the target is busy.
    fn command(&mut self, cmd: Command, timeout: Duration) -> Result<Vec<u8>> {
        let code = cmd.code();
        let order = self.byte_order();
        let mut resp = self.transport.transfer(cmd.clone(), order, timeout)?;
        if resp == Response::Err(ErrorCode::CmdBusy) {
            log::debug!("target busy, repeating command 0x{:02x}", code);
            resp = self.transport.transfer(cmd, order, timeouts::T7)?;
        }
        resp.into_result()
            .with_context(|| format!("command 0x{:02x} failed", code))
    }

    pub fn status(&mut self) -> Result<StatusInfo> {
        let payload = self.command(Command::GetStatus, timeouts::T1)?;
        StatusInfo::parse(&payload, self.byte_order())
    }

    /// Station id of the target.
    pub fn id(&mut self) -> Result<String> {
        let payload = self.command(Command::GetId { id_type: 0 }, timeouts::T1)?;
        let info = IdInfo::parse(&payload, self.byte_order())?;
        let id = if info.mode & 0x01 != 0 {
            info.id
        } else {
            self.upload(info.length as usize)?
        };
        Ok(String::from_utf8_lossy(&id).into_owned())
    }

    /// Unlocks `resource` through seed and key, if it is protected.
    pub fn unlock(&mut self, resource: Resource) -> Result<()> {
        let status = self.status()?;
        if !ResourceMask::from_bits(status.protection).contains(resource) {
            return Ok(());
        }
        log::info!("{} is protected, unlocking", resource);

        let payload = self.command(
            Command::GetSeed {
                mode: 0,
                resource: resource.bit(),
            },
            timeouts::T1,
        )?;
        let (&total, first) = payload
            .split_first()
            .ok_or_else(|| anyhow::format_err!("GET_SEED response too short"))?;
        if total == 0 {
            // unlocked meanwhile
            return Ok(());
        }
        let mut seed = first.to_vec();
        while seed.len() < total as usize {
            let payload = self.command(
                Command::GetSeed {
                    mode: 1,
                    resource: resource.bit(),
                },
                timeouts::T1,
            )?;
            anyhow::ensure!(payload.len() > 1, "GET_SEED returned no seed data");
            seed.extend_from_slice(&payload[1..]);
        }
        seed.truncate(total as usize);
        log::debug!("seed: {}", hex::encode(&seed));

        let key = self
            .key
            .as_mut()
            .ok_or_else(|| anyhow::format_err!("{} is protected and no key algorithm is set", resource))?
            .compute_key(resource, &seed)?;
        anyhow::ensure!(
            !key.is_empty() && key.len() <= self.max_cto() - 2,
            "key of {} bytes does not fit into one UNLOCK",
            key.len()
        );
        let payload = self.command(Command::Unlock { key }, timeouts::T1)?;
        let protection = ResourceMask::from_bits(
            *payload
                .first()
                .ok_or_else(|| anyhow::format_err!("UNLOCK response too short"))?,
        );
        anyhow::ensure!(!protection.contains(resource), "unlocking {} failed", resource);
        log::info!("{} unlocked", resource);
        Ok(())
    }

    /// Unlocks programming and starts the programming session.
    pub fn start_programming(&mut self) -> Result<ProgramStartInfo> {
        self.unlock(Resource::Pgm)?;
        let payload = self.command(Command::ProgramStart, timeouts::T3)?;
        let info = ProgramStartInfo::parse(&payload)?;
        log::debug!("programming started: {:?}", info);
        Ok(info)
    }

    pub fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        self.command(Command::set_mta(address), timeouts::T1)?;
        self.command(Command::program_clear(len), timeouts::T4)?;
        log::debug!("erased 0x{:08x}+{}", address, len);
        Ok(())
    }

    /// Programs `data` at `address`. `progress` is called with the number of bytes
    /// written by each command.
    pub fn write(&mut self, address: u32, data: &[u8], mut progress: impl FnMut(usize)) -> Result<()> {
        anyhow::ensure!(!data.is_empty(), "nothing to write");
        self.command(Command::set_mta(address), timeouts::T1)?;

        // the odd part first, then full PROGRAM_MAX packets
        let max = self.max_cto() - 1;
        let first = data.len() % max;
        let (head, tail) = data.split_at(first);
        if !head.is_empty() {
            self.command(Command::program(head.to_vec()), timeouts::T5)?;
            progress(head.len());
        }
        for chunk in tail.chunks(max) {
            self.command(
                Command::ProgramMax {
                    data: chunk.to_vec(),
                },
                timeouts::T5,
            )?;
            progress(chunk.len());
        }
        Ok(())
    }

    fn upload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        let max = self.max_dto() - 1;
        while data.len() < len {
            let n = (len - data.len()).min(max);
            let payload = self.command(Command::Upload { len: n as u8 }, timeouts::T1)?;
            anyhow::ensure!(payload.len() >= n, "UPLOAD returned {} of {} bytes", payload.len(), n);
            data.extend_from_slice(&payload[..n]);
        }
        Ok(data)
    }

    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.command(Command::set_mta(address), timeouts::T1)?;
        self.upload(len)
    }

    pub fn checksum(&mut self, address: u32, len: u32) -> Result<ChecksumInfo> {
        self.command(Command::set_mta(address), timeouts::T1)?;
        let payload = self.command(Command::BuildChecksum { size: len }, timeouts::T1)?;
        ChecksumInfo::parse(&payload, self.byte_order())
    }

    /// Ends the programming session. The target writes its checksum record and resets.
    pub fn stop_programming(&mut self) -> Result<()> {
        self.command(Command::program(vec![]), timeouts::T5)?;
        self.reset()
    }

    /// PROGRAM_RESET. A missing answer is accepted, the target may reset first.
    pub fn reset(&mut self) -> Result<()> {
        let order = self.byte_order();
        match self
            .transport
            .transfer(Command::ProgramReset, order, timeouts::T5)
        {
            Ok(resp) => {
                resp.into_result().context("PROGRAM_RESET failed")?;
            }
            Err(e) => log::debug!("no answer to PROGRAM_RESET: {}", e),
        }
        log::info!("Device reset");
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.command(Command::Disconnect, timeouts::T1)?;
        Ok(())
    }

    /// Erases and programs all segments, optionally reads them back, then ends the
    /// session.
    pub fn flash(
        &mut self,
        segments: &[Segment],
        verify: bool,
        mut progress: impl FnMut(usize),
    ) -> Result<()> {
        self.start_programming()?;
        for segment in segments {
            self.erase(segment.address, segment.data.len() as u32)?;
        }
        for segment in segments {
            log::info!(
                "Programming 0x{:08x}..0x{:08x}",
                segment.address,
                segment.end()
            );
            self.write(segment.address, &segment.data, &mut progress)?;
        }
        if verify {
            self.verify(segments)?;
        }
        self.stop_programming()
    }

    /// Reads back all segments and compares them.
    pub fn verify(&mut self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            let data = self.read(segment.address, segment.data.len())?;
            if let Some(i) = data.iter().zip(&segment.data).position(|(a, b)| a != b) {
                anyhow::bail!(
                    "Verify failed at 0x{:08x}: expected {:02x}, read {:02x}",
                    segment.address + i as u32,
                    segment.data[i],
                    data[i]
                );
            }
        }
        log::info!("Verified!");
        Ok(())
    }
}
