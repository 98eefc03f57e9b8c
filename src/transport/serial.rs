//! Serial Transportation.
//!
//! Packets travel as `[len, packet.., checksum?]` on the UART.
use std::fmt::Display;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use clap::{ValueEnum, builder::PossibleValue};
use serialport::SerialPort;

use super::Transport;
use crate::hal::{Link, Unit, Watchdog};
use crate::packet::{Framing, checksum_byte};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    Baud9600,
    Baud57600,
    #[default]
    Baud115200,
    Baud1m,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud9600 => 9600,
            Baudrate::Baud57600 => 57600,
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud1m => 1000000,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud9600,
            Baudrate::Baud57600,
            Baudrate::Baud115200,
            Baudrate::Baud1m,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud9600 => Some(PossibleValue::new("Baud9600").aliases(["9600"])),
            Baudrate::Baud57600 => Some(PossibleValue::new("Baud57600").aliases(["57600"])),
            Baudrate::Baud115200 => Some(PossibleValue::new("Baud115200").aliases(["115200"])),
            Baudrate::Baud1m => {
                Some(PossibleValue::new("Baud1m").aliases(["1000000", "1_000_000", "1m"]))
            }
        }
    }
}

fn open_port(port: &str, baudrate: Baudrate) -> Result<Box<dyn SerialPort>> {
    log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
    let port = serialport::new(port, baudrate.into())
        .timeout(Duration::from_millis(1000))
        .open()?;
    Ok(port)
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
    /// Trailing checksum byte on every packet
    checksum: bool,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: Baudrate, checksum: bool) -> Result<Self> {
        Ok(SerialTransport {
            serial_port: open_port(port, baudrate)?,
            checksum,
        })
    }

    pub fn open_nth(nth: usize, baudrate: Baudrate, checksum: bool) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate, checksum),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any(baudrate: Baudrate, checksum: bool) -> Result<Self> {
        Self::open_nth(0, baudrate, checksum)
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        anyhow::ensure!(
            !raw.is_empty() && raw.len() <= 0xff,
            "invalid packet length {}",
            raw.len()
        );
        let frame = Framing::Stream {
            checksum: self.checksum,
        }
        .encode(raw);

        // drop leftovers of an earlier, timed out exchange
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        self.serial_port.write_all(&frame)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.serial_port.set_timeout(timeout)?;

        let mut len = [0u8; 1];
        self.serial_port.read_exact(&mut len)?;
        anyhow::ensure!(len[0] != 0, "zero length response");

        let extra = usize::from(self.checksum);
        let mut buf = vec![0u8; len[0] as usize + extra];
        self.serial_port.read_exact(&mut buf)?;

        if self.checksum {
            let cs = buf.pop().unwrap_or_default();
            let mut framed = vec![len[0]];
            framed.extend_from_slice(&buf);
            anyhow::ensure!(
                checksum_byte(&framed) == cs,
                "response checksum mismatch: {}",
                hex::encode(&framed)
            );
        }
        Ok(buf)
    }
}

/// Target side of a UART, used to run a simulated target on a real port.
pub struct SerialLink {
    serial_port: Box<dyn SerialPort>,
    started: Instant,
}

impl SerialLink {
    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        Ok(SerialLink {
            serial_port: open_port(port, baudrate)?,
            started: Instant::now(),
        })
    }

    fn write_with_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        self.serial_port.set_timeout(timeout)?;
        self.serial_port.write_all(data)?;
        self.serial_port.flush()
    }
}

impl Link for SerialLink {
    fn try_receive(&mut self) -> Option<Unit> {
        match self.serial_port.bytes_to_read() {
            Ok(0) => None,
            Ok(_) => {
                let mut b = [0u8; 1];
                self.serial_port.read_exact(&mut b).ok()?;
                Some(Unit::Byte(b[0]))
            }
            Err(e) => {
                log::warn!("serial port: {}", e);
                None
            }
        }
    }

    fn send_blocking(
        &mut self,
        data: &[u8],
        timeout_ms: u32,
        watchdog: &mut dyn Watchdog,
    ) -> bool {
        watchdog.service();
        let sent = self.write_with_timeout(data, Duration::from_millis(timeout_ms.into()));
        watchdog.service();
        match sent {
            Ok(()) => true,
            Err(e) => {
                log::warn!("serial port: {}", e);
                false
            }
        }
    }

    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
}
