//! Host side transports to the bootloader.
use std::time::Duration;

use anyhow::Result;

use crate::config::ByteOrder;
use crate::protocol::{Command, Response};

pub use self::serial::{Baudrate, SerialLink, SerialTransport};
pub use self::sim::{SimLink, SimTarget, SimTransport};
pub use self::usb::UsbTransport;

mod serial;
mod sim;
mod usb;

/// Abstraction of the transport layer.
/// Might be a USB, a serial port, or a simulated target.
pub trait Transport {
    /// Sends one command packet, framing is up to the transport.
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    /// Receives one response packet without its framing.
    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    fn transfer(&mut self, cmd: Command, order: ByteOrder, timeout: Duration) -> Result<Response> {
        let req = cmd.into_raw(order)?;
        log::debug!("=> {}", hex::encode(&req));
        self.send_raw(&req)?;

        let resp = self.recv_raw(timeout)?;
        log::debug!("<= {}", hex::encode(&resp));
        Response::from_raw(&resp)
    }
}
