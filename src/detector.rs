//! Bootloader activation from inside the running application.
//!
//! The application keeps polling an [`ActivationDetector`] on its communication
//! link. It only understands CONNECT and never answers: on a CONNECT request it hands
//! control to the bootloader, which then replies to the host after the reset.

use crate::constants::commands;
use crate::hal::Link;
use crate::packet::{Framing, Packet, Reassembler};

/// Device-specific operations of the [`ActivationDetector`].
pub trait ActivationOps {
    /// Activate the bootloader.
    ///
    /// Called once a CONNECT request was received. Usually performs a software reset
    /// and does not return.
    fn enter(&mut self);
}

impl<F: FnMut()> ActivationOps for F {
    fn enter(&mut self) {
        self()
    }
}

pub struct ActivationDetector<T: ActivationOps> {
    ops: T,
    rx: Reassembler,
}

impl<T: ActivationOps> ActivationDetector<T> {
    pub fn new(framing: Framing, max_cto: usize, timeout_ms: u32, ops: T) -> Self {
        ActivationDetector {
            ops,
            rx: Reassembler::new(framing, max_cto, timeout_ms),
        }
    }

    /// Polls the link once. Returns true if the bootloader was activated.
    pub fn poll(&mut self, link: &mut dyn Link) -> bool {
        match self.rx.service(link) {
            Some(packet) if is_connect_request(&packet) => {
                log::info!("connect request received, activating bootloader");
                self.ops.enter();
                true
            }
            Some(packet) => {
                log::debug!("ignoring {:?} while application is running", packet);
                false
            }
            None => false,
        }
    }

    pub fn ops(&self) -> &T {
        &self.ops
    }
}

/// CONNECT is exactly two bytes, command code and mode.
fn is_connect_request(packet: &Packet) -> bool {
    matches!(packet.as_bytes(), [commands::CONNECT, _])
}
