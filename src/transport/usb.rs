//! USB bulk transport.
//!
//! One packet per bulk transfer, prefixed with its length.
use std::time::Duration;

use anyhow::Result;
use rusb::{Context, DeviceHandle, UsbContext};

use super::Transport;
use crate::constants::{MAX_PACKET_SIZE, USB_PRODUCT_ID, USB_VENDOR_ID};

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

const SEND_TIMEOUT_MS: u64 = 100;

pub struct UsbTransport {
    device_handle: DeviceHandle<rusb::Context>,
}

fn is_bootloader<T: UsbContext>(device: &rusb::Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == USB_VENDOR_ID && desc.product_id() == USB_PRODUCT_ID)
        .unwrap_or(false)
}

impl UsbTransport {
    pub fn scan_devices() -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(is_bootloader)
            .enumerate()
            .map(|(i, device)| {
                log::debug!("XCP bootloader #{}: {:?}", i, device);
            })
            .count();
        Ok(n)
    }

    /// Opens the `nth` bootloader on the bus and claims its bulk interface.
    pub fn open_nth(nth: usize) -> Result<UsbTransport> {
        let context = Context::new()?;
        let device = context
            .devices()?
            .iter()
            .filter(is_bootloader)
            .nth(nth)
            .ok_or_else(|| {
                anyhow::format_err!(
                    "no XCP bootloader {:04x}:{:04x} at index #{}",
                    USB_VENDOR_ID,
                    USB_PRODUCT_ID,
                    nth
                )
            })?;
        log::debug!("Opening {:?}", device);

        let config = device.config_descriptor(0)?;
        let endpoints: Vec<u8> = config
            .interfaces()
            .next()
            .and_then(|intf| intf.descriptors().next())
            .map(|desc| desc.endpoint_descriptors().map(|ep| ep.address()).collect())
            .unwrap_or_default();
        anyhow::ensure!(
            endpoints.contains(&ENDPOINT_OUT) && endpoints.contains(&ENDPOINT_IN),
            "bulk endpoints 0x{:02x}/0x{:02x} missing, found {:02x?}",
            ENDPOINT_OUT,
            ENDPOINT_IN,
            endpoints
        );

        let mut device_handle = device.open()?;
        device_handle.set_active_configuration(1)?;
        device_handle.claim_interface(0)?;
        Ok(UsbTransport { device_handle })
    }

    pub fn open_any() -> Result<UsbTransport> {
        Self::open_nth(0)
    }
}

impl Transport for UsbTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        anyhow::ensure!(
            !raw.is_empty() && raw.len() <= MAX_PACKET_SIZE,
            "invalid packet length {}",
            raw.len()
        );
        let mut buf = Vec::with_capacity(1 + raw.len());
        buf.push(raw.len() as u8);
        buf.extend_from_slice(raw);
        self.device_handle
            .write_bulk(ENDPOINT_OUT, &buf, Duration::from_millis(SEND_TIMEOUT_MS))?;
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];
        let nread = self.device_handle.read_bulk(ENDPOINT_IN, &mut buf, timeout)?;
        anyhow::ensure!(nread > 0, "empty USB transfer");
        let len = buf[0] as usize;
        anyhow::ensure!(
            len > 0 && len < nread,
            "invalid USB packet: {}",
            hex::encode(&buf[..nread])
        );
        Ok(buf[1..1 + len].to_vec())
    }
}
