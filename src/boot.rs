//! Service loop of the resident bootloader.

use anyhow::Result;

use crate::config::Config;
use crate::engine::{Engine, Outcome};
use crate::hal::{Deadline, Link, NoWatchdog, Watchdog};
use crate::nvm::Nvm;
use crate::packet::Reassembler;
use crate::security::SeedKey;
use crate::update::FileUpdater;

/// What the platform has to do after [`Bootloader::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    /// Reset the target, the programming sequence has ended.
    Reset,
    /// Jump to the application, it passed the checksum check.
    StartApplication,
}

/// Entry window after power-up. A host connecting within the window keeps the
/// bootloader active.
#[derive(Debug, Clone, Copy)]
pub struct Backdoor {
    deadline: Deadline,
    open: bool,
}

impl Backdoor {
    pub fn new(now: u32, timeout_ms: u32) -> Self {
        Backdoor {
            deadline: Deadline::after(now, timeout_ms),
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Sets a new window length, counted from when the window was opened.
    pub fn extend(&mut self, timeout_ms: u32) {
        self.deadline = Deadline::after(self.deadline.start(), timeout_ms);
    }

    /// Opens the window again, starting now.
    pub fn restart(&mut self, now: u32) {
        self.deadline = Deadline::after(now, self.deadline.timeout_ms());
        self.open = true;
    }

    /// Returns true once, when the window closes.
    pub fn close_if_expired(&mut self, now: u32) -> bool {
        if self.open && self.deadline.expired(now) {
            self.open = false;
            true
        } else {
            false
        }
    }
}

pub struct Bootloader<L: Link, N: Nvm> {
    link: L,
    engine: Engine<N>,
    rx: Reassembler,
    watchdog: Box<dyn Watchdog>,
    backdoor: Backdoor,
    tx_timeout_ms: u32,
    file_update: Option<FileUpdater>,
}

impl<L: Link, N: Nvm> Bootloader<L, N> {
    pub fn new(config: Config, link: L, nvm: N, seed_key: Box<dyn SeedKey>) -> Result<Self> {
        let rx = Reassembler::new(config.framing, config.max_cto, config.rx_timeout_ms);
        let backdoor = Backdoor::new(link.now_ms(), config.backdoor_ms);
        let tx_timeout_ms = config.tx_timeout_ms;
        Ok(Bootloader {
            engine: Engine::new(config, nvm, seed_key)?,
            link,
            rx,
            watchdog: Box::new(NoWatchdog),
            backdoor,
            tx_timeout_ms,
            file_update: None,
        })
    }

    pub fn with_watchdog(mut self, watchdog: impl Watchdog + 'static) -> Self {
        self.watchdog = Box::new(watchdog);
        self
    }

    /// Replaces the engine, e.g. one configured with calibration pages.
    pub fn with_engine(mut self, f: impl FnOnce(Engine<N>) -> Engine<N>) -> Self {
        self.engine = f(self.engine);
        self
    }

    /// Firmware update from a local file, run while no host is connected.
    pub fn with_file_update(mut self, updater: FileUpdater) -> Self {
        self.file_update = Some(updater);
        self
    }

    pub fn file_update(&self) -> Option<&FileUpdater> {
        self.file_update.as_ref()
    }

    /// Starts the file update. Refused while a host is connected or without an updater.
    pub fn request_file_update(&mut self) -> bool {
        let connected = self.engine.is_connected();
        self.file_update
            .as_mut()
            .is_some_and(|updater| updater.request(connected))
    }

    pub fn engine(&self) -> &Engine<N> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<N> {
        &mut self.engine
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn backdoor(&self) -> &Backdoor {
        &self.backdoor
    }

    pub fn backdoor_mut(&mut self) -> &mut Backdoor {
        &mut self.backdoor
    }

    pub fn into_parts(self) -> (L, N) {
        (self.link, self.engine.into_nvm())
    }

    /// One iteration of the service loop.
    pub fn poll(&mut self) -> Option<BootAction> {
        self.watchdog.service();

        if let Some(packet) = self.rx.service(&mut self.link) {
            log::debug!("=> {}", hex::encode(packet.as_bytes()));
            match self.engine.handle(packet.as_bytes()) {
                Outcome::Silent => {}
                Outcome::Respond(response) => self.transmit(&response),
                Outcome::RespondThenReset(response) => {
                    self.transmit(&response);
                    return Some(BootAction::Reset);
                }
            }
        }

        if let Some(action) = self.service_file_update() {
            return Some(action);
        }
        self.check_backdoor()
    }

    /// Polls until the platform has to act.
    pub fn run(&mut self) -> BootAction {
        loop {
            if let Some(action) = self.poll() {
                return action;
            }
        }
    }

    fn transmit(&mut self, response: &[u8]) {
        log::debug!("<= {}", hex::encode(response));
        let frame = self.rx.framing().encode(response);
        let timeout = self.tx_timeout_ms.saturating_mul(frame.len() as u32);
        if self
            .link
            .send_blocking(&frame, timeout, self.watchdog.as_mut())
        {
            self.engine.packet_transmitted();
        } else {
            log::warn!("transmitting {} bytes timed out", frame.len());
        }
    }

    /// The application is started once a file update succeeded.
    fn service_file_update(&mut self) -> Option<BootAction> {
        let updater = self.file_update.as_mut()?;
        updater.check_request(self.engine.is_connected());
        match updater.task(self.engine.nvm_mut())? {
            Ok(()) => Some(BootAction::StartApplication),
            Err(_) => None,
        }
    }

    fn check_backdoor(&mut self) -> Option<BootAction> {
        if self.engine.is_connected() {
            return None;
        }
        if self.file_update.as_ref().is_some_and(|u| !u.is_idle()) {
            return None;
        }
        if !self.backdoor.close_if_expired(self.link.now_ms()) {
            return None;
        }
        if self.engine.nvm_mut().verify_checksum() {
            log::info!("no host connected, starting the application");
            Some(BootAction::StartApplication)
        } else {
            log::warn!("no valid application, staying in the bootloader");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::hal::{Memory, Unit};
    use crate::nvm::NvmError;
    use crate::security::DemoKey;

    #[derive(Default)]
    struct TestLink {
        rx: VecDeque<Unit>,
        sent: Vec<Vec<u8>>,
        now: u32,
        refuse: bool,
    }

    impl TestLink {
        fn feed(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().map(|&b| Unit::Byte(b)));
        }
    }

    impl Link for TestLink {
        fn try_receive(&mut self) -> Option<Unit> {
            self.rx.pop_front()
        }

        fn send_blocking(&mut self, data: &[u8], _: u32, watchdog: &mut dyn Watchdog) -> bool {
            watchdog.service();
            if self.refuse {
                return false;
            }
            self.sent.push(data.to_vec());
            true
        }

        fn now_ms(&self) -> u32 {
            self.now
        }
    }

    #[derive(Default)]
    struct Image {
        valid: bool,
        verified: usize,
    }

    impl Memory for Image {
        fn read(&mut self, _: u32, buf: &mut [u8]) -> bool {
            buf.fill(0xff);
            true
        }
    }

    impl Nvm for Image {
        fn init(&mut self) {}

        fn write(&mut self, _: u32, _: &[u8]) -> Result<(), NvmError> {
            Ok(())
        }

        fn erase(&mut self, _: u32, _: u32) -> Result<(), NvmError> {
            Ok(())
        }

        fn write_checksum(&mut self) -> bool {
            true
        }

        fn verify_checksum(&mut self) -> bool {
            self.verified += 1;
            self.valid
        }

        fn done(&mut self) -> bool {
            true
        }
    }

    fn bootloader(valid: bool) -> Bootloader<TestLink, Image> {
        let image = Image {
            valid,
            ..Default::default()
        };
        Bootloader::new(
            Config::default(),
            TestLink::default(),
            image,
            Box::new(DemoKey),
        )
        .unwrap()
    }

    fn poll_n(b: &mut Bootloader<TestLink, Image>, n: usize) -> Option<BootAction> {
        (0..n).find_map(|_| b.poll())
    }

    #[test]
    fn backdoor_window() {
        let mut d = Backdoor::new(u32::MAX - 10, 100);
        assert!(!d.close_if_expired(50));
        assert!(d.close_if_expired((u32::MAX - 10).wrapping_add(101)));
        assert!(!d.is_open());
        assert!(!d.close_if_expired(1000));

        d.restart(1000);
        assert!(d.is_open());
        d.extend(300);
        assert!(!d.close_if_expired(1200));
        assert!(d.close_if_expired(1301));
    }

    #[test]
    fn starts_valid_application_after_window() {
        let mut b = bootloader(true);
        assert_eq!(poll_n(&mut b, 10), None);
        b.link_mut().now = 500;
        assert_eq!(b.poll(), None);
        b.link_mut().now = 501;
        assert_eq!(b.poll(), Some(BootAction::StartApplication));
    }

    #[test]
    fn stays_with_invalid_application() {
        let mut b = bootloader(false);
        b.link_mut().now = 1000;
        assert_eq!(poll_n(&mut b, 10), None);
        assert_eq!(b.engine().nvm().verified, 1);
    }

    #[test]
    fn connected_host_keeps_bootloader() {
        let mut b = bootloader(true);
        b.link_mut().feed(&[0x02, 0xff, 0x00]);
        assert_eq!(poll_n(&mut b, 3), None);
        assert_eq!(
            b.link().sent,
            vec![vec![0x08, 0xff, 0x10, 0x00, 64, 64, 0, 0x01, 0x01]]
        );
        b.link_mut().now = 10_000;
        assert_eq!(poll_n(&mut b, 10), None);
        assert_eq!(b.engine().nvm().verified, 0);
    }

    #[test]
    fn program_reset_resets_after_response() {
        let mut b = bootloader(true);
        b.link_mut().feed(&[0x02, 0xff, 0x00, 0x01, 0xd2, 0x01, 0xcf]);
        assert_eq!(poll_n(&mut b, 7), Some(BootAction::Reset));
        assert_eq!(b.link().sent.last(), Some(&vec![0x01, 0xff]));
    }

    #[test]
    fn failed_transmission_reports_busy_once() {
        let mut b = bootloader(true);
        b.link_mut().refuse = true;
        b.link_mut().feed(&[0x02, 0xff, 0x00]);
        poll_n(&mut b, 3);
        b.link_mut().refuse = false;
        b.link_mut().feed(&[0x01, 0xfd, 0x01, 0xfd]);
        poll_n(&mut b, 4);
        assert_eq!(
            b.link().sent,
            vec![vec![0x02, 0xfe, 0x10], vec![0x06, 0xff, 0, 0, 0, 0, 0]]
        );
    }
}
