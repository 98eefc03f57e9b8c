//! Simulated target: the bootloader and the application's activation detector on top
//! of a [`FlashSim`], driven through any [`Link`].
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;

use super::Transport;
use crate::boot::{BootAction, Bootloader};
use crate::config::Config;
use crate::detector::ActivationDetector;
use crate::hal::{Deadline, Link, Unit, Watchdog};
use crate::nvm::FlashSim;
use crate::packet::{Framing, Reassembler};
use crate::security::{DemoKey, SeedKey};

/// Creates the seed/key algorithm of a freshly reset target.
pub type SeedKeyFactory = Box<dyn Fn() -> Box<dyn SeedKey>>;

fn demo_key() -> Box<dyn SeedKey> {
    Box::new(DemoKey)
}

fn enter_bootloader() {
    log::info!("application requested the bootloader, resetting");
}

enum State<L: Link> {
    Bootloader(Bootloader<L, FlashSim>),
    Application {
        detector: ActivationDetector<fn()>,
        link: L,
        flash: FlashSim,
    },
}

/// A target that resets into the bootloader after programming and starts the
/// application when its image is valid.
pub struct SimTarget<L: Link> {
    config: Config,
    seed_key: SeedKeyFactory,
    state: Option<State<L>>,
    resets: usize,
}

impl<L: Link> SimTarget<L> {
    pub fn new(config: Config, link: L, flash: FlashSim) -> Result<Self> {
        Self::with_seed_key(config, link, flash, Box::new(demo_key))
    }

    pub fn with_seed_key(
        config: Config,
        link: L,
        flash: FlashSim,
        seed_key: SeedKeyFactory,
    ) -> Result<Self> {
        let boot = Bootloader::new(config.clone(), link, flash, seed_key())?;
        Ok(SimTarget {
            config,
            seed_key,
            state: Some(State::Bootloader(boot)),
            resets: 0,
        })
    }

    /// Number of resets since power-up.
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn is_running_application(&self) -> bool {
        matches!(self.state, Some(State::Application { .. }))
    }

    pub fn link(&self) -> Option<&L> {
        match self.state.as_ref()? {
            State::Bootloader(boot) => Some(boot.link()),
            State::Application { link, .. } => Some(link),
        }
    }

    pub fn link_mut(&mut self) -> Option<&mut L> {
        match self.state.as_mut()? {
            State::Bootloader(boot) => Some(boot.link_mut()),
            State::Application { link, .. } => Some(link),
        }
    }

    pub fn flash(&self) -> Option<&FlashSim> {
        match self.state.as_ref()? {
            State::Bootloader(boot) => Some(boot.engine().nvm()),
            State::Application { flash, .. } => Some(flash),
        }
    }

    fn reset(&mut self, link: L, flash: FlashSim) -> Result<State<L>> {
        self.resets += 1;
        let boot = Bootloader::new(self.config.clone(), link, flash, (self.seed_key)())?;
        Ok(State::Bootloader(boot))
    }

    /// Runs one iteration of whatever is currently executing on the target.
    pub fn poll(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| anyhow::format_err!("simulated target failed to restart"))?;
        let next = match state {
            State::Bootloader(mut boot) => match boot.poll() {
                None => State::Bootloader(boot),
                Some(BootAction::Reset) => {
                    log::info!("target reset");
                    let (link, flash) = boot.into_parts();
                    self.reset(link, flash)?
                }
                Some(BootAction::StartApplication) => {
                    log::info!("application started");
                    let (link, flash) = boot.into_parts();
                    State::Application {
                        detector: ActivationDetector::new(
                            self.config.framing,
                            self.config.max_cto,
                            self.config.rx_timeout_ms,
                            enter_bootloader as fn(),
                        ),
                        link,
                        flash,
                    }
                }
            },
            State::Application {
                mut detector,
                mut link,
                flash,
            } => {
                if detector.poll(&mut link) {
                    self.reset(link, flash)?
                } else {
                    State::Application {
                        detector,
                        link,
                        flash,
                    }
                }
            }
        };
        self.state = Some(next);
        Ok(())
    }
}

/// In-memory link with a virtual millisecond clock.
#[derive(Debug, Default)]
pub struct SimLink {
    rx: VecDeque<Unit>,
    sent: VecDeque<Vec<u8>>,
    now: u32,
}

impl SimLink {
    pub fn deliver(&mut self, unit: Unit) {
        self.rx.push_back(unit);
    }

    pub fn take_sent(&mut self) -> Option<Vec<u8>> {
        self.sent.pop_front()
    }

    pub fn is_idle(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn advance(&mut self, ms: u32) {
        self.now = self.now.wrapping_add(ms);
    }
}

impl Link for SimLink {
    fn try_receive(&mut self) -> Option<Unit> {
        self.rx.pop_front()
    }

    fn send_blocking(&mut self, data: &[u8], _timeout_ms: u32, watchdog: &mut dyn Watchdog) -> bool {
        watchdog.service();
        self.sent.push_back(data.to_vec());
        true
    }

    fn now_ms(&self) -> u32 {
        self.now
    }
}

/// Host transport talking to an in-process [`SimTarget`].
pub struct SimTransport {
    target: SimTarget<SimLink>,
    framing: Framing,
}

impl SimTransport {
    pub fn new(config: Config, flash: FlashSim) -> Result<Self> {
        Self::with_seed_key(config, flash, Box::new(demo_key))
    }

    pub fn with_seed_key(config: Config, flash: FlashSim, seed_key: SeedKeyFactory) -> Result<Self> {
        let framing = config.framing;
        Ok(SimTransport {
            target: SimTarget::with_seed_key(config, SimLink::default(), flash, seed_key)?,
            framing,
        })
    }

    pub fn target(&self) -> &SimTarget<SimLink> {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut SimTarget<SimLink> {
        &mut self.target
    }

    /// Lets the target run for `ms` of virtual time.
    pub fn idle(&mut self, ms: u32) -> Result<()> {
        for _ in 0..ms {
            self.target.poll()?;
            self.link()?.advance(1);
        }
        Ok(())
    }

    fn link(&mut self) -> Result<&mut SimLink> {
        self.target
            .link_mut()
            .ok_or_else(|| anyhow::format_err!("simulated target is gone"))
    }

    fn unframe(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut rx = Reassembler::new(self.framing, 0xff, u32::MAX);
        let packet = match self.framing {
            Framing::Frame => rx.push(Unit::Frame(frame.to_vec()), 0),
            Framing::Stream { .. } => frame.iter().find_map(|&b| rx.push(Unit::Byte(b), 0)),
        };
        packet
            .map(|p| p.into_inner())
            .ok_or_else(|| anyhow::format_err!("malformed response: {}", hex::encode(frame)))
    }
}

impl Transport for SimTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let framing = self.framing;
        let frame = framing.encode(raw);
        let link = self.link()?;
        match framing {
            Framing::Frame => link.deliver(Unit::Frame(frame)),
            Framing::Stream { .. } => frame.into_iter().for_each(|b| link.deliver(Unit::Byte(b))),
        }
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let deadline = Deadline::after(self.link()?.now_ms(), timeout_ms);
        loop {
            self.target.poll()?;
            let link = self.link()?;
            if let Some(frame) = link.take_sent() {
                return self.unframe(&frame);
            }
            if link.is_idle() {
                link.advance(1);
            }
            if deadline.expired(link.now_ms()) {
                anyhow::bail!("timeout after {} ms waiting for the target", timeout_ms);
            }
        }
    }
}
