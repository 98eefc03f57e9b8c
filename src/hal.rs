//! Collaborators the bootloader engine needs from the platform.
//!
//! Everything here is implemented per board: the engine only ever talks to these
//! traits, which keeps it testable on the host with simple doubles.

/// One unit received from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A single byte from a byte-stream link such as a UART.
    Byte(u8),
    /// A complete frame from a frame link such as CAN, first byte is the packet length.
    Frame(Vec<u8>),
}

/// Keeps the hardware watchdog from firing during bounded waits.
pub trait Watchdog {
    fn service(&mut self);
}

/// For platforms without a watchdog.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn service(&mut self) {}
}

/// Transport link of the target, together with its free running millisecond counter.
pub trait Link {
    /// Returns the next received unit, if any. Must not block.
    fn try_receive(&mut self) -> Option<Unit>;

    /// Sends `data` as is, waiting at most `timeout_ms` for the transmission to
    /// complete. The watchdog must be serviced while waiting.
    fn send_blocking(&mut self, data: &[u8], timeout_ms: u32, watchdog: &mut dyn Watchdog)
    -> bool;

    /// Monotonic free running millisecond counter. Wraps around.
    fn now_ms(&self) -> u32;
}

/// Random access to the target's address space.
pub trait Memory {
    /// Fills `buf` with the bytes starting at `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> bool;

    /// Writes RAM, used by the calibration resource. Refused unless overridden.
    fn store(&mut self, addr: u32, data: &[u8]) -> bool {
        let _ = (addr, data);
        false
    }
}

/// Calibration page switching of the application.
pub trait CalPages {
    fn set_page(&mut self, segment: u8, page: u8) -> bool;
    fn get_page(&mut self, segment: u8) -> u8;
}

/// Point in time on a wrapping millisecond counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub fn after(now: u32, timeout_ms: u32) -> Self {
        Deadline {
            start: now,
            timeout_ms,
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn elapsed(&self, now: u32) -> u32 {
        now.wrapping_sub(self.start)
    }

    /// Strictly later than the timeout.
    pub fn expired(&self, now: u32) -> bool {
        self.elapsed(now) > self.timeout_ms
    }
}

/// Polls `done` until it reports completion or the deadline passes, servicing the
/// watchdog on every iteration. Returns false on timeout.
pub fn wait_until(
    now: impl Fn() -> u32,
    timeout_ms: u32,
    watchdog: &mut dyn Watchdog,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Deadline::after(now(), timeout_ms);
    loop {
        watchdog.service();
        if done() {
            return true;
        }
        if deadline.expired(now()) {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct CountingWatchdog(u32);

    impl Watchdog for CountingWatchdog {
        fn service(&mut self) {
            self.0 += 1;
        }
    }

    #[test]
    fn deadline_survives_counter_wrap() {
        let deadline = Deadline::after(u32::MAX - 10, 100);
        assert!(!deadline.expired(u32::MAX));
        assert!(!deadline.expired(89));
        assert!(deadline.expired(90));
    }

    #[test]
    fn wait_until_times_out_and_services_watchdog() {
        let clock = Cell::new(0u32);
        let mut wd = CountingWatchdog(0);
        let ok = wait_until(
            || {
                clock.set(clock.get() + 1);
                clock.get()
            },
            10,
            &mut wd,
            || false,
        );
        assert!(!ok);
        assert!(wd.0 >= 5);
    }

    #[test]
    fn wait_until_returns_once_done() {
        let mut calls = 0;
        let mut wd = NoWatchdog;
        assert!(wait_until(
            || 0,
            10,
            &mut wd,
            || {
                calls += 1;
                calls == 3
            }
        ));
        assert_eq!(calls, 3);
    }
}
