//! Firmware update from a local file, e.g. an image on an SD card.
//!
//! The update runs in small steps from the service loop so the watchdog keeps being
//! served: the file is read, every segment is erased, then one segment is programmed
//! per step. It goes through the same [`Programmer`] as an XCP session, the checksum
//! record is written at the end.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::format::{self, Segment};
use crate::nvm::Nvm;
use crate::program::Programmer;
use crate::protocol::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    CannotOpenFile,
    InvalidFile,
    CannotErase,
    CannotProgram,
    CannotWriteChecksum,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UpdateError::CannotOpenFile => "cannot open the firmware file",
            UpdateError::InvalidFile => "invalid firmware file",
            UpdateError::CannotErase => "cannot erase memory",
            UpdateError::CannotProgram => "cannot program memory",
            UpdateError::CannotWriteChecksum => "cannot write the checksum",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for UpdateError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateState {
    #[default]
    Idle,
    Starting,
    Erasing { next: usize },
    Programming { next: usize },
}

pub struct FileUpdater {
    path: PathBuf,
    /// Load address of images without addresses
    base: u32,
    state: UpdateState,
    segments: Vec<Segment>,
    programmer: Programmer,
    requested: Option<Box<dyn FnMut() -> bool>>,
}

impl fmt::Debug for FileUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpdater")
            .field("path", &self.path)
            .field("state", &self.state)
            .finish()
    }
}

impl FileUpdater {
    pub fn new<P: AsRef<Path>>(path: P, base: u32) -> Self {
        FileUpdater {
            path: path.as_ref().to_path_buf(),
            base,
            state: UpdateState::Idle,
            segments: vec![],
            programmer: Programmer::default(),
            requested: None,
        }
    }

    /// Asked while idle and no host is connected, e.g. whether a button is pressed.
    pub fn with_request_hook(mut self, hook: impl FnMut() -> bool + 'static) -> Self {
        self.requested = Some(Box::new(hook));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == UpdateState::Idle
    }

    /// Starts an update. Refused while a host is connected or an update runs.
    pub fn request(&mut self, host_connected: bool) -> bool {
        if host_connected || !self.is_idle() {
            return false;
        }
        log::info!("firmware update from {} requested", self.path.display());
        self.state = UpdateState::Starting;
        true
    }

    /// Starts an update when the request hook asks for one.
    pub fn check_request(&mut self, host_connected: bool) -> bool {
        if host_connected || !self.is_idle() {
            return false;
        }
        let wanted = self.requested.as_mut().is_some_and(|hook| hook());
        wanted && self.request(host_connected)
    }

    /// One step of a running update. Returns the result once the update ended.
    pub fn task(&mut self, nvm: &mut dyn Nvm) -> Option<Result<(), UpdateError>> {
        match self.step(nvm) {
            Ok(true) => {
                log::info!("firmware update from {} done", self.path.display());
                self.state = UpdateState::Idle;
                self.segments.clear();
                Some(Ok(()))
            }
            Ok(false) => None,
            Err(e) => {
                log::error!("firmware update from {} failed: {}", self.path.display(), e);
                self.programmer.abort();
                self.state = UpdateState::Idle;
                self.segments.clear();
                Some(Err(e))
            }
        }
    }

    /// True when the update completed.
    fn step(&mut self, nvm: &mut dyn Nvm) -> Result<bool, UpdateError> {
        match self.state {
            UpdateState::Idle => Ok(false),
            UpdateState::Starting => {
                let raw = std::fs::read(&self.path).map_err(|e| {
                    log::debug!("{}: {}", self.path.display(), e);
                    UpdateError::CannotOpenFile
                })?;
                self.segments = format::parse_firmware(&self.path, raw, self.base).map_err(|e| {
                    log::debug!("{}: {}", self.path.display(), e);
                    UpdateError::InvalidFile
                })?;
                if self.segments.is_empty() {
                    return Err(UpdateError::InvalidFile);
                }
                self.programmer
                    .start(nvm)
                    .map_err(|_| UpdateError::CannotErase)?;
                self.state = UpdateState::Erasing { next: 0 };
                Ok(false)
            }
            UpdateState::Erasing { next } => {
                let segment = &self.segments[next];
                self.programmer
                    .clear(nvm, segment.address, segment.data.len() as u32)
                    .map_err(|_| UpdateError::CannotErase)?;
                log::debug!("erased {:?}", segment);
                self.state = if next + 1 < self.segments.len() {
                    UpdateState::Erasing { next: next + 1 }
                } else {
                    UpdateState::Programming { next: 0 }
                };
                Ok(false)
            }
            UpdateState::Programming { next } if next < self.segments.len() => {
                let segment = &self.segments[next];
                self.programmer
                    .program(nvm, segment.address, &segment.data)
                    .map_err(|_| UpdateError::CannotProgram)?;
                log::debug!("programmed {:?}", segment);
                self.state = UpdateState::Programming { next: next + 1 };
                Ok(false)
            }
            UpdateState::Programming { .. } => match self.programmer.reset(nvm) {
                Ok(()) => Ok(true),
                Err(ErrorCode::Generic) => Err(UpdateError::CannotWriteChecksum),
                Err(_) => Err(UpdateError::CannotProgram),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::config::ProfileDB;
    use crate::nvm::FlashSim;

    fn flash() -> FlashSim {
        let profile = ProfileDB::find("STM32F103C8").unwrap();
        FlashSim::new(profile, ChecksumKind::Crc32).unwrap()
    }

    fn image(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("xcpboot-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn run(updater: &mut FileUpdater, nvm: &mut dyn Nvm) -> Result<(), UpdateError> {
        for _ in 0..100 {
            if let Some(result) = updater.task(nvm) {
                return result;
            }
        }
        panic!("update did not finish");
    }

    #[test]
    fn binary_image_is_programmed() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let path = image("update.bin", &data);
        let mut nvm = flash();
        let mut updater = FileUpdater::new(&path, 0x0800_2000);

        assert!(updater.request(false));
        assert!(!updater.request(false));
        assert_eq!(updater.state(), UpdateState::Starting);
        run(&mut updater, &mut nvm).unwrap();

        assert!(updater.is_idle());
        assert_eq!(nvm.flash()[0x2000..0x2000 + data.len()], data[..]);
        assert!(nvm.verify_checksum());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn refused_while_host_connected() {
        let mut updater = FileUpdater::new("fw.bin", 0).with_request_hook(|| true);
        assert!(!updater.request(true));
        assert!(!updater.check_request(true));
        assert!(updater.is_idle());
        assert!(updater.check_request(false));
        assert_eq!(updater.state(), UpdateState::Starting);
    }

    #[test]
    fn missing_file() {
        let path = std::env::temp_dir().join("xcpboot-no-such-image.bin");
        let mut updater = FileUpdater::new(path, 0x0800_2000);
        let mut nvm = flash();
        updater.request(false);
        assert_eq!(
            run(&mut updater, &mut nvm),
            Err(UpdateError::CannotOpenFile)
        );
        assert!(updater.is_idle());
    }

    #[test]
    fn image_outside_flash_cannot_be_erased() {
        let path = image("outside.bin", &[1, 2, 3, 4]);
        let mut nvm = flash();
        let mut updater = FileUpdater::new(&path, 0x2000_0000);
        updater.request(false);
        assert_eq!(run(&mut updater, &mut nvm), Err(UpdateError::CannotErase));
        assert!(!nvm.verify_checksum());
        std::fs::remove_file(path).unwrap();
    }
}
