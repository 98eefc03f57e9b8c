//! XCP bootloader: the target side engine and a host side loader.

pub mod boot;
pub mod checksum;
pub mod config;
pub mod constants;
pub mod detector;
pub mod engine;
pub mod format;
pub mod hal;
pub mod infotable;
pub mod loader;
pub mod nvm;
pub mod packet;
pub mod program;
pub mod protocol;
pub mod security;
pub mod transport;
pub mod update;

pub use self::boot::{BootAction, Bootloader};
pub use self::config::Config;
pub use self::engine::{Engine, Outcome};
pub use self::loader::XcpLoader;
pub use self::protocol::{Command, Response};
pub use self::transport::Transport;
