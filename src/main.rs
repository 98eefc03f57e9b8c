use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use xcpboot::config::{Config, ProfileDB, parse_number};
use xcpboot::nvm::FlashSim;
use xcpboot::security::{DemoKey, KeyAlgorithm, LibraryKey, SecretKey, SeedKey};
use xcpboot::transport::{
    Baudrate, SerialLink, SerialTransport, SimTarget, SimTransport, Transport, UsbTransport,
};
use xcpboot::{XcpLoader, format};

#[derive(clap::Parser)]
#[command(
    name = "xcpboot",
    version,
    about = "Command-line loader for XCP bootloaders, with a simulated target"
)]
struct Cli {
    /// Turn debug logging on
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use the serial port instead of USB
    #[arg(long, short, global = true)]
    port: Option<String>,

    /// Serial baudrate
    #[arg(long, short, global = true, value_enum, default_value_t = Baudrate::default())]
    baudrate: Baudrate,

    /// Packets on the serial port carry a checksum byte
    #[arg(long, global = true)]
    checksum: bool,

    /// Talk to an in-process simulated target with this profile, e.g. STM32F103C8
    #[arg(long, global = true, conflicts_with = "port")]
    sim: Option<String>,

    /// Flash image file of the simulated target
    #[arg(long, global = true)]
    image: Option<PathBuf>,

    /// Seed/key secret as hex string
    #[arg(long, global = true)]
    secret: Option<String>,

    /// Seed/key shared library
    #[arg(long, global = true, conflicts_with = "secret")]
    key_library: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get info about the connected bootloader
    Info {},
    /// Reset the target connected
    Reset {},
    /// Erase flash
    Erase {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        len: u32,
    },
    /// Download to flash and reset
    Flash {
        /// The path to the file to be downloaded to the flash
        path: PathBuf,
        /// Load address of binary and plain hex files
        #[arg(long, value_parser = parse_number, default_value = "0")]
        base: u32,
        /// Read the data back before the reset
        #[arg(long)]
        verify: bool,
    },
    /// Dump memory
    Read {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        len: u32,
        /// Write the data to a file instead of dumping it
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Checksum of a memory range, computed by the target
    Checksum {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        len: u32,
    },
    /// List the simulated target profiles
    Profiles {},
    /// Run a simulated target on a serial port
    Simulate {
        /// Target profile, e.g. STM32F103C8
        profile: String,
        /// Bootloader configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn key_algorithm(cli: &Cli) -> Result<Box<dyn KeyAlgorithm>> {
    if let Some(secret) = &cli.secret {
        return Ok(Box::new(SecretKey::from_hex(secret, 4)?));
    }
    if let Some(path) = &cli.key_library {
        let lib = LibraryKey::load(path)?;
        log::debug!("seed/key library privileges: {:?}", lib.available_privileges()?);
        return Ok(Box::new(lib));
    }
    Ok(Box::new(DemoKey))
}

fn sim_flash(profile: &str, config: &Config, image: Option<&PathBuf>) -> Result<FlashSim> {
    let profile = ProfileDB::find(profile)?;
    log::info!("Simulated target: {}", profile);
    let flash = FlashSim::new(profile, config.image_checksum)?;
    match image {
        Some(path) => flash.with_image_file(path),
        None => Ok(flash),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match &cli.command {
        Commands::Profiles {} => {
            for (family, profile) in ProfileDB::load()?.profiles() {
                println!("{:<10} {}", family.name, profile);
            }
            Ok(())
        }
        Commands::Simulate { profile, config } => {
            let config = match config {
                Some(path) => Config::load(path)?,
                None => Config::default(),
            };
            simulate(&cli, profile, config)
        }
        _ => {
            let key = key_algorithm(&cli)?;
            if let Some(profile) = &cli.sim {
                let config = Config::default();
                let flash = sim_flash(profile, &config, cli.image.as_ref())?;
                run(&cli, SimTransport::new(config, flash)?, key)
            } else if let Some(port) = &cli.port {
                run(
                    &cli,
                    SerialTransport::open(port, cli.baudrate, cli.checksum)?,
                    key,
                )
            } else {
                log::debug!("{} USB device(s) found", UsbTransport::scan_devices()?);
                run(&cli, UsbTransport::open_any()?, key)
            }
        }
    }
}

fn progress_bar(total: usize) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {bytes}/{total_bytes}")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

fn run<T: Transport>(cli: &Cli, transport: T, key: Box<dyn KeyAlgorithm>) -> Result<()> {
    let mut loader = XcpLoader::connect(transport)?.with_key_algorithm(key);

    match &cli.command {
        Commands::Info {} => {
            let info = *loader.info();
            log::info!("Station: {}", loader.id()?);
            log::info!(
                "Resources: 0x{:02x}, byte order: {:?}, max CTO: {}, max DTO: {}",
                info.resources,
                info.byte_order,
                info.max_cto,
                info.max_dto
            );
            log::info!(
                "Protocol layer version: {}, transport layer version: {}",
                info.protocol_version,
                info.transport_version
            );
            let status = loader.status()?;
            log::info!("Protected resources: 0x{:02x}", status.protection);
        }
        Commands::Reset {} => {
            loader.start_programming()?;
            loader.reset()?;
        }
        Commands::Erase { address, len } => {
            loader.start_programming()?;
            loader.erase(*address, *len)?;
            log::info!("Erased 0x{:08x}+{}", address, len);
            loader.stop_programming()?;
        }
        Commands::Flash { path, base, verify } => {
            let segments = format::read_firmware_from_file(path, *base)?;
            let total: usize = segments.iter().map(|s| s.data.len()).sum();
            log::info!("Firmware size: {}", total);

            let bar = progress_bar(total)?;
            bar.set_message("Programming");
            loader.flash(&segments, *verify, |n| bar.inc(n as u64))?;
            bar.finish();
        }
        Commands::Read {
            address,
            len,
            output,
        } => {
            let data = loader.read(*address, *len as usize)?;
            match output {
                Some(path) => {
                    std::fs::write(path, &data)?;
                    log::info!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => {
                    let mut out = Vec::new();
                    hxdmp::hexdump(&data, &mut out)?;
                    println!("{}", String::from_utf8_lossy(&out));
                }
            }
            loader.disconnect()?;
        }
        Commands::Checksum { address, len } => {
            let checksum = loader.checksum(*address, *len)?;
            log::info!(
                "Checksum of 0x{:08x}+{}: {:?} 0x{:08x}",
                address,
                len,
                checksum.kind,
                checksum.value
            );
            loader.disconnect()?;
        }
        Commands::Profiles {} | Commands::Simulate { .. } => {
            anyhow::bail!("not a loader command")
        }
    }

    Ok(())
}

fn simulate(cli: &Cli, profile: &str, config: Config) -> Result<()> {
    let port = cli
        .port
        .as_deref()
        .ok_or_else(|| anyhow::format_err!("simulate needs --port"))?;
    let flash = sim_flash(profile, &config, cli.image.as_ref())?;
    let link = SerialLink::open(port, cli.baudrate)?;

    let mut target = match &cli.secret {
        Some(secret) => {
            let key = SecretKey::from_hex(secret, 4)?;
            SimTarget::with_seed_key(
                config,
                link,
                flash,
                Box::new(move || Box::new(key.clone()) as Box<dyn SeedKey>),
            )?
        }
        None => SimTarget::new(config, link, flash)?,
    };
    log::info!("Simulated target running on {}", port);
    loop {
        target.poll()?;
    }
}
