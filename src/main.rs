#[macro_use]
extern crate log;

use std::num::ParseIntError;
use std::path::PathBuf;

use anyhow::Context;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use i2c_boot_loader::{Device, Options, Stage};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Command,

    /// I2C bus number, opened as /dev/i2c-<bus>
    #[structopt(long, default_value = "1")]
    bus: u32,

    /// 7-bit I2C address of the bootloader
    #[structopt(long, default_value = "0x6c", parse(try_from_str = parse_u8))]
    address: u8,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Print bootloader and chip information
    Info,

    /// Read application flash into a file
    Read {
        /// Output file
        file: PathBuf,

        /// Bytes to read, defaults to all available flash
        #[structopt(parse(try_from_str = parse_usize))]
        length: Option<usize>,
    },

    /// Erase, write and verify application flash from a file
    Write {
        /// Binary image
        file: PathBuf,
    },

    /// Leave bootloader mode
    Exit,

    /// Check register transport with a data window loopback
    Autotest,
}

fn parse_u8(s: &str) -> Result<u8, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u8::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_usize(s: &str) -> Result<usize, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => usize::from_str_radix(h, 16),
        None => s.parse(),
    }
}

const PROGRESS_TPL: &str = " {msg} [{bar:40}] {bytes}/{total_bytes} ({eta})";

/// Progress bar tracking the current stage of a flash operation
fn progress_bar() -> (ProgressBar, impl FnMut(Stage, usize, usize)) {
    let pb = ProgressBar::new(0).with_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_TPL)
            .progress_chars("=> "),
    );

    let bar = pb.clone();
    let mut current = None;

    let cb = move |stage: Stage, done: usize, total: usize| {
        if current != Some(stage) {
            if current.is_some() {
                bar.finish();
            }
            bar.reset();
            bar.set_length(total as u64);
            bar.set_message(&format!("{:?}", stage));
            current = Some(stage);
        }
        bar.set_position(done as u64);
    };

    (pb, cb)
}

fn run(o: Args) -> anyhow::Result<()> {
    info!("Connecting to bootloader on bus {} at 0x{:02x}", o.bus, o.address);

    let mut d = Device::linux(o.bus, o.address, o.options.clone())?;

    match &o.command {
        Command::Info => {
            let i = *d.info();

            println!("Bootloader version: {}", i.version);
            println!("MCU ID: 0x{:08x} ({})", i.mcu_id, i.family().unwrap_or("unknown"));
            println!("Page size: {}", i.page_size);
            println!("Flash size: {}", bytefmt::format(i.flash_size as u64 * 1024));
            println!("Program start address: 0x{:08x}", i.prog_start);
            println!(
                "Bootloader is {} KB, leaving {} for program",
                i.bootloader_kb(),
                bytefmt::format(i.available_bytes() as u64)
            );
        }
        Command::Read { file, length } => {
            let length = length.unwrap_or_else(|| d.info().available_bytes());
            let mut data = vec![0u8; length];

            let (pb, cb) = progress_bar();
            let r = d.read_cb(&mut data, cb);
            pb.finish();
            r?;

            std::fs::write(file, &data)
                .with_context(|| format!("writing {}", file.display()))?;

            info!("Read {} to {}", bytefmt::format(length as u64), file.display());
        }
        Command::Write { file } => {
            let image =
                std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;

            info!("Writing {} from {}", bytefmt::format(image.len() as u64), file.display());

            let (pb, cb) = progress_bar();
            let r = d.write_cb(&image, cb);
            pb.finish();
            r?;

            info!("Flash content verified");
        }
        Command::Exit => {
            d.exit()?;
        }
        Command::Autotest => {
            d.self_test()?;
            info!("Autotest passed");
        }
    }

    d.close();

    Ok(())
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(-1);
    }

    println!("OK");
}
