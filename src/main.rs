#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use mspm0_bsl_loader::{FirmwareSource, Options, Programmer, ReaderSource};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Firmware binary to program
    firmware: String,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyS0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "9600")]
    baud: usize,

    /// GPIO driving the target BSL invoke pin
    #[structopt(long, default_value = "17")]
    invoke_pin: u64,

    /// GPIO driving the target reset pin
    #[structopt(long, default_value = "27")]
    reset_pin: u64,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let mut firmware = ReaderSource::open(&o.firmware)?;
    info!(
        "Loaded {} ({})",
        o.firmware,
        bytefmt::format(firmware.length() as u64)
    );

    info!("Connecting to serial port");
    let mut p = Programmer::linux(&o.port, o.baud, o.invoke_pin, o.reset_pin, o.options)?;

    let bar = ProgressBar::new(firmware.length() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {bytes}/{total_bytes}")
            .progress_chars("=>-"),
    );

    let result = p.program_with_progress(&mut firmware, |done, _| bar.set_position(done as u64));

    match result {
        Ok(summary) => {
            bar.finish_with_message("done");
            info!("Device ID: {}", hex::encode(&summary.device_id));
            info!(
                "Programmed {} in {} blocks, application started",
                bytefmt::format(summary.bytes as u64),
                summary.blocks
            );
            Ok(())
        }
        Err(f) => {
            bar.abandon();
            if let Some(offset) = f.block {
                error!("Block at offset 0x{:08x} was not programmed", offset);
            }
            Err(anyhow::anyhow!("{}", f))
        }
    }
}
