use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jkbms_lib::tokio_serial_async::JkBms;
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let mut bms = JkBms::new(&args.device, args.baud_rate);
    bms.set_timeout(args.timeout);
    bms.set_quiet_interval(args.quiet_interval);

    match args.command {
        commandline::CliCommands::Fetch => {
            let record = bms
                .fetch_once()
                .await
                .with_context(|| format!("Cannot poll BMS on '{}'", args.device))?;
            daemon::print_record(&record);
        }
        commandline::CliCommands::Daemon { output, interval } => {
            daemon::run(bms, output, interval).await?;
        }
    }

    Ok(())
}
