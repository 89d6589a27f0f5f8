use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use scanberry_lib::{
    Connector, EmulatedConnector, LoggingRails, Rails, ScannerConfig, ScannerControl, ScannerEvent,
};

/// Power, wake and scan with a GPIO-wired Brother DS document scanner.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// TOML configuration file. Defaults apply to anything it leaves out.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Use the built-in emulated scanner instead of USB and GPIO.
    #[arg(long, global = true, env = "SCANBERRY_EMULATE")]
    emulate: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Power up, scan one sheet, save it and power down.
    Scan {
        /// Keep the paper rail up long enough for a long page.
        #[arg(long)]
        long: bool,
        /// Where to write the decoded page; the format follows the extension.
        #[arg(short, long, default_value = "page.png")]
        output: PathBuf,
        /// Also write the encoded page exactly as the scanner sent it.
        #[arg(long)]
        raw: Option<PathBuf>,
    },
    /// Power up and hold the scanner ready until Ctrl+C.
    PowerOn,
    /// Drive every rail low.
    PowerOff,
    /// Print the effective configuration as TOML.
    PrintConfig,
}

fn setup_logging(
    log_file_path: Option<PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false);

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path)
            .with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v; RUST_LOG overrides both
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<ScannerConfig> {
    let mut config = match &cli.config {
        Some(path) => ScannerConfig::load(path)?,
        None => ScannerConfig::default(),
    };
    if cli.emulate {
        config.emulate = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Scanberry failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    if let Command::PrintConfig = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    if config.emulate {
        info!("Using the emulated scanner");
        return run_with(LoggingRails, EmulatedConnector::default(), config, cli.command).await;
    }
    run_hardware(config, cli.command).await
}

#[cfg(feature = "rpi")]
async fn run_hardware(config: ScannerConfig, command: Command) -> Result<()> {
    use scanberry_lib::{GpioRails, UsbConnector};

    let rails = GpioRails::init(&config.gpio).context("Failed to claim GPIO pins")?;
    let connector = UsbConnector {
        vendor_id: config.usb.vendor_id,
        product_id: config.usb.product_id,
    };
    run_with(rails, connector, config, command).await
}

#[cfg(not(feature = "rpi"))]
async fn run_hardware(_config: ScannerConfig, _command: Command) -> Result<()> {
    bail!("Built without GPIO support; pass --emulate or rebuild with the `rpi` feature")
}

async fn run_with<R: Rails, C: Connector>(
    rails: R,
    connector: C,
    config: ScannerConfig,
    command: Command,
) -> Result<()> {
    let (control, mut events) = ScannerControl::new(rails, connector, config);

    let result = match command {
        Command::Scan { long, output, raw } => {
            let finished = tokio::select! {
                result = scan_once(&control, &mut events, long, &output, raw.as_deref()) => {
                    Some(result)
                }
                _ = signal::ctrl_c() => None,
            };
            match finished {
                Some(result) => result,
                None => {
                    warn!("Ctrl+C received, stopping the feed.");
                    stop_scan(&control, &mut events).await;
                    Ok(())
                }
            }
        }
        Command::PowerOn => {
            tokio::select! {
                result = hold_ready(&control, &mut events) => result,
                _ = signal::ctrl_c() => Ok(()),
            }
        }
        Command::PowerOff => Ok(()),
        Command::PrintConfig => Ok(()),
    };

    control.shutdown();
    control.end().await;
    result
}

/// Stop the feed and abort, giving the device time to take the abort before
/// the rails drop.
async fn stop_scan<R: Rails, C: Connector>(
    control: &ScannerControl<R, C>,
    events: &mut UnboundedReceiver<ScannerEvent>,
) {
    control.scan_stop();
    if !control.state().is_scanning() {
        return;
    }
    control.abort_scan();
    let limit = control.config().timing.jam_grace;
    let outcome = tokio::time::timeout(
        limit,
        wait_for(events, |e| {
            matches!(
                e,
                ScannerEvent::ScanSuccess(_) | ScannerEvent::NoPaper | ScannerEvent::PaperJam
            )
        }),
    )
    .await;
    match outcome {
        Ok(Ok(_)) => info!("Scan aborted"),
        Ok(Err(e)) => warn!("Scan did not end cleanly: {:?}", e),
        Err(_) => warn!("Scanner did not acknowledge the abort within {:?}", limit),
    }
}

async fn hold_ready<R: Rails, C: Connector>(
    control: &ScannerControl<R, C>,
    events: &mut UnboundedReceiver<ScannerEvent>,
) -> Result<()> {
    control.startup();
    wait_for(events, |e| matches!(e, ScannerEvent::Ready)).await?;
    info!("Scanner ready. Press Ctrl+C to power off.");
    // Wake it again whenever it dozes off
    loop {
        wait_for(events, |e| matches!(e, ScannerEvent::Shutdown)).await?;
        info!("Scanner went to power saving, waking it");
        control.startup();
    }
}

async fn wait_for(
    events: &mut UnboundedReceiver<ScannerEvent>,
    mut pred: impl FnMut(&ScannerEvent) -> bool,
) -> Result<ScannerEvent> {
    while let Some(event) = events.recv().await {
        if let ScannerEvent::Fault(reason) = &event {
            bail!("Scanner fault: {}", reason);
        }
        if pred(&event) {
            return Ok(event);
        }
    }
    bail!("Scanner event stream closed")
}

async fn scan_once<R: Rails, C: Connector>(
    control: &ScannerControl<R, C>,
    events: &mut UnboundedReceiver<ScannerEvent>,
    long: bool,
    output: &Path,
    raw: Option<&Path>,
) -> Result<()> {
    control.startup();
    let startup_limit = control.config().timing.startup * 2;
    tokio::time::timeout(
        startup_limit,
        wait_for(events, |e| matches!(e, ScannerEvent::Ready)),
    )
    .await
    .context("Scanner did not become ready")??;

    control.scan(long)?;
    let outcome = wait_for(events, |e| {
        matches!(
            e,
            ScannerEvent::ScanSuccess(_) | ScannerEvent::NoPaper | ScannerEvent::PaperJam
        )
    })
    .await?;

    match outcome {
        ScannerEvent::ScanSuccess(page) => {
            info!(
                page = page.page,
                width = page.width(),
                height = page.height(),
                "Saving page to {:?}",
                output
            );
            page.image
                .save(output)
                .with_context(|| format!("Failed to write {:?}", output))?;
            if let Some(raw) = raw {
                fs::write(raw, &page.raw).with_context(|| format!("Failed to write {:?}", raw))?;
            }
            Ok(())
        }
        ScannerEvent::NoPaper => bail!("No page was scanned. Is there paper in the feeder?"),
        _ => bail!("Paper jam. Clear the feeder and try again."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanberry_lib::ScannerState;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_stop_scan_lets_the_abort_land_before_shutdown() {
        let mut config = ScannerConfig::default();
        config.scan.area = [0, 0, 64, 48];
        let (control, mut events) =
            ScannerControl::new(LoggingRails, EmulatedConnector::default(), config);
        control.startup();
        wait_for(&mut events, |e| matches!(e, ScannerEvent::Ready)).await.unwrap();

        control.scan(false).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(control.state().is_scanning());

        stop_scan(&control, &mut events).await;
        // The device answered the abort while still powered
        assert_eq!(control.state(), ScannerState::Ready);

        control.shutdown();
        control.end().await;
        assert_eq!(control.state(), ScannerState::PowerDown);
    }
}
