// Command-line front end for the Monsoon power monitor
//
// Configures the meter's output and optionally streams resampled current
// readings to stdout or a CSV file. Press Ctrl+C to stop collecting.

use clap::Parser;
use monsoon_rs::{
    CollectionRequest, DeviceLocator, MeterSettings, MonsoonConfig, SampleLimit, UsbPassthrough,
};
use polars::prelude::{CsvWriter, SerWriter};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "monsoon")]
#[command(version = "0.1")]
#[command(about = "Control a Monsoon power monitor and collect current samples")]
struct Args {
    /// Set output voltage (0 for off)
    #[arg(long)]
    voltage: Option<f64>,

    /// Ramp the voltage up gradually (default)
    #[arg(long, overrides_with = "no_ramp")]
    ramp: bool,

    /// Jump straight to the requested voltage
    #[arg(long = "no-ramp", overrides_with = "ramp")]
    no_ramp: bool,

    /// Set max output current in amperes
    #[arg(long)]
    current: Option<f64>,

    /// Set max power-up (initial) current in amperes
    #[arg(long)]
    startcurrent: Option<f64>,

    /// USB passthrough mode: on, off or auto
    #[arg(long)]
    usbpassthrough: Option<UsbPassthrough>,

    /// Print the meter's status record
    #[arg(long)]
    status: bool,

    /// Collect this many samples, -1 to run until interrupted
    #[arg(long, allow_negative_numbers = true)]
    samples: Option<i64>,

    /// Output sample rate in Hz
    #[arg(long, default_value_t = monsoon_rs::config::DEFAULT_OUTPUT_HZ)]
    hz: u32,

    /// Also print a rolling average over this many output samples
    #[arg(long)]
    avg: Option<usize>,

    /// Prefix each sample with the Unix time in seconds
    #[arg(long)]
    timestamp: bool,

    /// Use this serial device instead of scanning
    #[arg(long)]
    device: Option<String>,

    /// Only connect to the meter with this serial number
    #[arg(long)]
    serialno: Option<u16>,

    /// Fail instead of waiting for a meter to become available
    #[arg(long = "no-wait")]
    no_wait: bool,

    /// Write collected samples to this CSV file instead of stdout
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    #[cfg(feature = "cpu-profiling")]
    let _client = tracy_client::Client::start();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))?;
    }

    let mut config = MonsoonConfig::new();
    if let Some(device) = &args.device {
        config = config.device(device.clone());
    }
    if let Some(serial) = args.serialno {
        config = config.serial_number(serial);
    }
    if args.no_wait {
        config = config.no_wait();
    }

    let mut monsoon = DeviceLocator::new(config)
        .with_cancel(Arc::clone(&cancel))
        .locate()?;

    monsoon.apply_settings(&MeterSettings {
        voltage: args.voltage,
        ramp: args.ramp || !args.no_ramp,
        max_current: args.current,
        max_power_up_current: args.startcurrent,
        usb_passthrough: args.usbpassthrough,
    })?;

    if args.status {
        match monsoon.status()? {
            Some(status) => print!("{}", status),
            None => eprintln!("No status from the meter"),
        }
    }

    let Some(samples) = args.samples else {
        return Ok(());
    };

    let mut request = CollectionRequest::new(SampleLimit::from_signed(samples))
        .output_hz(args.hz)
        .timestamp(args.timestamp);
    if let Some(depth) = args.avg {
        request = request.rolling_average(depth);
    }

    if let Some(path) = &args.csv {
        let (mut df, summary) = monsoon.collect_frame(&request, &cancel)?;
        CsvWriter::new(File::create(path)?).finish(&mut df)?;
        log::info!(
            "Saved {} samples to {} ({:?})",
            summary.emitted,
            path.display(),
            summary.stop_reason
        );
        return Ok(());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut write_error = None;
    let summary = monsoon.collect(&request, &cancel, |s| {
        if write_error.is_some() {
            return;
        }
        let mut line = String::new();
        if let Some(ts) = s.timestamp {
            line.push_str(&format!("{} ", ts));
        }
        line.push_str(&format!("{:.6}", s.sample.value));
        if let Some(avg) = s.sample.rolling_average {
            line.push_str(&format!(" {:.6}", avg));
        }
        if let Err(e) = writeln!(out, "{}", line) {
            // Downstream closed the pipe; stop collecting.
            write_error = Some(e);
            cancel.store(true, Ordering::SeqCst);
        }
    })?;
    out.flush()?;

    if let Some(e) = write_error {
        if e.kind() != io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }
    log::debug!(
        "{} outputs from {} native samples ({} Hz -> {} Hz), {:?}",
        summary.emitted,
        summary.consumed,
        summary.native_hz,
        summary.output_hz,
        summary.stop_reason
    );
    Ok(())
}
