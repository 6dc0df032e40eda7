//! Probe RTL2832U dongles.
//!
//! Lists the attached devices, opens one, reports the detected tuner, applies
//! the requested settings and streams for a while to measure throughput.
//!
//! # Usage Examples
//!
//! ```bash
//! rtl_probe --list
//! rtl_probe -s 2.048M -d 5 -v
//! rtl_probe -c 100.1M -g 20 -p 42 -s 2.4M
//! ```

use std::str::FromStr;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rs_rtl::{
    device_count, list_devices, BareTuners, DeviceConfig, Error, ReaderConfig, RtlSdr,
    DEFAULT_BUF_LENGTH,
};

/// A frequency in Hz, written as a plain number or with a k, M or G suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frequency(u32);

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (number, scale) = match s.char_indices().last() {
            Some((i, 'k' | 'K')) => (&s[..i], 1e3),
            Some((i, 'M')) => (&s[..i], 1e6),
            Some((i, 'G')) => (&s[..i], 1e9),
            _ => (s, 1.0),
        };
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| format!("not a frequency: {:?}", s))?;
        if value.is_nan() || value < 0.0 {
            return Err(format!("frequency must not be negative: {:?}", s));
        }
        let hz = (value * scale).round();
        if hz > u32::MAX as f64 {
            return Err(format!("frequency out of range: {:?}", s));
        }
        Ok(Frequency(hz as u32))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe and benchmark RTL2832U dongles", long_about = None)]
struct Args {
    /// List attached devices and exit
    #[arg(short, long, default_value_t = false)]
    list: bool,

    /// Device index
    #[arg(long, default_value_t = 0)]
    device_index: u32,

    /// Center frequency in Hz (accepts k/M suffix, e.g. 100.1M)
    #[arg(short, long, value_parser = Frequency::from_str)]
    center_freq: Option<Frequency>,

    /// Sample rate in Hz (accepts k/M suffix)
    #[arg(short, long, value_parser = Frequency::from_str, default_value = "2.048M")]
    sample_rate: Frequency,

    /// Tuner gain in dB
    #[arg(short, long)]
    gain: Option<i32>,

    /// Frequency correction in ppm
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    ppm: i32,

    /// Streaming duration in seconds (0 skips streaming)
    #[arg(short, long, default_value_t = 2.0)]
    duration: f64,

    /// Number of streaming transfers
    #[arg(long, default_value_t = rs_rtl::DEFAULT_BUF_NUM)]
    buffers: usize,

    /// Size of each streaming transfer in bytes
    #[arg(long, default_value_t = DEFAULT_BUF_LENGTH)]
    buffer_len: usize,

    /// Crystal frequency in Hz
    #[arg(long, default_value_t = rs_rtl::DEFAULT_XTAL_FREQ)]
    xtal: u32,

    /// Verbosity level (-v=info, -vv=debug, -vvv=trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> rs_rtl::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over -v
    // 0 = WARN (quiet), 1 = INFO, 2 = DEBUG, 3+ = TRACE
    let log_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let devices = list_devices()?;
    println!("Found {} device(s):", device_count());
    for dev in &devices {
        println!(
            "  {}: {} ({:04x}:{:04x}) on bus {:03} device {:03}",
            dev.index, dev.name, dev.vid, dev.pid, dev.bus_number, dev.address
        );
    }
    if args.list {
        return Ok(());
    }
    if devices.is_empty() {
        return Err(Error::DeviceNotFound(args.device_index));
    }

    let config = ReaderConfig {
        device_index: args.device_index,
        center_freq: args.center_freq.map(|f| f.0),
        sample_rate: args.sample_rate.0,
        gain: args.gain,
        ppm: args.ppm,
        device: DeviceConfig {
            buf_num: args.buffers,
            buf_len: args.buffer_len,
            xtal_freq: args.xtal,
            ..DeviceConfig::default()
        },
    };
    let mut sdr = RtlSdr::open_with(config.device_index, config.device.clone(), &BareTuners)?;

    match sdr.tuner_family() {
        Some(family) => println!("Tuner: {} ({})", family.name(), family),
        None => println!("Tuner: none detected"),
    }

    let rate = sdr.set_sample_rate(config.sample_rate)?;
    println!(
        "Sample rate: {} Hz requested, {:.3} Hz exact (ratio {:#010x})",
        rate.requested, rate.achieved, rate.ratio
    );

    apply_tuner_settings(&mut sdr, &config);

    if args.duration <= 0.0 {
        return sdr.close();
    }

    sdr.reset_buffer()?;
    let (received, elapsed) = stream_for(&mut sdr, Duration::from_secs_f64(args.duration))?;

    // 8-bit I and Q per sample
    let expected = rate.achieved * 2.0 * elapsed.as_secs_f64();
    let missing = (expected - received as f64).max(0.0);
    println!(
        "Received {} bytes in {:.3} s: {:.3} MS/s, {:.0} bytes short of the nominal rate",
        received,
        elapsed.as_secs_f64(),
        received as f64 / 2.0 / elapsed.as_secs_f64() / 1e6,
        missing
    );

    sdr.close()
}

/// Tuner settings are reported, not fatal: without a chip driver the tuner
/// refuses them.
fn apply_tuner_settings(sdr: &mut RtlSdr, config: &ReaderConfig) {
    for setting in config.tuner_settings() {
        match setting.apply(sdr) {
            Ok(()) => println!("{}", setting),
            Err(e) => warn!("{} not applied: {}", setting.name(), e),
        }
    }
}

fn stream_for(sdr: &mut RtlSdr, duration: Duration) -> rs_rtl::Result<(u64, Duration)> {
    let canceller = sdr.canceller();
    let start = Instant::now();
    let mut received = 0u64;
    let mut chunks = 0u64;

    // stops a silent device; the callback stops a live one
    let watchdog = canceller.clone();
    std::thread::spawn(move || {
        std::thread::sleep(duration + Duration::from_secs(1));
        let _ = watchdog.cancel();
    });

    info!("Streaming for {:.1} s", duration.as_secs_f64());
    sdr.read_async(|data| {
        received += data.len() as u64;
        chunks += 1;
        if start.elapsed() >= duration {
            let _ = canceller.cancel();
        }
    })?;

    let elapsed = start.elapsed();
    info!("{} chunks received", chunks);
    Ok((received, elapsed))
}
