// Logic capture example
//
// Arms a single-shot capture on a Rigol MSO, downloads the lower logic pod
// and prints where each named signal changed.

use clap::Parser;
use polars::prelude::{CsvWriter, SerWriter};
use rigol_scope::{
    CaptureConfig, RigolConnector, RigolScope, SignalMap, Transport, WaveformSource,
};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "capture_edges")]
#[command(about = "Capture logic signals from a Rigol MSO and list their edges")]
struct Args {
    /// VISA style resource, e.g. TCPIP::192.168.1.70::INSTR or USB0::0x1AB1::0x04CE::INSTR.
    /// Uses the first USB instrument if omitted
    resource: Option<String>,

    /// Signals as NAME=BIT, e.g. RD=0
    #[arg(short, long = "signal", value_parser = parse_signal)]
    signals: Vec<(String, u8)>,

    /// Read the upper pod (D8-D15) instead of D0-D7
    #[arg(long)]
    upper: bool,

    /// Trigger status polls, one per second
    #[arg(long, default_value_t = 60)]
    timeout: u32,

    /// Write the transition table to a CSV file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_signal(s: &str) -> Result<(String, u8), String> {
    let (name, bit) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=BIT, got '{s}'"))?;
    let bit = bit.parse().map_err(|e| format!("invalid bit '{bit}': {e}"))?;
    Ok((name.to_string(), bit))
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

    let mut signals = SignalMap::new();
    if args.signals.is_empty() {
        for (name, bit) in [("RD", 0), ("MREQ", 1), ("A15", 2), ("A14", 3), ("ROMCS", 4)] {
            signals.insert(name, bit)?;
        }
    } else {
        for (name, bit) in &args.signals {
            signals.insert(name.as_str(), *bit)?;
        }
    }

    let transport: Box<dyn Transport> = match &args.resource {
        Some(resource) => RigolConnector::open(resource)?,
        None => RigolConnector::open_first_usb()?,
    };

    let config = CaptureConfig::default()
        .with_max_attempts(args.timeout)
        .with_poll_interval(Duration::from_secs(1));
    let mut scope = RigolScope::with_config(transport, config);

    println!("Instrument: {}", scope.identify()?);
    println!("Waiting for trigger...");

    let source = if args.upper {
        WaveformSource::UPPER_POD
    } else {
        WaveformSource::LOWER_POD
    };
    let capture = scope.capture(source, &signals)?;

    println!(
        "Captured {} samples at {:.3} MSa/s, {} transitions",
        capture.frame.payload().len(),
        capture.preamble.sample_rate() / 1e6,
        capture.transitions.transitions().len()
    );

    for (name, _) in signals.iter() {
        let edges = capture.transitions.edges(name);
        match capture.transitions.last_change(name) {
            Some(last) => println!(
                "  {:<8} {:>6} edges, last at sample {} ({:.9} s)",
                name,
                edges.len(),
                last,
                capture.preamble.sample_time(last)
            ),
            None => println!("  {:<8} no edges", name),
        }
    }

    if let Some(path) = args.csv {
        let mut df = capture
            .transitions
            .to_dataframe(&signals, Some(&capture.preamble))?;
        CsvWriter::new(File::create(&path)?).finish(&mut df)?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}
