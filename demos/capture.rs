// Capture example
//
// Programs a capture, optionally waits for an edge on the first selected
// channel, and prints the decoded samples or the edges found.

use clap::Parser;
use srpico_rs::{CaptureRequest, ConnectOptions, PicoConnector, TriggerCondition};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "capture")]
#[command(about = "Capture samples from an SRPICO analyzer")]
#[command(long_about = "Capture samples from an SRPICO analyzer. Without --edges the whole capture is decoded into a table, with it every rising edge on the first channel is listed.")]
struct Args {
    /// Serial port of the analyzer
    port: String,

    #[arg(short = 'n', long, default_value_t = 10_000, help = "Number of samples to capture")]
    samples: u32,

    #[arg(short, long, default_value_t = 1_000_000, help = "Sample rate in Hz")]
    rate: u64,

    /// Channels to capture, in output order. All channels when omitted.
    #[arg(short, long, value_delimiter = ',')]
    channels: Option<Vec<String>>,

    #[arg(short, long, help = "Start at the first rising edge and list every edge after it")]
    edges: bool,

    #[arg(long, default_value_t = 5000, help = "Give up after this many milliseconds without data")]
    idle_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
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

    let options = ConnectOptions {
        capture_idle_timeout: Some(Duration::from_millis(args.idle_timeout_ms)),
        ..ConnectOptions::default()
    };
    let mut analyzer = PicoConnector::connect(&args.port, &options)?;
    println!("Connected to SRPICO v{}", analyzer.descriptor().version);

    let rising = TriggerCondition::when().rising(0).build();
    let mut request = CaptureRequest::new(args.samples, args.rate);
    if let Some(channels) = args.channels {
        request = request.channels(channels);
    }
    if args.edges {
        request = request.trigger(rising.clone());
    }

    let config = analyzer.configure(request)?;
    println!(
        "Capturing {} samples at {} Hz on {:?} {:?}",
        args.samples, args.rate, config.digital_names, config.analog_names
    );

    let mut acquisition = analyzer.acquire()?;
    println!(
        "Received {} bytes in {} chunks",
        acquisition.buffer().len(),
        acquisition.buffer().chunks().len()
    );

    if args.edges {
        if let Some(trigger) = acquisition.trigger_point() {
            println!("Trigger at sample {}", trigger.sample_index);
        }
        let mut edges = 0u64;
        loop {
            match acquisition.wait_for(std::slice::from_ref(&rising)) {
                Ok(hit) => {
                    edges += 1;
                    let seconds = hit.sample_index as f64 / args.rate as f64;
                    println!(
                        "  edge at sample {} ({:.6} s), bits {:#b}",
                        hit.sample_index, seconds, hit.sample.bits
                    );
                }
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => return Err(e.into()),
            }
        }
        println!("{} rising edges", edges);
    } else {
        let data = acquisition.into_dataframe()?;
        println!("{}", data);
    }

    Ok(())
}
