// Device identification example
//
// Connects to an SRPICO analyzer and prints what it reports about itself.

use clap::Parser;
use srpico_rs::{ConnectOptions, PicoConnector, SUPPORTED_SAMPLE_RATES};

#[derive(Parser)]
#[command(name = "identify")]
#[command(about = "Show channels, version and pin names of an SRPICO analyzer")]
struct Args {
    /// Serial port of the analyzer
    port: String,

    #[arg(short, long, default_value_t = 115_200, help = "Serial baud rate")]
    baud_rate: u32,

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

    println!("SRPICO Identification");
    println!("=====================\n");

    let options = ConnectOptions {
        baud_rate: args.baud_rate,
        ..ConnectOptions::default()
    };
    let analyzer = PicoConnector::connect(&args.port, &options)?;
    let descriptor = analyzer.descriptor();

    println!("Port:             {}", args.port);
    println!("Protocol version: {}", descriptor.version);
    if let Some(board) = &descriptor.board_name {
        println!("Board:            {}", board);
    }
    println!(
        "Analog:           {} channels, {} byte(s) per reading",
        descriptor.analog_channels, descriptor.analog_bytes
    );
    println!("Digital:          {} channels", descriptor.digital_channels);

    println!("\nChannels:");
    for name in descriptor
        .analog_channel_names()
        .iter()
        .chain(descriptor.digital_channel_names().iter())
    {
        println!("  {}", name);
    }

    println!(
        "\nSample rates: {} Hz to {} Hz ({} steps)",
        SUPPORTED_SAMPLE_RATES[0],
        SUPPORTED_SAMPLE_RATES[SUPPORTED_SAMPLE_RATES.len() - 1],
        SUPPORTED_SAMPLE_RATES.len()
    );

    Ok(())
}
