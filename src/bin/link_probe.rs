/// Serial link probe
///
/// Lists serial ports, opens the servo board and prints every telemetry line
/// with how it parsed. Optionally sends one servo frame first.
///
/// Run with: cargo run --bin link_probe -- [--port /dev/ttyACM0] [--frame 90,45,90,90,45,73]

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use gethostname::gethostname;

use armdriver::arduino_connection::{port_description, ArduinoConnection};
use armdriver::command::{ServoFrame, NUM_SERVOS};
use armdriver::config_loader;
use armdriver::telemetry::{parse_line, LineFramer, LineOutcome};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device; skips discovery
    #[arg(long)]
    port: Option<String>,
    /// Only list ports
    #[arg(long)]
    list: bool,
    /// Six comma-separated servo angles to send once connected
    #[arg(long)]
    frame: Option<String>,
}

fn parse_frame(raw: &str) -> Result<ServoFrame> {
    let values: Vec<i32> = raw
        .split(',')
        .map(|s| s.trim().parse::<i32>().map_err(|e| anyhow!("Bad angle '{}': {}", s.trim(), e)))
        .collect::<Result<_>>()?;
    if values.len() != NUM_SERVOS {
        bail!("Expected {} angles, got {}", NUM_SERVOS, values.len());
    }
    let mut out = [0; NUM_SERVOS];
    out.copy_from_slice(&values);
    Ok(ServoFrame(out))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let ports = serialport::available_ports().map_err(|e| anyhow!("Failed to enumerate serial ports: {}", e))?;
    if ports.is_empty() {
        println!("No serial ports");
    }
    for p in &ports {
        println!("{:<20} {}", p.port_name, port_description(p));
    }
    if args.list {
        return Ok(());
    }
    let frame = args.frame.as_deref().map(parse_frame).transpose()?;

    let hostname = gethostname().to_string_lossy().to_string();
    let mut settings = config_loader::load_settings(&config_loader::config_path(), &hostname)?;
    if let Some(port) = args.port {
        settings.link.port = Some(port);
    }
    let connection = ArduinoConnection::open(&settings.link)?;
    println!("Connected to {}", connection.port_name());
    let (mut reader, mut writer) = connection.into_split();

    if let Some(frame) = frame {
        writer.write_all(frame.to_line().as_bytes())?;
        writer.flush()?;
        println!("SEND: {}", frame);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)).ok();
    }

    let mut framer = LineFramer::new();
    let mut chunk = [0u8; 128];
    while running.load(Ordering::SeqCst) {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for line in framer.push(&chunk[..n]) {
                    match parse_line(&line) {
                        LineOutcome::Recognized { tokens, dropped } => {
                            println!("{:<32} -> {:?} (dropped {})", line, tokens, dropped)
                        }
                        LineOutcome::Unrecognized => println!("{:<32} -> (ignored)", line),
                        LineOutcome::Malformed => println!("{:<32} -> MALFORMED", line),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                framer.discard_partial();
            }
            Err(e) => return Err(anyhow!("Read error: {}", e)),
        }
    }
    Ok(())
}
