mod sim;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use rootbot_lib::config::RobotConfig;
use rootbot_lib::packet::{Packet, crc8};
use rootbot_lib::robot::events;
use rootbot_lib::types::{Animation, Bumper, Color, ColorLighting, ColorSensors, Light, Touch, note_with_reference};
use sim::SimulatedRobot;
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Tools for the Root robot's Bluetooth packet protocol.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// JSON file with robot settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override the reply timeout in milliseconds, 0 waits forever.
    #[arg(long, global = true)]
    reply_timeout_ms: Option<u64>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a 20-byte frame given as hex.
    Decode { frame: String },
    /// Build a frame and print it as hex.
    Encode {
        #[arg(short, long)]
        device: u8,
        #[arg(short = 'm', long)]
        command: u8,
        #[arg(short, long, default_value_t = 0)]
        sequence: u8,
        /// Up to 16 payload bytes as hex.
        #[arg(short, long, default_value = "")]
        payload: String,
    },
    /// CRC-8 of arbitrary bytes given as hex.
    Crc { data: String },
    /// Frequency of a note name such as C#5.
    Note {
        name: String,
        /// Frequency of A4, defaults to the configured reference pitch.
        #[arg(long)]
        a4: Option<f64>,
    },
    /// Drive a simulated robot through a short session.
    Demo,
}

fn setup_logging(
    log_file_path: Option<&PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(path) = log_file_path {
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

    // -v gives DEBUG, -vv TRACE; RUST_LOG still wins per directive.
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

fn load_config(cli: &Cli) -> Result<RobotConfig> {
    let mut config = match &cli.config {
        Some(path) => RobotConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => RobotConfig::default(),
    };
    if let Some(ms) = cli.reply_timeout_ms {
        config.reply_timeout_ms = (ms > 0).then_some(ms);
    }
    Ok(config)
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex: {:?}", input))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_ref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{:?}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Decode { frame } => decode(&parse_hex(&frame)?),
        Command::Encode {
            device,
            command,
            sequence,
            payload,
        } => {
            let packet = Packet::new(device, command, sequence, &parse_hex(&payload)?)?;
            println!("{}", hex::encode(packet.to_bytes()));
            Ok(())
        }
        Command::Crc { data } => {
            println!("{:#04x}", crc8(&parse_hex(&data)?));
            Ok(())
        }
        Command::Note { name, a4 } => {
            let frequency = note_with_reference(&name, a4.unwrap_or(config.reference_pitch_hz))?;
            println!("{}: {:.3} Hz", name, frequency);
            Ok(())
        }
        Command::Demo => demo(config).await,
    }
}

fn decode(raw: &[u8]) -> Result<()> {
    let packet = Packet::from_bytes(raw)?;
    println!("device:   {}", packet.device);
    println!("command:  {}", packet.command);
    println!("sequence: {}", packet.sequence);
    println!("payload:  {}", hex::encode(packet.payload));
    if packet.check_crc() {
        println!("crc:      {:#04x} (ok)", packet.crc());
    } else {
        println!(
            "crc:      {:#04x} (expected {:#04x})",
            packet.stored_crc().unwrap_or_default(),
            packet.calc_crc()
        );
    }

    let key = packet.event_key();
    let event = if key == events::BUMP {
        format!("{:?}", Bumper::from_packet(&packet))
    } else if key == events::TOUCH {
        format!("{:?}", Touch::from_packet(&packet))
    } else if key == events::LIGHT {
        format!("{:?}", Light::from_packet(&packet))
    } else if key == events::COLOR {
        // Color readings have no timestamp.
        let zones = Color::from_packet(&packet).zones;
        let zones: Vec<String> = zones.iter().map(|c| c.to_string()).collect();
        println!("event:    color {}", zones.join(" "));
        return Ok(());
    } else if key == events::STOP {
        "stop button".to_string()
    } else if key == events::STALL {
        "motor stall".to_string()
    } else if key == events::CLIFF {
        format!("cliff (tripped: {})", packet.payload[4] == 0)
    } else {
        return Ok(());
    };
    println!("event:    {} at {} ms", event, packet.timestamp());
    Ok(())
}

async fn demo(config: RobotConfig) -> Result<()> {
    let (robot, simulator) = SimulatedRobot::new("RootSim").with_bump_after_drive().attach(config);
    robot.run();

    robot.on_bump(None, |robot, bumper| async move {
        info!("Bumped: left={} right={}", bumper.left, bumper.right);
        if let Err(e) = robot.set_lights(255, 0, 0, Animation::Blink).await {
            warn!("Failed to set lights: {}", e);
        }
    });

    let versions = robot.get_versions(0xA5).await?;
    info!("Versions: {}", hex::encode(&versions));
    info!("Name: {}", robot.get_name().await?);
    let (millivolts, percent) = robot.get_battery_level().await?;
    info!("Battery: {} mV ({}%)", millivolts, percent);

    robot.set_lights(0, 255, 0, Animation::On).await?;
    robot.drive_distance(16.0).await?;
    robot.turn_left(90.0).await?;
    robot.drive_distance(8.0).await?;
    let (x, y, heading) = robot.get_position().await?;
    info!("Position: x={:.1} cm y={:.1} cm heading={:.1}°", x, y, heading);

    let readings = robot
        .get_color_sensor_data(ColorSensors::Sensors8To15, ColorLighting::All, 0)
        .await?;
    info!("Color sensors 8-15: {:?}", readings);

    robot.play_named_note("C5", 0.25).await?;
    robot.say("Hello from rootbot").await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    robot.stop().await?;
    simulator.abort();
    info!("Demo finished");
    Ok(())
}
