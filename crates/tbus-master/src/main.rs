//! tbus master command-line tool.
//!
//! Connects to a device host, runs one command against the device at
//! `--route`, prints the result and exits.
//!
//! ```text
//! tbus-master enumerate                    # devices on the root bus
//! tbus-master --route 2 enumerate          # devices on the bus at address 2
//! tbus-master --route 2,1 info             # DeviceInfo of a nested device
//! tbus-master --route 1 led brightness 40
//! tbus-master --route 2,1 motor reverse 120
//! tbus-master --route 2,2 servo move 90
//! ```

use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use tbus_core::{DeviceInfo, RoutePath, MOTOR_DEFAULT_SPEED};
use tracing_subscriber::EnvFilter;

use tbus_master::{BusCtl, Controller, LedCtl, Master, MotorCtl, ServoCtl, TcpLink};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "tbus-master", about = "Talks to devices on a tbus host", version)]
struct Cli {
    /// `host:port` of the device host.
    #[arg(long, default_value = "127.0.0.1:7600", env = "TBUS_MASTER_CONNECT")]
    connect: String,

    /// Comma separated bus addresses leading to the target device.
    #[arg(long, value_delimiter = ',', env = "TBUS_MASTER_ROUTE")]
    route: Vec<u8>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the devices attached to the target bus.
    Enumerate,
    /// Show the target device's self-description.
    Info,
    /// Drive the target LED.
    Led {
        #[command(subcommand)]
        action: LedAction,
    },
    /// Drive the target motor.
    Motor {
        #[command(subcommand)]
        action: MotorAction,
    },
    /// Drive the target servo.
    Servo {
        #[command(subcommand)]
        action: ServoAction,
    },
}

#[derive(Debug, Subcommand)]
enum LedAction {
    On,
    Off,
    /// Turn the LED on at the given brightness.
    Brightness { level: u32 },
}

#[derive(Debug, Subcommand)]
enum MotorAction {
    Forward {
        #[arg(default_value_t = MOTOR_DEFAULT_SPEED)]
        speed: u32,
    },
    Reverse {
        #[arg(default_value_t = MOTOR_DEFAULT_SPEED)]
        speed: u32,
    },
    /// Signed speed: positive forward, negative reverse, 0 stops.
    Speed {
        #[arg(allow_negative_numbers = true)]
        speed: i64,
    },
    Stop,
    /// Engage or release the brake.
    Brake {
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        on: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ServoAction {
    /// Move to an angle in degrees.
    Move { angle: u32 },
    /// Release the servo.
    Stop,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let master = Master::new();
    TcpLink::connect(&cli.connect, &master)
        .await
        .with_context(|| format!("cannot reach device host {}", cli.connect))?;
    let target = Controller::new(master, RoutePath::new(cli.route.clone()));

    run(cli.command, target, cli.json).await
}

async fn run(command: Command, target: Controller, json: bool) -> anyhow::Result<()> {
    let route = format!("{:?}", target.route().hops());
    match command {
        Command::Enumerate => {
            let devices = BusCtl::new(target)
                .enumerate()
                .await
                .with_context(|| format!("enumerate on {route} failed"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                for device in &devices {
                    println!("{}", describe(device));
                }
            }
        }
        Command::Info => {
            let info = target
                .device_info()
                .await
                .with_context(|| format!("device info on {route} failed"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{}", describe(&info));
            }
        }
        Command::Led { action } => {
            let led = LedCtl::new(target);
            let result = match action {
                LedAction::On => led.on().await,
                LedAction::Off => led.off().await,
                LedAction::Brightness { level } => led.set_brightness(level).await,
            };
            result.with_context(|| format!("LED command on {route} failed"))?;
            print_ok(json);
        }
        Command::Motor { action } => {
            let motor = MotorCtl::new(target);
            let result = match action {
                MotorAction::Forward { speed } => motor.forward(speed).await,
                MotorAction::Reverse { speed } => motor.reverse(speed).await,
                MotorAction::Speed { speed } => motor.set_speed(speed).await,
                MotorAction::Stop => motor.stop().await,
                MotorAction::Brake { on } => motor.set_brake(on).await,
            };
            result.with_context(|| format!("motor command on {route} failed"))?;
            print_ok(json);
        }
        Command::Servo { action } => {
            let servo = ServoCtl::new(target);
            let result = match action {
                ServoAction::Move { angle } => servo.move_to(angle).await,
                ServoAction::Stop => servo.stop().await,
            };
            result.with_context(|| format!("servo command on {route} failed"))?;
            print_ok(json);
        }
    }
    Ok(())
}

fn print_ok(json: bool) {
    if json {
        println!("{}", serde_json::json!({ "ok": true }));
    } else {
        println!("ok");
    }
}

/// One line per device: address, class, id and labels.
fn describe(info: &DeviceInfo) -> String {
    let labels: Vec<String> = info
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!(
        "{:>3}  class {:#06x}  id {:<6} {}",
        info.address,
        info.class_id,
        info.device_id,
        labels.join(" ")
    )
    .trim_end()
    .to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
