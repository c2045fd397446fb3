/// Arm driver GUI
///
/// Run with: cargo run --bin arm_gui -- [--simulate | --hardware] [--port /dev/ttyACM0]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use eframe::egui;
use gethostname::gethostname;

use armdriver::backend::{self, select_backend};
use armdriver::config_loader::{self, DriverSettings};
use armdriver::control_tick::ControlTick;
use armdriver::gamepad::{self, LiveAxes};
use armdriver::gui::{ArmGui, KeyboardGamepad};
use armdriver::kinematics::Kinematics;
use armdriver::mode_controller::{ControllerSettings, ModeController};
use armdriver::{ArmState, ControlMode};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Drive the simulated arm, whatever the config says
    #[arg(long, conflicts_with = "hardware")]
    simulate: bool,
    /// Drive the servo board, whatever the config says
    #[arg(long)]
    hardware: bool,
    /// Serial device; skips discovery
    #[arg(long)]
    port: Option<String>,
    /// Control mode at startup
    #[arg(long, value_enum, default_value_t = StartMode::Manual)]
    mode: StartMode,
    /// Run the control loop without a window (Ctrl-C to stop)
    #[arg(long)]
    headless: bool,
    #[arg(long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StartMode {
    Manual,
    Follow,
    Optimize,
}

impl From<StartMode> for ControlMode {
    fn from(m: StartMode) -> Self {
        match m {
            StartMode::Manual => ControlMode::Manual,
            StartMode::Follow => ControlMode::Follow,
            StartMode::Optimize => ControlMode::Optimize,
        }
    }
}

fn apply_args(settings: &mut DriverSettings, args: &Args) {
    if args.simulate {
        settings.simulate = true;
    }
    if args.hardware {
        settings.simulate = false;
    }
    if let Some(port) = &args.port {
        settings.link.port = Some(port.clone());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let hostname = gethostname().to_string_lossy().to_string();
    let mut settings = config_loader::load_settings(&config_loader::config_path(), &hostname)?;
    apply_args(&mut settings, &args);

    let chain = settings.arm.kinematics()?;
    let reach = settings.arm.reach(&chain);
    let kinematics: Arc<dyn Kinematics> = Arc::new(chain);
    let state = Arc::new(ArmState::new(settings.arm.init_pose(), settings.arm.limits()));
    let inputs = Arc::new(LiveAxes::new());

    let mut controller = ModeController::new(
        Arc::clone(&state),
        kinematics,
        ControllerSettings::from(&settings.control),
        reach,
    );
    controller.select_mode(args.mode.into())?;

    let backend = select_backend(&settings, Arc::clone(&state), Arc::clone(&inputs))?;
    let backend_name = backend.name();
    let link_ready = backend.link_ready();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let s = Arc::clone(&stop);
        ctrlc::set_handler(move || s.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("Failed to install Ctrl-C handler: {}", e))?;
    }
    let handles = backend.start(Arc::clone(&stop))?;

    let (tx, rx) = gamepad::channel();
    let mut tick = ControlTick::new(controller, Box::new(rx), inputs);
    let update_dt = Duration::from_secs_f64(settings.control.update_dt());

    if args.headless {
        drop(tx);
        log::info!("Headless control loop on {} every {:?}", backend_name, update_dt);
        tick.run(update_dt, &stop);
    } else {
        let gui = ArmGui::new(
            tick,
            KeyboardGamepad::new(tx),
            settings.gamepad.enabled,
            update_dt,
            backend_name,
            link_ready,
            Arc::clone(&stop),
        );
        let options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default().with_inner_size([1100.0, 640.0]),
            ..Default::default()
        };
        if let Err(e) = eframe::run_native("Arm Driver", options, Box::new(|_cc| Box::new(gui))) {
            log::error!("GUI exited with error: {}", e);
        }
    }

    backend::shutdown(&stop, handles);
    log::info!("Stopped");
    Ok(())
}
