//! Pose backends
//!
//! Where the measured pose comes from and where the reference pose goes.
//! Picked once at startup; the rest of the driver only sees `ArmState`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serialport::SerialPort;

use crate::arduino_connection::ArduinoConnection;
use crate::arm_state::ArmState;
use crate::command::{CommandTransmitter, OverrideChannels};
use crate::config_loader::DriverSettings;
use crate::gamepad::LiveAxes;
use crate::simulation::{SimulationIntegrator, VelocityController};
use crate::telemetry::TelemetryReceiver;

pub trait PoseBackend {
    fn name(&self) -> String;

    /// Raised once the backend is producing measured poses.
    fn link_ready(&self) -> Arc<AtomicBool>;

    /// Start the backend's threads. They exit once `stop` is raised.
    fn start(self: Box<Self>, stop: Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>>;
}

/// Telemetry reader plus command transmitter over a split link.
pub struct HardwareBackend<R, W> {
    name: String,
    reader: R,
    writer: W,
    state: Arc<ArmState>,
    inputs: Arc<LiveAxes>,
    overrides: OverrideChannels,
    poll: Duration,
    dt: f64,
    link_ready: Arc<AtomicBool>,
}

impl<R, W> HardwareBackend<R, W> {
    pub fn new(
        name: impl Into<String>,
        reader: R,
        writer: W,
        state: Arc<ArmState>,
        inputs: Arc<LiveAxes>,
        overrides: OverrideChannels,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            state,
            inputs,
            overrides,
            poll: Duration::from_millis(10),
            dt: 0.1,
            link_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Time constant of the commanded pose while tracking.
    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }
}

impl HardwareBackend<Box<dyn SerialPort>, Box<dyn SerialPort>> {
    pub fn from_connection(
        connection: ArduinoConnection,
        state: Arc<ArmState>,
        inputs: Arc<LiveAxes>,
        overrides: OverrideChannels,
    ) -> Self {
        let name = format!("hardware ({})", connection.port_name());
        let (reader, writer) = connection.into_split();
        Self::new(name, reader, writer, state, inputs, overrides)
    }
}

impl<R, W> PoseBackend for HardwareBackend<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn link_ready(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.link_ready)
    }

    fn start(self: Box<Self>, stop: Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>> {
        let this = *self;
        let receiver = TelemetryReceiver::new(this.reader, Arc::clone(&this.state), this.link_ready);
        let transmitter = CommandTransmitter::new(this.writer, this.state, this.inputs, this.overrides)
            .with_poll(this.poll)
            .drive_toward_reference(this.dt);
        let rx = receiver.spawn(Arc::clone(&stop)).context("Failed to start telemetry thread")?;
        let tx = transmitter.spawn(stop).context("Failed to start command thread")?;
        Ok(vec![rx, tx])
    }
}

/// Velocity controller plus Euler integrator, no I/O.
pub struct SimulatedBackend {
    state: Arc<ArmState>,
    dt: f64,
    update_dt: f64,
    link_ready: Arc<AtomicBool>,
}

impl SimulatedBackend {
    pub fn new(state: Arc<ArmState>, dt: f64, update_dt: f64) -> Self {
        Self {
            state,
            dt,
            update_dt,
            link_ready: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl PoseBackend for SimulatedBackend {
    fn name(&self) -> String {
        "simulation".to_string()
    }

    fn link_ready(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.link_ready)
    }

    fn start(self: Box<Self>, stop: Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>> {
        let velocity = VelocityController::new(Arc::clone(&self.state), self.dt)
            .spawn(Arc::clone(&stop))
            .context("Failed to start velocity controller thread")?;
        let integrator = SimulationIntegrator::new(self.state, self.update_dt)
            .spawn(stop)
            .context("Failed to start simulation thread")?;
        Ok(vec![velocity, integrator])
    }
}

/// Build the backend the settings ask for. Opening the serial link happens
/// here, so a missing board fails startup.
pub fn select_backend(
    settings: &DriverSettings,
    state: Arc<ArmState>,
    inputs: Arc<LiveAxes>,
) -> Result<Box<dyn PoseBackend>> {
    let backend: Box<dyn PoseBackend> = if settings.simulate {
        Box::new(SimulatedBackend::new(state, settings.control.dt, settings.control.update_dt()))
    } else {
        let connection = ArduinoConnection::open(&settings.link)?;
        let overrides = settings.gamepad.overrides()?;
        Box::new(
            HardwareBackend::from_connection(connection, state, inputs, overrides)
                .with_poll(settings.link.poll())
                .with_dt(settings.control.dt),
        )
    };
    info!(target: "backend", "Pose backend: {}", backend.name());
    Ok(backend)
}

/// Raise `stop` and wait for every backend thread.
pub fn shutdown(stop: &AtomicBool, handles: Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            warn!(target: "backend", "Thread '{}' panicked", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_state::{deg_to_rad, JointLimits, Pose};
    use std::io::{self, Cursor};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct SharedLink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedLink {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap()).lines().map(str::to_string).collect()
        }
    }

    fn state() -> Arc<ArmState> {
        let init = Pose::from_degrees([0.0, 45.0, -90.0, 0.0, -45.0], 73.0);
        Arc::new(ArmState::new(init, JointLimits::symmetric_deg(135.0)))
    }

    fn wait_for<F: Fn() -> bool>(f: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn hardware_backend_reads_telemetry_and_streams_reference() {
        let s = state();
        s.set_enabled(true);
        let link = SharedLink::default();
        let reader = Cursor::new(b"<Ready>\nServoPos2: 30\n".to_vec());
        let backend = HardwareBackend::new(
            "test",
            reader,
            link.clone(),
            Arc::clone(&s),
            Arc::new(LiveAxes::new()),
            OverrideChannels::default(),
        )
        .with_poll(Duration::from_millis(1))
        .with_dt(0.01);
        let ready = backend.link_ready();
        let stop = Arc::new(AtomicBool::new(false));
        let handles = Box::new(backend).start(Arc::clone(&stop)).unwrap();

        assert!(wait_for(|| ready.load(Ordering::SeqCst)));
        assert!(wait_for(|| (s.measured().joints[1] - deg_to_rad(30.0)).abs() < 1e-12));
        assert!(wait_for(|| link.lines().last().map(String::as_str) == Some("<90, 45, -90, 0, -45, 10>")));

        // an IK result lands in reference; the servos must follow it
        s.set_reference([0.0, deg_to_rad(5.0), deg_to_rad(20.0), deg_to_rad(30.0), deg_to_rad(40.0)]);
        let reached = wait_for(|| link.lines().last().map(String::as_str) == Some("<90, 5, 20, 30, 40, 10>"));
        shutdown(&stop, handles);
        assert!(reached);
        assert!(link.lines().len() > 2);
    }

    #[test]
    fn simulated_backend_tracks_reference() {
        let s = state();
        let backend = Box::new(SimulatedBackend::new(Arc::clone(&s), 0.02, 0.005));
        assert!(backend.link_ready().load(Ordering::SeqCst));
        let stop = Arc::new(AtomicBool::new(false));
        let handles = backend.start(Arc::clone(&stop)).unwrap();
        s.set_enabled(true);
        s.set_reference([0.1, 0.5, -1.0, 0.0, -0.5]);
        let converged = wait_for(|| {
            let m = s.measured().joints;
            let r = s.reference().joints;
            m.iter().zip(r.iter()).all(|(a, b)| (a - b).abs() < 1e-3)
        });
        shutdown(&stop, handles);
        assert!(converged);
    }
}
