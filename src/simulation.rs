//! Simulated arm
//!
//! Stands in for the serial link and the real servos. The velocity
//! controller sets a joint velocity every `dt`; the integrator advances the
//! measured pose by forward Euler every `update_dt`. With tracking disabled
//! the measured pose jumps straight to the reference.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use crate::arm_state::{ArmState, NUM_JOINTS};

/// Call `f` every `period` until `stop` is raised. Deadlines advance by a
/// fixed step; a late iteration does not shift the ones after it.
pub fn run_every<F: FnMut()>(period: Duration, stop: &AtomicBool, mut f: F) {
    let mut next = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        f();
        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}

/// One integrator step.
pub fn integrate(state: &ArmState, update_dt: f64) {
    let enabled = state.enabled();
    let limits = *state.limits();
    state.update_measured(|measured, reference, velocity| {
        if enabled {
            let mut q = measured.joints;
            for i in 0..NUM_JOINTS {
                q[i] += update_dt * velocity[i];
            }
            measured.joints = limits.clamp(q);
            measured.claw_deg = reference.claw_deg;
        } else {
            *measured = *reference;
        }
    });
}

/// `(reference - measured) / dt` while enabled, zero otherwise.
pub fn control_velocity(state: &ArmState, dt: f64) -> [f64; NUM_JOINTS] {
    if !state.enabled() {
        return [0.0; NUM_JOINTS];
    }
    let measured = state.measured().joints;
    let reference = state.reference().joints;
    let mut qd = [0.0; NUM_JOINTS];
    for i in 0..NUM_JOINTS {
        qd[i] = (reference[i] - measured[i]) / dt;
    }
    qd
}

pub struct SimulationIntegrator {
    state: Arc<ArmState>,
    update_dt: f64,
    steps: u64,
}

impl SimulationIntegrator {
    pub fn new(state: Arc<ArmState>, update_dt: f64) -> Self {
        Self { state, update_dt, steps: 0 }
    }

    pub fn step(&mut self) {
        integrate(&self.state, self.update_dt);
        self.steps += 1;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        debug!(target: "simulation", "Integrator running at {} s", self.update_dt);
        let period = Duration::from_secs_f64(self.update_dt);
        run_every(period, stop, || self.step());
        debug!(target: "simulation", "Integrator stopped after {} steps", self.steps);
    }

    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("simulation".into())
            .spawn(move || self.run(&stop))
    }
}

pub struct VelocityController {
    state: Arc<ArmState>,
    dt: f64,
}

impl VelocityController {
    pub fn new(state: Arc<ArmState>, dt: f64) -> Self {
        Self { state, dt }
    }

    pub fn step(&self) {
        self.state.set_velocity(control_velocity(&self.state, self.dt));
    }

    pub fn spawn(self, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("velocity".into())
            .spawn(move || run_every(Duration::from_secs_f64(self.dt), &stop, || self.step()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_state::{JointLimits, Pose};

    fn state() -> Arc<ArmState> {
        let init = Pose::from_degrees([0.0, 45.0, -90.0, 0.0, -45.0], 73.0);
        Arc::new(ArmState::new(init, JointLimits::symmetric_deg(135.0)))
    }

    #[test]
    fn disabled_step_snaps_to_reference() {
        let s = state();
        s.set_velocity([5.0; NUM_JOINTS]);
        s.set_reference([0.1, 0.2, 0.3, 0.4, 0.5]);
        s.set_reference_claw(20.0);
        integrate(&s, 0.025);
        assert_eq!(s.measured(), s.reference());
    }

    #[test]
    fn enabled_step_is_forward_euler() {
        let s = state();
        s.set_enabled(true);
        let before = s.measured().joints;
        s.set_velocity([1.0, -1.0, 0.0, 2.0, 0.0]);
        integrate(&s, 0.025);
        let after = s.measured().joints;
        assert!((after[0] - (before[0] + 0.025)).abs() < 1e-12);
        assert!((after[1] - (before[1] - 0.025)).abs() < 1e-12);
        assert_eq!(after[2], before[2]);
        assert!((after[3] - (before[3] + 0.05)).abs() < 1e-12);
    }

    #[test]
    fn enabled_step_is_clamped() {
        let s = state();
        s.set_enabled(true);
        s.set_velocity([1000.0; NUM_JOINTS]);
        integrate(&s, 0.025);
        assert!(s.limits().contains(&s.measured().joints));
    }

    #[test]
    fn velocity_controller_converges_in_one_dt() {
        let s = state();
        s.set_enabled(true);
        s.set_reference([0.3, 0.5, -1.0, 0.2, -0.5]);
        s.set_velocity(control_velocity(&s, 0.1));
        let mut sim = SimulationIntegrator::new(Arc::clone(&s), 0.025);
        for _ in 0..4 {
            sim.step();
        }
        assert_eq!(sim.steps(), 4);
        for (m, r) in s.measured().joints.iter().zip(s.reference().joints.iter()) {
            assert!((m - r).abs() < 1e-9);
        }
    }

    #[test]
    fn velocity_is_zero_when_disabled() {
        let s = state();
        s.set_reference([0.3; NUM_JOINTS]);
        let vc = VelocityController::new(Arc::clone(&s), 0.1);
        vc.step();
        assert_eq!(s.velocity(), [0.0; NUM_JOINTS]);
    }

    #[test]
    fn threads_stop_on_flag() {
        let s = state();
        let stop = Arc::new(AtomicBool::new(false));
        let sim = SimulationIntegrator::new(Arc::clone(&s), 0.005).spawn(Arc::clone(&stop)).unwrap();
        let vc = VelocityController::new(Arc::clone(&s), 0.02).spawn(Arc::clone(&stop)).unwrap();
        s.set_reference([0.2; NUM_JOINTS]);
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        sim.join().unwrap();
        vc.join().unwrap();
        assert_eq!(s.measured().joints, s.reference().joints);
    }
}
