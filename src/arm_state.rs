//! Shared arm state
//!
//! The single source of truth for the arm pose. Every execution context
//! (telemetry reader, command transmitter, simulator, control tick) holds an
//! `Arc<ArmState>` and goes through the accessors below. Fields are split
//! into two lock groups, the pose group and the control group, and no lock is
//! ever held across serial I/O: callers copy a snapshot out and release.

use std::f64::consts::PI;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of kinematic joints (the claw is tracked separately).
pub const NUM_JOINTS: usize = 5;

pub fn deg_to_rad(deg: f64) -> f64 {
    deg * PI / 180.0
}

pub fn rad_to_deg(rad: f64) -> f64 {
    rad * 180.0 / PI
}

/// Joint angles in radians plus the claw angle in hardware degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub joints: [f64; NUM_JOINTS],
    pub claw_deg: f64,
}

impl Pose {
    pub fn new(joints: [f64; NUM_JOINTS], claw_deg: f64) -> Self {
        Self { joints, claw_deg }
    }

    pub fn from_degrees(joints_deg: [f64; NUM_JOINTS], claw_deg: f64) -> Self {
        Self {
            joints: joints_deg.map(deg_to_rad),
            claw_deg,
        }
    }

    pub fn joints_deg(&self) -> [f64; NUM_JOINTS] {
        self.joints.map(rad_to_deg)
    }

    /// Joint angles rounded to whole degrees, as the servos take them.
    pub fn joints_deg_rounded(&self) -> [i32; NUM_JOINTS] {
        self.joints.map(|q| rad_to_deg(q).round() as i32)
    }
}

/// Per-joint `[min, max]` in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointLimits {
    pub min: [f64; NUM_JOINTS],
    pub max: [f64; NUM_JOINTS],
}

impl JointLimits {
    pub fn new(min: [f64; NUM_JOINTS], max: [f64; NUM_JOINTS]) -> Self {
        Self { min, max }
    }

    /// Symmetric limits of `±band_deg` on every joint.
    pub fn symmetric_deg(band_deg: f64) -> Self {
        let band = deg_to_rad(band_deg);
        Self {
            min: [-band; NUM_JOINTS],
            max: [band; NUM_JOINTS],
        }
    }

    pub fn from_degrees(limits_deg: [[f64; 2]; NUM_JOINTS]) -> Self {
        Self {
            min: limits_deg.map(|l| deg_to_rad(l[0])),
            max: limits_deg.map(|l| deg_to_rad(l[1])),
        }
    }

    pub fn clamp_joint(&self, idx: usize, q: f64) -> f64 {
        q.clamp(self.min[idx], self.max[idx])
    }

    pub fn clamp(&self, q: [f64; NUM_JOINTS]) -> [f64; NUM_JOINTS] {
        let mut out = q;
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.clamp_joint(i, *v);
        }
        out
    }

    pub fn contains(&self, q: &[f64; NUM_JOINTS]) -> bool {
        q.iter()
            .enumerate()
            .all(|(i, v)| *v >= self.min[i] && *v <= self.max[i])
    }
}

/// How the reference pose is produced each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMode {
    /// Per-joint stepping from sliders, bumpers and sticks.
    Manual,
    /// Reference follows the end-effector target through inverse kinematics.
    Follow,
    /// Reserved. Selecting it is a configuration error.
    Optimize,
}

impl ControlMode {
    pub const ALL: [ControlMode; 3] = [ControlMode::Manual, ControlMode::Follow, ControlMode::Optimize];

    pub fn label(&self) -> &'static str {
        match self {
            ControlMode::Manual => "Manual",
            ControlMode::Follow => "Follow",
            ControlMode::Optimize => "Optimize",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy)]
struct PoseGroup {
    measured: Pose,
    reference: Pose,
    velocity: [f64; NUM_JOINTS],
}

#[derive(Debug, Clone, Copy)]
struct ControlGroup {
    mode: ControlMode,
    enabled: bool,
}

/// Per-tick copy of everything the render/UI side displays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmSnapshot {
    pub measured: Pose,
    pub reference: Pose,
    pub mode: ControlMode,
    pub enabled: bool,
}

#[derive(Debug)]
pub struct ArmState {
    limits: JointLimits,
    poses: Mutex<PoseGroup>,
    control: RwLock<ControlGroup>,
}

impl ArmState {
    /// Create the state with `initial` as both measured and reference pose.
    /// The reference is clamped to `limits` on the way in.
    pub fn new(initial: Pose, limits: JointLimits) -> Self {
        let reference = Pose::new(limits.clamp(initial.joints), initial.claw_deg);
        Self {
            limits,
            poses: Mutex::new(PoseGroup {
                measured: initial,
                reference,
                velocity: [0.0; NUM_JOINTS],
            }),
            control: RwLock::new(ControlGroup {
                mode: ControlMode::Manual,
                enabled: false,
            }),
        }
    }

    // A poisoned lock only means another thread panicked mid-section; every
    // write below leaves the group consistent, so the data is still usable.
    fn poses(&self) -> MutexGuard<'_, PoseGroup> {
        self.poses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control_read(&self) -> RwLockReadGuard<'_, ControlGroup> {
        self.control.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn control_write(&self) -> RwLockWriteGuard<'_, ControlGroup> {
        self.control.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    // -------------------- measured --------------------

    pub fn measured(&self) -> Pose {
        self.poses().measured
    }

    pub fn set_measured(&self, pose: Pose) {
        self.poses().measured = pose;
    }

    pub fn set_measured_joint(&self, idx: usize, q: f64) {
        if idx < NUM_JOINTS {
            self.poses().measured.joints[idx] = q;
        }
    }

    pub fn set_measured_claw(&self, claw_deg: f64) {
        self.poses().measured.claw_deg = claw_deg;
    }

    /// Run `f` on the measured pose with read access to the reference pose
    /// and the current velocity, all under one critical section.
    pub fn update_measured<F>(&self, f: F)
    where
        F: FnOnce(&mut Pose, &Pose, &[f64; NUM_JOINTS]),
    {
        let mut group = self.poses();
        let PoseGroup { measured, reference, velocity } = &mut *group;
        f(measured, reference, velocity);
    }

    // -------------------- reference --------------------

    pub fn reference(&self) -> Pose {
        self.poses().reference
    }

    /// Replace all joint references. Each joint is clamped to its limits.
    pub fn set_reference(&self, joints: [f64; NUM_JOINTS]) {
        let clamped = self.limits.clamp(joints);
        self.poses().reference.joints = clamped;
    }

    pub fn set_reference_joint(&self, idx: usize, q: f64) {
        if idx < NUM_JOINTS {
            let clamped = self.limits.clamp_joint(idx, q);
            self.poses().reference.joints[idx] = clamped;
        }
    }

    pub fn set_reference_claw(&self, claw_deg: f64) {
        self.poses().reference.claw_deg = claw_deg;
    }

    /// Read-modify-write of one reference joint as a single critical section.
    ///
    /// `f` receives the current value and returns the new one, or `None` to
    /// leave the joint untouched. The committed value is clamped to limits.
    /// Returns whether a value was committed.
    pub fn try_update_reference_joint<F>(&self, idx: usize, f: F) -> bool
    where
        F: FnOnce(f64) -> Option<f64>,
    {
        if idx >= NUM_JOINTS {
            return false;
        }
        let mut group = self.poses();
        match f(group.reference.joints[idx]) {
            Some(q) => {
                group.reference.joints[idx] = self.limits.clamp_joint(idx, q);
                true
            }
            None => false,
        }
    }

    // -------------------- velocity --------------------

    pub fn velocity(&self) -> [f64; NUM_JOINTS] {
        self.poses().velocity
    }

    pub fn set_velocity(&self, qd: [f64; NUM_JOINTS]) {
        self.poses().velocity = qd;
    }

    // -------------------- control group --------------------

    pub fn mode(&self) -> ControlMode {
        self.control_read().mode
    }

    pub fn set_mode(&self, mode: ControlMode) {
        self.control_write().mode = mode;
    }

    pub fn enabled(&self) -> bool {
        self.control_read().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.control_write().enabled = enabled;
    }

    /// Each group is read under its own lock, so the snapshot is consistent
    /// per group but not across groups.
    pub fn snapshot(&self) -> ArmSnapshot {
        let (measured, reference) = {
            let group = self.poses();
            (group.measured, group.reference)
        };
        let control = *self.control_read();
        ArmSnapshot {
            measured,
            reference,
            mode: control.mode,
            enabled: control.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn state() -> ArmState {
        let init = Pose::from_degrees([0.0, 45.0, -90.0, 0.0, -45.0], 73.0);
        ArmState::new(init, JointLimits::symmetric_deg(135.0))
    }

    #[test]
    fn reference_writes_are_clamped() {
        let s = state();
        s.set_reference([10.0, -10.0, 0.5, 3.0, -3.0]);
        let r = s.reference().joints;
        let lim = deg_to_rad(135.0);
        assert_eq!(r[0], lim);
        assert_eq!(r[1], -lim);
        assert_eq!(r[2], 0.5);
        assert!(s.limits().contains(&r));

        s.set_reference_joint(3, -99.0);
        assert_eq!(s.reference().joints[3], -lim);
    }

    #[test]
    fn clamping_holds_for_every_write_sequence() {
        let s = state();
        let writes = [-7.5, -2.4, -0.1, 0.0, 1.2, 2.36, 2.4, 9.0];
        for (n, w) in writes.iter().enumerate() {
            s.set_reference_joint(n % NUM_JOINTS, *w);
            s.set_reference([*w; NUM_JOINTS]);
            s.try_update_reference_joint(n % NUM_JOINTS, |q| Some(q + w));
            assert!(s.limits().contains(&s.reference().joints));
        }
    }

    #[test]
    fn try_update_can_reject() {
        let s = state();
        let before = s.reference();
        assert!(!s.try_update_reference_joint(1, |_| None));
        assert_eq!(s.reference(), before);
        assert!(!s.try_update_reference_joint(NUM_JOINTS, |q| Some(q)));
        assert!(s.try_update_reference_joint(1, |q| Some(q + 0.1)));
        assert!((s.reference().joints[1] - (before.joints[1] + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn initial_reference_is_clamped() {
        let init = Pose::new([4.0, 0.0, 0.0, 0.0, 0.0], 10.0);
        let s = ArmState::new(init, JointLimits::symmetric_deg(90.0));
        assert_eq!(s.reference().joints[0], deg_to_rad(90.0));
        assert_eq!(s.measured().joints[0], 4.0);
    }

    #[test]
    fn degree_helpers() {
        let p = Pose::from_degrees([90.0, 45.4, -45.6, 0.0, 180.0], 10.0);
        assert_eq!(p.joints_deg_rounded(), [90, 45, -46, 0, 180]);
        assert!((p.joints[0] - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn concurrent_writers_never_tear_reference() {
        let s = Arc::new(state());
        let a = [0.1; NUM_JOINTS];
        let b = [-0.2; NUM_JOINTS];
        let mut handles = Vec::new();
        for target in [a, b] {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                for _ in 0..2000 {
                    s.set_reference(target);
                }
            }));
        }
        let initial = s.reference().joints;
        let reader = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                for _ in 0..2000 {
                    let r = s.reference().joints;
                    assert!(r == a || r == b || r == initial, "torn read: {:?}", r);
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        reader.join().unwrap();
    }

    #[test]
    fn snapshot_reports_control_group() {
        let s = state();
        s.set_mode(ControlMode::Follow);
        s.set_enabled(true);
        let snap = s.snapshot();
        assert_eq!(snap.mode, ControlMode::Follow);
        assert!(snap.enabled);
        assert_eq!(snap.reference, s.reference());
    }
}
