//! End-effector target used by Follow mode.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

/// Desired tool pose in the base frame.
///
/// Moves are ignored while the target is disabled. Translation is kept
/// within `reach` metres of the base origin.
#[derive(Debug, Clone, PartialEq)]
pub struct EndEffectorTarget {
    pose: Isometry3<f64>,
    enabled: bool,
    reach: f64,
}

impl EndEffectorTarget {
    pub fn new(pose: Isometry3<f64>, reach: f64) -> Self {
        let mut target = Self { pose, enabled: false, reach };
        target.pose.translation = target.limit_reach(target.pose.translation.vector);
        target
    }

    pub fn pose(&self) -> Isometry3<f64> {
        self.pose
    }

    pub fn position(&self) -> Vector3<f64> {
        self.pose.translation.vector
    }

    pub fn set_pose(&mut self, pose: Isometry3<f64>) {
        self.pose = Isometry3::from_parts(self.limit_reach(pose.translation.vector), pose.rotation);
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn reach(&self) -> f64 {
        self.reach
    }

    /// Shift the target in base-frame coordinates.
    pub fn translate(&mut self, dx: f64, dy: f64, dz: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let moved = self.pose.translation.vector + Vector3::new(dx, dy, dz);
        self.pose.translation = self.limit_reach(moved);
        true
    }

    /// Rotate the target about its own x, y and z axes, in that order.
    pub fn rotate(&mut self, rx: f64, ry: f64, rz: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let delta = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), rx)
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), ry)
            * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), rz);
        self.pose.rotation *= delta;
        true
    }

    fn limit_reach(&self, p: Vector3<f64>) -> Translation3<f64> {
        let norm = p.norm();
        if self.reach > 0.0 && norm > self.reach {
            Translation3::from(p * (self.reach / norm))
        } else {
            Translation3::from(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn disabled_target_does_not_move() {
        let mut t = EndEffectorTarget::new(Isometry3::translation(0.1, 0.0, 0.2), 0.5);
        assert!(!t.translate(0.1, 0.0, 0.0));
        assert!(!t.rotate(0.1, 0.0, 0.0));
        assert_eq!(t.position(), Vector3::new(0.1, 0.0, 0.2));
    }

    #[test]
    fn translate_is_clamped_to_reach() {
        let mut t = EndEffectorTarget::new(Isometry3::translation(0.0, 0.0, 0.4), 0.5);
        t.enable();
        assert!(t.translate(0.0, 0.0, 0.05));
        assert!((t.position().z - 0.45).abs() < 1e-12);
        t.translate(0.0, 0.0, 1.0);
        assert!((t.position().norm() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rotate_about_own_axes() {
        let mut t = EndEffectorTarget::new(Isometry3::identity(), 0.5);
        t.enable();
        t.rotate(0.0, 0.0, FRAC_PI_2);
        t.rotate(FRAC_PI_2, 0.0, 0.0);
        // second turn is about the already-rotated x axis
        let z = t.pose().rotation * Vector3::z();
        assert!((z - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-9);
        assert_eq!(t.position(), Vector3::zeros());
    }

    #[test]
    fn new_clamps_initial_pose() {
        let t = EndEffectorTarget::new(Isometry3::translation(3.0, 0.0, 4.0), 1.0);
        assert!((t.position() - Vector3::new(0.6, 0.0, 0.8)).norm() < 1e-12);
    }
}
