//! Kinematics provider
//!
//! `Kinematics` is the seam the mode controller and the renderer talk to.
//! `DhChain` is the stock implementation: a standard Denavit-Hartenberg
//! chain with damped-least-squares inverse kinematics on a numerical
//! Jacobian. With five joints a full 6-DoF target is generally not reachable,
//! so orientation is weighted down and only the position error decides
//! whether a solution counts.

use nalgebra::{Isometry3, Matrix6, Point3, SMatrix, Translation3, UnitQuaternion, Vector3, Vector6};

use crate::arm_state::NUM_JOINTS;

pub trait Kinematics: Send + Sync {
    /// End-effector pose in the base frame.
    fn forward(&self, q: &[f64; NUM_JOINTS]) -> Isometry3<f64>;

    /// Joint angles reaching `target`, starting the search at `seed`.
    /// `None` means no solution; the caller keeps its previous reference.
    fn inverse(&self, target: &Isometry3<f64>, seed: &[f64; NUM_JOINTS]) -> Option<[f64; NUM_JOINTS]>;

    /// Origin of every link frame plus the tool point, for drawing.
    fn joint_positions(&self, q: &[f64; NUM_JOINTS]) -> Vec<Point3<f64>> {
        vec![Point3::origin(), self.forward(q).translation.vector.into()]
    }
}

/// Standard DH parameters of one revolute link. Lengths in metres, angles in
/// radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhLink {
    pub d: f64,
    pub a: f64,
    pub alpha: f64,
    pub offset: f64,
}

impl DhLink {
    pub fn new(d: f64, a: f64, alpha: f64, offset: f64) -> Self {
        Self { d, a, alpha, offset }
    }

    /// `Rz(theta) * Tz(d) * Tx(a) * Rx(alpha)`
    pub fn transform(&self, theta: f64) -> Isometry3<f64> {
        let z = Isometry3::from_parts(
            Translation3::new(0.0, 0.0, self.d),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), theta + self.offset),
        );
        let x = Isometry3::from_parts(
            Translation3::new(self.a, 0.0, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), self.alpha),
        );
        z * x
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IkParams {
    pub max_iterations: usize,
    pub damping: f64,
    /// Position error accepted as a solution, metres.
    pub position_tolerance: f64,
    /// Relative weight of the orientation error against position.
    pub orientation_weight: f64,
}

impl Default for IkParams {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            damping: 0.01,
            position_tolerance: 1e-3,
            orientation_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DhChain {
    links: [DhLink; NUM_JOINTS],
    ik: IkParams,
}

type Jacobian = SMatrix<f64, 6, NUM_JOINTS>;

fn wrap_angle(q: f64) -> f64 {
    use std::f64::consts::PI;
    (q + PI).rem_euclid(2.0 * PI) - PI
}

impl DhChain {
    pub fn new(links: [DhLink; NUM_JOINTS]) -> Self {
        Self { links, ik: IkParams::default() }
    }

    pub fn with_ik_params(mut self, ik: IkParams) -> Self {
        self.ik = ik;
        self
    }

    pub fn links(&self) -> &[DhLink; NUM_JOINTS] {
        &self.links
    }

    /// Sum of link lengths, an upper bound on the distance from the base to
    /// the tool.
    pub fn reach(&self) -> f64 {
        self.links.iter().map(|l| l.d.abs() + l.a.abs()).sum()
    }

    fn frames(&self, q: &[f64; NUM_JOINTS]) -> Vec<Isometry3<f64>> {
        let mut acc = Isometry3::identity();
        let mut out = Vec::with_capacity(NUM_JOINTS + 1);
        out.push(acc);
        for (link, theta) in self.links.iter().zip(q.iter()) {
            acc *= link.transform(*theta);
            out.push(acc);
        }
        out
    }

    /// Position error plus weighted rotation error (axis-angle).
    fn pose_error(current: &Isometry3<f64>, target: &Isometry3<f64>, weight: f64) -> Vector6<f64> {
        let dp = target.translation.vector - current.translation.vector;
        let dr = (target.rotation * current.rotation.inverse()).scaled_axis() * weight;
        Vector6::new(dp.x, dp.y, dp.z, dr.x, dr.y, dr.z)
    }

    fn jacobian(&self, q: &[f64; NUM_JOINTS], at: &Isometry3<f64>, weight: f64) -> Jacobian {
        const H: f64 = 1e-6;
        let mut jac = Jacobian::zeros();
        for j in 0..NUM_JOINTS {
            let mut qh = *q;
            qh[j] += H;
            let moved = self.forward(&qh);
            let dp = (moved.translation.vector - at.translation.vector) / H;
            let dr = (moved.rotation * at.rotation.inverse()).scaled_axis() * (weight / H);
            jac.set_column(j, &Vector6::new(dp.x, dp.y, dp.z, dr.x, dr.y, dr.z));
        }
        jac
    }

    fn solve(&self, target: &Isometry3<f64>, seed: &[f64; NUM_JOINTS], weight: f64) -> Option<[f64; NUM_JOINTS]> {
        let lambda2 = self.ik.damping * self.ik.damping;
        let mut q = *seed;
        for _ in 0..self.ik.max_iterations {
            let current = self.forward(&q);
            let err = Self::pose_error(&current, target, weight);
            if err.norm() < 1e-7 {
                break;
            }
            let jac = self.jacobian(&q, &current, weight);
            let jjt: Matrix6<f64> = jac * jac.transpose() + Matrix6::identity() * lambda2;
            let step = jac.transpose() * jjt.try_inverse()? * err;
            if step.norm() < 1e-10 {
                break;
            }
            for (qi, dqi) in q.iter_mut().zip(step.iter()) {
                *qi = wrap_angle(*qi + dqi);
            }
        }
        q.iter().all(|v| v.is_finite()).then_some(q)
    }

    fn within_tolerance(&self, q: &[f64; NUM_JOINTS], target: &Isometry3<f64>) -> bool {
        let reached = self.forward(q).translation.vector - target.translation.vector;
        reached.norm() <= self.ik.position_tolerance
    }
}

impl Kinematics for DhChain {
    fn forward(&self, q: &[f64; NUM_JOINTS]) -> Isometry3<f64> {
        self.links
            .iter()
            .zip(q.iter())
            .fold(Isometry3::identity(), |acc, (link, theta)| acc * link.transform(*theta))
    }

    /// Orientation-weighted solve first; if that leaves the position off, a
    /// position-only pass from where it stopped.
    fn inverse(&self, target: &Isometry3<f64>, seed: &[f64; NUM_JOINTS]) -> Option<[f64; NUM_JOINTS]> {
        let q = self.solve(target, seed, self.ik.orientation_weight)?;
        if self.within_tolerance(&q, target) {
            return Some(q);
        }
        let q = self.solve(target, &q, 0.0)?;
        self.within_tolerance(&q, target).then_some(q)
    }

    fn joint_positions(&self, q: &[f64; NUM_JOINTS]) -> Vec<Point3<f64>> {
        self.frames(q)
            .into_iter()
            .map(|f| f.translation.vector.into())
            .collect()
    }
}
