//! Mode controller
//!
//! Decides how the reference pose is produced. Each active mode owns its
//! own table from gamepad event code to handler; switching modes drops the
//! old table and builds the new one, so no handler outlives its mode.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use nalgebra::Isometry3;

use crate::arm_state::{deg_to_rad, rad_to_deg, ArmState, ControlMode, NUM_JOINTS};
use crate::config_loader::ControlSettings;
use crate::end_effector::EndEffectorTarget;
use crate::error::ControlError;
use crate::gamepad::{EventCode, GamepadEvent};
use crate::kinematics::Kinematics;

/// Gains and thresholds the handlers read. Angles in radians unless named.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub inc: f64,
    pub inc_a: f64,
    pub inc_analog: f64,
    pub deadzone: f64,
    pub safety_band_deg: f64,
    pub bumper_gain: f64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&ControlSettings::default())
    }
}

impl From<&ControlSettings> for ControllerSettings {
    fn from(c: &ControlSettings) -> Self {
        Self {
            inc: c.inc,
            inc_a: c.inc_a(),
            inc_analog: c.inc_analog,
            deadzone: c.deadzone,
            safety_band_deg: c.safety_band_deg,
            bumper_gain: c.bumper_gain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeOutcome {
    /// New reference, whole degrees.
    Committed(i32),
    BelowDeadzone,
    /// Would have left the safety band; reference untouched.
    OutOfBand(i32),
    UnknownJoint,
    /// Not in Manual.
    Inactive,
}

/// Step `reference[idx]` by `inc_analog * x`, rejecting the whole step
/// unless the result stays strictly inside `±safety_band_deg`. Degrees are
/// rounded half up then truncated toward zero. Check and commit happen under
/// one lock.
pub fn nudge(state: &ArmState, settings: &ControllerSettings, idx: usize, x: f64) -> NudgeOutcome {
    if idx >= NUM_JOINTS {
        return NudgeOutcome::UnknownJoint;
    }
    if x.abs() < settings.deadzone {
        return NudgeOutcome::BelowDeadzone;
    }
    let mut outcome = NudgeOutcome::UnknownJoint;
    state.try_update_reference_joint(idx, |q| {
        let next = q + settings.inc_analog * x;
        let deg = (rad_to_deg(next) + 0.5).trunc();
        if deg.abs() < settings.safety_band_deg {
            outcome = NudgeOutcome::Committed(deg as i32);
            Some(next)
        } else {
            outcome = NudgeOutcome::OutOfBand(deg as i32);
            None
        }
    });
    outcome
}

/// What a handler may touch.
pub struct HandlerContext<'a> {
    pub state: &'a ArmState,
    pub target: &'a mut EndEffectorTarget,
    pub settings: &'a ControllerSettings,
    requested_mode: &'a mut Option<ControlMode>,
}

impl HandlerContext<'_> {
    pub fn nudge(&self, idx: usize, x: f64) -> NudgeOutcome {
        nudge(self.state, self.settings, idx, x)
    }

    /// Switch modes once the current handler returns.
    pub fn request_mode(&mut self, mode: ControlMode) {
        *self.requested_mode = Some(mode);
    }

    fn past_deadzone(&self, x: f32) -> bool {
        (x as f64).abs() >= self.settings.deadzone
    }
}

pub type Handler = Box<dyn Fn(&mut HandlerContext<'_>, f32) + Send>;
pub type HandlerTable = HashMap<EventCode, Handler>;

fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut HandlerContext<'_>, f32) + Send + 'static,
{
    Box::new(f)
}

fn manual_handlers() -> HandlerTable {
    let mut table = HandlerTable::new();
    table.insert(
        EventCode::BtnTl,
        handler(|ctx, x| {
            ctx.nudge(0, ctx.settings.bumper_gain * x as f64);
        }),
    );
    table.insert(
        EventCode::BtnTr,
        handler(|ctx, x| {
            ctx.nudge(0, -ctx.settings.bumper_gain * x as f64);
        }),
    );
    for (code, joint) in [
        (EventCode::AbsY, 1),
        (EventCode::AbsX, 2),
        (EventCode::AbsRy, 3),
        (EventCode::AbsRx, 4),
    ] {
        table.insert(
            code,
            handler(move |ctx, x| {
                ctx.nudge(joint, x as f64);
            }),
        );
    }
    table
}

fn follow_handlers() -> HandlerTable {
    let mut table = HandlerTable::new();
    for (code, axis) in [(EventCode::AbsY, 0), (EventCode::AbsX, 1), (EventCode::AbsRy, 2)] {
        table.insert(
            code,
            handler(move |ctx, x| {
                if !ctx.past_deadzone(x) {
                    return;
                }
                let mut d = [0.0; 3];
                d[axis] = ctx.settings.inc_analog * x as f64;
                ctx.target.translate(d[0], d[1], d[2]);
            }),
        );
    }
    for (code, axis, sign) in [
        (EventCode::BtnWest, 0, 1.0),
        (EventCode::BtnSouth, 0, -1.0),
        (EventCode::BtnNorth, 1, 1.0),
        (EventCode::BtnEast, 1, -1.0),
        (EventCode::BtnTr, 2, 1.0),
        (EventCode::BtnTl, 2, -1.0),
    ] {
        table.insert(
            code,
            handler(move |ctx, x| {
                if x < 0.5 {
                    return;
                }
                let mut r = [0.0; 3];
                r[axis] = sign * ctx.settings.inc_a;
                ctx.target.rotate(r[0], r[1], r[2]);
            }),
        );
    }
    table.insert(
        EventCode::BtnStart,
        handler(|ctx, x| {
            if x >= 0.5 {
                ctx.request_mode(ControlMode::Manual);
            }
        }),
    );
    table
}

/// The running mode and the handlers that belong to it. `Optimize` has no
/// variant: it can never become active.
enum ActiveMode {
    Manual(HandlerTable),
    Follow(HandlerTable),
}

impl ActiveMode {
    fn mode(&self) -> ControlMode {
        match self {
            ActiveMode::Manual(_) => ControlMode::Manual,
            ActiveMode::Follow(_) => ControlMode::Follow,
        }
    }

    fn table(&self) -> &HandlerTable {
        match self {
            ActiveMode::Manual(t) | ActiveMode::Follow(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    /// Not in Follow, or the goal has not moved since the last solve.
    Idle,
    Solved,
    /// IK failed; the previous reference stays.
    NoSolution,
}

pub struct ModeController {
    state: Arc<ArmState>,
    kinematics: Arc<dyn Kinematics>,
    settings: ControllerSettings,
    target: EndEffectorTarget,
    active: ActiveMode,
    follow_target: bool,
    goal: Option<Isometry3<f64>>,
    solved_goal: Option<Isometry3<f64>>,
    ik_misses: u64,
}

impl ModeController {
    /// Starts in Manual.
    pub fn new(state: Arc<ArmState>, kinematics: Arc<dyn Kinematics>, settings: ControllerSettings, reach: f64) -> Self {
        let start = kinematics.forward(&state.reference().joints);
        let mut controller = Self {
            state,
            kinematics,
            settings,
            target: EndEffectorTarget::new(start, reach),
            active: ActiveMode::Manual(HandlerTable::new()),
            follow_target: true,
            goal: None,
            solved_goal: None,
            ik_misses: 0,
        };
        controller.enter_manual();
        controller
    }

    pub fn mode(&self) -> ControlMode {
        self.active.mode()
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn state(&self) -> &Arc<ArmState> {
        &self.state
    }

    pub fn kinematics(&self) -> &Arc<dyn Kinematics> {
        &self.kinematics
    }

    pub fn target(&self) -> &EndEffectorTarget {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut EndEffectorTarget {
        &mut self.target
    }

    pub fn goal(&self) -> Option<Isometry3<f64>> {
        self.goal
    }

    pub fn ik_misses(&self) -> u64 {
        self.ik_misses
    }

    /// Codes the active mode reacts to.
    pub fn registered_codes(&self) -> Vec<EventCode> {
        let mut codes: Vec<EventCode> = self.active.table().keys().copied().collect();
        codes.sort_by_key(|c| c.name());
        codes
    }

    pub fn select_mode(&mut self, mode: ControlMode) -> Result<(), ControlError> {
        match mode {
            ControlMode::Manual => self.enter_manual(),
            ControlMode::Follow => self.enter_follow(),
            ControlMode::Optimize => return Err(ControlError::UnimplementedMode(mode)),
        }
        info!(target: "mode_controller", "Mode: {}", mode);
        Ok(())
    }

    /// Tracking off, sliders (and with them the reference) re-seeded from
    /// the measured pose.
    fn enter_manual(&mut self) {
        self.state.set_enabled(false);
        self.target.disable();
        self.goal = None;
        self.solved_goal = None;
        let seeded = self.state.measured().joints_deg_rounded();
        self.set_reference_deg(seeded);
        self.active = ActiveMode::Manual(manual_handlers());
        self.state.set_mode(ControlMode::Manual);
    }

    fn enter_follow(&mut self) {
        let pose = self.kinematics.forward(&self.state.reference().joints);
        self.target.set_pose(pose);
        self.target.enable();
        self.goal = Some(self.target.pose());
        self.solved_goal = None;
        self.active = ActiveMode::Follow(follow_handlers());
        self.state.set_mode(ControlMode::Follow);
        self.state.set_enabled(true);
    }

    fn set_reference_deg(&self, deg: [i32; NUM_JOINTS]) {
        self.state.set_reference(deg.map(|d| deg_to_rad(d as f64)));
    }

    /// Slider positions for the current reference, whole degrees.
    pub fn slider_positions(&self) -> [i32; NUM_JOINTS] {
        self.state.reference().joints_deg_rounded()
    }

    /// Slider drag. Only honoured in Manual.
    pub fn set_sliders_deg(&mut self, deg: [i32; NUM_JOINTS]) -> bool {
        if self.mode() != ControlMode::Manual {
            return false;
        }
        self.set_reference_deg(deg);
        true
    }

    pub fn nudge(&self, idx: usize, x: f64) -> NudgeOutcome {
        if self.mode() != ControlMode::Manual {
            return NudgeOutcome::Inactive;
        }
        nudge(&self.state, &self.settings, idx, x)
    }

    pub fn follow_target(&self) -> bool {
        self.follow_target
    }

    /// When off, the IK goal only moves on `set_goal`.
    pub fn set_follow_target(&mut self, follow: bool) {
        self.follow_target = follow;
    }

    pub fn set_goal(&mut self) {
        if self.mode() == ControlMode::Follow {
            self.goal = Some(self.target.pose());
        }
    }

    /// Run the active mode's handler for `event`. Returns whether one was
    /// registered.
    pub fn dispatch(&mut self, event: GamepadEvent) -> bool {
        let Some(handler) = self.active.table().get(&event.code) else {
            return false;
        };
        let mut requested = None;
        let mut ctx = HandlerContext {
            state: &self.state,
            target: &mut self.target,
            settings: &self.settings,
            requested_mode: &mut requested,
        };
        handler(&mut ctx, event.value);
        if let Some(mode) = requested {
            if let Err(e) = self.select_mode(mode) {
                log::warn!(target: "mode_controller", "{}", e);
            }
        }
        true
    }

    /// Once per control tick. In Follow, re-solve IK when the goal moved.
    pub fn tick(&mut self) -> FollowOutcome {
        if self.mode() != ControlMode::Follow {
            return FollowOutcome::Idle;
        }
        if self.follow_target {
            self.goal = Some(self.target.pose());
        }
        let Some(goal) = self.goal else {
            return FollowOutcome::Idle;
        };
        if self.solved_goal == Some(goal) {
            return FollowOutcome::Idle;
        }
        self.solved_goal = Some(goal);
        let seed = self.state.reference().joints;
        match self.kinematics.inverse(&goal, &seed) {
            Some(q) => {
                self.state.set_reference(q);
                FollowOutcome::Solved
            }
            None => {
                self.ik_misses += 1;
                debug!(target: "mode_controller", "No IK solution for {:?}", goal.translation.vector);
                FollowOutcome::NoSolution
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_state::{JointLimits, Pose};
    use crate::kinematics::{DhChain, DhLink};
    use std::f64::consts::FRAC_PI_2;

    fn chain() -> Arc<dyn Kinematics> {
        Arc::new(DhChain::new([
            DhLink::new(0.12, 0.0, FRAC_PI_2, 0.0),
            DhLink::new(0.0, 0.13, 0.0, FRAC_PI_2),
            DhLink::new(0.0, 0.13, 0.0, 0.0),
            DhLink::new(0.0, 0.0, FRAC_PI_2, FRAC_PI_2),
            DhLink::new(0.10, 0.0, 0.0, 0.0),
        ]))
    }

    struct Unreachable;

    impl Kinematics for Unreachable {
        fn forward(&self, _q: &[f64; NUM_JOINTS]) -> Isometry3<f64> {
            Isometry3::translation(0.1, 0.0, 0.2)
        }
        fn inverse(&self, _t: &Isometry3<f64>, _s: &[f64; NUM_JOINTS]) -> Option<[f64; NUM_JOINTS]> {
            None
        }
    }

    fn state() -> Arc<ArmState> {
        let init = Pose::from_degrees([0.0, 45.0, -90.0, 0.0, -45.0], 73.0);
        Arc::new(ArmState::new(init, JointLimits::symmetric_deg(135.0)))
    }

    fn controller(kin: Arc<dyn Kinematics>) -> ModeController {
        ModeController::new(state(), kin, ControllerSettings::default(), 0.48)
    }

    #[test]
    fn starts_in_manual_with_tracking_off() {
        let c = controller(chain());
        assert_eq!(c.mode(), ControlMode::Manual);
        assert_eq!(c.state().mode(), ControlMode::Manual);
        assert!(!c.state().enabled());
        assert!(!c.target().enabled());
        assert_eq!(c.slider_positions(), [0, 45, -90, 0, -45]);
    }

    #[test]
    fn nudge_outside_band_is_rejected() {
        let s = state();
        s.set_reference_joint(1, deg_to_rad(134.0));
        let settings = ControllerSettings {
            inc_analog: deg_to_rad(6.0),
            ..ControllerSettings::default()
        };
        let before = s.reference();
        assert_eq!(nudge(&s, &settings, 1, 1.0), NudgeOutcome::OutOfBand(140));
        assert_eq!(s.reference(), before);

        s.set_reference_joint(1, deg_to_rad(129.0));
        assert_eq!(nudge(&s, &settings, 1, 1.0), NudgeOutcome::OutOfBand(135));
        assert_eq!(s.reference(), before);

        s.set_reference_joint(1, deg_to_rad(128.0));
        assert_eq!(nudge(&s, &settings, 1, 1.0), NudgeOutcome::Committed(134));
        assert_eq!(nudge(&s, &settings, 1, 0.1), NudgeOutcome::BelowDeadzone);
        assert_eq!(nudge(&s, &settings, NUM_JOINTS, 1.0), NudgeOutcome::UnknownJoint);
    }

    #[test]
    fn band_edge_uses_half_up_truncation() {
        let s = state();
        let settings = ControllerSettings {
            inc_analog: deg_to_rad(6.0),
            ..ControllerSettings::default()
        };
        // -135.4 + 0.5 truncates to -134
        s.set_reference_joint(2, deg_to_rad(-129.4));
        assert_eq!(nudge(&s, &settings, 2, -1.0), NudgeOutcome::Committed(-134));

        // -136.4 + 0.5 truncates to -135, on the band
        s.set_reference_joint(3, deg_to_rad(-130.4));
        let before = s.reference();
        assert_eq!(nudge(&s, &settings, 3, -1.0), NudgeOutcome::OutOfBand(-135));
        assert_eq!(s.reference(), before);
    }

    #[test]
    fn manual_sticks_and_bumpers() {
        let mut c = controller(chain());
        let before = c.state().reference().joints;
        assert!(c.dispatch(GamepadEvent::new(EventCode::AbsY, 1.0)));
        assert!((c.state().reference().joints[1] - (before[1] + 0.01)).abs() < 1e-12);

        c.dispatch(GamepadEvent::new(EventCode::BtnTl, 1.0));
        assert!((c.state().reference().joints[0] - 0.05).abs() < 1e-12);
        c.dispatch(GamepadEvent::new(EventCode::BtnTl, 0.0));
        c.dispatch(GamepadEvent::new(EventCode::BtnTr, 1.0));
        assert!(c.state().reference().joints[0].abs() < 1e-12);

        c.dispatch(GamepadEvent::new(EventCode::AbsRx, 0.1));
        assert_eq!(c.state().reference().joints[4], before[4]);
    }

    #[test]
    fn handlers_do_not_leak_between_modes() {
        let mut c = controller(chain());
        let target_before = c.target().pose();
        assert!(!c.dispatch(GamepadEvent::new(EventCode::BtnWest, 1.0)));
        assert!(!c.dispatch(GamepadEvent::new(EventCode::BtnStart, 1.0)));
        assert_eq!(c.target().pose(), target_before);

        c.select_mode(ControlMode::Follow).unwrap();
        let reference = c.state().reference();
        assert!(!c.dispatch(GamepadEvent::new(EventCode::AbsRx, 1.0)));
        assert!(c.dispatch(GamepadEvent::new(EventCode::AbsY, 1.0)));
        assert_eq!(c.state().reference(), reference);
        assert!((c.target().position().x - target_before.translation.vector.x - 0.01).abs() < 1e-9);

        c.select_mode(ControlMode::Manual).unwrap();
        let target = c.target().pose();
        assert!(!c.dispatch(GamepadEvent::new(EventCode::BtnNorth, 1.0)));
        c.dispatch(GamepadEvent::new(EventCode::AbsY, 1.0));
        assert_eq!(c.target().pose(), target);
        assert_eq!(
            c.registered_codes(),
            vec![
                EventCode::AbsRx,
                EventCode::AbsRy,
                EventCode::AbsX,
                EventCode::AbsY,
                EventCode::BtnTl,
                EventCode::BtnTr
            ]
        );
    }

    #[test]
    fn optimize_is_a_configuration_error() {
        let mut c = controller(chain());
        let before = c.state().snapshot();
        assert!(matches!(
            c.select_mode(ControlMode::Optimize),
            Err(ControlError::UnimplementedMode(ControlMode::Optimize))
        ));
        assert_eq!(c.mode(), ControlMode::Manual);
        assert_eq!(c.state().snapshot(), before);
    }

    #[test]
    fn entering_manual_reseeds_from_measured() {
        let mut c = controller(chain());
        c.select_mode(ControlMode::Follow).unwrap();
        c.state().set_measured(Pose::from_degrees([10.2, 20.0, 30.0, 40.0, 50.0], 73.0));
        c.select_mode(ControlMode::Manual).unwrap();
        assert_eq!(c.slider_positions(), [10, 20, 30, 40, 50]);
        assert!(!c.state().enabled());
        assert_eq!(c.nudge(0, 1.0), NudgeOutcome::Committed(11));
        c.select_mode(ControlMode::Follow).unwrap();
        assert_eq!(c.nudge(0, 1.0), NudgeOutcome::Inactive);
    }

    #[test]
    fn follow_tracks_target_through_ik() {
        let mut c = controller(chain());
        c.select_mode(ControlMode::Follow).unwrap();
        assert!(c.state().enabled());
        assert!(c.target().enabled());
        assert_eq!(c.tick(), FollowOutcome::Solved);

        c.target_mut().translate(0.0, 0.02, -0.02);
        assert_eq!(c.tick(), FollowOutcome::Solved);
        let reached = c.kinematics().forward(&c.state().reference().joints).translation.vector;
        assert!((reached - c.target().position()).norm() < 1e-3);
        assert!(c.state().limits().contains(&c.state().reference().joints));
        assert_eq!(c.tick(), FollowOutcome::Idle);
    }

    #[test]
    fn set_goal_mode_waits_for_explicit_goal() {
        let mut c = controller(chain());
        c.select_mode(ControlMode::Follow).unwrap();
        c.tick();
        c.set_follow_target(false);
        let reference = c.state().reference();
        c.target_mut().translate(0.0, 0.02, 0.0);
        assert_eq!(c.tick(), FollowOutcome::Idle);
        assert_eq!(c.state().reference(), reference);
        c.set_goal();
        assert_eq!(c.tick(), FollowOutcome::Solved);
        assert_ne!(c.state().reference(), reference);
    }

    #[test]
    fn ik_failure_keeps_reference() {
        let mut c = controller(Arc::new(Unreachable));
        c.select_mode(ControlMode::Follow).unwrap();
        let reference = c.state().reference();
        assert_eq!(c.tick(), FollowOutcome::NoSolution);
        assert_eq!(c.state().reference(), reference);
        assert_eq!(c.ik_misses(), 1);
        // same goal is not retried
        assert_eq!(c.tick(), FollowOutcome::Idle);
    }

    #[test]
    fn start_button_returns_to_manual() {
        let mut c = controller(chain());
        c.select_mode(ControlMode::Follow).unwrap();
        c.dispatch(GamepadEvent::new(EventCode::BtnStart, 0.0));
        assert_eq!(c.mode(), ControlMode::Follow);
        c.dispatch(GamepadEvent::new(EventCode::BtnStart, 1.0));
        assert_eq!(c.mode(), ControlMode::Manual);
        assert!(!c.target().enabled());
    }

    #[test]
    fn follow_buttons_rotate_on_press_only() {
        let mut c = controller(chain());
        c.select_mode(ControlMode::Follow).unwrap();
        let start = c.target().pose().rotation;
        c.dispatch(GamepadEvent::new(EventCode::BtnWest, 0.0));
        assert_eq!(c.target().pose().rotation, start);
        c.dispatch(GamepadEvent::new(EventCode::BtnWest, 1.0));
        c.dispatch(GamepadEvent::new(EventCode::BtnSouth, 1.0));
        assert!(c.target().pose().rotation.angle_to(&start) < 1e-6);
        c.dispatch(GamepadEvent::new(EventCode::BtnTr, 1.0));
        assert!((c.target().pose().rotation.angle_to(&start) - deg_to_rad(5.0)).abs() < 1e-9);
    }
}
