//! Control tick
//!
//! Runs once per `update_dt`: drains the gamepad, records live axis values
//! for the transmitter, lets the active mode handle each event, advances
//! Follow and hands back a copy of everything the renderer draws.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use nalgebra::{Isometry3, Point3};

use crate::arm_state::ArmSnapshot;
use crate::gamepad::{GamepadSource, LiveAxes};
use crate::mode_controller::{FollowOutcome, ModeController};
use crate::simulation::run_every;

#[derive(Debug, Clone)]
pub struct RenderSnapshot {
    pub arm: ArmSnapshot,
    pub target: Isometry3<f64>,
    pub target_enabled: bool,
    pub goal: Option<Isometry3<f64>>,
    /// Joint origins of the measured pose, base first, tool last.
    pub measured_chain: Vec<Point3<f64>>,
    pub reference_chain: Vec<Point3<f64>>,
    pub follow: FollowOutcome,
    pub events: usize,
}

pub struct ControlTick {
    controller: ModeController,
    source: Box<dyn GamepadSource>,
    inputs: Arc<LiveAxes>,
    ticks: u64,
}

impl ControlTick {
    pub fn new(controller: ModeController, source: Box<dyn GamepadSource>, inputs: Arc<LiveAxes>) -> Self {
        Self {
            controller,
            source,
            inputs,
            ticks: 0,
        }
    }

    pub fn controller(&self) -> &ModeController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ModeController {
        &mut self.controller
    }

    pub fn inputs(&self) -> &Arc<LiveAxes> {
        &self.inputs
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self) -> RenderSnapshot {
        let events = self.source.poll();
        for event in &events {
            self.inputs.set(event.code, event.value);
            self.controller.dispatch(*event);
        }
        let follow = self.controller.tick();
        self.ticks += 1;
        self.snapshot(follow, events.len())
    }

    fn snapshot(&self, follow: FollowOutcome, events: usize) -> RenderSnapshot {
        let arm = self.controller.state().snapshot();
        let kinematics = self.controller.kinematics();
        let target = self.controller.target();
        RenderSnapshot {
            arm,
            target: target.pose(),
            target_enabled: target.enabled(),
            goal: self.controller.goal(),
            measured_chain: kinematics.joint_positions(&arm.measured.joints),
            reference_chain: kinematics.joint_positions(&arm.reference.joints),
            follow,
            events,
        }
    }

    /// Tick every `period` without a window until `stop` is raised.
    pub fn run(&mut self, period: Duration, stop: &AtomicBool) {
        run_every(period, stop, || {
            let snap = self.tick();
            if snap.events > 0 || snap.follow != FollowOutcome::Idle {
                debug!(
                    target: "control_tick",
                    "{} ref={:?} meas={:?} follow={:?}",
                    snap.arm.mode,
                    snap.arm.reference.joints_deg_rounded(),
                    snap.arm.measured.joints_deg_rounded(),
                    snap.follow
                );
            }
        });
    }
}
