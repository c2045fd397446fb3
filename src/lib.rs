/// Arm Driver Library
///
/// Shared arm state, serial protocol, control modes and simulation for the
/// 5-DoF arm and claw. The GUI and the probe binaries are thin layers on top.

pub mod arduino_connection;
pub mod arm_state;
pub mod backend;
pub mod command;
pub mod config_loader;
pub mod control_tick;
pub mod end_effector;
pub mod error;
pub mod gamepad;
pub mod gui;
pub mod kinematics;
pub mod mode_controller;
pub mod simulation;
pub mod telemetry;

pub use arm_state::{ArmSnapshot, ArmState, ControlMode, JointLimits, Pose, NUM_JOINTS};
pub use error::ControlError;
