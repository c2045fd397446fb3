use crate::arm_state::ControlMode;

/// Conditions that stop the driver. Everything recoverable (timeouts,
/// malformed telemetry, IK misses, out-of-band nudges) is handled where it
/// happens and never becomes one of these.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("No serial ports found")]
    NoSerialPorts,

    #[error("No serial port matching '{descriptor}' (found: {found})")]
    NoArduinoPort { descriptor: String, found: String },

    #[error("Control mode {0} is not implemented")]
    UnimplementedMode(ControlMode),
}
