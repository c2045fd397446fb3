//! Command transmitter
//!
//! Encodes the outbound servo frame `<v1, v2, v3, v4, v5, v6>` (whole
//! degrees) and writes it to the link only when one of the six values changed
//! since the last frame that went out. Joints 2-5 pass a pose through (the
//! measured pose, or on real servos a commanded pose that closes on the
//! reference); joint 1 and the claw are driven straight from live controller
//! axes.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::arm_state::{ArmState, Pose, NUM_JOINTS};
use crate::gamepad::{EventCode, LiveAxes};

pub const NUM_SERVOS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoFrame(pub [i32; NUM_SERVOS]);

impl ServoFrame {
    /// Wire form including the line terminator.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for ServoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.0;
        write!(f, "<{}, {}, {}, {}, {}, {}>", v[0], v[1], v[2], v[3], v[4], v[5])
    }
}

/// Linear interpolation clamped to the ends of the input range, like
/// `numpy.interp`.
pub fn interp(x: f64, from: [f64; 2], to: [f64; 2]) -> f64 {
    let [x0, x1] = from;
    let [y0, y1] = to;
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    let t = ((x - x0) / (x1 - x0)).clamp(0.0, 1.0);
    y0 + t * (y1 - y0)
}

/// One controller axis mapped directly onto a servo angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisOverride {
    pub axis: EventCode,
    pub input_range: [f64; 2],
    pub output_deg: [f64; 2],
}

impl AxisOverride {
    pub fn degrees(&self, inputs: &LiveAxes) -> i32 {
        interp(inputs.get(self.axis) as f64, self.input_range, self.output_deg) as i32
    }
}

/// The two servos that bypass the kinematic pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverrideChannels {
    pub base: AxisOverride,
    pub claw: AxisOverride,
}

impl Default for OverrideChannels {
    fn default() -> Self {
        Self {
            base: AxisOverride {
                axis: EventCode::AbsZ,
                input_range: [-1.0, 1.0],
                output_deg: [0.0, 180.0],
            },
            claw: AxisOverride {
                axis: EventCode::AbsRz,
                input_range: [0.0, 1.0],
                output_deg: [10.0, 73.0],
            },
        }
    }
}

pub fn build_frame(pose: &Pose, inputs: &LiveAxes, overrides: &OverrideChannels) -> ServoFrame {
    let q = pose.joints_deg_rounded();
    ServoFrame([
        overrides.base.degrees(inputs),
        q[1],
        q[2],
        q[3],
        q[4],
        overrides.claw.degrees(inputs),
    ])
}

/// Suppresses frames identical to the last one transmitted.
#[derive(Debug, Default)]
pub struct FrameDebouncer {
    last_sent: Option<ServoFrame>,
}

impl FrameDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(frame)` if it differs from the last transmitted frame.
    pub fn filter(&self, frame: ServoFrame) -> Option<ServoFrame> {
        if self.last_sent == Some(frame) {
            None
        } else {
            Some(frame)
        }
    }

    pub fn mark_sent(&mut self, frame: ServoFrame) {
        self.last_sent = Some(frame);
    }

    pub fn last_sent(&self) -> Option<ServoFrame> {
        self.last_sent
    }
}

/// Joint setpoint streamed to real servos. While tracking it closes on the
/// reference at `(reference - commanded) / dt`, one Euler step per tick;
/// while idle it sits on the reference.
#[derive(Debug, Clone, Copy)]
pub struct CommandedPose {
    joints: Option<[f64; NUM_JOINTS]>,
    dt: f64,
}

impl CommandedPose {
    pub fn new(dt: f64) -> Self {
        Self { joints: None, dt }
    }

    pub fn joints(&self) -> Option<[f64; NUM_JOINTS]> {
        self.joints
    }

    /// Advance by `step` seconds and return the new setpoint.
    pub fn advance(&mut self, reference: &[f64; NUM_JOINTS], tracking: bool, step: f64) -> [f64; NUM_JOINTS] {
        let next = match self.joints {
            Some(mut q) if tracking && self.dt > 0.0 => {
                let gain = (step / self.dt).min(1.0);
                for i in 0..NUM_JOINTS {
                    q[i] += gain * (reference[i] - q[i]);
                }
                q
            }
            _ => *reference,
        };
        self.joints = Some(next);
        next
    }
}

pub struct CommandTransmitter<W> {
    link: W,
    state: Arc<ArmState>,
    inputs: Arc<LiveAxes>,
    overrides: OverrideChannels,
    debouncer: FrameDebouncer,
    poll: Duration,
    error_backoff: Duration,
    commanded: Option<CommandedPose>,
    frames_sent: u64,
}

impl<W: Write> CommandTransmitter<W> {
    pub fn new(link: W, state: Arc<ArmState>, inputs: Arc<LiveAxes>, overrides: OverrideChannels) -> Self {
        Self {
            link,
            state,
            inputs,
            overrides,
            debouncer: FrameDebouncer::new(),
            poll: Duration::from_millis(10),
            error_backoff: Duration::from_millis(500),
            commanded: None,
            frames_sent: 0,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Real servos: send a commanded pose stepped toward the reference
    /// every tick instead of the measured pose. With tracking disabled the
    /// arm is assumed to sit at its commanded pose, so measured is also
    /// copied from reference before every frame.
    pub fn drive_toward_reference(mut self, dt: f64) -> Self {
        self.commanded = Some(CommandedPose::new(dt));
        self
    }

    pub fn commanded(&self) -> Option<&CommandedPose> {
        self.commanded.as_ref()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn link(&self) -> &W {
        &self.link
    }

    /// Build the current frame and write it if anything changed.
    /// The state locks are released before the link is touched.
    pub fn tick(&mut self) -> io::Result<Option<ServoFrame>> {
        let pose = match self.commanded.as_mut() {
            Some(commanded) => {
                let tracking = self.state.enabled();
                if !tracking {
                    self.state.update_measured(|measured, reference, _| measured.joints = reference.joints);
                }
                let reference = self.state.reference();
                let joints = commanded.advance(&reference.joints, tracking, self.poll.as_secs_f64());
                Pose::new(joints, reference.claw_deg)
            }
            None => self.state.measured(),
        };
        let frame = build_frame(&pose, &self.inputs, &self.overrides);
        let Some(frame) = self.debouncer.filter(frame) else {
            return Ok(None);
        };
        self.link.write_all(frame.to_line().as_bytes())?;
        self.link.flush()?;
        self.debouncer.mark_sent(frame);
        self.frames_sent += 1;
        debug!(target: "command", "SEND: {}", frame);
        Ok(Some(frame))
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.tick() {
                Ok(_) => thread::sleep(self.poll),
                Err(e) => {
                    warn!(target: "command", "Write failed, retrying after {:?}: {}", self.error_backoff, e);
                    thread::sleep(self.error_backoff);
                }
            }
        }
    }
}

impl<W: Write + Send + 'static> CommandTransmitter<W> {
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("command".into())
            .spawn(move || self.run(&stop))
    }
}
