//! Gamepad input source
//!
//! The raw device driver lives outside this crate. Anything that can produce
//! named axis/button events (a real controller, the GUI keyboard mapping, a
//! test script) feeds them through a `GamepadSender`; the control tick drains
//! them with a `GamepadSource` and records axis values in `LiveAxes` so the
//! command transmitter can sample them at its own rate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};

/// Event identifiers, named after the Linux evdev codes an Xbox pad emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCode {
    AbsX,
    AbsY,
    AbsRx,
    AbsRy,
    AbsZ,
    AbsRz,
    BtnTl,
    BtnTr,
    BtnNorth,
    BtnSouth,
    BtnWest,
    BtnEast,
    BtnStart,
}

impl EventCode {
    pub const ALL: [EventCode; 13] = [
        EventCode::AbsX,
        EventCode::AbsY,
        EventCode::AbsRx,
        EventCode::AbsRy,
        EventCode::AbsZ,
        EventCode::AbsRz,
        EventCode::BtnTl,
        EventCode::BtnTr,
        EventCode::BtnNorth,
        EventCode::BtnSouth,
        EventCode::BtnWest,
        EventCode::BtnEast,
        EventCode::BtnStart,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventCode::AbsX => "ABS_X",
            EventCode::AbsY => "ABS_Y",
            EventCode::AbsRx => "ABS_RX",
            EventCode::AbsRy => "ABS_RY",
            EventCode::AbsZ => "ABS_Z",
            EventCode::AbsRz => "ABS_RZ",
            EventCode::BtnTl => "BTN_TL",
            EventCode::BtnTr => "BTN_TR",
            EventCode::BtnNorth => "BTN_NORTH",
            EventCode::BtnSouth => "BTN_SOUTH",
            EventCode::BtnWest => "BTN_WEST",
            EventCode::BtnEast => "BTN_EAST",
            EventCode::BtnStart => "BTN_START",
        }
    }

    pub fn is_button(&self) -> bool {
        self.name().starts_with("BTN_")
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        EventCode::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| anyhow!("Unknown gamepad event code '{}'", s))
    }
}

/// One input event. Axes carry `[-1, 1]` (triggers `[0, 1]`), buttons `0`/`1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GamepadEvent {
    pub code: EventCode,
    pub value: f32,
}

impl GamepadEvent {
    pub fn new(code: EventCode, value: f32) -> Self {
        Self { code, value }
    }

    pub fn pressed(&self) -> bool {
        self.value >= 0.5
    }
}

pub trait GamepadSource: Send {
    /// Every event that arrived since the previous call, oldest first.
    fn poll(&mut self) -> Vec<GamepadEvent>;
}

#[derive(Debug, Clone)]
pub struct GamepadSender {
    tx: Sender<GamepadEvent>,
}

impl GamepadSender {
    /// Returns false once the receiving side is gone.
    pub fn send(&self, event: GamepadEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[derive(Debug)]
pub struct ChannelGamepad {
    rx: Receiver<GamepadEvent>,
}

impl GamepadSource for ChannelGamepad {
    fn poll(&mut self) -> Vec<GamepadEvent> {
        self.rx.try_iter().collect()
    }
}

pub fn channel() -> (GamepadSender, ChannelGamepad) {
    let (tx, rx) = unbounded();
    (GamepadSender { tx }, ChannelGamepad { rx })
}

/// Latest value seen on every axis and button.
#[derive(Debug, Default)]
pub struct LiveAxes {
    values: Mutex<HashMap<EventCode, f32>>,
}

impl LiveAxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, code: EventCode, value: f32) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code, value);
    }

    /// Zero until the first event for `code` arrives.
    pub fn get(&self, code: EventCode) -> f32 {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&code)
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for code in EventCode::ALL {
            assert_eq!(code.name().parse::<EventCode>().unwrap(), code);
        }
        assert!("ABS_HAT0X".parse::<EventCode>().is_err());
        assert!(EventCode::BtnStart.is_button());
        assert!(!EventCode::AbsRz.is_button());
    }

    #[test]
    fn channel_delivers_in_order() {
        let (tx, mut rx) = channel();
        assert!(tx.send(GamepadEvent::new(EventCode::AbsX, 0.5)));
        assert!(tx.send(GamepadEvent::new(EventCode::BtnTl, 1.0)));
        let events = rx.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, EventCode::AbsX);
        assert!(events[1].pressed());
        assert!(rx.poll().is_empty());
        drop(rx);
        assert!(!tx.send(GamepadEvent::new(EventCode::AbsX, 0.0)));
    }

    #[test]
    fn live_axes_default_to_zero() {
        let axes = LiveAxes::new();
        assert_eq!(axes.get(EventCode::AbsZ), 0.0);
        axes.set(EventCode::AbsZ, -0.25);
        assert_eq!(axes.get(EventCode::AbsZ), -0.25);
    }
}
