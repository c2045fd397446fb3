//! Keyboard stand-in for a gamepad.
//!
//! W/S and A/D are the left stick, the arrow keys the right stick, Q/E the
//! bumpers, I/K/J/L the face buttons (north/south/west/east) and Enter is
//! start. Z/X walk the base axis and C/V the claw trigger; those two hold
//! their value when the key is released, like a lever.

use eframe::egui;

use crate::gamepad::{EventCode, GamepadEvent, GamepadSender};

/// Per-frame rate of the base and claw levers.
const LEVER_RATE: f32 = 0.02;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeldKeys {
    pub w: bool,
    pub s: bool,
    pub a: bool,
    pub d: bool,
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub q: bool,
    pub e: bool,
    pub i: bool,
    pub k: bool,
    pub j: bool,
    pub l: bool,
    pub enter: bool,
    pub z: bool,
    pub x: bool,
    pub c: bool,
    pub v: bool,
}

impl HeldKeys {
    pub fn from_input(input: &egui::InputState) -> Self {
        use egui::Key;
        Self {
            w: input.key_down(Key::W),
            s: input.key_down(Key::S),
            a: input.key_down(Key::A),
            d: input.key_down(Key::D),
            up: input.key_down(Key::ArrowUp),
            down: input.key_down(Key::ArrowDown),
            left: input.key_down(Key::ArrowLeft),
            right: input.key_down(Key::ArrowRight),
            q: input.key_down(Key::Q),
            e: input.key_down(Key::E),
            i: input.key_down(Key::I),
            k: input.key_down(Key::K),
            j: input.key_down(Key::J),
            l: input.key_down(Key::L),
            enter: input.key_down(Key::Enter),
            z: input.key_down(Key::Z),
            x: input.key_down(Key::X),
            c: input.key_down(Key::C),
            v: input.key_down(Key::V),
        }
    }
}

fn axis(pos: bool, neg: bool) -> f32 {
    match (pos, neg) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        _ => 0.0,
    }
}

fn button(held: bool) -> f32 {
    if held {
        1.0
    } else {
        0.0
    }
}

pub struct KeyboardGamepad {
    tx: GamepadSender,
    last: HeldKeys,
    base: f32,
    claw: f32,
}

impl KeyboardGamepad {
    pub fn new(tx: GamepadSender) -> Self {
        Self {
            tx,
            last: HeldKeys::default(),
            base: 0.0,
            claw: 0.0,
        }
    }

    pub fn base(&self) -> f32 {
        self.base
    }

    pub fn claw(&self) -> f32 {
        self.claw
    }

    /// Sticks repeat every frame while deflected and send one zero on
    /// release; buttons and levers send only on change. Returns the number of
    /// events sent.
    pub fn update(&mut self, keys: HeldKeys) -> usize {
        let mut events = Vec::new();

        for (code, now, before) in [
            (EventCode::AbsY, axis(keys.w, keys.s), axis(self.last.w, self.last.s)),
            (EventCode::AbsX, axis(keys.d, keys.a), axis(self.last.d, self.last.a)),
            (EventCode::AbsRy, axis(keys.up, keys.down), axis(self.last.up, self.last.down)),
            (EventCode::AbsRx, axis(keys.right, keys.left), axis(self.last.right, self.last.left)),
        ] {
            if now != 0.0 || before != 0.0 {
                events.push(GamepadEvent::new(code, now));
            }
        }

        for (code, now, before) in [
            (EventCode::BtnTl, keys.q, self.last.q),
            (EventCode::BtnTr, keys.e, self.last.e),
            (EventCode::BtnNorth, keys.i, self.last.i),
            (EventCode::BtnSouth, keys.k, self.last.k),
            (EventCode::BtnWest, keys.j, self.last.j),
            (EventCode::BtnEast, keys.l, self.last.l),
            (EventCode::BtnStart, keys.enter, self.last.enter),
        ] {
            if now != before {
                events.push(GamepadEvent::new(code, button(now)));
            }
        }

        let base = (self.base + LEVER_RATE * axis(keys.x, keys.z)).clamp(-1.0, 1.0);
        if base != self.base {
            self.base = base;
            events.push(GamepadEvent::new(EventCode::AbsZ, base));
        }
        let claw = (self.claw + LEVER_RATE * axis(keys.v, keys.c)).clamp(0.0, 1.0);
        if claw != self.claw {
            self.claw = claw;
            events.push(GamepadEvent::new(EventCode::AbsRz, claw));
        }

        self.last = keys;
        let sent = events.len();
        for event in events {
            self.tx.send(event);
        }
        sent
    }
}
