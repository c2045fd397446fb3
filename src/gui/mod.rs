pub mod arm_gui;
pub mod keyboard;

pub use arm_gui::ArmGui;
pub use keyboard::{HeldKeys, KeyboardGamepad};
