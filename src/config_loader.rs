//! Configuration
//!
//! Single source of truth: `arm_driver.yaml` next to `Cargo.toml`. The
//! `default` block is required; a block under `hosts.<hostname>` replaces
//! whole sections for that machine. `ARM_PORT` and `ARM_SIMULATE` from the
//! environment (or `.env`) override the file.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::arm_state::{deg_to_rad, JointLimits, Pose, NUM_JOINTS};
use crate::command::{AxisOverride, OverrideChannels};
use crate::kinematics::{DhChain, DhLink};

pub const CONFIG_FILE: &str = "arm_driver.yaml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct LinkSettings {
    /// Substring of the USB product/description used to find the board.
    pub descriptor: String,
    /// Explicit device path; skips discovery when set.
    pub port: Option<String>,
    pub baud: u32,
    pub read_timeout_ms: u64,
    pub reset_delay_ms: u64,
    pub poll_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            descriptor: "Arduino Uno".to_string(),
            port: None,
            baud: 9600,
            read_timeout_ms: 500,
            reset_delay_ms: 2000,
            poll_ms: 10,
        }
    }
}

impl LinkSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DhLinkSettings {
    pub d: f64,
    pub a: f64,
    pub alpha_deg: f64,
    #[serde(default)]
    pub offset_deg: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ArmSettings {
    pub init_pose_deg: [f64; NUM_JOINTS],
    pub init_claw_deg: f64,
    pub limits_deg: [[f64; 2]; NUM_JOINTS],
    pub dh: Vec<DhLinkSettings>,
    /// Defaults to the chain's total link length.
    pub reach_m: Option<f64>,
}

impl Default for ArmSettings {
    fn default() -> Self {
        Self {
            init_pose_deg: [0.0, 45.0, -90.0, 0.0, -45.0],
            init_claw_deg: 73.0,
            limits_deg: [[-135.0, 135.0]; NUM_JOINTS],
            dh: vec![
                DhLinkSettings { d: 0.12, a: 0.0, alpha_deg: 90.0, offset_deg: 0.0 },
                DhLinkSettings { d: 0.0, a: 0.13, alpha_deg: 0.0, offset_deg: 90.0 },
                DhLinkSettings { d: 0.0, a: 0.13, alpha_deg: 0.0, offset_deg: 0.0 },
                DhLinkSettings { d: 0.0, a: 0.0, alpha_deg: 90.0, offset_deg: 90.0 },
                DhLinkSettings { d: 0.10, a: 0.0, alpha_deg: 0.0, offset_deg: 0.0 },
            ],
            reach_m: None,
        }
    }
}

impl ArmSettings {
    pub fn init_pose(&self) -> Pose {
        Pose::from_degrees(self.init_pose_deg, self.init_claw_deg)
    }

    pub fn limits(&self) -> JointLimits {
        JointLimits::from_degrees(self.limits_deg)
    }

    pub fn kinematics(&self) -> Result<DhChain> {
        let links: Vec<DhLink> = self
            .dh
            .iter()
            .map(|l| DhLink::new(l.d, l.a, deg_to_rad(l.alpha_deg), deg_to_rad(l.offset_deg)))
            .collect();
        let links: [DhLink; NUM_JOINTS] = links
            .try_into()
            .map_err(|v: Vec<DhLink>| anyhow!("ARM.DH needs {} links, got {}", NUM_JOINTS, v.len()))?;
        Ok(DhChain::new(links))
    }

    pub fn reach(&self, chain: &DhChain) -> f64 {
        self.reach_m.unwrap_or_else(|| chain.reach())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ControlSettings {
    /// Controller step: how often a new joint velocity is computed (s).
    pub dt: f64,
    /// Render, control tick and integrator step (s). Defaults to `dt / 4`.
    pub update_dt: Option<f64>,
    /// Button translation increment (m).
    pub inc: f64,
    /// Button rotation increment (deg).
    pub inc_a_deg: f64,
    /// Joystick scale, radians (Manual) or metres (Follow) per unit deflection.
    pub inc_analog: f64,
    pub deadzone: f64,
    pub safety_band_deg: f64,
    pub bumper_gain: f64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            dt: 0.1,
            update_dt: None,
            inc: 0.02,
            inc_a_deg: 5.0,
            inc_analog: 0.01,
            deadzone: 0.15,
            safety_band_deg: 135.0,
            bumper_gain: 5.0,
        }
    }
}

impl ControlSettings {
    pub fn update_dt(&self) -> f64 {
        self.update_dt.unwrap_or(self.dt / 4.0)
    }

    pub fn inc_a(&self) -> f64 {
        deg_to_rad(self.inc_a_deg)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct GamepadSettings {
    pub enabled: bool,
    pub base_axis: String,
    pub base_range_deg: [f64; 2],
    pub claw_trigger: String,
    pub claw_range_deg: [f64; 2],
}

impl Default for GamepadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_axis: "ABS_Z".to_string(),
            base_range_deg: [0.0, 180.0],
            claw_trigger: "ABS_RZ".to_string(),
            claw_range_deg: [10.0, 73.0],
        }
    }
}

impl GamepadSettings {
    pub fn overrides(&self) -> Result<OverrideChannels> {
        Ok(OverrideChannels {
            base: AxisOverride {
                axis: self.base_axis.parse()?,
                input_range: [-1.0, 1.0],
                output_deg: self.base_range_deg,
            },
            claw: AxisOverride {
                axis: self.claw_trigger.parse()?,
                input_range: [0.0, 1.0],
                output_deg: self.claw_range_deg,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriverSettings {
    pub simulate: bool,
    pub link: LinkSettings,
    pub arm: ArmSettings,
    pub control: ControlSettings,
    pub gamepad: GamepadSettings,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct SettingsBlock {
    simulate: Option<bool>,
    link: Option<LinkSettings>,
    arm: Option<ArmSettings>,
    control: Option<ControlSettings>,
    gamepad: Option<GamepadSettings>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    default: SettingsBlock,
    #[serde(default)]
    hosts: BTreeMap<String, SettingsBlock>,
}

impl DriverSettings {
    pub fn validate(&self) -> Result<()> {
        if self.arm.dh.len() != NUM_JOINTS {
            bail!("ARM.DH needs {} links, got {}", NUM_JOINTS, self.arm.dh.len());
        }
        for (i, [lo, hi]) in self.arm.limits_deg.iter().enumerate() {
            if lo > hi {
                bail!("ARM.LIMITS_DEG[{}] has min {} above max {}", i, lo, hi);
            }
        }
        if self.control.dt <= 0.0 || self.control.update_dt() <= 0.0 {
            bail!("CONTROL.DT and CONTROL.UPDATE_DT must be positive");
        }
        if !(0.0..1.0).contains(&self.control.deadzone) {
            bail!("CONTROL.DEADZONE must be in [0, 1), got {}", self.control.deadzone);
        }
        if self.link.baud == 0 {
            bail!("LINK.BAUD must be non-zero");
        }
        self.gamepad.overrides()?;
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE)
}

/// Parse settings for `hostname` from YAML text. No environment overrides.
pub fn parse_settings(yaml: &str, hostname: &str) -> Result<DriverSettings> {
    let file: ConfigFile = serde_yaml::from_str(yaml).context("Invalid arm driver configuration")?;
    let host = file.hosts.get(hostname).cloned().unwrap_or_default();
    if file.hosts.contains_key(hostname) {
        log::info!(target: "config_loader", "Using host overrides for '{}'", hostname);
    }
    let base = file.default;
    let settings = DriverSettings {
        simulate: host.simulate.or(base.simulate).unwrap_or(true),
        link: host.link.or(base.link).unwrap_or_default(),
        arm: host.arm.or(base.arm).unwrap_or_default(),
        control: host.control.or(base.control).unwrap_or_default(),
        gamepad: host.gamepad.or(base.gamepad).unwrap_or_default(),
    };
    settings.validate()?;
    Ok(settings)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply `ARM_PORT` / `ARM_SIMULATE` from `lookup`.
pub fn apply_env_overrides<F>(settings: &mut DriverSettings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("ARM_PORT").filter(|p| !p.trim().is_empty()) {
        log::info!(target: "config_loader", "ARM_PORT override: {}", port);
        settings.link.port = Some(port);
    }
    if let Some(raw) = lookup("ARM_SIMULATE") {
        settings.simulate = parse_flag(&raw).ok_or_else(|| anyhow!("ARM_SIMULATE must be a boolean, got '{}'", raw))?;
    }
    Ok(())
}

/// Load settings from `path` for `hostname`, then apply environment overrides.
pub fn load_settings(path: &Path, hostname: &str) -> Result<DriverSettings> {
    let _ = dotenv();
    let file = File::open(path).map_err(|e| anyhow!("Missing required {} at {:?}: {}", CONFIG_FILE, path, e))?;
    let yaml = std::io::read_to_string(file).with_context(|| format!("Failed to read {:?}", path))?;
    let mut settings = parse_settings(&yaml, hostname)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    log::info!(
        target: "config_loader",
        "Settings: simulate={}, port={:?}, descriptor='{}', baud={}, dt={}, update_dt={} (hostname={})",
        settings.simulate,
        settings.link.port,
        settings.link.descriptor,
        settings.link.baud,
        settings.control.dt,
        settings.control.update_dt(),
        hostname
    );
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamepad::EventCode;

    const YAML: &str = r#"
default:
  SIMULATE: true
  LINK:
    DESCRIPTOR: Arduino Uno
    BAUD: 9600
  CONTROL:
    DT: 0.2
hosts:
  eit-lab:
    SIMULATE: false
    LINK:
      PORT: /dev/ttyACM0
"#;

    #[test]
    fn default_block_applies_to_unknown_host() {
        let s = parse_settings(YAML, "laptop").unwrap();
        assert!(s.simulate);
        assert_eq!(s.link.port, None);
        assert_eq!(s.link.read_timeout_ms, 500);
        assert_eq!(s.control.dt, 0.2);
        assert!((s.control.update_dt() - 0.05).abs() < 1e-12);
        assert_eq!(s.arm, ArmSettings::default());
    }

    #[test]
    fn host_block_replaces_sections() {
        let s = parse_settings(YAML, "eit-lab").unwrap();
        assert!(!s.simulate);
        assert_eq!(s.link.port.as_deref(), Some("/dev/ttyACM0"));
        // whole section replaced, unset keys fall back to built-in defaults
        assert_eq!(s.link.descriptor, "Arduino Uno");
        assert_eq!(s.control.dt, 0.2);
    }

    #[test]
    fn env_overrides_win() {
        let mut s = parse_settings(YAML, "laptop").unwrap();
        apply_env_overrides(&mut s, |k| match k {
            "ARM_PORT" => Some("/dev/ttyUSB3".into()),
            "ARM_SIMULATE" => Some("no".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(s.link.port.as_deref(), Some("/dev/ttyUSB3"));
        assert!(!s.simulate);

        let err = apply_env_overrides(&mut s, |k| (k == "ARM_SIMULATE").then(|| "maybe".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_settings("default:\n  CONTROL:\n    DT: 0\n", "x").is_err());
        assert!(parse_settings("default:\n  GAMEPAD:\n    BASE_AXIS: ABS_HAT0X\n", "x").is_err());
        assert!(parse_settings("default:\n  ARM:\n    DH: []\n", "x").is_err());
        assert!(parse_settings("hosts: {}\n", "x").is_err());
    }

    #[test]
    fn arm_conversions() {
        let arm = ArmSettings::default();
        let chain = arm.kinematics().unwrap();
        assert!((arm.reach(&chain) - 0.48).abs() < 1e-12);
        assert!((arm.limits().max[0] - deg_to_rad(135.0)).abs() < 1e-12);
        assert!((arm.init_pose().joints[2] + deg_to_rad(90.0)).abs() < 1e-12);
        let ov = GamepadSettings::default().overrides().unwrap();
        assert_eq!(ov.base.axis, EventCode::AbsZ);
        assert_eq!(ov.claw.output_deg, [10.0, 73.0]);
    }

    #[test]
    fn shipped_config_parses() {
        let yaml = std::fs::read_to_string(config_path()).unwrap();
        parse_settings(&yaml, "any-host").unwrap();
    }
}
