//! Arm driver window
//!
//! Left panel: mode tabs, joint sliders (Manual) or end-effector buttons
//! (Follow), keyboard gamepad, status and message log.
//! Center panel: top and side views of the measured and reference arm.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eframe::egui;
use egui::Color32;
use egui_plot::{Legend, Line, LineStyle, Plot, PlotPoints, Points};
use nalgebra::Point3;

use crate::arm_state::{ControlMode, NUM_JOINTS};
use crate::control_tick::{ControlTick, RenderSnapshot};
use crate::gui::keyboard::{HeldKeys, KeyboardGamepad};
use crate::mode_controller::FollowOutcome;

const MAX_LOG_LINES: usize = 200;

pub struct ArmGui {
    tick: ControlTick,
    keyboard: KeyboardGamepad,
    keyboard_enabled: bool,
    sliders: [i32; NUM_JOINTS],
    update_dt: Duration,
    backend_name: String,
    link_ready: Arc<AtomicBool>,
    link_reported: bool,
    stop: Arc<AtomicBool>,
    last: Option<RenderSnapshot>,
    ik_misses: u64,
    message_log: VecDeque<String>,
}

impl ArmGui {
    pub fn new(
        tick: ControlTick,
        keyboard: KeyboardGamepad,
        keyboard_enabled: bool,
        update_dt: Duration,
        backend_name: String,
        link_ready: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let sliders = tick.controller().slider_positions();
        let mut gui = Self {
            tick,
            keyboard,
            keyboard_enabled,
            sliders,
            update_dt,
            backend_name,
            link_ready,
            link_reported: false,
            stop,
            last: None,
            ik_misses: 0,
            message_log: VecDeque::new(),
        };
        gui.log(&format!("Backend: {}", gui.backend_name));
        gui
    }

    fn log(&mut self, message: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        self.message_log.push_back(format!("[{}] {}", stamp, message));
        while self.message_log.len() > MAX_LOG_LINES {
            self.message_log.pop_front();
        }
    }

    fn select_mode(&mut self, mode: ControlMode) {
        if mode == self.tick.controller().mode() {
            return;
        }
        match self.tick.controller_mut().select_mode(mode) {
            Ok(()) => {
                self.sliders = self.tick.controller().slider_positions();
                self.log(&format!("Mode: {}", mode));
            }
            Err(e) => {
                log::error!(target: "gui", "{}", e);
                self.log(&format!("ERROR: {}", e));
            }
        }
    }

    fn step(&mut self, ctx: &egui::Context) {
        if self.keyboard_enabled && !ctx.wants_keyboard_input() {
            let keys = ctx.input(HeldKeys::from_input);
            self.keyboard.update(keys);
        }
        let mode_before = self.tick.controller().mode();
        let snap = self.tick.tick();
        if snap.arm.mode != mode_before {
            self.sliders = self.tick.controller().slider_positions();
            self.log(&format!("Mode: {} (gamepad)", snap.arm.mode));
        }
        if snap.arm.mode == ControlMode::Manual {
            // sticks and bumpers move the reference behind the sliders' back
            self.sliders = self.tick.controller().slider_positions();
        }
        if snap.follow == FollowOutcome::NoSolution {
            let misses = self.tick.controller().ik_misses();
            if misses != self.ik_misses {
                self.ik_misses = misses;
                self.log("No IK solution, keeping previous reference");
            }
        }
        if !self.link_reported && self.link_ready.load(Ordering::Relaxed) {
            self.link_reported = true;
            self.log("Link established");
        }
        self.last = Some(snap);
    }

    fn mode_tabs(&mut self, ui: &mut egui::Ui) {
        let current = self.tick.controller().mode();
        ui.horizontal(|ui| {
            for mode in ControlMode::ALL {
                if ui.selectable_label(current == mode, mode.label()).clicked() {
                    self.select_mode(mode);
                }
            }
        });
    }

    fn manual_panel(&mut self, ui: &mut egui::Ui) {
        let band = self.tick.controller().settings().safety_band_deg as i32;
        let mut changed = false;
        for (i, value) in self.sliders.iter_mut().enumerate() {
            changed |= ui
                .add(egui::Slider::new(value, -band..=band).text(format!("q{}", i + 1)).suffix("°"))
                .changed();
        }
        if changed {
            let sliders = self.sliders;
            self.tick.controller_mut().set_sliders_deg(sliders);
        }
    }

    fn follow_panel(&mut self, ui: &mut egui::Ui) {
        let settings = *self.tick.controller().settings();
        let (inc, inc_a) = (settings.inc, settings.inc_a);
        egui::Grid::new("ee_buttons").show(ui, |ui| {
            for (label, axis) in [("x", 0), ("y", 1), ("z", 2)] {
                let mut d = [0.0; 3];
                d[axis] = inc;
                ui.label(label);
                if ui.button("+").clicked() {
                    self.tick.controller_mut().target_mut().translate(d[0], d[1], d[2]);
                }
                if ui.button("-").clicked() {
                    self.tick.controller_mut().target_mut().translate(-d[0], -d[1], -d[2]);
                }
                let mut r = [0.0; 3];
                r[axis] = inc_a;
                if ui.button("⟲").clicked() {
                    self.tick.controller_mut().target_mut().rotate(r[0], r[1], r[2]);
                }
                if ui.button("⟳").clicked() {
                    self.tick.controller_mut().target_mut().rotate(-r[0], -r[1], -r[2]);
                }
                ui.end_row();
            }
        });
        let mut follow = self.tick.controller().follow_target();
        ui.horizontal(|ui| {
            if ui.checkbox(&mut follow, "Follow").changed() {
                self.tick.controller_mut().set_follow_target(follow);
            }
            if ui.add_enabled(!follow, egui::Button::new("Set goal")).clicked() {
                self.tick.controller_mut().set_goal();
            }
        });
        let p = self.tick.controller().target().position();
        ui.label(format!("Target: x={:.3} y={:.3} z={:.3} m", p.x, p.y, p.z));
    }

    fn status(&self, ui: &mut egui::Ui) {
        let Some(snap) = &self.last else { return };
        let ready = self.link_ready.load(Ordering::Relaxed);
        ui.horizontal(|ui| {
            let (text, color) = if ready {
                (format!("● {}", self.backend_name), Color32::GREEN)
            } else {
                (format!("○ {} (waiting)", self.backend_name), Color32::YELLOW)
            };
            ui.colored_label(color, text);
            ui.label(if snap.arm.enabled { "tracking" } else { "idle" });
        });
        ui.monospace(format!("meas {:?} claw {:.0}", snap.arm.measured.joints_deg_rounded(), snap.arm.measured.claw_deg));
        ui.monospace(format!("ref  {:?}", snap.arm.reference.joints_deg_rounded()));
    }

    fn arm_plots(&self, ui: &mut egui::Ui) {
        let Some(snap) = &self.last else { return };
        let size = (ui.available_width() / 2.0 - 8.0).max(120.0);
        let views: [(&str, fn(&Point3<f64>) -> [f64; 2]); 2] =
            [("Top (XY)", |p| [p.x, p.y]), ("Side (XZ)", |p| [p.x, p.z])];
        ui.horizontal(|ui| {
            for (title, project) in views {
                ui.vertical(|ui| {
                    ui.label(title);
                    Plot::new(title)
                        .data_aspect(1.0)
                        .width(size)
                        .height(size)
                        .legend(Legend::default())
                        .allow_scroll(false)
                        .show(ui, |plot_ui| {
                            let chain = |pts: &[Point3<f64>]| PlotPoints::new(pts.iter().map(project).collect());
                            plot_ui.line(
                                Line::new(chain(snap.reference_chain.as_slice()))
                                    .name("reference")
                                    .color(Color32::GRAY)
                                    .style(LineStyle::dashed_loose()),
                            );
                            plot_ui.line(Line::new(chain(snap.measured_chain.as_slice())).name("measured").width(3.0));
                            plot_ui.points(Points::new(chain(snap.measured_chain.as_slice())).radius(3.0));
                            if snap.target_enabled {
                                let t = snap.target.translation.vector;
                                plot_ui.points(
                                    Points::new(PlotPoints::new(vec![project(&Point3::from(t))]))
                                        .name("target")
                                        .color(Color32::RED)
                                        .radius(5.0),
                                );
                            }
                        });
                });
            }
        });
    }
}

impl eframe::App for ArmGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if self.stop.load(Ordering::Relaxed) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            return;
        }
        self.step(ctx);

        egui::SidePanel::left("controls").min_width(280.0).show(ctx, |ui| {
            self.mode_tabs(ui);
            ui.separator();
            match self.tick.controller().mode() {
                ControlMode::Manual => self.manual_panel(ui),
                ControlMode::Follow => self.follow_panel(ui),
                ControlMode::Optimize => {}
            }
            ui.separator();
            ui.checkbox(&mut self.keyboard_enabled, "Keyboard gamepad");
            if self.keyboard_enabled {
                ui.small("WASD / arrows: sticks, Q/E: bumpers, IJKL: buttons, Enter: start");
                ui.small(format!(
                    "Z/X base {:+.2}, C/V claw {:.2}",
                    self.keyboard.base(),
                    self.keyboard.claw()
                ));
            }
            ui.separator();
            self.status(ui);
            ui.collapsing("Message log", |ui| {
                if ui.button("Clear log").clicked() {
                    self.message_log.clear();
                }
                egui::ScrollArea::vertical()
                    .max_height(240.0)
                    .auto_shrink([false; 2])
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for line in &self.message_log {
                            ui.monospace(line);
                        }
                    });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.arm_plots(ui);
        });

        ctx.request_repaint_after(self.update_dt);
    }
}
