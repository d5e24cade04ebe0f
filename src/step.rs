use nalgebra as na;
use tracing::trace;

use crate::math::{quartic_bezier_dot, wrap};

/// Sub-state of one leg's step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Swing,
    Stance,
    /// Held on the ground while the walk cycle starts up and this leg's
    /// phase offset would otherwise begin mid-swing.
    ForceStance,
    /// Held in place once the leg has finished its final step of a stop.
    ForceStop,
}

/// Immutable snapshot of the walk-cycle values a stepper needs per tick.
///
/// Steppers are leaf structures: they never hold a reference back to the
/// walk controller, they are handed this snapshot on every call.
#[derive(Debug, Clone, Copy)]
pub struct StepTiming {
    pub phase_length: i32,
    pub swing_start: i32,
    /// One past the last swing phase; equal to `phase_length`, so the
    /// wrapped swing end is phase 0.
    pub swing_end: i32,
    pub step_frequency: f64,
    pub time_delta: f64,
    /// Swing apex height above the swing origin, in metres.
    pub swing_height: f64,
    /// Stance dip depth below the stance origin, in metres.
    pub stance_depth: f64,
}

impl StepTiming {
    pub fn swing_length(&self) -> i32 {
        self.swing_end - self.swing_start
    }

    pub fn stance_length(&self) -> i32 {
        self.phase_length - self.swing_length()
    }

    /// Iteration delta-t for a sub-phase spanning `length` phase ticks.
    ///
    /// The swing period is split across two curves so its parameter runs
    /// over [0, 2]; stance runs over [0, 1]. The iteration count is forced
    /// even so the two swing halves meet exactly at the apex.
    fn delta_t(&self, state: StepState, length: i32) -> f64 {
        let per_cycle = (length as f64 / self.phase_length as f64)
            / (self.step_frequency * self.time_delta);
        let num_iterations = (2.0 * (per_cycle / 2.0).round()).max(2.0);
        if state == StepState::Swing {
            2.0 / num_iterations
        } else {
            1.0 / num_iterations
        }
    }
}

/// Per-leg step cycle engine.
///
/// Generates the leg tip trajectory as three quartic Bezier curves (two for
/// swing, one for stance) whose control nodes enforce position, velocity
/// and acceleration continuity across every seam, and advances the tip by
/// integrating the curve derivative each tick.
#[derive(Debug, Clone)]
pub struct LegStepper {
    pub id: usize,

    pub phase: i32,
    pub phase_offset: i32,
    pub step_state: StepState,

    pub at_correct_phase: bool,
    pub completed_first_step: bool,

    /// Planned horizontal tip displacement over one stance period.
    pub stride_vector: na::Vector3<f64>,

    pub default_tip_position: na::Vector3<f64>,
    pub current_tip_position: na::Vector3<f64>,
    pub current_tip_velocity: na::Vector3<f64>,

    pub swing_origin_tip_position: na::Vector3<f64>,
    pub stance_origin_tip_position: na::Vector3<f64>,

    pub swing_1_nodes: [na::Vector3<f64>; 5],
    pub swing_2_nodes: [na::Vector3<f64>; 5],
    pub stance_nodes: [na::Vector3<f64>; 5],

    pub swing_delta_t: f64,
    pub stance_delta_t: f64,
}

impl LegStepper {
    pub fn new(id: usize, phase_offset: i32, default_tip_position: na::Vector3<f64>) -> Self {
        Self {
            id,
            phase: 0,
            phase_offset,
            step_state: StepState::Stance,
            at_correct_phase: false,
            completed_first_step: false,
            stride_vector: na::Vector3::zeros(),
            default_tip_position,
            current_tip_position: default_tip_position,
            current_tip_velocity: na::Vector3::zeros(),
            swing_origin_tip_position: default_tip_position,
            stance_origin_tip_position: default_tip_position,
            swing_1_nodes: [na::Vector3::zeros(); 5],
            swing_2_nodes: [na::Vector3::zeros(); 5],
            stance_nodes: [na::Vector3::zeros(); 5],
            swing_delta_t: 0.0,
            stance_delta_t: 0.0,
        }
    }

    pub fn iterate_phase(&mut self, timing: &StepTiming) {
        self.phase = wrap(self.phase + 1, timing.phase_length);
    }

    /// Select the step sub-state from the phase, honouring forced states.
    pub fn update_step_state(&mut self, timing: &StepTiming) {
        match self.step_state {
            StepState::ForceStance | StepState::ForceStop => {}
            _ => {
                if self.phase >= timing.swing_start && self.phase < timing.swing_end {
                    self.step_state = StepState::Swing;
                } else {
                    self.step_state = StepState::Stance;
                }
            }
        }
    }

    /// True if this stepper's phase offset falls inside the swing window,
    /// which means the leg must be forced into stance during startup.
    pub fn starts_mid_swing(&self, timing: &StepTiming) -> bool {
        self.phase_offset >= timing.swing_start && self.phase_offset < timing.swing_end
    }

    /// Advance the tip along the step-cycle trajectory for this tick.
    pub fn update_position(&mut self, timing: &StepTiming) {
        match self.step_state {
            StepState::Swing => self.update_swing(timing),
            StepState::Stance => {
                // The first stance after startup can be shortened: it began
                // at the phase offset rather than at the swing end.
                let stance_start = if self.completed_first_step || self.starts_mid_swing(timing) {
                    wrap(timing.swing_end, timing.phase_length)
                } else {
                    self.phase_offset
                };
                self.update_stance(timing, stance_start, timing.swing_start);
            }
            StepState::ForceStance => {
                // Forced stance drags the tip across the leg's offset
                // window so the body keeps moving while the leg waits for
                // its correct phase.
                self.update_stance(timing, self.phase_offset, timing.phase_length);
            }
            StepState::ForceStop => {
                self.current_tip_velocity = na::Vector3::zeros();
            }
        }
    }

    fn update_swing(&mut self, timing: &StepTiming) {
        let iteration = self.phase - timing.swing_start + 1;
        self.swing_delta_t = timing.delta_t(StepState::Swing, timing.swing_length());
        let num_iterations = (2.0 / self.swing_delta_t).round() as i32;

        if iteration == 1 {
            self.swing_origin_tip_position = self.current_tip_position;
        }

        let stride = na::Vector3::new(self.stride_vector.x, self.stride_vector.y, 0.0);

        let delta = if iteration <= num_iterations / 2 {
            self.generate_swing_control_nodes(timing);
            let t1 = iteration as f64 * self.swing_delta_t;
            self.swing_delta_t * quartic_bezier_dot(&self.swing_1_nodes, t1)
        } else {
            // Forecast the next stance curve so the secondary swing lands
            // with matching velocity and acceleration.
            self.stance_delta_t = timing.delta_t(StepState::Stance, timing.stance_length());
            self.stance_origin_tip_position = self.default_tip_position + 0.5 * stride;
            self.generate_stance_control_nodes(timing, &stride);
            self.generate_swing_control_nodes(timing);

            let t2 = (iteration - num_iterations / 2) as f64 * self.swing_delta_t;
            self.swing_delta_t * quartic_bezier_dot(&self.swing_2_nodes, t2)
        };

        self.current_tip_position += delta;
        self.current_tip_velocity = delta / timing.time_delta;

        if self.id == 0 {
            trace!(
                iteration,
                tip = ?self.current_tip_position.as_slice(),
                target = ?self.swing_2_nodes[4].as_slice(),
                "swing trajectory"
            );
        }
    }

    fn update_stance(&mut self, timing: &StepTiming, stance_start: i32, stance_end: i32) {
        let stance_length = if stance_end == timing.phase_length {
            timing.phase_length - stance_start
        } else {
            wrap(stance_end - stance_start, timing.phase_length)
        };
        if stance_length == 0 {
            self.current_tip_velocity = na::Vector3::zeros();
            return;
        }
        self.stance_delta_t = timing.delta_t(StepState::Stance, stance_length);

        let iteration = wrap(
            self.phase + (timing.phase_length - stance_start),
            timing.phase_length,
        ) + 1;

        if iteration == 1 {
            self.stance_origin_tip_position = self.current_tip_position;
        }

        // A shortened stance covers the same curve, so the stride scales
        // with its share of the steady-state stance length.
        let scale = stance_length as f64 / timing.stance_length() as f64;
        let stride = na::Vector3::new(self.stride_vector.x, self.stride_vector.y, 0.0) * scale;

        self.generate_stance_control_nodes(timing, &stride);
        let t = iteration as f64 * self.stance_delta_t;
        let delta = self.stance_delta_t * quartic_bezier_dot(&self.stance_nodes, t);

        self.current_tip_position += delta;
        self.current_tip_velocity = delta / timing.time_delta;

        if self.id == 0 {
            trace!(
                iteration,
                tip = ?self.current_tip_position.as_slice(),
                target = ?self.stance_nodes[4].as_slice(),
                "stance trajectory"
            );
        }
    }

    /// Control nodes for the stance quartic Bezier curve.
    ///
    /// Horizontal node spacing is uniform, giving constant horizontal
    /// velocity through stance; the vertical nodes dip by the stance depth
    /// with the half-sums keeping the seams C2.
    fn generate_stance_control_nodes(&mut self, timing: &StepTiming, stride: &na::Vector3<f64>) {
        let origin = self.stance_origin_tip_position;
        let target = origin - stride;

        self.stance_nodes[0] = origin;
        self.stance_nodes[4] = target;
        self.stance_nodes[1] = target + 0.75 * (origin - target);
        self.stance_nodes[2] = target + 0.5 * (origin - target);
        self.stance_nodes[3] = target + 0.25 * (origin - target);

        self.stance_nodes[0].z = origin.z;
        self.stance_nodes[4].z = self.default_tip_position.z;
        self.stance_nodes[2].z = origin.z - timing.stance_depth;
        self.stance_nodes[1].z = (self.stance_nodes[0].z + self.stance_nodes[2].z) / 2.0;
        self.stance_nodes[3].z = (self.stance_nodes[4].z + self.stance_nodes[2].z) / 2.0;
    }

    /// Control nodes for both swing quartic Bezier curves.
    ///
    /// The scaler carries derivatives between curves with different time
    /// scalings: stance runs its parameter over [0, 1] in a full stance
    /// period while each swing curve runs [0, 1] in half a swing period.
    fn generate_swing_control_nodes(&mut self, timing: &StepTiming) {
        let bezier_scaler = self.stance_delta_t / self.swing_delta_t;
        let stance = &self.stance_nodes;

        // Horizontal plane
        let s1_0 = self.swing_origin_tip_position;
        let s1_1 = s1_0 + bezier_scaler * (stance[4] - stance[3]);
        let s1_2 = s1_1 + (s1_1 - s1_0);
        let s1_4 = self.default_tip_position;
        let s1_3 = (s1_2 + s1_4) / 2.0;

        let s2_0 = s1_4;
        let s2_1 = s2_0 + (s2_0 - s1_3);
        let s2_3 = stance[0] + bezier_scaler * (stance[0] - stance[1]);
        let s2_2 = s2_3 + (s2_3 - stance[0]);
        let s2_4 = stance[0];

        self.swing_1_nodes = [s1_0, s1_1, s1_2, s1_3, s1_4];
        self.swing_2_nodes = [s2_0, s2_1, s2_2, s2_3, s2_4];

        // Vertical plane
        let stance_end_slope = stance[4].z - stance[3].z;
        let stance_start_slope = stance[0].z - stance[1].z;

        self.swing_1_nodes[0].z = self.swing_origin_tip_position.z;
        self.swing_1_nodes[1].z = self.swing_1_nodes[0].z + bezier_scaler * stance_end_slope;
        self.swing_1_nodes[2].z = self.swing_1_nodes[0].z + 2.0 * bezier_scaler * stance_end_slope;
        self.swing_1_nodes[4].z = self.swing_1_nodes[0].z + timing.swing_height;
        self.swing_1_nodes[3].z = self.swing_1_nodes[4].z;

        self.swing_2_nodes[0].z = self.swing_1_nodes[4].z;
        self.swing_2_nodes[1].z = self.swing_2_nodes[0].z;
        self.swing_2_nodes[2].z = stance[0].z + 2.0 * bezier_scaler * stance_start_slope;
        self.swing_2_nodes[3].z = stance[0].z + bezier_scaler * stance_start_slope;
        self.swing_2_nodes[4].z = stance[0].z;
    }
}
