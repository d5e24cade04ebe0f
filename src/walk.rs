use nalgebra as na;
use tracing::debug;

use crate::error::ControlError;
use crate::math::{clamp_norm2, wrap};
use crate::model::{LegState, Model};
use crate::params::Parameters;
use crate::step::{LegStepper, StepState, StepTiming};

/// Global state of the walk cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    Stopped,
    Starting,
    Moving,
    Stopping,
}

/// Top-level walk cycle coordinator.
///
/// Owns one `LegStepper` per leg, derives the stance geometry and speed
/// limits once at construction, and per tick turns desired body velocities
/// into per-leg stride vectors while sequencing the legs through the
/// starting/moving/stopping pattern.
#[derive(Debug)]
pub struct WalkController {
    pub time_delta: f64,
    pub step_frequency: f64,

    pub phase_length: i32,
    pub swing_start: i32,
    pub swing_end: i32,

    /// Swing apex height above the tip's default position, in metres.
    pub swing_height: f64,
    /// Stance dip depth below the tip's default position, in metres.
    pub stance_depth: f64,

    pub maximum_body_height: f64,
    /// Body height above the default tips as a ratio of the maximum.
    pub body_clearance: f64,
    /// Radius of the largest per-leg footprint circle, after downscaling.
    pub workspace_radius: f64,
    /// Horizontal distance from the body centre to a middle leg tip; the
    /// turning radius used to relate angular and linear speeds.
    pub stance_radius: f64,

    pub desired_linear_velocity: na::Vector2<f64>,
    pub desired_angular_velocity: f64,

    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub max_linear_acceleration: f64,
    /// Slew rate applied to the angular velocity channel.
    pub max_angular_acceleration: f64,

    pub walk_state: WalkState,
    legs_at_correct_phase: usize,
    legs_completed_first_step: usize,

    pub leg_steppers: Vec<LegStepper>,
}

impl WalkController {
    /// Derive the gait timing and stance geometry, then build one stepper
    /// per leg at its default stance tip position.
    pub fn new(model: &mut Model, params: &Parameters) -> Result<Self, ControlError> {
        let time_delta = params.time_delta;
        let morphology = &params.morphology;

        // Quantise the cycle so a whole number of ticks spans one step,
        // then recompute the true step frequency from the rounded length.
        let base_phase_length = params.gait.stance_phase + params.gait.swing_phase;
        let raw_phase_length = 1.0 / (params.walk.step_frequency * time_delta);
        let phase_length = ((2.0 * (raw_phase_length / 2.0).round()) as i32).max(2);
        let swing_ratio = params.gait.swing_phase as f64 / base_phase_length as f64;
        let swing_length = ((phase_length as f64 * swing_ratio).round() as i32)
            .clamp(1, phase_length - 1);
        let swing_start = phase_length - swing_length;
        let swing_end = phase_length;
        let step_frequency = 1.0 / (phase_length as f64 * time_delta);

        let normaliser = phase_length as f64 / base_phase_length as f64;

        // Maximum body height reachable by the leg geometry.
        let min_knee = morphology.min_max_knee_bend[0].max(0.0);
        let femur = morphology.femur_length;
        let tibia = morphology.tibia_length;
        let max_hip_drop = (-morphology.min_max_hip_lift[0]).min(
            std::f64::consts::FRAC_PI_2
                - (tibia * min_knee.sin()).atan2(femur + tibia * min_knee.cos()),
        );
        let maximum_body_height = femur * max_hip_drop.sin()
            + tibia
                * (max_hip_drop
                    + (std::f64::consts::FRAC_PI_2 - max_hip_drop)
                        .clamp(min_knee, morphology.min_max_knee_bend[1]))
                .sin();

        let step_clearance = params.walk.step_clearance;
        if step_clearance * maximum_body_height > 2.0 * femur {
            return Err(ControlError::GeometryInfeasible(format!(
                "step clearance {:.3} m exceeds reachable lift {:.3} m",
                step_clearance * maximum_body_height,
                2.0 * femur
            )));
        }

        let body_clearance = if params.walk.body_clearance == -1.0 {
            model.min_leg_length() / maximum_body_height
                + params.walk.step_curvature_allowance * step_clearance
        } else {
            params.walk.body_clearance
        };

        let min_leg_length = model.min_leg_length();
        let max_leg_length = model.max_leg_length();
        let body_height = body_clearance * maximum_body_height;

        // Largest footprint circle inscribed in each leg pair's reachable
        // sector at the chosen body height.
        let mut workspace_radius = f64::INFINITY;
        let mut foot_spread = [0.0; 3];
        for pair in 0..3 {
            let leg_drop = (body_height / max_leg_length).clamp(-1.0, 1.0).asin();
            let mut radius = f64::INFINITY;
            let mut horizontal_range;

            if leg_drop > -morphology.min_max_hip_lift[0] {
                // Leg cannot reach the ground straight at this clearance
                let extra_height =
                    body_height - femur * (-morphology.min_max_hip_lift[0]).sin();
                radius = (tibia * tibia - extra_height * extra_height).max(0.0).sqrt();
                horizontal_range = femur * (-morphology.min_max_hip_lift[0]).cos() + radius;
            } else {
                horizontal_range =
                    (max_leg_length * max_leg_length - body_height * body_height).sqrt();
            }
            horizontal_range *= params.walk.leg_span_scale;

            let theta = morphology.yaw_limits[pair];
            let cotan_theta = (std::f64::consts::FRAC_PI_2 - theta).tan();
            radius = radius.min(solve_quadratic(
                cotan_theta * cotan_theta,
                2.0 * horizontal_range,
                -horizontal_range * horizontal_range,
            ));

            // Reduce further if the lifted tip cannot stay within reach
            let tip_clearance = (body_clearance
                - params.walk.step_curvature_allowance * step_clearance)
                .max(0.0)
                * maximum_body_height;
            if tip_clearance < min_leg_length {
                radius = radius.min(
                    (horizontal_range
                        - (min_leg_length * min_leg_length - tip_clearance * tip_clearance)
                            .sqrt())
                        / 2.0,
                );
            }

            if radius <= 0.0 {
                return Err(ControlError::GeometryInfeasible(format!(
                    "footprint radius {radius:.4} for leg pair {pair}; step clearance too high"
                )));
            }

            foot_spread[pair] = morphology.coxa_length + horizontal_range - radius;

            // The step cycle overshoots the ground footprint to maintain
            // velocity through touchdown.
            let footprint_downscale = 0.8;
            workspace_radius = workspace_radius.min(radius * footprint_downscale);
        }

        // Default stance tip positions
        let default_tips: Vec<na::Vector3<f64>> = model
            .legs
            .iter()
            .map(|leg| {
                let outward = na::Vector3::new(leg.mount_yaw.cos(), leg.mount_yaw.sin(), 0.0);
                leg.root_offset + outward * foot_spread[leg.pair]
                    + na::Vector3::new(0.0, 0.0, -body_height)
            })
            .collect();

        // Shrink the footprint if neighbouring footprints overlap
        let mut min_gap = f64::INFINITY;
        for side in 0..2 {
            for (a, b) in [(2 + side, side), (2 + side, 4 + side)] {
                let mut difference = default_tips[a] - default_tips[b];
                difference.z = 0.0;
                min_gap = min_gap.min(difference.norm() - 2.0 * workspace_radius);
            }
        }
        if min_gap < 0.0 {
            workspace_radius += min_gap * 0.5;
        }
        if workspace_radius <= 0.0 {
            return Err(ControlError::GeometryInfeasible(
                "footprints overlap completely".into(),
            ));
        }

        let stance_radius = default_tips[2].xy().norm();

        let leg_steppers = model
            .legs
            .iter()
            .map(|leg| {
                let offset_base =
                    params.gait.phase_offset as f64 * params.gait.offset_multiplier[leg.id] as f64;
                let phase_offset = wrap((offset_base * normaliser).round() as i32, phase_length);
                LegStepper::new(leg.id, phase_offset, default_tips[leg.id])
            })
            .collect();

        let on_ground_ratio = (phase_length - swing_length) as f64 / phase_length as f64;
        let max_linear_speed = 2.0 * workspace_radius * step_frequency / on_ground_ratio;
        let max_angular_speed = max_linear_speed / stance_radius;
        let max_linear_acceleration = if params.walk.max_linear_acceleration == -1.0 {
            // The last leg to make its first swing must not drag further
            // than one footprint radius beforehand (s = a t^2 / 2).
            let ramp_time = (phase_length as f64 - swing_length as f64 * 0.5) * time_delta;
            2.0 * workspace_radius / (ramp_time * ramp_time)
        } else {
            params.walk.max_linear_acceleration
        };
        let max_angular_acceleration = params.walk.max_curvature_speed;

        model.standing_height = body_height;

        Ok(Self {
            time_delta,
            step_frequency,
            phase_length,
            swing_start,
            swing_end,
            swing_height: step_clearance * maximum_body_height,
            stance_depth: params.walk.step_depth * maximum_body_height,
            maximum_body_height,
            body_clearance,
            workspace_radius,
            stance_radius,
            desired_linear_velocity: na::Vector2::zeros(),
            desired_angular_velocity: 0.0,
            max_linear_speed,
            max_angular_speed,
            max_linear_acceleration,
            max_angular_acceleration,
            walk_state: WalkState::Stopped,
            legs_at_correct_phase: 0,
            legs_completed_first_step: 0,
            leg_steppers,
        })
    }

    /// Snapshot of the aggregate values the steppers need this tick.
    pub fn timing(&self) -> StepTiming {
        StepTiming {
            phase_length: self.phase_length,
            swing_start: self.swing_start,
            swing_end: self.swing_end,
            step_frequency: self.step_frequency,
            time_delta: self.time_delta,
            swing_height: self.swing_height,
            stance_depth: self.stance_depth,
        }
    }

    pub fn on_ground_ratio(&self) -> f64 {
        (self.phase_length - (self.swing_end - self.swing_start)) as f64
            / self.phase_length as f64
    }

    /// Advance the walk cycle by one tick.
    ///
    /// `linear_input` and `angular_input` are normalised commands with
    /// magnitude at most 1; anything larger is clamped silently.
    pub fn update(
        &mut self,
        model: &Model,
        linear_input: na::Vector2<f64>,
        angular_input: f64,
    ) {
        let on_ground_ratio = self.on_ground_ratio();

        // Normalise and clamp the commanded velocities
        let (commanded_linear, commanded_angular) = if self.walk_state != WalkState::Stopping {
            (
                clamp_norm2(linear_input, 1.0) * self.max_linear_speed,
                angular_input.clamp(-1.0, 1.0) * self.max_angular_speed,
            )
        } else {
            (na::Vector2::zeros(), 0.0)
        };
        let commanded_linear = clamp_norm2(commanded_linear, self.max_linear_speed);
        let commanded_angular = commanded_angular.clamp(-self.max_angular_speed, self.max_angular_speed);

        // Slew-rate limit towards the command
        let linear_step = commanded_linear - self.desired_linear_velocity;
        if linear_step.norm() > 0.0 {
            let ratio =
                (self.max_linear_acceleration * self.time_delta / linear_step.norm()).min(1.0);
            self.desired_linear_velocity += linear_step * ratio;
        }
        let angular_step = commanded_angular - self.desired_angular_velocity;
        if angular_step.abs() > 0.0 {
            let ratio =
                (self.max_angular_acceleration * self.time_delta / angular_step.abs()).min(1.0);
            self.desired_angular_velocity += angular_step * ratio;
        }

        let has_command = commanded_linear.norm() > 0.0 || commanded_angular != 0.0;
        let leg_count = self.leg_steppers.len();

        // Walk state transitions, evaluated before any leg advances so the
        // whole tick sees one consistent state.
        match self.walk_state {
            WalkState::Stopped if has_command => {
                self.walk_state = WalkState::Starting;
                for stepper in &mut self.leg_steppers {
                    stepper.phase = stepper.phase_offset - 1;
                }
                debug!("walk state: Stopped -> Starting");
            }
            WalkState::Starting
                if self.legs_at_correct_phase == leg_count
                    && self.legs_completed_first_step == leg_count =>
            {
                self.legs_at_correct_phase = 0;
                self.legs_completed_first_step = 0;
                self.walk_state = WalkState::Moving;
                debug!("walk state: Starting -> Moving");
            }
            WalkState::Moving if !has_command => {
                self.walk_state = WalkState::Stopping;
                debug!("walk state: Moving -> Stopping");
            }
            WalkState::Stopping if self.legs_at_correct_phase == leg_count => {
                self.legs_at_correct_phase = 0;
                self.walk_state = WalkState::Stopped;
                debug!("walk state: Stopping -> Stopped");
            }
            _ => {}
        }

        let timing = self.timing();
        let wrapped_swing_end = wrap(self.swing_end, self.phase_length);

        // Per-leg phase advance and coordination bookkeeping
        for stepper in &mut self.leg_steppers {
            // Stride in the walk frame; the angular term pivots about the
            // body centre using the leg's nominal stance position.
            let lateral = na::Vector2::new(
                stepper.default_tip_position.y,
                -stepper.default_tip_position.x,
            );
            let stride = (self.desired_linear_velocity
                + self.desired_angular_velocity * lateral)
                * (on_ground_ratio / self.step_frequency);
            stepper.stride_vector = na::Vector3::new(stride.x, stride.y, 0.0);

            match self.walk_state {
                WalkState::Starting => {
                    stepper.iterate_phase(&timing);

                    // First steps only count once every leg is in phase
                    if self.legs_at_correct_phase == leg_count
                        && stepper.phase == wrapped_swing_end
                        && !stepper.completed_first_step
                    {
                        stepper.completed_first_step = true;
                        self.legs_completed_first_step += 1;
                    }

                    if !stepper.at_correct_phase {
                        if stepper.starts_mid_swing(&timing) {
                            // Hold the leg on the ground until its phase
                            // clears the swing window
                            if stepper.phase == wrapped_swing_end {
                                stepper.at_correct_phase = true;
                                stepper.step_state = StepState::Stance;
                                self.legs_at_correct_phase += 1;
                            } else {
                                stepper.step_state = StepState::ForceStance;
                            }
                        } else {
                            stepper.at_correct_phase = true;
                            self.legs_at_correct_phase += 1;
                        }
                    }
                }
                WalkState::Stopping => {
                    if !stepper.at_correct_phase {
                        stepper.iterate_phase(&timing);

                        // The reference leg only settles after one extra
                        // full cycle returns it to phase zero
                        if stepper.id == 0
                            && stepper.step_state == StepState::ForceStop
                            && stepper.phase == 0
                        {
                            stepper.at_correct_phase = true;
                            stepper.step_state = StepState::Stance;
                            self.legs_at_correct_phase += 1;
                        }
                    }

                    if stepper.stride_vector.norm() == 0.0 && stepper.phase == wrapped_swing_end
                    {
                        stepper.step_state = StepState::ForceStop;
                        if stepper.id != 0 && !stepper.at_correct_phase {
                            stepper.at_correct_phase = true;
                            self.legs_at_correct_phase += 1;
                        }
                    }
                }
                WalkState::Moving => {
                    stepper.iterate_phase(&timing);
                    stepper.at_correct_phase = false;
                }
                WalkState::Stopped => {
                    stepper.at_correct_phase = false;
                    stepper.completed_first_step = false;
                    stepper.phase = 0;
                    stepper.step_state = StepState::Stance;
                }
            }
        }

        // Sub-state selection and tip update
        for stepper in &mut self.leg_steppers {
            stepper.update_step_state(&timing);

            let leg_walking = model.legs[stepper.id].state == LegState::Walking;
            if leg_walking && self.walk_state != WalkState::Stopped {
                stepper.update_position(&timing);
            }
        }
    }
}

/// Positive root of `a x^2 + b x + c = 0`, degenerating to the linear
/// solution when `a` vanishes.
fn solve_quadratic(a: f64, b: f64, c: f64) -> f64 {
    if a.abs() < 1e-12 {
        return -c / b;
    }
    let discriminant = (b * b - 4.0 * a * c).max(0.0).sqrt();
    (-b + discriminant) / (2.0 * a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;

    fn setup() -> (Model, WalkController) {
        let params = Parameters::default();
        let mut model = Model::new(&params);
        let walk = WalkController::new(&mut model, &params).unwrap();
        (model, walk)
    }

    /// Drive the walk until it reaches Moving, with a generous tick bound.
    fn run_until_moving(
        walk: &mut WalkController,
        model: &Model,
        linear: na::Vector2<f64>,
        angular: f64,
    ) {
        for _ in 0..(4 * walk.phase_length) {
            walk.update(model, linear, angular);
            if walk.walk_state == WalkState::Moving {
                return;
            }
        }
        panic!("walk never reached Moving");
    }

    #[test]
    fn test_phase_quantisation() {
        let (_, walk) = setup();
        // 1 / (1.0 Hz * 0.02 s) = 50 ticks per cycle, half of them swing
        assert_eq!(walk.phase_length, 50);
        assert_eq!(walk.swing_start, 25);
        assert_eq!(walk.swing_end, 50);
        assert!((walk.step_frequency - 1.0).abs() < 1e-12);

        // Tripod: two groups half a cycle apart
        let offsets: Vec<i32> = walk.leg_steppers.iter().map(|s| s.phase_offset).collect();
        assert_eq!(offsets, vec![0, 25, 25, 0, 0, 25]);
    }

    #[test]
    fn test_geometry_is_positive() {
        let (model, walk) = setup();
        assert!(walk.workspace_radius > 0.0);
        assert!(walk.stance_radius > walk.workspace_radius);
        assert!(walk.maximum_body_height > 0.0);
        assert!(model.standing_height > 0.0);
        assert!(walk.max_linear_speed > 0.0);
        assert!(walk.max_linear_acceleration > 0.0);
    }

    #[test]
    fn test_infeasible_step_clearance_rejected() {
        let mut params = Parameters::default();
        params.walk.step_clearance = 0.99;
        params.morphology.femur_length = 0.05;
        params.morphology.tibia_length = 0.6;
        let mut model = Model::new(&params);
        let result = WalkController::new(&mut model, &params);
        assert!(matches!(result, Err(ControlError::GeometryInfeasible(_))));
    }

    #[test]
    fn test_startup_reaches_moving_within_two_cycles() {
        let (model, mut walk) = setup();
        let forward = na::Vector2::new(1.0, 0.0);

        let mut moving_at = None;
        for tick in 0..(2 * walk.phase_length) {
            walk.update(&model, forward, 0.0);
            if walk.walk_state == WalkState::Moving {
                moving_at = Some(tick);
                break;
            }
        }
        let moving_at = moving_at.expect("never reached Moving");
        assert!(moving_at < 2 * walk.phase_length);
        for stepper in &walk.leg_steppers {
            assert!(stepper.completed_first_step);
        }
    }

    #[test]
    fn test_phase_advances_by_one_in_moving() {
        let (model, mut walk) = setup();
        let forward = na::Vector2::new(1.0, 0.0);
        run_until_moving(&mut walk, &model, forward, 0.0);

        let before: Vec<i32> = walk.leg_steppers.iter().map(|s| s.phase).collect();
        walk.update(&model, forward, 0.0);
        for (stepper, previous) in walk.leg_steppers.iter().zip(before) {
            assert_eq!(stepper.phase, wrap(previous + 1, walk.phase_length));
        }
    }

    #[test]
    fn test_step_state_matches_phase_window() {
        let (model, mut walk) = setup();
        let forward = na::Vector2::new(1.0, 0.0);
        run_until_moving(&mut walk, &model, forward, 0.0);

        for _ in 0..(2 * walk.phase_length) {
            walk.update(&model, forward, 0.0);
            for stepper in &walk.leg_steppers {
                let in_swing_window =
                    stepper.phase >= walk.swing_start && stepper.phase < walk.swing_end;
                match stepper.step_state {
                    StepState::Swing => assert!(in_swing_window),
                    StepState::Stance => assert!(!in_swing_window),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_straight_walk_stance_travel_is_footprint_diameter() {
        let (model, mut walk) = setup();
        let forward = na::Vector2::new(1.0, 0.0);
        run_until_moving(&mut walk, &model, forward, 0.0);
        // Let the velocity ramp finish and the cycle settle
        for _ in 0..(3 * walk.phase_length) {
            walk.update(&model, forward, 0.0);
        }

        let mut min_x = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        for _ in 0..walk.phase_length {
            walk.update(&model, forward, 0.0);
            let stepper = &walk.leg_steppers[0];
            if stepper.step_state == StepState::Stance {
                min_x = min_x.min(stepper.current_tip_position.x);
                max_x = max_x.max(stepper.current_tip_position.x);
            }
        }

        let expected = 2.0 * walk.workspace_radius;
        let travel = max_x - min_x;
        assert!(
            (travel - expected).abs() < 0.05 * expected,
            "stance travel {travel} vs footprint diameter {expected}"
        );
    }

    #[test]
    fn test_spin_stride_is_tangential() {
        let (model, mut walk) = setup();
        run_until_moving(&mut walk, &model, na::Vector2::zeros(), 1.0);
        // Let the angular ramp complete
        for _ in 0..(4 * walk.phase_length) {
            walk.update(&model, na::Vector2::zeros(), 1.0);
        }

        let expected_factor =
            walk.desired_angular_velocity * walk.on_ground_ratio() / walk.step_frequency;
        for stepper in &walk.leg_steppers {
            let tip = stepper.default_tip_position;
            let expected = na::Vector2::new(tip.y, -tip.x) * expected_factor;
            let stride = na::Vector2::new(stepper.stride_vector.x, stepper.stride_vector.y);
            assert!((stride - expected).norm() < 1e-9);
        }
    }

    #[test]
    fn test_stop_lands_all_legs_in_stance_at_phase_zero() {
        let (model, mut walk) = setup();
        let forward = na::Vector2::new(1.0, 0.0);
        run_until_moving(&mut walk, &model, forward, 0.0);
        for _ in 0..(2 * walk.phase_length) {
            walk.update(&model, forward, 0.0);
        }

        // Zero the command and wait out the deceleration plus the final
        // steps, including the reference leg's extra cycle
        let mut stopped_at = None;
        for tick in 0..(8 * walk.phase_length) {
            walk.update(&model, na::Vector2::zeros(), 0.0);
            if walk.walk_state == WalkState::Stopped {
                stopped_at = Some(tick);
                break;
            }
        }
        assert!(stopped_at.is_some(), "walk never stopped");

        for stepper in &walk.leg_steppers {
            assert_eq!(stepper.phase, 0, "leg {} phase", stepper.id);
            assert_eq!(stepper.step_state, StepState::Stance, "leg {}", stepper.id);
        }
    }

    #[test]
    fn test_input_overdrive_is_clamped() {
        let (model, mut walk) = setup();
        for _ in 0..500 {
            walk.update(&model, na::Vector2::new(5.0, 5.0), 3.0);
        }
        assert!(walk.desired_linear_velocity.norm() <= walk.max_linear_speed + 1e-9);
        assert!(walk.desired_angular_velocity.abs() <= walk.max_angular_speed + 1e-9);
    }
}
