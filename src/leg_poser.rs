use nalgebra as na;

use crate::auto_pose::{PosingContext, PosingState};
use crate::math::{cubic_bezier, quartic_bezier, Pose};
use crate::model::{Leg, LegState};

/// Timed maneuvers report progress as an integer percentage.
pub const PROGRESS_COMPLETE: i32 = 100;

/// Early-exit threshold for joint-space moves, in radians.
pub const JOINT_TOLERANCE: f64 = 0.01;

/// Early-exit threshold for tip-space steps, in metres per component.
pub const TIP_TOLERANCE: f64 = 0.01;

/// Per-leg posing primitives: timed tip steps, timed joint moves, the
/// leg-specific auto-pose negation and the cached transition positions
/// used by the startup/shutdown sequencer.
#[derive(Debug, Clone)]
pub struct LegPoser {
    pub id: usize,

    /// Negation window bounds in base phase units.
    pub pose_negation_phase_start: i32,
    pub pose_negation_phase_end: i32,

    first_iteration: bool,
    master_iteration_count: i32,
    origin_joint_positions: Vec<f64>,
    origin_tip_position: na::Vector3<f64>,

    pub current_tip_position: na::Vector3<f64>,
    pub target_tip_position: na::Vector3<f64>,
    pub leg_completed_step: bool,

    /// This leg's view of the auto pose, with any negation applied.
    pub auto_pose: Pose,
    stop_negation: bool,

    transition_positions: Vec<na::Vector3<f64>>,
}

impl LegPoser {
    pub fn new(
        id: usize,
        negation_start: i32,
        negation_end: i32,
        initial_tip_position: na::Vector3<f64>,
    ) -> Self {
        Self {
            id,
            pose_negation_phase_start: negation_start,
            pose_negation_phase_end: negation_end,
            first_iteration: true,
            master_iteration_count: 0,
            origin_joint_positions: Vec::new(),
            origin_tip_position: initial_tip_position,
            current_tip_position: initial_tip_position,
            target_tip_position: initial_tip_position,
            leg_completed_step: false,
            auto_pose: Pose::identity(),
            stop_negation: false,
            transition_positions: Vec::new(),
        }
    }

    // Transition-position cache

    pub fn reset_transition_sequence(&mut self) {
        self.transition_positions.clear();
    }

    pub fn add_transition_position(&mut self, position: na::Vector3<f64>) {
        self.transition_positions.push(position);
    }

    pub fn has_transition_position(&self, index: i32) -> bool {
        index >= 0 && (index as usize) < self.transition_positions.len()
    }

    pub fn transition_position(&self, index: i32) -> na::Vector3<f64> {
        self.transition_positions[index as usize]
    }

    pub fn transition_position_count(&self) -> usize {
        self.transition_positions.len()
    }

    /// Abandon an in-flight maneuver; the next call starts fresh.
    pub fn reset_step_to_position(&mut self) -> i32 {
        self.first_iteration = true;
        PROGRESS_COMPLETE
    }

    /// Smoothly move every joint of the leg from its position at the first
    /// call to the target positions, over `time_to_move` seconds.
    ///
    /// Duplicated end control nodes give zero joint velocity at both ends.
    pub fn move_to_joint_position(
        &mut self,
        leg: &mut Leg,
        target_joint_positions: &[f64],
        time_to_move: f64,
        time_delta: f64,
    ) -> i32 {
        if self.first_iteration {
            let mut all_at_target = true;
            self.origin_joint_positions.clear();
            for (joint, target) in leg.joints.iter().zip(target_joint_positions) {
                all_at_target =
                    all_at_target && (target - joint.current_position).abs() < JOINT_TOLERANCE;
                self.origin_joint_positions.push(joint.current_position);
            }

            if all_at_target {
                return PROGRESS_COMPLETE;
            }
            self.first_iteration = false;
            self.master_iteration_count = 0;
        }

        let num_iterations = ((time_to_move / time_delta).round() as i32).max(1);
        let delta_t = 1.0 / num_iterations as f64;

        self.master_iteration_count += 1;
        let time_input = self.master_iteration_count as f64 * delta_t;

        for (i, joint) in leg.joints.iter_mut().enumerate() {
            let origin = self.origin_joint_positions[i];
            let target = target_joint_positions[i];
            let nodes = [origin, origin, target, target];
            joint.desired_position = cubic_bezier(&nodes, time_input);
            joint.current_position = joint.desired_position;
        }
        leg.apply_fk();
        self.current_tip_position = leg.current_tip_position;

        let progress = (((self.master_iteration_count - 1) as f64 / num_iterations as f64)
            * PROGRESS_COMPLETE as f64) as i32;

        if self.master_iteration_count >= num_iterations {
            self.first_iteration = true;
            PROGRESS_COMPLETE
        } else {
            progress
        }
    }

    /// Step the leg tip from its position at the first call to `target`
    /// over `time_to_step` seconds, lifting by `lift_height` along the way.
    ///
    /// `applied_pose` is phased in linearly over the maneuver and applied
    /// inversely to the tip, so a body pose can be assumed while stepping.
    #[allow(clippy::too_many_arguments)]
    pub fn step_to_position(
        &mut self,
        leg: &Leg,
        target: na::Vector3<f64>,
        applied_pose: Pose,
        lift_height: f64,
        time_to_step: f64,
        apply_delta_z: bool,
        time_delta: f64,
    ) -> i32 {
        let mut target_tip_position = target;

        if self.first_iteration {
            self.origin_tip_position = leg.current_tip_position;

            if (self.origin_tip_position.x - target_tip_position.x).abs() < TIP_TOLERANCE
                && (self.origin_tip_position.y - target_tip_position.y).abs() < TIP_TOLERANCE
                && (self.origin_tip_position.z - target_tip_position.z).abs() < TIP_TOLERANCE
            {
                self.current_tip_position = target_tip_position;
                return PROGRESS_COMPLETE;
            }
            self.current_tip_position = self.origin_tip_position;
            self.master_iteration_count = 0;
            self.first_iteration = false;
        }

        let manually_manipulated =
            leg.state == LegState::Manual || leg.state == LegState::WalkingToManual;
        if apply_delta_z && !manually_manipulated {
            target_tip_position.z += leg.delta_z;
        }

        self.master_iteration_count += 1;

        let num_iterations = ((time_to_step / time_delta).round() as i32).max(1);
        let delta_t = 1.0 / num_iterations as f64;
        let completion_ratio = (self.master_iteration_count - 1) as f64 / num_iterations as f64;

        // The applied pose phases in over the course of the maneuver
        let posed = applied_pose.interpolate(completion_ratio);

        let origin = self.origin_tip_position;
        let lift = na::Vector3::new(0.0, 0.0, lift_height);

        let primary_nodes = [
            origin,
            origin,
            origin + lift,
            target_tip_position + 0.75 * (origin - target_tip_position) + lift,
            target_tip_position + 0.5 * (origin - target_tip_position) + lift,
        ];

        let secondary_nodes = [
            target_tip_position + 0.5 * (origin - target_tip_position) + lift,
            target_tip_position + 0.25 * (origin - target_tip_position) + lift,
            target_tip_position + lift,
            target_tip_position,
            target_tip_position,
        ];

        let half = num_iterations / 2;
        let swing_iteration =
            (self.master_iteration_count + (num_iterations - 1)) % num_iterations + 1;

        let new_tip_position = if swing_iteration <= half {
            let time_input = swing_iteration as f64 * delta_t * 2.0;
            quartic_bezier(&primary_nodes, time_input)
        } else {
            let time_input = (swing_iteration - half) as f64 * delta_t * 2.0;
            quartic_bezier(&secondary_nodes, time_input)
        };

        if leg.state != LegState::Manual {
            self.current_tip_position = posed.inverse_transform_vector(&new_tip_position);
        }

        if self.master_iteration_count >= num_iterations {
            self.first_iteration = true;
            PROGRESS_COMPLETE
        } else {
            (completion_ratio * PROGRESS_COMPLETE as f64) as i32
        }
    }

    /// Update this leg's auto pose, negating the global contribution over
    /// the leg's negation window so its own swing is not fought by posing.
    pub fn update_auto_pose(&mut self, phase: i32, global_auto_pose: &Pose, ctx: &PosingContext) {
        let (start_phase, end_phase, negation_phase) = ctx.window(
            self.pose_negation_phase_start,
            self.pose_negation_phase_end,
            phase,
        );

        if negation_phase >= start_phase && negation_phase < end_phase && !self.stop_negation {
            let iteration = negation_phase - start_phase + 1;
            let num_iterations = end_phase - start_phase;

            let position_amplitude = global_auto_pose.position;
            let rotation_amplitude = global_auto_pose.euler();

            let zero = na::Vector3::zeros();
            let mut position_nodes = [zero; 5];
            let mut rotation_nodes = [zero; 5];

            let first_half = iteration <= num_iterations / 2;
            if first_half {
                position_nodes[2] = position_amplitude;
                position_nodes[3] = position_amplitude;
                position_nodes[4] = position_amplitude;
                rotation_nodes[2] = rotation_amplitude;
                rotation_nodes[3] = rotation_amplitude;
                rotation_nodes[4] = rotation_amplitude;
            } else {
                position_nodes[0] = position_amplitude;
                position_nodes[1] = position_amplitude;
                position_nodes[2] = position_amplitude;
                rotation_nodes[0] = rotation_amplitude;
                rotation_nodes[1] = rotation_amplitude;
                rotation_nodes[2] = rotation_amplitude;
            }

            let delta_t = 1.0 / (num_iterations as f64 / 2.0);
            let offset = if first_half { 0 } else { num_iterations / 2 };
            let time_input = (iteration - offset) as f64 * delta_t;

            let position = quartic_bezier(&position_nodes, time_input);
            let rotation = quartic_bezier(&rotation_nodes, time_input);

            self.auto_pose = global_auto_pose.remove(&Pose::from_euler(position, rotation));
        } else {
            self.stop_negation =
                ctx.sync_with_step_cycle && ctx.state == PosingState::StopPosing;
            self.auto_pose = *global_auto_pose;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::params::Parameters;

    const TIME_DELTA: f64 = 0.02;

    fn model() -> Model {
        Model::new(&Parameters::default())
    }

    fn reachable_target(leg: &Leg, spread: f64, depth: f64) -> na::Vector3<f64> {
        let outward = na::Vector3::new(leg.mount_yaw.cos(), leg.mount_yaw.sin(), 0.0);
        leg.root_offset + outward * spread + na::Vector3::new(0.0, 0.0, -depth)
    }

    #[test]
    fn test_step_to_position_reaches_target() {
        let mut m = model();
        let leg = &mut m.legs[0];
        leg.apply_ik(&reachable_target(leg, 0.3, 0.15));

        let mut poser = LegPoser::new(0, 2, 4, leg.current_tip_position);
        let target = reachable_target(leg, 0.32, 0.1);

        let mut progress = 0;
        let mut ticks = 0;
        while progress != PROGRESS_COMPLETE {
            progress = poser.step_to_position(
                leg,
                target,
                Pose::identity(),
                0.04,
                1.0,
                false,
                TIME_DELTA,
            );
            ticks += 1;
            assert!(ticks <= 50, "step did not complete in time");
        }

        assert_eq!(ticks, 50);
        assert!((poser.current_tip_position - target).norm() < 1e-9);
    }

    #[test]
    fn test_step_to_position_lifts_through_midpoint() {
        let mut m = model();
        let leg = &mut m.legs[0];
        leg.apply_ik(&reachable_target(leg, 0.3, 0.15));

        let mut poser = LegPoser::new(0, 2, 4, leg.current_tip_position);
        let origin = leg.current_tip_position;
        let target = reachable_target(leg, 0.33, 0.15);
        let lift_height = 0.05;

        let mut peak_z = f64::NEG_INFINITY;
        for _ in 0..50 {
            poser.step_to_position(
                leg,
                target,
                Pose::identity(),
                lift_height,
                1.0,
                false,
                TIME_DELTA,
            );
            peak_z = peak_z.max(poser.current_tip_position.z);
        }

        let expected = origin.z.max(target.z) + lift_height;
        assert!((peak_z - expected).abs() < 0.01);
    }

    #[test]
    fn test_step_to_position_early_exit_when_at_target() {
        let mut m = model();
        let leg = &mut m.legs[0];
        leg.apply_ik(&reachable_target(leg, 0.3, 0.15));

        let mut poser = LegPoser::new(0, 2, 4, leg.current_tip_position);
        let target = leg.current_tip_position + na::Vector3::new(0.001, 0.0, 0.0);

        let progress =
            poser.step_to_position(leg, target, Pose::identity(), 0.05, 1.0, false, TIME_DELTA);
        assert_eq!(progress, PROGRESS_COMPLETE);
        assert_eq!(poser.current_tip_position, target);
    }

    #[test]
    fn test_move_to_joint_position_completes_and_is_monotonic() {
        let mut m = model();
        let leg = &mut m.legs[1];
        let mut poser = LegPoser::new(1, 0, 2, leg.current_tip_position);

        let targets: Vec<f64> = leg.joints.iter().map(|j| j.packed_position).collect();

        let mut last_progress = -1;
        let mut ticks = 0;
        loop {
            let progress = poser.move_to_joint_position(leg, &targets, 2.0, TIME_DELTA);
            assert!(progress >= last_progress);
            last_progress = progress;
            ticks += 1;
            if progress == PROGRESS_COMPLETE {
                break;
            }
            assert!(ticks <= 100, "move did not complete in time");
        }

        assert_eq!(ticks, 100);
        for (joint, target) in leg.joints.iter().zip(&targets) {
            assert!((joint.current_position - target).abs() < 1e-9);
        }
    }

    #[test]
    fn test_move_to_joint_position_early_exit() {
        let mut m = model();
        let leg = &mut m.legs[1];
        let mut poser = LegPoser::new(1, 0, 2, leg.current_tip_position);

        let targets: Vec<f64> = leg.joints.iter().map(|j| j.current_position).collect();
        let progress = poser.move_to_joint_position(leg, &targets, 2.0, TIME_DELTA);
        assert_eq!(progress, PROGRESS_COMPLETE);
    }

    #[test]
    fn test_negation_subtracts_global_pose_mid_window() {
        let mut poser = LegPoser::new(0, 2, 4, na::Vector3::zeros());
        let global = Pose::from_euler(
            na::Vector3::new(0.0, 0.0, 0.02),
            na::Vector3::zeros(),
        );
        let ctx = PosingContext {
            phase_length: 50,
            normaliser: 12.5,
            sync_with_step_cycle: true,
            state: PosingState::Posing,
        };

        // Mid-window the negation cancels the amplitude, up to the
        // quantisation of an odd-length window
        poser.update_auto_pose(36, &global, &ctx);
        assert!(poser.auto_pose.position.z.abs() < 1e-4);

        // Outside the window the leg sees the unmodified global pose
        poser.update_auto_pose(10, &global, &ctx);
        assert!((poser.auto_pose.position.z - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_transition_position_cache() {
        let mut poser = LegPoser::new(0, 2, 4, na::Vector3::zeros());
        assert!(!poser.has_transition_position(0));

        poser.add_transition_position(na::Vector3::new(0.1, 0.2, -0.1));
        poser.add_transition_position(na::Vector3::new(0.15, 0.2, -0.2));
        assert!(poser.has_transition_position(1));
        assert!(!poser.has_transition_position(2));
        assert_eq!(poser.transition_position(1).z, -0.2);

        poser.reset_transition_sequence();
        assert!(!poser.has_transition_position(0));
    }
}
