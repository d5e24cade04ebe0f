use tracing::{debug, warn};

use crate::error::ControlError;
use crate::leg_poser::PROGRESS_COMPLETE;
use crate::math::Pose;
use crate::model::Model;
use crate::params::Parameters;
use crate::poser::PoseController;
use crate::walk::WalkController;

/// Baseline IK limit-proximity margin required during sequence discovery;
/// relaxes with each successive transition step.
pub const SAFETY_FACTOR: f64 = 0.15;

/// A transition sequence using more steps than this has gone wrong.
pub const TRANSITION_STEP_THRESHOLD: i32 = 20;

/// Step durations in units of step periods.
pub const HORIZONTAL_TRANSITION_TIME: f64 = 1.0;
pub const VERTICAL_TRANSITION_TIME: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDirection {
    StartUp,
    ShutDown,
}

/// Startup/shutdown transition sequencer.
///
/// Moves the robot between its packed posture and its walking stance as a
/// sequence of alternating horizontal and vertical leg steps. The first
/// startup discovers the sequence by stepping towards the walker defaults
/// under workspace-proximity checks and caches every achieved position;
/// later runs replay the cache.
#[derive(Debug)]
pub struct SequenceEngine {
    time_delta: f64,
    time_to_start: f64,

    /// Discovery-time proximity margin; tests may tighten it.
    pub safety_factor_base: f64,

    transition_step: i32,
    transition_step_count: i32,
    current_group: usize,
    legs_completed_step: usize,

    set_target: bool,
    first_sequence_execution: bool,
    reset_transition_sequence: bool,
    pub horizontal_transition_complete: bool,
    pub vertical_transition_complete: bool,
    pub proximity_alert: bool,
}

impl SequenceEngine {
    pub fn new(params: &Parameters) -> Self {
        Self {
            time_delta: params.time_delta,
            time_to_start: params.sequence.time_to_start,
            safety_factor_base: SAFETY_FACTOR,
            transition_step: 0,
            transition_step_count: 0,
            current_group: 0,
            legs_completed_step: 0,
            set_target: true,
            first_sequence_execution: true,
            reset_transition_sequence: true,
            horizontal_transition_complete: false,
            vertical_transition_complete: false,
            proximity_alert: false,
        }
    }

    /// Invalidate the cached sequence; the next startup rediscovers it.
    pub fn request_reset(&mut self) {
        self.reset_transition_sequence = true;
    }

    /// Execute one tick of the requested transition sequence.
    ///
    /// Returns progress in `[-1, 100]`: `PROGRESS_COMPLETE` when the
    /// sequence has finished, -1 while a first execution is discovering
    /// the sequence, otherwise the percentage completed.
    pub fn execute(
        &mut self,
        direction: SequenceDirection,
        model: &mut Model,
        walk: &WalkController,
        poser: &mut PoseController,
    ) -> Result<i32, ControlError> {
        if self.reset_transition_sequence && direction == SequenceDirection::StartUp {
            self.reset_transition_sequence = false;
            self.first_sequence_execution = true;
            self.transition_step = 0;
            for (leg, leg_poser) in model.legs.iter().zip(&mut poser.leg_posers) {
                leg_poser.reset_transition_sequence();
                leg_poser.add_transition_position(leg.current_tip_position);
            }
        }

        let mut progress = 0;
        let normalised_progress;

        let (execute_horizontal, next_transition_step, transition_step_target, total_progress) =
            match direction {
                SequenceDirection::StartUp => (
                    self.transition_step % 2 == 0,
                    self.transition_step + 1,
                    self.transition_step_count,
                    self.transition_step * 100 / self.transition_step_count.max(1),
                ),
                SequenceDirection::ShutDown => (
                    self.transition_step % 2 == 1,
                    self.transition_step - 1,
                    0,
                    100 - self.transition_step * 100 / self.transition_step_count.max(1),
                ),
            };

        // Whether this transition is the last before the sequence ends
        let final_transition = if self.first_sequence_execution {
            self.horizontal_transition_complete || self.vertical_transition_complete
        } else {
            next_transition_step == transition_step_target
        };

        // Discovery margin relaxes for each successive transition
        let safety_factor = if self.first_sequence_execution {
            self.safety_factor_base / (self.transition_step + 1) as f64
        } else {
            0.0
        };

        let mut sequence_complete = false;

        if execute_horizontal {
            if self.set_target {
                self.set_target = false;
                debug!(step = self.transition_step, "horizontal transition step");
                for id in 0..model.leg_count() {
                    let leg_poser = &mut poser.leg_posers[id];
                    leg_poser.leg_completed_step = false;

                    let mut target = if leg_poser.has_transition_position(next_transition_step) {
                        leg_poser.transition_position(next_transition_step)
                    } else {
                        walk.leg_steppers[id].default_tip_position
                    };
                    // Horizontal steps hold the current height
                    target.z = model.legs[id].current_tip_position.z;
                    leg_poser.target_tip_position = target;
                }
            }

            // With no load on the legs all of them may step at once
            let direct_step = !model.legs_bearing_load();
            for id in 0..model.leg_count() {
                if poser.leg_posers[id].leg_completed_step {
                    continue;
                }
                if model.legs[id].group == self.current_group || direct_step {
                    let apply_delta_z = direction == SequenceDirection::StartUp && final_transition;
                    let applied_pose = if apply_delta_z {
                        model.current_pose
                    } else {
                        Pose::identity()
                    };
                    let step_height = if direct_step { 0.0 } else { walk.swing_height };
                    let mut time_to_step = HORIZONTAL_TRANSITION_TIME / walk.step_frequency;
                    if self.first_sequence_execution {
                        time_to_step *= 2.0;
                    }

                    let target = poser.leg_posers[id].target_tip_position;
                    progress = poser.leg_posers[id].step_to_position(
                        &model.legs[id],
                        target,
                        applied_pose,
                        step_height,
                        time_to_step,
                        apply_delta_z,
                        self.time_delta,
                    );
                    let desired = poser.leg_posers[id].current_tip_position;
                    model.legs[id].desired_tip_position = desired;
                    let limit_proximity = model.legs[id].apply_ik(&desired);
                    let exceeded_workspace = limit_proximity < safety_factor;

                    // Freeze a leg that came too close to its limits and
                    // flag the transition as incomplete
                    if self.first_sequence_execution && exceeded_workspace {
                        warn!(
                            leg = model.legs[id].name,
                            limit_proximity, "leg stopped at workspace safety margin"
                        );
                        poser.leg_posers[id].target_tip_position =
                            poser.leg_posers[id].current_tip_position;
                        progress = poser.leg_posers[id].reset_step_to_position();
                        self.proximity_alert = true;
                    }

                    if progress == PROGRESS_COMPLETE {
                        poser.leg_posers[id].leg_completed_step = true;
                        self.legs_completed_step += 1;
                        if self.first_sequence_execution {
                            let leg_poser = &mut poser.leg_posers[id];
                            let achieved = if exceeded_workspace {
                                leg_poser.current_tip_position
                            } else {
                                leg_poser.target_tip_position
                            };
                            leg_poser.add_transition_position(achieved);
                        }
                    }
                } else {
                    self.legs_completed_step += 1;
                    poser.leg_posers[id].leg_completed_step = true;
                }
            }

            normalised_progress = if direct_step {
                progress / self.transition_step_count.max(1)
            } else {
                (progress / 2 + if self.current_group == 0 { 0 } else { 50 })
                    / self.transition_step_count.max(1)
            };

            if self.legs_completed_step == model.leg_count() {
                self.set_target = true;
                self.legs_completed_step = 0;
                if self.current_group == 1 || direct_step {
                    self.current_group = 0;
                    self.transition_step = next_transition_step;
                    self.horizontal_transition_complete = !self.proximity_alert;
                    sequence_complete = final_transition;
                    self.proximity_alert = false;
                } else {
                    self.current_group = 1;
                }
            }
        } else {
            // Vertical transition: all legs move simultaneously, z only
            if self.set_target {
                self.set_target = false;
                debug!(step = self.transition_step, "vertical transition step");
                for id in 0..model.leg_count() {
                    let leg_poser = &mut poser.leg_posers[id];
                    let mut target = if leg_poser.has_transition_position(next_transition_step) {
                        leg_poser.transition_position(next_transition_step)
                    } else {
                        walk.leg_steppers[id].default_tip_position
                    };
                    let current = model.legs[id].current_tip_position;
                    target.x = current.x;
                    target.y = current.y;
                    leg_poser.target_tip_position = target;
                }
            }

            let mut all_legs_within_workspace = true;
            for id in 0..model.leg_count() {
                let apply_delta_z = direction == SequenceDirection::StartUp && final_transition;
                let applied_pose = if apply_delta_z {
                    model.current_pose
                } else {
                    Pose::identity()
                };
                let mut time_to_step = VERTICAL_TRANSITION_TIME / walk.step_frequency;
                if self.first_sequence_execution {
                    time_to_step *= 2.0;
                }

                let target = poser.leg_posers[id].target_tip_position;
                progress = poser.leg_posers[id].step_to_position(
                    &model.legs[id],
                    target,
                    applied_pose,
                    0.0,
                    time_to_step,
                    apply_delta_z,
                    self.time_delta,
                );
                let desired = poser.leg_posers[id].current_tip_position;
                model.legs[id].desired_tip_position = desired;
                let limit_proximity = model.legs[id].apply_ik(&desired);
                if limit_proximity < safety_factor {
                    warn!(
                        leg = model.legs[id].name,
                        limit_proximity, "leg at workspace safety margin in vertical step"
                    );
                    all_legs_within_workspace = false;
                }
            }

            if (!all_legs_within_workspace && self.first_sequence_execution)
                || progress == PROGRESS_COMPLETE
            {
                for id in 0..model.leg_count() {
                    progress = poser.leg_posers[id].reset_step_to_position();
                    if self.first_sequence_execution {
                        let leg_poser = &mut poser.leg_posers[id];
                        let achieved = if all_legs_within_workspace {
                            leg_poser.target_tip_position
                        } else {
                            leg_poser.current_tip_position
                        };
                        leg_poser.add_transition_position(achieved);
                    }
                }

                self.vertical_transition_complete = all_legs_within_workspace;
                self.proximity_alert = !all_legs_within_workspace || self.proximity_alert;
                self.transition_step = next_transition_step;
                sequence_complete = final_transition;
                self.set_target = true;
            }

            normalised_progress = progress / self.transition_step_count.max(1);
        }

        // The discovered sequence grows until the first execution finishes
        if self.first_sequence_execution {
            self.transition_step_count = self.transition_step;
        }

        if self.transition_step > TRANSITION_STEP_THRESHOLD {
            return Err(ControlError::TransitionBudgetExceeded {
                steps: self.transition_step,
                threshold: TRANSITION_STEP_THRESHOLD,
            });
        }

        if sequence_complete {
            self.set_target = true;
            self.vertical_transition_complete = false;
            self.horizontal_transition_complete = false;
            self.first_sequence_execution = false;
            Ok(PROGRESS_COMPLETE)
        } else {
            let total = (total_progress + normalised_progress).min(PROGRESS_COMPLETE - 1);
            Ok(if self.first_sequence_execution { -1 } else { total })
        }
    }

    /// Move every leg simultaneously and directly to its default walking
    /// tip position, over the configured `time_to_start`.
    pub fn direct_startup(
        &mut self,
        model: &mut Model,
        walk: &WalkController,
        poser: &mut PoseController,
    ) -> i32 {
        let mut progress = 0;
        for id in 0..model.leg_count() {
            let default_tip_position = walk.leg_steppers[id].default_tip_position;
            progress = poser.leg_posers[id].step_to_position(
                &model.legs[id],
                default_tip_position,
                model.current_pose,
                0.0,
                self.time_to_start,
                false,
                self.time_delta,
            );
            let desired = poser.leg_posers[id].current_tip_position;
            model.legs[id].desired_tip_position = desired;
            model.legs[id].apply_ik(&desired);
        }
        progress
    }

    /// Step the legs to the default stance in tripod coordination, half
    /// the legs at a time. Invalidates the cached transition sequence.
    pub fn step_to_new_stance(
        &mut self,
        model: &mut Model,
        walk: &WalkController,
        poser: &mut PoseController,
    ) -> i32 {
        let leg_count = model.leg_count();
        let mut progress = 0;
        for id in 0..leg_count {
            if model.legs[id].group != self.current_group {
                continue;
            }
            let step_height = walk.swing_height;
            let step_time = 1.0 / walk.step_frequency;
            let target = walk.leg_steppers[id].default_tip_position;
            progress = poser.leg_posers[id].step_to_position(
                &model.legs[id],
                target,
                model.current_pose,
                step_height,
                step_time,
                false,
                self.time_delta,
            );
            let desired = poser.leg_posers[id].current_tip_position;
            model.legs[id].desired_tip_position = desired;
            model.legs[id].apply_ik(&desired);
            self.legs_completed_step += usize::from(progress == PROGRESS_COMPLETE);
        }

        progress = progress / 2 + self.current_group as i32 * 50;
        self.current_group = self.legs_completed_step / (leg_count / 2);

        if self.legs_completed_step == leg_count {
            self.legs_completed_step = 0;
            self.current_group = 0;
        }

        self.reset_transition_sequence = true;
        progress
    }

    /// Fold every leg into its packed joint configuration.
    pub fn pack_legs(
        &mut self,
        time_to_pack: f64,
        model: &mut Model,
        poser: &mut PoseController,
    ) -> i32 {
        self.transition_step = 0;
        let mut progress = 0;
        for id in 0..model.leg_count() {
            let targets: Vec<f64> = model.legs[id]
                .joints
                .iter()
                .map(|joint| joint.packed_position)
                .collect();
            progress = poser.leg_posers[id].move_to_joint_position(
                &mut model.legs[id],
                &targets,
                time_to_pack,
                self.time_delta,
            );
        }
        progress
    }

    /// Deploy every leg to its unpacked joint configuration.
    pub fn unpack_legs(
        &mut self,
        time_to_unpack: f64,
        model: &mut Model,
        poser: &mut PoseController,
    ) -> i32 {
        let mut progress = 0;
        for id in 0..model.leg_count() {
            let targets: Vec<f64> = model.legs[id]
                .joints
                .iter()
                .map(|joint| joint.unpacked_position)
                .collect();
            progress = poser.leg_posers[id].move_to_joint_position(
                &mut model.legs[id],
                &targets,
                time_to_unpack,
                self.time_delta,
            );
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;

    fn setup() -> (Model, WalkController, PoseController, SequenceEngine) {
        let params = Parameters::default();
        let mut model = Model::new(&params);
        let walk = WalkController::new(&mut model, &params).unwrap();
        let poser = PoseController::new(&params, &model, &walk);
        let sequence = SequenceEngine::new(&params);
        (model, walk, poser, sequence)
    }

    /// Run a sequence to completion, collecting per-tick tip positions.
    fn run_sequence(
        direction: SequenceDirection,
        model: &mut Model,
        walk: &WalkController,
        poser: &mut PoseController,
        sequence: &mut SequenceEngine,
    ) -> Vec<Vec<nalgebra::Vector3<f64>>> {
        let mut traces = vec![Vec::new(); model.leg_count()];
        for _ in 0..5000 {
            let progress = sequence.execute(direction, model, walk, poser).unwrap();
            for (id, trace) in traces.iter_mut().enumerate() {
                trace.push(model.legs[id].current_tip_position);
            }
            if progress == PROGRESS_COMPLETE {
                return traces;
            }
        }
        panic!("sequence did not complete");
    }

    #[test]
    fn test_startup_discovery_reaches_default_stance() {
        let (mut model, walk, mut poser, mut sequence) = setup();

        run_sequence(
            SequenceDirection::StartUp,
            &mut model,
            &walk,
            &mut poser,
            &mut sequence,
        );

        for leg in &model.legs {
            let target = walk.leg_steppers[leg.id].default_tip_position;
            assert!(
                (leg.current_tip_position - target).norm() < 1e-6,
                "leg {} ended at {:?} instead of {:?}",
                leg.name,
                leg.current_tip_position.as_slice(),
                target.as_slice()
            );
        }
    }

    #[test]
    fn test_progress_is_minus_one_during_discovery() {
        let (mut model, walk, mut poser, mut sequence) = setup();

        let progress = sequence
            .execute(SequenceDirection::StartUp, &mut model, &walk, &mut poser)
            .unwrap();
        assert_eq!(progress, -1);
    }

    #[test]
    fn test_replay_matches_discovered_trace() {
        let (mut model, walk, mut poser, mut sequence) = setup();

        // Discover, then shut down, then start up again from the cache
        run_sequence(
            SequenceDirection::StartUp,
            &mut model,
            &walk,
            &mut poser,
            &mut sequence,
        );
        let cached: Vec<Vec<nalgebra::Vector3<f64>>> = poser
            .leg_posers
            .iter()
            .map(|lp| {
                (0..lp.transition_position_count() as i32)
                    .map(|k| lp.transition_position(k))
                    .collect()
            })
            .collect();

        run_sequence(
            SequenceDirection::ShutDown,
            &mut model,
            &walk,
            &mut poser,
            &mut sequence,
        );
        let replay = run_sequence(
            SequenceDirection::StartUp,
            &mut model,
            &walk,
            &mut poser,
            &mut sequence,
        );

        // The replayed startup passes through every cached position
        for (id, trace) in replay.iter().enumerate() {
            for (k, cached_position) in cached[id].iter().enumerate().skip(1) {
                let reached = trace
                    .iter()
                    .any(|p| (p - cached_position).norm() < 1e-9);
                assert!(
                    reached,
                    "leg {id} never reached cached transition position {k}"
                );
            }
        }

        // And lands exactly on the walker default stance
        for leg in &model.legs {
            let target = walk.leg_steppers[leg.id].default_tip_position;
            assert!((leg.current_tip_position - target).norm() < 1e-9);
        }
    }

    #[test]
    fn test_replay_reports_percentage_progress() {
        let (mut model, walk, mut poser, mut sequence) = setup();

        run_sequence(
            SequenceDirection::StartUp,
            &mut model,
            &walk,
            &mut poser,
            &mut sequence,
        );

        // Shutdown is a replay: progress is a percentage, never -1, and
        // non-decreasing until completion
        let mut last = -1;
        for _ in 0..5000 {
            let progress = sequence
                .execute(SequenceDirection::ShutDown, &mut model, &walk, &mut poser)
                .unwrap();
            assert!(progress >= 0);
            if progress == PROGRESS_COMPLETE {
                return;
            }
            assert!(progress >= last);
            last = progress;
        }
        panic!("shutdown did not complete");
    }

    #[test]
    fn test_unreachable_safety_margin_exceeds_step_budget() {
        let (mut model, walk, mut poser, mut sequence) = setup();
        // A margin no IK solution can satisfy: every discovery step stops
        // where it stands and the sequence can never finish
        sequence.safety_factor_base = (TRANSITION_STEP_THRESHOLD + 2) as f64;

        let max_reach = model.legs[0].coxa_length
            + model.legs[0].femur_length
            + model.legs[0].tibia_length;

        let mut result = Ok(0);
        for _ in 0..20000 {
            result = sequence.execute(SequenceDirection::StartUp, &mut model, &walk, &mut poser);
            match &result {
                Ok(progress) => {
                    assert_ne!(*progress, PROGRESS_COMPLETE);
                    assert!(!sequence.horizontal_transition_complete);
                    // Frozen legs never leave the reachable workspace
                    for leg in &model.legs {
                        let reach = (leg.current_tip_position - leg.root_offset).norm();
                        assert!(reach <= max_reach + 1e-6);
                    }
                }
                Err(_) => break,
            }
        }
        assert!(matches!(
            result,
            Err(ControlError::TransitionBudgetExceeded { .. })
        ));
    }

    #[test]
    fn test_pack_then_unpack_roundtrip() {
        let (mut model, _walk, mut poser, mut sequence) = setup();

        let mut progress = 0;
        for _ in 0..1000 {
            progress = sequence.pack_legs(2.0, &mut model, &mut poser);
            if progress == PROGRESS_COMPLETE {
                break;
            }
        }
        assert_eq!(progress, PROGRESS_COMPLETE);
        for leg in &model.legs {
            for joint in &leg.joints {
                assert!((joint.current_position - joint.packed_position).abs() < 1e-9);
            }
        }

        for _ in 0..1000 {
            progress = sequence.unpack_legs(2.0, &mut model, &mut poser);
            if progress == PROGRESS_COMPLETE {
                break;
            }
        }
        assert_eq!(progress, PROGRESS_COMPLETE);
        for leg in &model.legs {
            for joint in &leg.joints {
                assert!((joint.current_position - joint.unpacked_position).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_direct_startup_reaches_defaults() {
        let (mut model, walk, mut poser, mut sequence) = setup();

        let mut progress = 0;
        for _ in 0..1000 {
            progress = sequence.direct_startup(&mut model, &walk, &mut poser);
            if progress == PROGRESS_COMPLETE {
                break;
            }
        }
        assert_eq!(progress, PROGRESS_COMPLETE);
        for leg in &model.legs {
            let target = walk.leg_steppers[leg.id].default_tip_position;
            assert!((leg.current_tip_position - target).norm() < 1e-6);
        }
    }
}
