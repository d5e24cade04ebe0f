use nalgebra as na;
use tracing::info;

use crate::error::ControlError;
use crate::leg_poser::PROGRESS_COMPLETE;
use crate::math::Pose;
use crate::model::{LegState, Model};
use crate::params::Parameters;
use crate::poser::{ImuSample, PoseController, PoseResetMode};
use crate::sequence::{SequenceDirection, SequenceEngine};
use crate::walk::WalkController;

/// Top-level operating state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Legs stowed; the controller is idle.
    Packed,
    /// Running the startup transition sequence.
    StartingUp,
    /// Walking and posing normally.
    Operational,
    /// Running the shutdown transition sequence.
    ShuttingDown,
}

/// Everything the controller reads in one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    /// Normalised desired body velocity in the x/y plane, magnitude <= 1.
    pub linear_velocity: na::Vector2<f64>,
    /// Normalised desired yaw rate, in [-1, 1].
    pub angular_velocity: f64,
    pub imu: ImuSample,
    pub pose_translation_input: na::Vector3<f64>,
    pub pose_rotation_input: na::Vector3<f64>,
    pub pose_reset_mode: PoseResetMode,
}

impl Default for TickInput {
    fn default() -> Self {
        Self {
            linear_velocity: na::Vector2::zeros(),
            angular_velocity: 0.0,
            imu: ImuSample::default(),
            pose_translation_input: na::Vector3::zeros(),
            pose_rotation_input: na::Vector3::zeros(),
            pose_reset_mode: PoseResetMode::NoReset,
        }
    }
}

/// Everything the controller produces in one tick.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub system_state: SystemState,
    /// The composed body pose, for visualisation.
    pub body_pose: Pose,
    /// Desired tip position per leg, in the body frame.
    pub leg_tip_positions: Vec<na::Vector3<f64>>,
    /// Desired joint angles per leg (coxa, femur, tibia).
    pub joint_positions: Vec<[f64; 3]>,
    /// Transition progress in [-1, 100]; complete outside transitions.
    pub transition_progress: i32,
}

/// One-tick scheduler tying the engines together.
///
/// Each tick runs, in strict order: input read, walk cycle update, pose
/// composition, stance posing, and the per-leg IK apply. Collaborators are
/// all synchronous; there is no internal threading.
#[derive(Debug)]
pub struct LocomotionDriver {
    pub model: Model,
    pub walk: WalkController,
    pub poser: PoseController,
    pub sequence: SequenceEngine,
    pub system_state: SystemState,
}

impl LocomotionDriver {
    pub fn new(params: &Parameters) -> Result<Self, ControlError> {
        let mut model = Model::new(params);
        let walk = WalkController::new(&mut model, params)?;
        let poser = PoseController::new(params, &model, &walk);
        let sequence = SequenceEngine::new(params);
        Ok(Self {
            model,
            walk,
            poser,
            sequence,
            system_state: SystemState::Packed,
        })
    }

    /// Begin the startup transition at the next tick.
    pub fn request_startup(&mut self) {
        if self.system_state == SystemState::Packed {
            self.system_state = SystemState::StartingUp;
        }
    }

    /// Begin the shutdown transition at the next tick.
    pub fn request_shutdown(&mut self) {
        if self.system_state == SystemState::Operational {
            self.system_state = SystemState::ShuttingDown;
        }
    }

    /// Advance the whole controller by one tick.
    pub fn tick(&mut self, input: &TickInput) -> Result<TickOutput, ControlError> {
        let mut transition_progress = PROGRESS_COMPLETE;

        match self.system_state {
            SystemState::Packed => {}
            SystemState::StartingUp => {
                transition_progress = self.sequence.execute(
                    SequenceDirection::StartUp,
                    &mut self.model,
                    &self.walk,
                    &mut self.poser,
                )?;
                if transition_progress == PROGRESS_COMPLETE {
                    info!("startup sequence complete");
                    self.system_state = SystemState::Operational;
                }
            }
            SystemState::ShuttingDown => {
                transition_progress = self.sequence.execute(
                    SequenceDirection::ShutDown,
                    &mut self.model,
                    &self.walk,
                    &mut self.poser,
                )?;
                if transition_progress == PROGRESS_COMPLETE {
                    info!("shutdown sequence complete");
                    self.system_state = SystemState::Packed;
                }
            }
            SystemState::Operational => {
                self.walk
                    .update(&self.model, input.linear_velocity, input.angular_velocity);

                self.poser.translation_velocity_input = input.pose_translation_input;
                self.poser.rotation_velocity_input = input.pose_rotation_input;
                self.poser.pose_reset_mode = input.pose_reset_mode;
                self.poser.calculate_default_pose(&self.model, &self.walk);
                self.poser
                    .update_current_pose(&mut self.model, &self.walk, &input.imu)?;
                self.poser.update_stance(&self.model, &self.walk);

                for id in 0..self.model.leg_count() {
                    let state = self.model.legs[id].state;
                    if state == LegState::Walking || state == LegState::ManualToWalking {
                        let mut tip = self.poser.leg_posers[id].current_tip_position;
                        tip.z -= self.model.legs[id].delta_z;
                        self.model.legs[id].apply_ik(&tip);
                    }
                }
            }
        }

        Ok(TickOutput {
            system_state: self.system_state,
            body_pose: self.model.current_pose,
            leg_tip_positions: self
                .model
                .legs
                .iter()
                .map(|leg| leg.current_tip_position)
                .collect(),
            joint_positions: self
                .model
                .legs
                .iter()
                .map(|leg| {
                    [
                        leg.joints[0].current_position,
                        leg.joints[1].current_position,
                        leg.joints[2].current_position,
                    ]
                })
                .collect(),
            transition_progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walk::WalkState;

    fn operational_driver() -> LocomotionDriver {
        let params = Parameters::default();
        let mut driver = LocomotionDriver::new(&params).unwrap();
        driver.request_startup();
        let input = TickInput::default();
        for _ in 0..5000 {
            driver.tick(&input).unwrap();
            if driver.system_state == SystemState::Operational {
                return driver;
            }
        }
        panic!("driver never became operational");
    }

    #[test]
    fn test_packed_driver_is_inert() {
        let params = Parameters::default();
        let mut driver = LocomotionDriver::new(&params).unwrap();
        let before: Vec<_> = driver
            .model
            .legs
            .iter()
            .map(|l| l.current_tip_position)
            .collect();

        let output = driver.tick(&TickInput::default()).unwrap();
        assert_eq!(output.system_state, SystemState::Packed);
        for (leg, tip) in driver.model.legs.iter().zip(before) {
            assert_eq!(leg.current_tip_position, tip);
        }
    }

    #[test]
    fn test_startup_then_walk_then_stop() {
        let mut driver = operational_driver();

        let forward = TickInput {
            linear_velocity: na::Vector2::new(1.0, 0.0),
            ..Default::default()
        };
        for _ in 0..200 {
            let output = driver.tick(&forward).unwrap();
            assert_eq!(output.leg_tip_positions.len(), 6);
            assert_eq!(output.joint_positions.len(), 6);
        }
        assert_eq!(driver.walk.walk_state, WalkState::Moving);

        let idle = TickInput::default();
        let mut stopped = false;
        for _ in 0..(8 * driver.walk.phase_length) {
            driver.tick(&idle).unwrap();
            if driver.walk.walk_state == WalkState::Stopped {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
    }

    #[test]
    fn test_walk_tips_track_steppers_through_pose() {
        let mut driver = operational_driver();

        let forward = TickInput {
            linear_velocity: na::Vector2::new(1.0, 0.0),
            ..Default::default()
        };
        for _ in 0..150 {
            driver.tick(&forward).unwrap();
        }

        // With no posing input the body pose is identity, so leg tips
        // follow the walk-frame stepper tips directly
        for id in 0..driver.model.leg_count() {
            let walked = driver.walk.leg_steppers[id].current_tip_position;
            let applied = driver.model.legs[id].current_tip_position;
            assert!(
                (walked - applied).norm() < 1e-6,
                "leg {id}: walked {:?} vs applied {:?}",
                walked.as_slice(),
                applied.as_slice()
            );
        }
    }

    #[test]
    fn test_shutdown_returns_to_packed() {
        let mut driver = operational_driver();
        driver.request_shutdown();

        let input = TickInput::default();
        for _ in 0..5000 {
            driver.tick(&input).unwrap();
            if driver.system_state == SystemState::Packed {
                return;
            }
        }
        panic!("driver never returned to Packed");
    }
}
