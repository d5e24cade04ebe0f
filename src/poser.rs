use nalgebra as na;
use tracing::debug;

use crate::auto_pose::{AutoPoser, PosingContext, PosingState};
use crate::error::ControlError;
use crate::leg_poser::LegPoser;
use crate::math::{clamp_norm3, Pose};
use crate::model::{LegState, Model};
use crate::params::{Parameters, PosingParams};
use crate::walk::{WalkController, WalkState};

/// An IMU rotation correction larger than this aborts the controller.
pub const STABILITY_THRESHOLD: f64 = 100.0;

/// Axis selection applied to the manual pose each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoseResetMode {
    #[default]
    NoReset,
    ZAndYawReset,
    XYReset,
    PitchRollReset,
    AllReset,
    /// Snap straight to the default pose instead of easing towards it.
    ImmediateAllReset,
}

/// One IMU sample, read non-atomically from the sensing side; a tick of
/// staleness is tolerated.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub orientation: na::UnitQuaternion<f64>,
    pub linear_acceleration: na::Vector3<f64>,
    pub angular_velocity: na::Vector3<f64>,
}

impl Default for ImuSample {
    fn default() -> Self {
        Self {
            orientation: na::UnitQuaternion::identity(),
            linear_acceleration: na::Vector3::zeros(),
            angular_velocity: na::Vector3::zeros(),
        }
    }
}

/// Composes the body pose from up to five contributors per tick: manual
/// joystick posing, inclination compensation, impedance sag compensation,
/// IMU feedback PID, and the programmatic auto posers. The combined pose
/// is applied inversely to every walking leg's tip.
#[derive(Debug)]
pub struct PoseController {
    time_delta: f64,
    posing: PosingParams,

    pub manual_pose: Pose,
    pub inclination_pose: Pose,
    pub impedance_pose: Pose,
    pub imu_pose: Pose,
    pub auto_pose: Pose,
    pub default_pose: Pose,

    pub pose_reset_mode: PoseResetMode,
    pub translation_velocity_input: na::Vector3<f64>,
    pub rotation_velocity_input: na::Vector3<f64>,

    // IMU feedback PID state
    rotation_absement_error: na::Vector3<f64>,
    rotation_position_error: na::Vector3<f64>,
    rotation_velocity_error: na::Vector3<f64>,

    pub auto_posers: Vec<AutoPoser>,
    pub leg_posers: Vec<LegPoser>,
    pub posing_state: PosingState,

    pose_phase: i32,
    pose_phase_length: i32,
    normaliser: f64,
    pose_frequency: f64,
    reference_leg_id: usize,

    recalculate_default_pose: bool,
}

impl PoseController {
    pub fn new(params: &Parameters, model: &Model, walk: &WalkController) -> Self {
        let auto = &params.auto_pose;
        let pose_frequency = auto.pose_frequency;

        // Posing cycle length: slaved to the step cycle, or derived from
        // the configured pose frequency and rounded to whole base cycles.
        let (pose_phase_length, normaliser) = if pose_frequency == -1.0 {
            let base = params.gait.stance_phase + params.gait.swing_phase;
            (
                walk.phase_length,
                walk.phase_length as f64 / base as f64,
            )
        } else {
            let base = auto.pose_phase_length;
            let raw = (1.0 / pose_frequency) / params.time_delta;
            let length = (((raw / base as f64) / 2.0).round() * 2.0) as i32 * base;
            (length.max(base), (length.max(base) / base) as f64)
        };

        let auto_posers = (0..auto.pose_phase_starts.len())
            .map(|i| {
                AutoPoser::new(
                    i,
                    auto.pose_phase_starts[i],
                    auto.pose_phase_ends[i],
                    na::Vector3::new(
                        auto.x_amplitudes[i],
                        auto.y_amplitudes[i],
                        auto.z_amplitudes[i],
                    ),
                    na::Vector3::new(
                        auto.roll_amplitudes[i],
                        auto.pitch_amplitudes[i],
                        auto.yaw_amplitudes[i],
                    ),
                )
            })
            .collect();

        let leg_posers = model
            .legs
            .iter()
            .map(|leg| {
                LegPoser::new(
                    leg.id,
                    auto.pose_negation_phase_starts[leg.id],
                    auto.pose_negation_phase_ends[leg.id],
                    leg.current_tip_position,
                )
            })
            .collect();

        // The auto posing master phase follows the leg with no offset
        let reference_leg_id = params
            .gait
            .offset_multiplier
            .iter()
            .position(|&m| m == 0)
            .unwrap_or(0);

        Self {
            time_delta: params.time_delta,
            posing: params.posing.clone(),
            manual_pose: Pose::identity(),
            inclination_pose: Pose::identity(),
            impedance_pose: Pose::identity(),
            imu_pose: Pose::identity(),
            auto_pose: Pose::identity(),
            default_pose: Pose::identity(),
            pose_reset_mode: PoseResetMode::NoReset,
            translation_velocity_input: na::Vector3::zeros(),
            rotation_velocity_input: na::Vector3::zeros(),
            rotation_absement_error: na::Vector3::zeros(),
            rotation_position_error: na::Vector3::zeros(),
            rotation_velocity_error: na::Vector3::zeros(),
            auto_posers,
            leg_posers,
            posing_state: PosingState::PosingComplete,
            pose_phase: 0,
            pose_phase_length,
            normaliser,
            pose_frequency,
            reference_leg_id,
            recalculate_default_pose: true,
        }
    }

    fn posing_context(&self) -> PosingContext {
        PosingContext {
            phase_length: self.pose_phase_length,
            normaliser: self.normaliser,
            sync_with_step_cycle: self.pose_frequency == -1.0,
            state: self.posing_state,
        }
    }

    /// Compose the current body pose from the enabled contributors, in
    /// order: manual, inclination, impedance, then IMU feedback or auto
    /// posing (mutually exclusive). Writes the result into the model.
    pub fn update_current_pose(
        &mut self,
        model: &mut Model,
        walk: &WalkController,
        imu: &ImuSample,
    ) -> Result<(), ControlError> {
        let mut new_pose = Pose::identity();

        if self.posing.manual_posing {
            self.update_manual_pose();
            new_pose = new_pose.add(&self.manual_pose);
        }

        if self.posing.inclination_posing {
            self.update_inclination_pose(imu, model.standing_height);
            new_pose = new_pose.add(&self.inclination_pose);
        }

        if self.posing.impedance_control {
            self.update_impedance_pose(model);
            new_pose = new_pose.add(&self.impedance_pose);
        }

        if self.posing.imu_posing {
            self.update_imu_pose(imu)?;
            new_pose = new_pose.add(&self.imu_pose);
        } else if self.posing.auto_posing {
            self.update_auto_pose(walk);
            new_pose = new_pose.add(&self.auto_pose);
        }

        model.current_pose = new_pose;
        Ok(())
    }

    /// Apply the composed pose inversely to each walking leg's tip,
    /// swapping the global auto pose for the leg's own negated version.
    pub fn update_stance(&mut self, model: &Model, walk: &WalkController) {
        for leg in &model.legs {
            let stepper = &walk.leg_steppers[leg.id];
            let leg_poser = &mut self.leg_posers[leg.id];

            match leg.state {
                LegState::Walking | LegState::ManualToWalking => {
                    let pose = model
                        .current_pose
                        .remove(&self.auto_pose)
                        .add(&leg_poser.auto_pose);
                    leg_poser.current_tip_position =
                        pose.inverse_transform_vector(&stepper.current_tip_position);
                }
                LegState::Manual | LegState::WalkingToManual => {
                    leg_poser.current_tip_position = stepper.current_tip_position;
                }
            }
        }
    }

    /// Integrate the joystick posing inputs into the manual pose, easing
    /// selected axes back to default per the active reset mode and pinning
    /// each axis at its configured limit.
    pub fn update_manual_pose(&mut self) {
        let translation_position = self.manual_pose.position;
        let rotation_position = self.manual_pose.rotation;

        let default_translation = self.default_pose.position;
        let default_rotation = self.default_pose.euler();

        let max_translation = [
            self.posing.max_translation.x,
            self.posing.max_translation.y,
            self.posing.max_translation.z,
        ];
        let max_rotation = [
            self.posing.max_rotation.roll,
            self.posing.max_rotation.pitch,
            self.posing.max_rotation.yaw,
        ];

        let mut reset_translation = [false; 3];
        let mut reset_rotation = [false; 3];
        match self.pose_reset_mode {
            PoseResetMode::ZAndYawReset => {
                reset_translation[2] = true;
                reset_rotation[2] = true;
            }
            PoseResetMode::XYReset => {
                reset_translation[0] = true;
                reset_translation[1] = true;
            }
            PoseResetMode::PitchRollReset => {
                reset_rotation[0] = true;
                reset_rotation[1] = true;
            }
            PoseResetMode::AllReset => {
                reset_translation = [true; 3];
                reset_rotation = [true; 3];
            }
            PoseResetMode::ImmediateAllReset => {
                self.manual_pose = self.default_pose;
                return;
            }
            PoseResetMode::NoReset => {}
        }

        // Reset modes synthesise a velocity towards the default pose
        let mut translation_input = self.translation_velocity_input;
        let mut rotation_input = self.rotation_velocity_input;
        let rotation_euler = self.manual_pose.euler();
        for i in 0..3 {
            if reset_translation[i] {
                if translation_position[i] < default_translation[i] {
                    translation_input[i] = 1.0;
                } else if translation_position[i] > default_translation[i] {
                    translation_input[i] = -1.0;
                }
            }
            if reset_rotation[i] {
                if rotation_euler[i] < default_rotation[i] {
                    rotation_input[i] = 1.0;
                } else if rotation_euler[i] > default_rotation[i] {
                    rotation_input[i] = -1.0;
                }
            }
        }

        let mut translation_velocity =
            clamp_norm3(translation_input, 1.0) * self.posing.max_translation_velocity;
        let mut rotation_velocity =
            clamp_norm3(rotation_input, 1.0) * self.posing.max_rotation_velocity;

        let new_translation = translation_position + translation_velocity * self.time_delta;
        let new_rotation = rotation_position
            * na::UnitQuaternion::from_euler_angles(
                rotation_velocity.x * self.time_delta,
                rotation_velocity.y * self.time_delta,
                rotation_velocity.z * self.time_delta,
            );
        let new_rotation_euler = {
            let (roll, pitch, yaw) = new_rotation.euler_angles();
            na::Vector3::new(roll, pitch, yaw)
        };

        // Zero each axis velocity where its position limit is reached
        for i in 0..3 {
            let mut translation_limit = translation_velocity[i].signum() * max_translation[i];
            if reset_translation[i]
                && default_translation[i] < max_translation[i]
                && default_translation[i] > -max_translation[i]
            {
                translation_limit = default_translation[i];
            }
            let positive = translation_velocity[i].signum() > 0.0;
            let exceeds_positive = positive && new_translation[i] > translation_limit;
            let exceeds_negative = !positive && new_translation[i] < translation_limit;
            if exceeds_positive || exceeds_negative {
                translation_velocity[i] =
                    (translation_limit - translation_position[i]) / self.time_delta;
            }

            let mut rotation_limit = rotation_velocity[i].signum() * max_rotation[i];
            if reset_rotation[i]
                && default_rotation[i] < max_rotation[i]
                && default_rotation[i] > -max_rotation[i]
            {
                rotation_limit = default_rotation[i];
            }
            let positive = rotation_velocity[i].signum() > 0.0;
            let exceeds_positive = positive && new_rotation_euler[i] > rotation_limit;
            let exceeds_negative = !positive && new_rotation_euler[i] < rotation_limit;
            if exceeds_positive || exceeds_negative {
                rotation_velocity[i] = (rotation_limit - rotation_euler[i]) / self.time_delta;
            }
        }

        self.manual_pose.position = translation_position + translation_velocity * self.time_delta;
        // Composing per-axis rates multiplicatively; combined pitch and
        // roll input leaks a small incidental yaw.
        self.manual_pose.rotation = rotation_position
            * na::UnitQuaternion::from_euler_angles(
                rotation_velocity.x * self.time_delta,
                rotation_velocity.y * self.time_delta,
                rotation_velocity.z * self.time_delta,
            );
    }

    /// Translation-only pose levelling the body load on an incline, from
    /// the IMU orientation with the commanded rotation taken back out.
    pub fn update_inclination_pose(&mut self, imu: &ImuSample, body_height: f64) {
        let compensation_combined = self.manual_pose.rotation * self.auto_pose.rotation;
        let compensation_removed = imu.orientation * compensation_combined.inverse();
        let (roll, pitch, _) = compensation_removed.euler_angles();

        let mut lateral_correction = body_height * roll.tan();
        let mut longitudinal_correction = -body_height * pitch.tan();

        let max_translation_x = self.posing.max_translation.x;
        let max_translation_y = self.posing.max_translation.y;
        longitudinal_correction =
            longitudinal_correction.clamp(-max_translation_x, max_translation_x);
        lateral_correction = lateral_correction.clamp(-max_translation_y, max_translation_y);

        self.inclination_pose.position.x = longitudinal_correction;
        self.inclination_pose.position.y = lateral_correction;
    }

    /// Vertical pose countering body sag reported by the impedance layer.
    pub fn update_impedance_pose(&mut self, model: &Model) {
        let loaded_legs = model.leg_count();
        let average_delta_z: f64 =
            model.legs.iter().map(|leg| leg.delta_z).sum::<f64>() / loaded_legs as f64;

        let max_translation = self.posing.max_translation.z;
        self.impedance_pose.position.z =
            average_delta_z.abs().clamp(-max_translation, max_translation);
    }

    /// Rotation-only pose correcting the difference between the desired
    /// body rotation and the rotation estimated by the IMU, via PID with
    /// an absement integrator and low-pass smoothed angular velocity.
    pub fn update_imu_pose(&mut self, imu: &ImuSample) -> Result<(), ControlError> {
        // Two quaternions describe each orientation; take the nearer one
        let mut target_coords = self.manual_pose.rotation.quaternion().coords;
        let imu_inverse_coords = imu.orientation.inverse().quaternion().coords;
        if target_coords.dot(&imu_inverse_coords) < 0.0 {
            target_coords = -target_coords;
        }
        let target_rotation = na::UnitQuaternion::from_quaternion(na::Quaternion::from_parts(
            target_coords.w,
            target_coords.xyz(),
        ));

        let target_euler = {
            let (roll, pitch, yaw) = target_rotation.euler_angles();
            na::Vector3::new(roll, pitch, yaw)
        };
        let imu_euler = {
            let (roll, pitch, yaw) = imu.orientation.euler_angles();
            na::Vector3::new(roll, pitch, yaw)
        };

        let gains = self.posing.rotation_pid_gains;

        self.rotation_position_error = imu_euler - target_euler;
        self.rotation_absement_error += self.rotation_position_error * self.time_delta;

        let smoothing_factor = 0.15;
        self.rotation_velocity_error = smoothing_factor * imu.angular_velocity
            + (1.0 - smoothing_factor) * self.rotation_velocity_error;

        let mut rotation_correction = -(gains.d * self.rotation_velocity_error
            + gains.p * self.rotation_position_error
            + gains.i * self.rotation_absement_error);

        // No feedback compensation in yaw
        rotation_correction.z = target_euler.z;

        let norm = rotation_correction.norm();
        if norm > STABILITY_THRESHOLD {
            return Err(ControlError::PidInstability {
                norm,
                threshold: STABILITY_THRESHOLD,
            });
        }

        self.imu_pose.rotation = na::UnitQuaternion::from_euler_angles(
            rotation_correction.x,
            rotation_correction.y,
            rotation_correction.z,
        );
        Ok(())
    }

    /// Sum the auto poser contributions at the master phase and refresh
    /// each leg's negated view of the result.
    pub fn update_auto_pose(&mut self, walk: &WalkController) {
        let stepper = &walk.leg_steppers[self.reference_leg_id];
        self.auto_pose = Pose::identity();

        let zero_body_velocity = stepper.stride_vector.norm() == 0.0;
        match walk.walk_state {
            WalkState::Starting | WalkState::Moving => {
                self.posing_state = PosingState::Posing;
            }
            WalkState::Stopping if zero_body_velocity => {
                self.posing_state = PosingState::StopPosing;
            }
            WalkState::Stopped => {
                self.posing_state = PosingState::StopPosing;
            }
            _ => {}
        }

        let sync_with_step_cycle = self.pose_frequency == -1.0;
        let master_phase = if sync_with_step_cycle {
            // The walk phase has already iterated this tick
            stepper.phase + 1
        } else {
            let phase = self.pose_phase;
            self.pose_phase = (self.pose_phase + 1) % self.pose_phase_length;
            phase
        };

        let ctx = self.posing_context();
        let mut posers_complete = 0;
        for poser in &mut self.auto_posers {
            let contribution = poser.update_pose(master_phase, &ctx);
            posers_complete += usize::from(!poser.is_posing());
            self.auto_pose = self.auto_pose.add(&contribution);
        }

        if posers_complete == self.auto_posers.len() {
            self.posing_state = PosingState::PosingComplete;
        }

        let ctx = self.posing_context();
        let global_auto_pose = self.auto_pose;
        for leg_poser in &mut self.leg_posers {
            leg_poser.update_auto_pose(master_phase, &global_auto_pose, &ctx);
        }
    }

    /// Zero-moment default pose: while any leg transitions to or from
    /// manual manipulation, bias the default pose over the loaded tips so
    /// the body stays balanced.
    pub fn calculate_default_pose(&mut self, model: &Model, walk: &WalkController) {
        if model.leg_count() == 1 {
            return;
        }

        let mut legs_loaded = 0usize;
        let mut legs_transitioning = 0usize;
        for leg in &model.legs {
            if leg.state == LegState::Walking || leg.state == LegState::ManualToWalking {
                legs_loaded += 1;
            }
            if leg.state == LegState::ManualToWalking || leg.state == LegState::WalkingToManual {
                legs_transitioning += 1;
            }
        }

        if legs_transitioning != 0 {
            if self.recalculate_default_pose && legs_loaded > 0 {
                let mut zero_moment_offset = na::Vector2::zeros();
                for leg in &model.legs {
                    if leg.state == LegState::Walking || leg.state == LegState::ManualToWalking {
                        let tip = walk.leg_steppers[leg.id].default_tip_position;
                        zero_moment_offset.x += tip.x;
                        zero_moment_offset.y += tip.y;
                    }
                }
                zero_moment_offset /= legs_loaded as f64;
                let max_x = self.posing.max_translation.x;
                let max_y = self.posing.max_translation.y;
                self.default_pose.position.x = zero_moment_offset.x.clamp(-max_x, max_x);
                self.default_pose.position.y = zero_moment_offset.y.clamp(-max_y, max_y);
                self.recalculate_default_pose = false;
                debug!(
                    x = self.default_pose.position.x,
                    y = self.default_pose.position.y,
                    "recalculated zero-moment default pose"
                );
            }
        } else {
            self.recalculate_default_pose = true;
        }
    }
}
