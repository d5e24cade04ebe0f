use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::LEG_COUNT;

// Serde default functions

const fn default_time_delta() -> f64 {
    0.02
}
const fn default_step_frequency() -> f64 {
    1.0
}
const fn default_step_clearance() -> f64 {
    0.1
}
const fn default_stance_phase() -> i32 {
    2
}
const fn default_swing_phase() -> i32 {
    2
}
const fn default_phase_offset() -> i32 {
    2
}
fn default_offset_multiplier() -> Vec<i32> {
    // Tripod gait: AL, BR, CL step together, AR, BL, CR half a cycle later.
    vec![0, 1, 1, 0, 0, 1]
}
const fn default_unassigned() -> f64 {
    -1.0
}
const fn default_curvature_allowance() -> f64 {
    0.5
}
const fn default_leg_span_scale() -> f64 {
    1.0
}
const fn default_max_curvature_speed() -> f64 {
    0.4
}
const fn default_pose_phase_length() -> i32 {
    4
}
const fn default_time_to_start() -> f64 {
    6.0
}
const fn default_max_translation_velocity() -> f64 {
    0.1
}
const fn default_max_rotation_velocity() -> f64 {
    0.5
}

/// Per-axis translation limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisLimits {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for AxisLimits {
    fn default() -> Self {
        Self {
            x: 0.05,
            y: 0.05,
            z: 0.05,
        }
    }
}

/// Per-axis rotation limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RotationLimits {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Default for RotationLimits {
    fn default() -> Self {
        Self {
            roll: 0.2,
            pitch: 0.2,
            yaw: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGains {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            p: 2.0,
            i: 0.5,
            d: 0.1,
        }
    }
}

/// Step cycle and velocity-limit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkParams {
    /// Step cycle frequency in Hz. Recomputed after phase quantisation.
    #[serde(default = "default_step_frequency")]
    pub step_frequency: f64,

    /// Swing apex height as a ratio of maximum body height.
    #[serde(default = "default_step_clearance")]
    pub step_clearance: f64,

    /// Stance dip depth as a ratio of maximum body height.
    #[serde(default)]
    pub step_depth: f64,

    /// Body height above default tips as a ratio of maximum body height.
    /// -1 derives the best value for the configured step clearance.
    #[serde(default = "default_unassigned")]
    pub body_clearance: f64,

    /// Margin reserved for swing-arc curvature when sizing footprints.
    #[serde(default = "default_curvature_allowance")]
    pub step_curvature_allowance: f64,

    /// Scale on the horizontal reach used for default stance spread.
    #[serde(default = "default_leg_span_scale")]
    pub leg_span_scale: f64,

    /// Max body linear acceleration; -1 derives it from the footprint.
    #[serde(default = "default_unassigned")]
    pub max_linear_acceleration: f64,

    /// Slew rate for commanded curvature changes.
    #[serde(default = "default_max_curvature_speed")]
    pub max_curvature_speed: f64,
}

impl Default for WalkParams {
    fn default() -> Self {
        Self {
            step_frequency: default_step_frequency(),
            step_clearance: default_step_clearance(),
            step_depth: 0.0,
            body_clearance: default_unassigned(),
            step_curvature_allowance: default_curvature_allowance(),
            leg_span_scale: default_leg_span_scale(),
            max_linear_acceleration: default_unassigned(),
            max_curvature_speed: default_max_curvature_speed(),
        }
    }
}

/// Gait pattern parameters in base (unnormalised) phase units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaitParams {
    #[serde(default = "default_stance_phase")]
    pub stance_phase: i32,

    #[serde(default = "default_swing_phase")]
    pub swing_phase: i32,

    /// Base phase offset between consecutive stepping groups.
    #[serde(default = "default_phase_offset")]
    pub phase_offset: i32,

    /// Per-leg multiplier on the base phase offset, in leg id order.
    #[serde(default = "default_offset_multiplier")]
    pub offset_multiplier: Vec<i32>,
}

impl Default for GaitParams {
    fn default() -> Self {
        Self {
            stance_phase: default_stance_phase(),
            swing_phase: default_swing_phase(),
            phase_offset: default_phase_offset(),
            offset_multiplier: default_offset_multiplier(),
        }
    }
}

/// Manual / feedback posing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosingParams {
    #[serde(default)]
    pub max_translation: AxisLimits,

    #[serde(default)]
    pub max_rotation: RotationLimits,

    #[serde(default = "default_max_translation_velocity")]
    pub max_translation_velocity: f64,

    #[serde(default = "default_max_rotation_velocity")]
    pub max_rotation_velocity: f64,

    #[serde(default)]
    pub rotation_pid_gains: PidGains,

    #[serde(default)]
    pub manual_posing: bool,

    #[serde(default)]
    pub inclination_posing: bool,

    #[serde(default)]
    pub impedance_control: bool,

    #[serde(default)]
    pub imu_posing: bool,

    #[serde(default)]
    pub auto_posing: bool,
}

impl Default for PosingParams {
    fn default() -> Self {
        Self {
            max_translation: AxisLimits::default(),
            max_rotation: RotationLimits::default(),
            max_translation_velocity: 0.1,
            max_rotation_velocity: 0.5,
            rotation_pid_gains: PidGains::default(),
            manual_posing: true,
            inclination_posing: false,
            impedance_control: false,
            imu_posing: false,
            auto_posing: false,
        }
    }
}

/// Programmatic body-pose oscillation parameters.
///
/// Each index into the phase/amplitude arrays defines one auto poser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPoseParams {
    /// Posing cycle frequency in Hz; -1 syncs posing to the step cycle.
    #[serde(default = "default_unassigned")]
    pub pose_frequency: f64,

    /// Base posing cycle length when not synced to the step cycle.
    #[serde(default = "default_pose_phase_length")]
    pub pose_phase_length: i32,

    #[serde(default)]
    pub pose_phase_starts: Vec<i32>,

    #[serde(default)]
    pub pose_phase_ends: Vec<i32>,

    #[serde(default)]
    pub x_amplitudes: Vec<f64>,
    #[serde(default)]
    pub y_amplitudes: Vec<f64>,
    #[serde(default)]
    pub z_amplitudes: Vec<f64>,
    #[serde(default)]
    pub roll_amplitudes: Vec<f64>,
    #[serde(default)]
    pub pitch_amplitudes: Vec<f64>,
    #[serde(default)]
    pub yaw_amplitudes: Vec<f64>,

    /// Per-leg windows (base phase units) in which the leg negates the
    /// global auto pose during its own swing, in leg id order.
    #[serde(default)]
    pub pose_negation_phase_starts: Vec<i32>,
    #[serde(default)]
    pub pose_negation_phase_ends: Vec<i32>,
}

impl Default for AutoPoseParams {
    fn default() -> Self {
        Self {
            pose_frequency: default_unassigned(),
            pose_phase_length: default_pose_phase_length(),
            pose_phase_starts: vec![2],
            pose_phase_ends: vec![4],
            x_amplitudes: vec![0.0],
            y_amplitudes: vec![0.0],
            z_amplitudes: vec![0.02],
            roll_amplitudes: vec![0.0],
            pitch_amplitudes: vec![0.0],
            yaw_amplitudes: vec![0.0],
            pose_negation_phase_starts: vec![2, 0, 0, 2, 2, 0],
            pose_negation_phase_ends: vec![4, 2, 2, 4, 4, 2],
        }
    }
}

/// Leg geometry shared by all six legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphologyParams {
    pub coxa_length: f64,
    pub femur_length: f64,
    pub tibia_length: f64,

    /// Distance from the body centre to each coxa root.
    pub root_radius: f64,

    /// Stance yaw of the front/middle/rear leg pairs (left side sign).
    pub stance_leg_yaws: [f64; 3],

    /// Yaw travel allowed around the stance yaw, per pair.
    pub yaw_limits: [f64; 3],

    /// Hip (femur) lift angle range; negative is below horizontal.
    pub min_max_hip_lift: [f64; 2],

    /// Knee (tibia) bend angle range.
    pub min_max_knee_bend: [f64; 2],
}

impl Default for MorphologyParams {
    fn default() -> Self {
        Self {
            coxa_length: 0.05,
            femur_length: 0.2,
            tibia_length: 0.27,
            root_radius: 0.15,
            stance_leg_yaws: [0.77, 0.0, -0.77],
            yaw_limits: [0.5, 0.5, 0.5],
            min_max_hip_lift: [-0.6, 1.2],
            min_max_knee_bend: [0.05, 2.6],
        }
    }
}

/// Per-joint configuration positions, identical across legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointParams {
    /// Stowed configuration reached by the shutdown sequence.
    pub packed_position: [f64; 3],

    /// Deployed configuration the startup sequence begins from.
    pub unpacked_position: [f64; 3],
}

impl Default for JointParams {
    fn default() -> Self {
        Self {
            packed_position: [0.0, 1.1, 2.4],
            unpacked_position: [0.0, 0.3, 1.2],
        }
    }
}

/// Startup/shutdown sequencing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceParams {
    /// Time budget for the direct (simultaneous) startup move.
    #[serde(default = "default_time_to_start")]
    pub time_to_start: f64,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            time_to_start: default_time_to_start(),
        }
    }
}

/// The full parameter surface, loaded once at startup and read-only after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default = "default_time_delta")]
    pub time_delta: f64,

    #[serde(default)]
    pub walk: WalkParams,

    #[serde(default)]
    pub gait: GaitParams,

    #[serde(default)]
    pub posing: PosingParams,

    #[serde(default)]
    pub auto_pose: AutoPoseParams,

    #[serde(default)]
    pub morphology: MorphologyParams,

    #[serde(default)]
    pub joints: JointParams,

    #[serde(default)]
    pub sequence: SequenceParams,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            time_delta: default_time_delta(),
            walk: WalkParams::default(),
            gait: GaitParams::default(),
            posing: PosingParams::default(),
            auto_pose: AutoPoseParams::default(),
            morphology: MorphologyParams::default(),
            joints: JointParams::default(),
            sequence: SequenceParams::default(),
        }
    }
}

impl Parameters {
    /// Load and validate parameters from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let params: Self = toml::from_str(&content)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &str, value: f64) -> Result<(), ConfigError> {
            if value <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    message: format!("{value} must be > 0"),
                });
            }
            Ok(())
        }

        positive("time_delta", self.time_delta)?;
        positive("walk.step_frequency", self.walk.step_frequency)?;
        positive("morphology.coxa_length", self.morphology.coxa_length)?;
        positive("morphology.femur_length", self.morphology.femur_length)?;
        positive("morphology.tibia_length", self.morphology.tibia_length)?;

        if !(0.0..1.0).contains(&self.walk.step_clearance) {
            return Err(ConfigError::InvalidValue {
                field: "walk.step_clearance".into(),
                message: format!("{} must be in [0, 1)", self.walk.step_clearance),
            });
        }
        if self.walk.body_clearance != -1.0 && !(0.0..1.0).contains(&self.walk.body_clearance) {
            return Err(ConfigError::InvalidValue {
                field: "walk.body_clearance".into(),
                message: format!("{} must be -1 or in [0, 1)", self.walk.body_clearance),
            });
        }
        if self.gait.stance_phase + self.gait.swing_phase <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "gait.stance_phase".into(),
                message: "stance_phase + swing_phase must be > 0".into(),
            });
        }

        if self.gait.offset_multiplier.len() != LEG_COUNT {
            return Err(ConfigError::LengthMismatch {
                field: "gait.offset_multiplier".into(),
                expected: LEG_COUNT,
                got: self.gait.offset_multiplier.len(),
            });
        }

        let poser_count = self.auto_pose.pose_phase_starts.len();
        for (field, len) in [
            ("auto_pose.pose_phase_ends", self.auto_pose.pose_phase_ends.len()),
            ("auto_pose.x_amplitudes", self.auto_pose.x_amplitudes.len()),
            ("auto_pose.y_amplitudes", self.auto_pose.y_amplitudes.len()),
            ("auto_pose.z_amplitudes", self.auto_pose.z_amplitudes.len()),
            ("auto_pose.roll_amplitudes", self.auto_pose.roll_amplitudes.len()),
            ("auto_pose.pitch_amplitudes", self.auto_pose.pitch_amplitudes.len()),
            ("auto_pose.yaw_amplitudes", self.auto_pose.yaw_amplitudes.len()),
        ] {
            if len != poser_count {
                return Err(ConfigError::LengthMismatch {
                    field: field.into(),
                    expected: poser_count,
                    got: len,
                });
            }
        }

        for (field, len) in [
            (
                "auto_pose.pose_negation_phase_starts",
                self.auto_pose.pose_negation_phase_starts.len(),
            ),
            (
                "auto_pose.pose_negation_phase_ends",
                self.auto_pose.pose_negation_phase_ends.len(),
            ),
        ] {
            if len != LEG_COUNT {
                return Err(ConfigError::LengthMismatch {
                    field: field.into(),
                    expected: LEG_COUNT,
                    got: len,
                });
            }
        }

        Ok(())
    }
}
