use nalgebra as na;

use crate::math::Pose;
use crate::params::Parameters;

pub const LEG_COUNT: usize = 6;

/// Leg designations in id order: front/middle/rear pairs, left then right.
pub const LEG_NAMES: [&str; LEG_COUNT] = ["AL", "AR", "BL", "BR", "CL", "CR"];

/// External state of a leg with respect to the walk/pose controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Walking,
    WalkingToManual,
    ManualToWalking,
    Manual,
}

/// A single revolute joint with travel limits and named configurations.
#[derive(Debug, Clone)]
pub struct Joint {
    pub current_position: f64,
    pub desired_position: f64,
    pub min_position: f64,
    pub max_position: f64,
    pub packed_position: f64,
    pub unpacked_position: f64,
}

impl Joint {
    fn new(min: f64, max: f64, packed: f64, unpacked: f64) -> Self {
        Self {
            current_position: unpacked,
            desired_position: unpacked,
            min_position: min,
            max_position: max,
            packed_position: packed,
            unpacked_position: unpacked,
        }
    }

    /// 1.0 at the centre of travel, 0.0 at either limit.
    fn limit_proximity(&self, position: f64) -> f64 {
        let range = self.max_position - self.min_position;
        if range <= 0.0 {
            return 0.0;
        }
        let margin = (self.max_position - position).min(position - self.min_position);
        (2.0 * margin / range).clamp(0.0, 1.0)
    }
}

/// One leg of the hexapod: coxa yaw joint plus a femur/tibia planar pair.
///
/// Tip positions are expressed in the body frame. The analytic IK clamps
/// both the reachable sphere and the joint limits, reporting how close the
/// solution came to a limit.
#[derive(Debug, Clone)]
pub struct Leg {
    pub id: usize,
    pub name: &'static str,

    /// Front/middle/rear pair index.
    pub pair: usize,

    /// Tripod stepping group (0 or 1).
    pub group: usize,

    /// Absolute yaw of the leg mounting direction in the body frame.
    pub mount_yaw: f64,

    /// Coxa root position in the body frame.
    pub root_offset: na::Vector3<f64>,

    pub coxa_length: f64,
    pub femur_length: f64,
    pub tibia_length: f64,

    /// Coxa, femur (hip lift), tibia (knee bend) joints.
    pub joints: [Joint; 3],

    pub state: LegState,

    /// Vertical offset supplied by the impedance collaborator each tick.
    pub delta_z: f64,

    pub current_tip_position: na::Vector3<f64>,
    pub desired_tip_position: na::Vector3<f64>,
}

impl Leg {
    /// Solve IK for a target tip position in the body frame.
    ///
    /// Joint targets are clamped to their limits, the achieved tip is
    /// recomputed through FK, and the worst-joint limit proximity is
    /// returned (1.0 = centred, 0.0 = at a limit or out of reach).
    pub fn apply_ik(&mut self, target: &na::Vector3<f64>) -> f64 {
        let delta = target - self.root_offset;

        let raw_yaw = delta.y.atan2(delta.x) - self.mount_yaw;
        let yaw = wrap_angle(raw_yaw);

        let horizontal = (delta.x * delta.x + delta.y * delta.y).sqrt() - self.coxa_length;
        let vertical = delta.z;

        let f = self.femur_length;
        let t = self.tibia_length;
        let mut reach = (horizontal * horizontal + vertical * vertical).sqrt();

        let max_reach = f + t - 1e-9;
        let min_reach = (f - t).abs() + 1e-9;
        let mut clamped_reach = false;
        if reach > max_reach {
            reach = max_reach;
            clamped_reach = true;
        } else if reach < min_reach {
            reach = min_reach;
            clamped_reach = true;
        }

        let alpha = vertical.atan2(horizontal);
        let cos_beta = ((f * f + reach * reach - t * t) / (2.0 * f * reach)).clamp(-1.0, 1.0);
        let hip_lift = alpha + cos_beta.acos();

        let cos_interior = ((f * f + t * t - reach * reach) / (2.0 * f * t)).clamp(-1.0, 1.0);
        let knee_bend = std::f64::consts::PI - cos_interior.acos();

        let targets = [yaw, hip_lift, knee_bend];
        let mut proximity: f64 = if clamped_reach { 0.0 } else { 1.0 };
        for (joint, target_position) in self.joints.iter_mut().zip(targets) {
            proximity = proximity.min(joint.limit_proximity(target_position));
            joint.desired_position =
                target_position.clamp(joint.min_position, joint.max_position);
        }

        self.desired_tip_position = *target;
        self.current_tip_position = self.forward_kinematics(
            self.joints[0].desired_position,
            self.joints[1].desired_position,
            self.joints[2].desired_position,
        );
        for joint in &mut self.joints {
            joint.current_position = joint.desired_position;
        }

        proximity
    }

    /// Tip position in the body frame for the given joint angles.
    pub fn forward_kinematics(&self, yaw: f64, hip_lift: f64, knee_bend: f64) -> na::Vector3<f64> {
        // Tibia elevation measured the same way as the femur's lift angle
        let tibia_elevation = hip_lift - (std::f64::consts::PI - knee_bend);

        let radial = self.coxa_length
            + self.femur_length * hip_lift.cos()
            + self.tibia_length * tibia_elevation.cos();
        let height =
            self.femur_length * hip_lift.sin() + self.tibia_length * tibia_elevation.sin();

        let absolute_yaw = self.mount_yaw + yaw;
        self.root_offset
            + na::Vector3::new(radial * absolute_yaw.cos(), radial * absolute_yaw.sin(), height)
    }

    /// Recompute the current tip from the current joint positions.
    pub fn apply_fk(&mut self) {
        self.current_tip_position = self.forward_kinematics(
            self.joints[0].current_position,
            self.joints[1].current_position,
            self.joints[2].current_position,
        );
    }
}

fn wrap_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let wrapped = angle.rem_euclid(two_pi);
    if wrapped > std::f64::consts::PI {
        wrapped - two_pi
    } else {
        wrapped
    }
}

/// The robot model: six legs plus the currently composed body pose.
#[derive(Debug, Clone)]
pub struct Model {
    pub legs: Vec<Leg>,
    pub current_pose: Pose,

    /// Default standing height set by the walk controller during init;
    /// zero until then (the robot starts packed on the ground).
    pub standing_height: f64,
}

impl Model {
    pub fn new(params: &Parameters) -> Self {
        let m = &params.morphology;
        let j = &params.joints;

        let legs = (0..LEG_COUNT)
            .map(|id| {
                let pair = id / 2;
                let left = id % 2 == 0;
                let stance_yaw = m.stance_leg_yaws[pair];
                let mount_yaw = if left {
                    std::f64::consts::FRAC_PI_2 - stance_yaw
                } else {
                    -std::f64::consts::FRAC_PI_2 + stance_yaw
                };
                let root_offset = na::Vector3::new(
                    m.root_radius * mount_yaw.cos(),
                    m.root_radius * mount_yaw.sin(),
                    0.0,
                );
                let yaw_limit = m.yaw_limits[pair];

                let joints = [
                    Joint::new(-yaw_limit, yaw_limit, j.packed_position[0], j.unpacked_position[0]),
                    Joint::new(
                        m.min_max_hip_lift[0],
                        m.min_max_hip_lift[1],
                        j.packed_position[1],
                        j.unpacked_position[1],
                    ),
                    Joint::new(
                        m.min_max_knee_bend[0],
                        m.min_max_knee_bend[1],
                        j.packed_position[2],
                        j.unpacked_position[2],
                    ),
                ];

                let group = (params.gait.offset_multiplier[id].rem_euclid(2)) as usize;

                let mut leg = Leg {
                    id,
                    name: LEG_NAMES[id],
                    pair,
                    group,
                    mount_yaw,
                    root_offset,
                    coxa_length: m.coxa_length,
                    femur_length: m.femur_length,
                    tibia_length: m.tibia_length,
                    joints,
                    state: LegState::Walking,
                    delta_z: 0.0,
                    current_tip_position: na::Vector3::zeros(),
                    desired_tip_position: na::Vector3::zeros(),
                };
                leg.apply_fk();
                leg.desired_tip_position = leg.current_tip_position;
                leg
            })
            .collect();

        Self {
            legs,
            current_pose: Pose::identity(),
            standing_height: 0.0,
        }
    }

    pub fn leg_count(&self) -> usize {
        self.legs.len()
    }

    /// Shortest leg reach with the knee fully bent.
    pub fn min_leg_length(&self) -> f64 {
        let m = &self.legs[0];
        let interior = std::f64::consts::PI - m.joints[2].max_position;
        (m.femur_length * m.femur_length + m.tibia_length * m.tibia_length
            - 2.0 * m.femur_length * m.tibia_length * interior.cos())
        .sqrt()
    }

    /// Longest leg reach with the knee as straight as its limit allows.
    pub fn max_leg_length(&self) -> f64 {
        let m = &self.legs[0];
        let interior = std::f64::consts::PI - m.joints[2].min_position;
        (m.femur_length * m.femur_length + m.tibia_length * m.tibia_length
            - 2.0 * m.femur_length * m.tibia_length * interior.cos())
        .sqrt()
    }

    /// True when the legs are deployed far enough below the body that they
    /// support its weight (transition stepping must then use tripod groups).
    pub fn legs_bearing_load(&self) -> bool {
        if self.standing_height <= 0.0 {
            return false;
        }
        let average_z: f64 = self
            .legs
            .iter()
            .map(|leg| leg.current_tip_position.z)
            .sum::<f64>()
            / self.legs.len() as f64;
        average_z <= -0.5 * self.standing_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model::new(&Parameters::default())
    }

    #[test]
    fn test_ik_fk_roundtrip() {
        let mut m = model();
        let leg = &mut m.legs[0];

        // A reachable target: outward along the mount direction, below body
        let outward = na::Vector3::new(leg.mount_yaw.cos(), leg.mount_yaw.sin(), 0.0);
        let target = leg.root_offset + outward * 0.28 + na::Vector3::new(0.0, 0.0, -0.2);

        let proximity = leg.apply_ik(&target);
        assert!(proximity > 0.0);
        assert!((leg.current_tip_position - target).norm() < 1e-6);
    }

    #[test]
    fn test_ik_clamps_unreachable_target() {
        let mut m = model();
        let leg = &mut m.legs[0];

        let outward = na::Vector3::new(leg.mount_yaw.cos(), leg.mount_yaw.sin(), 0.0);
        let target = leg.root_offset + outward * 2.0;

        let proximity = leg.apply_ik(&target);
        assert!(proximity == 0.0);
        // Achieved tip stays within total leg reach
        let reach = (leg.current_tip_position - leg.root_offset).norm();
        let max = leg.coxa_length + leg.femur_length + leg.tibia_length;
        assert!(reach <= max + 1e-6);
    }

    #[test]
    fn test_proximity_detects_yaw_limit() {
        let mut m = model();
        let leg = &mut m.legs[2]; // middle left, yaw limit 0.5

        let squashed_yaw = leg.mount_yaw + 0.499;
        let target = leg.root_offset
            + na::Vector3::new(squashed_yaw.cos() * 0.3, squashed_yaw.sin() * 0.3, -0.15);
        let proximity = leg.apply_ik(&target);
        assert!(proximity < 0.05, "proximity {proximity} should be near zero");
    }

    #[test]
    fn test_tripod_groups_split_three_three() {
        let m = model();
        let group0 = m.legs.iter().filter(|leg| leg.group == 0).count();
        assert_eq!(group0, 3);
        assert_eq!(m.legs[0].group, 0); // AL
        assert_eq!(m.legs[3].group, 0); // BR
        assert_eq!(m.legs[4].group, 0); // CL
    }

    #[test]
    fn test_legs_bearing_load_requires_standing_height() {
        let mut m = model();
        assert!(!m.legs_bearing_load());

        m.standing_height = 0.3;
        for leg in &mut m.legs {
            leg.current_tip_position.z = -0.25;
        }
        assert!(m.legs_bearing_load());
    }
}
