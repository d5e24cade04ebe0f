use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Evaluate a quartic (degree 4) Bezier curve at `t` in [0, 1].
pub fn quartic_bezier(nodes: &[na::Vector3<f64>; 5], t: f64) -> na::Vector3<f64> {
    let s = 1.0 - t;
    nodes[0] * (s * s * s * s)
        + nodes[1] * (4.0 * s * s * s * t)
        + nodes[2] * (6.0 * s * s * t * t)
        + nodes[3] * (4.0 * s * t * t * t)
        + nodes[4] * (t * t * t * t)
}

/// Evaluate the derivative of a quartic Bezier curve at `t` in [0, 1].
///
/// The step cycle integrates this derivative rather than resampling the
/// curve, so the emitted tip velocity is exact at every iteration.
pub fn quartic_bezier_dot(nodes: &[na::Vector3<f64>; 5], t: f64) -> na::Vector3<f64> {
    let s = 1.0 - t;
    ((nodes[1] - nodes[0]) * (s * s * s)
        + (nodes[2] - nodes[1]) * (3.0 * s * s * t)
        + (nodes[3] - nodes[2]) * (3.0 * s * t * t)
        + (nodes[4] - nodes[3]) * (t * t * t))
        * 4.0
}

/// Evaluate a scalar cubic Bezier curve at `t` in [0, 1].
pub fn cubic_bezier(nodes: &[f64; 4], t: f64) -> f64 {
    let s = 1.0 - t;
    nodes[0] * (s * s * s)
        + nodes[1] * (3.0 * s * s * t)
        + nodes[2] * (3.0 * s * t * t)
        + nodes[3] * (t * t * t)
}

/// Wrap an integer into [0, modulus).
pub fn wrap(value: i32, modulus: i32) -> i32 {
    value.rem_euclid(modulus)
}

/// Clamp a vector to a maximum norm, preserving direction.
pub fn clamp_norm2(v: na::Vector2<f64>, max_norm: f64) -> na::Vector2<f64> {
    let norm = v.norm();
    if norm > max_norm && norm > 0.0 {
        v * (max_norm / norm)
    } else {
        v
    }
}

/// Clamp a vector to a maximum norm, preserving direction.
pub fn clamp_norm3(v: na::Vector3<f64>, max_norm: f64) -> na::Vector3<f64> {
    let norm = v.norm();
    if norm > max_norm && norm > 0.0 {
        v * (max_norm / norm)
    } else {
        v
    }
}

/// A rigid body transform: translation plus unit-quaternion rotation.
///
/// Body posing treats poses additively: `add` sums translations and
/// multiplies rotations, `remove` is its inverse. The rotation is
/// renormalised after every product so repeated composition cannot drift
/// off the unit sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: na::Vector3<f64>,
    pub rotation: na::UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(position: na::Vector3<f64>, rotation: na::UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: na::Vector3::zeros(),
            rotation: na::UnitQuaternion::identity(),
        }
    }

    /// Build a pose from a translation and intrinsic roll/pitch/yaw angles.
    pub fn from_euler(position: na::Vector3<f64>, euler: na::Vector3<f64>) -> Self {
        Self {
            position,
            rotation: na::UnitQuaternion::from_euler_angles(euler.x, euler.y, euler.z),
        }
    }

    /// Roll/pitch/yaw of the rotation component.
    pub fn euler(&self) -> na::Vector3<f64> {
        let (roll, pitch, yaw) = self.rotation.euler_angles();
        na::Vector3::new(roll, pitch, yaw)
    }

    /// Transform a vector from this pose's frame into the parent frame.
    pub fn transform_vector(&self, v: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.rotation * v + self.position
    }

    /// Transform a vector from the parent frame into this pose's frame.
    pub fn inverse_transform_vector(&self, v: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.rotation.inverse() * (v - self.position)
    }

    /// Combine two poses by summing translations and multiplying rotations.
    pub fn add(&self, other: &Pose) -> Pose {
        Pose {
            position: self.position + other.position,
            rotation: renormalised(self.rotation * other.rotation),
        }
    }

    /// Inverse of `add`: subtract the translation and unwind the rotation.
    pub fn remove(&self, other: &Pose) -> Pose {
        Pose {
            position: self.position - other.position,
            rotation: renormalised(self.rotation * other.rotation.inverse()),
        }
    }

    /// Interpolate from identity towards this pose by `ratio` in [0, 1].
    ///
    /// Translation scales linearly; rotation slerps from identity.
    pub fn interpolate(&self, ratio: f64) -> Pose {
        Pose {
            position: self.position * ratio,
            rotation: na::UnitQuaternion::identity().slerp(&self.rotation, ratio),
        }
    }

    pub fn inverse(&self) -> Pose {
        let inv_rotation = self.rotation.inverse();
        Pose {
            position: -(inv_rotation * self.position),
            rotation: inv_rotation,
        }
    }
}

fn renormalised(q: na::UnitQuaternion<f64>) -> na::UnitQuaternion<f64> {
    na::UnitQuaternion::new_normalize(*q.quaternion())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_quartic_bezier_endpoints() {
        let nodes = [
            na::Vector3::new(0.0, 0.0, 0.0),
            na::Vector3::new(1.0, 0.0, 0.0),
            na::Vector3::new(2.0, 1.0, 0.0),
            na::Vector3::new(3.0, 0.0, 0.0),
            na::Vector3::new(4.0, 0.0, 1.0),
        ];

        assert!((quartic_bezier(&nodes, 0.0) - nodes[0]).norm() < EPS);
        assert!((quartic_bezier(&nodes, 1.0) - nodes[4]).norm() < EPS);
    }

    #[test]
    fn test_quartic_bezier_dot_matches_finite_difference() {
        let nodes = [
            na::Vector3::new(0.0, 0.0, 0.0),
            na::Vector3::new(0.5, 0.2, 0.0),
            na::Vector3::new(1.0, 0.4, 0.3),
            na::Vector3::new(1.5, 0.2, 0.1),
            na::Vector3::new(2.0, 0.0, 0.0),
        ];

        let h = 1e-7;
        for i in 1..10 {
            let t = i as f64 / 10.0;
            let numeric = (quartic_bezier(&nodes, t + h) - quartic_bezier(&nodes, t - h)) / (2.0 * h);
            let analytic = quartic_bezier_dot(&nodes, t);
            assert!((numeric - analytic).norm() < 1e-5);
        }
    }

    #[test]
    fn test_cubic_bezier_holds_endpoints() {
        let nodes = [0.3, 0.3, 1.2, 1.2];
        assert!((cubic_bezier(&nodes, 0.0) - 0.3).abs() < EPS);
        assert!((cubic_bezier(&nodes, 1.0) - 1.2).abs() < EPS);
        // Duplicated end nodes give zero end velocity
        let h = 1e-7;
        assert!((cubic_bezier(&nodes, h) - 0.3).abs() < 1e-10);
    }

    #[test]
    fn test_pose_add_remove_roundtrip() {
        let p = Pose::from_euler(
            na::Vector3::new(0.1, -0.2, 0.05),
            na::Vector3::new(0.1, 0.2, -0.3),
        );
        let q = Pose::from_euler(
            na::Vector3::new(-0.03, 0.07, 0.2),
            na::Vector3::new(-0.2, 0.05, 0.1),
        );

        let roundtrip = q.add(&p).remove(&p);
        assert!((roundtrip.position - q.position).norm() < EPS);
        assert!(roundtrip.rotation.angle_to(&q.rotation) < EPS);

        let id = Pose::identity().add(&p).remove(&p);
        assert!(id.position.norm() < EPS);
        assert!(id.rotation.angle_to(&na::UnitQuaternion::identity()) < EPS);
    }

    #[test]
    fn test_pose_interpolate_endpoints() {
        let p = Pose::from_euler(
            na::Vector3::new(0.2, 0.0, 0.1),
            na::Vector3::new(0.0, 0.3, 0.0),
        );

        let start = p.interpolate(0.0);
        assert!(start.position.norm() < EPS);
        assert!(start.rotation.angle_to(&na::UnitQuaternion::identity()) < EPS);

        let end = p.interpolate(1.0);
        assert!((end.position - p.position).norm() < EPS);
        assert!(end.rotation.angle_to(&p.rotation) < EPS);
    }

    #[test]
    fn test_pose_transform_inverse_transform() {
        let p = Pose::from_euler(
            na::Vector3::new(1.0, 2.0, 3.0),
            na::Vector3::new(0.3, -0.1, 0.7),
        );
        let v = na::Vector3::new(0.5, -0.4, 0.2);

        let there_and_back = p.inverse_transform_vector(&p.transform_vector(&v));
        assert!((there_and_back - v).norm() < EPS);

        let inv = p.inverse();
        assert!((inv.transform_vector(&p.transform_vector(&v)) - v).norm() < EPS);
    }

    #[test]
    fn test_wrap_handles_negatives() {
        assert_eq!(wrap(-1, 50), 49);
        assert_eq!(wrap(50, 50), 0);
        assert_eq!(wrap(73, 50), 23);
    }
}
