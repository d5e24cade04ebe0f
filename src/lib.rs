//! Hexapod locomotion controller.
//!
//! Turns desired body velocities into per-leg tip trajectories through a
//! walk-cycle state machine and a C2-smooth tri-quartic Bezier step cycle,
//! composes the body pose from manual, inclination, impedance, IMU and
//! programmatic contributors, and sequences startup/shutdown transitions
//! between the packed and walking stances.

pub mod auto_pose;
pub mod driver;
pub mod error;
pub mod leg_poser;
pub mod math;
pub mod model;
pub mod params;
pub mod poser;
pub mod sequence;
pub mod step;
pub mod walk;

pub use driver::{LocomotionDriver, SystemState, TickInput, TickOutput};
pub use error::{ConfigError, ControlError};
pub use math::Pose;
pub use params::Parameters;
