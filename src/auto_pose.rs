use nalgebra as na;

use crate::math::{quartic_bezier, Pose};

/// Lifecycle of the programmatic posing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosingState {
    /// Posers contribute on every cycle.
    Posing,
    /// Posers finish the cycle in progress, then stop contributing.
    StopPosing,
    /// All posers have completed their cycles.
    PosingComplete,
}

/// Shared context for evaluating posing windows against the master phase.
#[derive(Debug, Clone, Copy)]
pub struct PosingContext {
    pub phase_length: i32,
    /// Scales window bounds from base phase units to master phase units.
    pub normaliser: f64,
    /// True when the posing cycle is slaved to the step cycle.
    pub sync_with_step_cycle: bool,
    pub state: PosingState,
}

impl PosingContext {
    /// Scale a window bound, mapping zero to the full phase length and
    /// unwrapping windows that straddle the cycle boundary.
    pub fn window(&self, start: i32, end: i32, phase: i32) -> (i32, i32, i32) {
        let mut start = (start as f64 * self.normaliser).round() as i32;
        let mut end = (end as f64 * self.normaliser).round() as i32;
        let mut phase = phase;

        if start == 0 {
            start = self.phase_length;
        }
        if end == 0 {
            end = self.phase_length;
        }
        if start > end {
            end += self.phase_length;
            if phase < start {
                phase += self.phase_length;
            }
        }
        (start, end, phase)
    }
}

/// One time-scheduled body-pose oscillator.
///
/// Over its posing window the contribution rises from zero to the
/// configured amplitudes and falls back, as two half-window quartic Bezier
/// curves with zero value and zero slope at both window edges.
#[derive(Debug, Clone)]
pub struct AutoPoser {
    pub id: usize,

    /// Window bounds in base phase units.
    pub start_phase: i32,
    pub end_phase: i32,

    pub position_amplitude: na::Vector3<f64>,
    pub rotation_amplitude: na::Vector3<f64>,

    start_check: bool,
    end_check: (bool, bool),
    allow_posing: bool,
}

impl AutoPoser {
    pub fn new(
        id: usize,
        start_phase: i32,
        end_phase: i32,
        position_amplitude: na::Vector3<f64>,
        rotation_amplitude: na::Vector3<f64>,
    ) -> Self {
        Self {
            id,
            start_phase,
            end_phase,
            position_amplitude,
            rotation_amplitude,
            start_check: false,
            end_check: (false, false),
            allow_posing: false,
        }
    }

    pub fn is_posing(&self) -> bool {
        self.allow_posing
    }

    pub fn reset_checks(&mut self) {
        self.start_check = false;
        self.end_check = (false, false);
        self.allow_posing = false;
    }

    /// Contribution of this poser at the given master phase.
    ///
    /// The edge checks give one-shot semantics when synced to the step
    /// cycle: posing begins at a window start while the walk is posing and
    /// only ends once a full cycle completes after stopping is requested.
    pub fn update_pose(&mut self, phase: i32, ctx: &PosingContext) -> Pose {
        let (start_phase, end_phase, phase) = ctx.window(self.start_phase, self.end_phase, phase);

        self.start_check = !ctx.sync_with_step_cycle
            || (!self.start_check && ctx.state == PosingState::Posing && phase == start_phase);
        self.end_check.0 =
            self.end_check.0 || (ctx.state == PosingState::StopPosing && phase == start_phase);
        self.end_check.1 = self.end_check.1
            || (ctx.state == PosingState::StopPosing && phase == end_phase && self.end_check.0);

        if !self.allow_posing && self.start_check {
            self.allow_posing = true;
            self.end_check = (false, false);
        } else if self.allow_posing
            && ctx.sync_with_step_cycle
            && self.end_check.0
            && self.end_check.1
        {
            self.allow_posing = false;
            self.start_check = false;
        }

        if phase < start_phase || phase >= end_phase || !self.allow_posing {
            return Pose::identity();
        }

        let iteration = phase - start_phase + 1;
        let num_iterations = end_phase - start_phase;

        let zero = na::Vector3::zeros();
        let mut position_nodes = [zero; 5];
        let mut rotation_nodes = [zero; 5];

        let first_half = iteration <= num_iterations / 2;
        if first_half {
            position_nodes[3] = self.position_amplitude;
            position_nodes[4] = self.position_amplitude;
            rotation_nodes[3] = self.rotation_amplitude;
            rotation_nodes[4] = self.rotation_amplitude;
        } else {
            position_nodes[0] = self.position_amplitude;
            position_nodes[1] = self.position_amplitude;
            rotation_nodes[0] = self.rotation_amplitude;
            rotation_nodes[1] = self.rotation_amplitude;
        }

        let delta_t = 1.0 / (num_iterations as f64 / 2.0);
        let offset = if first_half { 0 } else { num_iterations / 2 };
        let time_input = (iteration - offset) as f64 * delta_t;

        let position = quartic_bezier(&position_nodes, time_input);
        let rotation = quartic_bezier(&rotation_nodes, time_input);

        Pose::from_euler(position, rotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(state: PosingState) -> PosingContext {
        PosingContext {
            phase_length: 50,
            normaliser: 12.5,
            sync_with_step_cycle: true,
            state,
        }
    }

    fn poser() -> AutoPoser {
        AutoPoser::new(
            0,
            2,
            4,
            na::Vector3::new(0.0, 0.0, 0.02),
            na::Vector3::zeros(),
        )
    }

    #[test]
    fn test_rise_and_fall_inside_window() {
        let mut poser = poser();
        let ctx = ctx(PosingState::Posing);

        // Window spans master phases [25, 50); run one full cycle
        let mut peak = 0.0f64;
        let mut at_entry = None;
        for phase in 1..=50 {
            let pose = poser.update_pose(phase, &ctx);
            if phase == 25 {
                at_entry = Some(pose.position.z);
            }
            peak = peak.max(pose.position.z);
        }

        // First in-window evaluation is one iteration in, near zero
        assert!(at_entry.unwrap().abs() < 1e-3);
        // Amplitude is reached mid-window
        assert!((peak - 0.02).abs() < 1e-6);
        // Outside the window the contribution is identity
        let outside = poser.update_pose(10, &ctx);
        assert!(outside.position.norm() < 1e-12);
    }

    #[test]
    fn test_unsynced_poser_is_always_allowed() {
        let mut poser = poser();
        let mut context = ctx(PosingState::PosingComplete);
        context.sync_with_step_cycle = false;

        let pose = poser.update_pose(31, &context);
        assert!(pose.position.z > 0.0);
    }

    #[test]
    fn test_stop_posing_completes_cycle_then_stops() {
        let mut poser = poser();
        let posing = ctx(PosingState::Posing);
        let stopping = ctx(PosingState::StopPosing);

        // Start a cycle normally
        for phase in 1..=30 {
            poser.update_pose(phase, &posing);
        }
        assert!(poser.is_posing());

        // Request a stop mid-cycle: the current cycle still contributes
        let mut saw_contribution = false;
        for phase in 31..=50 {
            let pose = poser.update_pose(phase, &stopping);
            saw_contribution |= pose.position.z.abs() > 1e-9;
        }
        assert!(saw_contribution);

        // One more full cycle is allowed to finish; the end checks latch
        // as its window start and end pass, and posing then shuts off
        for phase in 1..=50 {
            poser.update_pose(phase, &stopping);
        }
        assert!(!poser.is_posing());
        let pose = poser.update_pose(30, &stopping);
        assert!(pose.position.norm() < 1e-12);
    }

    #[test]
    fn test_wrapping_window() {
        let mut poser = AutoPoser::new(
            0,
            3,
            1,
            na::Vector3::new(0.01, 0.0, 0.0),
            na::Vector3::zeros(),
        );
        let ctx = ctx(PosingState::Posing);

        // Window [37.5 -> 38, 12.5 -> 13) wraps the cycle end; the poser
        // starts at its start phase and contributes across the wrap.
        let mut contributed_late = false;
        let mut contributed_early = false;
        for _ in 0..2 {
            for phase in 1..=50 {
                let pose = poser.update_pose(phase, &ctx);
                if phase >= 38 && pose.position.x.abs() > 1e-9 {
                    contributed_late = true;
                }
                if phase < 13 && pose.position.x.abs() > 1e-9 {
                    contributed_early = true;
                }
            }
        }
        assert!(contributed_late);
        assert!(contributed_early);
    }
}
