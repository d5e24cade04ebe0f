//! Demo driver: runs the locomotion controller against the built-in
//! hexapod model through a startup, walk, stop, shutdown cycle, printing
//! periodic state summaries.

use clap::Parser;
use nalgebra as na;

use hexawalk::driver::{LocomotionDriver, SystemState, TickInput};
use hexawalk::walk::WalkState;
use hexawalk::Parameters;

/// Hexapod locomotion controller demo.
#[derive(Parser, Debug)]
#[command(name = "hexawalk")]
#[command(about = "Simulated hexapod walk: startup, walk, stop, shutdown")]
struct Args {
    /// Path to a TOML parameter file; defaults apply when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Number of ticks to walk for once operational.
    #[arg(long, default_value_t = 500)]
    walk_ticks: u32,

    /// Normalised forward velocity command.
    #[arg(long, default_value_t = 1.0)]
    forward: f64,

    /// Normalised yaw rate command.
    #[arg(long, default_value_t = 0.0)]
    turn: f64,

    /// Ticks between state summary lines.
    #[arg(long, default_value_t = 50)]
    print_interval: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let params = match &args.config {
        Some(path) => Parameters::from_file(path)?,
        None => Parameters::default(),
    };
    params.validate()?;

    let mut driver = LocomotionDriver::new(&params)?;
    tracing::info!(
        "controller initialised: phase_length={} workspace_radius={:.4} m max_linear_speed={:.3} m/s",
        driver.walk.phase_length,
        driver.walk.workspace_radius,
        driver.walk.max_linear_speed
    );

    // Startup sequence
    driver.request_startup();
    let idle = TickInput::default();
    let mut ticks = 0u32;
    while driver.system_state != SystemState::Operational {
        let output = driver.tick(&idle)?;
        ticks += 1;
        if ticks % args.print_interval == 0 {
            tracing::info!(ticks, progress = output.transition_progress, "starting up");
        }
    }
    tracing::info!(ticks, "operational");

    // Walk
    let command = TickInput {
        linear_velocity: na::Vector2::new(args.forward, 0.0),
        angular_velocity: args.turn,
        ..Default::default()
    };
    for tick in 0..args.walk_ticks {
        let output = driver.tick(&command)?;
        if tick % args.print_interval == 0 {
            let tip = output.leg_tip_positions[0];
            tracing::info!(
                "tick {tick}: {:?}, front-left tip [{:.3}, {:.3}, {:.3}]",
                driver.walk.walk_state,
                tip.x,
                tip.y,
                tip.z
            );
        }
    }

    // Graceful stop
    let mut stop_ticks = 0u32;
    while driver.walk.walk_state != WalkState::Stopped {
        driver.tick(&idle)?;
        stop_ticks += 1;
        if stop_ticks > 20 * driver.walk.phase_length as u32 {
            tracing::error!("walk failed to stop");
            break;
        }
    }
    tracing::info!(stop_ticks, "stopped");

    // Shutdown sequence
    driver.request_shutdown();
    let mut ticks = 0u32;
    while driver.system_state != SystemState::Packed {
        let output = driver.tick(&idle)?;
        ticks += 1;
        if ticks % args.print_interval == 0 {
            tracing::info!(ticks, progress = output.transition_progress, "shutting down");
        }
    }
    tracing::info!(ticks, "shut down");

    Ok(())
}
