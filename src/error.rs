use thiserror::Error;

/// Errors raised while loading or validating the parameter tree.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Mismatched array length for {field}: expected {expected}, got {got}")]
    LengthMismatch {
        field: String,
        expected: usize,
        got: usize,
    },
}

/// Fatal control-layer errors.
///
/// These abort the controller; the recoverable conditions (proximity
/// alerts, out-of-range velocity inputs) are absorbed where they occur and
/// never surface as an error value.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Infeasible stance geometry: {0}")]
    GeometryInfeasible(String),

    #[error("Transition sequence exceeded safe step budget: {steps} > {threshold}")]
    TransitionBudgetExceeded { steps: i32, threshold: i32 },

    #[error("IMU rotation compensation unstable: correction norm {norm:.4} > {threshold:.4}")]
    PidInstability { norm: f64, threshold: f64 },
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_error_display() {
        let err = ControlError::TransitionBudgetExceeded {
            steps: 25,
            threshold: 20,
        };
        assert_eq!(
            err.to_string(),
            "Transition sequence exceeded safe step budget: 25 > 20"
        );

        let err = ControlError::GeometryInfeasible("footprint radius is negative".into());
        assert!(err.to_string().contains("footprint radius"));
    }

    #[test]
    fn test_config_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ConfigError = io.into();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
