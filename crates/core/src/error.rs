//! Error types for DP-SGD setup and privacy accounting.

/// Errors that can occur while configuring or accounting a DP training run.
///
/// None of these are retried internally. They indicate a misconfiguration
/// that the caller must resolve before training starts.
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// Malformed or out-of-domain input.
    #[error("invalid parameter: {msg}")]
    InvalidParameter {
        /// Human-readable error description.
        msg: String,
    },

    /// The accounting computation cannot produce a reliable answer.
    #[error("numerical instability: {msg}")]
    NumericalInstability {
        /// Human-readable error description.
        msg: String,
    },

    /// A calibration search did not converge or its target is infeasible.
    #[error("calibration failed: {msg}")]
    CalibrationFailed {
        /// Human-readable error description.
        msg: String,
    },

    /// Unsupported accountant or feature combination.
    #[error("unsupported feature: {msg}")]
    Unsupported {
        /// Human-readable error description.
        msg: String,
    },

    /// Configuration document could not be read.
    #[error("configuration error: {msg}")]
    Config {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for DP operations.
pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// Create an invalid parameter error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter { msg: msg.into() }
    }

    /// Create a numerical instability error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::NumericalInstability { msg: msg.into() }
    }

    /// Create a calibration failure.
    pub fn calibration<S: Into<String>>(msg: S) -> Self {
        Self::CalibrationFailed { msg: msg.into() }
    }

    /// Create an unsupported feature error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported { msg: msg.into() }
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config { msg: msg.into() }
    }

    /// Whether this error reports an out-of-domain input.
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(self, Self::InvalidParameter { .. })
    }

    /// Whether this error reports a failed calibration.
    pub fn is_calibration_failure(&self) -> bool {
        matches!(self, Self::CalibrationFailed { .. })
    }

    /// Whether this error reports numerical instability.
    pub fn is_numerical_instability(&self) -> bool {
        matches!(self, Self::NumericalInstability { .. })
    }
}
