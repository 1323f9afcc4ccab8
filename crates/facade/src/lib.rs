//! DP-SGD training support.
//!
//! Re-exports the accounting and core crates and adds a serializable
//! [`DpTrainingConfig`] that resolves into a ready-to-use
//! [`DpTrainingSetup`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod training;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dpsgd_accounting as accounting;
pub use dpsgd_core as core;

pub use dpsgd_accounting::{
    calibrate_batch_size, calibrate_noise_multiplier, calibrate_noise_multiplier_for_params,
    calibrate_num_updates, interleave_nm_and_bs, Accountant, AccountantConfig,
    CalibrationConfig, CompositionSegment, DpAccountantConfig, DpParams, DpTrainingAccountant,
    DpsgdTrainingAccountant, PldAccountant, PldAccountantConfig, PrivacyBudget, RdpAccountant,
    RdpAccountantConfig, Sampler, Schedule,
};
pub use config::{BatchingConfig, DpTrainingConfig};
pub use dpsgd_core::{
    AccumulatorState, BatchSchedule, DpError, DpSgdAggregator, NeighboringRelation, Result,
    Tensor, VirtualBatching,
};
pub use training::DpTrainingSetup;

/// Convenience prelude covering common DP-SGD building blocks.
pub mod prelude {
    pub use crate::config::{BatchingConfig, DpTrainingConfig};
    pub use crate::training::DpTrainingSetup;
    pub use dpsgd_accounting::prelude::*;
    pub use dpsgd_core::prelude::*;
}
