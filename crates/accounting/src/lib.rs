//! Privacy accounting and calibration for DP-SGD training.
//!
//! [`Accountant`] converts compositions of Poisson-subsampled Gaussian steps
//! into `(epsilon, delta)` guarantees with either Rényi DP or privacy loss
//! distributions. [`DpsgdTrainingAccountant`] applies it to whole training
//! runs with scheduled batch sizes, and the `calibrate_*` functions invert
//! it to find hyper-parameters that meet a privacy budget.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountants;
pub mod analysis;
pub mod cache;
pub mod calibrate;
pub mod params;
pub mod pld;
pub mod rdp;

pub use accountants::{
    Accountant, AccountantConfig, CompositionSegment, DpAccountantConfig, PldAccountantConfig,
    RdpAccountantConfig,
};
pub use analysis::{interleave_nm_and_bs, DpTrainingAccountant, DpsgdTrainingAccountant};
pub use cache::{CacheStats, MechanismCache, MechanismKey};
pub use calibrate::{
    calibrate_batch_size, calibrate_noise_multiplier, calibrate_noise_multiplier_for_params,
    calibrate_num_updates, CalibrationConfig,
};
pub use params::{DpParams, PrivacyBudget, Sampler, Schedule};
pub use pld::PldAccountant;
pub use rdp::RdpAccountant;

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        calibrate_batch_size, calibrate_noise_multiplier, calibrate_noise_multiplier_for_params,
        calibrate_num_updates, interleave_nm_and_bs, Accountant, AccountantConfig,
        CalibrationConfig, CompositionSegment, DpAccountantConfig, DpParams,
        DpTrainingAccountant, DpsgdTrainingAccountant, PldAccountant, PldAccountantConfig,
        PrivacyBudget, RdpAccountant, RdpAccountantConfig, Sampler, Schedule,
    };
}
