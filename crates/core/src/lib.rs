//! Core DP-SGD primitives.
//!
//! This crate provides the framework-agnostic pieces consumed by a training
//! loop: the error taxonomy, virtual batching across devices and
//! accumulation steps, per-example clipping, and noise injection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batching;
pub mod clipping;
pub mod error;
pub mod noise;

pub use batching::{BatchSchedule, VirtualBatching};
pub use clipping::{clip_and_sum, clip_gradient, l2_norm, ClipReport, NeighboringRelation, Tensor};
pub use error::{DpError, Result};
pub use noise::{add_gaussian_noise, AccumulatorState, DpSgdAggregator};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        add_gaussian_noise, clip_and_sum, clip_gradient, l2_norm, AccumulatorState,
        BatchSchedule, ClipReport, DpError, DpSgdAggregator, NeighboringRelation, Result,
        Tensor, VirtualBatching,
    };
}
