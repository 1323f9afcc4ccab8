//! Virtual batching across devices and accumulation steps.
//!
//! The logical batch size (the unit that matters for privacy accounting) is
//! decoupled from the micro-batch that is physically processed at every step
//! across all devices. Gradients are accumulated over
//! [`VirtualBatching::apply_update_every`] micro-steps before a parameter
//! update is applied.
//!
//! ```
//! use dpsgd_core::VirtualBatching;
//!
//! let batching = VirtualBatching::new(128, 32, 2).unwrap();
//! assert_eq!(batching.batch_size_per_step(), 64);
//! assert_eq!(batching.apply_update_every(0), 2);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DpError, Result};

/// Piecewise-constant total batch size keyed by step.
///
/// Boundaries are inclusive on the left: at step `b` the batch size declared
/// for boundary `b` is already in effect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBatchSchedule")]
pub struct BatchSchedule {
    init: usize,
    boundaries: Vec<(u64, usize)>,
}

#[derive(Deserialize)]
struct RawBatchSchedule {
    init: usize,
    #[serde(default)]
    boundaries: Vec<(u64, usize)>,
}

impl TryFrom<RawBatchSchedule> for BatchSchedule {
    type Error = DpError;

    fn try_from(raw: RawBatchSchedule) -> Result<Self> {
        Self::new(raw.init, raw.boundaries)
    }
}

impl BatchSchedule {
    /// A schedule that never changes.
    pub fn constant(batch_size: usize) -> Self {
        Self {
            init: batch_size,
            boundaries: Vec::new(),
        }
    }

    /// Build a schedule from an initial size and `(boundary_step, batch_size)`
    /// change points.
    ///
    /// Boundaries must be strictly increasing and positive; step zero always
    /// uses `init`.
    pub fn new(init: usize, boundaries: Vec<(u64, usize)>) -> Result<Self> {
        if init == 0 {
            return Err(DpError::invalid("initial batch size must be positive"));
        }
        let mut prev = 0u64;
        for &(step, size) in &boundaries {
            if step <= prev {
                return Err(DpError::invalid(format!(
                    "schedule boundaries must be strictly increasing and positive, got {step} after {prev}"
                )));
            }
            if size == 0 {
                return Err(DpError::invalid(format!(
                    "batch size at boundary {step} must be positive"
                )));
            }
            prev = step;
        }
        Ok(Self { init, boundaries })
    }

    /// Build a schedule from multiplicative scale factors.
    ///
    /// Each entry `boundary -> scale` multiplies the running batch size from
    /// `boundary` onwards, so `{100: 2, 200: 4}` on an initial size of 8
    /// yields 8, then 16 from step 100, then 64 from step 200. A scale at
    /// step zero applies to `init` itself.
    pub fn from_scale_factors(init: usize, scales: &BTreeMap<u64, u64>) -> Result<Self> {
        let mut size = init;
        let mut first = init;
        let mut boundaries = Vec::with_capacity(scales.len());
        for (&step, &scale) in scales {
            if scale == 0 {
                return Err(DpError::invalid(format!(
                    "scale factor at boundary {step} must be positive"
                )));
            }
            size = usize::try_from(scale)
                .ok()
                .and_then(|s| size.checked_mul(s))
                .ok_or_else(|| {
                    DpError::invalid(format!("batch size overflows at boundary {step}"))
                })?;
            if step == 0 {
                first = size;
            } else {
                boundaries.push((step, size));
            }
        }
        Self::new(first, boundaries)
    }

    /// Batch size at step zero.
    pub fn init(&self) -> usize {
        self.init
    }

    /// Declared change points, excluding step zero.
    pub fn boundaries(&self) -> &[(u64, usize)] {
        &self.boundaries
    }

    /// Every batch size the schedule can take, in order of appearance.
    pub fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.init).chain(self.boundaries.iter().map(|(_, s)| *s))
    }

    /// Change points including step zero.
    pub fn change_points(&self) -> Vec<(u64, usize)> {
        let mut points = Vec::with_capacity(self.boundaries.len() + 1);
        points.push((0, self.init));
        points.extend_from_slice(&self.boundaries);
        points
    }

    /// Evaluate the schedule at `step`.
    pub fn batch_size(&self, step: u64) -> usize {
        let idx = self.boundaries.partition_point(|(b, _)| *b <= step);
        if idx == 0 {
            self.init
        } else {
            self.boundaries[idx - 1].1
        }
    }

    /// Whether the batch size ever changes.
    pub fn is_constant(&self) -> bool {
        self.sizes().all(|s| s == self.init)
    }
}

/// Batching across devices and steps with an optional batch-size schedule.
///
/// Immutable after construction; every query is a pure function of the
/// global step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualBatching {
    batch_size_per_device_per_step: usize,
    num_devices: usize,
    schedule: BatchSchedule,
}

impl VirtualBatching {
    /// Constant total batch size of `batch_size_init`.
    pub fn new(
        batch_size_init: usize,
        batch_size_per_device_per_step: usize,
        num_devices: usize,
    ) -> Result<Self> {
        Self::with_schedule(
            BatchSchedule::constant(batch_size_init),
            batch_size_per_device_per_step,
            num_devices,
        )
    }

    /// Total batch size following `schedule`.
    ///
    /// Every size the schedule declares must be a multiple of
    /// `batch_size_per_device_per_step * num_devices`.
    pub fn with_schedule(
        schedule: BatchSchedule,
        batch_size_per_device_per_step: usize,
        num_devices: usize,
    ) -> Result<Self> {
        if batch_size_per_device_per_step == 0 {
            return Err(DpError::invalid(
                "batch_size_per_device_per_step must be positive",
            ));
        }
        if num_devices == 0 {
            return Err(DpError::invalid("num_devices must be positive"));
        }
        let per_step = batch_size_per_device_per_step
            .checked_mul(num_devices)
            .ok_or_else(|| DpError::invalid("batch size per step overflows"))?;

        for size in schedule.sizes() {
            if size == 0 || size % per_step != 0 {
                return Err(DpError::invalid(format!(
                    "batch size {size} not divisible by \
                     {batch_size_per_device_per_step} * {num_devices}"
                )));
            }
        }

        debug!(
            batch_size_init = schedule.init(),
            batch_size_per_step = per_step,
            num_boundaries = schedule.boundaries().len(),
            "virtual batching configured"
        );

        Ok(Self {
            batch_size_per_device_per_step,
            num_devices,
            schedule,
        })
    }

    /// Initial total batch size.
    pub fn batch_size_init(&self) -> usize {
        self.schedule.init()
    }

    /// Per-device micro-batch size.
    pub fn batch_size_per_device_per_step(&self) -> usize {
        self.batch_size_per_device_per_step
    }

    /// Number of devices processing micro-batches in parallel.
    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// The underlying batch-size schedule.
    pub fn schedule(&self) -> &BatchSchedule {
        &self.schedule
    }

    /// Total batch size at `global_step`.
    pub fn batch_size(&self, global_step: u64) -> usize {
        self.schedule.batch_size(global_step)
    }

    /// Data processed in one micro-step across all devices.
    pub fn batch_size_per_step(&self) -> usize {
        self.batch_size_per_device_per_step * self.num_devices
    }

    /// Micro-steps to accumulate before applying an update. Always >= 1.
    pub fn apply_update_every(&self, global_step: u64) -> usize {
        self.batch_size(global_step) / self.batch_size_per_step()
    }

    /// Total number of examples processed up to `global_step`.
    pub fn data_seen(&self, global_step: u64) -> u64 {
        global_step.saturating_mul(self.batch_size_per_step() as u64)
    }
}
