//! Execution mode selection.
//!
//! This module defines how the heavy tensor kernels (`dot` and `conv2d`) run
//! and provides functions to set and get the current mode.
//!
//! # Modes
//!
//! - `Sequential`: every kernel runs on the calling thread (default).
//! - `Parallel`: kernels split their output rows across the `rayon` pool.
//!
//! Each output element is computed by exactly one thread in either mode, so
//! results are bit-identical. Training control flow stays single-threaded;
//! only the inner loops of a kernel fan out.
//!
//! The mode is stored globally using an `AtomicU8`.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// How tensor kernels are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Execution {
    /// Plain loops on the calling thread (default).
    #[default]
    Sequential = 0,
    /// Row-parallel loops on the global `rayon` pool.
    Parallel,
}

impl TryFrom<u8> for Execution {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Sequential),
            1 => Ok(Self::Parallel),
            _ => Err(()),
        }
    }
}

static GLOBAL_EXECUTION: AtomicU8 = AtomicU8::new(Execution::Sequential as u8);

/// Sets the execution mode used by subsequent tensor kernels.
///
/// # Example
///
/// ```
/// use handgrad::backend::{set_execution, Execution};
/// set_execution(Execution::Parallel);
/// # set_execution(Execution::Sequential);
/// ```
pub fn set_execution(mode: Execution) {
    GLOBAL_EXECUTION.store(mode as u8, Ordering::Release);
}

/// Returns the current execution mode.
///
/// If the stored value is invalid, defaults to [`Execution::Sequential`].
pub fn get_execution() -> Execution {
    Execution::try_from(GLOBAL_EXECUTION.load(Ordering::Acquire)).unwrap_or_default()
}
