use thiserror::Error;

use crate::tags::Pin;

/// Failures the core reports rather than absorbs.
///
/// A tag that simply has no value is not an error: reads return `None` and the
/// corresponding snapshot field keeps its previous value.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// The tag store rejected or failed a digital output write.
    #[error("write to output {pin} failed: {reason}")]
    WriteFailure {
        /// Output pin.
        pin: Pin,
        /// Reason reported by the tag store.
        reason: String,
    },
    /// The output read back a different value than the one written.
    #[error("output {pin} reads {observed} after writing {commanded}")]
    ReadBackMismatch {
        /// Output pin.
        pin: Pin,
        /// Value written.
        commanded: bool,
        /// Value read back.
        observed: bool,
    },
}
