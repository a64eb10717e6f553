//! Shared tracing setup for packline processes.

/// Install the process-wide subscriber in the given output format.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init(format: LogFormat) {
    tracing::init(format);
}

/// Subscriber configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};
