//! Visibility decisions.
//!
//! Pools express what should happen to a consumed message; this module maps
//! those intents onto broker dispositions with the shared delay clamp.

use fc_common::visibility::{clamp_delay, DEFAULT_RETRY_DELAY_SECS, EXTENSION_SECS, FAST_FAIL_DELAY_SECS};
use fc_common::Disposition;

/// No mediator call was attempted (rate limit, failed batch+group); make
/// the message visible again quickly.
pub fn fast_fail() -> Disposition {
    Disposition::Nack {
        delay_seconds: Some(FAST_FAIL_DELAY_SECS),
    }
}

/// Retriable mediation failure with no explicit delay.
pub fn reset_to_default() -> Disposition {
    Disposition::Nack {
        delay_seconds: Some(DEFAULT_RETRY_DELAY_SECS),
    }
}

/// Retriable mediation failure with a response-specified delay.
pub fn delay(seconds: u32) -> Disposition {
    Disposition::Nack {
        delay_seconds: Some(clamp_delay(seconds)),
    }
}

/// Keep a long-running message leased.
pub fn extend() -> Disposition {
    Disposition::Extend {
        seconds: EXTENSION_SECS,
    }
}
