#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod api_key;
mod backoff;
mod clock;
mod dedup;
mod error;
mod hint;

pub use api_key::{ApiKey, REDACTED_PREFIX_LEN, redact};
pub use backoff::{JitterBackoff, PollBackoff};
pub use clock::{Clock, SystemClock};
pub use dedup::{BatchDecision, DedupOutcome, HintDeduplicator, StalenessPolicy};
pub use error::{KeywardError, Result};
pub use hint::{HINT_FIELD, Hint, RawEntry, SubjectId};

/// Provider name used when none is configured.
pub const DEFAULT_PROVIDER: &str = "hypixel";
