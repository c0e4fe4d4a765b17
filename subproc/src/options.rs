use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between SIGTERM and SIGKILL once a run has timed out.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Upper bound on one readiness wait, so exit status and elapsed time are
/// re-checked regularly even when the child is silent.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes requested from a pipe per read.
pub const DEFAULT_READ_BLOCK_SIZE: usize = 128 * 1024;

/// Tunables for [`run_process`](crate::run_process).
///
/// Deserializable so hosts can embed it in their own config files; durations
/// are written as integer milliseconds and every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Fail with `CommandFailed` when the child does not exit with status 0.
    pub check: bool,
    /// Wall-clock limit before termination starts. `None` or zero: unbounded.
    #[serde(rename = "timeout_ms", with = "millis::option")]
    pub timeout: Option<Duration>,
    #[serde(rename = "grace_period_ms", with = "millis")]
    pub grace_period: Duration,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    pub read_block_size: usize,
    /// Per-stream cap on captured output. `None`: unbounded.
    pub max_output_bytes: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check: false,
            timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_block_size: DEFAULT_READ_BLOCK_SIZE,
            max_output_bytes: None,
        }
    }
}

impl RunOptions {
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_read_block_size(mut self, read_block_size: usize) -> Self {
        self.read_block_size = read_block_size;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = Some(max_output_bytes);
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    fn to_millis(d: &Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(to_millis(d))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub(super) mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub(in crate::options) fn serialize<S: Serializer>(
            d: &Option<Duration>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&super::to_millis(d)),
                None => s.serialize_none(),
            }
        }

        pub(in crate::options) fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
