use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

/// Display-serial prefix for job schedules (`JSCHED-00000042`).
pub const SCHEDULE_SERIAL_PREFIX: &str = "JSCHED";
/// Display-serial prefix for schedule executions (`SEXEC-00000042`).
pub const EXECUTION_SERIAL_PREFIX: &str = "SEXEC";
/// Zero-padding width of the numeric part of a serial.
pub const SERIAL_WIDTH: usize = 8;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidId(format!("{s}: {e}")))
            }
        }
    };
}

uuid_id!(
    /// Identity of a Job (owned by the external job/target store).
    JobId
);
uuid_id!(
    /// Identity of a JobSchedule row.
    ScheduleId
);
uuid_id!(
    /// Identity of a ScheduleExecution row.
    ExecutionId
);

/// Format a display serial, e.g. `format_serial("JSCHED", 42)` → `JSCHED-00000042`.
pub fn format_serial(prefix: &str, seq: u64) -> String {
    format!("{prefix}-{seq:0width$}", width = SERIAL_WIDTH)
}
