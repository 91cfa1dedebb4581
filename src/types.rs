//! NewType wrappers for the identifiers that flow through the job manager.
//!
//! These keep the manager's own sequence numbers apart from the identifiers
//! handed out by an external scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper around an externally produced string.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Sequence number the manager assigns to a job when it is enqueued.
///
/// Ids are unique for the lifetime of a manager and strictly increasing in
/// enqueue order, which makes them usable as a FIFO tiebreaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

newtype_string!(
    /// Identifier the external batch scheduler assigned on submission
    /// (e.g., the `6449881` in "Submitted batch job 6449881").
    ExternalJobId
);

newtype_string!(
    /// Human-readable name used in logs and reports.
    ///
    /// Taken from the batch `job_name` when one is configured, otherwise
    /// derived from the `JobId`.
    JobLabel
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_orders_by_sequence() {
        assert!(JobId::new(1) < JobId::new(2));
        assert_eq!(JobId::new(7).to_string(), "job-7");
    }

    #[test]
    fn external_id_is_transparent_in_json() {
        let id = ExternalJobId::new("6449881");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"6449881\"");
        assert_eq!(id.as_str(), "6449881");
    }
}
