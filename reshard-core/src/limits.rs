//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every participant list, document and snapshot has an explicit maximum size.

use crate::{Error, Result};

/// Limits for resharding participants.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Participant limits.
    /// Maximum number of donor shards in one operation.
    pub max_donor_shards: u32,
    /// Maximum number of recipient shards in one operation.
    pub max_recipient_shards: u32,

    // Registry limits.
    /// Maximum number of live instances per registered service.
    pub max_instances_per_service: u32,

    // Document limits.
    /// Maximum length of a persisted abort reason in bytes.
    pub max_abort_reason_bytes: u32,
    /// Maximum encoded size of a persisted state document in bytes.
    pub max_document_bytes: u32,

    // Routing limits.
    /// Maximum number of chunks in a routing snapshot.
    pub max_chunks_per_snapshot: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Participants: the catalog caps a cluster well below this.
            max_donor_shards: 1024,
            max_recipient_shards: 1024,

            // Registry: one instance per concurrent operation per role.
            max_instances_per_service: 256,

            // Documents: 1KB reasons, 16MB documents.
            max_abort_reason_bytes: 1024,
            max_document_bytes: 16 * 1024 * 1024,

            // Routing: 1M chunks.
            max_chunks_per_snapshot: 1_000_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_donor_shards == 0 {
            return Err(Error::InvalidArgument {
                name: "max_donor_shards",
                reason: "must be positive",
            });
        }

        if self.max_recipient_shards == 0 {
            return Err(Error::InvalidArgument {
                name: "max_recipient_shards",
                reason: "must be positive",
            });
        }

        if self.max_instances_per_service == 0 {
            return Err(Error::InvalidArgument {
                name: "max_instances_per_service",
                reason: "must be positive",
            });
        }

        // A document must at least be able to hold its abort reason.
        if self.max_document_bytes <= self.max_abort_reason_bytes {
            return Err(Error::InvalidArgument {
                name: "max_document_bytes",
                reason: "must be > max_abort_reason_bytes",
            });
        }

        if self.max_chunks_per_snapshot == 0 {
            return Err(Error::InvalidArgument {
                name: "max_chunks_per_snapshot",
                reason: "must be positive",
            });
        }

        Ok(())
    }

    /// Checks a participant count against the named limit.
    ///
    /// # Errors
    /// Returns `LimitExceeded` if `count` is above `max`.
    pub fn check(limit: &'static str, max: u32, count: usize) -> Result<()> {
        let actual = count as u64;
        if actual > u64::from(max) {
            return Err(Error::LimitExceeded {
                limit,
                max: u64::from(max),
                actual,
            });
        }
        Ok(())
    }

    /// Truncates an abort reason to `max_abort_reason_bytes` on a char boundary.
    #[must_use]
    pub fn truncate_reason(&self, reason: &str) -> String {
        let max = self.max_abort_reason_bytes as usize;
        if reason.len() <= max {
            return reason.to_string();
        }
        let mut end = max;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason[..end].to_string()
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_zero_donors_invalid() {
        let mut limits = Limits::new();
        limits.max_donor_shards = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_document_smaller_than_reason() {
        let mut limits = Limits::new();
        limits.max_document_bytes = 512;
        limits.max_abort_reason_bytes = 1024;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_check_count() {
        assert!(Limits::check("donor_shards", 2, 2).is_ok());
        let err = Limits::check("donor_shards", 2, 3).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded { actual: 3, .. }));
    }

    #[test]
    fn test_truncate_reason_respects_char_boundary() {
        let mut limits = Limits::new();
        limits.max_abort_reason_bytes = 4;
        // "é" is two bytes; cutting at 4 would split the second one.
        assert_eq!(limits.truncate_reason("aéé"), "aé");
        assert_eq!(limits.truncate_reason("abc"), "abc");
    }
}
