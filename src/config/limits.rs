//! Size limits enforced on inbound records before any write.
//!
//! The value limit leaves headroom under Kafka's default 1 MB
//! `message.max.bytes` for the envelope the relay wraps around each record.
//! Raise it together with the broker limit.

use serde::Deserialize;

/// Default maximum serialized record value size (512 KB).
pub const DEFAULT_MAX_VALUE_BYTES: usize = 512 * 1024;

/// Default maximum record id length in bytes.
pub const DEFAULT_MAX_ID_LEN: usize = 256;

/// Limits applied by the write coordinator's validation step.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordLimits {
    /// Maximum serialized JSON size of `value` in bytes.
    ///
    /// Default: 524,288 (512 KB).
    pub max_value_bytes: usize,

    /// Maximum id length in bytes.
    ///
    /// Default: 256.
    pub max_id_len: usize,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            max_id_len: DEFAULT_MAX_ID_LEN,
        }
    }
}

impl RecordLimits {
    /// Limits for tests that need small bounds.
    pub fn with_max_value_bytes(mut self, max: usize) -> Self {
        self.max_value_bytes = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = RecordLimits::default();
        assert_eq!(limits.max_value_bytes, 512 * 1024);
        assert_eq!(limits.max_id_len, 256);
    }

    #[test]
    fn test_limits_deserialize_partial() {
        let limits: RecordLimits = serde_json::from_str(r#"{"max_id_len": 64}"#).unwrap();
        assert_eq!(limits.max_id_len, 64);
        assert_eq!(limits.max_value_bytes, DEFAULT_MAX_VALUE_BYTES);
    }
}
