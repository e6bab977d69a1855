//! Counter key generation
//!
//! A counter key is a pure function of `(prefix, domain, descriptor entries,
//! unit, window start)`:
//!
//! ```text
//! [<prefix>]<domain>_<k1>_<v1>[_<k2>_<v2>...]_<windowStartSeconds>
//! ```
//!
//! Two requests in the same window for the same descriptor produce identical
//! keys, and windows never overlap, so the key doubles as the window
//! identity. Unlimited and unmatched rules produce no key at all.

use super::{Descriptor, RateLimitRule};

/// A generated counter key with its window coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// The store key
    pub key: String,

    /// Start of the window the key covers, unix seconds
    pub window_start: u64,

    /// Window length in seconds
    pub unit_seconds: u64,
}

impl CacheKey {
    /// Unix second at which the window rolls over
    pub fn window_end(&self) -> u64 {
        self.window_start + self.unit_seconds
    }
}

/// Builds counter keys for one tenant
#[derive(Debug, Clone)]
pub struct CacheKeyGenerator {
    prefix: String,
}

impl CacheKeyGenerator {
    /// A generator prepending `prefix` to every key
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The counter key for a descriptor under a rule, or `None` when the
    /// rule is absent or unlimited
    pub fn generate(
        &self,
        domain: &str,
        descriptor: &Descriptor,
        rule: Option<&RateLimitRule>,
        now_unix: u64,
    ) -> Option<CacheKey> {
        let rule = rule?;
        if rule.unlimited {
            return None;
        }

        let unit_seconds = rule.unit.seconds();
        let window_start = now_unix - now_unix % unit_seconds;

        let mut key = String::with_capacity(
            self.prefix.len()
                + domain.len()
                + descriptor
                    .entries
                    .iter()
                    .map(|(k, v)| k.len() + v.len() + 2)
                    .sum::<usize>()
                + 21,
        );
        key.push_str(&self.prefix);
        key.push_str(domain);
        for (entry_key, entry_value) in &descriptor.entries {
            key.push('_');
            key.push_str(entry_key);
            key.push('_');
            key.push_str(entry_value);
        }
        key.push('_');
        key.push_str(&window_start.to_string());

        Some(CacheKey {
            key,
            window_start,
            unit_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitUnit;

    fn rule(unit: RateLimitUnit) -> RateLimitRule {
        RateLimitRule::new(10, unit)
    }

    #[test]
    fn test_key_format() {
        let generator = CacheKeyGenerator::new("");
        let descriptor = Descriptor::new(vec![("database", "users")]);
        let key = generator
            .generate("mongo_cps", &descriptor, Some(&rule(RateLimitUnit::Second)), 1_234_469)
            .unwrap();
        assert_eq!(key.key, "mongo_cps_database_users_1234469");
        assert_eq!(key.window_start, 1_234_469);
        assert_eq!(key.window_end(), 1_234_470);
    }

    #[test]
    fn test_multiple_entries_joined_in_order() {
        let generator = CacheKeyGenerator::new("");
        let descriptor = Descriptor::new(vec![("api_key", "X"), ("path", "/v1/users")]);
        let key = generator
            .generate("edge", &descriptor, Some(&rule(RateLimitUnit::Minute)), 120)
            .unwrap();
        assert_eq!(key.key, "edge_api_key_X_path_/v1/users_120");
    }

    #[test]
    fn test_prefix_prepended() {
        let generator = CacheKeyGenerator::new("tenant-a:");
        let descriptor = Descriptor::new(vec![("k", "v")]);
        let key = generator
            .generate("d", &descriptor, Some(&rule(RateLimitUnit::Second)), 7)
            .unwrap();
        assert_eq!(key.key, "tenant-a:d_k_v_7");
    }

    #[test]
    fn test_window_alignment() {
        let generator = CacheKeyGenerator::new("");
        let descriptor = Descriptor::new(vec![("k", "v")]);
        let minute = rule(RateLimitUnit::Minute);

        // All seconds of one minute share a window start
        let a = generator.generate("d", &descriptor, Some(&minute), 3600).unwrap();
        let b = generator.generate("d", &descriptor, Some(&minute), 3659).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.window_start, 3600);

        // The next second starts a fresh window and a fresh key
        let c = generator.generate("d", &descriptor, Some(&minute), 3660).unwrap();
        assert_ne!(a.key, c.key);
        assert_eq!(c.window_start, 3660);
    }

    #[test]
    fn test_no_key_for_unmatched_or_unlimited() {
        let generator = CacheKeyGenerator::new("");
        let descriptor = Descriptor::new(vec![("k", "v")]);
        assert!(generator.generate("d", &descriptor, None, 0).is_none());

        let mut unlimited = rule(RateLimitUnit::Second);
        unlimited.unlimited = true;
        assert!(generator
            .generate("d", &descriptor, Some(&unlimited), 0)
            .is_none());
    }
}
