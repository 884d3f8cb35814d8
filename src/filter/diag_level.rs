//! Diagnostic-level admission predicate
//!
//! Reads vastly outnumber writes, so the filter state lives in an immutable
//! snapshot behind an `ArcSwap`; `is_enabled` is a lock-free load and writes
//! replace the snapshot wholesale.

use arc_swap::ArcSwap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Level assigned to events whose logger did not set one
pub const DIAG_LEVEL_DEFAULT: u8 = 255;
pub const DIAG_LEVEL_DEFAULT_MIN: u8 = 0;
pub const DIAG_LEVEL_DEFAULT_MAX: u8 = 255;

#[derive(Debug, Clone)]
struct Snapshot {
    default_level: u8,
    level_min: u8,
    level_max: u8,
    level_set: BTreeSet<u8>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            default_level: DIAG_LEVEL_DEFAULT,
            level_min: DIAG_LEVEL_DEFAULT_MIN,
            level_max: DIAG_LEVEL_DEFAULT_MAX,
            level_set: BTreeSet::new(),
        }
    }
}

/// In-memory predicate deciding whether a diagnostic level may emit at all
///
/// Two modes: when the explicit level set is non-empty, membership decides;
/// otherwise the inclusive `[min, max]` range does. The defaults form an
/// accept-all identity. Setting an empty set reverts to range mode.
pub struct DiagLevelFilter {
    snapshot: ArcSwap<Snapshot>,
}

impl Default for DiagLevelFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagLevelFilter {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    /// Switch to range mode with the given bounds
    pub fn set_range(&self, default_level: u8, level_min: u8, level_max: u8) {
        self.snapshot.store(Arc::new(Snapshot {
            default_level,
            level_min,
            level_max,
            level_set: BTreeSet::new(),
        }));
    }

    /// Switch to set mode; an empty set reverts to range-mode defaults
    pub fn set_set(&self, default_level: u8, levels: BTreeSet<u8>) {
        self.snapshot.store(Arc::new(Snapshot {
            default_level,
            level_set: levels,
            ..Snapshot::default()
        }));
    }

    pub fn is_enabled(&self, level: u8) -> bool {
        let snapshot = self.snapshot.load();
        if !snapshot.level_set.is_empty() {
            return snapshot.level_set.contains(&level);
        }
        snapshot.level_min <= snapshot.level_max
            && snapshot.level_min <= level
            && level <= snapshot.level_max
    }

    /// False iff every field is at its documented default
    pub fn is_filtering_enabled(&self) -> bool {
        let snapshot = self.snapshot.load();
        !snapshot.level_set.is_empty()
            || snapshot.level_min != DIAG_LEVEL_DEFAULT_MIN
            || snapshot.level_max != DIAG_LEVEL_DEFAULT_MAX
            || snapshot.default_level != DIAG_LEVEL_DEFAULT
    }

    pub fn default_level(&self) -> u8 {
        self.snapshot.load().default_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_accept_everything() {
        let filter = DiagLevelFilter::new();
        assert!(!filter.is_filtering_enabled());
        for level in [0u8, 1, 100, 255] {
            assert!(filter.is_enabled(level));
        }
    }

    #[test]
    fn test_range_mode() {
        let filter = DiagLevelFilter::new();
        filter.set_range(3, 2, 4);

        assert!(filter.is_filtering_enabled());
        assert!(!filter.is_enabled(1));
        assert!(filter.is_enabled(2));
        assert!(filter.is_enabled(4));
        assert!(!filter.is_enabled(5));
        assert_eq!(filter.default_level(), 3);
    }

    #[test]
    fn test_inverted_range_rejects_everything() {
        let filter = DiagLevelFilter::new();
        filter.set_range(3, 4, 2);
        for level in [1u8, 2, 3, 4, 5] {
            assert!(!filter.is_enabled(level));
        }
    }

    #[test]
    fn test_set_mode_overrides_range() {
        let filter = DiagLevelFilter::new();
        filter.set_set(1, BTreeSet::from([1, 3]));

        assert!(filter.is_enabled(1));
        assert!(!filter.is_enabled(2));
        assert!(filter.is_enabled(3));
    }

    #[test]
    fn test_empty_set_reverts_to_range_mode() {
        let filter = DiagLevelFilter::new();
        filter.set_set(1, BTreeSet::from([1]));
        assert!(!filter.is_enabled(2));

        filter.set_set(DIAG_LEVEL_DEFAULT, BTreeSet::new());
        assert!(filter.is_enabled(2));
        assert!(!filter.is_filtering_enabled());
    }

    #[test]
    fn test_is_enabled_is_pure() {
        let filter = DiagLevelFilter::new();
        filter.set_range(3, 2, 4);
        for _ in 0..3 {
            assert_eq!(filter.is_enabled(3), filter.is_enabled(3));
        }
    }
}
