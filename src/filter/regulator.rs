//! Per-tenant event exclusion and sampling filter
//!
//! Patterns use shell-style `*`/`?` wildcards and are evaluated
//! first-match-wins in insertion order. Sampling is deterministic: the keep
//! decision hashes `(tenant, event_name, record_id)`, so one record's fate is
//! stable under replay.

use crate::error::StoreError;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
struct FilterRule {
    pattern: String,
    /// Keep-probability in `[0,1]`; `None` drops unconditionally
    sample_rate: Option<f64>,
}

/// Tenant-scoped exclusion/sampling filter applied before admission
#[derive(Default)]
pub struct EventFilterRegulator {
    tenants: DashMap<String, Vec<FilterRule>>,
}

impl EventFilterRegulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install unconditional-drop patterns for a tenant (legacy surface)
    pub fn set_filters(&self, tenant_token: &str, patterns: &[String]) {
        let rules = patterns
            .iter()
            .map(|pattern| FilterRule {
                pattern: pattern.clone(),
                sample_rate: None,
            })
            .collect();
        self.tenants.insert(tenant_token.to_string(), rules);
        tracing::debug!(
            tenant = tenant_token,
            patterns = patterns.len(),
            "Installed exclusion filters"
        );
    }

    /// Install per-pattern keep-probabilities for a tenant
    ///
    /// Rate `0.0` equals unconditional drop, `1.0` pass-through. The arrays
    /// must have equal length.
    pub fn set_sampled_filters(
        &self,
        tenant_token: &str,
        patterns: &[String],
        rates: &[f64],
    ) -> Result<(), StoreError> {
        if patterns.len() != rates.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} patterns but {} rates",
                patterns.len(),
                rates.len()
            )));
        }
        if let Some(bad) = rates.iter().find(|r| !(0.0..=1.0).contains(*r)) {
            return Err(StoreError::InvalidArgument(format!(
                "sample rate {} outside [0, 1]",
                bad
            )));
        }

        let rules = patterns
            .iter()
            .zip(rates)
            .map(|(pattern, rate)| FilterRule {
                pattern: pattern.clone(),
                sample_rate: Some(*rate),
            })
            .collect();
        self.tenants.insert(tenant_token.to_string(), rules);
        tracing::debug!(
            tenant = tenant_token,
            patterns = patterns.len(),
            "Installed sampled exclusion filters"
        );
        Ok(())
    }

    /// Remove all rules for a tenant
    pub fn reset(&self, tenant_token: &str) {
        self.tenants.remove(tenant_token);
    }

    /// Whether the event may proceed to the store
    pub fn should_send(&self, tenant_token: &str, event_name: &str, record_id: &str) -> bool {
        let rules = match self.tenants.get(tenant_token) {
            Some(rules) => rules,
            None => return true,
        };
        for rule in rules.iter() {
            if !wildcard_match(&rule.pattern, event_name) {
                continue;
            }
            return match rule.sample_rate {
                None => false,
                Some(rate) => sample_unit(tenant_token, event_name, record_id) < rate,
            };
        }
        true
    }
}

/// Map `(tenant, event_name, record_id)` into a uniform value in `[0, 1)`
fn sample_unit(tenant_token: &str, event_name: &str, record_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(tenant_token.as_bytes());
    hasher.update([0u8]);
    hasher.update(event_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(record_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0)
}

/// Shell-style wildcard match: `*` spans any run, `?` any single character
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Backtrack: let the last star absorb one more character
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
