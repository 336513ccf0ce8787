use itertools::Itertools;
use std::collections::BTreeMap;

/// A snapshot of named numeric counters sampled from a pipeline component.
pub type NamedStats = BTreeMap<String, f64>;

/// Copies every entry of `stats` into `into`, prefixing each name with `"{prefix}."`.
pub fn merge_prefixed(into: &mut NamedStats, prefix: &str, stats: NamedStats) {
    for (name, value) in stats {
        into.insert(format!("{prefix}.{name}"), value);
    }
}

/// Formats a stats snapshot as `name=value` pairs on one line, for logging.
#[must_use]
pub fn format_stats(stats: &NamedStats) -> String {
    stats.iter().map(|(name, value)| format!("{name}={value}")).join(" ")
}
