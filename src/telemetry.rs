#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_tier(name: &'static str, tier: usize) {
    metrics::increment_counter!(name, "tier" => tier.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_tier(_name: &'static str, _tier: usize) {}
