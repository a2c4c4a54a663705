//! Series-key construction and timestamp conversion.
//!
//! Keys are deterministic and case-normalized so the same asset/metric pair
//! always lands in the same series regardless of how the caller spells it.

/// `crypto|symbol=<id>` or `crypto|symbol=<id>,metric=<name>`.
pub fn build_key(asset_id: &str, metric: Option<&str>) -> String {
    match metric {
        Some(m) => format!(
            "crypto|symbol={},metric={}",
            asset_id.to_lowercase(),
            m.to_lowercase()
        ),
        None => format!("crypto|symbol={}", asset_id.to_lowercase()),
    }
}

/// Milliseconds to store microseconds. Integer multiplication, no float
/// rounding.
pub fn to_store_timestamp(ms: i64) -> i64 {
    ms * 1000
}
