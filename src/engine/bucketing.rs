//! # Stage: Bucketing
//!
//! ## Responsibility
//! Map a visitor identifier onto an experiment arm.
//!
//! ## Guarantees
//! - Deterministic: a pure function of the visitor id and the split, stable
//!   across processes and restarts
//! - Compatible: the 32-bit rolling hash matches the `(h << 5) - h + c`
//!   string hash used by the browser-side tooling, computed over UTF-16
//!   code units with two's-complement wraparound
//!
//! ## NOT Responsible For
//! - Persisting the assignment (see [`crate::store::ExperimentStore::assign_if_absent`])

use super::model::{Arm, TrafficSplit};

/// 32-bit signed rolling hash of `s` (`h = h * 31 + c` over UTF-16 units).
pub fn visitor_hash(s: &str) -> i32 {
    s.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    })
}

/// Bucket in `0..100` for a hash value.
///
/// Widened to `i64` so that `|i32::MIN|` does not overflow.
pub fn bucket_from_hash(hash: i32) -> u32 {
    (i64::from(hash).abs() % 100) as u32
}

/// Bucket in `0..100` for a visitor id.
pub fn bucket(visitor_id: &str) -> u32 {
    bucket_from_hash(visitor_hash(visitor_id))
}

/// Arm for a bucket. A bucket equal to `split.control` falls into `variant`.
pub fn arm_for_bucket(bucket: u32, split: &TrafficSplit) -> Arm {
    if bucket < split.control {
        Arm::Control
    } else {
        Arm::Variant
    }
}

/// Arm for a visitor under `split`.
pub fn assign_arm(visitor_id: &str, split: &TrafficSplit) -> Arm {
    arm_for_bucket(bucket(visitor_id), split)
}
