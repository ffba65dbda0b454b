//! Change detection between a fresh fetch and the last compared record set.
//!
//! Only `id`, `details`, `price` and `location` take part. The media
//! reference is rewritten by promotion and extra columns are informational.

use tracing::warn;

use crate::error::SyncError;
use crate::model::{Record, RecordSet};

/// Canonical text form used for comparison: trimmed, and integral numbers
/// written without a fractional part (`"3.0"` and `"3"` are the same value).
pub fn canonical(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 && !trimmed.contains(['e', 'E']) => {
            format!("{}", f as i64)
        }
        _ => trimmed.to_string(),
    }
}

fn key(r: &Record) -> [String; 4] {
    [
        r.id.to_string(),
        canonical(&r.details),
        canonical(&r.price),
        canonical(&r.location),
    ]
}

pub fn has_changed(current: &RecordSet, baseline: Option<&RecordSet>) -> bool {
    let Some(baseline) = baseline else {
        return true;
    };
    current.records.len() != baseline.records.len()
        || current
            .records
            .iter()
            .zip(&baseline.records)
            .any(|(a, b)| key(a) != key(b))
}

/// Fail-open verdict: if the baseline could not be obtained or decoded the
/// answer is "changed", so a real change is never silently skipped.
pub fn has_changed_or_unknown(
    current: &RecordSet,
    baseline: Result<Option<RecordSet>, SyncError>,
) -> bool {
    match baseline {
        Ok(baseline) => has_changed(current, baseline.as_ref()),
        Err(err) => {
            warn!(error = %err, "baseline unreadable; treating source as changed");
            true
        }
    }
}
