// crates/core/src/format.rs
use std::time::Duration;

/// Human-readable elapsed time for status snapshots and job results:
/// `42s`, `3m 05s`, `1h 02m`.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
