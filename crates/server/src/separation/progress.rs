// crates/server/src/separation/progress.rs
//! Turning the separation tool's terminal output into percentages.
//!
//! The tool draws progress bars with carriage returns and ANSI escapes, so
//! the byte stream is split on both `\r` and `\n` and escapes are stripped
//! before matching.

use std::borrow::Cow;
use std::sync::OnceLock;
use std::time::Duration;

use regex_lite::Regex;

/// Progress reported when the tool starts; tool progress maps into
/// `PROGRESS_BASE..PROGRESS_BASE + 80`.
pub const PROGRESS_BASE: u8 = 10;
const PROGRESS_SPAN: f64 = 0.80;

/// The estimator never adds more than this on top of `PROGRESS_BASE`.
pub const ESTIMATE_CAP: u8 = 75;

/// The estimator stops once real progress reaches this.
pub const ESTIMATE_GUARD: u8 = 85;

/// Bytes of non-progress output kept for failure diagnostics.
pub const CAPTURE_LIMIT: usize = 64 * 1024;

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07|\x1b[@-Z\\-_]")
            .expect("valid ansi regex")
    })
}

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%\s*\|").expect("valid percent regex"))
}

fn fraction_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:separat|process|segment|chunk|track)[^0-9]{0,40}?(\d+(?:\.\d+)?)\s*/\s*(\d+(?:\.\d+)?)",
        )
        .expect("valid fraction regex")
    })
}

pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ansi_regex().replace_all(line, "")
}

/// Tool-native percentage (0-100) carried by a cleaned line, if any.
///
/// Recognises bar output (`" 45%|████"`) and textual counters
/// (`"Separating chunk 3/10"`).
pub fn parse_progress(line: &str) -> Option<f64> {
    if let Some(caps) = percent_regex().captures(line) {
        let pct: f64 = caps[1].parse().ok()?;
        return (0.0..=100.0).contains(&pct).then_some(pct);
    }
    let caps = fraction_regex().captures(line)?;
    let done: f64 = caps[1].parse().ok()?;
    let total: f64 = caps[2].parse().ok()?;
    if total <= 0.0 || done > total {
        return None;
    }
    Some(done / total * 100.0)
}

/// Map tool progress onto the service scale: `floor(10 + p * 0.8)`.
pub fn map_tool_percent(pct: f64) -> u8 {
    let pct = pct.clamp(0.0, 100.0);
    (f64::from(PROGRESS_BASE) + pct * PROGRESS_SPAN).floor() as u8
}

/// Time-based estimate: `10 + min(75, floor(elapsed / expected * 75))`.
pub fn estimate_percent(elapsed: Duration, expected: Duration) -> u8 {
    if expected.is_zero() {
        return PROGRESS_BASE + ESTIMATE_CAP;
    }
    let ratio = elapsed.as_secs_f64() / expected.as_secs_f64();
    let added = (ratio * f64::from(ESTIMATE_CAP)).floor();
    PROGRESS_BASE + added.min(f64::from(ESTIMATE_CAP)) as u8
}

/// Splits a byte stream into lines on `\r` or `\n`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Whatever is left after the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// Bounded record of the tool's non-progress output. Keeps the tail.
#[derive(Debug)]
pub struct OutputCapture {
    text: String,
    limit: usize,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The last `max` bytes, trimmed.
    pub fn tail(&self, max: usize) -> String {
        let text = self.text.trim_end();
        if text.len() <= max {
            return text.to_string();
        }
        let mut cut = text.len() - max;
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        text[cut..].to_string()
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new(CAPTURE_LIMIT)
    }
}
