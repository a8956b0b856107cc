//! Transfer rate and time-remaining estimates for progress displays.

use std::fmt;
use std::time::Duration;

/// Below this much elapsed time a rate is mostly noise.
const MIN_SAMPLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    /// Average bytes per second since the transfer started.
    pub bytes_per_sec: f64,
    /// `None` until there is enough data to estimate.
    pub eta: Option<Duration>,
}

impl fmt::Display for RateEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/s, {} left",
            format_bytes(self.bytes_per_sec as u64),
            format_eta(self.eta)
        )
    }
}

/// Average rate and ETA from bytes moved so far.
pub fn estimate(bytes_done: u64, total_bytes: u64, elapsed: Duration) -> RateEstimate {
    if elapsed < MIN_SAMPLE || bytes_done == 0 {
        return RateEstimate {
            bytes_per_sec: 0.0,
            eta: None,
        };
    }

    let bytes_per_sec = bytes_done as f64 / elapsed.as_secs_f64();
    let remaining = total_bytes.saturating_sub(bytes_done) as f64;

    RateEstimate {
        bytes_per_sec,
        eta: Some(Duration::from_secs_f64(remaining / bytes_per_sec)),
    }
}

/// `1536` → `"1.5 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let exp = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exp as i32);
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[exp])
}

/// `95s` → `"1m 35s"`, unknown → `"--:--"`.
pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta.filter(|d| !d.is_zero()) else {
        return "--:--".to_string();
    };
    let secs = eta.as_secs_f64().round() as u64;
    if secs < 60 {
        return format!("{}s", secs);
    }
    let minutes = secs / 60;
    if minutes < 60 {
        return format!("{}m {}s", minutes, secs % 60);
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}
