use serde::Serialize;
use std::time::Duration;

/// Tail of the output embedded into `result.json` / `latest.json`.
pub const RESULT_OUTPUT_BUDGET: usize = 4096;
/// Tail of the output embedded into chat notifications.
pub const CHAT_OUTPUT_BUDGET: usize = 1024;
/// Bytes of live output kept in memory while the engine runs.
pub const CAPTURE_TAIL_BUDGET: usize = 64 * 1024;

pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotifyLimits {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_attempts: u32,
    pub overall_timeout_ms: u64,
}

impl Default for NotifyLimits {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            retry_backoff_ms: 2_000,
            max_attempts: 2,
            overall_timeout_ms: 30_000,
        }
    }
}

impl NotifyLimits {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    /// Clamp every knob into a range that keeps task completion bounded.
    pub fn clamped(self) -> Self {
        Self {
            connect_timeout_ms: clamp(self.connect_timeout_ms, 100, 30_000),
            request_timeout_ms: clamp(self.request_timeout_ms, 100, 60_000),
            retry_backoff_ms: clamp(self.retry_backoff_ms, 0, 30_000),
            max_attempts: self.max_attempts.clamp(1, 5),
            overall_timeout_ms: clamp(self.overall_timeout_ms, 100, 300_000),
        }
    }
}

/// Boolean spelling accepted in environment variables and flags.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Non-empty, trimmed environment value.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

/// Last `budget` bytes of `input`, moved forward to the next char boundary.
/// Applying it twice with the same budget yields the same slice.
pub fn tail(input: &str, budget: usize) -> &str {
    if input.len() <= budget {
        return input;
    }
    let mut start = input.len() - budget;
    while !input.is_char_boundary(start) {
        start += 1;
    }
    &input[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_short_input() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("", 0), "");
    }

    #[test]
    fn tail_keeps_end_of_output() {
        let out = "line1\nline2\nERROR: boom";
        assert_eq!(tail(out, 11), "ERROR: boom");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let input = "ééééé";
        let kept = tail(input, 3);
        assert_eq!(kept, "é");
        assert!(kept.len() <= 3);
    }

    #[test]
    fn tail_is_idempotent() {
        let input = "αβγδε-output-ωψχ".repeat(50);
        for budget in [0, 1, 2, 3, 7, 64, 100, 1024] {
            let once = tail(&input, budget);
            let twice = tail(once, budget);
            assert_eq!(once, twice, "budget {budget}");
            assert!(once.len() <= budget);
        }
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn notify_limits_clamp() {
        let limits = NotifyLimits {
            connect_timeout_ms: 0,
            request_timeout_ms: 1_000_000,
            retry_backoff_ms: 10,
            max_attempts: 0,
            overall_timeout_ms: 5,
        }
        .clamped();
        assert_eq!(limits.connect_timeout_ms, 100);
        assert_eq!(limits.request_timeout_ms, 60_000);
        assert_eq!(limits.retry_backoff_ms, 10);
        assert_eq!(limits.max_attempts, 1);
        assert_eq!(limits.overall_timeout_ms, 100);
    }

    #[test]
    fn default_limits_match_channel_policy() {
        let limits = NotifyLimits::default();
        assert_eq!(limits.max_attempts, 2);
        assert_eq!(limits.retry_backoff(), Duration::from_secs(2));
        assert_eq!(limits.connect_timeout(), Duration::from_secs(5));
    }
}
