use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Advisory risk classification for a single tool-use event (spec §4.6).
/// Ordered low to high so callers can compare with `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// One compiled pattern and the level it implies when it matches anywhere
/// in `tool_name:serialised_input`.
struct Pattern {
    level: DangerLevel,
    re: Regex,
}

static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let rules: &[(DangerLevel, &str)] = &[
        // Destructive filesystem commands.
        (DangerLevel::Critical, r"rm\s+-rf\s+/(?:\s|$)"),
        (DangerLevel::High, r"\brm\s+-rf\b"),
        (DangerLevel::High, r"\bmkfs(?:\.\w+)?\b"),
        // Block-device writes.
        (DangerLevel::Critical, r"\bdd\s+.*of=/dev/(?:sd|nvme|hd)"),
        (DangerLevel::High, r"(?:>|>>)\s*/dev/(?:sd|nvme|hd)\w*"),
        // Privilege escalation.
        (DangerLevel::High, r"\bsudo\b"),
        (DangerLevel::Medium, r"\bchmod\s+(?:-R\s+)?777\b"),
        (DangerLevel::Medium, r"\bchown\s+(?:-R\s+)?root\b"),
        // Network exfiltration.
        (DangerLevel::Medium, r"\bcurl\b.+\|\s*(?:sh|bash)\b"),
        (DangerLevel::High, r"\bnc\s+-l\b"),
        (DangerLevel::Medium, r"\bscp\b.+@"),
        // Database drops.
        (DangerLevel::High, r"(?i)\bdrop\s+(?:table|database|schema)\b"),
        (DangerLevel::Medium, r"(?i)\btruncate\s+table\b"),
        // Git force-push / history rewrite.
        (DangerLevel::Medium, r"\bgit\s+push\b.*(?:--force|-f)\b"),
        (DangerLevel::Medium, r"\bgit\s+reset\s+--hard\b"),
    ];
    rules
        .iter()
        .map(|(level, pattern)| Pattern {
            level: *level,
            re: Regex::new(pattern).expect("danger pattern is valid regex"),
        })
        .collect()
});

/// Classify a tool invocation. Never panics, even on malformed/non-UTF8-ish
/// or absurdly large input — unmatched input is `Low`. Linear scan over the
/// compiled pattern table; `tool_name` and `input` are concatenated so a
/// single rule can key off either.
pub fn classify(tool_name: &str, serialized_input: &str) -> DangerLevel {
    let haystack = format!("{tool_name}:{serialized_input}");
    PATTERNS
        .iter()
        .filter(|p| p.re.is_match(&haystack))
        .map(|p| p.level)
        .max()
        .unwrap_or(DangerLevel::Low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_command_is_low() {
        assert_eq!(classify("Bash", "ls -la"), DangerLevel::Low);
    }

    #[test]
    fn rm_rf_root_is_critical() {
        assert_eq!(classify("Bash", "rm -rf /"), DangerLevel::Critical);
    }

    #[test]
    fn rm_rf_subdir_is_high() {
        assert_eq!(classify("Bash", "rm -rf /tmp/scratch"), DangerLevel::High);
    }

    #[test]
    fn sudo_is_high() {
        assert_eq!(classify("Bash", "sudo apt-get install x"), DangerLevel::High);
    }

    #[test]
    fn drop_table_is_high() {
        assert_eq!(
            classify("Bash", "psql -c 'DROP TABLE users;'"),
            DangerLevel::High
        );
    }

    #[test]
    fn git_force_push_is_medium() {
        assert_eq!(
            classify("Bash", "git push --force origin main"),
            DangerLevel::Medium
        );
    }

    #[test]
    fn block_device_write_is_critical() {
        assert_eq!(
            classify("Bash", "dd if=/dev/zero of=/dev/sda"),
            DangerLevel::Critical
        );
    }

    #[test]
    fn multiple_matches_take_the_max() {
        // both sudo (High) and chmod 777 (Medium) match; expect High.
        assert_eq!(
            classify("Bash", "sudo chmod 777 /etc/passwd"),
            DangerLevel::High
        );
    }

    #[test]
    fn malformed_input_never_panics() {
        let garbage = "\u{0}\u{1}".repeat(10_000);
        let _ = classify("", &garbage);
        let _ = classify(&garbage, "");
    }

    #[test]
    fn level_ordering_is_total() {
        assert!(DangerLevel::Low < DangerLevel::Medium);
        assert!(DangerLevel::Medium < DangerLevel::High);
        assert!(DangerLevel::High < DangerLevel::Critical);
    }
}
