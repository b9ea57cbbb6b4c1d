//! PKGBUILD security auditing.
//!
//! A fixed, ordered table of regex rules applied to build-recipe text.
//! Every rule that matches at least once reports exactly one finding; the
//! scan never short-circuits and never executes or interprets the text.
//! The regex crate's linear-time engine keeps the whole pass bounded by
//! text length × rule count.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Warning,
}

/// One matched audit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub rule: &'static str,
    pub severity: Severity,
    pub description: &'static str,
}

struct Rule {
    id: &'static str,
    severity: Severity,
    pattern: &'static str,
    description: &'static str,
}

/// Rule table, in report order. Patterns are compiled in multiline mode so
/// `^` anchors to line starts inside the recipe.
const RULES: &[Rule] = &[
    Rule {
        id: "curl-pipe-shell",
        severity: Severity::Critical,
        pattern: r"curl\s+[^\n|]*\|\s*(?:ba|z|da)?sh\b",
        description: "Pipes a curl download straight into a shell",
    },
    Rule {
        id: "wget-pipe-shell",
        severity: Severity::Critical,
        pattern: r"wget\s+[^\n|]*\|\s*(?:ba|z|da)?sh\b",
        description: "Pipes a wget download straight into a shell",
    },
    Rule {
        id: "rm-root",
        severity: Severity::Critical,
        pattern: r"rm\s+-(?:rf|fr)\s+/(?:\s|\*|$)",
        description: "Recursive delete rooted at /",
    },
    Rule {
        id: "raw-device-write",
        severity: Severity::Critical,
        pattern: r"(?:\bdd\b[^\n]*\bof=|>\s*)/dev/(?:sd|nvme|mmcblk|vd)",
        description: "Writes directly to a block device",
    },
    Rule {
        id: "mkfs",
        severity: Severity::Critical,
        pattern: r"\bmkfs(?:\.\w+)?\s",
        description: "Formats a filesystem",
    },
    Rule {
        id: "eval-download",
        severity: Severity::High,
        pattern: r"\beval\b[^\n]*\$\((?:curl|wget)\b",
        description: "Evaluates downloaded content",
    },
    Rule {
        id: "base64-pipe",
        severity: Severity::High,
        pattern: r"base64\s+(?:-d|--decode)\b[^\n]*\|",
        description: "Pipes base64-decoded data into another command",
    },
    Rule {
        id: "sudo",
        severity: Severity::High,
        pattern: r"(?:^|[;&|]\s*|\s)sudo\s",
        description: "Invokes sudo; build functions must not escalate",
    },
    Rule {
        id: "setuid",
        severity: Severity::High,
        pattern: r"chmod\s+(?:-[A-Za-z]+\s+)?(?:[ugoa]*\+s\b|[0-7]?[24][0-7]{3}\b)",
        description: "Sets a setuid/setgid bit",
    },
    Rule {
        id: "world-writable",
        severity: Severity::Warning,
        pattern: r"chmod\s+(?:-[A-Za-z]+\s+)?0?777\b",
        description: "Makes files world-writable",
    },
    Rule {
        id: "system-path-write",
        severity: Severity::Warning,
        pattern: r">{1,2}\s*/(?:etc|usr|boot)/",
        description: "Writes to system paths instead of $pkgdir",
    },
];

static COMPILED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| {
            Regex::new(&format!("(?m){}", rule.pattern)).expect("audit rule pattern")
        })
        .collect()
});

/// Audit build-recipe text against the rule table. Pure and idempotent:
/// identical text always yields identical ordered findings.
pub fn audit(text: &str) -> Vec<Finding> {
    RULES
        .iter()
        .zip(COMPILED.iter())
        .filter(|(_, regex)| regex.is_match(text))
        .map(|(rule, _)| Finding {
            rule: rule.id,
            severity: rule.severity,
            description: rule.description,
        })
        .collect()
}
