// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Risk classification for task actions.
//!
//! Pure and stateless once constructed: `classify` never fails, never
//! touches I/O, and treats anything it does not recognize as low risk.
//! Gating policy (`requires_approval`, `should_block`) is consulted by the
//! task intake path and the scheduler.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::wire::{Action, ActionKind};

/// Risk level of an action list, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Classification outcome attached to the task payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAnalysis {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub requires_approval: bool,
}

/// Shell command patterns that block a task outright.
const CRITICAL_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r"format\s+[c-z]:",
    r"del\s+/[qsf]",
    r"shutdown\s+/[srf]",
    r"mkfs\.",
    r"dd\s+if=/dev/zero",
];

/// Shell command patterns that require approval.
const HIGH_RISK_PATTERNS: &[&str] = &[
    r"sudo\s+rm",
    r"chmod\s+777",
    r"curl.*\|\s*sh",
    r"wget.*\|\s*bash",
    r"regedit\s+/s",
    r"net\s+user.*password",
];

/// Path prefixes whose deletion is always critical.
const SENSITIVE_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/boot/",
    "C:\\Windows\\System32",
    "C:\\Program Files",
    "/System/",
    "/Library/Keychains/",
];

/// Domains treated as suspicious fetch targets (shorteners, paste sites).
const SUSPICIOUS_DOMAINS: &[&str] = &["pastebin.com", "bit.ly", "tinyurl.com"];

/// Compiled classification policy. Built once at startup.
pub struct RiskPolicy {
    critical: RegexSet,
    high: RegexSet,
}

impl RiskPolicy {
    pub fn new() -> anyhow::Result<Self> {
        let critical = RegexSet::new(CRITICAL_PATTERNS.iter().map(|p| format!("(?i){p}")))?;
        let high = RegexSet::new(HIGH_RISK_PATTERNS.iter().map(|p| format!("(?i){p}")))?;
        Ok(Self { critical, high })
    }

    /// Classify an action list: maximum level across actions, reasons appended.
    pub fn classify(&self, actions: &[Action]) -> RiskAnalysis {
        let mut level = RiskLevel::Low;
        let mut reasons = Vec::new();

        for action in actions {
            let (action_level, action_reasons) = self.classify_one(action);
            if action_level > level {
                level = action_level;
            }
            reasons.extend(action_reasons);
        }

        RiskAnalysis { level, reasons, requires_approval: requires_approval(level) }
    }

    fn classify_one(&self, action: &Action) -> (RiskLevel, Vec<String>) {
        match &action.kind {
            ActionKind::Shell { command } => {
                if self.critical.is_match(command) {
                    return (
                        RiskLevel::Critical,
                        vec![format!("critical command detected: {command}")],
                    );
                }
                if self.high.is_match(command) {
                    return (RiskLevel::High, vec![format!("high-risk command: {command}")]);
                }
                if command.contains('|') && (command.contains("curl") || command.contains("wget"))
                {
                    return (
                        RiskLevel::High,
                        vec!["remote code execution via pipe".to_owned()],
                    );
                }
                // Any shell command requires approval.
                (RiskLevel::High, vec!["shell command requires approval".to_owned()])
            }
            ActionKind::FileDelete { path } => {
                if SENSITIVE_PATHS.iter().any(|p| path.contains(p)) {
                    return (
                        RiskLevel::Critical,
                        vec![format!("deleting sensitive path: {path}")],
                    );
                }
                if path.starts_with('/') || path.ends_with('*') {
                    return (RiskLevel::High, vec![format!("dangerous delete pattern: {path}")]);
                }
                (RiskLevel::Low, vec![])
            }
            ActionKind::NetworkRequest { url } => {
                if SUSPICIOUS_DOMAINS.iter().any(|d| url.contains(d)) {
                    return (
                        RiskLevel::Medium,
                        vec!["suspicious URL shortener/paste site".to_owned()],
                    );
                }
                (RiskLevel::Low, vec![])
            }
            ActionKind::Noop | ActionKind::Screenshot | ActionKind::UiInput { .. } => {
                (RiskLevel::Low, vec![])
            }
        }
    }
}

/// High and critical tasks are held for human approval.
pub fn requires_approval(level: RiskLevel) -> bool {
    matches!(level, RiskLevel::High | RiskLevel::Critical)
}

/// Critical tasks are rejected outright.
pub fn should_block(level: RiskLevel) -> bool {
    level == RiskLevel::Critical
}

#[cfg(test)]
#[path = "risk_tests.rs"]
mod tests;
