//! Lenient parser for pytest console reports.
//!
//! Reads three parts of the report, each optional:
//!
//! - the final summary line (`==== 4 passed, 1 failed in 0.12s ====`)
//! - failure sections (`____ test_name ____` followed by the traceback)
//! - short summary lines (`FAILED tests/test_x.py::test_name - AssertionError: ...`)
//!
//! Anything unrecognised is skipped. Parsing never fails; a report with nothing useful in
//! it yields an all-zero [`TestSummary`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Lines kept from the end of a failure section as the traceback excerpt.
const TRACEBACK_EXCERPT_LINES: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOutcome {
    #[default]
    Failed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    /// `path::Class::test` when the short summary names it.
    pub node_id: Option<String>,
    /// `file:line` of the innermost frame.
    pub location: Option<String>,
    pub error_type: Option<String>,
    pub message: String,
    pub traceback: String,
    pub outcome: FailureOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub xfailed: u32,
    pub xpassed: u32,
    pub warnings: u32,
    pub duration_secs: Option<f64>,
    pub failures: Vec<TestFailure>,
}

impl TestSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errors == 0 && self.total > 0
    }
}

struct Patterns {
    count: Regex,
    duration: Regex,
    section: Regex,
    short_summary: Regex,
    location: Regex,
    typed_message: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        count: Regex::new(
            r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed|warnings?|deselected)\b",
        )
        .expect("count regex must compile"),
        duration: Regex::new(r"\bin ([0-9]+(?:\.[0-9]+)?)s\b").expect("duration regex must compile"),
        section: Regex::new(r"^_{3,} (.+?) _{3,}$").expect("section regex must compile"),
        short_summary: Regex::new(r"^(FAILED|ERROR) (\S+)(?: - (.*))?$")
            .expect("short summary regex must compile"),
        location: Regex::new(r"^(\S+?:\d+): ([A-Za-z_][\w.]*)$")
            .expect("location regex must compile"),
        typed_message: Regex::new(r"^([A-Za-z_][\w.]*(?:Error|Exception|Exit|Failed|Interrupt)):\s*(.*)$")
            .expect("typed message regex must compile"),
    })
}

/// Parse a pytest console report into counts and per-failure details.
pub fn parse_test_report(output: &str) -> TestSummary {
    let mut summary = TestSummary::default();
    let lines: Vec<&str> = output.lines().map(str::trim_end).collect();

    let found_summary = parse_summary_line(&lines, &mut summary);
    summary.failures = parse_sections(&lines);
    merge_short_summary(&lines, &mut summary.failures);

    if !found_summary {
        // Without a summary line, the failures themselves are the only counts available.
        for failure in &summary.failures {
            match failure.outcome {
                FailureOutcome::Failed => summary.failed += 1,
                FailureOutcome::Error => summary.errors += 1,
            }
        }
    }

    summary.total = summary.passed
        + summary.failed
        + summary.errors
        + summary.skipped
        + summary.xfailed
        + summary.xpassed;
    summary
}

fn parse_summary_line(lines: &[&str], summary: &mut TestSummary) -> bool {
    let p = patterns();

    for line in lines.iter().rev() {
        let trimmed = line.trim();
        let is_bar = trimmed.starts_with('=') && trimmed.ends_with('=');
        let body = trimmed.trim_matches('=').trim();
        let has_duration = p.duration.is_match(body);
        if !(is_bar || has_duration)
            || (!p.count.is_match(body) && !body.starts_with("no tests ran"))
        {
            continue;
        }

        for caps in p.count.captures_iter(body) {
            let n: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passed" => summary.passed += n,
                "failed" => summary.failed += n,
                "error" | "errors" => summary.errors += n,
                "skipped" => summary.skipped += n,
                "xfailed" => summary.xfailed += n,
                "xpassed" => summary.xpassed += n,
                "warning" | "warnings" => summary.warnings += n,
                _ => {}
            }
        }
        summary.duration_secs = p
            .duration
            .captures(body)
            .and_then(|caps| caps[1].parse().ok());
        return true;
    }
    false
}

fn parse_sections(lines: &[&str]) -> Vec<TestFailure> {
    let p = patterns();
    let mut failures = Vec::new();
    let mut outcome = FailureOutcome::Failed;
    let mut current: Option<(String, Vec<&str>)> = None;

    for &line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with('=') && trimmed.ends_with('=') && trimmed.len() > 2 {
            if let Some((title, body)) = current.take() {
                failures.push(build_failure(&title, &body, outcome));
            }
            let heading = trimmed.trim_matches('=').trim();
            if heading == "ERRORS" {
                outcome = FailureOutcome::Error;
            } else if heading == "FAILURES" {
                outcome = FailureOutcome::Failed;
            }
            continue;
        }

        if let Some(caps) = p.section.captures(trimmed) {
            if let Some((title, body)) = current.take() {
                failures.push(build_failure(&title, &body, outcome));
            }
            current = Some((caps[1].to_string(), Vec::new()));
            continue;
        }

        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }

    if let Some((title, body)) = current {
        failures.push(build_failure(&title, &body, outcome));
    }
    failures
}

fn build_failure(title: &str, body: &[&str], outcome: FailureOutcome) -> TestFailure {
    let p = patterns();
    let test_name = title
        .strip_prefix("ERROR at setup of ")
        .or_else(|| title.strip_prefix("ERROR at teardown of "))
        .unwrap_or(title)
        .to_string();

    let mut failure = TestFailure {
        test_name,
        outcome,
        ..Default::default()
    };

    for line in body {
        if let Some(caps) = p.location.captures(line.trim()) {
            failure.location = Some(caps[1].to_string());
            failure.error_type = Some(caps[2].to_string());
        }
    }

    let messages: Vec<&str> = body
        .iter()
        .filter_map(|line| line.strip_prefix('E'))
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        .map(str::trim)
        .collect();
    if let Some(first) = messages.first()
        && let Some(caps) = p.typed_message.captures(first)
    {
        failure.error_type.get_or_insert_with(|| caps[1].to_string());
    }
    failure.message = messages.join("\n").trim().to_string();

    let meaningful: Vec<&str> = body
        .iter()
        .copied()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = meaningful.len().saturating_sub(TRACEBACK_EXCERPT_LINES);
    failure.traceback = meaningful[start..].join("\n");

    failure
}

/// Short name pytest uses for section titles: `Class.test` for `path::Class::test`.
fn section_name(node_id: &str) -> String {
    let mut parts = node_id.split("::");
    parts.next();
    parts.collect::<Vec<_>>().join(".")
}

fn merge_short_summary(lines: &[&str], failures: &mut Vec<TestFailure>) {
    let p = patterns();

    for line in lines {
        let Some(caps) = p.short_summary.captures(line.trim()) else {
            continue;
        };
        let outcome = if &caps[1] == "ERROR" {
            FailureOutcome::Error
        } else {
            FailureOutcome::Failed
        };
        let node_id = caps[2].to_string();
        let name = section_name(&node_id);
        let name = if name.is_empty() { node_id.clone() } else { name };
        let detail = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");

        let (error_type, message) = match p.typed_message.captures(detail) {
            Some(c) => (Some(c[1].to_string()), c[2].to_string()),
            None => (None, detail.to_string()),
        };

        match failures.iter_mut().find(|f| f.test_name == name && f.node_id.is_none()) {
            Some(existing) => {
                existing.node_id = Some(node_id);
                if existing.error_type.is_none() {
                    existing.error_type = error_type;
                }
                if existing.message.is_empty() {
                    existing.message = message;
                }
            }
            None => failures.push(TestFailure {
                test_name: name,
                node_id: Some(node_id),
                error_type,
                message,
                outcome,
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"============================= test session starts ==============================
platform linux -- Python 3.12.1, pytest-8.0.0, pluggy-1.4.0
rootdir: /workspace
collected 5 items

tests/test_calc.py ..F..                                                 [100%]

=================================== FAILURES ===================================
_________________________________ test_divide __________________________________

    def test_divide():
>       assert divide(6, 3) == 3
E       assert 2.0 == 3
E        +  where 2.0 = divide(6, 3)

tests/test_calc.py:14: AssertionError
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_divide - assert 2.0 == 3
========================= 1 failed, 4 passed in 0.05s ==========================
"#;

    #[test]
    fn test_parse_counts_and_failure() {
        let summary = parse_test_report(REPORT);
        assert_eq!(summary.passed, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.duration_secs, Some(0.05));
        assert!(!summary.all_passed());

        assert_eq!(summary.failures.len(), 1);
        let failure = &summary.failures[0];
        assert_eq!(failure.test_name, "test_divide");
        assert_eq!(failure.node_id.as_deref(), Some("tests/test_calc.py::test_divide"));
        assert_eq!(failure.location.as_deref(), Some("tests/test_calc.py:14"));
        assert_eq!(failure.error_type.as_deref(), Some("AssertionError"));
        assert!(failure.message.starts_with("assert 2.0 == 3"));
        assert!(failure.traceback.contains("tests/test_calc.py:14: AssertionError"));
    }

    #[test]
    fn test_parse_errors_section_and_class_tests() {
        let report = "\
==================================== ERRORS ====================================
__________________ ERROR at setup of TestDb.test_connect ___________________
    @pytest.fixture
    def db():
>       raise ConnectionError(\"refused\")
E       ConnectionError: refused

tests/test_db.py:5: ConnectionError
=========================== short test summary info ============================
ERROR tests/test_db.py::TestDb::test_connect - ConnectionError: refused
FAILED tests/test_db.py::TestDb::test_query - ValueError: bad row
==================== 1 failed, 2 passed, 1 error, 1 skipped, 3 warnings in 1.20s ====================
";
        let summary = parse_test_report(report);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.warnings, 3);
        assert_eq!(summary.total, 5);

        assert_eq!(summary.failures.len(), 2);
        let error = &summary.failures[0];
        assert_eq!(error.test_name, "TestDb.test_connect");
        assert_eq!(error.outcome, FailureOutcome::Error);
        assert_eq!(error.error_type.as_deref(), Some("ConnectionError"));

        let failed = &summary.failures[1];
        assert_eq!(failed.test_name, "TestDb.test_query");
        assert_eq!(failed.error_type.as_deref(), Some("ValueError"));
        assert_eq!(failed.message, "bad row");
        assert!(failed.location.is_none());
    }

    #[test]
    fn test_summary_without_bars() {
        let summary = parse_test_report("3 passed in 0.01s\n");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.total, 3);
        assert!(summary.all_passed());
    }

    #[test]
    fn test_garbage_yields_zeros() {
        for input in ["", "Traceback (most recent call last):\n  oops", "=====\n____ \n"] {
            let summary = parse_test_report(input);
            assert_eq!(summary.total, 0, "{input:?}");
            assert!(summary.failures.is_empty(), "{input:?}");
        }
    }

    #[test]
    fn test_missing_summary_counts_short_lines() {
        let summary = parse_test_report(
            "FAILED t.py::test_a - AssertionError: boom\nERROR t.py::test_b\n",
        );
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failures[0].error_type.as_deref(), Some("AssertionError"));
        assert_eq!(summary.failures[0].message, "boom");
    }

    #[test]
    fn test_no_tests_ran() {
        let summary = parse_test_report("============================ no tests ran in 0.01s =============================");
        assert_eq!(summary.total, 0);
        assert_eq!(summary.duration_secs, Some(0.01));
    }
}
