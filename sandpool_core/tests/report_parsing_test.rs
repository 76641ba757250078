//! Lenient parsing of pytest console reports.

use sandpool_core::report::{FailureOutcome, parse_test_report};

const MIXED_REPORT: &str = "\
============================= test session starts ==============================
platform linux -- Python 3.12.1, pytest-8.0.0, pluggy-1.4.0
collected 7 items

tests/test_api.py ..F.s.E                                                [100%]

==================================== ERRORS ====================================
_______________________ ERROR at setup of test_database ________________________

    @pytest.fixture
    def db():
>       raise ConnectionError(\"database unavailable\")
E       ConnectionError: database unavailable

tests/conftest.py:12: ConnectionError
=================================== FAILURES ===================================
_________________________________ test_limits __________________________________

    def test_limits():
>       assert clamp(15, 0, 10) == 10
E       assert 15 == 10
E        +  where 15 = clamp(15, 0, 10)

tests/test_api.py:31: AssertionError
=========================== short test summary info ============================
FAILED tests/test_api.py::test_limits - assert 15 == 10
ERROR tests/test_api.py::test_database - ConnectionError: database unavailable
============= 1 failed, 4 passed, 1 skipped, 1 error in 0.31s ==============
";

#[test]
fn test_four_passed_one_failed() {
    let report = "\
FAILED tests/test_math.py::test_add - AssertionError: assert 3 == 4
========================= 4 passed, 1 failed in 0.12s =========================
";
    let summary = parse_test_report(report);
    assert_eq!(summary.total, 5);
    assert_eq!(summary.passed, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].error_type.as_deref(), Some("AssertionError"));
    assert_eq!(summary.duration_secs, Some(0.12));
}

#[test]
fn test_mixed_report_with_sections() {
    let summary = parse_test_report(MIXED_REPORT);
    assert_eq!(summary.total, 7);
    assert_eq!(summary.passed, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.skipped, 1);
    assert!(!summary.all_passed());
    assert_eq!(summary.failures.len(), 2);

    let failed = summary
        .failures
        .iter()
        .find(|f| f.outcome == FailureOutcome::Failed)
        .expect("failed test present");
    assert_eq!(failed.test_name, "test_limits");
    assert_eq!(failed.location.as_deref(), Some("tests/test_api.py:31"));
    assert_eq!(failed.error_type.as_deref(), Some("AssertionError"));
    assert!(failed.message.contains("assert 15 == 10"));
    assert!(!failed.traceback.is_empty());

    let errored = summary
        .failures
        .iter()
        .find(|f| f.outcome == FailureOutcome::Error)
        .expect("errored test present");
    assert_eq!(errored.error_type.as_deref(), Some("ConnectionError"));
}

#[test]
fn test_garbage_and_truncated_reports_degrade_to_zeros() {
    for report in [
        "",
        "Traceback (most recent call last):\n  File \"x.py\", line 1\nSyntaxError: invalid syntax\n",
        "=================== FAILURES ===================\n______ test_cut",
        "==== 12 frobnicated in forever ====",
    ] {
        let summary = parse_test_report(report);
        assert_eq!(summary.total, 0, "{report:?}");
        assert_eq!(summary.passed, 0);
        assert!(summary.failures.iter().all(|f| !f.test_name.is_empty()));
    }
}

#[test]
fn test_no_tests_ran() {
    let summary = parse_test_report("============ no tests ran in 0.01s ============\n");
    assert_eq!(summary.total, 0);
    assert!(!summary.all_passed());
}
