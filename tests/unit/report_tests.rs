//! Unit tests for verdict records and TAP rendering.

use managed_instance::report::{Reporter, ResultRecord, TestCounter, Verdict};

#[test]
fn counter_starts_at_one() {
    let mut counter = TestCounter::new();
    assert_eq!(counter.issued(), 0);
    assert_eq!(counter.next_number(), 1);
    assert_eq!(counter.next_number(), 2);
    assert_eq!(counter.issued(), 2);
}

#[test]
fn each_verdict_renders_its_tap_line() {
    let mut reporter = Reporter::new();
    assert_eq!(
        reporter.record(&ResultRecord::pass("instance health")),
        "ok 1 - instance health"
    );
    assert_eq!(
        reporter.record(&ResultRecord::fail("instance health", "exited early")),
        "not ok 2 - instance health"
    );
    assert_eq!(
        reporter.record(&ResultRecord::new(
            "memcheck report",
            Verdict::Skip,
            "no post-processor"
        )),
        "ok 3 - memcheck report # SKIP no post-processor"
    );
    assert_eq!(reporter.failures(), 1);
}

#[test]
fn render_emits_plan_then_lines_with_failure_detail() {
    let mut reporter = Reporter::new();
    reporter.record_all(&[
        ResultRecord::pass("a"),
        ResultRecord::fail("b", "first\nsecond"),
    ]);
    assert_eq!(
        reporter.render(),
        "1..2\nok 1 - a\nnot ok 2 - b\n# first\n# second\n"
    );
}

#[test]
fn reporters_number_independently() {
    let mut first = Reporter::new();
    let mut second = Reporter::new();
    first.record(&ResultRecord::pass("a"));
    first.record(&ResultRecord::pass("b"));
    assert_eq!(second.record(&ResultRecord::pass("c")), "ok 1 - c");
}

#[test]
fn verdict_display_is_lowercase() {
    assert_eq!(Verdict::Pass.to_string(), "pass");
    assert_eq!(Verdict::Fail.to_string(), "fail");
    assert_eq!(Verdict::Skip.to_string(), "skip");
}
