//! Verdict records and TAP rendering.
//!
//! Each terminated instance yields zero or more [`ResultRecord`]s. A
//! [`Reporter`] numbers them through the [`TestCounter`] it owns, so
//! separate reporters never share numbering state.

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Outcome of one named check.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The check succeeded.
    Pass,
    /// The check failed.
    Fail,
    /// The check did not run.
    Skip,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Fail => f.write_str("fail"),
            Self::Skip => f.write_str("skip"),
        }
    }
}

/// One named verdict with free-form detail.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ResultRecord {
    /// Short check name, e.g. `instance health`.
    pub name: String,
    /// Outcome.
    pub verdict: Verdict,
    /// Diagnostic text; may be empty.
    pub detail: String,
}

impl ResultRecord {
    /// Build a record.
    #[must_use]
    pub fn new(name: impl Into<String>, verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            verdict,
            detail: detail.into(),
        }
    }

    /// Build a passing record with no detail.
    #[must_use]
    pub fn pass(name: impl Into<String>) -> Self {
        Self::new(name, Verdict::Pass, String::new())
    }

    /// Build a failing record.
    #[must_use]
    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, Verdict::Fail, detail)
    }
}

/// Monotonic test number source.
#[derive(Debug, Default)]
pub struct TestCounter {
    next: u32,
}

impl TestCounter {
    /// Start numbering at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next number.
    pub fn next_number(&mut self) -> u32 {
        self.next += 1;
        self.next
    }

    /// How many numbers have been handed out.
    #[must_use]
    pub fn issued(&self) -> u32 {
        self.next
    }
}

/// Collects records and renders them as TAP.
#[derive(Debug, Default)]
pub struct Reporter {
    counter: TestCounter,
    lines: Vec<String>,
    failures: usize,
}

impl Reporter {
    /// Empty reporter with its own counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number and render `record`, returning the TAP line.
    pub fn record(&mut self, record: &ResultRecord) -> String {
        let n = self.counter.next_number();
        let line = match record.verdict {
            Verdict::Pass => format!("ok {n} - {}", record.name),
            Verdict::Skip => format!("ok {n} - {} # SKIP {}", record.name, record.detail),
            Verdict::Fail => {
                self.failures += 1;
                format!("not ok {n} - {}", record.name)
            }
        };
        self.lines.push(line.clone());
        if record.verdict == Verdict::Fail && !record.detail.is_empty() {
            for detail in record.detail.lines() {
                self.lines.push(format!("# {detail}"));
            }
        }
        line
    }

    /// Record every item of `records` in order.
    pub fn record_all<'a>(&mut self, records: impl IntoIterator<Item = &'a ResultRecord>) {
        for record in records {
            self.record(record);
        }
    }

    /// Number of failing records seen so far.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Full TAP document: plan line followed by every rendered line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("1..{}\n", self.counter.issued());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
