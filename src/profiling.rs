//! Profiling wrapper modes and the post-processing collaborator contract.
//!
//! The launcher prepends a `valgrind` argument vector when profiling is
//! enabled and records where the tool will write its report. Those exact
//! paths are handed to a [`ProfileCollaborator`] at teardown; parsing the
//! formats themselves happens outside this crate.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::report::{ResultRecord, Verdict};

/// Instrumentation wrapper applied to the subject process.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilingMode {
    /// Run the subject binary directly.
    #[default]
    None,
    /// `valgrind --tool=memcheck` with an XML leak report.
    Memcheck,
    /// `valgrind --tool=callgrind` producing a line-coverage profile.
    Callgrind,
}

/// Side files a profiling wrapper writes, generated at launch time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileArtifacts {
    /// Memcheck text log (`--log-file`).
    pub memcheck_log: Option<PathBuf>,
    /// Memcheck XML report (`--xml-file`).
    pub memcheck_xml: Option<PathBuf>,
    /// Callgrind output (`--callgrind-out-file`).
    pub callgrind_out: Option<PathBuf>,
}

impl ProfileArtifacts {
    /// Generate artifact paths for `mode` inside `dir`.
    #[must_use]
    pub fn for_mode(mode: ProfilingMode, dir: &Path) -> Self {
        match mode {
            ProfilingMode::None => Self::default(),
            ProfilingMode::Memcheck => {
                let log = dir.join("valgrind");
                Self {
                    memcheck_xml: Some(with_suffix(&log, ".xml")),
                    memcheck_log: Some(log),
                    callgrind_out: None,
                }
            }
            ProfilingMode::Callgrind => Self {
                callgrind_out: Some(dir.join("callgrind.out")),
                ..Self::default()
            },
        }
    }

    /// Whether any wrapper output is expected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memcheck_log.is_none() && self.memcheck_xml.is_none() && self.callgrind_out.is_none()
    }

    /// Wrapper argument vector placed before the subject command line.
    ///
    /// Empty when profiling is disabled.
    #[must_use]
    pub fn wrapper_args(&self, valgrind: &str) -> Vec<String> {
        if let (Some(log), Some(xml)) = (&self.memcheck_log, &self.memcheck_xml) {
            return vec![
                valgrind.to_owned(),
                "--tool=memcheck".into(),
                format!("--log-file={}", log.display()),
                "--track-fds=yes".into(),
                "--read-var-info=yes".into(),
                "--track-origins=yes".into(),
                "--leak-check=full".into(),
                "--xml=yes".into(),
                format!("--xml-file={}", xml.display()),
                "-v".into(),
            ];
        }
        if let Some(out) = &self.callgrind_out {
            return vec![
                valgrind.to_owned(),
                "--tool=callgrind".into(),
                "--collect-jumps=yes".into(),
                "--separate-recs=16".into(),
                format!("--callgrind-out-file={}", out.display()),
            ];
        }
        Vec::new()
    }
}

/// Append `suffix` to the final path component (`valgrind` → `valgrind.xml`).
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Post-mortem consumer of profiling output.
///
/// Receives the same [`ProfileArtifacts`] the launcher generated and
/// reports one or more verdicts for the instance's result set.
pub trait ProfileCollaborator: Send + Sync {
    /// Analyse the wrapper output of a terminated instance.
    fn analyze(&self, artifacts: &ProfileArtifacts) -> Vec<ResultRecord>;
}

/// Default collaborator: reports every produced artifact as skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipCollaborator;

impl ProfileCollaborator for SkipCollaborator {
    fn analyze(&self, artifacts: &ProfileArtifacts) -> Vec<ResultRecord> {
        let mut out = Vec::new();
        if let Some(xml) = &artifacts.memcheck_xml {
            out.push(skipped("memcheck", xml));
        }
        if let Some(profile) = &artifacts.callgrind_out {
            out.push(skipped("callgrind", profile));
        }
        out
    }
}

fn skipped(tool: &str, path: &Path) -> ResultRecord {
    let detail = if path.exists() {
        format!("no {tool} post-processor configured for {}", path.display())
    } else {
        format!("{tool} produced no output at {}", path.display())
    };
    ResultRecord::new(format!("{tool} report"), Verdict::Skip, detail)
}
