//! Unit tests for profiling wrapper arguments and the default collaborator.

use std::path::Path;

use managed_instance::profiling::{
    ProfileArtifacts, ProfileCollaborator, ProfilingMode, SkipCollaborator,
};
use managed_instance::report::Verdict;

#[test]
fn disabled_profiling_has_no_wrapper() {
    let artifacts = ProfileArtifacts::for_mode(ProfilingMode::None, Path::new("/tmp/inst"));
    assert!(artifacts.is_empty());
    assert!(artifacts.wrapper_args("valgrind").is_empty());
}

#[test]
fn memcheck_wrapper_arguments_are_exact() {
    let artifacts = ProfileArtifacts::for_mode(ProfilingMode::Memcheck, Path::new("/tmp/inst"));
    assert_eq!(
        artifacts.wrapper_args("valgrind"),
        vec![
            "valgrind",
            "--tool=memcheck",
            "--log-file=/tmp/inst/valgrind",
            "--track-fds=yes",
            "--read-var-info=yes",
            "--track-origins=yes",
            "--leak-check=full",
            "--xml=yes",
            "--xml-file=/tmp/inst/valgrind.xml",
            "-v",
        ]
    );
}

#[test]
fn callgrind_wrapper_arguments_are_exact() {
    let artifacts = ProfileArtifacts::for_mode(ProfilingMode::Callgrind, Path::new("/tmp/inst"));
    assert_eq!(
        artifacts.wrapper_args("/opt/valgrind"),
        vec![
            "/opt/valgrind",
            "--tool=callgrind",
            "--collect-jumps=yes",
            "--separate-recs=16",
            "--callgrind-out-file=/tmp/inst/callgrind.out",
        ]
    );
    assert!(artifacts.memcheck_xml.is_none());
}

#[test]
fn skip_collaborator_reports_each_artifact_as_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let memcheck = ProfileArtifacts::for_mode(ProfilingMode::Memcheck, dir.path());
    let records = SkipCollaborator.analyze(&memcheck);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "memcheck report");
    assert_eq!(records[0].verdict, Verdict::Skip);
    assert!(records[0].detail.contains("produced no output"));

    let callgrind = ProfileArtifacts::for_mode(ProfilingMode::Callgrind, dir.path());
    std::fs::write(callgrind.callgrind_out.as_ref().unwrap(), "events: Ir\n").unwrap();
    let records = SkipCollaborator.analyze(&callgrind);
    assert_eq!(records[0].name, "callgrind report");
    assert!(records[0].detail.contains("no callgrind post-processor"));
}

#[test]
fn mode_parses_from_snake_case() {
    let mode: ProfilingMode = serde_json::from_str("\"memcheck\"").unwrap();
    assert_eq!(mode, ProfilingMode::Memcheck);
    assert_eq!(ProfilingMode::default(), ProfilingMode::None);
}
