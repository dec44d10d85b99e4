use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use session_recorder_rs::{
    AiffSummary, DeviceSelector, ErrorKind, Recorder, RecorderConfig, RecorderError,
    SampleSource, SessionState, SyntheticSource,
};
use tracing_test::traced_test;

const BATCH_FRAMES: usize = 64;

fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        record_path: dir.to_path_buf(),
        input_buffer_size: BATCH_FRAMES,
        stop_timeout: Some(Duration::from_secs(2)),
        ..RecorderConfig::default()
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn files_under(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(next) = pending.pop() {
        for entry in std::fs::read_dir(next).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

#[test]
#[traced_test]
fn concurrent_sessions_register_independently() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::new(
        config(dir.path()),
        Arc::new(SyntheticSource::default()),
    ));

    let handles: Vec<_> = [("left", 0), ("right", 1)]
        .into_iter()
        .map(|(id, device)| {
            let recorder = recorder.clone();
            thread::spawn(move || recorder.start_session(id, DeviceSelector::Index(device)))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(recorder.session_count(), 2);
    assert_eq!(recorder.session_ids(), vec!["left", "right"]);

    let report = recorder.stop_all();
    assert!(report.is_complete());
    assert_eq!(report.stopped.len(), 2);
    assert_eq!(recorder.session_count(), 0);
}

#[test]
#[traced_test]
fn duplicate_id_is_rejected_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::new(config(dir.path()), Arc::new(SyntheticSource::default()));

    let first = recorder.start_session("mic", DeviceSelector::Index(0)).unwrap();
    assert!(matches!(
        recorder.start_session("mic", DeviceSelector::Index(1)),
        Err(RecorderError::AlreadyExists(id)) if id == "mic"
    ));
    assert_eq!(recorder.session_count(), 1);

    assert_eq!(recorder.stop_session("mic").unwrap(), first);
    recorder.start_session("mic", DeviceSelector::Index(1)).unwrap();
    recorder.stop_session("mic").unwrap();
}

#[test]
#[traced_test]
fn stop_reports_unknown_and_idle_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::new(config(dir.path()), Arc::new(SyntheticSource::default()));

    assert!(matches!(
        recorder.stop_session("ghost"),
        Err(RecorderError::NotFound(id)) if id == "ghost"
    ));

    recorder.create_session("idle", 0).unwrap();
    assert!(matches!(
        recorder.stop_session("idle"),
        Err(RecorderError::NotRecording(id)) if id == "idle"
    ));
    assert_eq!(
        recorder.session_info("idle").unwrap().state,
        SessionState::Idle
    );
}

#[test]
#[traced_test]
fn stopped_file_is_a_finalized_container() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::new(config(dir.path()), Arc::new(SyntheticSource::default()));

    let path = recorder.start_session("take", DeviceSelector::Index(0)).unwrap();
    assert!(path.starts_with(dir.path().join("take")));
    assert_eq!(path.extension().unwrap(), "aiff");

    let session = recorder.session("take").unwrap();
    wait_until("a few batches", || session.frames_written() >= 3 * BATCH_FRAMES as u64);
    assert!(session.is_recording());
    drop(session);

    let stopped = recorder.stop_session("take").unwrap();
    assert_eq!(stopped, path);

    let summary = AiffSummary::read_file(&path).unwrap();
    assert!(summary.frames > 0);
    assert_eq!(summary.frames as usize % BATCH_FRAMES, 0);
    assert_eq!(summary.channels, 1);
    assert_eq!(summary.bits_per_sample, 32);
    assert_eq!(summary.sample_rate, Some(48_000));
    assert_eq!(summary.form_size, 46 + 4 * summary.frames);
    assert_eq!(summary.sound_chunk_size, 8 + 4 * summary.frames);

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 54 + 4 * u64::from(summary.frames));
}

#[test]
#[traced_test]
fn concurrent_stops_succeed_once() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::new(
        config(dir.path()),
        Arc::new(SyntheticSource::default()),
    ));
    recorder.start_session("race", DeviceSelector::Index(0)).unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let recorder = recorder.clone();
            thread::spawn(move || recorder.stop_session("race"))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(RecorderError::StopInProgress(_))
            | Err(RecorderError::NotRecording(_))
            | Err(RecorderError::NotFound(_))
    )));
}

#[test]
#[traced_test]
fn stop_all_returns_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = SyntheticSource::new(["Mic A (hw:0,0)", "Mic B (hw:1,0)", "Mic C (hw:2,0)"]);
    let recorder = Recorder::new(config(dir.path()), Arc::new(source));

    for (id, device) in [("a", 0), ("b", 1), ("c", 2)] {
        recorder.start_session(id, DeviceSelector::Index(device)).unwrap();
    }
    recorder.create_session("never-started", 0).unwrap();

    let report = recorder.stop_all();
    assert!(report.is_complete());
    assert_eq!(
        report.stopped.keys().collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
    for path in report.stopped.values() {
        let summary = AiffSummary::read_file(path).unwrap();
        assert_eq!(summary.form_size, 46 + 4 * summary.frames);
    }

    // idle sessions are neither stopped nor reported as failures
    assert_eq!(recorder.session_ids(), vec!["never-started"]);
    let (_, error) = recorder.stop_all().into_parts();
    assert!(error.is_none());
}

#[test]
#[traced_test]
fn backend_initializes_once_for_many_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(SyntheticSource::new([
        "Mic 0 (hw:0,0)",
        "Mic 1 (hw:1,0)",
        "Mic 2 (hw:2,0)",
        "Mic 3 (hw:3,0)",
    ]));
    let recorder = Arc::new(Recorder::new(
        config(dir.path()),
        source.clone() as Arc<dyn SampleSource>,
    ));

    let handles: Vec<_> = (0..4)
        .map(|device| {
            let recorder = recorder.clone();
            thread::spawn(move || {
                recorder.start_session(&format!("s{device}"), DeviceSelector::Index(device))
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(source.init_calls(), 1);
    assert_eq!(source.opened_streams(), 4);
    assert!(recorder.stop_all().is_complete());
}

#[test]
#[traced_test]
fn unsupported_format_creates_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        sample_rate: 12_345,
        ..config(dir.path())
    };
    let recorder = Recorder::new(config, Arc::new(SyntheticSource::default()));

    assert!(matches!(
        recorder.start_session("odd", DeviceSelector::Index(0)),
        Err(RecorderError::UnsupportedSampleRate(12_345))
    ));
    assert_eq!(recorder.session_count(), 0);
    assert!(files_under(dir.path()).is_empty());
}

#[test]
#[traced_test]
fn device_open_failure_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        channels: 4,
        ..config(dir.path())
    };
    let recorder = Recorder::new(config, Arc::new(SyntheticSource::default()));

    let err = recorder.start_session("wide", DeviceSelector::Index(0)).unwrap_err();
    assert!(matches!(err, RecorderError::Device(_)));
    assert_eq!(recorder.session_count(), 0);
    assert!(files_under(dir.path()).is_empty());
    assert!(!dir.path().join("wide").exists());
}

#[test]
#[traced_test]
fn restarting_an_id_keeps_the_previous_take() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::new(config(dir.path()), Arc::new(SyntheticSource::default()));

    recorder.start_session("mic", DeviceSelector::Index(0)).unwrap();
    let session = recorder.session("mic").unwrap();
    wait_until("a few batches", || {
        session.frames_written() >= 3 * BATCH_FRAMES as u64
    });
    drop(session);
    let first = recorder.stop_session("mic").unwrap();
    let committed = AiffSummary::read_file(&first).unwrap();
    assert!(committed.frames >= 3 * BATCH_FRAMES as u32);

    // a restart within the same second reuses the timestamped name
    let second = recorder.start_session("mic", DeviceSelector::Index(0)).unwrap();
    assert_ne!(second, first);
    assert_eq!(second.parent(), first.parent());
    assert_eq!(AiffSummary::read_file(&first).unwrap(), committed);

    assert_eq!(recorder.stop_session("mic").unwrap(), second);
    assert_eq!(AiffSummary::read_file(&first).unwrap(), committed);
    assert_eq!(files_under(dir.path()).len(), 2);
}

#[test]
#[traced_test]
fn session_ids_cannot_leave_the_recordings_root() {
    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("recordings");
    let recorder = Recorder::new(config(&root), Arc::new(SyntheticSource::default()));

    let absolute = outer.path().join("absolute").to_string_lossy().into_owned();
    for id in ["../escaped", absolute.as_str(), "", ".", "a/b"] {
        let err = recorder
            .start_session(id, DeviceSelector::Index(0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(
            matches!(err, RecorderError::InvalidSessionId(ref rejected) if rejected == id),
            "{id:?} gave {err:?}"
        );
        assert!(matches!(
            recorder.create_session(id, 0),
            Err(RecorderError::InvalidSessionId(_))
        ));
    }

    assert_eq!(recorder.session_count(), 0);
    assert!(files_under(outer.path()).is_empty());
}

#[test]
#[traced_test]
fn devices_resolve_by_index_and_name() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::new(config(dir.path()), Arc::new(SyntheticSource::default()));

    assert!(matches!(
        recorder.start_session("far", DeviceSelector::Index(9)),
        Err(RecorderError::DeviceOutOfRange { index: 9, available: 2 })
    ));

    let path = recorder.start_session_by_name("named", "mic b").unwrap();
    let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("device_1_"), "{file_name}");
    assert_eq!(recorder.session_info("named").unwrap().device_index, 1);

    assert!(matches!(
        recorder.start_session_by_name("nope", "bluetooth"),
        Err(RecorderError::DeviceNotFound(_))
    ));

    let path = recorder.start_session("default", DeviceSelector::Default).unwrap();
    assert!(path.to_string_lossy().contains("device_0_"));
    assert!(recorder.stop_all().is_complete());
}
