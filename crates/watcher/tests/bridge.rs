//! End-to-end tests of the notification bridge over a scripted backend

mod common;

use common::{recorder, relative, Fixture, Recorded, Seen};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use watcher::{
    EventFlags, EventKind, EventLoop, FsEvent, HandleState, ManualBackend, RawRecord, WatchConfig, WatchError,
};

fn record_into(seen: &Recorded) -> impl FnMut(&FsEvent, Option<&Path>, EventKind, i32) + 'static {
    let seen = seen.clone();
    move |_: &FsEvent, path: Option<&Path>, kind: EventKind, status: i32| {
        assert_eq!(status, 0);
        seen.borrow_mut().push(Seen {
            path: path.map(|p| p.to_path_buf()),
            kind,
            thread: thread::current().id(),
        });
    }
}

fn run_until_seen(fixture: &Fixture, seen: &Recorded, count: usize) {
    fixture.event_loop.run_until(async {
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.borrow().len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    assert_eq!(seen.borrow().len(), count, "timed out waiting for callbacks");
}

#[test]
fn test_callbacks_run_on_event_loop_thread() {
    let fixture = Fixture::new();
    let seen = recorder();
    let _watch = fixture.event_loop.watch(&fixture.root, true, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    let (tx, rx) = crossbeam_channel::bounded(1);
    fixture
        .event_loop
        .fsevents()
        .perform(move || tx.send(thread::current().id()).unwrap())
        .unwrap();
    let notification_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    fixture.backend.emit(
        &fixture.root,
        vec![
            RawRecord::new(fixture.path("a"), EventFlags::ITEM_MODIFIED),
            RawRecord::new(fixture.path("b"), EventFlags::ITEM_CREATED),
        ],
    );
    run_until_seen(&fixture, &seen, 2);

    for event in seen.borrow().iter() {
        assert_eq!(event.thread, thread::current().id());
        assert_ne!(event.thread, notification_thread);
    }
}

#[test]
fn test_close_twice_is_invalid_state() {
    let fixture = Fixture::new();
    let watch = fixture.event_loop.watch(&fixture.root, false, |_, _, _, _| {}).unwrap();

    watch.close().unwrap();
    assert!(matches!(watch.close(), Err(WatchError::InvalidState(_))));

    assert_eq!(fixture.backend.streams_started(), 1);
    assert_eq!(fixture.backend.streams_stopped(), 1);
    assert_eq!(fixture.backend.streams_released(), 1);
}

#[test]
fn test_queued_events_are_discarded_on_close() {
    let fixture = Fixture::new();
    let seen = recorder();
    let watch = fixture.event_loop.watch(&fixture.root, true, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    let records: Vec<_> = (0..16)
        .map(|i| RawRecord::new(fixture.path(&format!("f{}", i)), EventFlags::ITEM_MODIFIED))
        .collect();
    fixture.backend.emit(&fixture.root, records);

    // Delivered on the notification thread while the event loop is not running
    let deadline = Instant::now() + Duration::from_secs(5);
    while watch.pending_events() < 16 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(watch.pending_events(), 16);

    watch.close().unwrap();
    assert_eq!(watch.pending_events(), 0);

    fixture.pump(Duration::from_millis(50));
    assert!(seen.borrow().is_empty());
}

#[test]
fn test_non_recursive_watch_only_sees_immediate_children() {
    let fixture = Fixture::new();
    let seen = recorder();
    let _watch = fixture.event_loop.watch(&fixture.root, false, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    fixture.backend.emit(
        &fixture.root,
        vec![
            RawRecord::new(fixture.path("a/b/c"), EventFlags::ITEM_MODIFIED),
            RawRecord::new(fixture.path("a/b"), EventFlags::ITEM_MODIFIED),
            RawRecord::new(fixture.path("a"), EventFlags::ITEM_MODIFIED),
        ],
    );
    run_until_seen(&fixture, &seen, 1);
    fixture.pump(Duration::from_millis(20));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, relative("a"));
    assert_eq!(seen[0].kind, EventKind::Change);
}

#[test]
fn test_recursive_watch_sees_descendants() {
    let fixture = Fixture::new();
    let seen = recorder();
    let _watch = fixture.event_loop.watch(&fixture.root, true, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    fixture.backend.emit(
        &fixture.root,
        vec![RawRecord::new(fixture.path("a/b/c"), EventFlags::ITEM_CREATED)],
    );
    run_until_seen(&fixture, &seen, 1);
    assert_eq!(seen.borrow()[0].path, relative("a/b/c"));
}

#[test]
fn test_classification_end_to_end() {
    let fixture = Fixture::new();
    let seen = recorder();
    let _watch = fixture.event_loop.watch(&fixture.root, true, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    fixture.backend.emit(
        &fixture.root,
        vec![
            RawRecord::new(fixture.path("content"), EventFlags::ITEM_MODIFIED | EventFlags::ITEM_IS_FILE),
            RawRecord::new(fixture.path("gone"), EventFlags::ITEM_MODIFIED | EventFlags::ITEM_REMOVED),
            RawRecord::new(fixture.path("owner"), EventFlags::ITEM_CHANGE_OWNER),
            RawRecord::new(fixture.path("moved"), EventFlags::ITEM_RENAMED),
        ],
    );
    run_until_seen(&fixture, &seen, 4);

    let kinds: Vec<_> = seen.borrow().iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Change, EventKind::Rename, EventKind::Change, EventKind::Rename]
    );
}

#[test]
fn test_noise_records_never_reach_callback() {
    let fixture = Fixture::new();
    let seen = recorder();
    let _watch = fixture.event_loop.watch(&fixture.root, true, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    fixture.backend.emit(
        &fixture.root,
        vec![
            RawRecord::new(&fixture.root, EventFlags::MUST_SCAN_SUBDIRS | EventFlags::USER_DROPPED),
            RawRecord::new(&fixture.root, EventFlags::EVENT_IDS_WRAPPED),
            RawRecord::new(fixture.path("real"), EventFlags::ITEM_CREATED),
        ],
    );
    run_until_seen(&fixture, &seen, 1);
    assert_eq!(seen.borrow()[0].path, relative("real"));
}

#[test]
fn test_batches_keep_arrival_order() {
    let fixture = Fixture::new();
    let seen = recorder();
    let _watch = fixture.event_loop.watch(&fixture.root, true, record_into(&seen)).unwrap();
    fixture.wait_for_streams(1);

    for batch in 0..4 {
        let records = (0..5)
            .map(|i| RawRecord::new(fixture.path(&format!("{}-{}", batch, i)), EventFlags::ITEM_MODIFIED))
            .collect();
        fixture.backend.emit(&fixture.root, records);
    }
    run_until_seen(&fixture, &seen, 20);

    let paths: Vec<_> = seen.borrow().iter().filter_map(|s| s.path.clone()).collect();
    let expected: Vec<_> = (0..4)
        .flat_map(|batch| (0..5).map(move |i| PathBuf::from(format!("{}-{}", batch, i))))
        .collect();
    assert_eq!(paths, expected);
}

#[test]
fn test_many_watches_share_one_notification_thread() {
    let fixture = Fixture::new();
    let watches: Vec<_> = (0..6)
        .map(|i| {
            let dir = fixture.path(&format!("dir{}", i));
            std::fs::create_dir(&dir).unwrap();
            fixture.event_loop.watch(&dir, false, |_, _, _, _| {}).unwrap()
        })
        .collect();

    assert_eq!(fixture.event_loop.active_handles(), 6);
    assert_eq!(fixture.event_loop.fsevents().threads_spawned(), 1);

    for watch in &watches {
        watch.close().unwrap();
    }
    assert_eq!(fixture.backend.streams_released(), 6);
    assert_eq!(fixture.event_loop.active_handles(), 0);
}

#[test]
fn test_shared_batch_is_scoped_to_each_watch() {
    let fixture = Fixture::new();
    let left_dir = fixture.path("left");
    let right_dir = fixture.path("right");
    std::fs::create_dir(&left_dir).unwrap();
    std::fs::create_dir(&right_dir).unwrap();

    let left = recorder();
    let right = recorder();
    let _left_watch = fixture.event_loop.watch(&left_dir, false, record_into(&left)).unwrap();
    let _right_watch = fixture.event_loop.watch(&right_dir, false, record_into(&right)).unwrap();
    fixture.wait_for_streams(2);

    let queued = fixture.backend.emit_all(vec![
        RawRecord::new(left_dir.join("one"), EventFlags::ITEM_CREATED),
        RawRecord::new(right_dir.join("two"), EventFlags::ITEM_MODIFIED),
        RawRecord::new(left_dir.join("nested/three"), EventFlags::ITEM_MODIFIED),
    ]);
    assert_eq!(queued, 2);

    run_until_seen(&fixture, &left, 1);
    run_until_seen(&fixture, &right, 1);
    fixture.pump(Duration::from_millis(20));

    let summary = |seen: &Recorded| -> Vec<(Option<PathBuf>, EventKind)> {
        seen.borrow().iter().map(|s| (s.path.clone(), s.kind)).collect()
    };
    assert_eq!(summary(&left), vec![(relative("one"), EventKind::Rename)]);
    assert_eq!(summary(&right), vec![(relative("two"), EventKind::Change)]);
}

#[test]
fn test_watch_and_close_after_panicking_work() {
    let fixture = Fixture::new();
    let fsevents = fixture.event_loop.fsevents();
    fsevents.ensure_started().unwrap();
    fsevents.perform(|| panic!("deferred work failed")).unwrap();

    let watch = fixture.event_loop.watch(&fixture.root, true, |_, _, _, _| {}).unwrap();
    fixture.wait_for_streams(1);
    watch.close().unwrap();

    assert_eq!(watch.state(), HandleState::Closed);
    assert_eq!(fixture.backend.streams_released(), 1);
    assert_eq!(fixture.event_loop.fsevents().threads_spawned(), 1);
}

#[test]
fn test_run_returns_once_watch_closes() {
    let fixture = Fixture::new();
    let _watch = fixture
        .event_loop
        .watch(&fixture.root, true, |watch, _, _, _| {
            watch.close().unwrap();
        })
        .unwrap();
    fixture.wait_for_streams(1);

    // Not idle while the watch is active
    assert!(!fixture.event_loop.run_for(Duration::from_millis(20)));

    fixture.backend.emit(
        &fixture.root,
        vec![RawRecord::new(fixture.path("x"), EventFlags::ITEM_CREATED)],
    );
    fixture.event_loop.run();
    assert_eq!(fixture.event_loop.active_handles(), 0);
}

#[test]
fn test_stop_closes_watch() {
    let fixture = Fixture::new();
    let watch = fixture.event_loop.watch(&fixture.root, true, |_, _, _, _| {}).unwrap();

    watch.stop().unwrap();
    assert_eq!(watch.state(), HandleState::Closed);
    assert!(!watch.is_active());
    assert_eq!(fixture.backend.streams_released(), 1);
}

#[test]
fn test_unsupported_backend_still_watches() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let backend = ManualBackend::unsupported();
    let event_loop = EventLoop::with_backend(WatchConfig::default(), Arc::new(backend.clone())).unwrap();

    let watch = event_loop.watch(temp_dir.path(), true, |_, _, _, _| {}).unwrap();
    assert!(watch.is_active());
    assert_eq!(backend.streams_created(), 0);

    watch.close().unwrap();
    assert_eq!(watch.state(), HandleState::Closed);
}

#[test]
fn test_strict_paths() {
    let strict = Fixture::with_config(WatchConfig {
        strict_paths: true,
        ..WatchConfig::default()
    });
    let missing = strict.path("missing");
    let err = strict.event_loop.watch(&missing, false, |_, _, _, _| {}).unwrap_err();
    assert!(matches!(err, WatchError::InvalidPath { .. }));

    // Without strict mode the watch proceeds and keeps paths verbatim
    let lenient = Fixture::new();
    let seen = recorder();
    let missing = lenient.path("missing");
    let watch = lenient.event_loop.watch(&missing, true, record_into(&seen)).unwrap();
    assert!(watch.resolved_path().is_none());
    lenient.wait_for_streams(1);

    lenient.backend.emit(
        &missing,
        vec![RawRecord::new(missing.join("child"), EventFlags::ITEM_MODIFIED)],
    );
    run_until_seen(&lenient, &seen, 1);
    assert_eq!(seen.borrow()[0].path, Some(missing.join("child")));
}

#[test]
fn test_close_after_event_loop_dropped() {
    let fixture = Fixture::new();
    let watch = fixture.event_loop.watch(&fixture.root, true, |_, _, _, _| {}).unwrap();
    fixture.wait_for_streams(1);

    let Fixture {
        temp_dir: _temp_dir,
        backend,
        event_loop,
        ..
    } = fixture;
    drop(event_loop);

    watch.close().unwrap();
    assert_eq!(backend.streams_released(), 1);
    assert_eq!(watch.state(), HandleState::Closed);
}

#[test]
fn test_native_backend_reports_file_creation() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    let config = WatchConfig {
        latency_ms: 20,
        ..WatchConfig::default()
    };
    let event_loop = EventLoop::with_backend(config, Arc::new(watcher::NativeBackend::new())).unwrap();

    let seen = recorder();
    let watch = event_loop.watch(&root, false, record_into(&seen)).unwrap();

    // Give the native watcher time to arm before touching the tree
    event_loop.run_until(async { tokio::time::sleep(Duration::from_millis(100)).await });
    std::fs::write(root.join("created.txt"), b"data").unwrap();

    event_loop.run_until(async {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !seen.borrow().iter().any(|s| s.path == relative("created.txt")) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    assert!(seen.borrow().iter().any(|s| s.path == relative("created.txt")));

    watch.close().unwrap();
}
