use std::fs;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::sleep;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::backend::TEST_RUNNING_WORKER_COUNT;
use crate::{DirEvent, DirEventKind, Error, Watcher};

/// Serializes tests that start native backends, so worker counts and timings stay predictable.
pub(crate) static TEST_PARALLEL_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const LATENCY: Duration = Duration::from_millis(50);
const DEADLINE: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

fn watched_dir(watcher: &Watcher) -> (TempDir, PathBuf) {
    let dir = tempdir().expect("to be created");
    let path = dir.path().canonicalize().expect("to succeed");
    watcher.add_directory(&path).expect("to be watched");
    (dir, path)
}

fn test_watcher() -> Watcher {
    Watcher::builder().latency(LATENCY).build()
}

fn collect_events(watcher: &Watcher, count: usize) -> Vec<DirEvent> {
    let deadline = Instant::now() + DEADLINE;
    let mut events = Vec::with_capacity(count);
    while events.len() < count && Instant::now() < deadline {
        match watcher.try_pop() {
            Some(Ok(event)) => events.push(event),
            Some(Err(e)) => panic!("unexpected error: {}", e),
            None => sleep(Duration::from_millis(10)),
        }
    }
    events
}

fn assert_quiet(watcher: &Watcher) {
    sleep(QUIET_PERIOD);
    let leftover: Vec<_> = std::iter::from_fn(|| watcher.try_pop()).collect();
    assert!(leftover.is_empty(), "unexpected events: {:?}", leftover);
}

#[test]
fn must_report_added_directory() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);

    fs::create_dir(path.join("child")).expect("to be created");

    assert_eq!(watcher.pop().expect("an event"), DirEvent::added(path.join("child")));
}

#[test]
fn must_report_removed_directory() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);
    fs::create_dir(path.join("child")).expect("to be created");
    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(path.join("child"))]);

    fs::remove_dir(path.join("child")).expect("to be removed");

    assert_eq!(
        collect_events(&watcher, 1),
        [DirEvent::removed(path.join("child"))]
    );
}

#[test]
fn must_report_modified_file() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);
    let file = path.join("file");
    fs::write(&file, b"before").expect("to be written");
    sleep(QUIET_PERIOD);
    while watcher.try_pop().is_some() {}

    fs::write(&file, b"after").expect("to be written");

    // Some backends repeat earlier flags of a path alongside the modification.
    let event = loop {
        let event = watcher.pop().expect("an event");
        assert_eq!(event.path, file);
        if event.kind != DirEventKind::Added {
            break event;
        }
    };
    assert_eq!(event.kind, DirEventKind::Modified);
}

#[test]
fn must_pair_rename_halves() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);
    fs::create_dir(path.join("a")).expect("to be created");
    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(path.join("a"))]);

    fs::rename(path.join("a"), path.join("b")).expect("to be renamed");

    assert_eq!(
        collect_events(&watcher, 2),
        [
            DirEvent::renamed_old_name(path.join("a")),
            DirEvent::renamed_new_name(path.join("b")),
        ]
    );
}

#[test]
fn must_report_create_rename_remove_sequence() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);

    fs::create_dir(path.join("a")).expect("to be created");
    fs::rename(path.join("a"), path.join("b")).expect("to be renamed");
    fs::remove_dir(path.join("b")).expect("to be removed");

    assert_eq!(
        collect_events(&watcher, 4),
        [
            DirEvent::added(path.join("a")),
            DirEvent::renamed_old_name(path.join("a")),
            DirEvent::renamed_new_name(path.join("b")),
            DirEvent::removed(path.join("b")),
        ]
    );
    assert_quiet(&watcher);
}

#[test]
fn must_report_added_file_once() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);

    drop(File::create(path.join("f")).expect("to be created"));

    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(path.join("f"))]);
    assert_quiet(&watcher);
}

#[test]
fn must_report_removed_file() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);
    drop(File::create(path.join("f")).expect("to be created"));
    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(path.join("f"))]);

    fs::remove_file(path.join("f")).expect("to be removed");

    assert_eq!(collect_events(&watcher, 1), [DirEvent::removed(path.join("f"))]);
}

#[test]
fn must_pair_file_rename_halves() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);
    drop(File::create(path.join("f1")).expect("to be created"));
    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(path.join("f1"))]);

    fs::rename(path.join("f1"), path.join("f2")).expect("to be renamed");

    assert_eq!(
        collect_events(&watcher, 2),
        [
            DirEvent::renamed_old_name(path.join("f1")),
            DirEvent::renamed_new_name(path.join("f2")),
        ]
    );
}

#[test]
fn must_report_file_create_rename_remove_sequence() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);

    drop(File::create(path.join("f1")).expect("to be created"));
    fs::rename(path.join("f1"), path.join("f2")).expect("to be renamed");
    fs::remove_file(path.join("f2")).expect("to be removed");

    assert_eq!(
        collect_events(&watcher, 4),
        [
            DirEvent::added(path.join("f1")),
            DirEvent::renamed_old_name(path.join("f1")),
            DirEvent::renamed_new_name(path.join("f2")),
            DirEvent::removed(path.join("f2")),
        ]
    );
    assert_quiet(&watcher);
}

#[test]
fn must_keep_watching_after_watched_directory_is_deleted() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_a, a) = watched_dir(&watcher);
    let (_b, b) = watched_dir(&watcher);

    fs::remove_dir(&b).expect("to be removed");
    assert_eq!(collect_events(&watcher, 1), [DirEvent::removed(b.clone())]);

    let (_c, c) = watched_dir(&watcher);
    let mut expected = vec![a.clone(), c.clone()];
    expected.sort();
    assert_eq!(watcher.directories(), expected);
    assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 1);

    fs::create_dir(a.join("x")).expect("to be created");
    fs::create_dir(c.join("y")).expect("to be created");
    let mut events = collect_events(&watcher, 2);
    events.sort_by(|l, r| l.path.cmp(&r.path));
    let mut expected = vec![DirEvent::added(a.join("x")), DirEvent::added(c.join("y"))];
    expected.sort_by(|l, r| l.path.cmp(&r.path));
    assert_eq!(events, expected);

    // Removing the vanished directory is a no-op and leaves the others watched.
    watcher.remove_directory(&b);
    fs::create_dir(a.join("z")).expect("to be created");
    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(a.join("z"))]);
}

#[test]
fn must_rescan_when_renamed_out_of_watch_set() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);
    let outside = tempdir().expect("to be created");
    fs::create_dir(path.join("a")).expect("to be created");
    assert_eq!(collect_events(&watcher, 1), [DirEvent::added(path.join("a"))]);

    fs::rename(path.join("a"), outside.path().join("a")).expect("to be renamed");

    let event = watcher.pop().expect("an event");
    assert_eq!(event.kind, DirEventKind::RecursiveRescan);
    assert_eq!(event.path, path);
}

#[test]
fn must_isolate_watchers() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let first = test_watcher();
    let second = test_watcher();
    let (_a, a) = watched_dir(&first);
    let (_b, b) = watched_dir(&second);
    let unwatched = tempdir().expect("to be created");

    fs::create_dir(unwatched.path().join("z")).expect("to be created");
    fs::create_dir(a.join("x")).expect("to be created");
    fs::create_dir(b.join("y")).expect("to be created");

    assert_eq!(collect_events(&first, 1), [DirEvent::added(a.join("x"))]);
    assert_eq!(collect_events(&second, 1), [DirEvent::added(b.join("y"))]);
    assert_quiet(&first);
    assert_quiet(&second);
}

#[test]
fn must_watch_multiple_directories() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_a, a) = watched_dir(&watcher);
    let (_b, b) = watched_dir(&watcher);

    fs::create_dir(a.join("x")).expect("to be created");
    sleep(QUIET_PERIOD);
    fs::create_dir(b.join("y")).expect("to be created");

    assert_eq!(
        collect_events(&watcher, 2),
        [DirEvent::added(a.join("x")), DirEvent::added(b.join("y"))]
    );
}

#[test]
fn must_stop_reporting_removed_directory() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);

    watcher.remove_directory(&path);
    fs::create_dir(path.join("child")).expect("to be created");

    assert_quiet(&watcher);
    assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 0);
}

#[test]
fn must_join_workers_on_drop() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_a, _) = watched_dir(&watcher);
    let (_b, _) = watched_dir(&watcher);
    assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 1);

    drop(watcher);

    assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 0);
}

#[test]
fn must_abort_blocked_pop_on_drop() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, _) = watched_dir(&watcher);
    let receiver = watcher.receiver();

    let consumer = thread::spawn(move || receiver.pop());
    sleep(Duration::from_millis(50));
    drop(watcher);

    let result = consumer.join().expect("consumer not to panic");
    assert!(matches!(result, Err(Error::Aborted)));
}

#[test]
fn must_abort_pending_async_pop_once() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime to be built");
    let watcher = Watcher::builder()
        .latency(LATENCY)
        .reactor(rt.handle().clone())
        .build();
    let (_dir, _) = watched_dir(&watcher);

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let callback_calls = Arc::clone(&calls);
    watcher
        .async_pop(move |result| {
            callback_calls.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        })
        .expect("to be registered");
    drop(watcher);

    // Timers must be created inside the runtime.
    let result = rt
        .block_on(async { timeout(DEADLINE, rx).await })
        .expect("to complete")
        .expect("callback to run");
    assert!(matches!(result, Err(Error::Aborted)));

    rt.block_on(async { tokio::time::sleep(QUIET_PERIOD).await });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn must_complete_async_pop_on_reactor_thread() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime to be built");
    let watcher = Watcher::builder()
        .latency(LATENCY)
        .reactor(rt.handle().clone())
        .build();
    let (_dir, path) = watched_dir(&watcher);

    let (tx, rx) = oneshot::channel();
    watcher
        .async_pop(move |result| {
            let _ = tx.send((result, thread::current().id()));
        })
        .expect("to be registered");
    fs::create_dir(path.join("child")).expect("to be created");

    let (result, callback_thread) = rt
        .block_on(async { timeout(DEADLINE, rx).await })
        .expect("to complete")
        .expect("callback to run");
    assert_eq!(result.expect("an event"), DirEvent::added(path.join("child")));
    assert_eq!(callback_thread, thread::current().id());
}

#[tokio::test]
async fn must_stream_events() {
    let _guard = TEST_PARALLEL_LOCK.lock();
    let watcher = test_watcher();
    let (_dir, path) = watched_dir(&watcher);

    fs::create_dir(path.join("a")).expect("to be created");
    fs::remove_dir(path.join("a")).expect("to be removed");

    let events: Vec<_> = timeout(DEADLINE, watcher.events().take(2).collect())
        .await
        .expect("to complete");
    assert_eq!(
        events,
        [DirEvent::added(path.join("a")), DirEvent::removed(path.join("a"))]
    );
}
