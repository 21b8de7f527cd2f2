#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use datacat::lock::PriorityLock;

/// Long enough for a blocked thread to have reached its wait.
const SETTLE: Duration = Duration::from_millis(100);

#[test]
fn exclusive_holders_never_overlap_with_anyone() {
    let lock = Arc::new(PriorityLock::new());
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let lock = Arc::clone(&lock);
            let readers = Arc::clone(&readers);
            let writers = Arc::clone(&writers);
            thread::spawn(move || {
                for _ in 0..200 {
                    if i % 4 == 0 {
                        let _guard = lock.write();
                        assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        writers.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _guard = lock.read();
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0);
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn shared_holders_run_concurrently() {
    let lock = Arc::new(PriorityLock::new());
    let (tx, rx) = mpsc::channel();
    let _held = lock.read();

    let other = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let _guard = lock.read();
            tx.send(()).unwrap();
        })
    };
    rx.recv_timeout(Duration::from_secs(5))
        .expect("second reader must not wait for the first");
    other.join().unwrap();
}

#[test]
fn pending_writer_blocks_new_readers() {
    let lock = Arc::new(PriorityLock::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (held_tx, held_rx) = mpsc::channel();

    let first_reader = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let _guard = lock.read();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
    };
    held_rx.recv().unwrap();

    let writer = {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            let _guard = lock.write();
            order.lock().unwrap().push("writer");
            thread::sleep(SETTLE);
        })
    };
    thread::sleep(SETTLE);

    let late_reader = {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            let _guard = lock.read();
            order.lock().unwrap().push("late reader");
        })
    };
    thread::sleep(SETTLE);
    assert!(
        order.lock().unwrap().is_empty(),
        "neither the writer nor the late reader may run while the first reader holds the lock"
    );

    release_tx.send(()).unwrap();
    first_reader.join().unwrap();
    writer.join().unwrap();
    late_reader.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["writer", "late reader"]);
}

#[test]
fn writer_queued_behind_writer_goes_before_later_readers() {
    let lock = Arc::new(PriorityLock::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let held = lock.write();

    let queued_writer = {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            let _guard = lock.write();
            order.lock().unwrap().push("writer");
            thread::sleep(SETTLE);
        })
    };
    thread::sleep(SETTLE);

    let readers: Vec<_> = (0..6)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.read();
                order.lock().unwrap().push("reader");
            })
        })
        .collect();
    thread::sleep(SETTLE);
    assert!(order.lock().unwrap().is_empty());

    drop(held);
    queued_writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 7);
    assert_eq!(order[0], "writer", "readers were admitted ahead of the queued writer");
}

#[test]
fn expired_queued_writer_lets_readers_in() {
    let lock = Arc::new(PriorityLock::new());
    let held = lock.write();

    let timed_writer = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || lock.try_lock_exclusive(Duration::from_millis(50)))
    };
    assert!(!timed_writer.join().unwrap());
    drop(held);

    let (tx, rx) = mpsc::channel();
    let reader = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let _guard = lock.read();
            tx.send(()).unwrap();
        })
    };
    rx.recv_timeout(Duration::from_secs(5))
        .expect("a withdrawn request must not hold readers back");
    reader.join().unwrap();
}

#[test]
fn release_is_idempotent() {
    let lock = PriorityLock::new();
    assert!(lock.lock_exclusive());
    lock.release();
    lock.release();
    assert!(!lock.is_exclusive_held_by_caller());

    assert!(lock.lock_shared());
    lock.release();
    lock.release();
    assert!(!lock.is_shared_held_by_caller());

    // The lock is still usable by other threads.
    let lock = Arc::new(lock);
    let other = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || lock.try_lock_exclusive(Duration::from_secs(1)))
    };
    assert!(other.join().unwrap());
}

#[test]
fn timed_exclusive_succeeds_once_readers_leave() {
    let lock = Arc::new(PriorityLock::new());
    let (held_tx, held_rx) = mpsc::channel();

    let reader = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let _guard = lock.read();
            held_tx.send(()).unwrap();
            thread::sleep(SETTLE);
        })
    };
    held_rx.recv().unwrap();

    assert!(lock.try_lock_exclusive(Duration::from_secs(5)));
    assert!(lock.is_exclusive_held_by_caller());
    lock.release();
    reader.join().unwrap();
}
