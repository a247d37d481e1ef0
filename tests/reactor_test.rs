//! Integration tests for reactor threads and the dispatch queue

use std::{
    process::Command,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tl_async_engine::{
    reactor::{
        child::{is_tracked, spawn_tracked},
        queue::Payload,
        thread::{ReactorPool, ReactorThread},
        Reactor,
    },
    EngineConfig, EngineError, RegisterEventMode,
};

// the default loop is process-wide, tests claiming it must not overlap
static DEFAULT_LOOP: Mutex<()> = parking_lot::const_mutex(());

fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Test every payload pushed by several producers runs exactly once, in
/// per-producer order, on the reactor thread
#[test]
fn test_dispatch_from_many_producers() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;

    for mode in [RegisterEventMode::Immediate, RegisterEventMode::Deferred] {
        let reactor = ReactorThread::spawn("dispatch-test", mode, false).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let off_thread = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(vec![Vec::new(); PRODUCERS]));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let handle = reactor.handle().clone();
                let runs = runs.clone();
                let off_thread = off_thread.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let runs = runs.clone();
                        let off_thread = off_thread.clone();
                        let seen = seen.clone();
                        handle
                            .run_in_ev_loop_async(Payload::once(move |reactor| {
                                if !reactor.handle().is_in_ev_thread() {
                                    off_thread.fetch_add(1, Ordering::SeqCst);
                                }
                                seen.lock()[p].push(i);
                                runs.fetch_add(1, Ordering::SeqCst);
                            }))
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(wait_for(Duration::from_secs(5), || {
            runs.load(Ordering::SeqCst) == PRODUCERS * PER_PRODUCER
        }));
        reactor.stop();

        assert_eq!(runs.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
        assert_eq!(off_thread.load(Ordering::SeqCst), 0);
        for order in seen.lock().iter() {
            assert_eq!(*order, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }
}

/// Test a second reactor cannot claim the default loop until the first is gone
#[test]
fn test_default_loop_claimed_once() {
    let _guard = DEFAULT_LOOP.lock();

    let first = Reactor::new("default-1", RegisterEventMode::Immediate, true).unwrap();
    assert!(first.handle().uses_default_loop());

    match Reactor::new("default-2", RegisterEventMode::Immediate, true) {
        Err(EngineError::DefaultLoopClaimed(name)) => assert_eq!(name, "default-2"),
        other => panic!("unexpected result: {:?}", other.map(|r| r.name().to_owned())),
    }

    drop(first);
    let again = Reactor::new("default-3", RegisterEventMode::Immediate, true).unwrap();
    assert!(again.handle().uses_default_loop());
}

/// Test a stopped reactor refuses further work
#[test]
fn test_submission_after_stop_fails() {
    let reactor =
        ReactorThread::spawn("stopped-test", RegisterEventMode::Deferred, false).unwrap();
    let handle = reactor.handle().clone();
    reactor.stop();

    assert!(matches!(
        handle.run_in_ev_loop_async(Payload::once(|_| {})),
        Err(EngineError::ReactorStopped)
    ));
}

/// Test exits of tracked children are resolved by the default reactor
#[test]
fn test_tracked_child_exit() {
    let _guard = DEFAULT_LOOP.lock();

    let config = EngineConfig::default()
        .with_ev_threads(2)
        .with_default_ev_loop(true);
    let pool = ReactorPool::new(&config).unwrap();
    let default_loop = pool.default_loop().unwrap().clone();
    assert!(pool.get(1).map_or(false, |h| !h.uses_default_loop()));

    let child = spawn_tracked(&default_loop, Command::new("true").arg("ignored")).unwrap();
    let pid = child.pid();
    let status = futures::executor::block_on(child.wait()).unwrap();

    assert!(status.is_exited());
    assert_eq!(status.exit_code(), Some(0));
    assert!(!is_tracked(pid));

    let plain = pool.get(1).unwrap();
    assert!(matches!(
        spawn_tracked(plain, &mut Command::new("true")),
        Err(EngineError::NotDefaultLoop)
    ));
    pool.stop();
}
