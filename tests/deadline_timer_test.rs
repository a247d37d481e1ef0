//! Integration tests for deadline timers on real reactor threads

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::Rng;
use tl_async_engine::{
    reactor::thread::ReactorThread, task::Epoch, DeadlineTimer, RegisterEventMode, TimerAction,
    TimerTarget,
};

#[derive(Default)]
struct Recorder(Mutex<Vec<(TimerAction, Instant)>>);

impl TimerTarget for Recorder {
    fn on_deadline(self: Arc<Self>, action: TimerAction) {
        self.0.lock().push((action, Instant::now()));
    }
}

impl Recorder {
    fn actions(&self) -> Vec<TimerAction> {
        self.0.lock().iter().map(|(action, _)| *action).collect()
    }
}

fn reactor(mode: RegisterEventMode) -> ReactorThread {
    ReactorThread::spawn("timer-test", mode, false).unwrap()
}

/// Test a timer fires once, not before its deadline
#[test]
fn test_fires_after_deadline() {
    for mode in [RegisterEventMode::Immediate, RegisterEventMode::Deferred] {
        let reactor = reactor(mode);
        let target = Arc::new(Recorder::default());
        let mut timer = DeadlineTimer::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        timer.start_cancel(target.clone(), reactor.handle(), deadline);

        thread::sleep(Duration::from_millis(150));
        let fired = target.0.lock().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, TimerAction::Cancel);
        assert!(fired[0].1 >= deadline);
    }
}

/// Test finalizing right after start means the timer never fires
#[test]
fn test_finalize_before_expiry() {
    let reactor = reactor(RegisterEventMode::Deferred);
    let target = Arc::new(Recorder::default());
    let mut timer = DeadlineTimer::new();
    timer.start_wakeup(
        target.clone(),
        reactor.handle(),
        Instant::now() + Duration::from_millis(42),
        Epoch::new(1),
    );
    timer.finalize();

    thread::sleep(Duration::from_millis(100));
    assert!(target.actions().is_empty());
    assert_eq!(Arc::strong_count(&target), 1);
}

/// Test finalize is idempotent and releases the target exactly once
#[test]
fn test_finalize_twice() {
    let reactor = reactor(RegisterEventMode::Immediate);
    let target = Arc::new(Recorder::default());

    let mut never_started = DeadlineTimer::new();
    never_started.finalize();
    never_started.finalize();

    let mut timer = DeadlineTimer::new();
    timer.start_cancel(
        target.clone(),
        reactor.handle(),
        Instant::now() + Duration::from_secs(60),
    );
    timer.finalize();
    timer.finalize();
    drop(timer);

    let until = Instant::now() + Duration::from_secs(5);
    while Arc::strong_count(&target) > 1 && Instant::now() < until {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(Arc::strong_count(&target), 1);
    assert!(target.actions().is_empty());
}

/// Test racing restarts from several threads leave the last submitted one armed
#[test]
fn test_concurrent_restarts_last_wins() {
    const THREADS: u64 = 4;
    const RESTARTS: u64 = 100;

    let reactor = reactor(RegisterEventMode::Deferred);
    let target = Arc::new(Recorder::default());
    let timer = Arc::new(Mutex::new(DeadlineTimer::new()));
    let last = Arc::new(Mutex::new(None));

    timer.lock().start_cancel(
        target.clone(),
        reactor.handle(),
        Instant::now() + Duration::from_secs(60),
    );

    let threads: Vec<_> = (0..THREADS)
        .map(|t| {
            let timer = timer.clone();
            let last = last.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..RESTARTS {
                    let ms = rng.gen_range(200..300);
                    let action = TimerAction::WakeupByEpoch(Epoch::new(t * RESTARTS + i));
                    let mut timer = timer.lock();
                    timer.restart(Instant::now() + Duration::from_millis(ms), action);
                    *last.lock() = Some(action);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    thread::sleep(Duration::from_millis(500));
    let expected = last.lock().unwrap();
    assert_eq!(target.actions(), vec![expected]);
    timer.lock().finalize();
}

/// Test a restart to a passed deadline fires inline, superseding the armed one
#[test]
fn test_restart_into_the_past() {
    let reactor = reactor(RegisterEventMode::Immediate);
    let target = Arc::new(Recorder::default());
    let mut timer = DeadlineTimer::new();
    timer.start_cancel(
        target.clone(),
        reactor.handle(),
        Instant::now() + Duration::from_millis(30),
    );
    timer.restart_wakeup(Instant::now(), Epoch::new(7));
    assert_eq!(
        target.actions(),
        vec![TimerAction::WakeupByEpoch(Epoch::new(7))]
    );

    thread::sleep(Duration::from_millis(80));
    assert_eq!(target.actions().len(), 1);
}
