//! Integration tests for wait_any over tasks, promises and events

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tl_async_engine::{
    sleep_for, sleep_until, spawn,
    sync::{channel, SingleConsumerEvent},
    wait_any, wait_any_for, wait_any_until, Awaitable, Deadline, Engine, EngineConfig, FutureError,
    TaskError, TaskWithResult,
};

fn engine() -> Engine {
    Engine::new(EngineConfig::default().with_worker_threads(2).with_ev_threads(1)).unwrap()
}

/// Test a wait on a never-completing task times out close to its deadline
#[test]
fn test_wait_any_for_times_out() {
    let engine = engine();
    let (result, elapsed) = engine
        .block_on(async {
            let never = spawn(sleep_until(Deadline::unreachable()));
            let start = Instant::now();
            let result = wait_any_for(Duration::from_millis(42), &[&never]).await;
            (result, start.elapsed())
        })
        .unwrap();

    assert_eq!(result, None);
    assert!(elapsed >= Duration::from_millis(42));
    assert!(elapsed < Duration::from_millis(42 + 250), "overshoot: {elapsed:?}");
}

/// Test a result racing the deadline is reported consistently: a winner
/// has finished, and no winner means the deadline has passed
#[test]
fn test_deadline_racing_completion() {
    let engine = engine();
    let (inconsistent, won, timed_out) = engine
        .block_on(async {
            let (mut inconsistent, mut won, mut timed_out) = (0, 0, 0);
            for _ in 0..300 {
                let at = Deadline::from_duration(Duration::from_millis(2));
                let task = spawn(sleep_until(at));
                match wait_any_until(at, &[&task]).await {
                    Some(0) if task.is_finished() => won += 1,
                    None if at.is_reached() => timed_out += 1,
                    _ => inconsistent += 1,
                }
                task.wait().await.unwrap();
            }
            (inconsistent, won, timed_out)
        })
        .unwrap();

    assert_eq!(inconsistent, 0);
    assert_eq!(won + timed_out, 300);
}

/// Test tasks released in round-robin order are reported in that order
#[test]
fn test_round_robin_completion_order() {
    let engine = engine();
    let (order, exhausted) = engine
        .block_on(async {
            let events: Vec<_> = (0..4).map(|_| Arc::new(SingleConsumerEvent::new())).collect();
            let mut tasks: Vec<TaskWithResult<usize>> = events
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, event)| {
                    spawn(async move {
                        event.wait_for_event().await;
                        i
                    })
                })
                .collect();

            let mut order = vec![];
            for event in &events {
                event.send();
                let index = {
                    let operands: Vec<&dyn Awaitable> =
                        tasks.iter().map(|t| t as &dyn Awaitable).collect();
                    wait_any(&operands).await
                };
                let Some(index) = index else { break };
                order.push((index, tasks[index].get().await));
            }

            let operands: Vec<&dyn Awaitable> = tasks.iter().map(|t| t as &dyn Awaitable).collect();
            let exhausted = wait_any(&operands).await;
            (order, exhausted)
        })
        .unwrap();

    assert_eq!(
        order,
        vec![(0, Ok(0)), (1, Ok(1)), (2, Ok(2)), (3, Ok(3))]
    );
    assert_eq!(exhausted, None);
}

/// Test simultaneously ready operands yield a single winner and stay valid
#[test]
fn test_single_winner_leaves_others_pending() {
    let engine = engine();
    let (winner, valid, ready, values) = engine
        .block_on(async {
            let (promises, mut futures): (Vec<_>, Vec<_>) = (0..3).map(|_| channel::<u32>()).unzip();
            for (i, promise) in promises.into_iter().enumerate() {
                promise.set_value(i as u32 * 10);
            }

            let winner = {
                let operands: Vec<&dyn Awaitable> =
                    futures.iter().map(|f| f as &dyn Awaitable).collect();
                wait_any(&operands).await
            };
            let valid = futures.iter().filter(|f| f.is_valid()).count();
            let ready = futures.iter().filter(|f| f.is_ready()).count();
            let mut values = vec![];
            for future in &mut futures {
                values.push(future.get().await);
            }
            (winner, valid, ready, values)
        })
        .unwrap();

    assert!(matches!(winner, Some(0..=2)));
    assert_eq!(valid, 3);
    assert_eq!(ready, 3);
    assert_eq!(values, vec![Ok(0), Ok(10), Ok(20)]);
}

/// Test an event sent from another task wins over a pending task
#[test]
fn test_mixed_operands() {
    let engine = engine();
    let winner = engine
        .block_on(async {
            let event = Arc::new(SingleConsumerEvent::new());
            let slow = spawn(sleep_for(Duration::from_secs(10)));
            let sender = {
                let event = event.clone();
                spawn(async move {
                    sleep_for(Duration::from_millis(5)).await;
                    event.send();
                })
            };
            let winner = wait_any_for(Duration::from_secs(5), &[&slow, &*event]).await;
            sender.detach();
            winner
        })
        .unwrap();

    assert_eq!(winner, Some(1));
}

/// Test empty and fully invalid operand sets return at once
#[test]
fn test_no_valid_operands() {
    let engine = engine();
    let (empty, invalid, broken) = engine
        .block_on(async {
            let empty = wait_any(&[]).await;

            let (promise, mut future) = channel::<()>();
            drop(promise);
            let broken = future.get().await;
            let invalid = wait_any(&[&future]).await;
            (empty, invalid, broken)
        })
        .unwrap();

    assert_eq!(empty, None);
    assert_eq!(invalid, None);
    assert_eq!(broken, Err(FutureError::BrokenPromise));
}

/// Test cancelling the waiting task abandons the wait
#[test]
fn test_cancelled_waiter_gets_no_winner() {
    let engine = engine();
    let result = engine
        .block_on(async {
            let event = Arc::new(SingleConsumerEvent::new());
            let mut waiter = {
                let event = event.clone();
                spawn(async move { wait_any(&[&*event]).await })
            };
            sleep_for(Duration::from_millis(10)).await;
            waiter.cancel();
            waiter.get().await
        })
        .unwrap();

    assert_eq!(result, Ok(None));
}

/// Test passing the same operand twice is rejected
#[test]
fn test_duplicate_operand_panics() {
    let engine = engine();
    let result = engine.block_on(async {
        let event = SingleConsumerEvent::new();
        wait_any(&[&event, &event]).await
    });

    assert_eq!(result, Err(TaskError::Panicked));
}
