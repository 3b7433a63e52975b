//! These tests ensure that only the driving future is woken while a batch is
//! in progress, and that when a driving future is dropped, another future is
//! notified.

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::FutureExt;
use serde_json::json;
use settings_sync::{ChangeSet, RequestBatcher};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    thread::sleep,
    time::Duration,
};

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default, IntoWaker)]
struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// A future wrapper that returns pending the first N times it is polled, then
/// returns Ready. We use it to test different control flow variations.
///
/// It immediately calls Wake when it's polled in the pending state, but the
/// intended use of this struct is for a "manually" polled future so that we
/// can test different sequences of futures being added, dropped, and polled
#[derive(Debug, Clone)]
struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}

/// Send the changes back after one spurious pending poll
async fn slow_echo(changes: ChangeSet) -> Result<ChangeSet, ()> {
    Skipper::new(1).await;
    Ok(changes)
}

fn numbered(keys: impl IntoIterator<Item = i32>) -> ChangeSet {
    keys.into_iter()
        .map(|key| (key.to_string(), json!(key)))
        .collect()
}

fn single(key: &str, value: i32) -> ChangeSet {
    let mut changes = ChangeSet::new();
    changes.insert(key, json!(value));
    changes
}

#[test]
fn test_notify_lifecycle() {
    let batcher = RequestBatcher::new(Duration::from_millis(1), slow_echo);

    let mut task1 = Task::new(batcher.queue_change("1", json!(1)));
    let mut task2 = Task::new(batcher.queue_change("2", json!(2)));
    let mut task3 = Task::new(batcher.queue_change("3", json!(3)));

    // Polling the futures initiates the timer
    assert_eq!(task3.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);
    assert_eq!(task1.poll(), Poll::Pending);

    // At this point, the timer has started, and should still be running.
    // None of the futures have been signaled. After 1 ms, task 1 (and ONLY
    // task 1) should have been signaled
    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    sleep(Duration::from_millis(10));

    assert!(task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    // We re-poll task 1. This sends the request and triggers the Skipper,
    // which should immediately notify task 1. A second poll should finish
    // the request, which should notify ALL tasks.
    assert_eq!(task1.poll(), Poll::Pending);

    assert!(task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    let expected = numbered(1..=3);
    assert_eq!(task1.poll(), Poll::Ready(Ok(expected.clone())));

    assert!(task2.is_signaled());
    assert!(task3.is_signaled());

    assert_eq!(task2.poll(), Poll::Ready(Ok(expected.clone())));
    assert_eq!(task3.poll(), Poll::Ready(Ok(expected)));
}

#[test]
fn test_notify_lifecycle_drops() {
    let batcher = RequestBatcher::new(Duration::from_millis(1), slow_echo);

    let mut tasks: HashMap<i32, _> = (1..=5)
        .map(|key| (key, Task::new(batcher.queue_change(key.to_string(), json!(key)))))
        .collect();

    // Poll all the tasks. At this point, task #5 is our driver.
    for i in 1..=5 {
        assert_eq!(tasks.get_mut(&i).unwrap().poll(), Poll::Pending);
    }

    // At this point, the timer has started, and should still be running.
    // None of the futures have been signaled.
    assert!(tasks.values().all(|task| !task.is_signaled()));

    // We immediately drop the driving task. This should cause another one to
    // be awoken, so that it can do a poll and become the driving task.
    tasks.remove(&5);
    let mut driving_task = None;
    for (&i, task) in tasks.iter() {
        if task.is_signaled() {
            match driving_task {
                None => driving_task = Some(i),
                Some(..) => panic!("Test failure: multiple tasks awoken after drop"),
            }
        }
    }

    let driving_task = driving_task.expect("Test failure: no task was awakened after a drop");

    sleep(Duration::from_millis(10));

    // The dropped task's change is still part of the batch
    let expected = numbered(1..=5);

    for (&i, task) in tasks.iter() {
        if i == driving_task {
            assert!(task.is_signaled());
        } else {
            assert!(!task.is_signaled());
        }
    }

    // Poll the task to send the request. This advances us to the first
    // Skipper.
    assert_eq!(tasks.get_mut(&driving_task).unwrap().poll(), Poll::Pending);

    // Once again, drop that task. This should cause yet another task to be
    // signaled.
    tasks.remove(&driving_task);
    let mut driving_task = None;
    for (&i, task) in tasks.iter() {
        if task.is_signaled() {
            match driving_task {
                None => driving_task = Some(i),
                Some(..) => panic!("Test failure: multiple tasks awoken after drop"),
            }
        }
    }

    let driving_task = driving_task.expect("Test failure: no task was awakened after a drop");

    // Poll that task. This should cause a completion, meaning all other tasks
    // are also done.
    assert_eq!(
        tasks.get_mut(&driving_task).unwrap().poll(),
        Poll::Ready(Ok(expected.clone()))
    );

    // All other tasks should have been signaled. driving task, having been
    // completed, should NOT have been re-signaled.
    for (&i, task) in tasks.iter() {
        if i == driving_task {
            assert!(!task.is_signaled())
        } else {
            assert!(task.is_signaled())
        }
    }

    tasks.remove(&driving_task);

    for task in tasks.values_mut() {
        assert_eq!(task.poll(), Poll::Ready(Ok(expected.clone())));
    }
}

/// A future waiting behind an in-flight request drives that request. If it
/// goes away, the in-flight request's own driver is woken to take over.
#[test]
fn test_waiting_batch_hands_back_in_flight_request() {
    let batcher = RequestBatcher::new(Duration::from_millis(0), |changes: ChangeSet| async move {
        Skipper::new(3).await;
        Ok::<_, ()>(changes)
    });

    let mut first = Task::new(batcher.queue_change("a", json!(1)));
    assert_eq!(first.poll(), Poll::Pending);
    assert!(first.is_signaled());
    first.signal.reset();

    // The second batch is blocked behind the first request, which it polls
    // on our behalf
    let mut second = Task::new(batcher.queue_change("b", json!(2)));
    assert_eq!(second.poll(), Poll::Pending);
    assert!(second.is_signaled());
    assert!(!first.is_signaled());

    drop(second);
    assert!(first.is_signaled());

    assert_eq!(first.poll(), Poll::Pending);
    assert_eq!(first.poll(), Poll::Ready(Ok(single("a", 1))));

    // The abandoned change is still waiting to be sent
    assert!(batcher.has_pending());
    let flush = batcher.flush().expect("change should still be pending");
    assert_eq!(futures::executor::block_on(flush), Ok(single("b", 2)));
}
