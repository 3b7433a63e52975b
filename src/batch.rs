use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{ready, FutureExt};
use futures_timer::Delay;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    changes::ChangeSet,
    error::Error,
    loading::{InFlight, LoadingSource, RequestGauge},
    notify::Subscription,
    setting::SettingsResponse,
    wakerset::{Token, WakerSet},
};

/// Identifies one batch of changes, and so one write request. Ids increase
/// in the order batches are created.
pub type BatchId = u64;

/// The write side of the settings store, as seen by
/// [`SettingsClient`][crate::SettingsClient]. Queueing a change returns the
/// id of the batch that will carry it, and a future that resolves with the
/// server's snapshot once that batch's request has completed.
pub trait ChangeQueue {
    type Flush: Future<Output = Result<SettingsResponse, Error>> + Unpin;

    fn queue_change(&self, key: &str, value: Value) -> (BatchId, Self::Flush);
}

struct AccumulatingState {
    changes: ChangeSet,
    delay: Option<Delay>,
}

struct RunningState<Fut> {
    fut: Pin<Box<Fut>>,
    _in_flight: InFlight,
}

enum State<Resp, Err, Fut> {
    Accum(AccumulatingState),
    Running(RunningState<Fut>),
    Done(Result<Resp, Err>),
}

struct Batch<Resp, Err, Fut> {
    id: BatchId,
    state: State<Resp, Err, Fut>,
    wakers: WakerSet,
}

impl<Resp, Err, Fut> Batch<Resp, Err, Fut>
where
    Fut: Future<Output = Result<Resp, Err>>,
{
    /// Drive a running request. When it completes, every waiting future is
    /// woken (except the one holding `token`, which is about to collect its
    /// result) and the batch transitions to `Done`. Batches that aren't
    /// running are immediately ready.
    fn poll_running(&mut self, ctx: &mut Context<'_>, token: &mut Option<Token>) -> Poll<()> {
        if let State::Running(ref mut state) = self.state {
            let result = ready!(state.fut.as_mut().poll(ctx));

            debug!(batch = self.id, ok = result.is_ok(), "settings write settled");

            let mut all_wakers = mem::take(&mut self.wakers);
            if let Some(token) = token.take() {
                all_wakers.discard(token);
            }
            all_wakers.wake_all();

            // This also drops the in-flight guard
            self.state = State::Done(result);
        }

        Poll::Ready(())
    }
}

type SharedBatch<Resp, Err, Fut> = Arc<Mutex<Batch<Resp, Err, Fut>>>;

struct Slots<Resp, Err, Fut> {
    // The batch currently collecting changes. It is owned here, not just by
    // its futures, so that queued changes are never lost even if nobody is
    // currently awaiting them.
    pending: Option<SharedBatch<Resp, Err, Fut>>,

    // The batch whose request is on the wire, if any. Held strongly: a
    // request is never abandoned, even if all of its futures are dropped.
    in_flight: Option<SharedBatch<Resp, Err, Fut>>,

    next_id: BatchId,
}

struct Shared<Resp, Err, Fut, Dispatch> {
    dispatch: Dispatch,
    window: Duration,
    gauge: Arc<RequestGauge>,

    // Lock order: `slots` is always locked before any batch.
    slots: Mutex<Slots<Resp, Err, Fut>>,
}

/// Coalesces individual setting changes into batched write requests, with
/// at most one request in flight at a time.
///
/// Changes are merged into a single pending [`ChangeSet`] until it can be
/// sent. A pending batch is sent as soon as one of its futures is polled,
/// its coalescing window (if any) has elapsed, and no other request is in
/// flight. Changes queued while a request is in flight always go out in a
/// later, separate request.
///
/// Like any future-based API, the work is driven by polling. Any future
/// returned from [`queue_change`][RequestBatcher::queue_change] drives its
/// own batch, and while waiting for an in-flight request to finish it also
/// helps drive that request, so awaiting only the latest change is enough to
/// flush everything before it.
pub struct RequestBatcher<Resp, Err, Fut, Dispatch> {
    shared: Arc<Shared<Resp, Err, Fut, Dispatch>>,
}

impl<Resp, Err, Fut, Dispatch> Clone for RequestBatcher<Resp, Err, Fut, Dispatch> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Resp, Err, Fut, Dispatch> Debug for RequestBatcher<Resp, Err, Fut, Dispatch> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let slots = self.shared.slots.lock();
        let pending = slots.pending.as_ref().map(|batch| batch.lock().id);
        let in_flight = slots.in_flight.as_ref().map(|batch| batch.lock().id);

        f.debug_struct("RequestBatcher")
            .field("dispatch", &"<closure>")
            .field("window", &self.shared.window)
            .field("pending", &pending)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<Resp, Err, Fut, Dispatch> RequestBatcher<Resp, Err, Fut, Dispatch>
where
    Resp: Clone,
    Err: Clone,
    Fut: Future<Output = Result<Resp, Err>>,
    Dispatch: Fn(ChangeSet) -> Fut,
{
    /// Create a batcher. `dispatch` sends one combined write and resolves with
    /// the server's answer; `window` is how long a new batch waits for more
    /// changes before it may be sent (zero sends on first poll).
    pub fn new(window: Duration, dispatch: Dispatch) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatch,
                window,
                gauge: Arc::new(RequestGauge::default()),
                slots: Mutex::new(Slots {
                    pending: None,
                    in_flight: None,
                    next_id: 0,
                }),
            }),
        }
    }

    /// Queue a single change. If a batch is already pending, the change joins
    /// it (replacing any earlier value for the same key); otherwise a new
    /// batch is started. The returned future resolves with the result of the
    /// request that carries this batch.
    pub fn queue_change(
        &self,
        key: impl Into<String>,
        value: Value,
    ) -> FlushFuture<Resp, Err, Fut, Dispatch> {
        let key = key.into();
        let mut slots = self.shared.slots.lock();

        if let Some(handle) = slots.pending.as_ref() {
            let mut guard = handle.lock();
            let batch = &mut *guard;

            if let State::Accum(ref mut state) = batch.state {
                trace!(batch = batch.id, key = %key, "merging change into pending batch");
                state.changes.insert(key, value);
                return FlushFuture::new(self.shared.clone(), handle.clone());
            }
        }

        let id = slots.next_id;
        slots.next_id += 1;
        trace!(batch = id, key = %key, "starting new batch");

        let mut changes = ChangeSet::new();
        changes.insert(key, value);

        let window = self.shared.window;
        let handle = Arc::new(Mutex::new(Batch {
            id,
            state: State::Accum(AccumulatingState {
                changes,
                delay: if window.is_zero() {
                    None
                } else {
                    Some(Delay::new(window))
                },
            }),
            wakers: WakerSet::default(),
        }));

        slots.pending = Some(handle.clone());
        FlushFuture::new(self.shared.clone(), handle)
    }

    /// Get a future for the latest unsettled batch: the pending one if there
    /// is one, otherwise the request in flight. Since a pending batch drives
    /// the request ahead of it, awaiting this settles every change queued so
    /// far, including changes whose own futures were dropped.
    pub fn flush(&self) -> Option<FlushFuture<Resp, Err, Fut, Dispatch>> {
        let slots = self.shared.slots.lock();
        slots
            .pending
            .as_ref()
            .or_else(|| slots.in_flight.as_ref())
            .map(|handle| FlushFuture::new(self.shared.clone(), handle.clone()))
    }
}

impl<Resp, Err, Fut, Dispatch> RequestBatcher<Resp, Err, Fut, Dispatch> {
    /// True if there are changes that haven't been sent yet.
    pub fn has_pending(&self) -> bool {
        self.shared.slots.lock().pending.is_some()
    }

    /// True if a write request is currently outstanding.
    pub fn is_in_flight(&self) -> bool {
        self.shared.slots.lock().in_flight.is_some()
    }

    /// The number of requests currently in flight (never more than one).
    pub fn loading_count(&self) -> usize {
        self.shared.gauge.count()
    }

    /// A stream of the in-flight request count, starting with the current
    /// value.
    pub fn watch_loading(&self) -> Subscription<usize> {
        self.shared.gauge.watch()
    }

    /// Forward the in-flight request count into a shared loading counter.
    pub fn attach_loading(&self, source: LoadingSource) {
        self.shared.gauge.attach(source)
    }

    /// Prepare the batcher to be discarded: complete the loading stream and
    /// withdraw from the shared loading counter. Requests already queued or in
    /// flight are unaffected.
    pub fn stop(&self) {
        self.shared.gauge.stop()
    }
}

impl<Fut, Dispatch> ChangeQueue for RequestBatcher<SettingsResponse, Error, Fut, Dispatch>
where
    Fut: Future<Output = Result<SettingsResponse, Error>>,
    Dispatch: Fn(ChangeSet) -> Fut,
{
    type Flush = FlushFuture<SettingsResponse, Error, Fut, Dispatch>;

    fn queue_change(&self, key: &str, value: Value) -> (BatchId, Self::Flush) {
        let flush = RequestBatcher::queue_change(self, key, value);
        (flush.batch_id(), flush)
    }
}

// Invariant: the batch this future points to contains (or contained, before
// it was sent) the change this future was created for.
/// A future for the outcome of the write request carrying a queued change.
/// Many `FlushFuture`s share a single request; all of them resolve with the
/// same result.
pub struct FlushFuture<Resp, Err, Fut, Dispatch> {
    waker_token: Option<Token>,
    batch: SharedBatch<Resp, Err, Fut>,
    shared: Arc<Shared<Resp, Err, Fut, Dispatch>>,
}

impl<Resp, Err, Fut, Dispatch> FlushFuture<Resp, Err, Fut, Dispatch> {
    fn new(shared: Arc<Shared<Resp, Err, Fut, Dispatch>>, batch: SharedBatch<Resp, Err, Fut>) -> Self {
        Self {
            waker_token: None,
            batch,
            shared,
        }
    }

    /// The id of the batch (and so of the request) this future waits on.
    pub fn batch_id(&self) -> BatchId {
        self.batch.lock().id
    }
}

impl<Resp, Err, Fut, Dispatch> Debug for FlushFuture<Resp, Err, Fut, Dispatch> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushFuture")
            .field("waker_token", &self.waker_token)
            .finish()
    }
}

impl<Resp, Err, Fut, Dispatch> Future for FlushFuture<Resp, Err, Fut, Dispatch>
where
    Resp: Clone,
    Err: Clone,
    Fut: Future<Output = Result<Resp, Err>>,
    Dispatch: Fn(ChangeSet) -> Fut,
{
    type Output = Result<Resp, Err>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);
        let shared = &*unpinned.shared;
        let mut slots = shared.slots.lock();
        let mut guard = unpinned.batch.lock();
        let batch = &mut *guard;

        if let State::Accum(ref mut state) = batch.state {
            batch.wakers.register(&mut unpinned.waker_token, ctx.waker());

            // Wait out the coalescing window
            if let Some(delay) = state.delay.as_mut() {
                ready!(delay.poll_unpin(ctx));
                state.delay = None;
            }

            // Another request is on the wire. Help drive it; we'll be
            // dispatched once it settles.
            if let Some(running) = slots.in_flight.clone() {
                let mut no_token = None;
                ready!(running.lock().poll_running(ctx, &mut no_token));
                slots.in_flight = None;
            }

            let changes = state.changes.take();

            // Detach from the batcher, so that later changes start a new batch
            if slots
                .pending
                .as_ref()
                .map_or(false, |pending| Arc::ptr_eq(pending, &unpinned.batch))
            {
                slots.pending = None;
            }

            debug!(batch = batch.id, keys = changes.len(), "dispatching settings write");

            let fut = (shared.dispatch)(changes);
            batch.state = State::Running(RunningState {
                fut: Box::pin(fut),
                _in_flight: shared.gauge.begin(),
            });
            slots.in_flight = Some(unpinned.batch.clone());
        }

        if let State::Running(..) = batch.state {
            batch.wakers.register(&mut unpinned.waker_token, ctx.waker());
            ready!(batch.poll_running(ctx, &mut unpinned.waker_token));

            // Our request settled; let the next batch go
            slots.in_flight = None;
            if let Some(next) = slots.pending.as_ref() {
                next.lock().wakers.wake_driver();
            }
        }

        match batch.state {
            State::Done(ref result) => {
                if let Some(token) = unpinned.waker_token.take() {
                    batch.wakers.discard(token);
                }
                Poll::Ready(result.clone())
            }
            _ => panic!("FlushFuture contained invalid state"),
        }
    }
}

impl<Resp, Err, Fut, Dispatch> Drop for FlushFuture<Resp, Err, Fut, Dispatch> {
    fn drop(&mut self) {
        let mut slots = self.shared.slots.lock();
        let mut guard = self.batch.lock();
        let batch = &mut *guard;

        // We might have been the driving future; hand off to another one.
        if let Some(token) = self.waker_token.take() {
            batch.wakers.discard_and_wake(token);
        }

        match batch.state {
            State::Accum(..) => {
                // We might also have been driving the in-flight request on
                // behalf of this batch.
                if let Some(running) = slots.in_flight.as_ref() {
                    running.lock().wakers.wake_driver();
                }
            }

            // Only the batcher's reference and ours are left. The request
            // stays on the wire; the next batch now has to drive it.
            State::Running(..) if Arc::strong_count(&self.batch) == 2 => {
                debug!(batch = batch.id, "settings write left to the next batch");
                if let Some(next) = slots.pending.as_ref() {
                    next.lock().wakers.wake_driver();
                }
            }

            _ => {}
        }
    }
}
