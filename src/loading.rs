//! Loading indicators.
//!
//! [`LoadingCount`] is the shared, application-wide count of outstanding
//! work. Any number of [`LoadingSource`]s contribute to it; each reports its
//! own current count and the shared total moves by the difference.
//!
//! [`RequestGauge`] is the per-batcher count of in-flight write requests. It
//! can forward its count into a `LoadingSource`.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::error;

use crate::{
    error::{Error, Result},
    notify::{Notifier, Subscription},
};

#[derive(Debug, Default)]
struct LoadingTotal {
    total: Mutex<u64>,
    watchers: Notifier<u64>,
}

impl LoadingTotal {
    fn apply(&self, previous: u64, next: u64) {
        let mut total = self.total.lock();
        let updated = (*total + next).saturating_sub(previous);
        if updated != *total {
            *total = updated;
            self.watchers.emit(updated);
        }
    }
}

/// The shared loading counter. Cloning it produces another handle to the
/// same counter.
#[derive(Debug, Clone, Default)]
pub struct LoadingCount {
    inner: Arc<LoadingTotal>,
}

impl LoadingCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new contributor to this count. It starts out contributing 0.
    pub fn source(&self) -> LoadingSource {
        LoadingSource {
            total: self.inner.clone(),
            current: Mutex::new(0),
        }
    }

    /// The current total across all sources.
    pub fn count(&self) -> u64 {
        *self.inner.total.lock()
    }

    /// A stream of the total: the current value first, then every distinct
    /// new value.
    pub fn watch(&self) -> Subscription<u64> {
        let total = self.inner.total.lock();
        self.inner.watchers.subscribe_with(*total)
    }

    /// Complete every `watch` stream.
    pub fn stop(&self) {
        self.inner.watchers.close();
    }
}

/// One contributor to a [`LoadingCount`]. When dropped, it withdraws
/// whatever it still contributes.
#[derive(Debug)]
pub struct LoadingSource {
    total: Arc<LoadingTotal>,
    current: Mutex<u64>,
}

impl LoadingSource {
    /// Report this source's current count. Negative counts are rejected and
    /// leave the total untouched.
    pub fn set(&self, count: i64) -> Result<()> {
        if count < 0 {
            error!(count, "rejected negative loading count");
            return Err(Error::NegativeLoadingCount(count));
        }

        let count = count as u64;
        let mut current = self.current.lock();
        if *current != count {
            self.total.apply(*current, count);
            *current = count;
        }

        Ok(())
    }

    pub fn get(&self) -> u64 {
        *self.current.lock()
    }
}

impl Drop for LoadingSource {
    fn drop(&mut self) {
        let current = *self.current.get_mut();
        self.total.apply(current, 0);
    }
}

/// Counts the write requests a batcher currently has in flight.
#[derive(Debug, Default)]
pub(crate) struct RequestGauge {
    count: AtomicUsize,
    watchers: Notifier<usize>,
    source: Mutex<Option<LoadingSource>>,
}

impl RequestGauge {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn watch(&self) -> Subscription<usize> {
        // Hold the source lock so that a concurrent change can't slip in
        // between reading the count and subscribing.
        let _source = self.source.lock();
        self.watchers.subscribe_with(self.count())
    }

    pub(crate) fn attach(&self, source: LoadingSource) {
        let mut slot = self.source.lock();
        // The count can't exceed isize::MAX requests
        let _ = source.set(self.count() as i64);
        *slot = Some(source);
    }

    /// Record the start of a request. The returned guard records its end
    /// when dropped.
    pub(crate) fn begin(self: &Arc<Self>) -> InFlight {
        self.shift(|count| count + 1);
        InFlight {
            gauge: self.clone(),
        }
    }

    pub(crate) fn stop(&self) {
        self.watchers.close();
        self.source.lock().take();
    }

    fn shift(&self, op: impl FnOnce(usize) -> usize) {
        let source = self.source.lock();
        let count = op(self.count.load(Ordering::SeqCst));
        self.count.store(count, Ordering::SeqCst);

        self.watchers.emit(count);
        if let Some(source) = source.as_ref() {
            let _ = source.set(count as i64);
        }
    }
}

/// Marks one in-flight request. Dropping it decrements the gauge, whether the
/// request settled or was abandoned.
#[derive(Debug)]
pub(crate) struct InFlight {
    gauge: Arc<RequestGauge>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gauge.shift(|count| count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_contribute_deltas() {
        let loading = LoadingCount::new();
        let first = loading.source();
        let second = loading.source();

        first.set(2).unwrap();
        second.set(1).unwrap();
        assert_eq!(loading.count(), 3);

        first.set(1).unwrap();
        assert_eq!(loading.count(), 2);

        drop(second);
        assert_eq!(loading.count(), 1);
    }

    #[test]
    fn rejects_negative_counts() {
        let loading = LoadingCount::new();
        let source = loading.source();
        source.set(1).unwrap();

        match source.set(-1) {
            Err(Error::NegativeLoadingCount(-1)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(loading.count(), 1);
        assert_eq!(source.get(), 1);
    }

    #[test]
    fn watch_replays_and_skips_duplicates() {
        let loading = LoadingCount::new();
        let source = loading.source();
        source.set(1).unwrap();

        let mut watch = loading.watch();
        source.set(1).unwrap();
        source.set(3).unwrap();
        source.set(0).unwrap();

        assert_eq!(watch.try_next(), Some(1));
        assert_eq!(watch.try_next(), Some(3));
        assert_eq!(watch.try_next(), Some(0));
        assert_eq!(watch.try_next(), None);
    }

    #[test]
    fn gauge_forwards_to_source() {
        let loading = LoadingCount::new();
        let gauge = Arc::new(RequestGauge::default());
        gauge.attach(loading.source());

        let first = gauge.begin();
        let second = gauge.begin();
        assert_eq!(gauge.count(), 2);
        assert_eq!(loading.count(), 2);

        drop(first);
        assert_eq!(loading.count(), 1);

        drop(second);
        assert_eq!(gauge.count(), 0);
        assert_eq!(loading.count(), 0);
    }

    #[test]
    fn stopping_the_gauge_withdraws_its_count() {
        let loading = LoadingCount::new();
        let gauge = Arc::new(RequestGauge::default());
        gauge.attach(loading.source());

        let _in_flight = gauge.begin();
        assert_eq!(loading.count(), 1);

        gauge.stop();
        assert_eq!(loading.count(), 0);
    }
}
