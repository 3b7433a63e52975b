//! Push-based notification channels.
//!
//! A [`Notifier`] keeps a list of subscribers, each with its own unbounded
//! channel. Emitting a value clones it into every live channel; subscribers
//! that have gone away are pruned on the next emit. Because each subscriber
//! owns a separate channel, dropping one [`Subscription`] never affects any
//! other, and emitting never runs subscriber code.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    stream::{FusedStream, Stream},
};
use parking_lot::Mutex;

/// A stream of notifications. Dropping it (or calling
/// [`unsubscribe`][Subscription::unsubscribe]) stops delivery to this
/// subscriber only. The stream ends when its source is closed.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(receiver: UnboundedReceiver<T>) -> Self {
        Self { receiver }
    }

    /// A subscription that has already ended.
    pub(crate) fn closed() -> Self {
        let (_sender, receiver) = unbounded();
        Self { receiver }
    }

    /// Stop receiving notifications. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}

    /// Take the next notification if one is already waiting, without
    /// blocking. Returns `None` if nothing is queued or the stream has ended.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_next().ok().flatten()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.receiver).poll_next(ctx)
    }
}

impl<T> FusedStream for Subscription<T> {
    fn is_terminated(&self) -> bool {
        self.receiver.is_terminated()
    }
}

#[derive(Debug)]
struct Subscribers<T> {
    senders: Vec<UnboundedSender<T>>,
    closed: bool,
}

/// The sending half of a notification channel. Shared by reference; all
/// methods take `&self`.
#[derive(Debug)]
pub(crate) struct Notifier<T> {
    subscribers: Mutex<Subscribers<T>>,
}

impl<T> Default for Notifier<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }
}

impl<T: Clone> Notifier<T> {
    /// Subscribe to every value emitted from now on.
    pub(crate) fn subscribe(&self) -> Subscription<T> {
        let mut subscribers = self.subscribers.lock();
        if subscribers.closed {
            return Subscription::closed();
        }

        let (sender, receiver) = unbounded();
        subscribers.senders.push(sender);
        Subscription::new(receiver)
    }

    /// Subscribe, receiving `initial` before anything emitted afterwards. If
    /// the notifier is closed the subscription yields `initial` and then ends.
    pub(crate) fn subscribe_with(&self, initial: T) -> Subscription<T> {
        let mut subscribers = self.subscribers.lock();
        let (sender, receiver) = unbounded();

        // The receiver is alive, so this can't fail
        let _ = sender.unbounded_send(initial);

        if !subscribers.closed {
            subscribers.senders.push(sender);
        }

        Subscription::new(receiver)
    }

    /// Deliver `value` to every live subscriber.
    pub(crate) fn emit(&self, value: T) {
        self.subscribers
            .lock()
            .senders
            .retain(|sender| sender.unbounded_send(value.clone()).is_ok());
    }

    /// End every subscription. Later subscriptions are born closed.
    pub(crate) fn close(&self) {
        let mut subscribers = self.subscribers.lock();
        subscribers.closed = true;
        subscribers.senders.clear();
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.subscribers.lock().closed
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().senders.len()
    }
}
