//! The client-facing settings store.
//!
//! [`SettingsClient`] answers reads synchronously from an in-memory snapshot
//! and applies writes optimistically: a `set` is visible (and announced)
//! immediately, then confirmed or rolled back once the server has answered.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    mem,
    sync::Arc,
};

use arc_swap::ArcSwap;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    batch::{BatchId, ChangeQueue},
    error::{Error, Result},
    notify::{Notifier, Subscription},
    setting::{
        coerce, merge_with_defaults, same_value, InjectedSettings, SettingType, SettingsMap,
        SettingsResponse, UiSetting,
    },
    toasts::ErrorSink,
};

/// A change to the resolved value of a single setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub key: String,
    pub new_value: Value,
    pub old_value: Value,
}

struct ValueWatcher {
    key: String,
    fallback: Option<Value>,
    sender: UnboundedSender<Result<Value>>,
}

#[derive(Default)]
struct Watchers {
    list: Vec<ValueWatcher>,
    closed: bool,
}

// What a key looked like before a batch first touched it
#[derive(Debug, Clone)]
enum Previous {
    Undeclared,
    UserValue(Option<Value>),
}

struct BatchWrites<F> {
    before: HashMap<String, Previous>,
    waiting: usize,
    settled: bool,

    // The request's future, kept once every `set` waiting on it is gone
    abandoned: Option<F>,
}

impl<F> BatchWrites<F> {
    fn new() -> Self {
        Self {
            before: HashMap::new(),
            waiting: 0,
            settled: false,
            abandoned: None,
        }
    }
}

type WriteLog<F> = Mutex<BTreeMap<BatchId, BatchWrites<F>>>;

/// One `set` waiting on its batch. If the last waiter of a batch goes away
/// before the outcome is known, it leaves the request's future behind for
/// [`SettingsClient::flush`].
struct Waiter<'a, F> {
    writes: &'a WriteLog<F>,
    batch: BatchId,
    flush: Option<F>,
}

impl<F> Waiter<'_, F> {
    /// Record the outcome of the batch. The first waiter to learn of a
    /// failure gets every key the batch touched, with the state to roll it
    /// back to; everyone else gets nothing.
    fn settled(&mut self, failed: bool) -> Option<HashMap<String, Previous>> {
        self.flush = None;

        let mut writes = self.writes.lock();
        let batch = writes.get_mut(&self.batch)?;
        let first = !batch.settled;
        batch.settled = true;

        if failed && first {
            Some(mem::take(&mut batch.before))
        } else {
            None
        }
    }
}

impl<F> Drop for Waiter<'_, F> {
    fn drop(&mut self) {
        let mut writes = self.writes.lock();
        if let Some(batch) = writes.get_mut(&self.batch) {
            batch.waiting -= 1;
            if batch.waiting > 0 {
                return;
            }

            match self.flush.take() {
                Some(flush) if !batch.settled => batch.abandoned = Some(flush),
                _ => {
                    writes.remove(&self.batch);
                }
            }
        }
    }
}

struct PendingWrite<'a, F> {
    key: String,
    new_value: Value,
    initial: Value,
    waiter: Waiter<'a, F>,
}

/// Resolve the value of `key` as callers see it: the user's value if there
/// is one, otherwise the fallback, otherwise the declared default, coerced
/// according to the setting's type. Undeclared keys resolve to the fallback
/// as given.
fn resolve(settings: &SettingsMap, key: &str, fallback: Option<&Value>) -> Result<Value> {
    let setting = match settings.get(key) {
        Some(setting) => setting,
        None => {
            return fallback.cloned().ok_or_else(|| Error::UnknownSetting {
                key: key.to_owned(),
            })
        }
    };

    let value = match setting.user_value {
        Some(ref user_value) if !user_value.is_null() => user_value.clone(),
        _ => fallback
            .or_else(|| setting.value.as_ref())
            .cloned()
            .unwrap_or(Value::Null),
    };

    coerce(setting.kind, value)
}

/// The settings store.
///
/// Reads never block on the network. Writes go through a [`ChangeQueue`]
/// (normally a [`RequestBatcher`][crate::RequestBatcher]) and failures that
/// can't be returned to a caller are reported to an [`ErrorSink`].
pub struct SettingsClient<Q: ChangeQueue, S> {
    api: Q,
    on_update_error: S,

    // Also serializes every write to `cache`, so that changes are queued in
    // the order they were applied locally.
    defaults: Mutex<SettingsMap>,
    cache: ArcSwap<SettingsMap>,
    // The latest batch whose response the cache reflects
    reconciled: Mutex<Option<BatchId>>,

    update: Notifier<SettingChange>,
    saved: Notifier<SettingChange>,
    watchers: Mutex<Watchers>,
    writes: WriteLog<Q::Flush>,
}

impl<Q: ChangeQueue, S> fmt::Debug for SettingsClient<Q, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsClient")
            .field("settings", &self.cache.load().len())
            .field("watchers", &self.watchers.lock().list.len())
            .finish()
    }
}

impl<Q: ChangeQueue, S: ErrorSink> SettingsClient<Q, S> {
    /// Create a client from the declared defaults and the user's stored
    /// settings.
    pub fn new(api: Q, on_update_error: S, defaults: SettingsMap, initial: SettingsMap) -> Self {
        let cache = merge_with_defaults(&defaults, &initial);

        Self {
            api,
            on_update_error,
            defaults: Mutex::new(defaults),
            cache: ArcSwap::from_pointee(cache),
            reconciled: Mutex::new(None),
            update: Notifier::default(),
            saved: Notifier::default(),
            watchers: Mutex::new(Watchers::default()),
            writes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_injected(api: Q, on_update_error: S, injected: InjectedSettings) -> Self {
        Self::new(api, on_update_error, injected.defaults, injected.user)
    }

    /// The queue this client writes through.
    pub fn api(&self) -> &Q {
        &self.api
    }

    /// A copy of every known setting. Changing it has no effect on the client.
    pub fn get_all(&self) -> SettingsMap {
        SettingsMap::clone(&self.cache.load())
    }

    /// The resolved value of a declared setting.
    pub fn get(&self, key: &str) -> Result<Value> {
        resolve(&self.cache.load(), key, None)
    }

    /// Like [`get`][Self::get], but `fallback` takes the place of the declared
    /// default, and is returned unchanged if the key isn't declared.
    pub fn get_or(&self, key: &str, fallback: impl Into<Value>) -> Result<Value> {
        resolve(&self.cache.load(), key, Some(&fallback.into()))
    }

    /// Read a setting and deserialize it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get(key)?)?)
    }

    pub fn get_as_or<T: DeserializeOwned>(&self, key: &str, fallback: impl Into<Value>) -> Result<T> {
        Ok(serde_json::from_value(self.get_or(key, fallback)?)?)
    }

    /// A stream of the resolved value of `key`: the current value first, then
    /// the new value after every update to that key. A failed read is
    /// delivered as an error and ends the stream.
    pub fn watch(&self, key: &str) -> Subscription<Result<Value>> {
        self.watch_inner(key, None)
    }

    pub fn watch_or(&self, key: &str, fallback: impl Into<Value>) -> Subscription<Result<Value>> {
        self.watch_inner(key, Some(fallback.into()))
    }

    fn watch_inner(&self, key: &str, fallback: Option<Value>) -> Subscription<Result<Value>> {
        let mut watchers = self.watchers.lock();
        let (sender, receiver) = unbounded();

        let initial = resolve(&self.cache.load(), key, fallback.as_ref());
        let live = initial.is_ok() && !watchers.closed;

        // The receiver is alive, so this can't fail
        let _ = sender.unbounded_send(initial);

        if live {
            watchers.list.push(ValueWatcher {
                key: key.to_owned(),
                fallback,
                sender,
            });
        }

        Subscription::new(receiver)
    }

    /// Every change to a resolved value, including optimistic writes and
    /// rollbacks.
    pub fn updates(&self) -> Subscription<SettingChange> {
        self.update.subscribe()
    }

    /// Changes that are durable: confirmed by the server, or local default
    /// overrides.
    pub fn saved(&self) -> Subscription<SettingChange> {
        self.saved.subscribe()
    }

    pub fn is_declared(&self, key: &str) -> bool {
        self.cache.load().contains_key(key)
    }

    /// True unless the user has customized a declared setting.
    pub fn is_default(&self, key: &str) -> bool {
        self.cache
            .load()
            .get(key)
            .map_or(true, |setting| !setting.has_user_value())
    }

    /// True for settings that exist only because something wrote them, with
    /// no declared default.
    pub fn is_custom(&self, key: &str) -> bool {
        self.cache
            .load()
            .get(key)
            .map_or(false, |setting| setting.value.is_none())
    }

    pub fn is_overridden(&self, key: &str) -> bool {
        self.cache
            .load()
            .get(key)
            .map_or(false, UiSetting::is_overridden)
    }

    /// Change a setting.
    ///
    /// The new value is visible to `get` and announced on `updates` before
    /// this returns. The returned future resolves to `true` once the server
    /// has accepted the change, or to `false` if the write failed, in which
    /// case the change has been rolled back and the error reported to the
    /// error sink. Setting the value the user already has resolves to `true`
    /// immediately.
    ///
    /// Fails immediately if the setting is overridden by the server.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<impl Future<Output = bool> + '_> {
        self.write(key, value.into())
    }

    /// Remove the user's value, reverting to the default. Same as setting
    /// `null`.
    pub fn remove(&self, key: &str) -> Result<impl Future<Output = bool> + '_> {
        self.write(key, Value::Null)
    }

    /// Change the default of a setting for this session only. Subscribers are
    /// told (on both `updates` and `saved`) only if the change is visible,
    /// that is, if the user hasn't customized the setting.
    pub fn override_local_default(&self, key: &str, new_default: impl Into<Value>) {
        let new_default = new_default.into();
        let mut defaults = self.defaults.lock();

        let previous = defaults
            .entry(key.to_owned())
            .or_default()
            .value
            .replace(new_default.clone())
            .unwrap_or(Value::Null);

        let mut next = self.get_all();
        let setting = next.entry(key.to_owned()).or_default();
        setting.value = Some(new_default.clone());
        let visible = !setting.has_user_value();
        self.cache.store(Arc::new(next));

        if visible {
            let change = SettingChange {
                key: key.to_owned(),
                new_value: new_default,
                old_value: previous,
            };
            self.emit_update(change.clone());
            self.saved.emit(change);
        }
    }

    /// Settle writes whose `set` futures were dropped before the server
    /// answered: drive their requests to completion, then reconcile with the
    /// server's snapshot or roll back and report, exactly as a `set` that was
    /// awaited would have. Resolves to `true` if every such write was saved.
    pub async fn flush(&self) -> bool {
        let abandoned: Vec<_> = {
            let mut writes = self.writes.lock();
            let ids: Vec<BatchId> = writes
                .iter()
                .filter(|(_, batch)| batch.abandoned.is_some())
                .map(|(&id, _)| id)
                .collect();

            ids.into_iter()
                .filter_map(|id| writes.remove(&id).map(|batch| (id, batch)))
                .collect()
        };

        let mut saved = true;
        for (id, batch) in abandoned {
            let flush = match batch.abandoned {
                Some(flush) => flush,
                None => continue,
            };

            match flush.await {
                Ok(response) => {
                    debug!(batch = id, "abandoned settings write saved");
                    self.reconcile(id, &response);
                }
                Err(error) => {
                    warn!(batch = id, %error, "abandoned settings write failed, rolling back");
                    self.fail_batch(batch.before, &error);
                    saved = false;
                }
            }
        }
        saved
    }

    /// End every stream handed out by this client. Later subscriptions end
    /// immediately (after their initial value, for `watch`).
    pub fn stop(&self) {
        self.update.close();
        self.saved.close();

        let mut watchers = self.watchers.lock();
        watchers.closed = true;
        watchers.list.clear();
    }

    fn write(&self, key: &str, value: Value) -> Result<impl Future<Output = bool> + '_> {
        let pending = self.apply_locally(key, value)?;

        Ok(async move {
            match pending {
                Some(pending) => self.settle(pending).await,
                None => true,
            }
        })
    }

    fn apply_locally(&self, key: &str, new_value: Value) -> Result<Option<PendingWrite<'_, Q::Flush>>> {
        let _write_lock = self.defaults.lock();
        let settings = self.cache.load_full();
        let existing = settings.get(key);

        if existing.map_or(false, UiSetting::is_overridden) {
            return Err(Error::OverriddenSetting {
                key: key.to_owned(),
            });
        }

        if same_value(existing.and_then(|setting| setting.user_value.as_ref()), &new_value) {
            trace!(key, "setting unchanged");
            return Ok(None);
        }

        let (initial, previous) = match existing {
            Some(setting) => (
                resolve(&settings, key, None)?,
                Previous::UserValue(setting.user_value.clone()),
            ),
            None => (Value::Null, Previous::Undeclared),
        };

        self.set_locally(&settings, key, &new_value, initial.clone());

        let (batch, flush) = self.api.queue_change(key, new_value.clone());
        let waiter = self.track_write(batch, key, previous, flush);

        Ok(Some(PendingWrite {
            key: key.to_owned(),
            new_value,
            initial,
            waiter,
        }))
    }

    fn set_locally(&self, settings: &SettingsMap, key: &str, new_value: &Value, old_value: Value) {
        let mut next = settings.clone();
        let setting = next.entry(key.to_owned()).or_default();

        setting.user_value = match new_value {
            Value::Null => None,
            Value::String(..) => Some(new_value.clone()),
            // json settings are stored serialized
            _ if setting.kind == Some(SettingType::Json) => Some(Value::String(new_value.to_string())),
            _ => Some(new_value.clone()),
        };

        self.cache.store(Arc::new(next));
        self.emit_update(SettingChange {
            key: key.to_owned(),
            new_value: new_value.clone(),
            old_value,
        });
    }

    fn track_write(
        &self,
        batch: BatchId,
        key: &str,
        previous: Previous,
        flush: Q::Flush,
    ) -> Waiter<'_, Q::Flush> {
        let mut writes = self.writes.lock();
        let entry = writes.entry(batch).or_insert_with(BatchWrites::new);
        entry.before.entry(key.to_owned()).or_insert(previous);
        entry.waiting += 1;

        Waiter {
            writes: &self.writes,
            batch,
            flush: Some(flush),
        }
    }

    async fn settle<'a>(&'a self, pending: PendingWrite<'a, Q::Flush>) -> bool {
        let PendingWrite {
            key,
            new_value,
            initial,
            mut waiter,
        } = pending;

        let result = match waiter.flush.as_mut() {
            Some(flush) => flush.await,
            None => return false,
        };
        let batch = waiter.batch;
        let roll_back = waiter.settled(result.is_err());
        drop(waiter);

        match result {
            Ok(response) => {
                self.reconcile(batch, &response);

                debug!(key = %key, "setting saved");
                self.saved.emit(SettingChange {
                    key,
                    new_value,
                    old_value: initial,
                });
                true
            }
            Err(error) => {
                warn!(key = %key, %error, "failed to save setting, rolling back");
                if let Some(before) = roll_back {
                    self.fail_batch(before, &error);
                }
                false
            }
        }
    }

    // Adopt the server's snapshot, unless a later request's snapshot has
    // already been adopted.
    fn reconcile(&self, batch: BatchId, response: &SettingsResponse) {
        let defaults = self.defaults.lock();
        let mut reconciled = self.reconciled.lock();
        if reconciled.map_or(false, |latest| latest > batch) {
            trace!(batch, "ignoring snapshot older than the cache");
            return;
        }
        *reconciled = Some(batch);

        let merged = merge_with_defaults(&defaults, &response.settings);
        self.cache.store(Arc::new(merged));
    }

    // Every key of a failed request goes back to where it was, then the
    // failure is reported once.
    fn fail_batch(&self, before: HashMap<String, Previous>, error: &Error) {
        for (key, previous) in before {
            self.roll_back(&key, previous);
        }
        self.on_update_error.add(error);
    }

    fn roll_back(&self, key: &str, previous: Previous) {
        let _write_lock = self.defaults.lock();
        let settings = self.cache.load_full();
        let old_value = resolve(&settings, key, None).unwrap_or(Value::Null);

        let mut next = SettingsMap::clone(&settings);
        match previous {
            Previous::UserValue(user_value) => {
                next.entry(key.to_owned()).or_default().user_value = user_value;
            }
            Previous::Undeclared => {
                let declared = next.get_mut(key).map(|setting| {
                    setting.user_value = None;
                    setting.kind.is_some() || setting.value.is_some()
                });
                if declared == Some(false) {
                    next.remove(key);
                }
            }
        }

        let new_value = resolve(&next, key, None).unwrap_or(Value::Null);
        self.cache.store(Arc::new(next));
        self.emit_update(SettingChange {
            key: key.to_owned(),
            new_value,
            old_value,
        });
    }

    fn emit_update(&self, change: SettingChange) {
        {
            let settings = self.cache.load();
            let mut watchers = self.watchers.lock();
            watchers.list.retain(|watcher| {
                if watcher.key != change.key {
                    return !watcher.sender.is_closed();
                }

                let value = resolve(&settings, &watcher.key, watcher.fallback.as_ref());
                let keep = value.is_ok();
                watcher.sender.unbounded_send(value).is_ok() && keep
            });
        }

        self.update.emit(change);
    }
}
