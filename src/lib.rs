//! Settings-sync is a client-side cache for user-configurable settings that
//! are stored on a remote server. Reads are synchronous and always answered
//! from memory; writes are applied optimistically, coalesced into batched
//! requests, and confirmed or rolled back once the server has answered.
//!
//! ## Overview
//!
//! Every setting is described by a [`UiSetting`]: a declared type and default
//! value, plus the user's customization (if any) and a flag marking settings
//! that the server has locked. A client starts from the declared defaults and
//! the user's stored settings, usually both rendered into the page by the
//! server ([`InjectedSettings`]).
//!
//! Writes go through a [`ChangeQueue`]. The queue shipped with this crate is
//! the [`RequestBatcher`], which merges individual changes into a single
//! pending batch and sends it once no other request is in flight, and
//! [`SettingsApi`] gives it a dispatch function that speaks the server's
//! HTTP protocol over any [`HttpTransport`]. Failed writes that can't be
//! returned to anyone are reported to an [`ErrorSink`], such as [`Toasts`].
//!
//! ```
//! use futures::{executor::block_on, future};
//! use serde_json::json;
//! use settings_sync::{
//!     ClientConfig, HttpRequest, HttpResponse, NetworkWriteError, SettingType, SettingsApi,
//!     SettingsClient, SettingsMap, UiSetting,
//! };
//!
//! // Any function from a request to a future of a response will do
//! let transport = |_request: HttpRequest| {
//!     future::ready(Ok::<_, NetworkWriteError>(HttpResponse {
//!         status: 200,
//!         body: r#"{"settings": {"pageSize": {"userValue": 20}}}"#.to_owned(),
//!     }))
//! };
//!
//! let config = ClientConfig::default();
//! let batcher = SettingsApi::new(transport, &config).into_batcher(config.flush_window());
//!
//! let mut defaults = SettingsMap::new();
//! defaults.insert("pageSize".to_owned(), UiSetting::new(SettingType::Number, "10"));
//!
//! let client = SettingsClient::new(
//!     batcher,
//!     |error: &settings_sync::Error| eprintln!("{}", error),
//!     defaults,
//!     SettingsMap::new(),
//! );
//!
//! assert_eq!(client.get("pageSize")?, json!(10.0));
//!
//! let saved = client.set("pageSize", 20)?;
//!
//! // Visible right away, before the server has answered
//! assert_eq!(client.get("pageSize")?, json!(20.0));
//! assert!(block_on(saved));
//! # Ok::<(), settings_sync::Error>(())
//! ```
//!
//! ## Notifications
//!
//! Everything observable is exposed as a [`Subscription`], an ordinary
//! [`Stream`][futures::Stream] backed by its own unbounded channel:
//! [`SettingsClient::watch`] for the value of one key,
//! [`SettingsClient::updates`] for every change (optimistic writes and
//! rollbacks included) and [`SettingsClient::saved`] for changes that are
//! durable. Emitting never blocks and never runs subscriber code, and
//! dropping a subscription only affects that subscriber.
//!
//! ## Design notes
//!
//! ### Poll-driven batching
//!
//! As with any future, nothing happens until something is polled. The
//! [`RequestBatcher`] doesn't spawn tasks or depend on a runtime; its
//! requests are driven directly by the [`FlushFuture`]s waiting on them. Only
//! a single future (the most recent one to poll) is woken to drive a batch,
//! the rest are woken when it completes. A future waiting on a batch that is
//! blocked behind an in-flight request helps drive that request, so awaiting
//! only the latest write is enough to push out everything before it.
//!
//! Pending changes belong to the batcher rather than to their futures. A
//! change whose future was dropped before its batch was sent still goes out
//! with that batch, and a request already on the wire is never abandoned: the
//! next batch drives it before going out itself. [`RequestBatcher::flush`]
//! gives a handle to drive both, and [`SettingsClient::flush`] also settles
//! the client's side of writes whose `set` futures were dropped.
//!
//! ### Failures
//!
//! A failed request fails every change it carried. The first `set` to see
//! the failure rolls every key of the request back to what it was before the
//! batch (whether or not the other `set`s are still awaited), announces the
//! rollbacks on `updates` and reports the error to the sink once for the
//! whole request. Every `set` of that request resolves with `false`.

mod api;
mod batch;
mod changes;
mod client;
mod config;
mod error;
mod loading;
mod notify;
mod setting;
mod toasts;
mod wakerset;

pub use crate::config::{ClientConfig, ENV_PREFIX};
pub use api::{
    ApiBatcher, HttpRequest, HttpResponse, HttpTransport, SettingsApi, WriteDispatch, WriteFuture,
    SETTINGS_PATH, VERSION_HEADER,
};
pub use batch::{BatchId, ChangeQueue, FlushFuture, RequestBatcher};
pub use changes::ChangeSet;
pub use client::{SettingChange, SettingsClient};
pub use error::{Error, NetworkWriteError, Result};
pub use loading::{LoadingCount, LoadingSource};
pub use notify::Subscription;
pub use setting::{
    merge_with_defaults, InjectedSettings, SettingType, SettingsMap, SettingsResponse, UiSetting,
};
pub use toasts::{ErrorSink, Toast, ToastColor, ToastInput, Toasts};
