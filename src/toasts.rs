//! Toast notifications, and the error sink the settings client reports
//! failed writes to.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    notify::{Notifier, Subscription},
};

/// Receives errors that happened in the background and can't be returned
/// to anyone, such as a failed settings write.
pub trait ErrorSink {
    fn add(&self, error: &Error);
}

impl<F: Fn(&Error)> ErrorSink for F {
    fn add(&self, error: &Error) {
        self(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastColor {
    Primary,
    Success,
    Warning,
    Danger,
}

/// What to show in a toast. Converting from a string gives a toast with just
/// a title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ToastColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_type: Option<String>,
}

impl ToastInput {
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    // Fill in a color and icon unless the caller already chose them
    fn styled(mut self, color: ToastColor, icon_type: &str) -> Self {
        self.color.get_or_insert(color);
        self.icon_type.get_or_insert_with(|| icon_type.to_owned());
        self
    }
}

impl From<&str> for ToastInput {
    fn from(title: &str) -> Self {
        Self {
            title: Some(title.to_owned()),
            ..Self::default()
        }
    }
}

impl From<String> for ToastInput {
    fn from(title: String) -> Self {
        Self {
            title: Some(title),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toast {
    pub id: String,
    #[serde(flatten)]
    pub content: ToastInput,
}

/// The list of currently displayed toasts.
#[derive(Debug, Default)]
pub struct Toasts {
    list: Mutex<Vec<Toast>>,
    next_id: AtomicU64,
    watchers: Notifier<Vec<Toast>>,
}

impl Toasts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a toast. Ids are assigned sequentially, starting from "0".
    pub fn add(&self, input: impl Into<ToastInput>) -> Toast {
        let toast = Toast {
            id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            content: input.into(),
        };

        let mut list = self.list.lock();
        list.push(toast.clone());
        self.watchers.emit(list.clone());

        toast
    }

    pub fn add_success(&self, input: impl Into<ToastInput>) -> Toast {
        self.add(input.into().styled(ToastColor::Success, "check"))
    }

    pub fn add_warning(&self, input: impl Into<ToastInput>) -> Toast {
        self.add(input.into().styled(ToastColor::Warning, "help"))
    }

    pub fn add_danger(&self, input: impl Into<ToastInput>) -> Toast {
        self.add(input.into().styled(ToastColor::Danger, "alert"))
    }

    /// Dismiss a toast. Does nothing (and notifies nobody) if it isn't shown.
    pub fn remove(&self, toast: &Toast) {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|shown| shown.id != toast.id);

        if list.len() != before {
            self.watchers.emit(list.clone());
        }
    }

    pub fn list(&self) -> Vec<Toast> {
        self.list.lock().clone()
    }

    /// A stream of the displayed toasts: the current list first, then the
    /// whole list again after every change.
    pub fn watch(&self) -> Subscription<Vec<Toast>> {
        let list = self.list.lock();
        self.watchers.subscribe_with(list.clone())
    }
}

impl ErrorSink for Toasts {
    fn add(&self, error: &Error) {
        self.add_danger(ToastInput::from("Unable to update setting").text(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkWriteError;

    #[test]
    fn ids_are_sequential() {
        let toasts = Toasts::new();
        assert_eq!(toasts.add("first").id, "0");
        assert_eq!(toasts.add("second").id, "1");
        assert_eq!(toasts.list().len(), 2);
    }

    #[test]
    fn styled_helpers_keep_explicit_choices() {
        let toasts = Toasts::new();

        let danger = toasts.add_danger("boom");
        assert_eq!(danger.content.color, Some(ToastColor::Danger));
        assert_eq!(danger.content.icon_type.as_deref(), Some("alert"));

        let custom = toasts.add_success(ToastInput {
            title: Some("done".into()),
            icon_type: Some("star".into()),
            ..ToastInput::default()
        });
        assert_eq!(custom.content.color, Some(ToastColor::Success));
        assert_eq!(custom.content.icon_type.as_deref(), Some("star"));
    }

    #[test]
    fn remove_notifies_only_on_change() {
        let toasts = Toasts::new();
        let toast = toasts.add("hello");
        let mut watch = toasts.watch();

        toasts.remove(&toast);
        toasts.remove(&toast);

        assert_eq!(watch.try_next().map(|list| list.len()), Some(1));
        assert_eq!(watch.try_next().map(|list| list.len()), Some(0));
        assert_eq!(watch.try_next(), None);
    }

    #[test]
    fn reports_errors_as_danger_toasts() {
        let toasts = Toasts::new();
        ErrorSink::add(&toasts, &NetworkWriteError::Status(500).into());

        let list = toasts.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].content.title.as_deref(), Some("Unable to update setting"));
        assert_eq!(
            list[0].content.text.as_deref(),
            Some("Request failed with status code: 500")
        );
        assert_eq!(list[0].content.color, Some(ToastColor::Danger));
    }
}
