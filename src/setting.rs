//! The settings data model: what a single setting looks like, how the
//! declared defaults combine with what the server knows, and how stored
//! values are coerced into the values callers read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// A mapping from setting key to its metadata and values.
pub type SettingsMap = BTreeMap<String, UiSetting>;

/// The declared type of a setting. Only `json` and `number` affect how values
/// are read; the others are passed through as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Boolean,
    Number,
    Json,
    Array,
    Markdown,
    Color,
    Image,
    /// Any type this client doesn't recognize. Values are passed through.
    #[serde(other)]
    Other,
}

/// Everything known about a single setting. Any field may be missing: a
/// setting discovered through `set` starts out completely empty, and the
/// server's snapshot usually only carries `userValue` and `isOverridden`.
///
/// Fields this crate doesn't interpret (name, description, category,
/// options, ...) are kept in `extra` and survive merges and round trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSetting {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SettingType>,

    /// The declared default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// The user's customization, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_value: Option<Value>,

    /// Set by the server; an overridden setting can't be changed by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_overridden: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UiSetting {
    /// A setting with a declared type and default.
    pub fn new(kind: SettingType, value: impl Into<Value>) -> Self {
        Self {
            kind: Some(kind),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Builder helper to attach a user value.
    pub fn with_user_value(mut self, user_value: impl Into<Value>) -> Self {
        self.user_value = Some(user_value.into());
        self
    }

    /// Builder helper to mark the setting as overridden by the server.
    pub fn overridden(mut self) -> Self {
        self.is_overridden = Some(true);
        self
    }

    /// True if the user has customized this setting. A stored `null` counts as
    /// not customized.
    pub fn has_user_value(&self) -> bool {
        !matches!(self.user_value, None | Some(Value::Null))
    }

    pub fn is_overridden(&self) -> bool {
        self.is_overridden.unwrap_or(false)
    }

    /// Fill every field missing from `self` with the corresponding field from
    /// `other`. Fields present in both keep `self`'s value, except that nested
    /// JSON objects are filled recursively.
    pub(crate) fn fill_from(&mut self, other: &UiSetting) {
        fill_option(&mut self.kind, &other.kind);
        fill_json(&mut self.value, &other.value);
        fill_json(&mut self.user_value, &other.user_value);
        fill_option(&mut self.is_overridden, &other.is_overridden);
        fill_map(&mut self.extra, &other.extra);
    }
}

fn fill_option<T: Clone>(dest: &mut Option<T>, src: &Option<T>) {
    if dest.is_none() {
        dest.clone_from(src);
    }
}

fn fill_json(dest: &mut Option<Value>, src: &Option<Value>) {
    if dest.is_none() {
        dest.clone_from(src);
    } else if let (Some(Value::Object(dest)), Some(Value::Object(src))) = (dest, src) {
        fill_map(dest, src);
    }
}

fn fill_map(dest: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, src_value) in src {
        match dest.get_mut(key) {
            None => {
                dest.insert(key.clone(), src_value.clone());
            }
            Some(Value::Object(dest)) => {
                if let Value::Object(src) = src_value {
                    fill_map(dest, src)
                }
            }
            Some(..) => {}
        }
    }
}

/// Build the cache contents from the declared defaults and a server snapshot.
/// Defaults win for fields both sides declare; everything else the server
/// knows is filled in, including settings the defaults never mention.
pub fn merge_with_defaults(defaults: &SettingsMap, settings: &SettingsMap) -> SettingsMap {
    let mut merged = defaults.clone();

    for (key, setting) in settings {
        merged
            .entry(key.clone())
            .and_modify(|existing| existing.fill_from(setting))
            .or_insert_with(|| setting.clone());
    }

    merged
}

/// Convert a stored value into the value callers read, according to the
/// setting's type. `json` strings are parsed and `number` values become
/// floats; every other type is returned as-is.
pub(crate) fn coerce(kind: Option<SettingType>, value: Value) -> Result<Value> {
    match kind {
        Some(SettingType::Json) => match value {
            Value::String(raw) => Ok(serde_json::from_str(&raw)?),
            other => Ok(other),
        },
        Some(SettingType::Number) => match value {
            Value::Null => Ok(Value::Null),
            Value::Number(number) => number
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| Error::InvalidNumber(number.to_string())),
            Value::String(raw) => parse_float(&raw),
            other => Err(Error::InvalidNumber(other.to_string())),
        },
        _ => Ok(value),
    }
}

/// Parse the longest numeric prefix of `raw`, ignoring leading whitespace, so
/// `"10px"` reads as `10`. Fails if there is no such prefix or the number
/// isn't finite.
fn parse_float(raw: &str) -> Result<Value> {
    let text = raw.trim_start();
    let bytes = text.as_bytes();
    let digits_from = |mut at: usize| {
        while bytes.get(at).map_or(false, u8::is_ascii_digit) {
            at += 1;
        }
        at
    };

    let mut end = match bytes.first() {
        Some(b'+') | Some(b'-') => 1,
        _ => 0,
    };
    let int_end = digits_from(end);
    let mut seen_digits = int_end > end;
    end = int_end;

    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        seen_digits |= frac_end > end + 1;
        if seen_digits {
            end = frac_end;
        }
    }

    if seen_digits && matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let sign = match bytes.get(end + 1) {
            Some(b'+') | Some(b'-') => 1,
            _ => 0,
        };
        let exp_end = digits_from(end + 1 + sign);
        if exp_end > end + 1 + sign {
            end = exp_end;
        }
    }

    if !seen_digits {
        return Err(Error::InvalidNumber(raw.to_owned()));
    }

    text[..end]
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| Error::InvalidNumber(raw.to_owned()))
}

/// Identity-style comparison between the stored user value and a new value.
/// Primitives compare by value (numbers numerically); objects and arrays are
/// never equal to anything, since a freshly supplied object is always a new
/// value.
pub(crate) fn same_value(stored: Option<&Value>, new: &Value) -> bool {
    match (stored, new) {
        (None, _) => false,
        (Some(Value::Object(..)), _) | (Some(Value::Array(..)), _) => false,
        (_, Value::Object(..)) | (_, Value::Array(..)) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(stored), new) => stored == new,
    }
}

/// The initial settings state rendered into the page by the server: the
/// declared defaults plus the user's stored settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectedSettings {
    #[serde(default)]
    pub defaults: SettingsMap,
    #[serde(default)]
    pub user: SettingsMap,
}

/// The body the write endpoint answers with: the complete, authoritative set
/// of user settings after the write was applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsResponse {
    #[serde(default)]
    pub settings: SettingsMap,
}
