//! Report-by-exception filtering.
//!
//! A value is forwarded only when it differs from the last value forwarded
//! for the same (device, data item) key. Values are compared structurally,
//! so two independently built but equal JSON documents are suppressed.

use crate::observation::DataItemKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

/// Per-key record of the last forwarded value.
///
/// Entries are locked per shard, so updates to different keys do not
/// serialize behind a single global lock.
#[derive(Debug, Default)]
pub struct ReportByException {
    last: DashMap<DataItemKey, Value>,
}

impl ReportByException {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `value` should be forwarded for `key`.
    ///
    /// Returns `true` and records `value` when no value was forwarded for
    /// `key` yet or when it differs from the stored one. Returns `false`
    /// and leaves the stored value untouched otherwise.
    pub fn should_forward(&self, key: &DataItemKey, value: &Value) -> bool {
        self.forward_with(key, value, || ()).is_some()
    }

    /// Like [`should_forward`](Self::should_forward), but runs `forward`
    /// while the entry for `key` is still locked.
    ///
    /// Callers racing on the same key run `forward` in the order their values
    /// were recorded, so whatever `forward` hands off downstream arrives in
    /// filter order. `forward` must not block; it holds a shard lock.
    pub fn forward_with<F, R>(&self, key: &DataItemKey, value: &Value, forward: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        match self.last.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get() == value {
                    return None;
                }
                entry.insert(value.clone());
                Some(forward())
            }
            Entry::Vacant(entry) => {
                let _locked = entry.insert(value.clone());
                Some(forward())
            }
        }
    }

    /// The last value forwarded for `key`, if any.
    #[must_use]
    pub fn last_forwarded(&self, key: &DataItemKey) -> Option<Value> {
        self.last.get(key).map(|entry| entry.value().clone())
    }

    /// Number of keys with a forwarded value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// Whether nothing has been forwarded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
