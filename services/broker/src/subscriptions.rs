//! Per-client set of subscribed primary keys.
//!
//! Keys compare with `Value` equality, which is type-sensitive: a numeric
//! key never matches the string of the same digits.  Callers must keep key
//! types consistent between writes and subscriptions.

use sqlapi_protocol::Value;

#[derive(Debug, Default)]
pub struct SubscriptionSet {
    keys: Vec<Value>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `key`.  An existing equal key is removed first, so
    /// duplicates collapse and the subscription is refreshed.
    pub fn subscribe(&mut self, key: Value) {
        self.unsubscribe(&key);
        self.keys.push(key);
    }

    /// Remove `key`; returns whether it was present.
    pub fn unsubscribe(&mut self, key: &Value) -> bool {
        match self.keys.iter().position(|k| k == key) {
            Some(index) => {
                self.keys.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
