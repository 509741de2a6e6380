//! Per-run scratch storage shared by the steps of one sequencer run.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Values handed from one step to the next within a single process.
///
/// Nothing in here is persisted; anything a resumed run needs must be
/// recoverable from disk. Values of any `Send + Sync` type are stored and
/// retrieved by downcasting.
///
/// # Examples
///
/// ```
/// use halfmap_filter::Context;
///
/// let mut ctx = Context::new();
/// ctx.insert("dimension", 60usize);
/// ctx.insert("label", "auto-refine".to_string());
///
/// assert_eq!(ctx.get::<usize>("dimension"), Some(&60));
/// assert_eq!(ctx.get::<String>("dimension"), None);
/// ```
pub struct Context {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    started_at: Instant,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("keys", &keys)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Returns the value under `key` if present and of type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Takes the value under `key` out of the context.
    ///
    /// A value of the wrong type is left in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if self.get::<T>(key).is_none() {
            return None;
        }
        self.values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Time since the context was created, i.e. since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookup() {
        let mut ctx = Context::new();
        ctx.insert("threads", 4u32);
        ctx.insert("mask", Some("mask.mrc".to_string()));

        assert_eq!(ctx.get::<u32>("threads"), Some(&4));
        assert_eq!(
            ctx.get::<Option<String>>("mask"),
            Some(&Some("mask.mrc".to_string()))
        );
        assert_eq!(ctx.get::<i64>("threads"), None);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_remove_keeps_mismatched_type() {
        let mut ctx = Context::new();
        ctx.insert("key", "value".to_string());

        assert_eq!(ctx.remove::<u8>("key"), None);
        assert!(ctx.contains_key("key"));

        assert_eq!(ctx.remove::<String>("key"), Some("value".to_string()));
        assert!(ctx.is_empty());
    }
}
