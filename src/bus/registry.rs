//! Handler registry and the per-episode delivery ledger.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::events::Event;

/// The six buckets a handler can be registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Terminate,
    Crash,
    Quit,
    Finish,
    Hold,
    Always,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Terminate,
        Category::Crash,
        Category::Quit,
        Category::Finish,
        Category::Hold,
        Category::Always,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Terminate => "terminate",
            Category::Crash => "crash",
            Category::Quit => "quit",
            Category::Finish => "finish",
            Category::Hold => "hold",
            Category::Always => "always",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type HandlerFn = dyn Fn(&Event) + Send + Sync;

/// Identity of a handler: the address of its shared closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

/// A lifecycle event handler.
///
/// Clones share identity; registering a clone is registering the same
/// handler. Two closures wrapped separately are two handlers even when
/// their code is identical.
#[derive(Clone)]
pub struct Handler {
    f: Arc<HandlerFn>,
    name: Option<Arc<str>>,
}

impl Handler {
    pub fn new(f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            name: None,
        }
    }

    /// A handler with a name used in log output.
    pub fn named(name: impl Into<String>, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            name: Some(Arc::from(name.into())),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> HandlerId {
        HandlerId(Arc::as_ptr(&self.f) as *const () as usize)
    }

    pub fn call(&self, event: &Event) {
        (self.f)(event)
    }

    pub fn ptr_eq(&self, other: &Handler) -> bool {
        self.id() == other.id()
    }
}

impl<F> From<F> for Handler
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Handler::new(f)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Handler({name})"),
            None => write!(f, "Handler({:#x})", self.id().0),
        }
    }
}

/// Insertion-ordered, duplicate-free handler collection.
#[derive(Debug, Default, Clone)]
pub struct HandlerSet {
    handlers: Vec<Handler>,
}

impl HandlerSet {
    /// Append `handler` unless it is already present. Returns whether it was added.
    pub fn insert(&mut self, handler: Handler) -> bool {
        if self.handlers.iter().any(|h| h.ptr_eq(&handler)) {
            return false;
        }
        self.handlers.push(handler);
        true
    }

    pub fn get(&self, index: usize) -> Option<&Handler> {
        self.handlers.get(index)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handler> {
        self.handlers.iter()
    }
}

/// Handlers already invoked during the current episode.
#[derive(Debug, Default)]
pub struct Ledger {
    delivered: HashSet<HandlerId>,
}

impl Ledger {
    /// Mark `id` as delivered. Returns `false` if it already was.
    pub fn claim(&mut self, id: HandlerId) -> bool {
        self.delivered.insert(id)
    }

    pub fn clear(&mut self) {
        self.delivered.clear();
    }

    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_identity() {
        let h = Handler::new(|_| {});
        let c = h.clone();
        assert!(h.ptr_eq(&c));
        assert_eq!(h.id(), c.id());

        let other = Handler::new(|_| {});
        assert!(!h.ptr_eq(&other));
    }

    #[test]
    fn test_handler_set_is_ordered_and_duplicate_free() {
        let a = Handler::named("a", |_| {});
        let b = Handler::named("b", |_| {});
        let mut set = HandlerSet::default();

        assert!(set.insert(a.clone()));
        assert!(set.insert(b.clone()));
        assert!(!set.insert(a.clone()));

        let names: Vec<_> = set.iter().filter_map(Handler::name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ledger_claims_once() {
        let h = Handler::new(|_| {});
        let mut ledger = Ledger::default();
        assert!(ledger.claim(h.id()));
        assert!(!ledger.claim(h.id()));
        assert_eq!(ledger.len(), 1);
        ledger.clear();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&Category::Always).unwrap();
        assert_eq!(json, "\"always\"");
        let back: Category = serde_json::from_str("\"terminate\"").unwrap();
        assert_eq!(back, Category::Terminate);
    }

    #[test]
    fn test_debug_uses_name() {
        let h = Handler::named("flush-logs", |_| {});
        assert_eq!(format!("{h:?}"), "Handler(flush-logs)");
    }
}
