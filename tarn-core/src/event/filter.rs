//! Ordered filter chain
//!
//! Second pipeline stage. Each filter sees the event after its
//! predecessors and either passes it through, replaces it with a
//! transformed copy, or drops it. The chain short-circuits on the first
//! drop; the drop is counted with reason `filtered`.

use super::types::Event;
use parking_lot::RwLock;
use std::sync::Arc;

/// Outcome of one filter application.
pub enum FilterOutcome {
    /// Keep the event as-is
    Pass,
    /// Continue the chain with a transformed event
    Transform(Event),
    /// Stop processing; the event is dropped
    Drop,
}

type FilterFn = dyn Fn(&Event) -> FilterOutcome + Send + Sync;

struct NamedFilter {
    name: String,
    filter: Box<FilterFn>,
}

/// The chain itself. Filters run in registration order.
#[derive(Clone)]
pub struct FilterChain {
    filters: Arc<RwLock<Vec<NamedFilter>>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            filters: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Event) -> FilterOutcome + Send + Sync + 'static,
    {
        self.filters.write().push(NamedFilter {
            name: name.into(),
            filter: Box::new(filter),
        });
    }

    /// Remove a filter by name. Returns whether one was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut filters = self.filters.write();
        let before = filters.len();
        filters.retain(|f| f.name != name);
        filters.len() != before
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }

    /// Run the chain. A drop returns the name of the dropping filter plus
    /// the event itself, so the caller can recycle the allocation.
    pub fn apply(&self, event: Event) -> Result<Event, (String, Event)> {
        let filters = self.filters.read();
        let mut current = event;
        for named in filters.iter() {
            match (named.filter)(&current) {
                FilterOutcome::Pass => {}
                FilterOutcome::Transform(transformed) => current = transformed,
                FilterOutcome::Drop => return Err((named.name.clone(), current)),
            }
        }
        Ok(current)
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::EventType;

    #[test]
    fn test_empty_chain_passes() {
        let chain = FilterChain::new();
        let ev = Event::new(EventType::System, "t");
        assert!(chain.apply(ev).is_ok());
    }

    #[test]
    fn test_drop_short_circuits_and_names_filter() {
        let chain = FilterChain::new();
        chain.add("reject-low-priority", |ev: &Event| {
            if ev.priority >= 8 {
                FilterOutcome::Drop
            } else {
                FilterOutcome::Pass
            }
        });
        let (name, _event) = chain
            .apply(Event::new(EventType::System, "t").with_priority(9))
            .unwrap_err();
        assert_eq!(name, "reject-low-priority");
    }

    #[test]
    fn test_transform_feeds_next_filter() {
        let chain = FilterChain::new();
        chain.add("tag", |ev: &Event| {
            FilterOutcome::Transform(ev.clone().with_field("tagged", true))
        });
        chain.add("require-tag", |ev: &Event| {
            if ev.payload.contains_key("tagged") {
                FilterOutcome::Pass
            } else {
                FilterOutcome::Drop
            }
        });
        let out = chain.apply(Event::new(EventType::System, "t")).unwrap();
        assert_eq!(out.payload.get("tagged"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_remove_by_name() {
        let chain = FilterChain::new();
        chain.add("drop-all", |_: &Event| FilterOutcome::Drop);
        assert!(chain.apply(Event::new(EventType::System, "t")).is_err());
        assert!(chain.remove("drop-all"));
        assert!(!chain.remove("drop-all"));
        assert!(chain.apply(Event::new(EventType::System, "t")).is_ok());
    }
}
