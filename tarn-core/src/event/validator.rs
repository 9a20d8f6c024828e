//! Per-type payload validation
//!
//! First pipeline stage. A schema here is deliberately lightweight: a set
//! of required payload fields, optionally with an expected JSON kind, plus
//! an optional custom predicate. Events that fail validation are dropped
//! with reason `validation-failed` and the failure is counted per type.

use super::types::{Event, EventType};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Expected JSON kind for a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// Present with any kind
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// Validation schema for one event type.
#[derive(Clone, Default)]
pub struct EventSchema {
    required: Vec<(&'static str, FieldKind)>,
    custom: Option<Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>>,
}

impl EventSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: &'static str, kind: FieldKind) -> Self {
        self.required.push((field, kind));
        self
    }

    /// Attach a custom predicate, run after the required-field checks.
    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(check));
        self
    }

    fn validate(&self, event: &Event) -> Result<(), String> {
        for (field, kind) in &self.required {
            match event.payload.get(*field) {
                None => return Err(format!("missing required field `{}`", field)),
                Some(value) if !kind.matches(value) => {
                    return Err(format!("field `{}` has wrong kind", field))
                }
                Some(_) => {}
            }
        }
        if let Some(check) = &self.custom {
            check(event)?;
        }
        Ok(())
    }
}

/// Registry of schemas, consulted once per event on the shard worker.
///
/// Types without a registered schema pass validation; producers opt in per
/// type. The default set covers the market-data and trading event families.
#[derive(Clone)]
pub struct EventValidator {
    schemas: Arc<RwLock<HashMap<EventType, EventSchema>>>,
}

impl EventValidator {
    /// Empty validator; everything passes.
    pub fn new() -> Self {
        Self {
            schemas: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validator preloaded with schemas for the built-in event families.
    pub fn with_defaults() -> Self {
        let validator = Self::new();
        validator.add_schema(
            EventType::MarketTick,
            EventSchema::new()
                .require("symbol", FieldKind::String)
                .require("price", FieldKind::Number),
        );
        validator.add_schema(
            EventType::MarketBar,
            EventSchema::new()
                .require("symbol", FieldKind::String)
                .require("open", FieldKind::Number)
                .require("high", FieldKind::Number)
                .require("low", FieldKind::Number)
                .require("close", FieldKind::Number),
        );
        validator.add_schema(
            EventType::OrderUpdate,
            EventSchema::new().require("client_order_id", FieldKind::String),
        );
        validator.add_schema(
            EventType::TradeFill,
            EventSchema::new()
                .require("client_order_id", FieldKind::String)
                .require("symbol", FieldKind::String)
                .require("volume", FieldKind::Number)
                .require("price", FieldKind::Number),
        );
        validator
    }

    pub fn add_schema(&self, event_type: EventType, schema: EventSchema) {
        self.schemas.write().insert(event_type, schema);
    }

    /// Validate an event against its type's schema, if any.
    pub fn validate(&self, event: &Event) -> Result<(), String> {
        match self.schemas.read().get(&event.event_type) {
            Some(schema) => schema.validate(event),
            None => Ok(()),
        }
    }
}

impl Default for EventValidator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
