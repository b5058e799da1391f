//! Hand-written fixed plans for recognized consumers.
//!
//! A requester with a registered builder bypasses the synthesizer. The fixed
//! SQL still goes through the safety gate, and rows still go through the
//! mapper after the builder's own object assembly.

pub mod directory;
pub mod org_chart;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::Row;
use crate::error::HandlerError;

pub use directory::DirectorySync;
pub use org_chart::OrgChart;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerMode {
    /// Single entity by id.
    OnDemand,
    /// Cursor-paginated list.
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequesterSignature {
    pub service: String,
    pub mode: HandlerMode,
}

impl RequesterSignature {
    pub fn new(service: &str, mode: HandlerMode) -> Self {
        Self {
            service: service.trim().to_ascii_lowercase(),
            mode,
        }
    }
}

/// A bound statement ready for the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPlan {
    pub data: BoundQuery,
    /// Total for batch plans.
    pub count: Option<BoundQuery>,
    /// Row key the next cursor is read from.
    pub cursor_column: String,
    /// Response key the entity list goes under in batch mode.
    pub entity_key: String,
}

pub trait FixedPlanBuilder: Send + Sync {
    fn name(&self) -> &str;

    fn build(
        &self,
        mode: HandlerMode,
        payload: &Map<String, Value>,
        page_size: usize,
    ) -> Result<FixedPlan, HandlerError>;

    /// Application-side final object assembly for one returned row.
    fn assemble(&self, row: Row) -> Row {
        row
    }
}

/// Strategy table resolved once at request entry.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    strategies: HashMap<RequesterSignature, Arc<dyn FixedPlanBuilder>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let org_chart: Arc<dyn FixedPlanBuilder> = Arc::new(OrgChart);
        let directory: Arc<dyn FixedPlanBuilder> = Arc::new(DirectorySync);
        for mode in [HandlerMode::OnDemand, HandlerMode::Batch] {
            registry.register("org-chart-service", mode, org_chart.clone());
            registry.register("directory-sync-service", mode, directory.clone());
        }
        registry
    }

    pub fn register(&mut self, service: &str, mode: HandlerMode, builder: Arc<dyn FixedPlanBuilder>) {
        self.strategies
            .insert(RequesterSignature::new(service, mode), builder);
    }

    pub fn resolve(&self, service: &str, mode: HandlerMode) -> Option<Arc<dyn FixedPlanBuilder>> {
        self.strategies
            .get(&RequesterSignature::new(service, mode))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

pub(crate) fn require_str(payload: &Map<String, Value>, key: &'static str) -> Result<String, HandlerError> {
    match payload.get(key) {
        None | Some(Value::Null) => Err(HandlerError::MissingField(key)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(HandlerError::MissingField(key)),
        Some(_) => Err(HandlerError::InvalidField(key)),
    }
}

pub(crate) fn optional_str(payload: &Map<String, Value>, key: &'static str) -> Result<Option<String>, HandlerError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HandlerError::InvalidField(key)),
    }
}

/// `{key: row[column], ...}`, or null when the row has no value for `id_column`.
pub(crate) fn nested(row: &mut Row, id_column: &str, fields: &[(&str, &str)]) -> Value {
    let present = row.get(id_column).is_some_and(|v| !v.is_null());
    let mut out = Map::new();
    for (key, column) in fields {
        let value = if *column == id_column {
            row.get(*column).cloned()
        } else {
            row.remove(*column)
        };
        out.insert(key.to_string(), value.unwrap_or(Value::Null));
    }
    if present {
        Value::Object(out)
    } else {
        Value::Null
    }
}
