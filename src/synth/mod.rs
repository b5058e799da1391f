//! Query synthesis: turn `(payload, template)` into one parameterized SELECT.

pub mod llm;
pub mod rule_based;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::db::SchemaContext;
use crate::error::{ExecutionError, SynthesisError};
use crate::rules::RuleTable;
use crate::template::Template;

pub use llm::{LlmConfig, LlmProvider, LlmSynthesizer};
pub use rule_based::RuleBasedSynthesizer;

/// Payload key the batch cursor is bound from.
pub const CURSOR_KEY: &str = "cursor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisMode {
    Point,
    Batch {
        cursor: Option<String>,
        page_size: usize,
    },
    /// Total for the paired batch query, without the cursor bound.
    Count,
}

impl SynthesisMode {
    pub fn label(&self) -> &'static str {
        match self {
            SynthesisMode::Point => "point",
            SynthesisMode::Batch { .. } => "batch",
            SynthesisMode::Count => "count",
        }
    }
}

pub struct SynthesisRequest<'a> {
    pub mode: SynthesisMode,
    pub requester: &'a str,
    pub payload: &'a Map<String, Value>,
    pub template: &'a Template,
    pub schema: &'a SchemaContext,
    pub rules: &'a RuleTable,
    /// Row cap for point lookups that may return several rows.
    pub max_rows: usize,
}

/// A synthesized statement. `$n` binds `param_order[n - 1]` from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlPlan {
    pub sql: String,
    pub param_order: Vec<String>,
    pub cursor_column: Option<String>,
    /// Root table the statement reads.
    pub entity: Option<String>,
}

impl SqlPlan {
    /// Bind parameters as nullable text, in placeholder order.
    pub fn bind(&self, payload: &Map<String, Value>) -> Result<Vec<Option<String>>, ExecutionError> {
        self.param_order
            .iter()
            .map(|key| match payload.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(Value::Number(n)) => Ok(Some(n.to_string())),
                Some(Value::Bool(b)) => Ok(Some(b.to_string())),
                Some(_) => Err(ExecutionError::Parameter {
                    key: key.clone(),
                    reason: "objects and arrays cannot be bound".to_string(),
                }),
            })
            .collect()
    }
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<SqlPlan, SynthesisError>;
}

/// Highest `$n` placeholder in `sql`.
pub fn max_placeholder(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if let Ok(n) = sql[start..end].parse::<usize>() {
                max = max.max(n);
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }
    max
}

/// Structural checks every plan must pass regardless of who produced it.
pub fn check_plan_shape(mode: &SynthesisMode, plan: &SqlPlan) -> Result<(), SynthesisError> {
    let normalized = plan
        .sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();

    if !normalized.starts_with("SELECT") {
        return Err(SynthesisError::Unusable("plan is not a SELECT".into()));
    }
    match mode {
        SynthesisMode::Count => {
            if !normalized.starts_with("SELECT COUNT(*)") {
                return Err(SynthesisError::Unusable(
                    "count plan must start with SELECT COUNT(*)".into(),
                ));
            }
            if normalized.contains("JSON_AGG") || normalized.contains("ARRAY_AGG") {
                return Err(SynthesisError::Unusable(
                    "count plan must not aggregate rows".into(),
                ));
            }
        }
        SynthesisMode::Batch { cursor, .. } => {
            if !normalized.contains("ORDER BY") || !normalized.contains("LIMIT") {
                return Err(SynthesisError::Unusable(
                    "batch plan needs ORDER BY and LIMIT".into(),
                ));
            }
            if plan.cursor_column.is_none() {
                return Err(SynthesisError::Unusable(
                    "batch plan names no cursor column".into(),
                ));
            }
            if cursor.is_some() && !has_cursor_bound(plan) {
                return Err(SynthesisError::Unusable(
                    "batch plan does not bound rows by the cursor".into(),
                ));
            }
        }
        SynthesisMode::Point => {}
    }

    let highest = max_placeholder(&plan.sql);
    if highest > plan.param_order.len() {
        return Err(SynthesisError::Unusable(format!(
            "placeholder ${} has no parameter ({} bound)",
            highest,
            plan.param_order.len()
        )));
    }
    Ok(())
}

/// Some column is compared `>` the placeholder bound to the cursor key.
fn has_cursor_bound(plan: &SqlPlan) -> bool {
    let Some(index) = plan.param_order.iter().position(|k| k == CURSOR_KEY) else {
        return false;
    };
    let compact: String = plan.sql.chars().filter(|c| !c.is_whitespace()).collect();
    let needle = format!(">${}", index + 1);
    compact.match_indices(&needle).any(|(at, _)| {
        let before = compact[..at].chars().next_back();
        let after = compact[at + needle.len()..].chars().next();
        !matches!(before, Some('<') | Some('-')) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

/// A count pairs with a batch page only when it binds the same filters,
/// in the same order, minus the cursor.
pub fn check_count_pairing(data: &SqlPlan, count: &SqlPlan) -> Result<(), SynthesisError> {
    let filters: Vec<&String> = data
        .param_order
        .iter()
        .filter(|k| k.as_str() != CURSOR_KEY)
        .collect();
    if count.param_order.iter().eq(filters.iter().copied()) {
        return Ok(());
    }
    Err(SynthesisError::Unusable(format!(
        "count binds {:?} but the page filters bind {:?}",
        count.param_order, filters
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(sql: &str, params: &[&str]) -> SqlPlan {
        SqlPlan {
            sql: sql.to_string(),
            param_order: params.iter().map(|s| s.to_string()).collect(),
            cursor_column: None,
            entity: None,
        }
    }

    #[test]
    fn test_bind() {
        let payload = json!({"company_id": "c1", "limit": 5, "active": true, "cursor": null});
        let p = plan("SELECT 1", &["company_id", "limit", "active", "cursor", "missing"]);
        assert_eq!(
            p.bind(payload.as_object().unwrap()).unwrap(),
            vec![Some("c1".into()), Some("5".into()), Some("true".into()), None, None]
        );
    }

    #[test]
    fn test_bind_rejects_containers() {
        let payload = json!({"ids": ["a", "b"]});
        let err = plan("SELECT 1", &["ids"])
            .bind(payload.as_object().unwrap())
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Parameter { ref key, .. } if key == "ids"));
    }

    #[test]
    fn test_max_placeholder() {
        assert_eq!(max_placeholder("SELECT 1"), 0);
        assert_eq!(max_placeholder("WHERE a = $1::text AND b > $12::text::uuid"), 12);
        assert_eq!(max_placeholder("SELECT '$' || x"), 0);
    }

    #[test]
    fn test_count_shape() {
        let ok = plan("SELECT COUNT(*) FROM employees e WHERE e.company_id = $1::text::uuid", &["company_id"]);
        assert!(check_plan_shape(&SynthesisMode::Count, &ok).is_ok());
        let nested = plan("SELECT COUNT(*), json_agg(e) FROM employees e", &[]);
        assert!(check_plan_shape(&SynthesisMode::Count, &nested).is_err());
        let not_count = plan("SELECT e.id FROM employees e", &[]);
        assert!(check_plan_shape(&SynthesisMode::Count, &not_count).is_err());
    }

    fn page(sql: &str, params: &[&str]) -> SqlPlan {
        SqlPlan {
            cursor_column: Some("employee_id".into()),
            ..plan(sql, params)
        }
    }

    fn batch(cursor: Option<&str>) -> SynthesisMode {
        SynthesisMode::Batch {
            cursor: cursor.map(str::to_string),
            page_size: 2,
        }
    }

    #[test]
    fn test_batch_shape() {
        let ok = page("SELECT e.id AS employee_id FROM employees e ORDER BY e.id ASC LIMIT 2", &[]);
        assert!(check_plan_shape(&batch(None), &ok).is_ok());
        let unordered = page("SELECT e.id AS employee_id FROM employees e LIMIT 2", &[]);
        assert!(check_plan_shape(&batch(None), &unordered).is_err());
        let no_cursor_column = plan("SELECT e.id FROM employees e ORDER BY e.id ASC LIMIT 2", &[]);
        assert!(check_plan_shape(&batch(None), &no_cursor_column).is_err());
    }

    #[test]
    fn test_later_page_must_bound_by_cursor() {
        let mode = batch(Some("b"));
        let bounded = page(
            "SELECT e.id AS employee_id FROM employees e \
             WHERE e.company_id = $1::text::uuid AND e.id > $2::text::uuid ORDER BY e.id ASC LIMIT 2",
            &["company_id", "cursor"],
        );
        assert!(check_plan_shape(&mode, &bounded).is_ok());

        // Same SQL as the first page: the cursor is never bound.
        let unbounded = page(
            "SELECT e.id AS employee_id FROM employees e \
             WHERE e.company_id = $1::text::uuid ORDER BY e.id ASC LIMIT 2",
            &["company_id"],
        );
        assert!(matches!(
            check_plan_shape(&mode, &unbounded),
            Err(SynthesisError::Unusable(_))
        ));

        for sql in [
            "SELECT e.id AS employee_id FROM employees e WHERE e.id >= $1::text::uuid ORDER BY e.id LIMIT 2",
            "SELECT e.id AS employee_id FROM employees e WHERE e.id <> $1::text::uuid ORDER BY e.id LIMIT 2",
            "SELECT e.id AS employee_id FROM employees e WHERE e.id = $1::text::uuid ORDER BY e.id LIMIT 2",
        ] {
            assert!(check_plan_shape(&mode, &page(sql, &["cursor"])).is_err(), "{}", sql);
        }
    }

    #[test]
    fn test_count_pairing() {
        let data = page(
            "SELECT e.id AS employee_id FROM employees e \
             WHERE e.company_id = $1::text::uuid AND e.id > $2::text::uuid ORDER BY e.id ASC LIMIT 2",
            &["company_id", "cursor"],
        );
        let count = plan(
            "SELECT COUNT(*) FROM employees e WHERE e.company_id = $1::text::uuid",
            &["company_id"],
        );
        assert!(check_count_pairing(&data, &count).is_ok());

        let unfiltered = plan("SELECT COUNT(*) FROM employees e", &[]);
        assert!(check_count_pairing(&data, &unfiltered).is_err());
        let with_cursor = plan(
            "SELECT COUNT(*) FROM employees e WHERE e.company_id = $1::text::uuid AND e.id > $2::text::uuid",
            &["company_id", "cursor"],
        );
        assert!(check_count_pairing(&data, &with_cursor).is_err());
    }

    #[test]
    fn test_uncovered_placeholder() {
        let p = plan("SELECT e.id FROM employees e WHERE e.id = $2::text::uuid", &["employee_id"]);
        assert!(matches!(
            check_plan_shape(&SynthesisMode::Point, &p),
            Err(SynthesisError::Unusable(_))
        ));
    }
}
