//! Read-only safety gate. Every statement passes through here before it
//! reaches the pool, whether synthesized or hand-written.

use sqlparser::ast as sp;
use sqlparser::ast::{visit_expressions, visit_relations};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use std::collections::HashSet;
use std::ops::ControlFlow;

use crate::db::SchemaContext;
use crate::error::UnsafeQuery;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE",
];

const FORBIDDEN_FUNCTION_PREFIXES: &[&str] = &["pg_", "dblink", "lo_"];

const FORBIDDEN_FUNCTIONS: &[&str] = &["set_config", "current_setting"];

#[derive(Debug, Clone)]
pub struct SafetyGate {
    allowed_tables: HashSet<String>,
}

impl SafetyGate {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_tables: tables
                .into_iter()
                .map(|t| t.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn for_schema(schema: &SchemaContext) -> Self {
        Self::new(schema.table_names())
    }

    pub fn validate(&self, sql: &str) -> bool {
        self.inspect(sql).is_ok()
    }

    pub fn inspect(&self, sql: &str) -> Result<(), UnsafeQuery> {
        keyword_screen(sql)?;

        let statements = SqlParser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| UnsafeQuery::new(format!("does not parse: {}", e)))?;
        let statement = match statements.as_slice() {
            [single] => single,
            other => {
                return Err(UnsafeQuery::new(format!(
                    "expected exactly one statement, found {}",
                    other.len()
                )))
            }
        };
        let sp::Statement::Query(query) = statement else {
            return Err(UnsafeQuery::new("not a query"));
        };
        if !query.locks.is_empty() {
            return Err(UnsafeQuery::new("row locking clause"));
        }
        if selects_into(&query.body) {
            return Err(UnsafeQuery::new("SELECT ... INTO"));
        }

        if let ControlFlow::Break(name) = visit_relations(statement, |relation: &sp::ObjectName| {
            if self.is_allowed(relation) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(relation.to_string())
            }
        }) {
            return Err(UnsafeQuery::new(format!("relation `{}` is not allowed", name)));
        }

        if let ControlFlow::Break(name) = visit_expressions(statement, |expr: &sp::Expr| {
            if let sp::Expr::Function(f) = expr {
                let name = f
                    .name
                    .0
                    .last()
                    .map(|i| i.value.to_ascii_lowercase())
                    .unwrap_or_default();
                if is_forbidden_function(&name) {
                    return ControlFlow::Break(name);
                }
            }
            ControlFlow::Continue(())
        }) {
            return Err(UnsafeQuery::new(format!("function `{}` is not allowed", name)));
        }

        Ok(())
    }

    fn is_allowed(&self, relation: &sp::ObjectName) -> bool {
        match relation.0.as_slice() {
            [table] => self.allowed_tables.contains(&table.value.to_ascii_lowercase()),
            [schema, table] => {
                schema.value.eq_ignore_ascii_case("public")
                    && self.allowed_tables.contains(&table.value.to_ascii_lowercase())
            }
            _ => false,
        }
    }
}

/// Cheap lexical screen run before parsing: the statement must open with
/// SELECT and no mutation/DDL keyword may appear as a whole word anywhere.
pub fn keyword_screen(sql: &str) -> Result<(), UnsafeQuery> {
    let mut words = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());

    let starts_with_select = sql
        .trim_start()
        .get(..6)
        .is_some_and(|p| p.eq_ignore_ascii_case("SELECT"))
        && words.next().is_some_and(|w| w.eq_ignore_ascii_case("SELECT"));
    if !starts_with_select {
        return Err(UnsafeQuery::new("statement must start with SELECT"));
    }

    for word in words {
        if let Some(kw) = FORBIDDEN_KEYWORDS.iter().find(|k| word.eq_ignore_ascii_case(k)) {
            return Err(UnsafeQuery::new(format!("contains {}", kw)));
        }
    }
    Ok(())
}

fn is_forbidden_function(name: &str) -> bool {
    FORBIDDEN_FUNCTIONS.contains(&name)
        || FORBIDDEN_FUNCTION_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn selects_into(body: &sp::SetExpr) -> bool {
    match body {
        sp::SetExpr::Select(select) => select.into.is_some(),
        sp::SetExpr::Query(query) => selects_into(&query.body),
        sp::SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SafetyGate {
        SafetyGate::for_schema(&SchemaContext::builtin())
    }

    #[test]
    fn test_stacked_drop_rejected() {
        assert!(!gate().validate("SELECT * FROM employees; DROP TABLE employees;"));
    }

    #[test]
    fn test_parameterized_select_accepted() {
        assert!(gate().validate("SELECT id FROM employees WHERE company_id = $1"));
        assert!(gate().validate(
            "SELECT e.id AS employee_id FROM employees e LEFT JOIN companies c ON c.id = e.company_id \
             WHERE e.company_id = $1::text::uuid AND e.id > $2::text::uuid ORDER BY e.id ASC LIMIT 2"
        ));
    }

    #[test]
    fn test_keywords_are_whole_words() {
        assert!(keyword_screen("SELECT updated_at, created_by FROM employees").is_ok());
        assert!(keyword_screen("select 1 from employees where x = 'a' or 1=1 --update").is_err());
        assert!(keyword_screen("SELECT * FROM employees WHERE Delete = 1").is_err());
    }

    #[test]
    fn test_must_start_with_select() {
        assert!(keyword_screen("  select id from employees").is_ok());
        assert!(keyword_screen("WITH x AS (SELECT 1) SELECT * FROM x").is_err());
        assert!(keyword_screen("SELECTED id").is_err());
        assert!(keyword_screen("").is_err());
        assert!(!gate().validate("EXPLAIN SELECT * FROM employees"));
    }

    #[test]
    fn test_unknown_relation_rejected() {
        let err = gate().inspect("SELECT usename FROM pg_user").unwrap_err();
        assert!(err.reason.contains("pg_user"));
        assert!(!gate().validate("SELECT * FROM information_schema.tables"));
        assert!(!gate().validate("SELECT * FROM other.employees"));
        assert!(gate().validate("SELECT * FROM public.employees"));
    }

    #[test]
    fn test_subquery_relations_checked() {
        assert!(gate().validate(
            "SELECT e.id, (SELECT COUNT(*) FROM employees cs WHERE cs.company_id = e.company_id) AS company_size FROM employees e"
        ));
        assert!(!gate().validate(
            "SELECT e.id, (SELECT COUNT(*) FROM secrets s) AS n FROM employees e"
        ));
    }

    #[test]
    fn test_admin_functions_rejected() {
        assert!(!gate().validate("SELECT pg_sleep(10) FROM employees"));
        assert!(!gate().validate("SELECT set_config('role', 'admin', false) FROM employees"));
        assert!(!gate().validate("SELECT lo_import('/etc/passwd') FROM employees"));
        assert!(gate().validate("SELECT COUNT(*) FROM employees e"));
    }

    #[test]
    fn test_locks_and_into_rejected() {
        assert!(!gate().validate("SELECT * FROM employees FOR UPDATE"));
        assert!(!gate().validate("SELECT * FROM employees FOR SHARE"));
        assert!(!gate().validate("SELECT * INTO backup_employees FROM employees"));
    }

    #[test]
    fn test_unparseable_rejected() {
        let err = gate().inspect("SELECT * FROM employees WHERE (").unwrap_err();
        assert!(err.reason.starts_with("does not parse"));
    }
}
