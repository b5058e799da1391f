//! Business rule table: canonical field names, where their values live, and
//! the synonyms callers use for them.
//!
//! Built-ins cover the HR schema; an optional TOML overlay can replace any
//! built-in (matched by table and field) or add new entries:
//!
//! ```toml
//! [[rule]]
//! table = "employees"
//! field = "seniority_years"
//! expression = "EXTRACT(YEAR FROM age(e.hire_date))::int"
//! synonyms = ["tenure"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::db::SchemaContext;

/// Where a canonical field's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleSource {
    /// A physical column, addressed through the root alias or a
    /// relationship alias of the root table.
    Column { alias: String, column: String },
    /// A trusted SQL derivation evaluated per root row. `joins` lists the
    /// relationship aliases it needs.
    Derived { sql: String, joins: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleEntry {
    pub table: String,
    pub field: String,
    pub source: RuleSource,
    pub synonyms: Vec<String>,
}

impl RuleEntry {
    pub fn answers_to(&self, name: &str) -> bool {
        self.field == name || self.synonyms.iter().any(|s| s == name)
    }

    /// Whether the derivation yields JSON (one aggregate per root row).
    pub fn is_aggregate(&self) -> bool {
        match &self.source {
            RuleSource::Derived { sql, .. } => {
                let upper = sql.to_ascii_uppercase();
                upper.contains("JSON_AGG") || upper.contains("ARRAY_AGG")
            }
            RuleSource::Column { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {table}.{field}: exactly one of `column` or `expression` is required")]
    AmbiguousSource { table: String, field: String },
    #[error("rule {table}.{field}: `column` must be `alias.column`, got `{value}`")]
    BadColumn {
        table: String,
        field: String,
        value: String,
    },
    #[error("invalid rule file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize)]
struct RawRule {
    table: String,
    field: String,
    column: Option<String>,
    expression: Option<String>,
    #[serde(default)]
    joins: Vec<String>,
    #[serde(default)]
    synonyms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RawRule>,
}

impl RawRule {
    fn into_entry(self) -> Result<RuleEntry, RuleError> {
        let source = match (self.column, self.expression) {
            (Some(column), None) => match column.split_once('.') {
                Some((alias, col)) if !alias.is_empty() && !col.is_empty() => RuleSource::Column {
                    alias: alias.to_string(),
                    column: col.to_string(),
                },
                _ => {
                    return Err(RuleError::BadColumn {
                        table: self.table,
                        field: self.field,
                        value: column,
                    })
                }
            },
            (None, Some(sql)) => RuleSource::Derived {
                sql,
                joins: self.joins,
            },
            _ => {
                return Err(RuleError::AmbiguousSource {
                    table: self.table,
                    field: self.field,
                })
            }
        };
        Ok(RuleEntry {
            table: self.table,
            field: self.field,
            source,
            synonyms: self.synonyms,
        })
    }
}

/// Immutable after startup; shared behind `Arc`.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    entries: Vec<RuleEntry>,
}

impl RuleTable {
    pub fn builtin() -> Self {
        Self {
            entries: built_in_rules(),
        }
    }

    pub fn from_entries(entries: Vec<RuleEntry>) -> Self {
        Self { entries }
    }

    /// Built-ins plus the overlay at `path`, if any.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let table = Self::builtin();
        let Some(path) = path else {
            return Ok(table);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule overlay {}", path.display()))?;
        let overlay = parse_overlay(&text)
            .with_context(|| format!("Failed to load rule overlay {}", path.display()))?;
        tracing::info!(path = %path.display(), rules = overlay.len(), "rule overlay loaded");
        Ok(table.with_overlay(overlay))
    }

    /// Replace entries with the same (table, field), append the rest.
    pub fn with_overlay(mut self, overlay: Vec<RuleEntry>) -> Self {
        for entry in overlay {
            match self
                .entries
                .iter_mut()
                .find(|e| e.table == entry.table && e.field == entry.field)
            {
                Some(existing) => *existing = entry,
                None => self.entries.push(entry),
            }
        }
        self
    }

    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    /// Rule for a template field or payload key on `table`: canonical names
    /// win over synonyms.
    pub fn resolve(&self, table: &str, name: &str) -> Option<&RuleEntry> {
        let on_table = || self.entries.iter().filter(move |e| e.table == table);
        on_table()
            .find(|e| e.field == name)
            .or_else(|| on_table().find(|e| e.synonyms.iter().any(|s| s == name)))
    }

    /// Canonical names `name` is a synonym of, across all tables.
    pub fn canonical_names<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.synonyms.iter().any(|s| s == name))
            .map(|e| e.field.as_str())
    }

    /// Entries that reference aliases or columns the schema does not have.
    pub fn problems(&self, schema: &SchemaContext) -> Vec<String> {
        let mut out = Vec::new();
        for e in &self.entries {
            let Some(root) = schema.table(&e.table) else {
                out.push(format!("{}.{}: unknown table", e.table, e.field));
                continue;
            };
            match &e.source {
                RuleSource::Column { alias, column } => {
                    if schema.column_type(&root.name, alias, column).is_none() {
                        out.push(format!("{}.{}: unknown column {alias}.{column}", e.table, e.field));
                    }
                }
                RuleSource::Derived { joins, .. } => {
                    for alias in joins {
                        if schema.relationship(&root.name, alias).is_none() {
                            out.push(format!("{}.{}: unknown join {alias}", e.table, e.field));
                        }
                    }
                }
            }
        }
        out
    }

    /// Render the table as prompt/grounding text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            let source = match &e.source {
                RuleSource::Column { alias, column } => format!("{alias}.{column}"),
                RuleSource::Derived { sql, .. } => sql.clone(),
            };
            out.push_str(&format!("{}.{} := {}", e.table, e.field, source));
            if !e.synonyms.is_empty() {
                out.push_str(&format!("  (also: {})", e.synonyms.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

pub fn parse_overlay(text: &str) -> Result<Vec<RuleEntry>, RuleError> {
    let file: RuleFile = toml::from_str(text)?;
    file.rules.into_iter().map(RawRule::into_entry).collect()
}

fn column(table: &str, field: &str, alias: &str, col: &str, synonyms: &[&str]) -> RuleEntry {
    RuleEntry {
        table: table.to_string(),
        field: field.to_string(),
        source: RuleSource::Column {
            alias: alias.to_string(),
            column: col.to_string(),
        },
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
    }
}

fn derived(table: &str, field: &str, sql: &str, joins: &[&str], synonyms: &[&str]) -> RuleEntry {
    RuleEntry {
        table: table.to_string(),
        field: field.to_string(),
        source: RuleSource::Derived {
            sql: sql.to_string(),
            joins: joins.iter().map(|s| s.to_string()).collect(),
        },
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn built_in_rules() -> Vec<RuleEntry> {
    vec![
        // employees
        column("employees", "employee_id", "e", "id", &["id", "user_id", "emp_id"]),
        column("employees", "full_name", "e", "full_name", &["name", "employee_name", "display_name"]),
        column("employees", "email", "e", "email", &["work_email", "email_address"]),
        column("employees", "job_title", "e", "job_title", &["title", "position", "role"]),
        column("employees", "status", "e", "status", &["employment_status"]),
        column("employees", "hire_date", "e", "hire_date", &["start_date", "joined_on"]),
        column("employees", "company_id", "e", "company_id", &["org_id", "tenant_id"]),
        column("employees", "company_name", "c", "name", &["company", "organization"]),
        derived(
            "employees",
            "company_size",
            "(SELECT COUNT(*) FROM employees cs WHERE cs.company_id = e.company_id)",
            &[],
            &["headcount", "employee_count"],
        ),
        column("employees", "department_id", "e", "department_id", &["dept_id"]),
        column("employees", "department", "d", "name", &["department_name", "dept", "dept_name"]),
        column("employees", "team_id", "e", "team_id", &[]),
        column("employees", "team", "t", "name", &["team_name"]),
        column("employees", "manager_id", "e", "manager_id", &["supervisor_id", "reports_to"]),
        column("employees", "manager_name", "m", "full_name", &["manager", "supervisor"]),
        column("employees", "manager_email", "m", "email", &["supervisor_email"]),
        column("employees", "approver", "m", "full_name", &["approver_name"]),
        column("employees", "approver_email", "m", "email", &[]),
        derived(
            "employees",
            "direct_reports",
            "(SELECT COALESCE(json_agg(json_build_object('employee_id', dr.id, 'full_name', dr.full_name, 'email', dr.email, 'job_title', dr.job_title) ORDER BY dr.full_name), '[]'::json) FROM employees dr WHERE dr.manager_id = e.id)",
            &[],
            &["reports", "subordinates", "team_members"],
        ),
        derived(
            "employees",
            "leave_requests",
            "(SELECT COALESCE(json_agg(json_build_object('leave_request_id', lr.id, 'start_date', lr.start_date, 'end_date', lr.end_date, 'status', lr.status, 'reason', lr.reason) ORDER BY lr.start_date DESC), '[]'::json) FROM leave_requests lr WHERE lr.employee_id = e.id)",
            &[],
            &["leaves", "time_off"],
        ),
        // departments
        column("departments", "department_id", "d", "id", &["id", "dept_id"]),
        column("departments", "department_name", "d", "name", &["name", "department", "dept_name"]),
        column("departments", "company_id", "d", "company_id", &["org_id", "tenant_id"]),
        column("departments", "company_name", "c", "name", &["company", "organization"]),
        column("departments", "head_name", "h", "full_name", &["head", "department_head"]),
        column("departments", "head_email", "h", "email", &[]),
        derived(
            "departments",
            "employee_count",
            "(SELECT COUNT(*) FROM employees de WHERE de.department_id = d.id)",
            &[],
            &["headcount", "size"],
        ),
        derived(
            "departments",
            "teams",
            "(SELECT COALESCE(json_agg(json_build_object('team_id', tm.id, 'team_name', tm.name) ORDER BY tm.name), '[]'::json) FROM teams tm WHERE tm.department_id = d.id)",
            &[],
            &["team_list"],
        ),
        // teams
        column("teams", "team_id", "t", "id", &["id"]),
        column("teams", "team_name", "t", "name", &["name", "team"]),
        column("teams", "department_id", "t", "department_id", &["dept_id"]),
        column("teams", "department_name", "d", "name", &["department", "dept_name"]),
        column("teams", "lead_name", "l", "full_name", &["lead", "team_lead"]),
        derived(
            "teams",
            "members",
            "(SELECT COALESCE(json_agg(json_build_object('employee_id', tmb.id, 'full_name', tmb.full_name, 'job_title', tmb.job_title) ORDER BY tmb.full_name), '[]'::json) FROM employees tmb WHERE tmb.team_id = t.id)",
            &[],
            &["team_members", "employees"],
        ),
        // companies
        column("companies", "company_id", "c", "id", &["id", "org_id", "tenant_id"]),
        column("companies", "company_name", "c", "name", &["name", "company", "organization"]),
        column("companies", "industry", "c", "industry", &["sector"]),
        derived(
            "companies",
            "company_size",
            "(SELECT COUNT(*) FROM employees cs WHERE cs.company_id = c.id)",
            &[],
            &["headcount", "employee_count"],
        ),
        // leave_requests
        column("leave_requests", "leave_request_id", "r", "id", &["id", "request_id", "leave_id"]),
        column("leave_requests", "employee_id", "r", "employee_id", &["user_id", "emp_id"]),
        column("leave_requests", "employee_name", "e", "full_name", &["requester", "name"]),
        column("leave_requests", "employee_email", "e", "email", &["email"]),
        column("leave_requests", "approver_id", "r", "approver_id", &[]),
        column("leave_requests", "approver", "a", "full_name", &["approver_name", "approved_by"]),
        column("leave_requests", "approver_email", "a", "email", &[]),
        column("leave_requests", "start_date", "r", "start_date", &["from", "starts_on"]),
        column("leave_requests", "end_date", "r", "end_date", &["to", "ends_on"]),
        column("leave_requests", "status", "r", "status", &["leave_status"]),
        column("leave_requests", "reason", "r", "reason", &["note", "comment"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_rules_match_schema() {
        let problems = RuleTable::builtin().problems(&SchemaContext::builtin());
        assert!(problems.is_empty(), "{problems:?}");
    }

    #[test]
    fn test_resolve_canonical_before_synonym() {
        let rules = RuleTable::builtin();
        let e = rules.resolve("employees", "employee_id").unwrap();
        assert_eq!(
            e.source,
            RuleSource::Column {
                alias: "e".into(),
                column: "id".into()
            }
        );
        assert_eq!(rules.resolve("employees", "user_id").unwrap().field, "employee_id");
        assert_eq!(rules.resolve("employees", "name").unwrap().field, "full_name");
        assert_eq!(rules.resolve("departments", "name").unwrap().field, "department_name");
        assert!(rules.resolve("employees", "shoe_size").is_none());
    }

    #[test]
    fn test_canonical_names_for_synonym() {
        let rules = RuleTable::builtin();
        let names: Vec<&str> = rules.canonical_names("name").collect();
        assert!(names.contains(&"full_name"));
        assert!(names.contains(&"department_name"));
        assert!(rules.canonical_names("full_name").next().is_none());
    }

    #[test]
    fn test_aggregate_detection() {
        let rules = RuleTable::builtin();
        assert!(rules.resolve("employees", "direct_reports").unwrap().is_aggregate());
        assert!(!rules.resolve("employees", "company_size").unwrap().is_aggregate());
        assert!(!rules.resolve("employees", "email").unwrap().is_aggregate());
    }

    #[test]
    fn test_overlay_replaces_and_appends() {
        let overlay = parse_overlay(
            r#"
            [[rule]]
            table = "employees"
            field = "email"
            column = "e.email"
            synonyms = ["mail"]

            [[rule]]
            table = "employees"
            field = "seniority_years"
            expression = "EXTRACT(YEAR FROM age(e.hire_date))::int"
            synonyms = ["tenure"]
            "#,
        )
        .unwrap();
        let base = RuleTable::builtin();
        let before = base.entries().len();
        let rules = base.with_overlay(overlay);
        assert_eq!(rules.entries().len(), before + 1);
        assert_eq!(rules.resolve("employees", "mail").unwrap().field, "email");
        assert!(rules.resolve("employees", "work_email").is_none());
        assert_eq!(rules.resolve("employees", "tenure").unwrap().field, "seniority_years");
    }

    #[test]
    fn test_overlay_rejects_bad_entries() {
        let both = r#"
            [[rule]]
            table = "employees"
            field = "x"
            column = "e.x"
            expression = "1"
        "#;
        assert!(matches!(
            parse_overlay(both),
            Err(RuleError::AmbiguousSource { .. })
        ));
        let bad_column = r#"
            [[rule]]
            table = "employees"
            field = "x"
            column = "x"
        "#;
        assert!(matches!(
            parse_overlay(bad_column),
            Err(RuleError::BadColumn { .. })
        ));
        assert!(matches!(parse_overlay("rule = 3"), Err(RuleError::Parse(_))));
    }

    #[test]
    fn test_problems_flags_unknown_column() {
        let rules = RuleTable::from_entries(vec![column("employees", "shoe", "e", "shoe_size", &[])]);
        let problems = rules.problems(&SchemaContext::builtin());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("e.shoe_size"));
    }

    #[test]
    fn test_load_without_overlay_is_builtin() {
        let rules = RuleTable::load(None).unwrap();
        assert_eq!(rules.entries().len(), built_in_rules().len());
    }

    #[test]
    fn test_render_mentions_synonyms() {
        let text = RuleTable::builtin().render();
        assert!(text.contains("employees.employee_id := e.id  (also: id, user_id, emp_id)"));
    }
}
