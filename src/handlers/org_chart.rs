use serde_json::{Map, Value};

use super::{nested, optional_str, require_str, BoundQuery, FixedPlan, FixedPlanBuilder, HandlerMode};
use crate::db::Row;
use crate::error::HandlerError;

/// Department → team → member hierarchy, one department per row.
pub struct OrgChart;

const DEPARTMENT_SELECT: &str = "SELECT d.id AS department_id, d.name AS department_name, \
d.company_id AS company_id, h.id AS head_id, h.full_name AS head_name, h.email AS head_email, \
(SELECT COALESCE(json_agg(json_build_object(\
'team_id', t.id, \
'team_name', t.name, \
'lead', CASE WHEN l.id IS NULL THEN NULL ELSE json_build_object('employee_id', l.id, 'full_name', l.full_name) END, \
'members', (SELECT COALESCE(json_agg(json_build_object('employee_id', m.id, 'full_name', m.full_name, \
'email', m.email, 'job_title', m.job_title) ORDER BY m.full_name), '[]'::json) \
FROM employees m WHERE m.team_id = t.id)\
) ORDER BY t.name), '[]'::json) \
FROM teams t LEFT JOIN employees l ON l.id = t.lead_employee_id WHERE t.department_id = d.id) AS teams \
FROM departments d LEFT JOIN employees h ON h.id = d.head_employee_id";

impl FixedPlanBuilder for OrgChart {
    fn name(&self) -> &str {
        "org-chart"
    }

    fn build(
        &self,
        mode: HandlerMode,
        payload: &Map<String, Value>,
        page_size: usize,
    ) -> Result<FixedPlan, HandlerError> {
        let data = match mode {
            HandlerMode::OnDemand => BoundQuery {
                sql: format!("{} WHERE d.id = $1::text::uuid", DEPARTMENT_SELECT),
                params: vec![Some(require_str(payload, "department_id")?)],
            },
            HandlerMode::Batch => {
                let company_id = require_str(payload, "company_id")?;
                match optional_str(payload, "cursor")? {
                    Some(cursor) => BoundQuery {
                        sql: format!(
                            "{} WHERE d.company_id = $1::text::uuid AND d.id > $2::text::uuid \
                             ORDER BY d.id ASC LIMIT {}",
                            DEPARTMENT_SELECT, page_size
                        ),
                        params: vec![Some(company_id), Some(cursor)],
                    },
                    None => BoundQuery {
                        sql: format!(
                            "{} WHERE d.company_id = $1::text::uuid ORDER BY d.id ASC LIMIT {}",
                            DEPARTMENT_SELECT, page_size
                        ),
                        params: vec![Some(company_id)],
                    },
                }
            }
        };

        let count = match mode {
            HandlerMode::OnDemand => None,
            HandlerMode::Batch => Some(BoundQuery {
                sql: "SELECT COUNT(*) FROM departments d WHERE d.company_id = $1::text::uuid".to_string(),
                params: vec![Some(require_str(payload, "company_id")?)],
            }),
        };

        Ok(FixedPlan {
            data,
            count,
            cursor_column: "department_id".to_string(),
            entity_key: "departments".to_string(),
        })
    }

    fn assemble(&self, mut row: Row) -> Row {
        let head = nested(
            &mut row,
            "head_id",
            &[("employee_id", "head_id"), ("full_name", "head_name"), ("email", "head_email")],
        );
        row.remove("head_id");
        row.insert("head".to_string(), head);

        let mut employee_count = 0;
        let teams = match row.remove("teams") {
            Some(Value::Array(teams)) => teams
                .into_iter()
                .map(|mut team| {
                    if let Value::Object(t) = &mut team {
                        let members = t.get("members").and_then(Value::as_array).map_or(0, Vec::len);
                        employee_count += members;
                        t.insert("member_count".to_string(), Value::from(members));
                    }
                    team
                })
                .collect(),
            _ => Vec::new(),
        };
        row.insert("team_count".to_string(), Value::from(teams.len()));
        row.insert("employee_count".to_string(), Value::from(employee_count));
        row.insert("teams".to_string(), Value::Array(teams));
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SchemaContext;
    use crate::guard::SafetyGate;
    use serde_json::json;

    fn payload(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_on_demand_plan() {
        let plan = OrgChart
            .build(HandlerMode::OnDemand, &payload(json!({"department_id": "d1"})), 1000)
            .unwrap();
        assert!(plan.data.sql.ends_with("WHERE d.id = $1::text::uuid"));
        assert_eq!(plan.data.params, vec![Some("d1".to_string())]);
        assert!(plan.count.is_none());
        assert!(SafetyGate::for_schema(&SchemaContext::builtin()).validate(&plan.data.sql));
    }

    #[test]
    fn test_batch_plans_pass_gate() {
        let gate = SafetyGate::for_schema(&SchemaContext::builtin());
        for cursor in [Value::Null, json!("d5")] {
            let plan = OrgChart
                .build(
                    HandlerMode::Batch,
                    &payload(json!({"type": "batch", "company_id": "c1", "cursor": cursor})),
                    25,
                )
                .unwrap();
            assert!(plan.data.sql.ends_with("ORDER BY d.id ASC LIMIT 25"));
            gate.inspect(&plan.data.sql).unwrap();
            gate.inspect(&plan.count.as_ref().unwrap().sql).unwrap();
            assert_eq!(plan.entity_key, "departments");
        }
    }

    #[test]
    fn test_batch_cursor_bound() {
        let plan = OrgChart
            .build(
                HandlerMode::Batch,
                &payload(json!({"company_id": "c1", "cursor": "d5"})),
                25,
            )
            .unwrap();
        assert!(plan.data.sql.contains("AND d.id > $2::text::uuid"));
        assert_eq!(plan.data.params, vec![Some("c1".into()), Some("d5".into())]);
        assert_eq!(plan.count.unwrap().params, vec![Some("c1".into())]);
    }

    #[test]
    fn test_missing_ids() {
        assert!(matches!(
            OrgChart.build(HandlerMode::OnDemand, &payload(json!({})), 10),
            Err(HandlerError::MissingField("department_id"))
        ));
        assert!(matches!(
            OrgChart.build(HandlerMode::Batch, &payload(json!({"type": "batch"})), 10),
            Err(HandlerError::MissingField("company_id"))
        ));
    }

    #[test]
    fn test_assemble_hierarchy() {
        let row = payload(json!({
            "department_id": "d1",
            "department_name": "Eng",
            "head_id": "e1",
            "head_name": "Ann",
            "head_email": "ann@x",
            "teams": [
                {"team_id": "t1", "team_name": "Core", "lead": null, "members": [{"employee_id": "e2"}, {"employee_id": "e3"}]},
                {"team_id": "t2", "team_name": "Web", "lead": null, "members": []}
            ]
        }));
        let out = OrgChart.assemble(row);
        assert_eq!(out["head"], json!({"employee_id": "e1", "full_name": "Ann", "email": "ann@x"}));
        assert!(!out.contains_key("head_name"));
        assert_eq!(out["team_count"], json!(2));
        assert_eq!(out["employee_count"], json!(2));
        assert_eq!(out["teams"][0]["member_count"], json!(2));
        assert_eq!(out["teams"][1]["member_count"], json!(0));
    }

    #[test]
    fn test_assemble_without_head() {
        let out = OrgChart.assemble(payload(json!({"department_id": "d1", "head_id": null, "teams": []})));
        assert_eq!(out["head"], Value::Null);
        assert_eq!(out["team_count"], json!(0));
    }
}
