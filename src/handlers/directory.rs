use serde_json::{Map, Value};

use super::{nested, optional_str, require_str, BoundQuery, FixedPlan, FixedPlanBuilder, HandlerMode};
use crate::db::Row;
use crate::error::HandlerError;

/// Flat employee directory with nested manager, department and team objects.
pub struct DirectorySync;

const EMPLOYEE_SELECT: &str = "SELECT e.id AS employee_id, e.full_name AS full_name, e.email AS email, \
e.job_title AS job_title, e.status AS status, e.hire_date AS hire_date, e.company_id AS company_id, \
m.id AS manager_id, m.full_name AS manager_name, m.email AS manager_email, \
d.id AS department_id, d.name AS department_name, \
t.id AS team_id, t.name AS team_name \
FROM employees e \
LEFT JOIN employees m ON m.id = e.manager_id \
LEFT JOIN departments d ON d.id = e.department_id \
LEFT JOIN teams t ON t.id = e.team_id";

impl FixedPlanBuilder for DirectorySync {
    fn name(&self) -> &str {
        "directory-sync"
    }

    fn build(
        &self,
        mode: HandlerMode,
        payload: &Map<String, Value>,
        page_size: usize,
    ) -> Result<FixedPlan, HandlerError> {
        let (data, count) = match mode {
            HandlerMode::OnDemand => {
                let data = BoundQuery {
                    sql: format!("{} WHERE e.id = $1::text::uuid", EMPLOYEE_SELECT),
                    params: vec![Some(require_str(payload, "employee_id")?)],
                };
                (data, None)
            }
            HandlerMode::Batch => {
                let mut filters = vec!["e.company_id = $1::text::uuid".to_string()];
                let mut params = vec![Some(require_str(payload, "company_id")?)];
                if let Some(status) = optional_str(payload, "status")? {
                    params.push(Some(status));
                    filters.push(format!("e.status = ${}::text", params.len()));
                }
                let count = BoundQuery {
                    sql: format!("SELECT COUNT(*) FROM employees e WHERE {}", filters.join(" AND ")),
                    params: params.clone(),
                };
                if let Some(cursor) = optional_str(payload, "cursor")? {
                    params.push(Some(cursor));
                    filters.push(format!("e.id > ${}::text::uuid", params.len()));
                }
                let data = BoundQuery {
                    sql: format!(
                        "{} WHERE {} ORDER BY e.id ASC LIMIT {}",
                        EMPLOYEE_SELECT,
                        filters.join(" AND "),
                        page_size
                    ),
                    params,
                };
                (data, Some(count))
            }
        };

        Ok(FixedPlan {
            data,
            count,
            cursor_column: "employee_id".to_string(),
            entity_key: "employees".to_string(),
        })
    }

    fn assemble(&self, mut row: Row) -> Row {
        let manager = nested(
            &mut row,
            "manager_id",
            &[
                ("employee_id", "manager_id"),
                ("full_name", "manager_name"),
                ("email", "manager_email"),
            ],
        );
        let department = nested(
            &mut row,
            "department_id",
            &[("department_id", "department_id"), ("name", "department_name")],
        );
        let team = nested(&mut row, "team_id", &[("team_id", "team_id"), ("name", "team_name")]);
        row.insert("manager".to_string(), manager);
        row.insert("department".to_string(), department);
        row.insert("team".to_string(), team);
        row
    }
}
