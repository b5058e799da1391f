use anyhow::Result;
use tokio_postgres::Client;

/// A column of a table the core is allowed to read.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    /// PostgreSQL type name usable as a cast target (`uuid`, `text`, `date`, ...).
    pub data_type: String,
    pub is_primary_key: bool,
}

/// A table of the fixed relational schema, with the alias every statement
/// uses for it when it is the root of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub alias: String,
    /// Singular entity name (`employee` for `employees`); `<singular>_id`
    /// payload keys select this table.
    pub singular: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.is_primary_key)
    }
}

/// A one-hop join available from a root table: `LEFT JOIN table alias ON on`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub from_table: String,
    pub alias: String,
    /// Role of the joined row (`manager`, `company`); `<label>_<column>`
    /// template fields are inferred through it.
    pub label: String,
    pub table: String,
    pub on: String,
}

/// The static relational schema queries are grounded in.
#[derive(Debug, Clone, Default)]
pub struct SchemaContext {
    pub tables: Vec<TableDef>,
    pub relationships: Vec<Relationship>,
}

fn col(name: &str, data_type: &str) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        data_type: data_type.to_string(),
        is_primary_key: false,
    }
}

fn pk(name: &str) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        data_type: "uuid".to_string(),
        is_primary_key: true,
    }
}

fn table(name: &str, alias: &str, singular: &str, columns: Vec<ColumnDef>) -> TableDef {
    TableDef {
        name: name.to_string(),
        alias: alias.to_string(),
        singular: singular.to_string(),
        columns,
    }
}

fn rel(from_table: &str, alias: &str, label: &str, table: &str, on: &str) -> Relationship {
    Relationship {
        from_table: from_table.to_string(),
        alias: alias.to_string(),
        label: label.to_string(),
        table: table.to_string(),
        on: on.to_string(),
    }
}

impl SchemaContext {
    /// The HR schema the service reads from.
    pub fn builtin() -> Self {
        let tables = vec![
            table(
                "companies",
                "c",
                "company",
                vec![
                    pk("id"),
                    col("name", "text"),
                    col("industry", "text"),
                    col("created_at", "timestamptz"),
                ],
            ),
            table(
                "departments",
                "d",
                "department",
                vec![
                    pk("id"),
                    col("company_id", "uuid"),
                    col("name", "text"),
                    col("head_employee_id", "uuid"),
                ],
            ),
            table(
                "teams",
                "t",
                "team",
                vec![
                    pk("id"),
                    col("department_id", "uuid"),
                    col("name", "text"),
                    col("lead_employee_id", "uuid"),
                ],
            ),
            table(
                "employees",
                "e",
                "employee",
                vec![
                    pk("id"),
                    col("company_id", "uuid"),
                    col("department_id", "uuid"),
                    col("team_id", "uuid"),
                    col("manager_id", "uuid"),
                    col("full_name", "text"),
                    col("email", "text"),
                    col("job_title", "text"),
                    col("status", "text"),
                    col("hire_date", "date"),
                    col("created_at", "timestamptz"),
                ],
            ),
            table(
                "leave_requests",
                "r",
                "leave_request",
                vec![
                    pk("id"),
                    col("employee_id", "uuid"),
                    col("approver_id", "uuid"),
                    col("start_date", "date"),
                    col("end_date", "date"),
                    col("status", "text"),
                    col("reason", "text"),
                ],
            ),
        ];

        let relationships = vec![
            rel("employees", "c", "company", "companies", "c.id = e.company_id"),
            rel("employees", "d", "department", "departments", "d.id = e.department_id"),
            rel("employees", "t", "team", "teams", "t.id = e.team_id"),
            rel("employees", "m", "manager", "employees", "m.id = e.manager_id"),
            rel("departments", "c", "company", "companies", "c.id = d.company_id"),
            rel("departments", "h", "head", "employees", "h.id = d.head_employee_id"),
            rel("teams", "d", "department", "departments", "d.id = t.department_id"),
            rel("teams", "l", "lead", "employees", "l.id = t.lead_employee_id"),
            rel("leave_requests", "e", "employee", "employees", "e.id = r.employee_id"),
            rel("leave_requests", "a", "approver", "employees", "a.id = r.approver_id"),
        ];

        Self {
            tables,
            relationships,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Resolve an `<entity>_id` payload key to its table.
    pub fn table_for_id_key(&self, key: &str) -> Option<&TableDef> {
        let singular = key.strip_suffix("_id")?;
        self.tables.iter().find(|t| t.singular == singular)
    }

    pub fn relationships_from<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships
            .iter()
            .filter(move |r| r.from_table == table)
    }

    pub fn relationship(&self, from_table: &str, alias: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|r| r.from_table == from_table && r.alias == alias)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Type of `column` as seen from the query rooted at `root`, where
    /// `alias` is either the root alias or a relationship alias.
    pub fn column_type(&self, root: &str, alias: &str, column: &str) -> Option<&str> {
        let root_def = self.table(root)?;
        let table_name = if root_def.alias == alias {
            root
        } else {
            self.relationship(root, alias)?.table.as_str()
        };
        self.table(table_name)?
            .column(column)
            .map(|c| c.data_type.as_str())
    }

    /// Render the schema as prompt/grounding text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for t in &self.tables {
            out.push_str(&format!("TABLE {} (alias {})\n", t.name, t.alias));
            for c in &t.columns {
                let pk = if c.is_primary_key { " PRIMARY KEY" } else { "" };
                out.push_str(&format!("  {} {}{}\n", c.name, c.data_type, pk));
            }
        }
        out.push_str("RELATIONSHIPS\n");
        for r in &self.relationships {
            let root_alias = self
                .table(&r.from_table)
                .map(|t| t.alias.as_str())
                .unwrap_or("?");
            out.push_str(&format!(
                "  {} {} LEFT JOIN {} {} ON {} -- {}\n",
                r.from_table, root_alias, r.table, r.alias, r.on, r.label
            ));
        }
        out
    }

    /// Refresh column types (and pick up new columns) of the known tables
    /// from the live catalog. Returns the number of columns seen.
    pub async fn refresh_column_types(&mut self, client: &Client, schema: &str) -> Result<usize> {
        let names: Vec<String> = self.tables.iter().map(|t| t.name.clone()).collect();
        let rows = client
            .query(
                r#"
                SELECT
                    c.table_name::text as table_name,
                    c.column_name::text as name,
                    c.udt_name::text as data_type,
                    COALESCE(tc.constraint_type = 'PRIMARY KEY', false) as is_primary_key
                FROM information_schema.columns c
                LEFT JOIN information_schema.key_column_usage kcu
                    ON c.table_schema = kcu.table_schema
                    AND c.table_name = kcu.table_name
                    AND c.column_name = kcu.column_name
                LEFT JOIN information_schema.table_constraints tc
                    ON kcu.constraint_name = tc.constraint_name
                    AND kcu.table_schema = tc.table_schema
                    AND tc.constraint_type = 'PRIMARY KEY'
                WHERE c.table_schema::text = $1 AND c.table_name::text = ANY($2::text[])
                ORDER BY c.table_name, c.ordinal_position
                "#,
                &[&schema, &names],
            )
            .await?;

        for row in &rows {
            let table_name: String = row.get("table_name");
            let column = ColumnDef {
                name: row.get("name"),
                data_type: row.get("data_type"),
                is_primary_key: row.get("is_primary_key"),
            };
            if let Some(t) = self.tables.iter_mut().find(|t| t.name == table_name) {
                match t.columns.iter_mut().find(|c| c.name == column.name) {
                    Some(existing) => *existing = column,
                    None => t.columns.push(column),
                }
            }
        }

        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables_have_uuid_primary_keys() {
        let schema = SchemaContext::builtin();
        for t in &schema.tables {
            let pk = t.primary_key().expect("every table has a primary key");
            assert_eq!(pk.name, "id");
            assert_eq!(pk.data_type, "uuid");
        }
    }

    #[test]
    fn test_relationships_reference_known_tables() {
        let schema = SchemaContext::builtin();
        for r in &schema.relationships {
            assert!(schema.table(&r.from_table).is_some(), "{}", r.from_table);
            assert!(schema.table(&r.table).is_some(), "{}", r.table);
        }
    }

    #[test]
    fn test_table_for_id_key() {
        let schema = SchemaContext::builtin();
        assert_eq!(schema.table_for_id_key("employee_id").unwrap().name, "employees");
        assert_eq!(
            schema.table_for_id_key("leave_request_id").unwrap().name,
            "leave_requests"
        );
        assert!(schema.table_for_id_key("employee").is_none());
        assert!(schema.table_for_id_key("invoice_id").is_none());
    }

    #[test]
    fn test_column_type_through_relationship() {
        let schema = SchemaContext::builtin();
        assert_eq!(schema.column_type("employees", "e", "hire_date"), Some("date"));
        assert_eq!(schema.column_type("employees", "c", "industry"), Some("text"));
        assert_eq!(schema.column_type("employees", "m", "email"), Some("text"));
        assert_eq!(schema.column_type("employees", "x", "email"), None);
        assert_eq!(schema.column_type("employees", "e", "missing"), None);
    }

    #[test]
    fn test_render_lists_tables_and_joins() {
        let text = SchemaContext::builtin().render();
        assert!(text.contains("TABLE employees (alias e)"));
        assert!(text.contains("  id uuid PRIMARY KEY"));
        assert!(text.contains("employees e LEFT JOIN companies c ON c.id = e.company_id"));
    }

    #[test]
    fn test_relationships_from() {
        let schema = SchemaContext::builtin();
        let aliases: Vec<&str> = schema
            .relationships_from("employees")
            .map(|r| r.alias.as_str())
            .collect();
        assert_eq!(aliases, vec!["c", "d", "t", "m"]);
        assert_eq!(schema.relationships_from("companies").count(), 0);
    }
}
