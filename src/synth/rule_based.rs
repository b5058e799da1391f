//! Deterministic synthesizer: resolves template fields through the rule
//! table and the schema, then builds the statement through the SQL AST.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::{SqlPlan, SynthesisMode, SynthesisRequest, Synthesizer, CURSOR_KEY};
use crate::ast::{
    compile, BinaryOperator, Expression, Join, JoinType, Literal, OrderByExpr, SelectItem,
    SelectQuery, TableRef,
};
use crate::db::{SchemaContext, TableDef};
use crate::error::SynthesisError;
use crate::rules::{RuleSource, RuleTable};
use crate::template::Template;

/// Payload keys with transport meaning; never turned into filters.
const RESERVED_KEYS: &[&str] = &["type", "action", "cursor", "page_size"];

/// Tenant key: filters rows, never picks the entity.
const TENANT_KEY: &str = "company_id";

#[derive(Debug, Clone)]
pub struct RuleBasedSynthesizer {
    default_root: String,
}

impl Default for RuleBasedSynthesizer {
    fn default() -> Self {
        Self {
            default_root: "employees".to_string(),
        }
    }
}

impl RuleBasedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, request: &SynthesisRequest<'_>) -> Result<SqlPlan, SynthesisError> {
        let template = request.template;
        if template.is_null() {
            return Err(SynthesisError::InvalidTemplate);
        }

        let paginated = !matches!(request.mode, SynthesisMode::Point);
        let (root, shape) = self.entity(request, paginated)?;
        let mut builder = Builder::new(request.schema, request.rules, root);
        builder.filter_payload(request.payload);

        let cursor_column = match &request.mode {
            SynthesisMode::Count => {
                builder.query.projections = vec![SelectItem::Expression {
                    expr: Expression::count_star(),
                    alias: None,
                }];
                None
            }
            SynthesisMode::Batch { cursor, page_size } => {
                builder.project_shape(shape);
                let cursor_alias = builder.project_primary_key()?;
                if cursor.is_some() {
                    builder.cursor_bound()?;
                }
                builder.order_by_primary_key()?;
                builder.query.limit = Some(*page_size as u64);
                Some(cursor_alias)
            }
            SynthesisMode::Point => {
                builder.project_shape(shape);
                if builder.query.projections.is_empty() {
                    return Err(SynthesisError::NothingToSelect(root.name.clone()));
                }
                builder.order_by_primary_key()?;
                let single = matches!(template, Template::Object(_))
                    && template.array_fields().next().is_none();
                builder.query.limit = Some(if single { 1 } else { request.max_rows as u64 });
                None
            }
        };

        let sql = compile(&builder.query);
        tracing::debug!(
            requester = request.requester,
            mode = request.mode.label(),
            entity = %root.name,
            %sql,
            "synthesized"
        );
        Ok(SqlPlan {
            sql,
            param_order: builder.params,
            cursor_column,
            entity: Some(root.name.clone()),
        })
    }

    /// Root table and the row shape projected from it.
    fn entity<'r>(
        &self,
        request: &SynthesisRequest<'r>,
        paginated: bool,
    ) -> Result<(&'r TableDef, Option<&'r Template>), SynthesisError> {
        let schema = request.schema;
        let template = request.template;

        if paginated {
            let mut arrays = template.array_fields();
            if let Some((name, field)) = template.array_fields().find(|(n, _)| schema.table(n).is_some()) {
                let root = schema
                    .table(name)
                    .ok_or_else(|| SynthesisError::NothingToSelect(name.to_string()))?;
                return Ok((root, field.shape()));
            }
            if let Some((_, field)) = arrays.next() {
                let shape = field.shape();
                return Ok((self.choose_root(request, shape)?, shape));
            }
        }

        let shape = match template {
            Template::Array(_) => template.shape(),
            _ => Some(template),
        };
        Ok((self.choose_root(request, shape)?, shape))
    }

    /// An explicit `<entity>_id` in the payload wins; otherwise the table
    /// that resolves most of the shape's fields.
    fn choose_root<'r>(
        &self,
        request: &SynthesisRequest<'r>,
        shape: Option<&Template>,
    ) -> Result<&'r TableDef, SynthesisError> {
        let schema = request.schema;
        for (key, value) in request.payload {
            if key == TENANT_KEY || !is_bindable(value) {
                continue;
            }
            if let Some(table) = schema.table_for_id_key(key) {
                return Ok(table);
            }
        }

        let default = schema
            .table(&self.default_root)
            .ok_or_else(|| SynthesisError::NothingToSelect(self.default_root.clone()))?;
        let Some(shape) = shape else {
            return Ok(default);
        };

        let mut best = (score(schema, request.rules, default, shape), default);
        for table in &schema.tables {
            let s = score(schema, request.rules, table, shape);
            if s > best.0 {
                best = (s, table);
            }
        }
        Ok(best.1)
    }
}

#[async_trait]
impl Synthesizer for RuleBasedSynthesizer {
    fn name(&self) -> &str {
        "rules"
    }

    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<SqlPlan, SynthesisError> {
        self.plan(request)
    }
}

fn is_bindable(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Number of leaf fields of `shape` that resolve on `table`.
fn score(schema: &SchemaContext, rules: &RuleTable, table: &TableDef, shape: &Template) -> usize {
    let Some(fields) = shape.fields() else {
        return 0;
    };
    fields
        .iter()
        .map(|(name, t)| match t {
            Template::Object(_) => score(schema, rules, table, t),
            _ => {
                let hit = rules.resolve(&table.name, name).is_some()
                    || table.column(name).is_some()
                    || related_column(schema, table, name).is_some();
                usize::from(hit)
            }
        })
        .sum()
}

/// `<label>_<column>` on a directly related table, e.g. `manager_email`.
fn related_column<'s>(
    schema: &'s SchemaContext,
    root: &'s TableDef,
    name: &str,
) -> Option<(&'s str, &'s str)> {
    schema.relationships_from(&root.name).find_map(|rel| {
        let rest = name.strip_prefix(rel.label.as_str())?.strip_prefix('_')?;
        let column = schema.table(&rel.table)?.column(rest)?;
        Some((rel.alias.as_str(), column.name.as_str()))
    })
}

struct Builder<'a> {
    schema: &'a SchemaContext,
    rules: &'a RuleTable,
    root: &'a TableDef,
    query: SelectQuery,
    aliases: HashSet<String>,
    joined: Vec<String>,
    params: Vec<String>,
}

impl<'a> Builder<'a> {
    fn new(schema: &'a SchemaContext, rules: &'a RuleTable, root: &'a TableDef) -> Self {
        Self {
            schema,
            rules,
            root,
            query: SelectQuery {
                from: Some(TableRef::aliased(&root.name, &root.alias)),
                ..Default::default()
            },
            aliases: HashSet::new(),
            joined: Vec::new(),
            params: Vec::new(),
        }
    }

    fn param(&mut self, key: &str) -> usize {
        match self.params.iter().position(|p| p == key) {
            Some(i) => i + 1,
            None => {
                self.params.push(key.to_string());
                self.params.len()
            }
        }
    }

    fn join(&mut self, alias: &str) -> bool {
        if alias == self.root.alias || self.joined.iter().any(|j| j == alias) {
            return true;
        }
        let Some(rel) = self.schema.relationship(&self.root.name, alias) else {
            return false;
        };
        self.joined.push(alias.to_string());
        self.query.joins.push(Join {
            join_type: JoinType::Left,
            table: TableRef::aliased(&rel.table, &rel.alias),
            condition: Some(Expression::Raw(rel.on.clone())),
        });
        true
    }

    fn project(&mut self, expr: Expression, alias: &str) {
        if self.aliases.insert(alias.to_string()) {
            self.query.projections.push(SelectItem::Expression {
                expr,
                alias: Some(alias.to_string()),
            });
        }
    }

    fn project_shape(&mut self, shape: Option<&Template>) {
        match shape.and_then(Template::fields) {
            Some(fields) => self.project_fields(fields),
            None => {
                let root = self.root;
                for c in &root.columns {
                    self.project(Expression::column(&root.alias, &c.name), &c.name);
                }
            }
        }
    }

    fn project_fields(&mut self, fields: &[(String, Template)]) {
        for (name, t) in fields {
            let resolved = match t {
                Template::Scalar(_) => self.project_rule(name, false) || self.project_inferred(name),
                Template::Array(_) => self.project_rule(name, true),
                Template::Object(sub) => {
                    let related = self.project_related_object(name, sub);
                    // The mapper falls back to the same row for nested objects.
                    self.project_fields(sub);
                    related
                }
            };
            if !resolved {
                tracing::debug!(field = %name, entity = %self.root.name, "field left at its default");
            }
        }
    }

    /// Project the canonical rule for `name`; array fields only take
    /// aggregate derivations.
    fn project_rule(&mut self, name: &str, aggregate_only: bool) -> bool {
        let rules = self.rules;
        let Some(entry) = rules.resolve(&self.root.name, name) else {
            return false;
        };
        if aggregate_only && !entry.is_aggregate() {
            return false;
        }
        match &entry.source {
            RuleSource::Column { alias, column } => {
                if !self.join(alias) {
                    return false;
                }
                self.project(Expression::column(alias, column), &entry.field);
            }
            RuleSource::Derived { sql, joins } => {
                if !joins.iter().all(|j| self.join(j)) {
                    return false;
                }
                self.project(Expression::Raw(sql.clone()), &entry.field);
            }
        }
        true
    }

    /// Exact root column, or `<label>_<column>` on a related table.
    fn project_inferred(&mut self, name: &str) -> bool {
        let root = self.root;
        if root.column(name).is_some() {
            self.project(Expression::column(&root.alias, name), name);
            return true;
        }
        let schema = self.schema;
        match related_column(schema, root, name) {
            Some((alias, column)) => {
                self.join(alias);
                self.project(Expression::column(alias, column), name);
                true
            }
            None => false,
        }
    }

    /// A nested object keyed by a relationship label (`manager`, `company`)
    /// becomes one JSON object built from the related row.
    fn project_related_object(&mut self, name: &str, fields: &[(String, Template)]) -> bool {
        let schema = self.schema;
        let rules = self.rules;
        let Some(rel) = schema
            .relationships_from(&self.root.name)
            .find(|r| r.label == name)
        else {
            return false;
        };
        let Some(target) = schema.table(&rel.table) else {
            return false;
        };

        let mut args = Vec::new();
        let mut seen = HashSet::new();
        for (field, t) in fields {
            if !matches!(t, Template::Scalar(_)) {
                continue;
            }
            let resolved = match rules.resolve(&target.name, field).map(|e| (&e.field, &e.source)) {
                Some((canonical, RuleSource::Column { alias, column })) if *alias == target.alias => {
                    Some((canonical.as_str(), column.as_str()))
                }
                _ => target.column(field).map(|c| (c.name.as_str(), c.name.as_str())),
            };
            if let Some((key, column)) = resolved {
                if seen.insert(key) {
                    args.push(Expression::Literal(Literal::String(key.to_string())));
                    args.push(Expression::column(&rel.alias, column));
                }
            }
        }
        if args.is_empty() || !self.join(&rel.alias) {
            return false;
        }
        self.project(
            Expression::Function {
                name: "json_build_object".to_string(),
                args,
            },
            &rel.label,
        );
        true
    }

    fn filter_payload(&mut self, payload: &Map<String, Value>) {
        for (key, value) in payload {
            if RESERVED_KEYS.contains(&key.as_str()) || !is_bindable(value) {
                continue;
            }
            let Some(column) = self.filter_column(key) else {
                tracing::debug!(key = %key, entity = %self.root.name, "payload key is not a filter");
                continue;
            };
            let root = self.root;
            let cast = root.column(column).map(|c| c.data_type.as_str());
            let index = self.param(key);
            self.query.filter.push(
                Expression::column(&root.alias, column)
                    .binary(BinaryOperator::Eq, Expression::param(index, cast)),
            );
        }
    }

    /// Only columns of the root table filter, so the count query needs no joins.
    fn filter_column(&self, key: &str) -> Option<&'a str> {
        let root = self.root;
        if let Some(entry) = self.rules.resolve(&root.name, key) {
            if let RuleSource::Column { alias, column } = &entry.source {
                if *alias == root.alias && root.column(column).is_some() {
                    return Some(column.as_str());
                }
            }
        }
        root.column(key).map(|c| c.name.as_str())
    }

    fn primary_key(&self) -> Result<&'a str, SynthesisError> {
        self.root
            .primary_key()
            .map(|c| c.name.as_str())
            .ok_or_else(|| SynthesisError::NothingToSelect(self.root.name.clone()))
    }

    /// Always project the key the cursor is read from; returns its alias.
    fn project_primary_key(&mut self) -> Result<String, SynthesisError> {
        let root = self.root;
        let pk = self.primary_key()?;
        let id_field = format!("{}_id", root.singular);
        let alias = match self.rules.resolve(&root.name, &id_field).map(|e| (&e.field, &e.source)) {
            Some((field, RuleSource::Column { alias, column })) if *alias == root.alias && column == pk => {
                field.clone()
            }
            _ => pk.to_string(),
        };
        self.project(Expression::column(&root.alias, pk), &alias);
        Ok(alias)
    }

    fn cursor_bound(&mut self) -> Result<(), SynthesisError> {
        let root = self.root;
        let pk = self.primary_key()?;
        let cast = root.column(pk).map(|c| c.data_type.as_str());
        let index = self.param(CURSOR_KEY);
        self.query.filter.push(
            Expression::column(&root.alias, pk).binary(BinaryOperator::Gt, Expression::param(index, cast)),
        );
        Ok(())
    }

    fn order_by_primary_key(&mut self) -> Result<(), SynthesisError> {
        let pk = self.primary_key()?;
        self.query.order_by = vec![OrderByExpr {
            expr: Expression::column(&self.root.alias, pk),
            asc: Some(true),
        }];
        Ok(())
    }
}
