//! Folds result rows back into the caller's template.
//!
//! The mapper never adds or removes keys of an object template: every key
//! gets either a value found in the rows or the template's own default.

use serde_json::{Map, Value};

use crate::db::Row;
use crate::rules::RuleTable;
use crate::template::Template;

pub struct Mapper<'a> {
    rules: &'a RuleTable,
}

impl<'a> Mapper<'a> {
    pub fn new(rules: &'a RuleTable) -> Self {
        Self { rules }
    }

    pub fn map(&self, rows: &[Row], template: &Template) -> Value {
        match template {
            Template::Scalar(Value::Null) => Value::Object(Map::new()),
            Template::Array(items) => self.map_each(rows, items.first()),
            Template::Object(fields) => match rows {
                [] => template.to_value(),
                [row] => self.map_row(row, fields),
                [first, ..] => self.map_many(first, rows, fields),
            },
            Template::Scalar(default) => rows
                .first()
                .and_then(only_value)
                .unwrap_or_else(|| default.clone()),
        }
    }

    /// One element per row, each mapped through `shape`.
    pub fn map_each(&self, rows: &[Row], shape: Option<&Template>) -> Value {
        Value::Array(rows.iter().map(|row| self.map_element(row, shape)).collect())
    }

    fn map_element(&self, row: &Row, shape: Option<&Template>) -> Value {
        match shape {
            None => Value::Object(row.clone()),
            Some(Template::Object(fields)) => self.map_row(row, fields),
            Some(Template::Array(items)) => self.map_each(std::slice::from_ref(row), items.first()),
            Some(Template::Scalar(default)) => only_value(row).unwrap_or_else(|| default.clone()),
        }
    }

    fn map_row(&self, row: &Row, fields: &[(String, Template)]) -> Value {
        let mut out = Map::with_capacity(fields.len());
        for (name, template) in fields {
            out.insert(name.clone(), self.fill_field(row, name, template));
        }
        Value::Object(out)
    }

    fn map_many(&self, first: &Row, rows: &[Row], fields: &[(String, Template)]) -> Value {
        if !fields.iter().any(|(_, t)| t.is_array()) {
            return self.map_row(first, fields);
        }
        let mut out = Map::with_capacity(fields.len());
        for (name, template) in fields {
            let value = match template {
                Template::Array(items) => self.map_each(rows, items.first()),
                _ => self.fill_field(first, name, template),
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }

    fn fill_field(&self, row: &Row, name: &str, template: &Template) -> Value {
        if let Some(found) = self.lookup(row, name) {
            match (template, found) {
                (Template::Array(items), Value::Array(elements)) => {
                    return self.map_values(elements, items.first());
                }
                (Template::Object(fields), Value::Object(obj)) => return self.map_row(obj, fields),
                (Template::Scalar(_), value) if is_leaf(value) => return value.clone(),
                // Kind mismatch: a container never lands in a scalar slot, and
                // a scalar where a container was declared keeps looking.
                _ => {}
            }
        }
        match template {
            Template::Object(fields) => self.map_row(row, fields),
            Template::Array(_) => Value::Array(Vec::new()),
            Template::Scalar(default) => default.clone(),
        }
    }

    /// Map the elements of a JSON array value (e.g. a `json_agg` column).
    fn map_values(&self, elements: &[Value], shape: Option<&Template>) -> Value {
        let Some(shape) = shape else {
            return Value::Array(elements.to_vec());
        };
        let mapped = elements
            .iter()
            .map(|element| match (shape, element) {
                (Template::Object(fields), Value::Object(obj)) => self.map_row(obj, fields),
                (Template::Array(items), Value::Array(inner)) => self.map_values(inner, items.first()),
                (Template::Scalar(_), v) if !v.is_null() && is_leaf(v) => v.clone(),
                _ => shape.to_value(),
            })
            .collect();
        Value::Array(mapped)
    }

    /// Direct column first, then a canonical name the field is a synonym of.
    /// NULL counts as not found.
    fn lookup<'r>(&self, row: &'r Row, name: &str) -> Option<&'r Value> {
        if let Some(v) = row.get(name).filter(|v| !v.is_null()) {
            return Some(v);
        }
        self.rules
            .canonical_names(name)
            .find_map(|canonical| row.get(canonical).filter(|v| !v.is_null()))
    }
}

fn only_value(row: &Row) -> Option<Value> {
    if row.len() != 1 {
        return None;
    }
    row.values().next().filter(|v| !v.is_null() && is_leaf(v)).cloned()
}

fn is_leaf(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn map(rows: &[Row], template: Value) -> Value {
        let rules = RuleTable::builtin();
        Mapper::new(&rules).map(rows, &Template::from_value(&template))
    }

    /// Same keys as the template, containers only where it declares them,
    /// array elements in the declared element shape.
    fn same_shape(out: &Value, template: &Value) -> bool {
        match (out, template) {
            (Value::Object(x), Value::Object(y)) => {
                x.keys().eq(y.keys()) && x.iter().all(|(k, v)| same_shape(v, &y[k]))
            }
            (Value::Array(xs), Value::Array(ys)) => match ys.first() {
                Some(shape) => xs.iter().all(|x| same_shape(x, shape)),
                None => true,
            },
            (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => false,
            _ => true,
        }
    }

    #[test]
    fn test_no_rows_returns_object_template() {
        let t = json!({"name": "", "manager": {"name": "", "email": null}, "reports": [{"id": ""}]});
        assert_eq!(map(&[], t.clone()), t);
    }

    #[test]
    fn test_no_rows_array_template_is_empty() {
        assert_eq!(map(&[], json!([{"id": ""}])), json!([]));
        assert_eq!(map(&[], json!([])), json!([]));
    }

    #[test]
    fn test_null_template_short_circuits() {
        assert_eq!(map(&[row(json!({"a": 1}))], Value::Null), json!({}));
        assert_eq!(map(&[], Value::Null), json!({}));
    }

    #[test]
    fn test_single_row_direct_and_synonym() {
        let rows = [row(json!({"employee_id": "u1", "full_name": "Ann", "email": null}))];
        let out = map(&rows, json!({"user_id": "", "name": "", "email": "n/a", "age": 0}));
        assert_eq!(out, json!({"user_id": "u1", "name": "Ann", "email": "n/a", "age": 0}));
    }

    #[test]
    fn test_single_row_nested_object_and_array_default() {
        let rows = [row(json!({"full_name": "Ann", "manager_name": "Bo"}))];
        let out = map(&rows, json!({"profile": {"full_name": "", "manager_name": ""}, "reports": [{"x": 1}]}));
        assert_eq!(out, json!({"profile": {"full_name": "Ann", "manager_name": "Bo"}, "reports": []}));
    }

    #[test]
    fn test_json_array_column_is_mapped_through_shape() {
        let rows = [row(json!({
            "full_name": "Ann",
            "direct_reports": [
                {"employee_id": "u2", "full_name": "Cy", "email": "cy@x"},
                {"employee_id": "u3", "full_name": "Di", "email": null}
            ]
        }))];
        let out = map(&rows, json!({"name": "", "reports": [{"name": "", "email": "-"}]}));
        assert_eq!(
            out,
            json!({"name": "Ann", "reports": [{"name": "Cy", "email": "cy@x"}, {"name": "Di", "email": "-"}]})
        );
    }

    #[test]
    fn test_json_object_column_is_mapped_through_template() {
        let rows = [row(json!({"manager": {"full_name": "Bo", "email": "bo@x", "extra": 1}}))];
        let out = map(&rows, json!({"manager": {"full_name": "", "phone": ""}}));
        assert_eq!(out, json!({"manager": {"full_name": "Bo", "phone": ""}}));
    }

    #[test]
    fn test_scalar_where_object_declared_recurses_with_row() {
        let rows = [row(json!({"manager": "Bo", "manager_email": "bo@x"}))];
        let out = map(&rows, json!({"manager": {"manager_email": ""}}));
        assert_eq!(out, json!({"manager": {"manager_email": "bo@x"}}));
    }

    #[test]
    fn test_many_rows_fill_array_fields() {
        let rows = [
            row(json!({"department": "Eng", "full_name": "Ann"})),
            row(json!({"department": "Eng", "full_name": "Bo"})),
        ];
        let out = map(&rows, json!({"department": "", "members": [{"full_name": ""}]}));
        assert_eq!(
            out,
            json!({"department": "Eng", "members": [{"full_name": "Ann"}, {"full_name": "Bo"}]})
        );
    }

    #[test]
    fn test_many_rows_without_array_fields_use_first() {
        let rows = [row(json!({"full_name": "Ann"})), row(json!({"full_name": "Bo"}))];
        assert_eq!(map(&rows, json!({"full_name": ""})), json!({"full_name": "Ann"}));
    }

    #[test]
    fn test_array_template_without_shape_returns_rows() {
        let rows = [row(json!({"a": 1})), row(json!({"a": 2}))];
        assert_eq!(map(&rows, json!([])), json!([{"a": 1}, {"a": 2}]));
    }

    #[test]
    fn test_array_template_maps_each_row() {
        let rows = [row(json!({"full_name": "Ann", "x": 1})), row(json!({"email": "b@x"}))];
        assert_eq!(
            map(&rows, json!([{"name": "", "email": ""}])),
            json!([{"name": "Ann", "email": ""}, {"name": "", "email": "b@x"}])
        );
    }

    #[test]
    fn test_shape_preserved_at_every_level() {
        let template = json!({
            "a": "",
            "b": {"c": 0, "d": {"e": null, "f": [{"g": ""}]}},
            "h": [{"i": {"j": ""}}]
        });
        let row_sets = [
            vec![],
            vec![row(json!({"a": "x", "c": 5, "e": "y", "j": "z"}))],
            vec![row(json!({"a": "x", "b": "flat", "f": [{"g": "1", "junk": 2}, 3]})), row(json!({"j": "k"}))],
            vec![row(json!({"unrelated": true}))],
            vec![row(json!({"a": {"nested": 1}, "c": [1, 2], "e": {"x": 1}, "j": ["z"]}))],
        ];
        for rows in &row_sets {
            let out = map(rows, template.clone());
            assert!(same_shape(&out, &template), "{out}");
        }
    }

    #[test]
    fn test_container_never_fills_scalar_slot() {
        let rows = [row(json!({
            "full_name": "Ann",
            "manager": {"full_name": "Bo", "email": "bo@x"},
            "direct_reports": [{"full_name": "Cy"}]
        }))];
        let out = map(&rows, json!({"full_name": "", "manager": "", "reports": "none"}));
        assert_eq!(out, json!({"full_name": "Ann", "manager": "", "reports": "none"}));

        assert_eq!(map(&[row(json!({"manager": {"a": 1}}))], json!(0)), json!(0));
        let listed = [row(json!({"tags": [["x"], {"y": 1}, "z"]}))];
        assert_eq!(map(&listed, json!({"tags": [""]})), json!({"tags": ["", "", "z"]}));
    }

    #[test]
    fn test_scalar_template_takes_single_column() {
        assert_eq!(map(&[row(json!({"count": 4}))], json!(0)), json!(4));
        assert_eq!(map(&[row(json!({"a": 1, "b": 2}))], json!(0)), json!(0));
        assert_eq!(map(&[], json!("none")), json!("none"));
    }
}
