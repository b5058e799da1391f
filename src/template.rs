//! Caller-declared response shapes.
//!
//! A template is whatever JSON the caller put in `response`. Objects keep
//! their key order; the first element of an array is the shape every row is
//! mapped through.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    /// A leaf; the value doubles as the default when no data is found.
    Scalar(Value),
    /// Ordered field list.
    Object(Vec<(String, Template)>),
    /// Every element as given by the caller; the first one is the row shape.
    Array(Vec<Template>),
}

impl Template {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(fields) => Template::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Template::from_value(v)))
                    .collect(),
            ),
            Value::Array(items) => Template::Array(items.iter().map(Template::from_value).collect()),
            other => Template::Scalar(other.clone()),
        }
    }

    /// The template as JSON, exactly as the caller sent it.
    pub fn to_value(&self) -> Value {
        match self {
            Template::Scalar(v) => v.clone(),
            Template::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (name, t) in fields {
                    out.insert(name.clone(), t.to_value());
                }
                Value::Object(out)
            }
            Template::Array(items) => Value::Array(items.iter().map(Template::to_value).collect()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Template::Scalar(Value::Null))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Template::Array(_))
    }

    pub fn fields(&self) -> Option<&[(String, Template)]> {
        match self {
            Template::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Template> {
        self.fields()?
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, t)| t)
    }

    /// Row shape of an array template.
    pub fn shape(&self) -> Option<&Template> {
        match self {
            Template::Array(items) => items.first(),
            _ => None,
        }
    }

    /// Array-typed fields of an object template, in declaration order.
    pub fn array_fields(&self) -> impl Iterator<Item = (&str, &Template)> {
        self.fields()
            .unwrap_or(&[])
            .iter()
            .filter(|(_, t)| t.is_array())
            .map(|(k, t)| (k.as_str(), t))
    }
}

impl From<&Value> for Template {
    fn from(value: &Value) -> Self {
        Template::from_value(value)
    }
}
