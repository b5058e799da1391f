use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Row;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// The `pagination` block of a batch response. The cursor is the whole
/// state: there is no server-side session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total_records: u64,
    pub returned_records: u64,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl Pagination {
    /// `cursor` is the one the page was requested with. `total` is the
    /// separately counted total; `None` when the count query failed, in
    /// which case the page length stands in for it.
    ///
    /// The count ignores the cursor, so it only settles completion on the
    /// first page.
    pub fn compute(
        page_size: usize,
        cursor: Option<&str>,
        rows: &[Row],
        cursor_column: Option<&str>,
        total: Option<u64>,
    ) -> Self {
        let returned = rows.len() as u64;
        let last_cursor = rows.last().and_then(|row| cursor_of(row, cursor_column));
        let counted_out = cursor.is_none() && total.is_some_and(|t| returned >= t);
        let has_more = !counted_out && rows.len() == page_size && last_cursor.is_some();
        Self {
            total_records: total.unwrap_or(returned),
            returned_records: returned,
            next_cursor: if has_more { last_cursor } else { None },
            has_more,
        }
    }

    /// Block sent with a degraded batch response.
    pub fn terminal() -> Self {
        Self {
            total_records: 0,
            returned_records: 0,
            next_cursor: None,
            has_more: false,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Cursor value of a row: the named column, else the first UUID-valued column.
pub fn cursor_of(row: &Row, column: Option<&str>) -> Option<String> {
    if let Some(value) = column.and_then(|c| row.get(c)) {
        return match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
    }
    row.values().find_map(|v| match v {
        Value::String(s) if Uuid::parse_str(s).is_ok() => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn rows(ids: &[&str]) -> Vec<Row> {
        ids.iter()
            .map(|id| json!({"employee_id": id, "name": "x"}).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_full_page_has_more() {
        let p = Pagination::compute(2, None, &rows(&["a", "b"]), Some("employee_id"), Some(3));
        assert_eq!(
            p,
            Pagination {
                total_records: 3,
                returned_records: 2,
                next_cursor: Some("b".into()),
                has_more: true
            }
        );
    }

    #[test]
    fn test_first_page_holding_the_whole_count_is_terminal() {
        let p = Pagination::compute(2, None, &rows(&["a", "b"]), Some("employee_id"), Some(2));
        assert_eq!(
            p,
            Pagination {
                total_records: 2,
                returned_records: 2,
                next_cursor: None,
                has_more: false
            }
        );

        // Past the first page the count cannot say how many rows remain.
        let p = Pagination::compute(2, Some("x"), &rows(&["a", "b"]), Some("employee_id"), Some(4));
        assert!(p.has_more);
        assert_eq!(p.next_cursor.as_deref(), Some("b"));
    }

    #[test]
    fn test_short_page_is_terminal() {
        let p = Pagination::compute(2, None, &rows(&["c"]), Some("employee_id"), Some(3));
        assert!(!p.has_more);
        assert_eq!(p.next_cursor, None);
        assert_eq!(p.returned_records, 1);
    }

    #[test]
    fn test_empty_page() {
        let p = Pagination::compute(2, None, &[], Some("employee_id"), Some(0));
        assert_eq!(p, Pagination { total_records: 0, ..Pagination::terminal() });
    }

    #[test]
    fn test_count_failure_falls_back_to_returned() {
        let p = Pagination::compute(5, None, &rows(&["a", "b"]), Some("employee_id"), None);
        assert_eq!(p.total_records, 2);
    }

    #[test]
    fn test_full_page_without_cursor_value_stops() {
        let p = Pagination::compute(2, None, &rows(&["a", "b"]), Some("missing"), Some(9));
        assert!(!p.has_more);
        assert_eq!(p.next_cursor, None);
    }

    #[test]
    fn test_cursor_falls_back_to_first_uuid_column() {
        let row = json!({"name": "Ann", "team_id": "not-a-uuid", "id": "6f1c1f2e-5d0a-4b7e-9a53-0c9a2e1d8b11"});
        let row = row.as_object().cloned().unwrap();
        assert_eq!(
            cursor_of(&row, None).as_deref(),
            Some("6f1c1f2e-5d0a-4b7e-9a53-0c9a2e1d8b11")
        );
        assert_eq!(cursor_of(&row, Some("name")).as_deref(), Some("Ann"));
    }

    /// Walk a sorted key space the way a caller would, one page at a time.
    fn drain(keys: &[String], page_size: usize) -> (usize, Vec<String>) {
        let mut cursor: Option<String> = None;
        let mut seen = Vec::new();
        let mut calls = 0;
        loop {
            calls += 1;
            let page: Vec<Row> = keys
                .iter()
                .filter(|k| cursor.as_ref().map_or(true, |c| k.as_str() > c.as_str()))
                .take(page_size)
                .map(|k| json!({"id": k}).as_object().cloned().unwrap())
                .collect();
            seen.extend(page.iter().map(|r| r["id"].as_str().unwrap().to_string()));
            let p = Pagination::compute(
                page_size,
                cursor.as_deref(),
                &page,
                Some("id"),
                Some(keys.len() as u64),
            );
            if !p.has_more {
                assert_eq!(p.next_cursor, None);
                return (calls, seen);
            }
            cursor = p.next_cursor;
        }
    }

    #[test]
    fn test_pagination_terminates_without_duplicates() {
        for total in [0usize, 1, 2, 3, 7, 10, 11] {
            for page_size in [1usize, 2, 3, 5, 10] {
                let keys: Vec<String> = (0..total).map(|i| format!("k{:03}", i)).collect();
                let (calls, seen) = drain(&keys, page_size);
                // The count settles the first page; past it an exact multiple
                // needs one extra, empty page to learn it is done.
                let bound = if total <= page_size {
                    1
                } else {
                    total / page_size + 1
                };
                assert!(calls <= bound, "total={total} page_size={page_size} calls={calls}");
                let unique: HashSet<&String> = seen.iter().collect();
                assert_eq!(unique.len(), seen.len());
                assert_eq!(seen, keys);
            }
        }
    }
}
