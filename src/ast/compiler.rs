/// AST → SQL compiler.
///
/// Converts a synthesized [`SelectQuery`] into PostgreSQL text. Identifiers
/// that are not plain lowercase words are double-quoted so that aliases can
/// never break out of their position in the statement.
use super::types::*;

/// Words that must be quoted when used as an identifier.
const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "by", "case", "desc", "distinct", "end", "from", "group", "having",
    "in", "is", "join", "left", "limit", "not", "null", "offset", "on", "or", "order", "select",
    "table", "then", "to", "union", "user", "when", "where", "with",
];

/// Compile a query AST into a PostgreSQL SQL string.
pub fn compile(select: &SelectQuery) -> String {
    let mut parts = Vec::new();

    let mut select_clause = String::from("SELECT ");
    if select.projections.is_empty() {
        select_clause.push('*');
    } else {
        let items: Vec<String> = select.projections.iter().map(compile_select_item).collect();
        select_clause.push_str(&items.join(", "));
    }
    parts.push(select_clause);

    if let Some(ref from) = select.from {
        parts.push(format!("FROM {}", compile_table_ref(from)));
    }

    for join in &select.joins {
        parts.push(compile_join(join));
    }

    if !select.filter.is_empty() {
        let predicates: Vec<String> = select.filter.iter().map(compile_expr).collect();
        parts.push(format!("WHERE {}", predicates.join(" AND ")));
    }

    if !select.order_by.is_empty() {
        let orders: Vec<String> = select.order_by.iter().map(compile_order_by).collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(limit) = select.limit {
        parts.push(format!("LIMIT {}", limit));
    }

    parts.join(" ")
}

/// Quote an identifier unless it is a plain, non-reserved lowercase word.
pub fn quote_ident(name: &str) -> String {
    let plain = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&name);
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn compile_select_item(item: &SelectItem) -> String {
    match item {
        SelectItem::Wildcard => "*".to_string(),
        SelectItem::Expression { expr, alias } => {
            let expr_str = compile_expr(expr);
            match alias {
                Some(a) => format!("{} AS {}", expr_str, quote_ident(a)),
                None => expr_str,
            }
        }
    }
}

fn compile_table_ref(table: &TableRef) -> String {
    let mut s = quote_ident(&table.name);
    if let Some(ref a) = table.alias {
        s.push(' ');
        s.push_str(&quote_ident(a));
    }
    s
}

fn compile_join(join: &Join) -> String {
    let type_str = match join.join_type {
        JoinType::Inner => "JOIN",
        JoinType::Left => "LEFT JOIN",
    };

    let condition_str = match &join.condition {
        Some(expr) => format!(" ON {}", compile_expr(expr)),
        None => String::new(),
    };

    format!(
        "{} {}{}",
        type_str,
        compile_table_ref(&join.table),
        condition_str
    )
}

fn compile_expr(expr: &Expression) -> String {
    match expr {
        Expression::Column { table, name } => match table {
            Some(t) => format!("{}.{}", quote_ident(t), quote_ident(name)),
            None => quote_ident(name),
        },
        Expression::Literal(lit) => compile_literal(lit),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::NotEq => "<>",
                BinaryOperator::Lt => "<",
                BinaryOperator::LtEq => "<=",
                BinaryOperator::Gt => ">",
                BinaryOperator::GtEq => ">=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
            };
            format!("{} {} {}", compile_expr(left), op_str, compile_expr(right))
        }
        Expression::Function { name, args } => {
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            format!("{}({})", name, args_str.join(", "))
        }
        Expression::Wildcard => "*".to_string(),
        Expression::Parameter { index, cast } => match cast.as_deref() {
            None | Some("text") => format!("${}::text", index),
            Some(ty) => format!("${}::text::{}", index, ty),
        },
        Expression::IsNull { expr, negated } => {
            if *negated {
                format!("{} IS NOT NULL", compile_expr(expr))
            } else {
                format!("{} IS NULL", compile_expr(expr))
            }
        }
        Expression::Nested(expr) => format!("({})", compile_expr(expr)),
        Expression::Raw(sql) => sql.clone(),
    }
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Literal::Integer(i) => i.to_string(),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn compile_order_by(order: &OrderByExpr) -> String {
    let mut s = compile_expr(&order.expr);
    match order.asc {
        Some(true) => s.push_str(" ASC"),
        Some(false) => s.push_str(" DESC"),
        None => {}
    }
    s
}
