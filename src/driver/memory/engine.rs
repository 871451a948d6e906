//! Statement execution over persistent (`im`) tables.
//!
//! Every write builds the new table version first and swaps it in at the
//! end, so a statement that fails part way leaves the catalog untouched.

use super::parser::{
    BinaryOp, ColumnSpec, CreateTableStmt, DeleteStmt, Expr, InsertStmt, SelectItem, SelectStmt,
    Statement, UpdateStmt,
};
use crate::core::{Result, RouterError, Value};
use crate::result::{QueryResult, Row};
use std::cmp::Ordering;
use std::collections::HashSet;

pub type Tables = im::HashMap<String, Table>;

#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<ColumnSpec>,
    pub rows: im::Vector<Row>,
}

impl Table {
    fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: im::Vector::new(),
        }
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RouterError::QueryExecution(format!("column \"{}\" does not exist", name)))
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Execute a data or schema statement against `tables`.
pub fn apply(tables: &mut Tables, stmt: &Statement, params: &[Value]) -> Result<QueryResult> {
    match stmt {
        Statement::CreateTable(create) => create_table(tables, create),
        Statement::DropTable { table, if_exists } => {
            if tables.remove(table).is_none() && !if_exists {
                return Err(missing_relation(table));
            }
            Ok(QueryResult::empty("DROP"))
        }
        Statement::Insert(insert) => insert_rows(tables, insert, params),
        Statement::Select(select) => select_rows(tables, select, params),
        Statement::Update(update) => update_rows(tables, update, params),
        Statement::Delete(delete) => delete_rows(tables, delete, params),
        Statement::Begin | Statement::Commit | Statement::Rollback => Err(RouterError::QueryExecution(
            "transaction control is handled by the connection".into(),
        )),
    }
}

fn create_table(tables: &mut Tables, create: &CreateTableStmt) -> Result<QueryResult> {
    if tables.contains_key(&create.table) {
        if create.if_not_exists {
            return Ok(QueryResult::empty("CREATE"));
        }
        return Err(RouterError::QueryExecution(format!(
            "relation \"{}\" already exists",
            create.table
        )));
    }

    let mut seen = HashSet::new();
    for column in &create.columns {
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(RouterError::QueryExecution(format!(
                "column \"{}\" specified more than once",
                column.name
            )));
        }
    }

    tables.insert(create.table.clone(), Table::new(create.columns.clone()));
    Ok(QueryResult::empty("CREATE"))
}

fn insert_rows(tables: &mut Tables, insert: &InsertStmt, params: &[Value]) -> Result<QueryResult> {
    let mut table = lookup(tables, &insert.table)?.clone();

    let targets = match &insert.columns {
        Some(columns) => columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<Vec<_>>>()?,
        None => (0..table.columns.len()).collect(),
    };

    for exprs in &insert.rows {
        if exprs.len() != targets.len() {
            return Err(RouterError::QueryExecution(format!(
                "INSERT has {} expressions but {} target columns",
                exprs.len(),
                targets.len()
            )));
        }

        let mut row = vec![Value::Null; table.columns.len()];
        for (target, expr) in targets.iter().zip(exprs) {
            row[*target] = eval(expr, None, params)?;
        }
        check_not_null(&insert.table, &table, &row)?;
        table.rows.push_back(row);
    }

    check_unique(&insert.table, &table)?;

    let inserted = insert.rows.len() as u64;
    tables.insert(insert.table.clone(), table);
    Ok(QueryResult::affected("INSERT", inserted))
}

fn select_rows(tables: &Tables, select: &SelectStmt, params: &[Value]) -> Result<QueryResult> {
    let Some(table_name) = &select.table else {
        return select_without_table(select, params);
    };
    let table = lookup(tables, table_name)?;

    let mut rows = Vec::new();
    for row in table.rows.iter() {
        if matches_filter(select.filter.as_ref(), table, row, params)? {
            rows.push(row.clone());
        }
    }

    if select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::CountAll { .. }))
    {
        return count_rows(select, rows.len());
    }

    if !select.order_by.is_empty() {
        let mut keyed = rows
            .into_iter()
            .map(|row| {
                let keys = select
                    .order_by
                    .iter()
                    .map(|o| eval(&o.expr, Some((table, &row)), params))
                    .collect::<Result<Vec<_>>>()?;
                Ok((keys, row))
            })
            .collect::<Result<Vec<_>>>()?;

        keyed.sort_by(|(a, _), (b, _)| {
            for (idx, order) in select.order_by.iter().enumerate() {
                let ordering = sort_order(&a[idx], &b[idx]);
                let ordering = if order.descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    if let Some(limit) = select.limit {
        rows.truncate(limit);
    }

    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => columns.extend(table.column_names()),
            SelectItem::Expr { label, .. } => columns.push(label.clone()),
            SelectItem::CountAll { .. } => {}
        }
    }

    let projected = rows
        .iter()
        .map(|row| {
            let mut out = Vec::with_capacity(columns.len());
            for item in &select.projection {
                match item {
                    SelectItem::Wildcard => out.extend(row.iter().cloned()),
                    SelectItem::Expr { expr, .. } => out.push(eval(expr, Some((table, row)), params)?),
                    SelectItem::CountAll { .. } => {}
                }
            }
            Ok(out)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(QueryResult::with_rows("SELECT", columns, projected))
}

fn select_without_table(select: &SelectStmt, params: &[Value]) -> Result<QueryResult> {
    let mut columns = Vec::new();
    let mut row = Vec::new();

    for item in &select.projection {
        match item {
            SelectItem::Expr { expr, label } => {
                columns.push(label.clone());
                row.push(eval(expr, None, params)?);
            }
            SelectItem::Wildcard | SelectItem::CountAll { .. } => {
                return Err(RouterError::QueryExecution(
                    "SELECT * with no tables specified is not valid".into(),
                ));
            }
        }
    }

    if let Some(filter) = &select.filter {
        if eval(filter, None, params)? != Value::Boolean(true) {
            return Ok(QueryResult::with_rows("SELECT", columns, Vec::new()));
        }
    }

    Ok(QueryResult::with_rows("SELECT", columns, vec![row]))
}

fn count_rows(select: &SelectStmt, count: usize) -> Result<QueryResult> {
    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::CountAll { alias } => {
                columns.push(alias.clone().unwrap_or_else(|| "count".to_string()))
            }
            _ => {
                return Err(RouterError::QueryExecution(
                    "COUNT(*) cannot be mixed with other select items".into(),
                ));
            }
        }
    }

    let row = vec![Value::Integer(count as i64); columns.len()];
    Ok(QueryResult::with_rows("SELECT", columns, vec![row]))
}

fn update_rows(tables: &mut Tables, update: &UpdateStmt, params: &[Value]) -> Result<QueryResult> {
    let mut table = lookup(tables, &update.table)?.clone();

    let targets = update
        .assignments
        .iter()
        .map(|(column, expr)| Ok((table.column_index(column)?, expr)))
        .collect::<Result<Vec<_>>>()?;

    let mut updated = 0u64;
    let mut rows = im::Vector::new();
    for row in table.rows.iter() {
        if !matches_filter(update.filter.as_ref(), &table, row, params)? {
            rows.push_back(row.clone());
            continue;
        }

        let mut next = row.clone();
        for (index, expr) in &targets {
            next[*index] = eval(expr, Some((&table, row)), params)?;
        }
        check_not_null(&update.table, &table, &next)?;
        rows.push_back(next);
        updated += 1;
    }

    table.rows = rows;
    check_unique(&update.table, &table)?;

    tables.insert(update.table.clone(), table);
    Ok(QueryResult::affected("UPDATE", updated))
}

fn delete_rows(tables: &mut Tables, delete: &DeleteStmt, params: &[Value]) -> Result<QueryResult> {
    let mut table = lookup(tables, &delete.table)?.clone();

    let mut kept = im::Vector::new();
    for row in table.rows.iter() {
        if !matches_filter(delete.filter.as_ref(), &table, row, params)? {
            kept.push_back(row.clone());
        }
    }

    let deleted = (table.rows.len() - kept.len()) as u64;
    table.rows = kept;
    tables.insert(delete.table.clone(), table);
    Ok(QueryResult::affected("DELETE", deleted))
}

fn lookup<'a>(tables: &'a Tables, name: &str) -> Result<&'a Table> {
    tables.get(name).ok_or_else(|| missing_relation(name))
}

fn missing_relation(name: &str) -> RouterError {
    RouterError::QueryExecution(format!("relation \"{}\" does not exist", name))
}

fn matches_filter(filter: Option<&Expr>, table: &Table, row: &Row, params: &[Value]) -> Result<bool> {
    match filter {
        None => Ok(true),
        Some(expr) => Ok(eval(expr, Some((table, row)), params)? == Value::Boolean(true)),
    }
}

fn check_not_null(table_name: &str, table: &Table, row: &Row) -> Result<()> {
    for (column, value) in table.columns.iter().zip(row) {
        if column.not_null && value.is_null() {
            return Err(RouterError::QueryExecution(format!(
                "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                column.name, table_name
            )));
        }
    }
    Ok(())
}

fn check_unique(table_name: &str, table: &Table) -> Result<()> {
    for (index, column) in table.columns.iter().enumerate() {
        if !column.unique {
            continue;
        }

        let mut seen = HashSet::new();
        for row in table.rows.iter() {
            let value = &row[index];
            if value.is_null() {
                continue;
            }
            if !seen.insert(unique_key(value)) {
                return Err(RouterError::QueryExecution(format!(
                    "duplicate key value violates unique constraint \"{}_{}_key\": ({})=({})",
                    table_name, column.name, column.name, value
                )));
            }
        }
    }
    Ok(())
}

/// Hashable identity of a value for uniqueness checks. Integers and
/// integral floats collide, matching `compare`.
fn unique_key(value: &Value) -> String {
    match value {
        Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => format!("n:{}", *f as i64),
        Value::Integer(i) => format!("n:{}", i),
        other => format!("{}:{}", other.type_name(), other),
    }
}

/// Total order for ORDER BY: NULLs sort last, incomparable values keep
/// their relative order.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

pub fn eval(expr: &Expr, row: Option<(&Table, &Row)>, params: &[Value]) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Param(index) => params.get(*index).cloned().ok_or_else(|| {
            RouterError::QueryExecution(format!(
                "there is no parameter ${} ({} supplied)",
                index + 1,
                params.len()
            ))
        }),
        Expr::Column(name) => match row {
            Some((table, row)) => Ok(row[table.column_index(name)?].clone()),
            None => Err(RouterError::QueryExecution(format!(
                "column \"{}\" does not exist",
                name
            ))),
        },
        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, row, params)?.is_null();
            Ok(Value::Boolean(is_null != *negated))
        }
        Expr::Not(inner) => match eval(inner, row, params)? {
            Value::Null => Ok(Value::Null),
            Value::Boolean(b) => Ok(Value::Boolean(!b)),
            other => Err(type_error("NOT", &other)),
        },
        Expr::Negate(inner) => match eval(inner, row, params)? {
            Value::Null => Ok(Value::Null),
            Value::Integer(i) => i
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| RouterError::QueryExecution("integer out of range".into())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(type_error("-", &other)),
        },
        Expr::Binary { left, op, right } => {
            let left = eval(left, row, params)?;
            let right = eval(right, row, params)?;
            binary(&left, *op, &right)
        }
    }
}

fn binary(left: &Value, op: BinaryOp, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::And => logical(left, right, true),
        BinaryOp::Or => logical(left, right, false),
        BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let ordering = left.compare(right).ok_or_else(|| {
                RouterError::QueryExecution(format!(
                    "operator does not exist: {} {:?} {}",
                    left.type_name(),
                    op,
                    right.type_name()
                ))
            })?;
            let outcome = match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::NotEq => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Boolean(outcome))
        }
        _ => arithmetic(left, op, right),
    }
}

/// Three-valued AND (`is_and`) / OR.
fn logical(left: &Value, right: &Value, is_and: bool) -> Result<Value> {
    let as_truth = |v: &Value| match v {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(*b)),
        other => Err(type_error(if is_and { "AND" } else { "OR" }, other)),
    };
    let (l, r) = (as_truth(left)?, as_truth(right)?);

    let dominant = !is_and;
    Ok(match (l, r) {
        (Some(a), _) if a == dominant => Value::Boolean(dominant),
        (_, Some(b)) if b == dominant => Value::Boolean(dominant),
        (Some(_), Some(_)) => Value::Boolean(!dominant),
        _ => Value::Null,
    })
}

fn arithmetic(left: &Value, op: BinaryOp, right: &Value) -> Result<Value> {
    let overflow = || RouterError::QueryExecution("integer out of range".into());
    let div_zero = || RouterError::QueryExecution("division by zero".into());

    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            let out = match op {
                BinaryOp::Plus => a.checked_add(b).ok_or_else(overflow)?,
                BinaryOp::Minus => a.checked_sub(b).ok_or_else(overflow)?,
                BinaryOp::Multiply => a.checked_mul(b).ok_or_else(overflow)?,
                BinaryOp::Divide if b == 0 => return Err(div_zero()),
                BinaryOp::Divide => a.checked_div(b).ok_or_else(overflow)?,
                BinaryOp::Modulo if b == 0 => return Err(div_zero()),
                BinaryOp::Modulo => a.checked_rem(b).ok_or_else(overflow)?,
                _ => unreachable!("non-arithmetic operator {:?}", op),
            };
            Ok(Value::Integer(out))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let a = as_f64(left);
            let b = as_f64(right);
            let out = match op {
                BinaryOp::Plus => a + b,
                BinaryOp::Minus => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide if b == 0.0 => return Err(div_zero()),
                BinaryOp::Divide => a / b,
                BinaryOp::Modulo if b == 0.0 => return Err(div_zero()),
                BinaryOp::Modulo => a % b,
                _ => unreachable!("non-arithmetic operator {:?}", op),
            };
            Ok(Value::Float(out))
        }
        _ => Err(RouterError::QueryExecution(format!(
            "operator does not exist: {} {:?} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn type_error(op: &str, value: &Value) -> RouterError {
    RouterError::QueryExecution(format!(
        "argument of {} must be type boolean, not type {}",
        op,
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::parser::parse;

    fn run(tables: &mut Tables, sql: &str, params: &[Value]) -> Result<QueryResult> {
        apply(tables, &parse(sql)?, params)
    }

    fn seeded() -> Tables {
        let mut tables = Tables::new();
        run(
            &mut tables,
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, sku TEXT, qty INTEGER)",
            &[],
        )
        .unwrap();
        run(
            &mut tables,
            "INSERT INTO orders VALUES (1, 'a', 5), (2, 'b', 1), (3, 'c', NULL)",
            &[],
        )
        .unwrap();
        tables
    }

    #[test]
    fn test_insert_and_select_with_params() {
        let mut tables = seeded();
        let result = run(
            &mut tables,
            "SELECT sku FROM orders WHERE qty >= $1 ORDER BY id",
            &[Value::Integer(1)],
        )
        .unwrap();

        assert_eq!(result.columns, vec!["sku".to_string()]);
        assert_eq!(
            result.rows,
            vec![vec![Value::Text("a".into())], vec![Value::Text("b".into())]]
        );
    }

    #[test]
    fn test_duplicate_primary_key_leaves_table_unchanged() {
        let mut tables = seeded();
        let err = run(&mut tables, "INSERT INTO orders VALUES (4, 'd', 1), (1, 'x', 1)", &[])
            .unwrap_err();

        assert!(err.to_string().contains("duplicate key"));
        assert_eq!(tables["orders"].rows.len(), 3);
    }

    #[test]
    fn test_update_and_delete_counts() {
        let mut tables = seeded();

        let updated = run(&mut tables, "UPDATE orders SET qty = qty + 1 WHERE qty IS NOT NULL", &[]).unwrap();
        assert_eq!(updated.row_count, 2);

        let deleted = run(&mut tables, "DELETE FROM orders WHERE qty IS NULL", &[]).unwrap();
        assert_eq!(deleted.row_count, 1);

        let count = run(&mut tables, "SELECT COUNT(*) AS n FROM orders", &[]).unwrap();
        assert_eq!(count.columns, vec!["n".to_string()]);
        assert_eq!(count.rows, vec![vec![Value::Integer(2)]]);
    }

    #[test]
    fn test_order_by_desc_with_limit() {
        let mut tables = seeded();
        let result = run(&mut tables, "SELECT id FROM orders ORDER BY qty DESC LIMIT 2", &[]).unwrap();
        // NULL qty sorts last before the DESC reversal, so it comes first
        assert_eq!(
            result.rows,
            vec![vec![Value::Integer(3)], vec![Value::Integer(1)]]
        );
    }

    #[test]
    fn test_missing_relation_and_column() {
        let mut tables = seeded();
        let err = run(&mut tables, "SELECT * FROM nope", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Query execution failed: relation \"nope\" does not exist");

        assert!(run(&mut tables, "SELECT missing FROM orders", &[]).is_err());
    }

    #[test]
    fn test_select_without_table() {
        let mut tables = Tables::new();
        let result = run(&mut tables, "SELECT 1 + 1 AS two", &[]).unwrap();
        assert_eq!(result.rows, vec![vec![Value::Integer(2)]]);
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(
            logical(&Value::Null, &Value::Boolean(false), true).unwrap(),
            Value::Boolean(false)
        );
        assert_eq!(
            logical(&Value::Null, &Value::Boolean(true), false).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            logical(&Value::Null, &Value::Boolean(true), true).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_division_by_zero() {
        let mut tables = Tables::new();
        assert!(run(&mut tables, "SELECT 1 / 0", &[]).is_err());
    }
}
