//! SQL front end of the in-memory driver: sqlparser AST converted to the
//! small statement set the engine executes.

use crate::core::{Result, RouterError, Value};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::cell::Cell;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    CreateTable(CreateTableStmt),
    DropTable { table: String, if_exists: bool },
    Insert(InsertStmt),
    Select(SelectStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
}

impl Statement {
    /// Statements that change table contents or schema.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable(_)
                | Statement::DropTable { .. }
                | Statement::Insert(_)
                | Statement::Update(_)
                | Statement::Delete(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub primary_key: bool,
    pub unique: bool,
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStmt {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    /// `None` for table-less selects such as `SELECT 1`
    pub table: Option<String>,
    pub projection: Vec<SelectItem>,
    pub filter: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    CountAll { alias: Option<String> },
    Expr { expr: Expr, label: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    /// Zero-based parameter index
    Param(usize),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

/// Parse a single SQL statement.
pub fn parse(sql: &str) -> Result<Statement> {
    let trimmed = sql.trim().trim_end_matches(';').trim().to_uppercase();
    match trimmed.as_str() {
        "BEGIN" | "BEGIN TRANSACTION" | "START TRANSACTION" => return Ok(Statement::Begin),
        "COMMIT" | "COMMIT TRANSACTION" | "END" => return Ok(Statement::Commit),
        "ROLLBACK" | "ROLLBACK TRANSACTION" | "ABORT" => return Ok(Statement::Rollback),
        _ => {}
    }

    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| RouterError::QueryExecution(format!("syntax error: {}", e)))?;

    if statements.len() != 1 {
        return Err(RouterError::QueryExecution(format!(
            "expected exactly one statement, got {}",
            statements.len()
        )));
    }

    Converter::default().statement(statements.remove(0))
}

#[derive(Default)]
struct Converter {
    /// Next index for anonymous `?` placeholders
    next_anonymous: Cell<usize>,
}

impl Converter {
    fn statement(&self, stmt: sql_ast::Statement) -> Result<Statement> {
        match stmt {
            sql_ast::Statement::CreateTable(create) => {
                let columns = create.columns.iter().map(column_spec).collect();
                Ok(Statement::CreateTable(CreateTableStmt {
                    table: table_name(&create.name)?,
                    columns,
                    if_not_exists: create.if_not_exists,
                }))
            }
            sql_ast::Statement::Drop {
                object_type: sql_ast::ObjectType::Table,
                names,
                if_exists,
                ..
            } => {
                let [name] = names.as_slice() else {
                    return Err(unsupported("DROP TABLE with several tables"));
                };
                Ok(Statement::DropTable {
                    table: table_name(name)?,
                    if_exists,
                })
            }
            sql_ast::Statement::Insert(insert) => self.insert(insert),
            sql_ast::Statement::Query(query) => self.query(*query),
            sql_ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => self.update(table, assignments, selection),
            sql_ast::Statement::Delete(delete) => self.delete(delete),
            sql_ast::Statement::StartTransaction { .. } => Ok(Statement::Begin),
            sql_ast::Statement::Commit { .. } => Ok(Statement::Commit),
            sql_ast::Statement::Rollback { .. } => Ok(Statement::Rollback),
            other => Err(unsupported(&format!("statement: {}", other))),
        }
    }

    fn insert(&self, insert: sql_ast::Insert) -> Result<Statement> {
        let table = insert
            .table
            .to_string()
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_string();

        let columns = if insert.columns.is_empty() {
            None
        } else {
            Some(insert.columns.into_iter().map(|id| id.value).collect())
        };

        let Some(source) = insert.source else {
            return Err(unsupported("INSERT without VALUES"));
        };
        let sql_ast::SetExpr::Values(values) = *source.body else {
            return Err(unsupported("INSERT ... SELECT"));
        };

        let rows = values
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|e| self.expr(e)).collect())
            .collect::<Result<Vec<_>>>()?;

        Ok(Statement::Insert(InsertStmt {
            table,
            columns,
            rows,
        }))
    }

    fn query(&self, query: sql_ast::Query) -> Result<Statement> {
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(unsupported("set operations"));
        };

        let table = match select.from.as_slice() {
            [] => None,
            [from] if from.joins.is_empty() => match &from.relation {
                sql_ast::TableFactor::Table { name, .. } => Some(table_name(name)?),
                _ => return Err(unsupported("derived tables")),
            },
            _ => return Err(unsupported("joins")),
        };

        let projection = select
            .projection
            .into_iter()
            .map(|item| self.select_item(item))
            .collect::<Result<Vec<_>>>()?;

        let filter = select.selection.map(|e| self.expr(e)).transpose()?;

        let order_by = match query.order_by {
            None => Vec::new(),
            Some(order_by) => match order_by.kind {
                sql_ast::OrderByKind::Expressions(exprs) => exprs
                    .into_iter()
                    .map(|o| {
                        Ok(OrderBy {
                            descending: o.options.asc == Some(false),
                            expr: self.expr(o.expr)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                sql_ast::OrderByKind::All(_) => return Err(unsupported("ORDER BY ALL")),
            },
        };

        let limit = match &query.limit_clause {
            None => None,
            Some(sql_ast::LimitClause::LimitOffset { limit, .. }) => {
                limit.as_ref().map(limit_value).transpose()?
            }
            Some(sql_ast::LimitClause::OffsetCommaLimit { limit, .. }) => Some(limit_value(limit)?),
        };

        Ok(Statement::Select(SelectStmt {
            table,
            projection,
            filter,
            order_by,
            limit,
        }))
    }

    fn select_item(&self, item: sql_ast::SelectItem) -> Result<SelectItem> {
        match item {
            sql_ast::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
            sql_ast::SelectItem::UnnamedExpr(expr) => {
                if is_count_all(&expr) {
                    return Ok(SelectItem::CountAll { alias: None });
                }
                let label = match &expr {
                    sql_ast::Expr::Identifier(ident) => ident.value.clone(),
                    sql_ast::Expr::CompoundIdentifier(parts) => parts
                        .last()
                        .map(|i| i.value.clone())
                        .unwrap_or_default(),
                    _ => "?column?".to_string(),
                };
                Ok(SelectItem::Expr {
                    expr: self.expr(expr)?,
                    label,
                })
            }
            sql_ast::SelectItem::ExprWithAlias { expr, alias } => {
                if is_count_all(&expr) {
                    return Ok(SelectItem::CountAll {
                        alias: Some(alias.value),
                    });
                }
                Ok(SelectItem::Expr {
                    expr: self.expr(expr)?,
                    label: alias.value,
                })
            }
            _ => Err(unsupported("select item")),
        }
    }

    fn update(
        &self,
        table: sql_ast::TableWithJoins,
        assignments: Vec<sql_ast::Assignment>,
        selection: Option<sql_ast::Expr>,
    ) -> Result<Statement> {
        let table = match &table.relation {
            sql_ast::TableFactor::Table { name, .. } => table_name(name)?,
            _ => return Err(unsupported("UPDATE of a derived table")),
        };

        let assignments = assignments
            .into_iter()
            .map(|assign| {
                let column = match &assign.target {
                    sql_ast::AssignmentTarget::ColumnName(name) => table_name(name)?,
                    _ => return Err(unsupported("tuple assignment")),
                };
                Ok((column, self.expr(assign.value)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Statement::Update(UpdateStmt {
            table,
            assignments,
            filter: selection.map(|e| self.expr(e)).transpose()?,
        }))
    }

    fn delete(&self, delete: sql_ast::Delete) -> Result<Statement> {
        let tables = match &delete.from {
            sql_ast::FromTable::WithFromKeyword(tables) | sql_ast::FromTable::WithoutKeyword(tables) => {
                tables
            }
        };
        let table = match tables.first().map(|t| &t.relation) {
            Some(sql_ast::TableFactor::Table { name, .. }) => table_name(name)?,
            _ => return Err(unsupported("DELETE without a table")),
        };

        Ok(Statement::Delete(DeleteStmt {
            table,
            filter: delete.selection.map(|e| self.expr(e)).transpose()?,
        }))
    }

    fn expr(&self, expr: sql_ast::Expr) -> Result<Expr> {
        match expr {
            sql_ast::Expr::Identifier(ident) => Ok(Expr::Column(ident.value)),
            sql_ast::Expr::CompoundIdentifier(parts) => parts
                .into_iter()
                .last()
                .map(|ident| Expr::Column(ident.value))
                .ok_or_else(|| unsupported("empty identifier")),
            sql_ast::Expr::Value(value) => self.value(value.value),
            sql_ast::Expr::Nested(inner) => self.expr(*inner),
            sql_ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: false,
            }),
            sql_ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: true,
            }),
            sql_ast::Expr::UnaryOp { op, expr } => {
                let inner = Box::new(self.expr(*expr)?);
                match op {
                    sql_ast::UnaryOperator::Not => Ok(Expr::Not(inner)),
                    sql_ast::UnaryOperator::Minus => Ok(Expr::Negate(inner)),
                    sql_ast::UnaryOperator::Plus => Ok(*inner),
                    other => Err(unsupported(&format!("operator {}", other))),
                }
            }
            sql_ast::Expr::BinaryOp { left, op, right } => Ok(Expr::Binary {
                left: Box::new(self.expr(*left)?),
                op: binary_op(&op)?,
                right: Box::new(self.expr(*right)?),
            }),
            other => Err(unsupported(&format!("expression {}", other))),
        }
    }

    fn value(&self, value: sql_ast::Value) -> Result<Expr> {
        let literal = match value {
            sql_ast::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Value::Integer(i)
                } else {
                    n.parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| RouterError::QueryExecution(format!("invalid number: {}", n)))?
                }
            }
            sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
                Value::Text(s)
            }
            sql_ast::Value::Boolean(b) => Value::Boolean(b),
            sql_ast::Value::Null => Value::Null,
            sql_ast::Value::Placeholder(p) => return self.placeholder(&p),
            other => return Err(unsupported(&format!("literal {}", other))),
        };
        Ok(Expr::Literal(literal))
    }

    fn placeholder(&self, placeholder: &str) -> Result<Expr> {
        if placeholder == "?" {
            let index = self.next_anonymous.get();
            self.next_anonymous.set(index + 1);
            return Ok(Expr::Param(index));
        }

        placeholder
            .strip_prefix('$')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .map(|n| Expr::Param(n - 1))
            .ok_or_else(|| RouterError::QueryExecution(format!("invalid placeholder {}", placeholder)))
    }
}

fn column_spec(column: &sql_ast::ColumnDef) -> ColumnSpec {
    let options: Vec<String> = column
        .options
        .iter()
        .map(|opt| opt.option.to_string().to_uppercase())
        .collect();

    let primary_key = options.iter().any(|o| o.contains("PRIMARY KEY"));

    ColumnSpec {
        name: column.name.value.clone(),
        primary_key,
        unique: primary_key || options.iter().any(|o| o.starts_with("UNIQUE")),
        not_null: primary_key || options.iter().any(|o| o == "NOT NULL"),
    }
}

fn table_name(name: &sql_ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|ident| ident.to_string().trim_matches('"').to_string())
        .ok_or_else(|| RouterError::QueryExecution("invalid table name".into()))
}

fn is_count_all(expr: &sql_ast::Expr) -> bool {
    matches!(expr, sql_ast::Expr::Function(_)) && expr.to_string().eq_ignore_ascii_case("COUNT(*)")
}

fn limit_value(expr: &sql_ast::Expr) -> Result<usize> {
    match expr {
        sql_ast::Expr::Value(v) => match &v.value {
            sql_ast::Value::Number(n, _) => n
                .parse::<usize>()
                .map_err(|_| RouterError::QueryExecution(format!("invalid LIMIT value: {}", n))),
            other => Err(unsupported(&format!("LIMIT {}", other))),
        },
        other => Err(unsupported(&format!("LIMIT {}", other))),
    }
}

fn binary_op(op: &sql_ast::BinaryOperator) -> Result<BinaryOp> {
    use sql_ast::BinaryOperator as B;
    Ok(match op {
        B::Eq => BinaryOp::Eq,
        B::NotEq => BinaryOp::NotEq,
        B::Lt => BinaryOp::Lt,
        B::LtEq => BinaryOp::LtEq,
        B::Gt => BinaryOp::Gt,
        B::GtEq => BinaryOp::GtEq,
        B::And => BinaryOp::And,
        B::Or => BinaryOp::Or,
        B::Plus => BinaryOp::Plus,
        B::Minus => BinaryOp::Minus,
        B::Multiply => BinaryOp::Multiply,
        B::Divide => BinaryOp::Divide,
        B::Modulo => BinaryOp::Modulo,
        other => return Err(unsupported(&format!("operator {}", other))),
    })
}

fn unsupported(what: &str) -> RouterError {
    RouterError::QueryExecution(format!("unsupported in memory driver: {}", what))
}
