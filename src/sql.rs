use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// One VALUES row of an INSERT, still raw strings; the model validates
/// times and dates when the command is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub room_id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub name: String,
    pub email: String,
    pub department: String,
    pub meeting_title: String,
    pub notes: Option<String>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Multi-row VALUES is one atomic batch. `returning` echoes the created
    /// rows (ids and created_at are server-assigned).
    InsertBookings {
        rows: Vec<BookingRow>,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        room_id: Option<String>,
        date: Option<String>,
    },
    SelectConflicts {
        room_id: String,
        date: String,
        start_time: String,
        end_time: String,
        exclude_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let all_rows = extract_all_insert_rows(insert)?;
    let mut rows = Vec::with_capacity(all_rows.len());
    for values in &all_rows {
        if values.len() < 8 || values.len() > 9 {
            return Err(SqlError::WrongArity("bookings row", 8, values.len()));
        }
        rows.push(BookingRow {
            room_id: parse_string(&values[0])?,
            date: parse_string(&values[1])?,
            start_time: parse_string(&values[2])?,
            end_time: parse_string(&values[3])?,
            name: parse_string(&values[4])?,
            email: parse_string(&values[5])?,
            department: parse_string(&values[6])?,
            meeting_title: parse_string(&values[7])?,
            notes: if values.len() == 9 {
                parse_string_or_null(&values[8])?
            } else {
                None
            },
        });
    }

    Ok(Command::InsertBookings {
        rows,
        returning: insert.returning.is_some(),
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteBooking { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "bookings" => {
            let mut filters = Filters::default();
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectBookings {
                room_id: filters.room_id,
                date: filters.date,
            })
        }
        "conflicts" => {
            let mut filters = Filters::default();
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectConflicts {
                room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
                start_time: filters
                    .start_time
                    .ok_or(SqlError::MissingFilter("start_time"))?,
                end_time: filters.end_time.ok_or(SqlError::MissingFilter("end_time"))?,
                exclude_id: filters.exclude_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    room_id: Option<String>,
    date: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    exclude_id: Option<Ulid>,
}

/// Walk an AND-chain of `col = 'value'` predicates. Anything else in the
/// WHERE clause is ignored, like unknown columns.
fn extract_eq_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, filters)?;
                extract_eq_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("room_id") => filters.room_id = Some(parse_string(right)?),
                Some("date") => filters.date = Some(parse_string(right)?),
                Some("start_time") => filters.start_time = Some(parse_string(right)?),
                Some("end_time") => filters.end_time = Some(parse_string(right)?),
                Some("exclude_id") => filters.exclude_id = Some(parse_ulid_expr(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            Value::Number(s, _) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
