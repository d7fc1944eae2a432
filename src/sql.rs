use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        id: Ulid,
        name: String,
        email: String,
        password: String,
    },
    Login {
        email: String,
        password: String,
    },
    InsertBooking {
        id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    },
    /// `note: None` keeps the stored note; `Some(None)` clears it.
    UpdateBooking {
        id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<Option<String>>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
    },
    SelectMyBookings,
    SelectAvailability {
        start: Ms,
        end: Ms,
    },
    SelectFreeWindows {
        start: Ms,
        end: Ms,
    },
    AdminSelectUsers,
    AdminUpdateRole {
        id: Ulid,
        role: Role,
    },
    AdminDeleteUser {
        id: Ulid,
    },
    AdminSelectBookings,
    AdminDeleteBooking {
        id: Ulid,
    },
    AdminSelectStats,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    match table.as_str() {
        "users" => {
            let row = named_row(&columns, &values, &["id", "name", "email", "password"]);
            Ok(Command::RegisterUser {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string_expr(row.require("name")?)?,
                email: parse_string_expr(row.require("email")?)?,
                password: parse_string_expr(row.require("password")?)?,
            })
        }
        "bookings" => {
            let row = named_row(&columns, &values, &["id", "start", "end", "note"]);
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(row.require("id")?)?,
                start: parse_i64_expr(row.require("start")?)?,
                end: parse_i64_expr(row.require("end")?)?,
                note: match row.get("note") {
                    Some(expr) => parse_string_or_null(expr)?,
                    None => None,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }
    let lookup = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "bookings" => Ok(Command::UpdateBooking {
            id,
            start: parse_i64_expr(lookup("start").ok_or(SqlError::MissingColumn("start"))?)?,
            end: parse_i64_expr(lookup("end").ok_or(SqlError::MissingColumn("end"))?)?,
            note: lookup("note").map(parse_string_or_null).transpose()?,
        }),
        "admin.users" => {
            let raw = parse_string_expr(lookup("role").ok_or(SqlError::MissingColumn("role"))?)?;
            let role = Role::parse(&raw).ok_or_else(|| SqlError::Parse(format!("unknown role: {raw}")))?;
            Ok(Command::AdminUpdateRole { id, role })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "admin.users" => Ok(Command::AdminDeleteUser { id }),
        "admin.bookings" => Ok(Command::AdminDeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let find = |col: &str, op: &ast::BinaryOperator| {
        filters
            .iter()
            .find(|(c, o, _)| c == col && o == op)
            .map(|(_, _, e)| *e)
    };

    match table.as_str() {
        "bookings" => {
            let id = find("id", &ast::BinaryOperator::Eq)
                .map(parse_ulid_expr)
                .transpose()?;
            Ok(Command::SelectBookings { id })
        }
        "my_bookings" => Ok(Command::SelectMyBookings),
        "login" => Ok(Command::Login {
            email: parse_string_expr(
                find("email", &ast::BinaryOperator::Eq).ok_or(SqlError::MissingFilter("email"))?,
            )?,
            password: parse_string_expr(
                find("password", &ast::BinaryOperator::Eq)
                    .ok_or(SqlError::MissingFilter("password"))?,
            )?,
        }),
        "availability" | "free_windows" => {
            let start = parse_i64_expr(
                find("start", &ast::BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start"))?,
            )?;
            let end = parse_i64_expr(
                find("end", &ast::BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end"))?,
            )?;
            if table == "availability" {
                Ok(Command::SelectAvailability { start, end })
            } else {
                Ok(Command::SelectFreeWindows { start, end })
            }
        }
        "admin.users" => Ok(Command::AdminSelectUsers),
        "admin.bookings" => Ok(Command::AdminSelectBookings),
        "admin.stats" => Ok(Command::AdminSelectStats),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an `AND` chain of `column <op> value` comparisons.
fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)?;
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, op.clone(), right.as_ref()));
            }
        }
        Expr::Nested(inner) => collect_filters(inner, out)?,
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

/// Values of one INSERT row keyed by column name. Without an explicit column
/// list the values are taken in `default_order`.
struct NamedRow<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> NamedRow<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn named_row<'a>(columns: &[String], values: &'a [Expr], default_order: &[&str]) -> NamedRow<'a> {
    let cells = if columns.is_empty() {
        default_order
            .iter()
            .zip(values)
            .map(|(c, e)| (c.to_string(), e))
            .collect()
    } else {
        columns.iter().cloned().zip(values).collect()
    };
    NamedRow { cells }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

/// `admin.users` → "admin.users", `users` → "users", `public.users` → "users".
fn object_name_qualified(name: &ast::ObjectName) -> Option<String> {
    let parts: Vec<String> = name
        .0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [] => None,
        [schema, table] if schema == "public" => Some(table.clone()),
        _ => Some(parts.join(".")),
    }
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_qualified(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
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
            object_name_qualified(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!("{} rows in one INSERT", rows.len()))),
        },
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_register_user() {
        let sql = format!(
            "INSERT INTO users (id, name, email, password) VALUES ('{ID}', 'Anna', 'anna@example.com', 'hunter22')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RegisterUser {
                id: id(),
                name: "Anna".into(),
                email: "anna@example.com".into(),
                password: "hunter22".into(),
            }
        );
    }

    #[test]
    fn parse_register_user_column_order_follows_list() {
        let sql = format!(
            "INSERT INTO users (email, password, name, id) VALUES ('anna@example.com', 'hunter22', 'Anna', '{ID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::RegisterUser { id: got, name, email, .. } => {
                assert_eq!(got, id());
                assert_eq!(name, "Anna");
                assert_eq!(email, "anna@example.com");
            }
            cmd => panic!("expected RegisterUser, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_login() {
        let sql = "SELECT * FROM login WHERE email = 'anna@example.com' AND password = 'hunter22'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::Login {
                email: "anna@example.com".into(),
                password: "hunter22".into(),
            }
        );
    }

    #[test]
    fn parse_login_requires_password() {
        let sql = "SELECT * FROM login WHERE email = 'anna@example.com'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("password"))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, start, "end", note) VALUES ('{ID}', 1000, 2000, 'ski week')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: id(),
                start: 1000,
                end: 2000,
                note: Some("ski week".into()),
            }
        );
    }

    #[test]
    fn parse_insert_booking_without_note() {
        let sql = format!(r#"INSERT INTO bookings (id, start, "end") VALUES ('{ID}', 1000, 2000)"#);
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { note, .. } => assert_eq!(note, None),
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_null_note_and_quoted_numbers() {
        let sql = format!(r#"INSERT INTO bookings (id, start, "end", note) VALUES ('{ID}', '1000', '2000', NULL)"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: id(),
                start: 1000,
                end: 2000,
                note: None,
            }
        );
    }

    #[test]
    fn parse_insert_booking_missing_end() {
        let sql = format!("INSERT INTO bookings (id, start) VALUES ('{ID}', 1000)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("end"))));
    }

    #[test]
    fn parse_multi_row_insert_rejected() {
        let sql = format!(
            r#"INSERT INTO bookings (id, start, "end") VALUES ('{ID}', 1000, 2000), ('{ID}', 3000, 4000)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_booking() {
        let sql = format!(r#"UPDATE bookings SET start = 1000, "end" = 3000, note = 'longer' WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBooking {
                id: id(),
                start: 1000,
                end: 3000,
                note: Some(Some("longer".into())),
            }
        );
    }

    #[test]
    fn parse_update_booking_note_absent_or_null() {
        let keep = format!(r#"UPDATE bookings SET start = 1000, "end" = 3000 WHERE id = '{ID}'"#);
        match parse_sql(&keep).unwrap() {
            Command::UpdateBooking { note, .. } => assert_eq!(note, None),
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
        let clear = format!(r#"UPDATE bookings SET start = 1000, "end" = 3000, note = NULL WHERE id = '{ID}'"#);
        match parse_sql(&clear).unwrap() {
            Command::UpdateBooking { note, .. } => assert_eq!(note, Some(None)),
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = r#"UPDATE bookings SET start = 1000, "end" = 3000"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_delete_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: id() });
    }

    #[test]
    fn parse_select_bookings() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { id: None }
        );
        let sql = format!("SELECT * FROM bookings WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings { id: Some(id()) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM my_bookings").unwrap(),
            Command::SelectMyBookings
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = "SELECT * FROM availability WHERE start >= 1000 AND \"end\" <= 2000";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability { start: 1000, end: 2000 }
        );
    }

    #[test]
    fn parse_select_free_windows() {
        let sql = "SELECT * FROM free_windows WHERE \"end\" <= 2000 AND start >= -500";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectFreeWindows { start: -500, end: 2000 }
        );
    }

    #[test]
    fn parse_availability_missing_bound() {
        let sql = "SELECT * FROM availability WHERE start >= 1000";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_admin_tables() {
        assert_eq!(parse_sql("SELECT * FROM admin.users").unwrap(), Command::AdminSelectUsers);
        assert_eq!(
            parse_sql("SELECT * FROM admin.bookings").unwrap(),
            Command::AdminSelectBookings
        );
        assert_eq!(parse_sql("SELECT * FROM admin.stats").unwrap(), Command::AdminSelectStats);
        assert_eq!(
            parse_sql(&format!("DELETE FROM admin.users WHERE id = '{ID}'")).unwrap(),
            Command::AdminDeleteUser { id: id() }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM admin.bookings WHERE id = '{ID}'")).unwrap(),
            Command::AdminDeleteBooking { id: id() }
        );
    }

    #[test]
    fn parse_admin_update_role() {
        let sql = format!("UPDATE admin.users SET role = 'admin' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::AdminUpdateRole {
                id: id(),
                role: Role::Administrator,
            }
        );
        let bad = format!("UPDATE admin.users SET role = 'root' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&bad), Err(SqlError::Parse(_))));
    }

    #[test]
    fn public_schema_is_transparent() {
        assert_eq!(
            parse_sql("SELECT * FROM public.bookings").unwrap(),
            Command::SelectBookings { id: None }
        );
    }

    #[test]
    fn unqualified_admin_table_name_is_not_admin() {
        // `users` is the registration table; listing needs admin.users.
        assert!(matches!(
            parse_sql("SELECT * FROM users"),
            Err(SqlError::UnknownTable(t)) if t == "users"
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_bad_ulid_errors() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
