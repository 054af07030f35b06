use chrono::NaiveDate;
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
    SelectSettings,
    UpdateSettings {
        settings: Settings,
    },
    InsertBooking {
        id: Ulid,
        date: NaiveDate,
        span: Span,
        kind: SessionKind,
        owner: String,
    },
    CancelBooking {
        id: Ulid,
    },
    InsertPaymentCallback {
        correlation_token: String,
        provider_txn_id: String,
        status: String,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectAvailability {
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectSlots {
        date: NaiveDate,
        kind: SessionKind,
    },
    SelectStats,
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
        Statement::Update {
            table, assignments, ..
        } => parse_update(table, assignments),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                span: Span {
                    start: parse_min(&values[2])?,
                    end: parse_min(&values[3])?,
                },
                kind: parse_kind(&values[4])?,
                owner: parse_string(&values[5])?,
            })
        }
        "payment_callbacks" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("payment_callbacks", 3, values.len()));
            }
            Ok(Command::InsertPaymentCallback {
                correlation_token: parse_string(&values[0])?,
                provider_txn_id: parse_string(&values[1])?,
                status: parse_string(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::CancelBooking { id })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "settings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut work_days = None;
    let mut work_start = None;
    let mut work_end = None;
    let mut buffer_minutes = None;

    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column in SET".into()))?,
            _ => return Err(SqlError::Parse("unsupported SET target".into())),
        };
        match col.as_str() {
            "work_days" => work_days = Some(parse_work_days(&assignment.value)?),
            "work_start" => work_start = Some(parse_u8(&assignment.value)?),
            "work_end" => work_end = Some(parse_u8(&assignment.value)?),
            "buffer_minutes" => buffer_minutes = Some(parse_min(&assignment.value)?),
            other => return Err(SqlError::Parse(format!("unknown settings column: {other}"))),
        }
    }

    Ok(Command::UpdateSettings {
        settings: Settings {
            work_days: work_days.ok_or(SqlError::MissingFilter("work_days"))?,
            work_start: work_start.ok_or(SqlError::MissingFilter("work_start"))?,
            work_end: work_end.ok_or(SqlError::MissingFilter("work_end"))?,
            buffer_minutes: buffer_minutes.ok_or(SqlError::MissingFilter("buffer_minutes"))?,
        },
    })
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
        "settings" => Ok(Command::SelectSettings),
        "stats" => Ok(Command::SelectStats),
        "availability" => {
            let (mut from, mut to) = (None, None);
            if let Some(selection) = &select.selection {
                extract_date_window(selection, &mut from, &mut to)?;
            }
            Ok(Command::SelectAvailability {
                from: from.ok_or(SqlError::MissingFilter("date >="))?,
                to: to.ok_or(SqlError::MissingFilter("date <="))?,
            })
        }
        "slots" => {
            let (mut date, mut kind) = (None, None);
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut date, &mut kind)?;
            }
            Ok(Command::SelectSlots {
                date: date.ok_or(SqlError::MissingFilter("date"))?,
                kind: kind.ok_or(SqlError::MissingFilter("kind"))?,
            })
        }
        "bookings" => {
            let mut filter = BookingFilter::default();
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut filter)?;
            }
            Ok(Command::SelectBookings { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_date_window(
    expr: &Expr,
    from: &mut Option<NaiveDate>,
    to: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_date_window(left, from, to)?;
                extract_date_window(right, from, to)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    *from = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    *to = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::Eq => {
                // date = 'x' is shorthand for a one-day window
                if expr_column_name(left).as_deref() == Some("date") {
                    let d = parse_date(right)?;
                    *from = Some(d);
                    *to = Some(d);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_slot_filters(
    expr: &Expr,
    date: &mut Option<NaiveDate>,
    kind: &mut Option<SessionKind>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, date, kind)?;
                extract_slot_filters(right, date, kind)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("date") => *date = Some(parse_date(right)?),
                Some("kind") => *kind = Some(parse_kind(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn extract_booking_filters(expr: &Expr, filter: &mut BookingFilter) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, filter)?;
                extract_booking_filters(right, filter)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    filter.from = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    filter.to = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("date") => {
                    let d = parse_date(right)?;
                    filter.from = Some(d);
                    filter.to = Some(d);
                }
                Some("status") => {
                    let s = parse_string(right)?;
                    filter.status = Some(
                        BookingStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                    );
                }
                Some("kind") => filter.kind = Some(parse_kind(right)?),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
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
                parse_ulid(right)
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
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_kind(expr: &Expr) -> Result<SessionKind, SqlError> {
    let s = parse_string(expr)?;
    SessionKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad kind: {s}")))
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

fn parse_min(expr: &Expr) -> Result<Min, SqlError> {
    let v = parse_i64_expr(expr)?;
    Min::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of minute range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of hour range")))
}

/// Work days arrive as a comma-separated string, e.g. '1,2,3,4,5'.
fn parse_work_days(expr: &Expr) -> Result<Vec<u8>, SqlError> {
    let s = parse_string(expr)?;
    let mut days = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let day: u8 = part
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad work day: {part}")))?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    days.sort_unstable();
    Ok(days)
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

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_free_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, date, start, "end", kind, owner) VALUES ('{ID}', '2026-09-02', 630, 660, 'free', 'client@example.com')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking {
                id,
                date,
                span,
                kind,
                owner,
            } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 9, 2).unwrap());
                assert_eq!(span, Span::new(630, 660));
                assert_eq!(kind, SessionKind::Free);
                assert_eq!(owner, "client@example.com");
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_paid_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, date, start, "end", kind, owner) VALUES ('{ID}', '2026-09-02', 780, 900, 'paid', 'client@example.com')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(
            cmd,
            Command::InsertBooking {
                kind: SessionKind::Paid,
                ..
            }
        ));
    }

    #[test]
    fn parse_insert_booking_wrong_arity() {
        let sql = format!(r#"INSERT INTO bookings (id) VALUES ('{ID}')"#);
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("bookings", 6, 1))
        ));
    }

    #[test]
    fn parse_insert_payment_callback() {
        let sql = "INSERT INTO payment_callbacks (correlation_token, provider_txn_id, status) VALUES ('tok-1', 'txn-9', 'successful')";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertPaymentCallback {
                correlation_token,
                provider_txn_id,
                status,
            } => {
                assert_eq!(correlation_token, "tok-1");
                assert_eq!(provider_txn_id, "txn-9");
                assert_eq!(status, "successful");
            }
            _ => panic!("expected InsertPaymentCallback, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_cancel_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::CancelBooking { id } => assert_eq!(id.to_string(), ID),
            _ => panic!("expected CancelBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_settings() {
        let sql = "UPDATE settings SET work_days = '1,2,3,4,5', work_start = 9, work_end = 17, buffer_minutes = 60";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::UpdateSettings { settings } => {
                assert_eq!(settings, Settings::default());
            }
            _ => panic!("expected UpdateSettings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_settings_missing_field() {
        let sql = "UPDATE settings SET work_start = 9";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter(_))));
    }

    #[test]
    fn parse_work_days_dedups_and_sorts() {
        let sql = "UPDATE settings SET work_days = '5,1,3,1', work_start = 8, work_end = 18, buffer_minutes = 0";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::UpdateSettings { settings } => {
                assert_eq!(settings.work_days, vec![1, 3, 5]);
            }
            _ => panic!("expected UpdateSettings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_settings_and_stats() {
        assert_eq!(parse_sql("SELECT * FROM settings").unwrap(), Command::SelectSettings);
        assert_eq!(parse_sql("SELECT * FROM stats").unwrap(), Command::SelectStats);
    }

    #[test]
    fn parse_select_availability_window() {
        let sql = "SELECT * FROM availability WHERE date >= '2026-09-01' AND date <= '2026-09-30'";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SelectAvailability { from, to } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(2026, 9, 1).unwrap());
                assert_eq!(to, NaiveDate::from_ymd_opt(2026, 9, 30).unwrap());
            }
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_single_date() {
        let sql = "SELECT * FROM availability WHERE date = '2026-09-02'";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SelectAvailability { from, to } => assert_eq!(from, to),
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_requires_window() {
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_slots() {
        let sql = "SELECT * FROM slots WHERE date = '2026-09-02' AND kind = 'paid'";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SelectSlots { date, kind } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 9, 2).unwrap());
                assert_eq!(kind, SessionKind::Paid);
            }
            _ => panic!("expected SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_bookings_with_filters() {
        let sql = "SELECT * FROM bookings WHERE date >= '2026-09-01' AND date <= '2026-09-30' AND status = 'confirmed' AND kind = 'paid'";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SelectBookings { filter } => {
                assert_eq!(filter.from, NaiveDate::from_ymd_opt(2026, 9, 1));
                assert_eq!(filter.to, NaiveDate::from_ymd_opt(2026, 9, 30));
                assert_eq!(filter.status, Some(BookingStatus::Confirmed));
                assert_eq!(filter.kind, Some(SessionKind::Paid));
            }
            _ => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_bookings_unfiltered() {
        let cmd = parse_sql("SELECT * FROM bookings").unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings {
                filter: BookingFilter::default()
            }
        );
    }

    #[test]
    fn parse_bad_status_errors() {
        let sql = "SELECT * FROM bookings WHERE status = 'limbo'";
        assert!(parse_sql(sql).is_err());
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = format!(
            r#"INSERT INTO bookings (id, date, start, "end", kind, owner) VALUES ('{ID}', '2026-09-02', 600, 630, 'free', 'a@b.c'), ('{ID}', '2026-09-02', 660, 690, 'free', 'a@b.c')"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
