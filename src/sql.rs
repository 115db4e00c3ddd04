use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        details: VehicleDetails,
    },
    UpdateVehicle {
        id: Ulid,
        patch: VehiclePatch,
    },
    DeleteVehicle {
        id: Ulid,
    },
    SelectVehicles {
        id: Option<Ulid>,
        include_retired: bool,
    },
    InsertCustomer {
        id: Ulid,
        details: CustomerDetails,
    },
    UpdateCustomer {
        id: Ulid,
        patch: CustomerPatch,
    },
    DeleteCustomer {
        id: Ulid,
    },
    SelectCustomers {
        id: Option<Ulid>,
        include_deleted: bool,
    },
    InsertReservation {
        reservation: NewReservation,
    },
    BatchInsertReservations {
        reservations: Vec<NewReservation>,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    SelectPlaceholders,
    SelectSpareCandidates {
        reservation_id: Ulid,
    },
    SelectAvailability {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        kind: ReservationType,
        min_duration: Option<Ms>,
    },
    SelectConflicts {
        vehicle_id: Ulid,
        start: Ms,
        end: Option<Ms>,
        kind: ReservationType,
    },
    SelectAvailableVehicles {
        start: Ms,
        end: Ms,
        kind: ReservationType,
    },
    SelectFleetAvailability {
        start: Ms,
        end: Ms,
        min_available: usize,
        kind: ReservationType,
        min_duration: Option<Ms>,
    },
    SelectCalendar {
        start: Ms,
        end: Ms,
        vehicle_id: Option<Ulid>,
    },
    SelectReminders {
        horizon_days: Option<u32>,
    },
    InsertExpense {
        expense: Expense,
    },
    DeleteExpense {
        id: Ulid,
    },
    SelectExpenses {
        vehicle_id: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
    Checkpoint,
}

// Column order used when an INSERT names no columns.
const VEHICLE_COLUMNS: &[&str] = &["id", "license_plate", "brand", "model", "apk_date", "warranty_end"];
const CUSTOMER_COLUMNS: &[&str] = &["id", "name", "email", "phone"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "vehicle_id",
    "customer_id",
    "start",
    "end",
    "type",
    "status",
    "contract_number",
    "notes",
    "duration_days",
    "maintenance_kind",
];
const EXPENSE_COLUMNS: &[&str] = &["id", "vehicle_id", "amount_cents", "category", "incurred_at", "description"];

// Columns accepted in UPDATE ... SET.
const VEHICLE_UPDATABLE: &[&str] = &["license_plate", "brand", "model", "apk_date", "warranty_end", "status"];
const CUSTOMER_UPDATABLE: &[&str] = &["name", "email", "phone"];
const RESERVATION_UPDATABLE: &[&str] = &["start", "end", "status", "vehicle_id", "maintenance_status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_utility(trimmed) {
        return Ok(cmd);
    }
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }

    let dialect = PostgreSqlDialect {};
    if starts_with_keyword(trimmed, "UPDATE") {
        return parse_update(&dialect, trimmed);
    }

    let stmts = Parser::parse_sql(&dialect, trimmed).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    sql.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && sql[keyword.len()..].starts_with(char::is_whitespace)
}

/// LISTEN / UNLISTEN / CHECKPOINT, which the SQL parser does not model.
fn parse_utility(sql: &str) -> Option<Command> {
    if sql.eq_ignore_ascii_case("CHECKPOINT") {
        return Some(Command::Checkpoint);
    }
    if starts_with_keyword(sql, "LISTEN") {
        let channel = sql["LISTEN".len()..].trim().to_string();
        return Some(Command::Listen { channel });
    }
    if starts_with_keyword(sql, "UNLISTEN") {
        let channel = sql["UNLISTEN".len()..].trim();
        if channel == "*" {
            return Some(Command::UnlistenAll);
        }
        return Some(Command::Unlisten { channel: channel.to_string() });
    }
    None
}

// ── Literals & rows ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Null,
    Text(String),
    Number(String),
    Bool(bool),
}

fn literal(expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::SingleQuotedString(s) => Ok(Literal::Text(s.clone())),
            Value::Number(n, _) => Ok(Literal::Number(n.to_string())),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            other => Err(SqlError::Parse(format!("cannot negate {other:?}"))),
        },
        Expr::Nested(inner) => literal(inner),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

/// Column → literal, from INSERT values, UPDATE assignments or WHERE filters.
#[derive(Debug, Default)]
struct Row {
    values: HashMap<String, Literal>,
}

impl Row {
    fn insert(&mut self, column: String, value: Literal) -> Result<(), SqlError> {
        if self.values.insert(column.clone(), value).is_some() {
            return Err(SqlError::Parse(format!("column {column} given twice")));
        }
        Ok(())
    }

    fn check_columns(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        match self.values.keys().find(|c| !allowed.contains(&c.as_str())) {
            Some(col) => Err(SqlError::UnknownColumn(table.to_string(), col.clone())),
            None => Ok(()),
        }
    }

    fn has(&self, col: &str) -> bool {
        self.values.contains_key(col)
    }

    /// `None` when the column is absent or NULL.
    fn text(&self, col: &str) -> Result<Option<String>, SqlError> {
        match self.values.get(col) {
            None | Some(Literal::Null) => Ok(None),
            Some(Literal::Text(s)) | Some(Literal::Number(s)) => Ok(Some(s.clone())),
            Some(Literal::Bool(b)) => Ok(Some(b.to_string())),
        }
    }

    fn required_text(&self, col: &'static str) -> Result<String, SqlError> {
        self.text(col)?.ok_or(SqlError::MissingValue(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.text(col)?
            .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::BadValue(col, format!("bad ULID: {e}"))))
            .transpose()
    }

    fn required_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(col)?.ok_or(SqlError::MissingValue(col))
    }

    fn i64(&self, col: &'static str) -> Result<Option<i64>, SqlError> {
        self.text(col)?
            .map(|s| s.trim().parse().map_err(|e| SqlError::BadValue(col, format!("{s}: {e}"))))
            .transpose()
    }

    fn required_i64(&self, col: &'static str) -> Result<i64, SqlError> {
        self.i64(col)?.ok_or(SqlError::MissingValue(col))
    }

    fn u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.i64(col)?
            .map(|v| u32::try_from(v).map_err(|_| SqlError::BadValue(col, format!("{v} out of range"))))
            .transpose()
    }

    fn bool(&self, col: &'static str) -> Result<bool, SqlError> {
        match self.values.get(col) {
            None | Some(Literal::Null) => Ok(false),
            Some(Literal::Bool(b)) => Ok(*b),
            Some(Literal::Text(s)) | Some(Literal::Number(s)) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::BadValue(col, format!("bad bool: {s}"))),
            },
        }
    }

    fn parsed<T>(&self, col: &'static str, parse: fn(&str) -> Option<T>) -> Result<Option<T>, SqlError> {
        self.text(col)?
            .map(|s| parse(&s).ok_or_else(|| SqlError::BadValue(col, format!("unknown value {s}"))))
            .transpose()
    }

    fn kind(&self) -> Result<ReservationType, SqlError> {
        Ok(self.parsed("type", ReservationType::parse)?.unwrap_or(ReservationType::Standard))
    }

    /// Patch semantics: absent → `None`, NULL → `Some(None)`.
    fn nullable<T>(
        &self,
        col: &'static str,
        get: impl Fn(&Self) -> Result<Option<T>, SqlError>,
    ) -> Result<Option<Option<T>>, SqlError> {
        if self.has(col) { get(self).map(Some) } else { Ok(None) }
    }

    /// A column that may be updated but never set to NULL.
    fn non_null<T>(
        &self,
        col: &'static str,
        get: impl Fn(&Self) -> Result<Option<T>, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.values.get(col) {
            None => Ok(None),
            Some(Literal::Null) => Err(SqlError::MissingValue(col)),
            Some(_) => get(self),
        }
    }
}

// ── INSERT ───────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = insert_rows(insert)?;

    let (allowed, label) = match table.as_str() {
        "vehicles" => (VEHICLE_COLUMNS, "vehicles"),
        "customers" => (CUSTOMER_COLUMNS, "customers"),
        "reservations" => (RESERVATION_COLUMNS, "reservations"),
        "expenses" => (EXPENSE_COLUMNS, "expenses"),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let rows = rows
        .iter()
        .map(|values| bind_row(label, allowed, &columns, values))
        .collect::<Result<Vec<_>, _>>()?;

    match label {
        "reservations" if rows.len() > 1 => {
            let reservations = rows
                .iter()
                .enumerate()
                .map(|(i, row)| new_reservation(row).map_err(|e| SqlError::Row(i, Box::new(e))))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::BatchInsertReservations { reservations })
        }
        _ if rows.len() > 1 => Err(SqlError::Unsupported(format!("multi-row INSERT into {label}"))),
        "vehicles" => {
            let row = &rows[0];
            Ok(Command::InsertVehicle {
                id: row.required_ulid("id")?,
                details: VehicleDetails {
                    license_plate: row.required_text("license_plate")?,
                    brand: row.text("brand")?,
                    model: row.text("model")?,
                    apk_date: row.i64("apk_date")?,
                    warranty_end: row.i64("warranty_end")?,
                },
            })
        }
        "customers" => {
            let row = &rows[0];
            Ok(Command::InsertCustomer {
                id: row.required_ulid("id")?,
                details: CustomerDetails {
                    name: row.required_text("name")?,
                    email: row.text("email")?,
                    phone: row.text("phone")?,
                },
            })
        }
        "reservations" => Ok(Command::InsertReservation {
            reservation: new_reservation(&rows[0])?,
        }),
        _ => {
            let row = &rows[0];
            Ok(Command::InsertExpense {
                expense: Expense {
                    id: row.required_ulid("id")?,
                    vehicle_id: row.required_ulid("vehicle_id")?,
                    amount_cents: row.required_i64("amount_cents")?,
                    category: row.required_text("category")?,
                    incurred_at: row.required_i64("incurred_at")?,
                    description: row.text("description")?,
                },
            })
        }
    }
}

/// Pair values with their columns: the named list, or the table's default
/// order when none is given.
fn bind_row(table: &str, allowed: &[&str], columns: &[String], values: &[Expr]) -> Result<Row, SqlError> {
    let names: Vec<&str> = if columns.is_empty() {
        if values.len() > allowed.len() {
            return Err(SqlError::WrongArity(table.to_string(), allowed.len(), values.len()));
        }
        allowed[..values.len()].to_vec()
    } else {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table.to_string(), columns.len(), values.len()));
        }
        columns.iter().map(String::as_str).collect()
    };

    let mut row = Row::default();
    for (name, value) in names.into_iter().zip(values) {
        row.insert(name.to_string(), literal(value)?)?;
    }
    row.check_columns(table, allowed)?;
    Ok(row)
}

fn new_reservation(row: &Row) -> Result<NewReservation, SqlError> {
    Ok(NewReservation {
        vehicle_id: row.ulid("vehicle_id")?,
        customer_id: row.ulid("customer_id")?,
        start: row.i64("start")?,
        end: row.i64("end")?,
        status: row.parsed("status", ReservationStatus::parse)?,
        contract_number: row.text("contract_number")?,
        notes: row.text("notes")?,
        duration_days: row.u32("duration_days")?,
        maintenance_kind: row.text("maintenance_kind")?,
        ..NewReservation::new(row.required_ulid("id")?, row.kind()?)
    })
}

// ── UPDATE ───────────────────────────────────────────────────

/// `UPDATE t SET a = 1, b = 2 WHERE …` is parsed as `SELECT a = 1, b = 2 FROM t WHERE …`:
/// each assignment becomes an equality in the projection.
fn parse_update(dialect: &PostgreSqlDialect, sql: &str) -> Result<Command, SqlError> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let keyword_at = |kw: Keyword| {
        tokens
            .iter()
            .position(|t| matches!(t, Token::Word(w) if w.keyword == kw && w.quote_style.is_none()))
    };
    let (Some(update), Some(set)) = (keyword_at(Keyword::UPDATE), keyword_at(Keyword::SET)) else {
        return Err(SqlError::Parse("expected UPDATE <table> SET …".into()));
    };
    let filter = keyword_at(Keyword::WHERE).ok_or(SqlError::MissingFilter("id"))?;
    if !(update < set && set < filter) {
        return Err(SqlError::Parse("expected UPDATE <table> SET … WHERE …".into()));
    }

    let join = |toks: &[Token]| toks.iter().map(|t| t.to_string()).collect::<String>();
    let rewritten = format!(
        "SELECT {} FROM {} WHERE {}",
        join(&tokens[set + 1..filter]),
        join(&tokens[update + 1..set]),
        join(&tokens[filter + 1..]),
    );
    let stmts = Parser::parse_sql(dialect, &rewritten).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return Err(SqlError::Parse("malformed UPDATE".into()));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Parse("malformed UPDATE".into()));
    };

    let table = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("UPDATE without table".into()))
        .and_then(|t| table_factor_name(&t.relation))?;
    let id = extract_where_id(&select.selection)?;

    let mut set_row = Row::default();
    for item in &select.projection {
        let SelectItem::UnnamedExpr(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) = item
        else {
            return Err(SqlError::Parse(format!("bad assignment: {item}")));
        };
        let column = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("bad assignment target: {left}")))?;
        set_row.insert(column, literal(right)?)?;
    }

    match table.as_str() {
        "vehicles" => {
            set_row.check_columns("vehicles", VEHICLE_UPDATABLE)?;
            let patch = VehiclePatch {
                license_plate: set_row.non_null("license_plate", |r| r.text("license_plate"))?,
                brand: set_row.nullable("brand", |r| r.text("brand"))?,
                model: set_row.nullable("model", |r| r.text("model"))?,
                apk_date: set_row.nullable("apk_date", |r| r.i64("apk_date"))?,
                warranty_end: set_row.nullable("warranty_end", |r| r.i64("warranty_end"))?,
                status: set_row.non_null("status", |r| r.parsed("status", VehicleStatus::parse))?,
            };
            Ok(Command::UpdateVehicle { id, patch })
        }
        "customers" => {
            set_row.check_columns("customers", CUSTOMER_UPDATABLE)?;
            let patch = CustomerPatch {
                name: set_row.non_null("name", |r| r.text("name"))?,
                email: set_row.nullable("email", |r| r.text("email"))?,
                phone: set_row.nullable("phone", |r| r.text("phone"))?,
            };
            Ok(Command::UpdateCustomer { id, patch })
        }
        "reservations" => {
            set_row.check_columns("reservations", RESERVATION_UPDATABLE)?;
            let patch = ReservationPatch {
                start: set_row.non_null("start", |r| r.i64("start"))?,
                end: set_row.nullable("end", |r| r.i64("end"))?,
                status: set_row.non_null("status", |r| r.parsed("status", ReservationStatus::parse))?,
                vehicle_id: set_row.non_null("vehicle_id", |r| r.ulid("vehicle_id"))?,
                maintenance_status: set_row.non_null("maintenance_status", |r| {
                    r.parsed("maintenance_status", MaintenanceProgress::parse)
                })?,
            };
            Ok(Command::UpdateReservation { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ───────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        "customers" => Ok(Command::DeleteCustomer { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        "expenses" => Ok(Command::DeleteExpense { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ───────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let table = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))
        .and_then(|t| table_factor_name(&t.relation))?;

    let mut filters = Row::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "vehicles" => {
            filters.check_columns(&table, &["id", "include_retired"])?;
            Ok(Command::SelectVehicles {
                id: filters.ulid("id")?,
                include_retired: filters.bool("include_retired")?,
            })
        }
        "customers" => {
            filters.check_columns(&table, &["id", "include_deleted"])?;
            Ok(Command::SelectCustomers {
                id: filters.ulid("id")?,
                include_deleted: filters.bool("include_deleted")?,
            })
        }
        "reservations" => {
            filters.check_columns(&table, &["id", "vehicle_id", "customer_id", "include_deleted"])?;
            Ok(Command::SelectReservations {
                id: filters.ulid("id")?,
                filter: ReservationFilter {
                    vehicle_id: filters.ulid("vehicle_id")?,
                    customer_id: filters.ulid("customer_id")?,
                    include_deleted: filters.bool("include_deleted")?,
                },
            })
        }
        "placeholders" => {
            filters.check_columns(&table, &[])?;
            Ok(Command::SelectPlaceholders)
        }
        "spare_candidates" => {
            filters.check_columns(&table, &["reservation_id"])?;
            Ok(Command::SelectSpareCandidates {
                reservation_id: filters.ulid("reservation_id")?.ok_or(SqlError::MissingFilter("reservation_id"))?,
            })
        }
        "availability" => {
            filters.check_columns(&table, &["vehicle_id", "start", "end", "type", "min_duration"])?;
            Ok(Command::SelectAvailability {
                vehicle_id: required_filter(filters.ulid("vehicle_id")?, "vehicle_id")?,
                start: required_filter(filters.i64("start")?, "start")?,
                end: required_filter(filters.i64("end")?, "end")?,
                kind: filters.kind()?,
                min_duration: filters.i64("min_duration")?,
            })
        }
        "conflicts" => {
            filters.check_columns(&table, &["vehicle_id", "start", "end", "type"])?;
            Ok(Command::SelectConflicts {
                vehicle_id: required_filter(filters.ulid("vehicle_id")?, "vehicle_id")?,
                start: required_filter(filters.i64("start")?, "start")?,
                end: filters.i64("end")?,
                kind: filters.kind()?,
            })
        }
        "available_vehicles" => {
            filters.check_columns(&table, &["start", "end", "type"])?;
            Ok(Command::SelectAvailableVehicles {
                start: required_filter(filters.i64("start")?, "start")?,
                end: required_filter(filters.i64("end")?, "end")?,
                kind: filters.kind()?,
            })
        }
        "fleet_availability" => {
            filters.check_columns(&table, &["start", "end", "min_available", "type", "min_duration"])?;
            let min_available = required_filter(filters.u32("min_available")?, "min_available")?;
            Ok(Command::SelectFleetAvailability {
                start: required_filter(filters.i64("start")?, "start")?,
                end: required_filter(filters.i64("end")?, "end")?,
                min_available: min_available as usize,
                kind: filters.kind()?,
                min_duration: filters.i64("min_duration")?,
            })
        }
        "calendar" => {
            filters.check_columns(&table, &["start", "end", "vehicle_id"])?;
            Ok(Command::SelectCalendar {
                start: required_filter(filters.i64("start")?, "start")?,
                end: required_filter(filters.i64("end")?, "end")?,
                vehicle_id: filters.ulid("vehicle_id")?,
            })
        }
        "reminders" => {
            filters.check_columns(&table, &["horizon_days"])?;
            Ok(Command::SelectReminders {
                horizon_days: filters.u32("horizon_days")?,
            })
        }
        "expenses" => {
            filters.check_columns(&table, &["vehicle_id"])?;
            Ok(Command::SelectExpenses {
                vehicle_id: filters.ulid("vehicle_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn required_filter<T>(value: Option<T>, col: &'static str) -> Result<T, SqlError> {
    value.ok_or(SqlError::MissingFilter(col))
}

/// Flatten an AND-chain of `column <op> literal`. `start` takes `>=`, `end`
/// takes `<=`, every other column `=`.
fn collect_filters(expr: &Expr, filters: &mut Row) -> Result<(), SqlError> {
    use ast::BinaryOperator as Op;
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op: Op::And, right } => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            let expected = match column.as_str() {
                "start" => Op::GtEq,
                "end" => Op::LtEq,
                _ => Op::Eq,
            };
            if *op != expected {
                return Err(SqlError::Unsupported(format!("filter {expr}")));
            }
            filters.insert(column, literal(right)?)
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let mut filters = Row::default();
    if let Some(sel) = selection {
        collect_filters(sel, &mut filters)?;
    }
    filters.check_columns("WHERE", &["id"])?;
    filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String, String),
    WrongArity(String, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    BadValue(&'static str, String),
    Row(usize, Box<SqlError>),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value for {col}"),
            SqlError::BadValue(col, msg) => write!(f, "bad value for {col}: {msg}"),
            SqlError::Row(i, e) => write!(f, "row {i}: {e}"),
        }
    }
}

impl std::error::Error for SqlError {}
