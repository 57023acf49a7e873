use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{CustomerDetails, Demand};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertService {
        service: Service,
    },
    InsertStaff {
        id: Ulid,
        name: Option<String>,
    },
    DeleteStaff {
        id: Ulid,
    },
    /// `(staff_id, service_id)` pairs, one per VALUES row.
    AssignServices {
        pairs: Vec<(Ulid, Ulid)>,
    },
    UnassignService {
        staff_id: Ulid,
        service_id: Ulid,
    },
    SetWorkingHours {
        staff_id: Ulid,
        hours: WorkingHours,
    },
    InsertTimeOff {
        id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
        start_min: u16,
        end_min: u16,
        reason: Option<String>,
    },
    DeleteTimeOff {
        id: Ulid,
    },
    Reserve {
        staff_id: Ulid,
        start: Ms,
        end: Ms,
        session_id: String,
    },
    ReleaseReservation {
        session_id: String,
    },
    BookAppointment {
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        start: Ms,
        end: Ms,
        customer: CustomerDetails,
        session_id: Option<String>,
    },
    SetAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectAvailability {
        staff_id: Ulid,
        date: NaiveDate,
        demand: Demand,
    },
    SelectMonthAvailability {
        staff_id: Ulid,
        year: i32,
        month: u32,
        demand: Demand,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectReservations {
        staff_id: Ulid,
    },
    /// `None` lists organisation-wide time-off.
    SelectTimeOff {
        staff_id: Option<Ulid>,
    },
    SelectWorkingHours {
        staff_id: Ulid,
    },
    SelectServices,
    SelectStaff,
}

#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    ById(Ulid),
    /// Appointments of one staff member, optionally only those overlapping `[from, to)`.
    ByStaff {
        staff_id: Ulid,
        from: Option<Ms>,
        to: Option<Ms>,
    },
}

/// Row layout of a statement that returns rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Availability,
    MonthAvailability,
    Appointments,
    Reservations,
    TimeOff,
    WorkingHours,
    Services,
    Staff,
}

impl Shape {
    fn of_table(table: &str) -> Option<Shape> {
        Some(match table {
            "availability" => Shape::Availability,
            "month_availability" => Shape::MonthAvailability,
            "appointments" => Shape::Appointments,
            "reservations" => Shape::Reservations,
            "time_off" => Shape::TimeOff,
            "working_hours" => Shape::WorkingHours,
            "services" => Shape::Services,
            "staff" => Shape::Staff,
            _ => return None,
        })
    }
}

impl Command {
    /// `None` for statements answered with a command tag only.
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Command::Reserve { .. } | Command::SelectReservations { .. } => Some(Shape::Reservations),
            Command::SelectAvailability { .. } => Some(Shape::Availability),
            Command::SelectMonthAvailability { .. } => Some(Shape::MonthAvailability),
            Command::SelectAppointments { .. } => Some(Shape::Appointments),
            Command::SelectTimeOff { .. } => Some(Shape::TimeOff),
            Command::SelectWorkingHours { .. } => Some(Shape::WorkingHours),
            Command::SelectServices => Some(Shape::Services),
            Command::SelectStaff => Some(Shape::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

fn bad(msg: impl Into<String>) -> SqlError {
    SqlError::Parse(msg.into())
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| bad(e.to_string()))?;
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

/// Row layout of `sql` judged from its statement kind and table only, so
/// `$N` placeholders are fine. Used to describe prepared statements.
pub fn result_shape(sql: &str) -> Option<Shape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => Shape::of_table(&select_parts(query).ok()?.0),
        Statement::Insert(insert) if insert_table_name(insert).ok()? == "reservations" => Some(Shape::Reservations),
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

const SERVICE_COLUMNS: &[&str] = &["id", "name", "duration_min", "active", "group_name"];
const STAFF_COLUMNS: &[&str] = &["id", "name"];
const STAFF_SERVICE_COLUMNS: &[&str] = &["staff_id", "service_id"];
const HOURS_COLUMNS: &[&str] = &["staff_id", "weekday", "start_min", "end_min", "closed"];
const TIME_OFF_COLUMNS: &[&str] = &["id", "staff_id", "date", "start_min", "end_min", "reason"];
const RESERVATION_COLUMNS: &[&str] = &["staff_id", "start", "end", "session_id"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "staff_id",
    "service_id",
    "start",
    "end",
    "customer_name",
    "customer_email",
    "customer_phone",
    "session_id",
];
const STATUS_COLUMNS: &[&str] = &["appointment_id", "status"];

/// Writable tables and the column order assumed when an INSERT names none.
fn writable_table(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "services" => ("services", SERVICE_COLUMNS),
        "staff" => ("staff", STAFF_COLUMNS),
        "staff_services" => ("staff_services", STAFF_SERVICE_COLUMNS),
        "working_hours" => ("working_hours", HOURS_COLUMNS),
        "time_off" => ("time_off", TIME_OFF_COLUMNS),
        "reservations" => ("reservations", RESERVATION_COLUMNS),
        "appointments" => ("appointments", APPOINTMENT_COLUMNS),
        "appointment_status" => ("appointment_status", STATUS_COLUMNS),
        _ => return None,
    })
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.values.get(pos)
    }

    fn req(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn opt_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        Ok(self.get(column).map(parse_opt_string).transpose()?.flatten())
    }

    fn opt_bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        self.get(column).map(parse_bool).transpose()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let (table, defaults) = writable_table(&name).ok_or(SqlError::UnknownTable(name))?;
    let named = !insert.columns.is_empty();
    let columns: Vec<String> = if named {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    } else {
        defaults.iter().map(|c| c.to_string()).collect()
    };

    let values = insert_rows(insert)?;
    for row in values {
        // Without a column list trailing optional columns may be left out.
        if row.len() > columns.len() || (named && row.len() != columns.len()) {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
    }
    let rows: Vec<Row> = values
        .iter()
        .map(|row| Row { table, columns: &columns, values: row })
        .collect();

    if table == "staff_services" {
        let pairs = rows
            .iter()
            .map(|r| Ok((parse_ulid(r.req("staff_id")?)?, parse_ulid(r.req("service_id")?)?)))
            .collect::<Result<Vec<_>, SqlError>>()?;
        return Ok(Command::AssignServices { pairs });
    }
    let [r] = rows.as_slice() else {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    };

    let cmd = match table {
        "services" => Command::UpsertService {
            service: Service {
                id: parse_ulid(r.req("id")?)?,
                name: parse_string(r.req("name")?)?,
                duration_min: parse_int(r.req("duration_min")?)?,
                active: r.opt_bool("active")?.unwrap_or(true),
                group: r.opt_string("group_name")?,
            },
        },
        "staff" => Command::InsertStaff {
            id: parse_ulid(r.req("id")?)?,
            name: r.opt_string("name")?,
        },
        "working_hours" => Command::SetWorkingHours {
            staff_id: parse_ulid(r.req("staff_id")?)?,
            hours: WorkingHours {
                weekday: parse_int(r.req("weekday")?)?,
                start_min: parse_int(r.req("start_min")?)?,
                end_min: parse_int(r.req("end_min")?)?,
                closed: r.opt_bool("closed")?.unwrap_or(false),
            },
        },
        "time_off" => Command::InsertTimeOff {
            id: parse_ulid(r.req("id")?)?,
            staff_id: r.get("staff_id").map(parse_opt_ulid).transpose()?.flatten(),
            date: parse_date(r.req("date")?)?,
            start_min: parse_int(r.req("start_min")?)?,
            end_min: parse_int(r.req("end_min")?)?,
            reason: r.opt_string("reason")?,
        },
        "reservations" => Command::Reserve {
            staff_id: parse_ulid(r.req("staff_id")?)?,
            start: parse_i64(r.req("start")?)?,
            end: parse_i64(r.req("end")?)?,
            session_id: parse_string(r.req("session_id")?)?,
        },
        "appointments" => Command::BookAppointment {
            id: parse_ulid(r.req("id")?)?,
            staff_id: parse_ulid(r.req("staff_id")?)?,
            service_id: parse_ulid(r.req("service_id")?)?,
            start: parse_i64(r.req("start")?)?,
            end: parse_i64(r.req("end")?)?,
            customer: CustomerDetails {
                name: parse_string(r.req("customer_name")?)?,
                email: r.opt_string("customer_email")?,
                phone: r.opt_string("customer_phone")?,
            },
            session_id: r.opt_string("session_id")?,
        },
        "appointment_status" => Command::SetAppointmentStatus {
            id: parse_ulid(r.req("appointment_id")?)?,
            status: parse_string(r.req("status")?)?.parse().map_err(bad)?,
        },
        other => return Err(SqlError::UnknownTable(other.to_string())),
    };
    Ok(cmd)
}

// ── WHERE ─────────────────────────────────────────────────────

/// `column <op> value` conjuncts of a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left).ok_or_else(|| bad(format!("expected column, got {left}")))?;
                self.terms.push((column, op.clone(), right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        }
    }

    fn find(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, value)| *value)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, BinaryOperator::Eq)
    }

    fn req_eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(column))
    }

    /// `duration_min = N` or `service_ids = 'id,id'`.
    fn demand(&self) -> Result<Demand, SqlError> {
        if let Some(min) = self.eq("duration_min") {
            return Ok(Demand::Minutes(parse_i64(min)?));
        }
        let ids = self
            .eq("service_ids")
            .ok_or(SqlError::MissingFilter("duration_min or service_ids"))?;
        let ids = parse_string(ids)?
            .split(',')
            .map(|s| Ulid::from_string(s.trim()).map_err(|e| bad(format!("bad ULID in service_ids: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Demand::Services(ids))
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "staff" => Ok(Command::DeleteStaff { id: parse_ulid(filters.req_eq("id")?)? }),
        "staff_services" => Ok(Command::UnassignService {
            staff_id: parse_ulid(filters.req_eq("staff_id")?)?,
            service_id: parse_ulid(filters.req_eq("service_id")?)?,
        }),
        "time_off" => Ok(Command::DeleteTimeOff { id: parse_ulid(filters.req_eq("id")?)? }),
        "reservations" => Ok(Command::ReleaseReservation {
            session_id: parse_string(filters.req_eq("session_id")?)?,
        }),
        "appointments" => Ok(Command::DeleteAppointment { id: parse_ulid(filters.req_eq("id")?)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn select_parts(query: &ast::Query) -> Result<(String, Option<&Expr>), SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let from = select.from.first().ok_or_else(|| bad("SELECT without FROM"))?;
    Ok((table_factor_name(&from.relation)?, select.selection.as_ref()))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let (table, selection) = select_parts(query)?;
    let filters = Filters::from_selection(selection)?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            staff_id: parse_ulid(filters.req_eq("staff_id")?)?,
            date: parse_date(filters.req_eq("date")?)?,
            demand: filters.demand()?,
        }),
        "month_availability" => {
            let (year, month) = parse_month(filters.req_eq("month")?)?;
            Ok(Command::SelectMonthAvailability {
                staff_id: parse_ulid(filters.req_eq("staff_id")?)?,
                year,
                month,
                demand: filters.demand()?,
            })
        }
        "appointments" => {
            let filter = match filters.eq("id") {
                Some(id) => AppointmentFilter::ById(parse_ulid(id)?),
                None => AppointmentFilter::ByStaff {
                    staff_id: parse_ulid(filters.req_eq("staff_id")?)?,
                    from: filters.find("end", BinaryOperator::Gt).map(parse_i64).transpose()?,
                    to: filters.find("start", BinaryOperator::Lt).map(parse_i64).transpose()?,
                },
            };
            Ok(Command::SelectAppointments { filter })
        }
        "reservations" => Ok(Command::SelectReservations {
            staff_id: parse_ulid(filters.req_eq("staff_id")?)?,
        }),
        "time_off" => Ok(Command::SelectTimeOff {
            staff_id: filters.eq("staff_id").map(parse_opt_ulid).transpose()?.flatten(),
        }),
        "working_hours" => Ok(Command::SelectWorkingHours {
            staff_id: parse_ulid(filters.req_eq("staff_id")?)?,
        }),
        "services" => Ok(Command::SelectServices),
        "staff" => Ok(Command::SelectStaff),
        _ => Err(SqlError::UnknownTable(table)),
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
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| bad("empty table name")),
        _ => Err(bad("unsupported table object in INSERT")),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    let first = tables.first().ok_or_else(|| bad("DELETE without table"))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| bad("empty table name")),
        _ => Err(bad("complex table expression")),
    }
}

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let source = insert.source.as_ref().ok_or_else(|| bad("no VALUES"))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(bad("empty VALUES")),
        _ => Err(bad("expected VALUES")),
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

/// Literal text of a string or number, `None` for NULL.
fn literal_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(bad(format!("unexpected literal {other}"))),
        None => match expr {
            Expr::UnaryOp { op: UnaryOperator::Minus, expr } => {
                let inner = literal_text(expr)?.ok_or_else(|| bad("cannot negate NULL"))?;
                Ok(Some(format!("-{inner}")))
            }
            _ => Err(bad(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    literal_text(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr)?.ok_or_else(|| bad("unexpected NULL"))
}

fn parse_opt_ulid(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    literal_text(expr)?
        .map(|s| Ulid::from_string(s.trim()).map_err(|e| bad(format!("bad ULID: {e}"))))
        .transpose()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_opt_ulid(expr)?.ok_or_else(|| bad("expected ULID, got NULL"))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_string(expr)?
        .trim()
        .parse()
        .map_err(|e| bad(format!("bad integer: {e}")))
}

/// Integer narrowed to the column's type.
fn parse_int<T: TryFrom<i64>>(expr: &Expr) -> Result<T, SqlError> {
    let v = parse_i64(expr)?;
    T::try_from(v).map_err(|_| bad(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    let text = parse_string(expr)?;
    match text.trim().to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(bad(format!("bad bool: {text}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_string(expr)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|e| bad(format!("bad date {text}: {e}")))
}

/// `'YYYY-MM'`.
fn parse_month(expr: &Expr) -> Result<(i32, u32), SqlError> {
    let text = parse_string(expr)?;
    let (y, m) = text.trim().split_once('-').ok_or_else(|| bad(format!("bad month {text}")))?;
    let year = y.parse().map_err(|_| bad(format!("bad month {text}")))?;
    let month = m.parse().map_err(|_| bad(format!("bad month {text}")))?;
    Ok((year, month))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const STAFF: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const SERVICE: &str = "01BX5ZZKBKACTAV9WEVGEMMVRY";

    fn staff() -> Ulid {
        Ulid::from_string(STAFF).unwrap()
    }

    fn service() -> Ulid {
        Ulid::from_string(SERVICE).unwrap()
    }

    #[test]
    fn insert_service_with_defaults() {
        let sql = format!("INSERT INTO services (id, name, duration_min) VALUES ('{SERVICE}', 'Haircut', 30)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpsertService {
                service: Service { id: service(), name: "Haircut".into(), duration_min: 30, active: true, group: None },
            }
        );
    }

    #[test]
    fn insert_service_positional_with_group() {
        let sql = format!("INSERT INTO services VALUES ('{SERVICE}', 'Color', 45, false, 'hair')");
        let Command::UpsertService { service } = parse_sql(&sql).unwrap() else {
            panic!("expected UpsertService");
        };
        assert!(!service.active);
        assert_eq!(service.group.as_deref(), Some("hair"));
    }

    #[test]
    fn insert_staff_name_is_optional() {
        let sql = format!("INSERT INTO staff (id) VALUES ('{STAFF}')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::InsertStaff { id: staff(), name: None });
        let sql = format!("INSERT INTO staff (id, name) VALUES ('{STAFF}', 'Ana')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::InsertStaff { id: staff(), name: Some("Ana".into()) });
    }

    #[test]
    fn staff_services_accepts_many_rows() {
        let sql = format!(
            "INSERT INTO staff_services (staff_id, service_id) VALUES ('{STAFF}', '{SERVICE}'), ('{STAFF}', '{STAFF}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::AssignServices { pairs: vec![(staff(), service()), (staff(), staff())] }
        );
    }

    #[test]
    fn unassign_needs_both_keys() {
        let sql = format!("DELETE FROM staff_services WHERE staff_id = '{STAFF}' AND service_id = '{SERVICE}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UnassignService { staff_id: staff(), service_id: service() }
        );
        let sql = format!("DELETE FROM staff_services WHERE staff_id = '{STAFF}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("service_id"))));
    }

    #[test]
    fn working_hours_row() {
        let sql = format!(
            "INSERT INTO working_hours (staff_id, weekday, start_min, end_min, closed) VALUES ('{STAFF}', 2, 540, 1080, false)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetWorkingHours {
                staff_id: staff(),
                hours: WorkingHours { weekday: 2, start_min: 540, end_min: 1080, closed: false },
            }
        );
    }

    #[test]
    fn organisation_time_off_has_null_staff() {
        let sql = format!(
            "INSERT INTO time_off (id, staff_id, date, start_min, end_min, reason) VALUES ('{SERVICE}', NULL, '2027-03-02', 780, 840, 'team meeting')"
        );
        let Command::InsertTimeOff { staff_id, date, start_min, reason, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertTimeOff");
        };
        assert_eq!(staff_id, None);
        assert_eq!(date, NaiveDate::from_ymd_opt(2027, 3, 2).unwrap());
        assert_eq!(start_min, 780);
        assert_eq!(reason.as_deref(), Some("team meeting"));
    }

    #[test]
    fn reserve_and_release() {
        let sql = format!(
            r#"INSERT INTO reservations (staff_id, start, "end", session_id) VALUES ('{STAFF}', 1000, 2000, 'cart-7')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(cmd.shape(), Some(Shape::Reservations));
        assert_eq!(
            cmd,
            Command::Reserve { staff_id: staff(), start: 1000, end: 2000, session_id: "cart-7".into() }
        );
        assert_eq!(
            parse_sql("DELETE FROM reservations WHERE session_id = 'cart-7'").unwrap(),
            Command::ReleaseReservation { session_id: "cart-7".into() }
        );
    }

    #[test]
    fn book_with_customer_details_and_session() {
        let sql = format!(
            r#"INSERT INTO appointments (id, staff_id, service_id, start, "end", customer_name, customer_email, customer_phone, session_id)
               VALUES ('{SERVICE}', '{STAFF}', '{SERVICE}', 1000, 2000, 'Bo', 'bo@example.com', NULL, 'cart-7')"#
        );
        let Command::BookAppointment { customer, session_id, start, end, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected BookAppointment");
        };
        assert_eq!((start, end), (1000, 2000));
        assert_eq!(customer.name, "Bo");
        assert_eq!(customer.email.as_deref(), Some("bo@example.com"));
        assert_eq!(customer.phone, None);
        assert_eq!(session_id.as_deref(), Some("cart-7"));
    }

    #[test]
    fn status_change_parses_status_name() {
        let sql = format!("INSERT INTO appointment_status (appointment_id, status) VALUES ('{SERVICE}', 'canceled')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetAppointmentStatus { id: service(), status: AppointmentStatus::Canceled }
        );
        let sql = format!("INSERT INTO appointment_status (appointment_id, status) VALUES ('{SERVICE}', 'later')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[rstest]
    #[case("staff", "DELETE FROM staff WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'")]
    #[case("time_off", "DELETE FROM time_off WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'")]
    #[case("appointments", "DELETE FROM appointments WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'")]
    fn delete_by_id(#[case] table: &str, #[case] sql: &str) {
        let expected = match table {
            "staff" => Command::DeleteStaff { id: staff() },
            "time_off" => Command::DeleteTimeOff { id: staff() },
            _ => Command::DeleteAppointment { id: staff() },
        };
        assert_eq!(parse_sql(sql).unwrap(), expected);
    }

    #[test]
    fn availability_by_duration_or_services() {
        let sql = format!("SELECT * FROM availability WHERE staff_id = '{STAFF}' AND date = '2027-03-02' AND duration_min = 30");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                staff_id: staff(),
                date: NaiveDate::from_ymd_opt(2027, 3, 2).unwrap(),
                demand: Demand::Minutes(30),
            }
        );

        let sql = format!(
            "SELECT * FROM availability WHERE staff_id = '{STAFF}' AND (date = '2027-03-02' AND service_ids = '{SERVICE}, {STAFF}')"
        );
        let Command::SelectAvailability { demand, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected SelectAvailability");
        };
        assert_eq!(demand, Demand::Services(vec![service(), staff()]));

        let sql = format!("SELECT * FROM availability WHERE staff_id = '{STAFF}' AND date = '2027-03-02'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter(_))));
    }

    #[test]
    fn month_availability() {
        let sql = format!("SELECT * FROM month_availability WHERE staff_id = '{STAFF}' AND month = '2027-03' AND duration_min = 45");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectMonthAvailability { staff_id: staff(), year: 2027, month: 3, demand: Demand::Minutes(45) }
        );
        let sql = format!("SELECT * FROM month_availability WHERE staff_id = '{STAFF}' AND month = 'March' AND duration_min = 45");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn appointment_listing_filters() {
        let sql = format!(r#"SELECT * FROM appointments WHERE staff_id = '{STAFF}' AND "end" > 1000 AND start < 2000"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAppointments {
                filter: AppointmentFilter::ByStaff { staff_id: staff(), from: Some(1000), to: Some(2000) },
            }
        );
        let sql = format!("SELECT * FROM appointments WHERE id = '{SERVICE}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAppointments { filter: AppointmentFilter::ById(service()) }
        );
    }

    #[test]
    fn time_off_listing_defaults_to_organisation() {
        assert_eq!(parse_sql("SELECT * FROM time_off").unwrap(), Command::SelectTimeOff { staff_id: None });
        let sql = format!("SELECT * FROM time_off WHERE staff_id = '{STAFF}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectTimeOff { staff_id: Some(staff()) });
    }

    #[rstest]
    #[case("SELECT * FROM services", Command::SelectServices)]
    #[case("SELECT * FROM staff", Command::SelectStaff)]
    fn catalog_listings(#[case] sql: &str, #[case] expected: Command) {
        assert_eq!(parse_sql(sql).unwrap(), expected);
    }

    #[rstest]
    #[case("SELECT * FROM availability WHERE staff_id = $1 AND date = $2 AND duration_min = $3", Some(Shape::Availability))]
    #[case(r#"INSERT INTO reservations (staff_id, start, "end", session_id) VALUES ($1, $2, $3, $4)"#, Some(Shape::Reservations))]
    #[case("DELETE FROM appointments WHERE id = $1", None)]
    #[case("not sql at all", None)]
    fn shapes_of_prepared_statements(#[case] sql: &str, #[case] expected: Option<Shape>) {
        assert_eq!(result_shape(sql), expected);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("INSERT INTO foobar (id) VALUES (1)"), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("INSERT INTO staff (id) VALUES ('not-a-ulid')"), Err(SqlError::Parse(_))));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO staff (id, name) VALUES ('{STAFF}')")),
            Err(SqlError::WrongArity("staff", 2, 1))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO working_hours (staff_id, weekday, start_min, end_min) VALUES ('{STAFF}', 2, -5, 60)")),
            Err(SqlError::Parse(_))
        ));
        assert!(matches!(parse_sql("UPDATE staff SET name = 'x'"), Err(SqlError::Unsupported(_))));
    }
}
