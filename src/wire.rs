use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::PasswordAuthSource;
use crate::engine::{BookingRequest, Engine, EngineError, MonthAvailability};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, AppointmentFilter, Command, Shape, SqlError};

pub struct SlotwiseHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> Result<Response, EngineError> {
        let engine = &self.engine;
        let shape = cmd.shape();
        let response = match cmd {
            Command::UpsertService { service } => {
                engine.upsert_service(service).await?;
                tag("INSERT", 1)
            }
            Command::InsertStaff { id, name } => {
                engine.create_staff(id, name).await?;
                tag("INSERT", 1)
            }
            Command::DeleteStaff { id } => {
                engine.remove_staff(id).await?;
                tag("DELETE", 1)
            }
            Command::AssignServices { pairs } => {
                let mut added = 0;
                for (staff_id, service_id) in pairs {
                    added += usize::from(engine.assign_service(staff_id, service_id).await?);
                }
                tag("INSERT", added)
            }
            Command::UnassignService { staff_id, service_id } => {
                let removed = engine.unassign_service(staff_id, service_id).await?;
                tag("DELETE", usize::from(removed))
            }
            Command::SetWorkingHours { staff_id, hours } => {
                engine.set_working_hours(staff_id, hours).await?;
                tag("INSERT", 1)
            }
            Command::InsertTimeOff { id, staff_id, date, start_min, end_min, reason } => {
                engine.add_time_off(id, staff_id, date, start_min, end_min, reason).await?;
                tag("INSERT", 1)
            }
            Command::DeleteTimeOff { id } => {
                engine.remove_time_off(id).await?;
                tag("DELETE", 1)
            }
            Command::Reserve { staff_id, start, end, session_id } => {
                let info = engine.reserve(staff_id, Span { start, end }, &session_id).await?;
                reservation_rows(format, vec![info])
            }
            Command::ReleaseReservation { session_id } => {
                engine.release_reservation(&session_id).await?;
                tag("DELETE", 1)
            }
            Command::BookAppointment { id, staff_id, service_id, start, end, customer, session_id } => {
                let request = BookingRequest {
                    id,
                    staff_id,
                    service_id,
                    span: Span { start, end },
                    customer,
                    session_id,
                };
                engine.book_appointment(request).await?;
                tag("INSERT", 1)
            }
            Command::SetAppointmentStatus { id, status } => {
                engine.set_appointment_status(id, status).await?;
                tag("INSERT", 1)
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await?;
                tag("DELETE", 1)
            }
            Command::SelectAvailability { staff_id, date, demand } => {
                let answer = engine.availability_for_day(staff_id, &demand, date).await?;
                let staff = staff_id.to_string();
                let rows: Vec<Option<Span>> = match answer {
                    DayAvailability::Slots(slots) => slots.into_iter().map(Some).collect(),
                    DayAvailability::SplitRequired => vec![None],
                };
                query_response(Shape::Availability, format, rows, |enc, slot| {
                    enc.encode_field(&staff)?;
                    enc.encode_field(&slot.map(|s| s.start))?;
                    enc.encode_field(&slot.map(|s| s.end))?;
                    enc.encode_field(&slot.is_none())
                })
            }
            Command::SelectMonthAvailability { staff_id, year, month, demand } => {
                let answer = engine.availability_for_month(staff_id, &demand, year, month).await?;
                let staff = staff_id.to_string();
                let rows: Vec<Option<(String, i64)>> = match answer {
                    MonthAvailability::Counts(counts) => counts
                        .into_iter()
                        .map(|(date, n)| Some((date.to_string(), i64::try_from(n).unwrap_or(i64::MAX))))
                        .collect(),
                    MonthAvailability::SplitRequired => vec![None],
                };
                query_response(Shape::MonthAvailability, format, rows, |enc, day| {
                    enc.encode_field(&staff)?;
                    enc.encode_field(&day.as_ref().map(|(date, _)| date.as_str()))?;
                    enc.encode_field(&day.as_ref().map(|(_, n)| *n))?;
                    enc.encode_field(&day.is_none())
                })
            }
            Command::SelectAppointments { filter } => {
                let appointments = match filter {
                    AppointmentFilter::ById(id) => vec![engine.get_appointment(id).await?],
                    AppointmentFilter::ByStaff { staff_id, from, to } => {
                        let within = (from.is_some() || to.is_some()).then(|| Span {
                            start: from.unwrap_or(Ms::MIN),
                            end: to.unwrap_or(Ms::MAX),
                        });
                        engine.list_appointments(staff_id, within).await?
                    }
                };
                query_response(Shape::Appointments, format, appointments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.staff_id.to_string())?;
                    enc.encode_field(&a.service_id.to_string())?;
                    enc.encode_field(&a.customer_id.to_string())?;
                    enc.encode_field(&a.start)?;
                    enc.encode_field(&a.end)?;
                    enc.encode_field(&a.status.as_str())
                })
            }
            Command::SelectReservations { staff_id } => {
                reservation_rows(format, engine.list_reservations(staff_id).await?)
            }
            Command::SelectTimeOff { staff_id } => {
                let entries = engine.list_time_off(staff_id).await?;
                query_response(Shape::TimeOff, format, entries, |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.staff_id.map(|s| s.to_string()))?;
                    enc.encode_field(&t.date.to_string())?;
                    enc.encode_field(&i32::from(t.start_min))?;
                    enc.encode_field(&i32::from(t.end_min))?;
                    enc.encode_field(&t.reason)
                })
            }
            Command::SelectWorkingHours { staff_id } => {
                let rows = engine.working_hours(staff_id).await?;
                let staff = staff_id.to_string();
                query_response(Shape::WorkingHours, format, rows, |enc, h| {
                    enc.encode_field(&staff)?;
                    enc.encode_field(&i32::from(h.weekday))?;
                    enc.encode_field(&i32::from(h.start_min))?;
                    enc.encode_field(&i32::from(h.end_min))?;
                    enc.encode_field(&h.closed)
                })
            }
            Command::SelectServices => query_response(Shape::Services, format, engine.list_services(), |enc, s| {
                enc.encode_field(&s.id.to_string())?;
                enc.encode_field(&s.name)?;
                enc.encode_field(&i64::from(s.duration_min))?;
                enc.encode_field(&s.active)?;
                enc.encode_field(&s.group)
            }),
            Command::SelectStaff => query_response(Shape::Staff, format, engine.list_staff().await, |enc, s| {
                let services: Vec<String> = s.services.iter().map(|id| id.to_string()).collect();
                enc.encode_field(&s.id.to_string())?;
                enc.encode_field(&s.name)?;
                enc.encode_field(&services.join(","))
            }),
        };
        debug_assert_eq!(shape.is_some(), matches!(response, Response::Query(_)));
        Ok(response)
    }
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

fn reservation_rows(format: &Format, reservations: Vec<ReservationInfo>) -> Response {
    query_response(Shape::Reservations, format, reservations, |enc, r| {
        enc.encode_field(&r.id.to_string())?;
        enc.encode_field(&r.staff_id.to_string())?;
        enc.encode_field(&r.session_id)?;
        enc.encode_field(&r.start)?;
        enc.encode_field(&r.end)?;
        enc.encode_field(&r.expires_at)
    })
}

/// Encode `items` as rows of `shape`. Encoding errors surface per row.
fn query_response<T>(
    shape: Shape,
    format: &Format,
    items: Vec<T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(shape, format));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Column names and types per row layout. Instants are INT8 Unix milliseconds.
fn columns(shape: Shape) -> Vec<(&'static str, Type)> {
    match shape {
        Shape::Availability => vec![
            ("staff_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("split_required", Type::BOOL),
        ],
        Shape::MonthAvailability => vec![
            ("staff_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("slots", Type::INT8),
            ("split_required", Type::BOOL),
        ],
        Shape::Appointments => vec![
            ("id", Type::VARCHAR),
            ("staff_id", Type::VARCHAR),
            ("service_id", Type::VARCHAR),
            ("customer_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
        ],
        Shape::Reservations => vec![
            ("id", Type::VARCHAR),
            ("staff_id", Type::VARCHAR),
            ("session_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("expires_at", Type::INT8),
        ],
        Shape::TimeOff => vec![
            ("id", Type::VARCHAR),
            ("staff_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_min", Type::INT4),
            ("end_min", Type::INT4),
            ("reason", Type::VARCHAR),
        ],
        Shape::WorkingHours => vec![
            ("staff_id", Type::VARCHAR),
            ("weekday", Type::INT4),
            ("start_min", Type::INT4),
            ("end_min", Type::INT4),
            ("closed", Type::BOOL),
        ],
        Shape::Services => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("duration_min", Type::INT8),
            ("active", Type::BOOL),
            ("group_name", Type::VARCHAR),
        ],
        Shape::Staff => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("service_ids", Type::VARCHAR),
        ],
    }
}

fn schema(shape: Shape, format: &Format) -> Vec<FieldInfo> {
    columns(shape)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(idx)))
        .collect()
}

fn statement_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::result_shape(sql).map_or_else(Vec::new, |shape| schema(shape, format))
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

/// Statements are kept as SQL text; parameters are bound at execute time.
#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; highest_placeholder(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; highest_placeholder(&target.statement)];
        let fields = statement_schema(&target.statement, &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let fields = statement_schema(&target.statement.statement, &target.result_column_format);
        Ok(DescribePortalResponse::new(fields))
    }
}

/// A piece of statement text: literal SQL, or a `$N` placeholder outside quotes.
#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` at every `$N` that is not inside a single-quoted literal.
fn scan_placeholders(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let (mut i, mut text_start, mut quoted) = (0, 0, false);
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                quoted = !quoted;
                i += 1;
            }
            b'$' if !quoted => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                match sql[i + 1..i + 1 + digits].parse::<usize>() {
                    Ok(n) if n > 0 => {
                        segments.push(Segment::Text(&sql[text_start..i]));
                        segments.push(Segment::Param(n));
                        i += 1 + digits;
                        text_start = i;
                    }
                    _ => i += 1,
                }
            }
            _ => i += 1,
        }
    }
    segments.push(Segment::Text(&sql[text_start..]));
    segments
}

/// Number of parameters a statement takes: its highest `$N`.
fn highest_placeholder(sql: &str) -> usize {
    scan_placeholders(sql)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Param(n) => Some(n),
            Segment::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Substitute `$N` with the bound text parameter as a quoted literal, or NULL.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for segment in scan_placeholders(sql) {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Param(n) => match params.get(n - 1) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                _ => out.push_str("NULL"),
            },
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<PasswordAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotwiseHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotwiseFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_retryable() {
        warn!(error = %e, "transient store failure");
    } else {
        debug!(error = %e, "statement rejected");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
