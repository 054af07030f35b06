use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;
use crate::workflow::PaidReservation;

pub struct BookdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Arc<Engine>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch_command(engine, cmd).await;
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label).increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_command(
        &self,
        engine: &Arc<Engine>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectSettings => {
                let settings = engine.settings().await;
                let schema = Arc::new(settings_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&work_days_string(&settings.work_days))?;
                encoder.encode_field(&(settings.work_start as i64))?;
                encoder.encode_field(&(settings.work_end as i64))?;
                encoder.encode_field(&(settings.buffer_minutes as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::UpdateSettings { settings } => {
                engine
                    .update_settings(settings)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                date,
                span,
                kind,
                owner,
            } => {
                let workflow = self.tenant_manager.workflow(engine.clone());
                match kind {
                    SessionKind::Free => {
                        // The workflow derives the fixed end itself; reject a
                        // client-supplied end that disagrees instead of
                        // silently booking a different interval.
                        if span.end != span.start + crate::slots::FREE_SESSION_MIN {
                            return Err(engine_err(EngineError::Validation(
                                "free sessions are 30 minutes",
                            )));
                        }
                        let booking = workflow
                            .reserve_free(id, date, span.start, owner)
                            .await
                            .map_err(engine_err)?;
                        Ok(vec![booking_response(&[booking])?])
                    }
                    SessionKind::Paid => {
                        let reservation = workflow
                            .reserve_paid(id, date, span, owner)
                            .await
                            .map_err(engine_err)?;
                        Ok(vec![checkout_response(&reservation)?])
                    }
                }
            }
            Command::CancelBooking { id } => {
                engine
                    .cancel_booking(id, "cancelled by client")
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertPaymentCallback {
                correlation_token,
                provider_txn_id,
                status,
            } => {
                let workflow = self.tenant_manager.workflow(engine.clone());
                let success = matches!(status.as_str(), "successful" | "success");
                let booking = workflow
                    .payment_callback(&correlation_token, &provider_txn_id, success)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_response(&[booking])?])
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(&filter).await.map_err(engine_err)?;
                Ok(vec![booking_response(&bookings)?])
            }
            Command::SelectAvailability { from, to } => {
                let blocked = engine.availability(from, to).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut rows = Vec::new();
                for (date, blocks) in &blocked {
                    let date_str = date.to_string();
                    for block in blocks {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&(block.from as i64))?;
                        encoder.encode_field(&(block.to as i64))?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots { date, kind } => {
                let slots = engine.slot_listing(date, kind).await;
                let schema = Arc::new(slots_schema());
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&(slot.start as i64))?;
                        encoder.encode_field(&(slot.end as i64))?;
                        encoder.encode_field(&slot.amount_cents)?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectStats => {
                let stats = engine.stats().await;
                let schema = Arc::new(stats_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.total as i64))?;
                encoder.encode_field(&(stats.free as i64))?;
                encoder.encode_field(&(stats.paid as i64))?;
                encoder.encode_field(&(stats.pending as i64))?;
                encoder.encode_field(&(stats.cancelled as i64))?;
                encoder.encode_field(&stats.revenue_cents)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn work_days_string(days: &[u8]) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("work_days"),
        int8("work_start"),
        int8("work_end"),
        int8("buffer_minutes"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![varchar("date"), int8("from_hour"), int8("to_hour")]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("date"),
        int8("start"),
        int8("end"),
        int8("amount_cents"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("date"),
        int8("start"),
        int8("end"),
        varchar("kind"),
        varchar("owner"),
        varchar("status"),
        varchar("payment_ref"),
        varchar("provider_txn_id"),
        int8("amount_cents"),
        int8("created_at"),
        varchar("cancel_reason"),
    ]
}

fn checkout_schema() -> Vec<FieldInfo> {
    vec![
        varchar("booking_id"),
        varchar("correlation_token"),
        varchar("checkout_link"),
        int8("amount_cents"),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        int8("total"),
        int8("free"),
        int8("paid"),
        int8("pending"),
        int8("cancelled"),
        int8("revenue_cents"),
    ]
}

fn booking_response(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&(b.span.start as i64))?;
            encoder.encode_field(&(b.span.end as i64))?;
            encoder.encode_field(&b.kind.as_str())?;
            encoder.encode_field(&b.owner)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.payment_ref)?;
            encoder.encode_field(&b.provider_txn_id)?;
            encoder.encode_field(&b.amount_cents())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.cancel_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn checkout_response(reservation: &PaidReservation) -> PgWireResult<Response> {
    let schema = Arc::new(checkout_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&reservation.booking.id.to_string())?;
    encoder.encode_field(&reservation.correlation_token)?;
    encoder.encode_field(&reservation.checkout_link)?;
    encoder.encode_field(&reservation.amount_cents)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdQueryParser;

/// Best-effort schema for Describe: parse the statement and map its command.
/// Statements with unbound parameters fall back to an empty schema.
fn describe_schema(stmt: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(stmt) {
        Ok(Command::SelectSettings) => settings_schema(),
        Ok(Command::SelectAvailability { .. }) => availability_schema(),
        Ok(Command::SelectSlots { .. }) => slots_schema(),
        Ok(Command::SelectStats) => stats_schema(),
        Ok(Command::SelectBookings { .. }) | Ok(Command::InsertPaymentCallback { .. }) => {
            bookings_schema()
        }
        Ok(Command::InsertBooking {
            kind: SessionKind::Free,
            ..
        }) => bookings_schema(),
        Ok(Command::InsertBooking {
            kind: SessionKind::Paid,
            ..
        }) => checkout_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl QueryParser for BookdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
                && n > max
            {
                max = n;
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<
            crate::auth::BookdAuthSource,
            DefaultServerParameterProvider,
        >,
    >,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = crate::auth::BookdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BookdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22000",
        EngineError::Conflict { .. } => "23P01", // exclusion_violation
        EngineError::NotFound(_) => "02000",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
