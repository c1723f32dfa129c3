use std::fmt::Debug;
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

use crate::auth::AtriumAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::{Booking, DateKey, Requester, SlotError, TimeRange};
use crate::sql::{self, BookingRow, Command};
use crate::tenant::TenantManager;

/// Per-connection entry point: run the pgwire protocol over the socket with
/// this server's handlers.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = AtriumFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct AtriumHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AtriumQueryParser>,
}

impl AtriumHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AtriumQueryParser),
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
                format!("site error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertBookings { rows, returning } => {
                let (room_id, date, requester, meeting_title, notes, slots) =
                    batch_from_rows(&rows)?;
                let created = engine
                    .commit_bookings(&room_id, date, requester, meeting_title, notes, slots)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(vec![booking_response(created)])
                } else {
                    Ok(vec![Response::Execution(
                        Tag::new("INSERT").with_rows(created.len()),
                    )])
                }
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { room_id, date } => {
                let date = date
                    .as_deref()
                    .map(DateKey::parse)
                    .transpose()
                    .map_err(slot_err)?;
                let bookings = engine
                    .list_bookings(room_id.as_deref(), date.as_ref())
                    .await;
                Ok(vec![booking_response(bookings)])
            }
            Command::SelectConflicts {
                room_id,
                date,
                start_time,
                end_time,
                exclude_id,
            } => {
                let date = DateKey::parse(&date).map_err(slot_err)?;
                let slot = TimeRange::parse(&start_time, &end_time).map_err(slot_err)?;
                let conflict = engine
                    .has_conflict(&room_id, &date, &slot, exclude_id)
                    .await;

                let schema = Arc::new(conflict_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&conflict)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

/// A multi-row INSERT is one commit request: rows differ only in times and
/// must agree on room, date, requester, title, and notes.
#[allow(clippy::type_complexity)]
fn batch_from_rows(
    rows: &[BookingRow],
) -> PgWireResult<(String, DateKey, Requester, String, Option<String>, Vec<TimeRange>)> {
    let first = &rows[0]; // the parser guarantees at least one row
    for row in &rows[1..] {
        let uniform = row.room_id == first.room_id
            && row.date == first.date
            && row.name == first.name
            && row.email == first.email
            && row.department == first.department
            && row.meeting_title == first.meeting_title
            && row.notes == first.notes;
        if !uniform {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "0A000".into(),
                "rows in one INSERT must share room, date, requester, title, and notes".into(),
            ))));
        }
    }

    let date = DateKey::parse(&first.date).map_err(slot_err)?;
    let mut slots = Vec::with_capacity(rows.len());
    for row in rows {
        slots.push(TimeRange::parse(&row.start_time, &row.end_time).map_err(slot_err)?);
    }

    Ok((
        first.room_id.clone(),
        date,
        Requester {
            name: first.name.clone(),
            email: first.email.clone(),
            department: first.department.clone(),
        },
        first.meeting_title.clone(),
        first.notes.clone(),
        slots,
    ))
}

fn booking_schema() -> Vec<FieldInfo> {
    let varchar = |name: &str| {
        FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
    };
    vec![
        varchar("id"),
        varchar("room_id"),
        varchar("date"),
        varchar("start_time"),
        varchar("end_time"),
        varchar("name"),
        varchar("email"),
        varchar("department"),
        varchar("meeting_title"),
        varchar("notes"),
        FieldInfo::new(
            "created_at".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "conflict".into(),
        None,
        None,
        Type::BOOL,
        FieldFormat::Text,
    )]
}

fn booking_response(bookings: Vec<Booking>) -> Response<'static> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id)?;
            encoder.encode_field(&b.date.as_str())?;
            encoder.encode_field(&b.slot.start().as_str())?;
            encoder.encode_field(&b.slot.end().as_str())?;
            encoder.encode_field(&b.requester.name)?;
            encoder.encode_field(&b.requester.email)?;
            encoder.encode_field(&b.requester.department)?;
            encoder.encode_field(&b.meeting_title)?;
            encoder.encode_field(&b.notes)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for AtriumHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(
            crate::observability::QUERY_DURATION_SECONDS,
            "command" => label
        )
        .record(start.elapsed().as_secs_f64());

        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AtriumQueryParser;

#[async_trait]
impl QueryParser for AtriumQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

/// Row schema a statement will produce, from its text alone (for Describe).
fn result_schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("CONFLICTS") {
        conflict_schema()
    } else if upper.contains("SELECT") || upper.contains("RETURNING") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for AtriumHandler {
    type Statement = String;
    type QueryParser = AtriumQueryParser;

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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
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

pub struct AtriumFactory {
    handler: Arc<AtriumHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AtriumAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AtriumFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AtriumAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AtriumHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AtriumFactory {
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

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        // Overlap failures are exclusion-constraint violations to a client.
        EngineError::SlotOccupied { .. } | EngineError::SelfConflict { .. } => "23P01",
        EngineError::InvalidSlot(_) => "22007",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn slot_err(e: SlotError) -> PgWireError {
    engine_err(EngineError::InvalidSlot(e))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
