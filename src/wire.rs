use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::FleetDeskAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::notify;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = FleetDeskFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Query handler of a single connection. Holds the connection's LISTEN
/// subscriptions, keyed by vehicle.
pub struct FleetDeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FleetDeskQueryParser>,
    listeners: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl FleetDeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FleetDeskQueryParser),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn tenant_name<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }

    fn resolve_engine(&self, tenant: &str) -> PgWireResult<Arc<Engine>> {
        self.tenant_manager.get_or_create(tenant).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement, then hand any
    /// pending notifications to the client ahead of the response.
    async fn run_statement<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = Self::tenant_name(client);
        let engine = self.resolve_engine(&tenant)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&tenant, &engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        self.flush_notifications(client).await?;
        result
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for (channel, payload) in self.drain_notifications().await {
            let message = NotificationResponse::new(0, channel, payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }

    async fn drain_notifications(&self) -> Vec<(String, String)> {
        let mut listeners = self.listeners.lock().await;
        let mut pending = Vec::new();
        for (vehicle_id, rx) in listeners.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        pending.push((notify::channel_name(*vehicle_id), notify::payload(&event)))
                    }
                    Err(TryRecvError::Lagged(missed)) => {
                        tracing::warn!("listener on vehicle {vehicle_id} missed {missed} events");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        pending
    }

    async fn execute_command(
        &self,
        tenant: &str,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            // ── Vehicles ─────────────────────────────────────
            Command::InsertVehicle { id, details } => {
                engine.register_vehicle(id, details).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateVehicle { id, patch } => {
                engine.update_vehicle(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteVehicle { id } => {
                engine.retire_vehicle(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectVehicles { id, include_retired } => {
                let vehicles = match id {
                    Some(id) => found(engine.vehicle_info(id).await)?,
                    None => engine.list_vehicles(include_retired).await,
                };
                Ok(vehicle_rows(vehicles))
            }

            // ── Customers ────────────────────────────────────
            Command::InsertCustomer { id, details } => {
                engine.create_customer(id, details).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateCustomer { id, patch } => {
                engine.update_customer(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteCustomer { id } => {
                engine.delete_customer(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectCustomers { id, include_deleted } => {
                let customers = match id {
                    Some(id) => found(engine.get_customer(id))?,
                    None => engine.list_customers(include_deleted),
                };
                Ok(customer_rows(customers))
            }

            // ── Reservations ─────────────────────────────────
            Command::InsertReservation { reservation } => {
                let placeholders = engine
                    .create_reservation(reservation)
                    .await
                    .map_err(engine_err)?;
                if !placeholders.is_empty() {
                    tracing::info!("{} placeholder spare(s) created", placeholders.len());
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertReservations { reservations } => {
                let count = reservations.len();
                engine
                    .batch_create_reservations(reservations)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::UpdateReservation { id, patch } => {
                engine.update_reservation(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { id, filter } => {
                let reservations = match id {
                    Some(id) => found(engine.get_reservation(id).await)?
                        .into_iter()
                        .filter(|r| filter.include_deleted || r.deleted_at.is_none())
                        .collect(),
                    None => engine.list_reservations(filter).await,
                };
                Ok(reservation_rows(reservations))
            }
            Command::SelectPlaceholders => Ok(reservation_rows(engine.list_placeholders())),
            Command::SelectSpareCandidates { reservation_id } => {
                let vehicles = engine
                    .spare_candidates(reservation_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vehicle_rows(vehicles))
            }

            // ── Availability & planning ──────────────────────
            Command::SelectAvailability {
                vehicle_id,
                start,
                end,
                kind,
                min_duration,
            } => {
                let slots = engine
                    .compute_availability(vehicle_id, start, end, kind, min_duration)
                    .await
                    .map_err(engine_err)?;
                let vid = vehicle_id.to_string();
                Ok(rows(availability_schema(), slots, |enc, slot| {
                    enc.encode_field(&vid)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)
                }))
            }
            Command::SelectConflicts {
                vehicle_id,
                start,
                end,
                kind,
            } => {
                let conflicts = engine
                    .find_conflicts(vehicle_id, start, end, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(conflicts))
            }
            Command::SelectAvailableVehicles { start, end, kind } => {
                let vehicles = engine
                    .available_vehicles(start, end, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vehicle_rows(vehicles))
            }
            Command::SelectFleetAvailability {
                start,
                end,
                min_available,
                kind,
                min_duration,
            } => {
                let spans = engine
                    .fleet_availability(start, end, min_available, kind, min_duration)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(span_schema(), spans, |enc, span| {
                    enc.encode_field(&span.start)?;
                    enc.encode_field(&span.end)
                }))
            }
            Command::SelectCalendar {
                start,
                end,
                vehicle_id,
            } => {
                let entries = engine
                    .calendar(start, end, vehicle_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(calendar_schema(), entries, |enc, entry| {
                    let r = &entry.reservation;
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.vehicle_id.map(|v| v.to_string()))?;
                    enc.encode_field(&entry.license_plate)?;
                    enc.encode_field(&r.customer_id.map(|c| c.to_string()))?;
                    enc.encode_field(&r.kind.as_str())?;
                    enc.encode_field(&r.status.as_str())?;
                    enc.encode_field(&r.span.start)?;
                    enc.encode_field(&r.span.end_opt())?;
                    enc.encode_field(&r.maintenance.as_ref().map(|m| m.progress.as_str()))
                }))
            }
            Command::SelectReminders { horizon_days } => {
                let horizon = horizon_days.unwrap_or(self.tenant_manager.settings().reminder_horizon_days);
                let reminders = engine
                    .reminders(now_ms(), horizon)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(reminder_schema(), reminders, |enc, reminder| {
                    enc.encode_field(&reminder.vehicle_id.to_string())?;
                    enc.encode_field(&reminder.license_plate)?;
                    enc.encode_field(&reminder.kind.as_str())?;
                    enc.encode_field(&reminder.due)
                }))
            }

            // ── Expenses ─────────────────────────────────────
            Command::InsertExpense { expense } => {
                engine.record_expense(expense).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteExpense { id } => {
                engine.remove_expense(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectExpenses { vehicle_id } => {
                Ok(rows(expense_schema(), engine.list_expenses(vehicle_id), |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.vehicle_id.to_string())?;
                    enc.encode_field(&e.amount_cents)?;
                    enc.encode_field(&e.category)?;
                    enc.encode_field(&e.incurred_at)?;
                    enc.encode_field(&e.description)
                }))
            }

            // ── Notifications & maintenance ──────────────────
            Command::Listen { channel } => {
                let vehicle_id = parse_channel(&channel)?;
                self.listeners
                    .lock()
                    .await
                    .entry(vehicle_id)
                    .or_insert_with(|| engine.notify.subscribe(vehicle_id));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let vehicle_id = parse_channel(&channel)?;
                self.listeners.lock().await.remove(&vehicle_id);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::Checkpoint => {
                self.tenant_manager
                    .checkpoint(tenant, engine)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("CHECKPOINT")))
            }
        }
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    notify::parse_channel(channel).ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected vehicle_{{id}})"),
        )))
    })
}

/// A by-id lookup as a result set: missing rows are an empty result, not an error.
fn found<T>(result: Result<T, EngineError>) -> PgWireResult<Vec<T>> {
    match result {
        Ok(item) => Ok(vec![item]),
        Err(EngineError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(engine_err(e)),
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn vehicle_rows(vehicles: Vec<VehicleInfo>) -> Response {
    rows(vehicle_schema(), vehicles, |enc, v| {
        enc.encode_field(&v.id.to_string())?;
        enc.encode_field(&v.details.license_plate)?;
        enc.encode_field(&v.details.brand)?;
        enc.encode_field(&v.details.model)?;
        enc.encode_field(&v.details.apk_date)?;
        enc.encode_field(&v.details.warranty_end)?;
        enc.encode_field(&v.status.as_str())?;
        enc.encode_field(&v.maintenance_state.as_str())?;
        enc.encode_field(&v.retired_at)
    })
}

fn customer_rows(customers: Vec<Customer>) -> Response {
    rows(customer_schema(), customers, |enc, c| {
        enc.encode_field(&c.id.to_string())?;
        enc.encode_field(&c.details.name)?;
        enc.encode_field(&c.details.email)?;
        enc.encode_field(&c.details.phone)?;
        enc.encode_field(&c.deleted_at)
    })
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    rows(reservation_schema(), reservations, |enc, r| {
        let maintenance = r.maintenance.as_ref();
        enc.encode_field(&r.id.to_string())?;
        enc.encode_field(&r.vehicle_id.map(|v| v.to_string()))?;
        enc.encode_field(&r.customer_id.map(|c| c.to_string()))?;
        enc.encode_field(&r.span.start)?;
        enc.encode_field(&r.span.end_opt())?;
        enc.encode_field(&r.kind.as_str())?;
        enc.encode_field(&r.status.as_str())?;
        enc.encode_field(&r.contract_number)?;
        enc.encode_field(&r.notes)?;
        enc.encode_field(&maintenance.map(|m| m.progress.as_str()))?;
        enc.encode_field(&maintenance.and_then(|m| m.duration_days).map(i64::from))?;
        enc.encode_field(&maintenance.and_then(|m| m.kind.clone()))?;
        enc.encode_field(&r.covers.map(|c| c.to_string()))?;
        enc.encode_field(&r.deleted_at)
    })
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn vehicle_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("license_plate", Type::VARCHAR),
        field("brand", Type::VARCHAR),
        field("model", Type::VARCHAR),
        field("apk_date", Type::INT8),
        field("warranty_end", Type::INT8),
        field("status", Type::VARCHAR),
        field("maintenance_state", Type::VARCHAR),
        field("retired_at", Type::INT8),
    ]
}

fn customer_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("deleted_at", Type::INT8),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("vehicle_id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("type", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("contract_number", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("maintenance_status", Type::VARCHAR),
        field("duration_days", Type::INT8),
        field("maintenance_kind", Type::VARCHAR),
        field("covers", Type::VARCHAR),
        field("deleted_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("vehicle_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn span_schema() -> Vec<FieldInfo> {
    vec![field("start", Type::INT8), field("end", Type::INT8)]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("reservation_id", Type::VARCHAR),
        field("vehicle_id", Type::VARCHAR),
        field("license_plate", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("type", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("maintenance_status", Type::VARCHAR),
    ]
}

fn reminder_schema() -> Vec<FieldInfo> {
    vec![
        field("vehicle_id", Type::VARCHAR),
        field("license_plate", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("due", Type::INT8),
    ]
}

fn expense_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("vehicle_id", Type::VARCHAR),
        field("amount_cents", Type::INT8),
        field("category", Type::VARCHAR),
        field("incurred_at", Type::INT8),
        field("description", Type::VARCHAR),
    ]
}

/// Columns a statement returns, judged from the table after `FROM`.
/// Statements that return no rows get an empty schema.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    if !words.next().is_some_and(|w| w.eq_ignore_ascii_case("SELECT")) {
        return Vec::new();
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_lowercase());
    match table.as_deref() {
        Some("vehicles" | "spare_candidates" | "available_vehicles") => vehicle_schema(),
        Some("customers") => customer_schema(),
        Some("reservations" | "placeholders" | "conflicts") => reservation_schema(),
        Some("availability") => availability_schema(),
        Some("fleet_availability") => span_schema(),
        Some("calendar") => calendar_schema(),
        Some("reminders") => reminder_schema(),
        Some("expenses") => expense_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetDeskHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run_statement(client, query).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetDeskQueryParser;

#[async_trait]
impl QueryParser for FleetDeskQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetDeskHandler {
    type Statement = String;
    type QueryParser = FleetDeskQueryParser;

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
        let sql = substitute_params(portal);
        self.run_statement(client, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted text, as `(byte range, N)`.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote inside a literal closes and reopens it, which
            // leaves the state unchanged overall.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    out.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

/// Single left-to-right pass: bound values are never rescanned, so a value
/// containing `$1` stays literal. Unbound indexes are left in place.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetDeskFactory {
    handler: Arc<FleetDeskHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetDeskAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetDeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FleetDeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetDeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetDeskFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::AlreadyExists(_)
        | EngineError::DuplicateContract(_)
        | EngineError::DuplicatePlate(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    tracing::debug!("statement rejected: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
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
