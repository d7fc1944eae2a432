use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::ChaletAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct ChaletHandler {
    engine: Arc<Engine>,
    service_user: String,
    query_parser: Arc<ChaletQueryParser>,
}

impl ChaletHandler {
    pub fn new(engine: Arc<Engine>, service_user: String) -> Self {
        Self {
            engine,
            service_user,
            query_parser: Arc::new(ChaletQueryParser),
        }
    }

    /// The acting user of this session, re-read on every query so role
    /// changes and deletions take effect immediately. `None` for the
    /// service user.
    async fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Option<Principal>> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        if user == self.service_user {
            return Ok(None);
        }
        let id = Ulid::from_string(&user)
            .map_err(|_| user_error("28000", format!("unknown session user: {user}")))?;
        match self.engine.principal(id).await {
            Some(p) => Ok(Some(p)),
            None => Err(user_error("28000", format!("session user no longer exists: {id}"))),
        }
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str, format: &Format) -> PgWireResult<Response> {
        let principal = self.resolve_principal(client).await?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(principal, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        principal: Option<Principal>,
        cmd: Command,
        format: &Format,
    ) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::RegisterUser {
                id,
                name,
                email,
                password,
            } => {
                engine.register_user(id, name, email, &password).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Login { email, password } => {
                let user = engine.authenticate(&email, &password).await?;
                Ok(users_response(vec![user], format))
            }
            Command::InsertBooking {
                id,
                start,
                end,
                note,
            } => {
                let me = require_user(principal)?;
                engine
                    .create_booking(id, me.user_id, start, end, note)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBooking {
                id,
                start,
                end,
                note,
            } => {
                let me = require_user(principal)?;
                engine
                    .update_booking(id, me.user_id, start, end, note)
                    .await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                let me = require_user(principal)?;
                engine.delete_booking(id, me.user_id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id } => {
                require_user(principal)?;
                let bookings = match id {
                    Some(id) => vec![engine.get_booking(id).await?],
                    None => engine.list_bookings().await,
                };
                Ok(bookings_response(bookings, format))
            }
            Command::SelectMyBookings => {
                let me = require_user(principal)?;
                Ok(bookings_response(
                    engine.list_bookings_for(me.user_id).await,
                    format,
                ))
            }
            Command::SelectAvailability { start, end } => {
                require_user(principal)?;
                let available = engine.check_availability(start, end).await?;
                let schema = Arc::new(availability_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                let row = encoder
                    .encode_field(&available)
                    .map(|()| encoder.take_row());
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
            Command::SelectFreeWindows { start, end } => {
                require_user(principal)?;
                let windows = engine.free_windows(start, end).await?;
                let schema = Arc::new(free_windows_schema(format));
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.start)?;
                        encoder.encode_field(&w.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::AdminSelectUsers => {
                let me = require_user(principal)?;
                let users = engine.list_users(&me).await?;
                let schema = Arc::new(admin_users_schema(format));
                let rows: Vec<PgWireResult<_>> = users
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encode_user(&mut encoder, &s.user)?;
                        encoder.encode_field(&(s.booking_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::AdminUpdateRole { id, role } => {
                let me = require_user(principal)?;
                engine.change_role(&me, id, role).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::AdminDeleteUser { id } => {
                let me = require_user(principal)?;
                engine.delete_user(&me, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::AdminSelectBookings => {
                let me = require_user(principal)?;
                if !me.is_admin() {
                    return Err(EngineError::Forbidden("administrator role required"));
                }
                Ok(bookings_response(engine.list_bookings().await, format))
            }
            Command::AdminDeleteBooking { id } => {
                let me = require_user(principal)?;
                engine.admin_delete_booking(&me, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::AdminSelectStats => {
                let me = require_user(principal)?;
                let stats = engine
                    .stats(&me, crate::engine::now_ms())
                    .await?;
                let schema = Arc::new(stats_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                let row = [
                    stats.total_users,
                    stats.total_bookings,
                    stats.active_bookings,
                    stats.past_bookings,
                ]
                .into_iter()
                .try_for_each(|n| encoder.encode_field(&(n as i64)))
                .map(|()| encoder.take_row());
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
        }
    }
}

fn require_user(principal: Option<Principal>) -> Result<Principal, EngineError> {
    principal.ok_or(EngineError::Unauthorized)
}

// ── Result encoding ──────────────────────────────────────────────

fn bookings_response(bookings: Vec<BookingInfo>, format: &Format) -> Response {
    let schema = Arc::new(bookings_schema(format));
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.user_name)?;
            encoder.encode_field(&b.user_email)?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            encoder.encode_field(&b.note)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn users_response(users: Vec<UserInfo>, format: &Format) -> Response {
    let schema = Arc::new(user_schema(format));
    let rows: Vec<PgWireResult<_>> = users
        .into_iter()
        .map(|u| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_user(&mut encoder, &u)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_user(encoder: &mut DataRowEncoder, u: &UserInfo) -> PgWireResult<()> {
    encoder.encode_field(&u.id.to_string())?;
    encoder.encode_field(&u.name)?;
    encoder.encode_field(&u.email)?;
    encoder.encode_field(&u.role.as_str())?;
    encoder.encode_field(&u.created_at)
}

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn bookings_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("user_name", Type::VARCHAR),
            ("user_email", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("note", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

fn user_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("role", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

fn admin_users_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("role", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("booking_count", Type::INT8),
        ],
        format,
    )
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("available", Type::BOOL)], format)
}

fn free_windows_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("start", Type::INT8), ("end", Type::INT8)], format)
}

fn stats_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("total_users", Type::INT8),
            ("total_bookings", Type::INT8),
            ("active_bookings", Type::INT8),
            ("past_bookings", Type::INT8),
        ],
        format,
    )
}

/// Row schema of a statement, decided from its `FROM` table without binding
/// parameters. Statements that return no rows get an empty schema.
fn statement_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';' || c == ',')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches('"').trim_start_matches("public."));
    match table {
        Some("bookings" | "my_bookings" | "admin.bookings") => bookings_schema(format),
        Some("login") => user_schema(format),
        Some("admin.users") => admin_users_schema(format),
        Some("availability") => availability_schema(format),
        Some("free_windows") => free_windows_schema(format),
        Some("admin.stats") => stats_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChaletHandler {
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
        let response = self.run(&*client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChaletQueryParser;

#[async_trait]
impl QueryParser for ChaletQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChaletHandler {
    type Statement = String;
    type QueryParser = ChaletQueryParser;

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
        self.run(&*client, &sql, &portal.result_column_format).await
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
            statement_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            &target.result_column_format,
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
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement text. Substituted values are
/// never rescanned, so a `$1` inside a bound value stays literal.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => {
                result.push('$');
                result.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChaletFactory {
    handler: Arc<ChaletHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ChaletAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ChaletFactory {
    pub fn new(engine: Arc<Engine>, service_user: String, password: String) -> Self {
        let auth_source = ChaletAuthSource::new(engine.clone(), service_user.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChaletHandler::new(engine, service_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChaletFactory {
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
    engine: Arc<Engine>,
    service_user: String,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ChaletFactory::new(engine, service_user, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::Unauthorized => "28000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM login WHERE password = $2 AND email = $1"), 2);
        assert_eq!(count_params("SELECT $10"), 10);
    }

    #[test]
    fn substitute_quotes_and_escapes() {
        let params = vec![Some(b"it's".to_vec()), None];
        assert_eq!(
            substitute("INSERT INTO bookings VALUES ($1, $2)", &params),
            "INSERT INTO bookings VALUES ('it''s', NULL)"
        );
    }

    #[test]
    fn substitute_double_digit_placeholders() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        let out = substitute("$1 $10", &params);
        assert_eq!(out, "'1' '10'");
    }

    #[test]
    fn substitute_leaves_dollar_signs_in_values_alone() {
        let id = Ulid::new();
        let params = vec![
            Some(id.to_string().into_bytes()),
            Some(b"1000".to_vec()),
            Some(b"2000".to_vec()),
            Some(b"costs $1 per night".to_vec()),
        ];
        let out = substitute(
            r#"INSERT INTO bookings (id, start, "end", note) VALUES ($1, $2, $3, $4)"#,
            &params,
        );
        assert!(out.contains("'costs $1 per night'"), "{out}");

        match sql::parse_sql(&out).unwrap() {
            Command::InsertBooking { id: parsed, note, .. } => {
                assert_eq!(parsed, id);
                assert_eq!(note.as_deref(), Some("costs $1 per night"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn substitute_keeps_unbound_placeholders() {
        let params = vec![Some(b"a".to_vec())];
        assert_eq!(substitute("$1 $2 $ $0", &params), "'a' $2 $ $0");
    }

    #[test]
    fn statement_schema_by_table() {
        let names = |sql: &str| -> Vec<String> {
            statement_schema(sql, &Format::UnifiedText)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(names("SELECT * FROM availability WHERE start >= $1")[0], "available");
        assert_eq!(names("select * from admin.stats").len(), 4);
        assert_eq!(names("SELECT * FROM my_bookings;").len(), 8);
        assert_eq!(names("SELECT * FROM login WHERE email = $1")[3], "role");
        assert!(names("INSERT INTO bookings (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn sqlstate_mapping() {
        assert_eq!(sqlstate(&EngineError::Conflict(Ulid::new())), "23P01");
        assert_eq!(sqlstate(&EngineError::Validation("x")), "22023");
        assert_eq!(sqlstate(&EngineError::Forbidden("x")), "42501");
        assert_eq!(sqlstate(&EngineError::Unauthorized), "28000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
    }
}
