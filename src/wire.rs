use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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

use crate::auth::{AccessPolicy, SlotlockAuthSource};
use crate::coordinator::{CompletionOutcome, CoordinatorError, EntryOutcome, Grant, ReadOnlyReason};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command};
use crate::store::ReleaseOutcome;
use crate::tenant::{Tenant, TenantManager};

/// The authenticated end of a connection.
#[derive(Debug)]
struct Login {
    user: String,
    role: Role,
}

impl Login {
    /// A statement may run with a lesser role than the login's, never a greater one.
    fn role(&self, requested: Option<Role>) -> PgWireResult<Role> {
        match requested {
            None => Ok(self.role),
            Some(role) if self.role.covers(role) => Ok(role),
            Some(role) => Err(user_error(
                "42501",
                format!("{} may not act as {}", self.user, role.as_str()),
            )),
        }
    }

    /// Only admins act under another holder's name.
    fn act_for(&self, holder: &str, role: Role) -> PgWireResult<()> {
        if same_holder(holder, &self.user) || role.is_admin() {
            Ok(())
        } else {
            Err(user_error(
                "42501",
                format!("{} may not act for {holder}", self.user),
            ))
        }
    }
}

pub struct SlotlockHandler {
    tenant_manager: Arc<TenantManager>,
    access: Arc<AccessPolicy>,
    query_parser: Arc<SlotlockQueryParser>,
}

impl SlotlockHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, access: Arc<AccessPolicy>) -> Self {
        Self {
            tenant_manager,
            access,
            query_parser: Arc::new(SlotlockQueryParser),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute and record one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let tenant = self.resolve_tenant(client)?;
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        let login = Login {
            role: self.access.role_of(&user),
            user,
        };
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&tenant, &login, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        login: &Login,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let coord = &tenant.coordinator;
        let current = || coord.clock().current_slot();

        match cmd {
            Command::RegisterResource { id, name } => {
                tenant
                    .engine
                    .register_resource(&id, name)
                    .await
                    .map_err(|e| coord_err(e.into()))?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UnregisterResource { id } => {
                tenant
                    .engine
                    .unregister_resource(&id)
                    .await
                    .map_err(|e| coord_err(e.into()))?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources => {
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = tenant
                    .engine
                    .list_resources()
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id)?;
                        encoder.encode_field(&r.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Acquire {
                resource_id,
                holder,
                role,
            } => {
                let role = login.role(role)?;
                login.act_for(&holder, role)?;
                let grant = match coord.acquire_for_editing(&resource_id, &holder, role).await {
                    Ok(grant) => grant,
                    Err(CoordinatorError::UnknownResource(id)) => {
                        // Prefer the more specific report when leases still point here.
                        coord.detect_stale(&id).await.map_err(coord_err)?;
                        return Err(coord_err(CoordinatorError::UnknownResource(id)));
                    }
                    Err(e) => return Err(coord_err(e)),
                };
                match grant {
                    Grant::Editing(_) => Ok(Response::Execution(Tag::new("INSERT").with_rows(1))),
                    Grant::ReadOnly(ReadOnlyReason::Inspection) => {
                        Ok(Response::Execution(Tag::new("INSERT").with_rows(0)))
                    }
                    Grant::ReadOnly(ReadOnlyReason::LockedBy(other)) => Err(user_error(
                        "55P03",
                        format!("{resource_id} is locked by {other}"),
                    )),
                    Grant::ReadOnly(ReadOnlyReason::HolderBusy { resource_id: busy, slot }) => {
                        Err(user_error(
                            "55P03",
                            format!("{holder} already holds {busy} @ {slot}"),
                        ))
                    }
                }
            }
            Command::Release {
                resource_id,
                holder,
                slot,
                reason,
            } => {
                login.act_for(&holder, login.role)?;
                let slot = slot.unwrap_or_else(current);
                let outcome = coord
                    .release(&resource_id, slot, &holder, reason)
                    .await
                    .map_err(coord_err)?;
                let rows = usize::from(matches!(outcome, ReleaseOutcome::Released(_)));
                Ok(Response::Execution(Tag::new("DELETE").with_rows(rows)))
            }
            Command::ForceRelease {
                resource_id,
                slot,
                role,
                reason,
            } => {
                let role = login.role(role)?;
                let slot = slot.unwrap_or_else(current);
                let removed = coord
                    .force_release(&resource_id, slot, role, reason)
                    .await
                    .map_err(coord_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed.is_some())),
                ))
            }
            Command::ReleaseAll { holder, role } => {
                let role = login.role(role)?;
                let released = coord
                    .release_all(&holder, &login.user, role)
                    .await
                    .map_err(coord_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(released.len())))
            }
            Command::SelectLeases {
                resource_id,
                holder,
            } => {
                let leases = coord
                    .list_active_leases()
                    .await
                    .map_err(coord_err)?
                    .into_iter()
                    .filter(|l| resource_id.as_ref().is_none_or(|r| &l.resource_id == r))
                    .filter(|l| holder.as_ref().is_none_or(|h| l.held_by(h)))
                    .collect();
                lease_rows(leases)
            }
            Command::SelectStaleLeases => {
                let leases = coord.stale_leases().await.map_err(coord_err)?;
                lease_rows(leases)
            }
            Command::CreateEntry {
                resource_id,
                holder,
                role,
                slot,
                observation,
                origin,
            } => {
                let role = login.role(role)?;
                login.act_for(&holder, role)?;
                let slot = slot.unwrap_or_else(current);
                match coord
                    .create_entry(&resource_id, slot, &holder, role, observation, origin)
                    .await
                    .map_err(coord_err)?
                {
                    EntryOutcome::Created(_) => Ok(Response::Execution(Tag::new("INSERT").with_rows(1))),
                    EntryOutcome::Denied { holder: current } => Err(denied(&resource_id, slot, current)),
                }
            }
            Command::SelectEntries { resource_id, slot } => {
                let entries = coord.entries(&resource_id, slot).await.map_err(coord_err)?;
                entry_rows(entries)
            }
            Command::MarkComplete {
                resource_id,
                holder,
                role,
                slot,
            } => {
                let role = login.role(role)?;
                login.act_for(&holder, role)?;
                let slot = slot.unwrap_or_else(current);
                match coord
                    .mark_complete(&resource_id, slot, &holder, role)
                    .await
                    .map_err(coord_err)?
                {
                    CompletionOutcome::Completed { .. } => {
                        Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                    }
                    CompletionOutcome::Denied { holder: current } => {
                        Err(denied(&resource_id, slot, current))
                    }
                }
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![text_field("id", Type::VARCHAR), text_field("name", Type::VARCHAR)]
}

fn lease_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("hour", Type::INT4),
        text_field("holder", Type::VARCHAR),
        text_field("acquired_at", Type::INT8),
        text_field("expires_at", Type::INT8),
    ]
}

fn entry_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("hour", Type::INT4),
        text_field("holder", Type::VARCHAR),
        text_field("auto_saved", Type::BOOL),
        text_field("created_at", Type::INT8),
        text_field("observation", Type::VARCHAR),
    ]
}

fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("resources") => resources_schema(),
        Some("leases" | "stale_leases") => lease_schema(),
        Some("entries") => entry_schema(),
        _ => vec![],
    }
}

fn lease_rows(leases: Vec<Lease>) -> PgWireResult<Response> {
    let schema = Arc::new(lease_schema());
    let rows: Vec<PgWireResult<_>> = leases
        .into_iter()
        .map(|l| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&l.resource_id)?;
            encoder.encode_field(&l.slot.date().to_string())?;
            encoder.encode_field(&i32::from(l.slot.hour()))?;
            encoder.encode_field(&l.holder)?;
            encoder.encode_field(&l.acquired_at)?;
            encoder.encode_field(&l.expires_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn entry_rows(entries: Vec<Entry>) -> PgWireResult<Response> {
    let schema = Arc::new(entry_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|e| {
            let observation = serde_json::to_string(&e.observation)
                .map_err(|err| user_error("XX000", format!("encode observation: {err}")))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.id.to_string())?;
            encoder.encode_field(&e.resource_id)?;
            encoder.encode_field(&e.slot.date().to_string())?;
            encoder.encode_field(&i32::from(e.slot.hour()))?;
            encoder.encode_field(&e.holder)?;
            encoder.encode_field(&e.auto_saved)?;
            encoder.encode_field(&e.created_at)?;
            encoder.encode_field(&observation)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for SlotlockHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotlockQueryParser;

#[async_trait]
impl QueryParser for SlotlockQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotlockHandler {
    type Statement = String;
    type QueryParser = SlotlockQueryParser;

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
        self.run(client, &sql).await
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
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
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
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

pub struct SlotlockFactory {
    handler: Arc<SlotlockHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotlockAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotlockFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, access: Arc<AccessPolicy>) -> Self {
        let auth_source = SlotlockAuthSource::new(access.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotlockHandler::new(tenant_manager, access)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotlockFactory {
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
    access: Arc<AccessPolicy>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotlockFactory::new(tenant_manager, access);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each coordinator failure.
fn sqlstate(e: &CoordinatorError) -> &'static str {
    match e {
        CoordinatorError::Validation(_) => "22023",
        CoordinatorError::UnknownResource(_) => "42704",
        CoordinatorError::StaleLeaseDetected { .. } => "55000",
        CoordinatorError::NotPermitted(_) => "42501",
        CoordinatorError::LimitExceeded(_) => "54000",
        CoordinatorError::Store(_) => "58030",
    }
}

fn coord_err(e: CoordinatorError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn denied(resource_id: &str, slot: TimeSlot, holder: Option<String>) -> PgWireError {
    let message = match holder {
        Some(holder) => format!("{resource_id} @ {slot} is held by {holder}"),
        None => format!("no lease on {resource_id} @ {slot}"),
    };
    user_error("42501", message)
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM leases"), 0);
        assert_eq!(
            count_params("DELETE FROM leases WHERE resource_id = $2 AND holder = $1"),
            2
        );
        assert_eq!(count_params("SELECT $10, $9"), 10);
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(schema_for("SELECT * FROM leases").len(), 6);
        assert_eq!(schema_for("SELECT * FROM stale_leases").len(), 6);
        assert_eq!(schema_for("SELECT * FROM entries WHERE resource_id = $1").len(), 8);
        assert_eq!(schema_for("SELECT * FROM resources").len(), 2);
        assert!(schema_for("INSERT INTO leases VALUES ('R1', 'a')").is_empty());
    }

    #[test]
    fn login_bounds_role_and_holder() {
        let operator = Login {
            user: "alice".into(),
            role: Role::Operator,
        };
        assert_eq!(operator.role(None).unwrap(), Role::Operator);
        assert!(operator.role(Some(Role::Admin)).is_err());
        assert!(operator.act_for("ALICE", Role::Operator).is_ok());
        assert!(operator.act_for("bob", Role::Operator).is_err());

        let admin = Login {
            user: "admin".into(),
            role: Role::Admin,
        };
        assert_eq!(admin.role(Some(Role::Operator)).unwrap(), Role::Operator);
        assert!(admin.role(Some(Role::SuperAdmin)).is_err());
        assert!(admin.act_for("bob", Role::Admin).is_ok());
        assert!(admin.act_for("bob", Role::Operator).is_err());
    }

    #[test]
    fn coordinator_errors_map_to_sqlstate() {
        let slot = TimeSlot::new(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(), 9).unwrap();
        let cases = [
            (CoordinatorError::Validation("x".into()), "22023"),
            (CoordinatorError::UnknownResource("R9".into()), "42704"),
            (
                CoordinatorError::StaleLeaseDetected {
                    resource_id: "R9".into(),
                    holders: vec!["alice".into()],
                },
                "55000",
            ),
            (CoordinatorError::NotPermitted("admin only"), "42501"),
            (CoordinatorError::Store("down".into()), "58030"),
        ];
        for (err, code) in cases {
            assert_eq!(sqlstate(&err), code, "{err}");
        }
        assert!(matches!(
            denied("R1", slot, Some("bob".into())),
            PgWireError::UserError(_)
        ));
    }
}
