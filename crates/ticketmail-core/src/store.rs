//! Tenant-scoped `SQLite` storage.
//!
//! Every read and write runs inside a [`TenantTx`]. Opening one binds the
//! tenant and project identifiers into the connection-local
//! `session_scope` table before any query executes; per-connection guard
//! triggers then abort any insert, update or delete that touches a row of
//! another tenant. Isolation therefore holds at the storage layer even if an
//! application query forgets its `tenant_id` filter.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use crate::error::SCOPE_VIOLATION;
use crate::tenant::TenantContext;
use crate::{Error, Result, TenantId};

/// Tables that carry a `tenant_id` column and are guarded.
const GUARDED_TABLES: &[&str] = &[
    "connectors",
    "mailboxes",
    "sync_status",
    "inbox_messages",
    "email_attachments",
    "ticket_mail_routing",
    "suppressions",
    "bounces",
    "inbound_log",
    "outbound_log",
    "tickets",
    "ticket_messages",
];

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS connectors (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        project_id TEXT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        settings TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        validation_status TEXT NOT NULL DEFAULT 'pending',
        validation_error TEXT,
        last_validation_at TEXT,
        last_health TEXT,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_connectors_tenant ON connectors(tenant_id, kind)",
    r"
    CREATE TABLE IF NOT EXISTS mailboxes (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
        project_id TEXT NOT NULL,
        address TEXT NOT NULL,
        folder TEXT NOT NULL DEFAULT 'INBOX',
        routing_rules TEXT NOT NULL DEFAULT '[]',
        allow_new_ticket INTEGER NOT NULL DEFAULT 1,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        UNIQUE(tenant_id, project_id, address)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_mailboxes_address ON mailboxes(tenant_id, address)",
    r"
    CREATE TABLE IF NOT EXISTS sync_status (
        tenant_id TEXT NOT NULL,
        connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
        mailbox_address TEXT NOT NULL,
        last_uid INTEGER NOT NULL DEFAULT 0,
        last_message_date TEXT,
        last_sync_at TEXT,
        sync_status TEXT NOT NULL DEFAULT 'idle',
        sync_error TEXT,
        emails_synced_count INTEGER NOT NULL DEFAULT 0,
        lease_owner TEXT,
        lease_heartbeat_ms INTEGER,
        PRIMARY KEY (tenant_id, connector_id, mailbox_address)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS inbox_messages (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
        project_id TEXT,
        mailbox_address TEXT NOT NULL,
        uid INTEGER,
        message_id TEXT NOT NULL,
        in_reply_to TEXT,
        refs TEXT NOT NULL DEFAULT '[]',
        thread_ref TEXT,
        from_address TEXT,
        from_name TEXT,
        to_addresses TEXT NOT NULL DEFAULT '[]',
        cc_addresses TEXT NOT NULL DEFAULT '[]',
        subject TEXT NOT NULL DEFAULT '',
        body_text TEXT,
        body_html TEXT,
        snippet TEXT NOT NULL DEFAULT '',
        is_reply INTEGER NOT NULL DEFAULT 0,
        is_auto_reply INTEGER NOT NULL DEFAULT 0,
        attachment_count INTEGER NOT NULL DEFAULT 0,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        sent_at TEXT,
        received_at TEXT NOT NULL,
        ticket_id TEXT,
        UNIQUE(tenant_id, message_id, mailbox_address)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_inbox_ticket ON inbox_messages(tenant_id, ticket_id)",
    r"
    CREATE TABLE IF NOT EXISTS email_attachments (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        inbox_message_id TEXT NOT NULL REFERENCES inbox_messages(id) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        content_id TEXT,
        is_inline INTEGER NOT NULL DEFAULT 0,
        storage_path TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS ticket_mail_routing (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        ticket_id TEXT NOT NULL,
        public_token TEXT NOT NULL,
        reply_address TEXT NOT NULL,
        message_id_root TEXT NOT NULL,
        created_at TEXT NOT NULL,
        revoked_at TEXT,
        UNIQUE(tenant_id, public_token)
    )
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_routing_active_ticket
    ON ticket_mail_routing(tenant_id, ticket_id) WHERE revoked_at IS NULL
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_routing_active_root
    ON ticket_mail_routing(tenant_id, message_id_root) WHERE revoked_at IS NULL
    ",
    r"
    CREATE TABLE IF NOT EXISTS suppressions (
        tenant_id TEXT NOT NULL,
        address TEXT NOT NULL,
        reason TEXT NOT NULL,
        source TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, address)
    ) WITHOUT ROWID
    ",
    r"
    CREATE TABLE IF NOT EXISTS bounces (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        message_id TEXT,
        recipient TEXT NOT NULL,
        kind TEXT NOT NULL,
        status_code TEXT,
        diagnostic TEXT,
        ticket_id TEXT,
        project_id TEXT,
        raw TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_bounces_recipient ON bounces(tenant_id, recipient)",
    r"
    CREATE TABLE IF NOT EXISTS inbound_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        connector_id TEXT NOT NULL,
        mailbox_address TEXT NOT NULL,
        uid INTEGER,
        message_id TEXT,
        status TEXT NOT NULL,
        reason TEXT,
        ticket_id TEXT,
        created_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_inbound_log_mailbox ON inbound_log(tenant_id, mailbox_address)",
    r"
    CREATE TABLE IF NOT EXISTS outbound_log (
        tenant_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        connector_id TEXT NOT NULL,
        ticket_id TEXT,
        project_id TEXT,
        recipients TEXT NOT NULL DEFAULT '[]',
        subject TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        reason TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        sent_at TEXT,
        PRIMARY KEY (tenant_id, message_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS tickets (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        requester TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS ticket_messages (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
        inbox_message_id TEXT,
        direction TEXT NOT NULL,
        author TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_ticket_messages_ticket ON ticket_messages(tenant_id, ticket_id)",
];

/// Shared handle to the engine database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| Box::pin(async move { prepare_connection(conn).await }))
            .connect_with(options)
            .await?;

        debug!("Opened database at {database_path}");
        Ok(Self { pool })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection that is never recycled, since every new
        // in-memory connection would be an empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(|conn, _meta| Box::pin(async move { prepare_connection(conn).await }))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Open a transaction bound to the given tenant scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be started or the scope
    /// cannot be bound.
    pub async fn begin(&self, ctx: &TenantContext) -> Result<TenantTx> {
        let mut tx = self.pool.begin().await?;
        let projects: Vec<String> = ctx.project_ids().iter().map(ToString::to_string).collect();

        sqlx::query("DELETE FROM session_scope")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO session_scope (slot, tenant_id, project_ids) VALUES (0, ?, ?)")
            .bind(ctx.tenant_id().to_string())
            .bind(serde_json::to_string(&projects)?)
            .execute(&mut *tx)
            .await?;

        Ok(TenantTx {
            tx,
            ctx: ctx.clone(),
        })
    }

    /// Underlying pool, for system-level reads that are not tenant scoped.
    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Applies the schema and installs the per-connection scope table and guards.
async fn prepare_connection(conn: &mut SqliteConnection) -> std::result::Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    sqlx::query(
        r"
        CREATE TEMP TABLE IF NOT EXISTS session_scope (
            slot INTEGER PRIMARY KEY CHECK (slot = 0),
            tenant_id TEXT NOT NULL,
            project_ids TEXT NOT NULL DEFAULT '[]'
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    for table in GUARDED_TABLES {
        for statement in guard_triggers(table) {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
    }

    Ok(())
}

/// Builds the insert/update/delete guard triggers for one table.
///
/// Table names come from [`GUARDED_TABLES`], never from user input.
fn guard_triggers(table: &str) -> [String; 3] {
    let scope = "(SELECT tenant_id FROM session_scope WHERE slot = 0)";
    [
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS guard_{table}_insert BEFORE INSERT ON main.{table} \
             WHEN NEW.tenant_id IS NOT {scope} \
             BEGIN SELECT RAISE(ABORT, '{SCOPE_VIOLATION}'); END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS guard_{table}_update BEFORE UPDATE ON main.{table} \
             WHEN NEW.tenant_id IS NOT {scope} OR OLD.tenant_id IS NOT {scope} \
             BEGIN SELECT RAISE(ABORT, '{SCOPE_VIOLATION}'); END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS guard_{table}_delete BEFORE DELETE ON main.{table} \
             WHEN OLD.tenant_id IS NOT {scope} \
             BEGIN SELECT RAISE(ABORT, '{SCOPE_VIOLATION}'); END"
        ),
    ]
}

/// `SQL` predicate restricting a `project_id` column to the projects bound in
/// the session scope. An empty scope admits every project, and rows without
/// a project are always admitted.
pub(crate) const PROJECT_SCOPE: &str = r"
    (project_id IS NULL
     OR (SELECT project_ids FROM session_scope WHERE slot = 0) = '[]'
     OR project_id IN (
         SELECT value FROM session_scope, json_each(session_scope.project_ids)
     ))
";

/// A database transaction bound to one tenant scope.
///
/// Dropping it without [`commit`](Self::commit) rolls back.
pub struct TenantTx {
    tx: Transaction<'static, Sqlite>,
    ctx: TenantContext,
}

impl TenantTx {
    /// Scope this transaction is bound to.
    #[must_use]
    pub const fn context(&self) -> &TenantContext {
        &self.ctx
    }

    /// Tenant this transaction is bound to.
    #[must_use]
    pub const fn tenant_id(&self) -> TenantId {
        self.ctx.tenant_id()
    }

    /// Tenant id in its stored text form.
    pub(crate) fn tenant(&self) -> String {
        self.ctx.tenant_id().to_string()
    }

    /// Connection to run queries on.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Commit and clear the scope so the pooled connection is unbound.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("DELETE FROM session_scope")
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll back every change made in this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Reads a required identifier column.
pub(crate) fn get_id<T: FromStr>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| Error::Corrupt(format!("{column}: invalid identifier {raw:?}")))
}

/// Reads an optional identifier column.
pub(crate) fn get_opt_id<T: FromStr>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| {
        raw.parse()
            .map_err(|_| Error::Corrupt(format!("{column}: invalid identifier {raw:?}")))
    })
    .transpose()
}

/// Reads a JSON-encoded column.
pub(crate) fn get_json<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}
