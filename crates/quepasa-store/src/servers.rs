//! Tenant (server) rows.

use super::{tristate_from_i64, tristate_to_i64, Store};
use chrono::{DateTime, Utc};
use quepasa_core::error::QpError;
use quepasa_core::options::WhatsappOptions;

/// One persisted tenant. Lifecycle state is runtime-only; after a restart
/// every tenant starts over in `unverified`/`disconnected`.
#[derive(Debug, Clone, Default)]
pub struct TenantRecord {
    /// Immutable API token; primary key.
    pub token: String,
    /// Empty until the device is paired.
    pub wid: String,
    /// Owner account login.
    pub user: String,
    pub verified: bool,
    pub devel: bool,
    pub options: WhatsappOptions,
    pub timestamp: Option<DateTime<Utc>>,
}

type ServerRow = (
    String,
    String,
    String,
    bool,
    bool,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    DateTime<Utc>,
);

const SERVER_COLUMNS: &str = "token, wid, \"user\", verified, devel, \
     \"groups\", direct, broadcasts, readreceipts, calls, readupdate, timestamp";

fn from_row(row: ServerRow) -> TenantRecord {
    let (token, wid, user, verified, devel, groups, direct, broadcasts, readreceipts, calls, readupdate, timestamp) =
        row;
    TenantRecord {
        token,
        wid,
        user,
        verified,
        devel,
        options: WhatsappOptions {
            groups: tristate_from_i64(groups),
            direct: tristate_from_i64(direct),
            broadcasts: tristate_from_i64(broadcasts),
            read_receipts: tristate_from_i64(readreceipts),
            calls: tristate_from_i64(calls),
            read_update: tristate_from_i64(readupdate),
        },
        timestamp: Some(timestamp),
    }
}

impl Store {
    pub async fn list_servers(&self) -> Result<Vec<TenantRecord>, QpError> {
        let rows: Vec<ServerRow> =
            sqlx::query_as(&format!("SELECT {SERVER_COLUMNS} FROM servers"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| QpError::Store(format!("query failed: {e}")))?;

        Ok(rows.into_iter().map(from_row).collect())
    }

    pub async fn find_server(&self, token: &str) -> Result<Option<TenantRecord>, QpError> {
        let row: Option<ServerRow> =
            sqlx::query_as(&format!("SELECT {SERVER_COLUMNS} FROM servers WHERE token = ?"))
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QpError::Store(format!("query failed: {e}")))?;

        Ok(row.map(from_row))
    }

    pub async fn find_servers_for_user(&self, user: &str) -> Result<Vec<TenantRecord>, QpError> {
        let rows: Vec<ServerRow> = sqlx::query_as(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE \"user\" = ?"
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QpError::Store(format!("query failed: {e}")))?;

        Ok(rows.into_iter().map(from_row).collect())
    }

    /// Insert or update a tenant row. The token never changes; everything
    /// else follows the record.
    pub async fn save_server(&self, record: &TenantRecord) -> Result<(), QpError> {
        sqlx::query(
            "INSERT INTO servers (token, wid, \"user\", verified, devel, \
                 \"groups\", direct, broadcasts, readreceipts, calls, readupdate, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(token) DO UPDATE SET \
                 wid = excluded.wid, \
                 \"user\" = excluded.\"user\", \
                 verified = excluded.verified, \
                 devel = excluded.devel, \
                 \"groups\" = excluded.\"groups\", \
                 direct = excluded.direct, \
                 broadcasts = excluded.broadcasts, \
                 readreceipts = excluded.readreceipts, \
                 calls = excluded.calls, \
                 readupdate = excluded.readupdate, \
                 timestamp = excluded.timestamp",
        )
        .bind(&record.token)
        .bind(&record.wid)
        .bind(&record.user)
        .bind(record.verified)
        .bind(record.devel)
        .bind(tristate_to_i64(record.options.groups))
        .bind(tristate_to_i64(record.options.direct))
        .bind(tristate_to_i64(record.options.broadcasts))
        .bind(tristate_to_i64(record.options.read_receipts))
        .bind(tristate_to_i64(record.options.calls))
        .bind(tristate_to_i64(record.options.read_update))
        .bind(record.timestamp.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .map_err(|e| QpError::Store(format!("save server failed: {e}")))?;

        Ok(())
    }

    /// Remove the tenant and its dispatch subscriptions.
    pub async fn delete_server(&self, token: &str) -> Result<(), QpError> {
        let record = self
            .find_server(token)
            .await?
            .ok_or_else(|| QpError::NotFound(format!("server {token}")))?;

        if !record.wid.is_empty() {
            sqlx::query("DELETE FROM dispatching WHERE context = ?")
                .bind(&record.wid)
                .execute(&self.pool)
                .await
                .map_err(|e| QpError::Store(format!("delete dispatching failed: {e}")))?;
        }

        sqlx::query("DELETE FROM servers WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| QpError::Store(format!("delete server failed: {e}")))?;

        Ok(())
    }
}
