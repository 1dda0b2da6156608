//! Dispatch subscription rows, keyed by (context, connection_string)
//! where context is the owning tenant's wid.

use super::{tristate_from_i64, tristate_to_i64, Store};
use chrono::{DateTime, Utc};
use quepasa_core::error::QpError;
use quepasa_core::options::WhatsappOptions;
use quepasa_dispatch::{DispatchSubscription, SubscriberKind};

type DispatchRow = (
    String,
    String,
    String,
    bool,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    i64,
    DateTime<Utc>,
);

const DISPATCH_COLUMNS: &str = "context, connection_string, type, forwardinternal, trackid, \
     \"groups\", direct, broadcasts, readreceipts, calls, readupdate, \
     extra, failure, success, age, timestamp";

fn kind_from_str(value: &str) -> SubscriberKind {
    match value {
        "queue" => SubscriberKind::Queue,
        _ => SubscriberKind::Webhook,
    }
}

fn from_row(row: DispatchRow) -> Result<DispatchSubscription, QpError> {
    let (
        context,
        connection_string,
        kind,
        forward_internal,
        track_id,
        groups,
        direct,
        broadcasts,
        readreceipts,
        calls,
        readupdate,
        extra,
        failure,
        success,
        age,
        timestamp,
    ) = row;

    let extra = match extra {
        None => None,
        Some(raw) => Some(serde_json::from_str(&raw)?),
    };

    Ok(DispatchSubscription {
        wid: context,
        connection_string,
        kind: kind_from_str(&kind),
        forward_internal,
        track_id,
        options: WhatsappOptions {
            groups: tristate_from_i64(groups),
            direct: tristate_from_i64(direct),
            broadcasts: tristate_from_i64(broadcasts),
            read_receipts: tristate_from_i64(readreceipts),
            calls: tristate_from_i64(calls),
            read_update: tristate_from_i64(readupdate),
        },
        extra,
        failure,
        success,
        timestamp: Some(timestamp),
        age: age.max(0) as u32,
    })
}

impl Store {
    /// All subscriptions for one tenant wid.
    pub async fn list_dispatching(&self, wid: &str) -> Result<Vec<DispatchSubscription>, QpError> {
        let rows: Vec<DispatchRow> = sqlx::query_as(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatching WHERE context = ?"
        ))
        .bind(wid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QpError::Store(format!("query failed: {e}")))?;

        rows.into_iter().map(from_row).collect()
    }

    /// Insert or replace one subscription.
    pub async fn save_dispatching(&self, sub: &DispatchSubscription) -> Result<(), QpError> {
        let extra = match &sub.extra {
            None => None,
            Some(value) => Some(serde_json::to_string(value)?),
        };

        sqlx::query(
            "INSERT INTO dispatching (context, connection_string, type, forwardinternal, \
                 trackid, \"groups\", direct, broadcasts, readreceipts, calls, readupdate, \
                 extra, failure, success, age, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(context, connection_string) DO UPDATE SET \
                 type = excluded.type, \
                 forwardinternal = excluded.forwardinternal, \
                 trackid = excluded.trackid, \
                 \"groups\" = excluded.\"groups\", \
                 direct = excluded.direct, \
                 broadcasts = excluded.broadcasts, \
                 readreceipts = excluded.readreceipts, \
                 calls = excluded.calls, \
                 readupdate = excluded.readupdate, \
                 extra = excluded.extra, \
                 failure = excluded.failure, \
                 success = excluded.success, \
                 age = excluded.age, \
                 timestamp = excluded.timestamp",
        )
        .bind(&sub.wid)
        .bind(&sub.connection_string)
        .bind(sub.kind.to_string())
        .bind(sub.forward_internal)
        .bind(&sub.track_id)
        .bind(tristate_to_i64(sub.options.groups))
        .bind(tristate_to_i64(sub.options.direct))
        .bind(tristate_to_i64(sub.options.broadcasts))
        .bind(tristate_to_i64(sub.options.read_receipts))
        .bind(tristate_to_i64(sub.options.calls))
        .bind(tristate_to_i64(sub.options.read_update))
        .bind(extra)
        .bind(sub.failure)
        .bind(sub.success)
        .bind(sub.age as i64)
        .bind(sub.timestamp.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .map_err(|e| QpError::Store(format!("save dispatching failed: {e}")))?;

        Ok(())
    }

    /// Record one delivery outcome without touching the filter columns.
    pub async fn update_dispatching_outcome(
        &self,
        wid: &str,
        connection_string: &str,
        success: bool,
        at: DateTime<Utc>,
        age: u32,
    ) -> Result<(), QpError> {
        let column = if success { "success" } else { "failure" };
        sqlx::query(&format!(
            "UPDATE dispatching SET {column} = ?, age = ?, timestamp = ? \
             WHERE context = ? AND connection_string = ?"
        ))
        .bind(at)
        .bind(age as i64)
        .bind(at)
        .bind(wid)
        .bind(connection_string)
        .execute(&self.pool)
        .await
        .map_err(|e| QpError::Store(format!("update dispatching failed: {e}")))?;

        Ok(())
    }

    /// Remove one subscription. Returns true when a row was deleted.
    pub async fn delete_dispatching(
        &self,
        wid: &str,
        connection_string: &str,
    ) -> Result<bool, QpError> {
        let result =
            sqlx::query("DELETE FROM dispatching WHERE context = ? AND connection_string = ?")
                .bind(wid)
                .bind(connection_string)
                .execute(&self.pool)
                .await
                .map_err(|e| QpError::Store(format!("delete dispatching failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every subscription of one tenant.
    pub async fn clear_dispatching(&self, wid: &str) -> Result<u64, QpError> {
        let result = sqlx::query("DELETE FROM dispatching WHERE context = ?")
            .bind(wid)
            .execute(&self.pool)
            .await
            .map_err(|e| QpError::Store(format!("clear dispatching failed: {e}")))?;

        Ok(result.rows_affected())
    }
}
