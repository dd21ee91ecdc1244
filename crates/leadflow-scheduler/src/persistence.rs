//! SQLite-backed persistence for transfer rules, quota ledgers and records.
//! Embedded rule sections are stored as JSON columns; quota counters live in
//! their own table so increments are single-row UPDATEs inside a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::timefmt;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::rule::{
    DateRange, QuotaRole, RecordStatus, RuleStatistics, TransferRecord, TransferRule, UserQuota,
};
use crate::store::{
    PageRequest, RecordFilter, RecordPage, RecordStats, RecordStore, RuleStore, UserTransferStats,
};

/// SQLite store for everything the engine owns.
pub struct TransferDb {
    conn: Mutex<Connection>,
}

const RULE_SELECT: &str = "SELECT id, rule_name, description, enabled, trigger_conditions, execution_window, distribution_config, total_transferred, last_executed_at, last_transferred_count, created_by, created_at, updated_at FROM transfer_rules";

const RECORD_SELECT: &str = "SELECT id, rule_id, lead_id, from_user_id, to_user_id, snapshot, status, error_message, transferred_at FROM transfer_records";

fn storage(ctx: &str) -> impl Fn(rusqlite::Error) -> LeadFlowError + '_ {
    move |e| LeadFlowError::Storage(format!("{ctx}: {e}"))
}

fn ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(timefmt::from_db)
}

/// Rule row with its JSON sections still encoded; quotas loaded separately.
struct RuleRow {
    id: String,
    rule_name: String,
    description: String,
    enabled: bool,
    trigger_conditions: String,
    execution_window: String,
    distribution_config: String,
    statistics: RuleStatistics,
    created_by: String,
    created_at: String,
    updated_at: String,
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get(0)?,
        rule_name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get::<_, i32>(3)? != 0,
        trigger_conditions: row.get(4)?,
        execution_window: row.get(5)?,
        distribution_config: row.get(6)?,
        statistics: RuleStatistics {
            total_transferred: row.get::<_, i64>(7)? as u64,
            last_executed_at: ts(row.get(8)?),
            last_transferred_count: row.get(9)?,
        },
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_quota(row: &rusqlite::Row) -> rusqlite::Result<UserQuota> {
    let role: String = row.get(2)?;
    Ok(UserQuota {
        user_id: row.get(0)?,
        user_name: row.get(1)?,
        role: QuotaRole::parse(&role).unwrap_or(QuotaRole::Source),
        transferred_out: row.get(3)?,
        transferred_in: row.get(4)?,
        balance: row.get(5)?,
        pending_compensation: row.get(6)?,
        last_compensated_at: ts(row.get(7)?),
    })
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TransferRecord> {
    let snapshot: String = row.get(5)?;
    let snapshot = serde_json::from_str(&snapshot).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: String = row.get(6)?;
    Ok(TransferRecord {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        lead_id: row.get(2)?,
        from_user_id: row.get(3)?,
        to_user_id: row.get(4)?,
        snapshot,
        status: RecordStatus::parse(&status),
        error_message: row.get(7)?,
        transferred_at: ts(row.get(8)?).unwrap_or_default(),
    })
}

/// Append inclusive bounds on `column` for a date range.
fn push_range(sql: &mut String, args: &mut Vec<String>, column: &str, range: &DateRange) {
    if let Some(start) = range.start {
        args.push(timefmt::to_db(start));
        sql.push_str(&format!(" AND {column} >= ?{}", args.len()));
    }
    if let Some(end) = range.end {
        args.push(timefmt::to_db(end));
        sql.push_str(&format!(" AND {column} <= ?{}", args.len()));
    }
}

fn push_eq(sql: &mut String, args: &mut Vec<String>, column: &str, value: Option<&str>) {
    if let Some(v) = value {
        args.push(v.to_string());
        sql.push_str(&format!(" AND {column} = ?{}", args.len()));
    }
}

impl TransferDb {
    /// Open or create the engine database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(storage("DB pragma"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage("DB open"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage("DB pragma"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadFlowError::Storage(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Rule definitions; embedded sections as JSON
            CREATE TABLE IF NOT EXISTS transfer_rules (
                id TEXT PRIMARY KEY,
                rule_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_conditions TEXT NOT NULL,
                execution_window TEXT NOT NULL,
                distribution_config TEXT NOT NULL,
                total_transferred INTEGER NOT NULL DEFAULT 0,
                last_executed_at TEXT,
                last_transferred_count INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Per-user ledgers, one row per (rule, user)
            CREATE TABLE IF NOT EXISTS rule_user_quotas (
                rule_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                user_name TEXT NOT NULL,
                role TEXT NOT NULL,              -- 'source', 'target', 'both'
                transferred_out INTEGER NOT NULL DEFAULT 0,
                transferred_in INTEGER NOT NULL DEFAULT 0,
                balance INTEGER NOT NULL DEFAULT 0,
                pending_compensation INTEGER NOT NULL DEFAULT 0,
                last_compensated_at TEXT,
                PRIMARY KEY (rule_id, user_id),
                FOREIGN KEY (rule_id) REFERENCES transfer_rules(id) ON DELETE CASCADE
            );

            -- Immutable audit rows
            CREATE TABLE IF NOT EXISTS transfer_records (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                from_user_id TEXT NOT NULL,
                to_user_id TEXT NOT NULL,
                snapshot TEXT NOT NULL,          -- JSON lead snapshot
                status TEXT NOT NULL,            -- 'success', 'failed'
                error_message TEXT,
                transferred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transfer_records_rule ON transfer_records(rule_id, transferred_at);
            CREATE INDEX IF NOT EXISTS idx_transfer_records_users ON transfer_records(from_user_id, to_user_id);
         ",
            )
            .map_err(storage("Migration"))?;
        Ok(())
    }

    fn write_quotas(conn: &Connection, rule_id: &str, quotas: &[UserQuota]) -> Result<()> {
        conn.execute("DELETE FROM rule_user_quotas WHERE rule_id = ?1", [rule_id])
            .map_err(storage("Clear quotas"))?;
        for (position, q) in quotas.iter().enumerate() {
            conn.execute(
                "INSERT INTO rule_user_quotas
                 (rule_id, user_id, position, user_name, role, transferred_out, transferred_in,
                  balance, pending_compensation, last_compensated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    rule_id,
                    q.user_id,
                    position as i64,
                    q.user_name,
                    q.role.as_str(),
                    q.transferred_out,
                    q.transferred_in,
                    q.transferred_out as i64 - q.transferred_in as i64,
                    q.pending_compensation,
                    q.last_compensated_at.map(timefmt::to_db),
                ],
            )
            .map_err(storage("Save quota"))?;
        }
        Ok(())
    }

    fn load_quotas(conn: &Connection, rule_id: &str) -> Result<Vec<UserQuota>> {
        let mut stmt = conn
            .prepare(
                "SELECT user_id, user_name, role, transferred_out, transferred_in, balance,
                 pending_compensation, last_compensated_at
                 FROM rule_user_quotas WHERE rule_id = ?1 ORDER BY position",
            )
            .map_err(storage("Load quotas"))?;
        let rows = stmt
            .query_map([rule_id], row_to_quota)
            .map_err(storage("Load quotas"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage("Load quotas"))
    }

    fn assemble(conn: &Connection, row: RuleRow) -> Result<TransferRule> {
        let user_quotas = Self::load_quotas(conn, &row.id)?;
        Ok(TransferRule {
            trigger_conditions: serde_json::from_str(&row.trigger_conditions)?,
            execution_window: serde_json::from_str(&row.execution_window)?,
            distribution_config: serde_json::from_str(&row.distribution_config)?,
            user_quotas,
            statistics: row.statistics,
            created_at: timefmt::from_db(&row.created_at).unwrap_or_default(),
            updated_at: timefmt::from_db(&row.updated_at).unwrap_or_default(),
            id: row.id,
            rule_name: row.rule_name,
            description: row.description,
            enabled: row.enabled,
            created_by: row.created_by,
        })
    }

    fn query_rules(&self, sql: &str) -> Result<Vec<TransferRule>> {
        let conn = self.conn()?;
        let rows = {
            let mut stmt = conn.prepare(sql).map_err(storage("Load rules"))?;
            let rows = stmt.query_map([], row_to_rule).map_err(storage("Load rules"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage("Load rules"))?
        };
        rows.into_iter()
            .map(|row| Self::assemble(&conn, row))
            .collect()
    }

    fn count_records(&self, sql: &str, args: &[String]) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(sql, rusqlite::params_from_iter(args.iter()), |row| row.get(0))
            .map_err(storage("Count records"))?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl RuleStore for TransferDb {
    async fn insert_rule(&self, rule: &TransferRule) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin"))?;
        tx.execute(
            "INSERT INTO transfer_rules
             (id, rule_name, description, enabled, trigger_conditions, execution_window,
              distribution_config, total_transferred, last_executed_at, last_transferred_count,
              created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                rule.id,
                rule.rule_name,
                rule.description,
                rule.enabled as i32,
                serde_json::to_string(&rule.trigger_conditions)?,
                serde_json::to_string(&rule.execution_window)?,
                serde_json::to_string(&rule.distribution_config)?,
                rule.statistics.total_transferred as i64,
                rule.statistics.last_executed_at.map(timefmt::to_db),
                rule.statistics.last_transferred_count,
                rule.created_by,
                timefmt::to_db(rule.created_at),
                timefmt::to_db(rule.updated_at),
            ],
        )
        .map_err(storage("Save rule"))?;
        Self::write_quotas(&tx, &rule.id, &rule.user_quotas)?;
        tx.commit().map_err(storage("Commit"))?;
        Ok(())
    }

    async fn update_rule(&self, rule: &TransferRule, replace_quotas: bool) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin"))?;
        let updated = tx
            .execute(
                "UPDATE transfer_rules SET rule_name = ?2, description = ?3, enabled = ?4,
                 trigger_conditions = ?5, execution_window = ?6, distribution_config = ?7,
                 updated_at = ?8 WHERE id = ?1",
                params![
                    rule.id,
                    rule.rule_name,
                    rule.description,
                    rule.enabled as i32,
                    serde_json::to_string(&rule.trigger_conditions)?,
                    serde_json::to_string(&rule.execution_window)?,
                    serde_json::to_string(&rule.distribution_config)?,
                    timefmt::to_db(rule.updated_at),
                ],
            )
            .map_err(storage("Update rule"))?;
        if updated == 0 {
            return Err(LeadFlowError::RuleNotFound(rule.id.clone()));
        }
        if replace_quotas {
            Self::write_quotas(&tx, &rule.id, &rule.user_quotas)?;
        }
        tx.commit().map_err(storage("Commit"))?;
        Ok(())
    }

    async fn set_enabled(&self, rule_id: &str, enabled: bool, at: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE transfer_rules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i32, timefmt::to_db(at), rule_id],
            )
            .map_err(storage("Toggle rule"))?;
        Ok(updated > 0)
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM transfer_rules WHERE id = ?1", [rule_id])
            .map_err(storage("Delete rule"))?;
        Ok(deleted > 0)
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Option<TransferRule>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(&format!("{RULE_SELECT} WHERE id = ?1"), [rule_id], row_to_rule)
            .optional()
            .map_err(storage("Get rule"))?;
        row.map(|r| Self::assemble(&conn, r)).transpose()
    }

    async fn list_rules(&self) -> Result<Vec<TransferRule>> {
        self.query_rules(&format!("{RULE_SELECT} ORDER BY created_at DESC, rowid DESC"))
    }

    async fn enabled_rules(&self) -> Result<Vec<TransferRule>> {
        self.query_rules(&format!("{RULE_SELECT} WHERE enabled = 1 ORDER BY created_at, rowid"))
    }

    async fn increment_quota(
        &self,
        rule_id: &str,
        from_user_id: &str,
        to_user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin"))?;
        let out = tx
            .execute(
                "UPDATE rule_user_quotas
                 SET transferred_out = transferred_out + 1,
                     balance = transferred_out + 1 - transferred_in
                 WHERE rule_id = ?1 AND user_id = ?2",
                params![rule_id, from_user_id],
            )
            .map_err(storage("Increment quota"))?;
        let inn = tx
            .execute(
                "UPDATE rule_user_quotas
                 SET transferred_in = transferred_in + 1,
                     balance = transferred_out - (transferred_in + 1),
                     last_compensated_at = ?3
                 WHERE rule_id = ?1 AND user_id = ?2",
                params![rule_id, to_user_id, timefmt::to_db(at)],
            )
            .map_err(storage("Increment quota"))?;
        if out == 0 || inn == 0 {
            // dropping tx rolls back
            return Err(LeadFlowError::Storage(format!(
                "Increment quota: rule {rule_id} has no ledger for {from_user_id} -> {to_user_id}"
            )));
        }
        tx.commit().map_err(storage("Commit"))?;
        Ok(())
    }

    async fn record_execution(&self, rule_id: &str, transferred: u32, at: DateTime<Utc>) -> Result<()> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE transfer_rules
                 SET total_transferred = total_transferred + ?1,
                     last_executed_at = ?2,
                     last_transferred_count = ?1
                 WHERE id = ?3",
                params![transferred, timefmt::to_db(at), rule_id],
            )
            .map_err(storage("Record execution"))?;
        if updated == 0 {
            return Err(LeadFlowError::RuleNotFound(rule_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for TransferDb {
    async fn append_record(&self, record: &TransferRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO transfer_records
                 (id, rule_id, lead_id, from_user_id, to_user_id, snapshot, status, error_message, transferred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.rule_id,
                    record.lead_id,
                    record.from_user_id,
                    record.to_user_id,
                    serde_json::to_string(&record.snapshot)?,
                    record.status.as_str(),
                    record.error_message,
                    timefmt::to_db(record.transferred_at),
                ],
            )
            .map_err(storage("Save record"))?;
        Ok(())
    }

    async fn list_records(&self, filter: &RecordFilter, page: PageRequest) -> Result<RecordPage> {
        let mut clause = String::from(" WHERE 1 = 1");
        let mut args = Vec::new();
        push_eq(&mut clause, &mut args, "rule_id", filter.rule_id.as_deref());
        push_eq(&mut clause, &mut args, "lead_id", filter.lead_id.as_deref());
        push_eq(&mut clause, &mut args, "from_user_id", filter.from_user_id.as_deref());
        push_eq(&mut clause, &mut args, "to_user_id", filter.to_user_id.as_deref());
        push_eq(&mut clause, &mut args, "status", filter.status.as_ref().map(|s| s.as_str()));
        push_range(&mut clause, &mut args, "transferred_at", &filter.transferred);

        let total = self.count_records(&format!("SELECT COUNT(*) FROM transfer_records{clause}"), &args)?;

        let sql = format!(
            "{RECORD_SELECT}{clause} ORDER BY transferred_at DESC, rowid DESC LIMIT {} OFFSET {}",
            page.limit,
            page.offset()
        );
        let records = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql).map_err(storage("List records"))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), row_to_record)
                .map_err(storage("List records"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage("List records"))?
        };
        Ok(RecordPage::new(records, total, page))
    }

    async fn record_stats(&self, range: &DateRange) -> Result<RecordStats> {
        let mut clause = String::from(" WHERE status = ?1");
        let mut args = vec![RecordStatus::Success.as_str().to_string()];
        push_range(&mut clause, &mut args, "transferred_at", range);
        let success = self.count_records(&format!("SELECT COUNT(*) FROM transfer_records{clause}"), &args)?;
        args[0] = RecordStatus::Failed.as_str().to_string();
        let failed = self.count_records(&format!("SELECT COUNT(*) FROM transfer_records{clause}"), &args)?;
        Ok(RecordStats::from_counts(success, failed))
    }

    async fn user_stats(&self, user_id: &str, range: &DateRange) -> Result<UserTransferStats> {
        let mut clause = String::from(" WHERE status = 'success'");
        let mut args = Vec::new();
        push_eq(&mut clause, &mut args, "from_user_id", Some(user_id));
        push_range(&mut clause, &mut args, "transferred_at", range);
        let out = self.count_records(&format!("SELECT COUNT(*) FROM transfer_records{clause}"), &args)?;

        let mut clause = String::from(" WHERE status = 'success'");
        let mut args = Vec::new();
        push_eq(&mut clause, &mut args, "to_user_id", Some(user_id));
        push_range(&mut clause, &mut args, "transferred_at", range);
        let inn = self.count_records(&format!("SELECT COUNT(*) FROM transfer_records{clause}"), &args)?;

        Ok(UserTransferStats {
            user_id: user_id.to_string(),
            transferred_out: out,
            transferred_in: inn,
            balance: out as i64 - inn as i64,
        })
    }
}
