//! SQLite CRM backend: leads, users, assignment logs and follow-up timeline.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::lead::{AssignmentLog, Lead, LeadFilter, OwnerChange, UserRole};
use leadflow_core::timefmt;
use leadflow_core::traits::lead_store::LeadStore;
use leadflow_core::traits::user_directory::UserDirectory;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SqliteCrm {
    conn: Mutex<Connection>,
}

/// Shared SELECT column list for lead queries.
const LEAD_SELECT: &str = "SELECT id, lead_number, name, owner_id, status, lead_source, last_activity_at, updated_at, created_at, in_public_pool, auto_transfer_enabled, transfer_count, assignment_reason, assigned_by, assigned_at, last_transferred_at FROM leads";

fn ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(timefmt::from_db)
}

fn row_to_lead(row: &rusqlite::Row) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        lead_number: row.get(1)?,
        name: row.get(2)?,
        owner_id: row.get(3)?,
        status: row.get(4)?,
        lead_source: row.get(5)?,
        last_activity_at: ts(row.get(6)?),
        updated_at: ts(row.get(7)?).unwrap_or_default(),
        created_at: ts(row.get(8)?).unwrap_or_default(),
        in_public_pool: row.get::<_, i32>(9)? != 0,
        auto_transfer_enabled: row.get::<_, Option<i32>>(10)?.map(|v| v != 0),
        transfer_count: row.get(11)?,
        assignment_reason: row.get(12)?,
        assigned_by: row.get(13)?,
        assigned_at: ts(row.get(14)?),
        last_transferred_at: ts(row.get(15)?),
    })
}

/// Append `AND column IN (?, ?, ...)` and its bind values.
fn push_in(sql: &mut String, args: &mut Vec<String>, column: &str, values: &[String]) {
    if values.is_empty() {
        sql.push_str(" AND 1 = 0");
        return;
    }
    let start = args.len();
    let marks: Vec<String> = (0..values.len())
        .map(|i| format!("?{}", start + i + 1))
        .collect();
    sql.push_str(&format!(" AND {column} IN ({})", marks.join(", ")));
    args.extend(values.iter().cloned());
}

impl SqliteCrm {
    /// Open or create the CRM database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| LeadFlowError::Storage(format!("CRM DB open error: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| LeadFlowError::Storage(format!("CRM DB pragma error: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LeadFlowError::Storage(format!("CRM DB open error: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadFlowError::Storage(format!("Lock: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'sales',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                lead_number TEXT NOT NULL,
                name TEXT NOT NULL,
                owner_id TEXT,
                status TEXT NOT NULL,
                lead_source TEXT,
                last_activity_at TEXT,
                updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                in_public_pool INTEGER NOT NULL DEFAULT 0,
                auto_transfer_enabled INTEGER,          -- NULL = not set
                transfer_count INTEGER NOT NULL DEFAULT 0,
                assignment_reason TEXT,
                assigned_by TEXT,
                assigned_at TEXT,
                last_transferred_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_leads_owner_status ON leads(owner_id, status);

            CREATE TABLE IF NOT EXISTS assignment_logs (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                old_owner_id TEXT,
                new_owner_id TEXT NOT NULL,
                assigned_by TEXT NOT NULL,
                reason TEXT NOT NULL,
                assigned_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_assignment_logs_lead ON assignment_logs(lead_id, assigned_at);

            CREATE TABLE IF NOT EXISTS lead_timeline (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL,
                content TEXT NOT NULL,
                author_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| LeadFlowError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────

    /// Insert or replace a staff user.
    pub fn upsert_user(&self, id: &str, name: &str, role: &UserRole) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO users (id, name, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, role.as_str(), timefmt::to_db(Utc::now())],
            )
            .map_err(|e| LeadFlowError::Storage(format!("Save user: {e}")))?;
        Ok(())
    }

    // ─── Leads ──────────────────────────────────────────────

    /// Insert or replace a lead.
    pub fn insert_lead(&self, lead: &Lead) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO leads
                 (id, lead_number, name, owner_id, status, lead_source, last_activity_at, updated_at,
                  created_at, in_public_pool, auto_transfer_enabled, transfer_count, assignment_reason,
                  assigned_by, assigned_at, last_transferred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    lead.id,
                    lead.lead_number,
                    lead.name,
                    lead.owner_id,
                    lead.status,
                    lead.lead_source,
                    lead.last_activity_at.map(timefmt::to_db),
                    timefmt::to_db(lead.updated_at),
                    timefmt::to_db(lead.created_at),
                    lead.in_public_pool as i32,
                    lead.auto_transfer_enabled.map(|v| v as i32),
                    lead.transfer_count,
                    lead.assignment_reason,
                    lead.assigned_by,
                    lead.assigned_at.map(timefmt::to_db),
                    lead.last_transferred_at.map(timefmt::to_db),
                ],
            )
            .map_err(|e| LeadFlowError::Storage(format!("Save lead: {e}")))?;
        Ok(())
    }

    /// All leads, in insertion order.
    pub fn list_leads(&self) -> Result<Vec<Lead>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{LEAD_SELECT} ORDER BY rowid"))
            .map_err(|e| LeadFlowError::Storage(format!("List leads: {e}")))?;
        let rows = stmt
            .query_map([], row_to_lead)
            .map_err(|e| LeadFlowError::Storage(format!("List leads: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Assignment history of one lead, oldest first.
    pub fn assignment_logs(&self, lead_id: &str) -> Result<Vec<AssignmentLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, lead_id, old_owner_id, new_owner_id, assigned_by, reason, assigned_at
                 FROM assignment_logs WHERE lead_id = ?1 ORDER BY rowid",
            )
            .map_err(|e| LeadFlowError::Storage(format!("Assignment logs: {e}")))?;
        let rows = stmt
            .query_map([lead_id], |row| {
                Ok(AssignmentLog {
                    id: row.get(0)?,
                    lead_id: row.get(1)?,
                    old_owner_id: row.get(2)?,
                    new_owner_id: row.get(3)?,
                    assigned_by: row.get(4)?,
                    reason: row.get(5)?,
                    assigned_at: ts(row.get(6)?).unwrap_or_default(),
                })
            })
            .map_err(|e| LeadFlowError::Storage(format!("Assignment logs: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Timeline notes of one lead as `(author_id, content)`, oldest first.
    pub fn timeline(&self, lead_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT author_id, content FROM lead_timeline WHERE lead_id = ?1 ORDER BY id")
            .map_err(|e| LeadFlowError::Storage(format!("Timeline: {e}")))?;
        let rows = stmt
            .query_map([lead_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| LeadFlowError::Storage(format!("Timeline: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ─── Demo data ──────────────────────────────────────────

    /// Populate a small team and a backlog of idle leads.
    /// Returns the number of leads inserted.
    pub fn seed_demo(&self, now: DateTime<Utc>) -> Result<usize> {
        self.upsert_user("admin", "Administrator", &UserRole::Admin)?;
        self.upsert_user("alice", "Alice", &UserRole::Sales)?;
        self.upsert_user("bob", "Bob", &UserRole::Sales)?;
        self.upsert_user("carol", "Carol", &UserRole::Sales)?;

        let owners = ["alice", "alice", "bob", "carol"];
        let statuses = ["pending", "matching"];
        let mut inserted = 0;
        for i in 0..24 {
            let idle = 24 + (i as i64 * 7) % 96;
            let lead = Lead {
                id: uuid::Uuid::new_v4().to_string(),
                lead_number: format!("CUS-{:06}", i + 1),
                name: format!("Demo lead {}", i + 1),
                owner_id: Some(owners[i % owners.len()].to_string()),
                status: statuses[i % statuses.len()].to_string(),
                lead_source: Some(if i % 3 == 0 { "douyin" } else { "meituan" }.to_string()),
                last_activity_at: Some(now - Duration::hours(idle)),
                updated_at: now - Duration::hours(idle),
                created_at: now - Duration::days(30),
                in_public_pool: false,
                auto_transfer_enabled: None,
                transfer_count: 0,
                assignment_reason: None,
                assigned_by: None,
                assigned_at: None,
                last_transferred_at: None,
            };
            self.insert_lead(&lead)?;
            inserted += 1;
        }
        tracing::info!("🌱 Seeded {} demo leads", inserted);
        Ok(inserted)
    }
}

#[async_trait]
impl LeadStore for SqliteCrm {
    async fn find(&self, filter: &LeadFilter) -> Result<Vec<Lead>> {
        let mut sql = format!(
            "{LEAD_SELECT} WHERE in_public_pool = 0
             AND (auto_transfer_enabled IS NULL OR auto_transfer_enabled != 0)
             AND COALESCE(last_activity_at, updated_at) < ?1"
        );
        let mut args = vec![timefmt::to_db(filter.inactive_before)];
        push_in(&mut sql, &mut args, "owner_id", &filter.owner_ids);
        push_in(&mut sql, &mut args, "status", &filter.statuses);
        if !filter.lead_sources.is_empty() {
            push_in(&mut sql, &mut args, "lead_source", &filter.lead_sources);
        }
        if let Some(from) = filter.created_from {
            args.push(timefmt::to_db(from));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(to) = filter.created_to {
            args.push(timefmt::to_db(to));
            sql.push_str(&format!(" AND created_at <= ?{}", args.len()));
        }
        sql.push_str(&format!(" ORDER BY rowid LIMIT {}", filter.limit));

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| LeadFlowError::Storage(format!("Find leads: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_lead)
            .map_err(|e| LeadFlowError::Storage(format!("Find leads: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn get(&self, lead_id: &str) -> Result<Option<Lead>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{LEAD_SELECT} WHERE id = ?1"))
            .map_err(|e| LeadFlowError::Storage(format!("Get lead: {e}")))?;
        let mut rows = stmt
            .query_map([lead_id], row_to_lead)
            .map_err(|e| LeadFlowError::Storage(format!("Get lead: {e}")))?;
        match rows.next() {
            Some(row) => row
                .map(Some)
                .map_err(|e| LeadFlowError::Storage(format!("Get lead: {e}"))),
            None => Ok(None),
        }
    }

    async fn update_owner(&self, change: &OwnerChange) -> Result<bool> {
        let at = timefmt::to_db(change.at);
        // `IS` so an expected NULL owner matches a pooled lead
        let updated = self
            .conn()?
            .execute(
                "UPDATE leads SET owner_id = ?1, assigned_by = ?2, assigned_at = ?3,
                 assignment_reason = ?4, last_activity_at = ?3, updated_at = ?3,
                 last_transferred_at = ?3, transfer_count = transfer_count + 1
                 WHERE id = ?5 AND owner_id IS ?6",
                params![
                    change.new_owner_id,
                    change.assigned_by,
                    at,
                    change.reason,
                    change.lead_id,
                    change.expected_owner_id,
                ],
            )
            .map_err(|e| LeadFlowError::Storage(format!("Update owner: {e}")))?;
        if updated == 0 {
            tracing::debug!(
                "🔒 Lead {} no longer owned by {:?}, write skipped",
                change.lead_id,
                change.expected_owner_id
            );
        }
        Ok(updated > 0)
    }

    async fn append_assignment_log(&self, log: &AssignmentLog) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO assignment_logs
                 (id, lead_id, old_owner_id, new_owner_id, assigned_by, reason, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    log.id,
                    log.lead_id,
                    log.old_owner_id,
                    log.new_owner_id,
                    log.assigned_by,
                    log.reason,
                    timefmt::to_db(log.assigned_at),
                ],
            )
            .map_err(|e| LeadFlowError::Storage(format!("Assignment log: {e}")))?;
        Ok(())
    }

    async fn append_timeline_note(&self, lead_id: &str, note: &str, author_id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO lead_timeline (lead_id, content, author_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![lead_id, note, author_id, timefmt::to_db(Utc::now())],
            )
            .map_err(|e| LeadFlowError::Storage(format!("Timeline note: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SqliteCrm {
    async fn resolve_names(&self, user_ids: &[String]) -> Result<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM users WHERE id = ?1")
            .map_err(|e| LeadFlowError::Storage(format!("Resolve names: {e}")))?;
        let mut names = HashMap::new();
        for id in user_ids {
            let mut rows = stmt
                .query([id])
                .map_err(|e| LeadFlowError::Storage(format!("Resolve names: {e}")))?;
            if let Some(row) = rows
                .next()
                .map_err(|e| LeadFlowError::Storage(format!("Resolve names: {e}")))?
            {
                let name: String = row
                    .get(0)
                    .map_err(|e| LeadFlowError::Storage(format!("Resolve names: {e}")))?;
                names.insert(id.clone(), name);
            }
        }
        Ok(names)
    }

    async fn role_of(&self, user_id: &str) -> Result<Option<UserRole>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT role FROM users WHERE id = ?1")
            .map_err(|e| LeadFlowError::Storage(format!("Role lookup: {e}")))?;
        let mut rows = stmt
            .query([user_id])
            .map_err(|e| LeadFlowError::Storage(format!("Role lookup: {e}")))?;
        match rows
            .next()
            .map_err(|e| LeadFlowError::Storage(format!("Role lookup: {e}")))?
        {
            Some(row) => {
                let role: String = row
                    .get(0)
                    .map_err(|e| LeadFlowError::Storage(format!("Role lookup: {e}")))?;
                Ok(Some(UserRole::parse(&role)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(id: &str, owner: &str, idle_hours: i64, now: DateTime<Utc>) -> Lead {
        Lead {
            id: id.into(),
            lead_number: format!("CUS-{id}"),
            name: format!("Lead {id}"),
            owner_id: Some(owner.into()),
            status: "pending".into(),
            lead_source: Some("douyin".into()),
            last_activity_at: Some(now - Duration::hours(idle_hours)),
            updated_at: now - Duration::hours(idle_hours),
            created_at: now - Duration::days(5),
            in_public_pool: false,
            auto_transfer_enabled: None,
            transfer_count: 0,
            assignment_reason: None,
            assigned_by: None,
            assigned_at: None,
            last_transferred_at: None,
        }
    }

    fn filter(now: DateTime<Utc>) -> LeadFilter {
        LeadFilter {
            owner_ids: vec!["alice".into()],
            statuses: vec!["pending".into()],
            inactive_before: now - Duration::hours(48),
            lead_sources: vec![],
            created_from: None,
            created_to: None,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_find_applies_compound_filter() {
        let db = SqliteCrm::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_lead(&lead("idle", "alice", 49, now)).unwrap();
        db.insert_lead(&lead("fresh", "alice", 47, now)).unwrap();
        db.insert_lead(&lead("other-owner", "bob", 80, now)).unwrap();

        let mut pooled = lead("pooled", "alice", 80, now);
        pooled.in_public_pool = true;
        db.insert_lead(&pooled).unwrap();

        let mut opted_out = lead("opted-out", "alice", 80, now);
        opted_out.auto_transfer_enabled = Some(false);
        db.insert_lead(&opted_out).unwrap();

        let mut no_activity = lead("no-activity", "alice", 0, now);
        no_activity.last_activity_at = None;
        no_activity.updated_at = now - Duration::hours(100);
        db.insert_lead(&no_activity).unwrap();

        let found = db.find(&filter(now)).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["idle", "no-activity"]);

        // SQL and reference evaluation agree
        for l in db.list_leads().unwrap() {
            assert_eq!(filter(now).matches(&l), ids.contains(&l.id.as_str()), "{}", l.id);
        }
    }

    #[tokio::test]
    async fn test_find_sources_range_and_limit() {
        let db = SqliteCrm::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            db.insert_lead(&lead(&format!("l{i}"), "alice", 60, now)).unwrap();
        }
        let mut f = filter(now);
        f.limit = 3;
        assert_eq!(db.find(&f).await.unwrap().len(), 3);

        f.limit = 100;
        f.lead_sources = vec!["meituan".into()];
        assert!(db.find(&f).await.unwrap().is_empty());

        f.lead_sources.clear();
        f.created_to = Some(now - Duration::days(6));
        assert!(db.find(&f).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_owner_resets_activity() {
        let db = SqliteCrm::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_lead(&lead("l1", "alice", 60, now)).unwrap();

        let change = |lead_id: &str, expected: &str, to: &str| OwnerChange {
            lead_id: lead_id.into(),
            expected_owner_id: Some(expected.into()),
            new_owner_id: to.into(),
            assigned_by: "system".into(),
            reason: "auto-transfer: test".into(),
            at: now,
        };

        assert!(db.update_owner(&change("l1", "alice", "bob")).await.unwrap());

        let l = db.get("l1").await.unwrap().unwrap();
        assert_eq!(l.owner_id.as_deref(), Some("bob"));
        assert_eq!(l.transfer_count, 1);
        assert_eq!(l.inactive_hours(now), 0);
        assert_eq!(l.assignment_reason.as_deref(), Some("auto-transfer: test"));

        assert!(!db.update_owner(&change("nope", "alice", "bob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_owner_requires_expected_owner() {
        let db = SqliteCrm::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_lead(&lead("l1", "alice", 60, now)).unwrap();

        let mut first = OwnerChange {
            lead_id: "l1".into(),
            expected_owner_id: Some("alice".into()),
            new_owner_id: "bob".into(),
            assigned_by: "system".into(),
            reason: "auto-transfer: test".into(),
            at: now,
        };
        assert!(db.update_owner(&first).await.unwrap());

        // a second writer that also read "alice" loses
        first.new_owner_id = "carol".into();
        assert!(!db.update_owner(&first).await.unwrap());

        let l = db.get("l1").await.unwrap().unwrap();
        assert_eq!(l.owner_id.as_deref(), Some("bob"));
        assert_eq!(l.transfer_count, 1);
    }

    #[tokio::test]
    async fn test_users_and_audit_rows() {
        let db = SqliteCrm::open_in_memory().unwrap();
        db.upsert_user("u1", "Alice", &UserRole::Manager).unwrap();

        let names = db.resolve_names(&["u1".into(), "ghost".into()]).await.unwrap();
        assert_eq!(names.get("u1").map(String::as_str), Some("Alice"));
        assert!(!names.contains_key("ghost"));
        assert_eq!(db.role_of("u1").await.unwrap(), Some(UserRole::Manager));
        assert_eq!(db.role_of("ghost").await.unwrap(), None);

        db.append_timeline_note("l1", "moved", "system").await.unwrap();
        assert_eq!(db.timeline("l1").unwrap(), vec![("system".to_string(), "moved".to_string())]);
    }

    #[test]
    fn test_seed_demo() {
        let db = SqliteCrm::open_in_memory().unwrap();
        assert_eq!(db.seed_demo(Utc::now()).unwrap(), 24);
        assert_eq!(db.list_leads().unwrap().len(), 24);
    }
}
