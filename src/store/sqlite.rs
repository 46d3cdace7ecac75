//! SQLite-backed store

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{may_supersede, OutcomeWrite, Store};
use crate::budget::BudgetSnapshot;
use crate::reliability::record::{DealAnalysisRecord, OutcomeKind, OutcomeRecord};
use crate::reliability::score::CarrierTrackRecord;
use crate::reliability::thresholds::ThresholdSet;
use crate::types::{Route, RouteCode, SeasonalWindow, Tier};

const THRESHOLDS_KEY: &str = "thresholds";
const BUDGET_KEY: &str = "budget";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS routes (
                origin TEXT NOT NULL,
                destination TEXT NOT NULL,
                tier TEXT NOT NULL,
                scans_per_day REAL,
                last_probe TEXT,
                last_attempt TEXT,
                probe_count INTEGER NOT NULL DEFAULT 0,
                accepted_deals INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                season_start TEXT,
                season_end TEXT,
                PRIMARY KEY (origin, destination)
            );

            CREATE TABLE IF NOT EXISTS prices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT NOT NULL,
                destination TEXT NOT NULL,
                price REAL NOT NULL,
                observed_at TEXT NOT NULL
            );

            -- Full record as JSON; indexed columns duplicate what queries filter on
            CREATE TABLE IF NOT EXISTS analyses (
                id TEXT PRIMARY KEY,
                origin TEXT NOT NULL,
                destination TEXT NOT NULL,
                carrier TEXT NOT NULL,
                decision TEXT NOT NULL,
                analyzed_at TEXT NOT NULL,
                outcome_kind TEXT,
                outcome_authority INTEGER,
                record TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_prices_route ON prices(origin, destination, observed_at);
            CREATE INDEX IF NOT EXISTS idx_analyses_analyzed ON analyses(analyzed_at);
            CREATE INDEX IF NOT EXISTS idx_analyses_carrier ON analyses(carrier);
        "#)?;

        Ok(())
    }

    fn row_to_route(row: &Row<'_>) -> rusqlite::Result<RawRoute> {
        Ok(RawRoute {
            origin: row.get(0)?,
            destination: row.get(1)?,
            tier: row.get(2)?,
            scans_per_day: row.get(3)?,
            last_probe: row.get(4)?,
            last_attempt: row.get(5)?,
            probe_count: row.get(6)?,
            accepted_deals: row.get(7)?,
            failure_count: row.get(8)?,
            consecutive_failures: row.get(9)?,
            active: row.get(10)?,
            season_start: row.get(11)?,
            season_end: row.get(12)?,
        })
    }

    async fn load_state<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        value
            .map(|v| serde_json::from_str(&v).with_context(|| format!("Corrupt {} state", key)))
            .transpose()
    }

    async fn save_state<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
            params![key, json, ts(Utc::now())],
        )?;
        Ok(())
    }
}

/// Route row as stored, before parsing text columns
struct RawRoute {
    origin: String,
    destination: String,
    tier: String,
    scans_per_day: Option<f64>,
    last_probe: Option<String>,
    last_attempt: Option<String>,
    probe_count: i64,
    accepted_deals: i64,
    failure_count: i64,
    consecutive_failures: i64,
    active: bool,
    season_start: Option<String>,
    season_end: Option<String>,
}

impl RawRoute {
    fn into_route(self) -> Result<Route> {
        let tier: Tier = self.tier.parse().map_err(anyhow::Error::msg)?;
        let season = match (self.season_start, self.season_end) {
            (Some(start), Some(end)) => Some(SeasonalWindow {
                start: NaiveDate::parse_from_str(&start, "%Y-%m-%d")?,
                end: NaiveDate::parse_from_str(&end, "%Y-%m-%d")?,
            }),
            _ => None,
        };

        Ok(Route {
            code: RouteCode::new(self.origin, self.destination),
            tier,
            scans_per_day: self.scans_per_day,
            last_probe: self.last_probe.as_deref().map(parse_ts).transpose()?,
            last_attempt: self.last_attempt.as_deref().map(parse_ts).transpose()?,
            probe_count: self.probe_count.max(0) as u64,
            accepted_deals: self.accepted_deals.max(0) as u64,
            failure_count: self.failure_count.max(0) as u64,
            consecutive_failures: self.consecutive_failures.clamp(0, u32::MAX as i64) as u32,
            active: self.active,
            season,
        })
    }
}

/// Fixed-width RFC 3339 so text comparison orders correctly
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn outcome_kind_str(kind: OutcomeKind) -> &'static str {
    match kind {
        OutcomeKind::GenuineDeal => "genuine_deal",
        OutcomeKind::PricingError => "pricing_error",
        OutcomeKind::Expired => "expired",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_routes(&self) -> Result<Vec<Route>> {
        let raw: Vec<RawRoute> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                r#"SELECT origin, destination, tier, scans_per_day, last_probe, last_attempt,
                          probe_count, accepted_deals, failure_count, consecutive_failures,
                          active, season_start, season_end
                   FROM routes ORDER BY origin, destination"#,
            )?;
            let rows = stmt.query_map([], Self::row_to_route)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        raw.into_iter().map(RawRoute::into_route).collect()
    }

    async fn upsert_route(&self, route: &Route) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO routes
               (origin, destination, tier, scans_per_day, last_probe, last_attempt,
                probe_count, accepted_deals, failure_count, consecutive_failures,
                active, season_start, season_end)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
               ON CONFLICT(origin, destination) DO UPDATE SET
                tier = excluded.tier,
                scans_per_day = excluded.scans_per_day,
                active = excluded.active,
                season_start = excluded.season_start,
                season_end = excluded.season_end"#,
            params![
                route.code.origin,
                route.code.destination,
                route.tier.as_str(),
                route.scans_per_day,
                route.last_probe.map(ts),
                route.last_attempt.map(ts),
                route.probe_count as i64,
                route.accepted_deals as i64,
                route.failure_count as i64,
                route.consecutive_failures as i64,
                route.active,
                route.season.map(|s| s.start.format("%Y-%m-%d").to_string()),
                route.season.map(|s| s.end.format("%Y-%m-%d").to_string()),
            ],
        )?;
        Ok(())
    }

    async fn update_schedule(
        &self,
        code: &RouteCode,
        tier: Tier,
        scans_per_day: Option<f64>,
        active: bool,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"UPDATE routes SET tier = ?3, scans_per_day = ?4, active = ?5
               WHERE origin = ?1 AND destination = ?2"#,
            params![code.origin, code.destination, tier.as_str(), scans_per_day, active],
        )?;
        Ok(changed > 0)
    }

    async fn record_probe(&self, code: &RouteCode, at: DateTime<Utc>, accepted: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"UPDATE routes SET
                probe_count = probe_count + 1,
                accepted_deals = accepted_deals + ?3,
                last_probe = ?4,
                last_attempt = ?4,
                consecutive_failures = 0
               WHERE origin = ?1 AND destination = ?2"#,
            params![code.origin, code.destination, accepted as i64, ts(at)],
        )?;
        Ok(())
    }

    async fn record_failure(&self, code: &RouteCode, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"UPDATE routes SET
                failure_count = failure_count + 1,
                consecutive_failures = consecutive_failures + 1,
                last_attempt = ?3
               WHERE origin = ?1 AND destination = ?2"#,
            params![code.origin, code.destination, ts(at)],
        )?;
        Ok(())
    }

    async fn record_price(&self, code: &RouteCode, price: f64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO prices (origin, destination, price, observed_at) VALUES (?1, ?2, ?3, ?4)",
            params![code.origin, code.destination, price, ts(at)],
        )?;
        Ok(())
    }

    async fn average_price(&self, code: &RouteCode, since: DateTime<Utc>) -> Result<Option<f64>> {
        let conn = self.conn.lock().await;
        let average: Option<f64> = conn.query_row(
            r#"SELECT AVG(price) FROM prices
               WHERE origin = ?1 AND destination = ?2 AND observed_at >= ?3"#,
            params![code.origin, code.destination, ts(since)],
            |row| row.get(0),
        )?;
        Ok(average)
    }

    async fn save_analysis(&self, record: &DealAnalysisRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO analyses
               (id, origin, destination, carrier, decision, analyzed_at,
                outcome_kind, outcome_authority, record)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                record.id,
                record.probe.route.origin,
                record.probe.route.destination,
                record.probe.carrier,
                record.decision.as_str(),
                ts(record.analyzed_at),
                record.outcome.as_ref().map(|o| outcome_kind_str(o.kind)),
                record.outcome.as_ref().map(|o| o.evidence.authority.rank()),
                json,
            ],
        )?;
        Ok(())
    }

    async fn get_analysis(&self, id: &str) -> Result<Option<DealAnalysisRecord>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row("SELECT record FROM analyses WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).context("Corrupt analysis record"))
            .transpose()
    }

    async fn resolve_outcome(&self, id: &str, outcome: &OutcomeRecord) -> Result<OutcomeWrite> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let json: Option<String> = tx
            .query_row("SELECT record FROM analyses WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let Some(json) = json else {
            return Ok(OutcomeWrite::NotFound);
        };
        let mut record: DealAnalysisRecord =
            serde_json::from_str(&json).context("Corrupt analysis record")?;

        if !may_supersede(&record, outcome) {
            return Ok(OutcomeWrite::Conflict(record));
        }

        record.outcome = Some(outcome.clone());
        tx.execute(
            r#"UPDATE analyses SET outcome_kind = ?2, outcome_authority = ?3, record = ?4
               WHERE id = ?1"#,
            params![
                id,
                outcome_kind_str(outcome.kind),
                outcome.evidence.authority.rank(),
                serde_json::to_string(&record)?,
            ],
        )?;
        tx.commit()?;

        Ok(OutcomeWrite::Written(record))
    }

    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<DealAnalysisRecord>> {
        let rows: Vec<String> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                r#"SELECT record FROM analyses
                   WHERE outcome_kind IS NOT NULL AND analyzed_at >= ?1
                   ORDER BY analyzed_at"#,
            )?;
            let rows = stmt.query_map(params![ts(since)], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        rows.iter()
            .map(|j| serde_json::from_str(j).context("Corrupt analysis record"))
            .collect()
    }

    async fn carrier_track_record(&self, carrier: &str) -> Result<CarrierTrackRecord> {
        let conn = self.conn.lock().await;
        let (resolved, genuine): (i64, i64) = conn.query_row(
            r#"SELECT COUNT(*), COALESCE(SUM(outcome_kind = 'genuine_deal'), 0)
               FROM analyses WHERE carrier = ?1 AND outcome_kind IS NOT NULL"#,
            params![carrier],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CarrierTrackRecord {
            resolved: resolved.max(0) as u64,
            genuine: genuine.max(0) as u64,
        })
    }

    async fn load_thresholds(&self) -> Result<Option<ThresholdSet>> {
        self.load_state(THRESHOLDS_KEY).await
    }

    async fn save_thresholds(&self, set: &ThresholdSet) -> Result<()> {
        self.save_state(THRESHOLDS_KEY, set).await
    }

    async fn load_budget(&self) -> Result<Option<BudgetSnapshot>> {
        self.load_state(BUDGET_KEY).await
    }

    async fn save_budget(&self, snapshot: &BudgetSnapshot) -> Result<()> {
        self.save_state(BUDGET_KEY, snapshot).await
    }
}
