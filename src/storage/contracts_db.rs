use crate::analyzer::{RiskLevel, VulnerabilityCounts};
use crate::orchestrator::ScanResult;
use alloy::primitives::{Address, B256};
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_DB_PATH: &str = "chainguard.db";

/// Cap on the durable alert log. Older entries are pruned on insert.
const ALERT_LOG_CAP: usize = 100;

static LAST_DB_NOW_MS: AtomicU64 = AtomicU64::new(1);

fn normalize_now_ms(sample_ms: Option<u64>) -> u64 {
    let mut prev = LAST_DB_NOW_MS.load(Ordering::Relaxed);
    loop {
        let normalized = sample_ms.unwrap_or(prev).max(prev).max(1);
        match LAST_DB_NOW_MS.compare_exchange_weak(
            prev,
            normalized,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return normalized,
            Err(actual) => prev = actual,
        }
    }
}

fn now_ms() -> u64 {
    let sample = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64);
    normalize_now_ms(sample)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(info, _)
            if matches!(
                info.code,
                rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
            )
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Pending,
    Scanned,
    Failed,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Scanned => "scanned",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "scanned" => Some(Self::Scanned),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Scanned | ScanStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStatusCounts {
    pub pending: u64,
    pub scanned: u64,
    pub failed: u64,
}

impl ScanStatusCounts {
    pub fn total(self) -> u64 {
        self.pending
            .saturating_add(self.scanned)
            .saturating_add(self.failed)
    }
}

/// One row per observed address. `code_hash` is the dedup key together with
/// the address: a redeploy with different bytecode re-enters Pending.
#[derive(Debug, Clone)]
pub struct ContractRecord {
    pub address: Address,
    pub network: String,
    pub deployer: Option<Address>,
    pub block_number: u64,
    pub code_hash: B256,
    pub status: ScanStatus,
    pub fail_reason: Option<String>,
    pub last_scan_ms: Option<u64>,
    pub counts: VulnerabilityCounts,
    pub report_cid: Option<String>,
    pub tx_hash: Option<B256>,
}

#[derive(Debug, Clone)]
pub struct AlertLogEntry {
    pub address: Address,
    pub network: String,
    pub risk_level: RiskLevel,
    pub message: String,
    pub created_at_ms: u64,
}

#[derive(Clone)]
pub struct ContractsDb {
    path: PathBuf,
}

impl ContractsDb {
    pub fn open_default() -> anyhow::Result<Self> {
        Self::open(DEFAULT_DB_PATH)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS contracts (
                    address TEXT PRIMARY KEY NOT NULL,
                    network TEXT NOT NULL,
                    deployer TEXT,
                    block_number INTEGER NOT NULL,
                    code_hash TEXT NOT NULL,
                    scan_status TEXT NOT NULL,
                    fail_reason TEXT,
                    last_scan_ms INTEGER,
                    critical INTEGER NOT NULL DEFAULT 0,
                    high INTEGER NOT NULL DEFAULT 0,
                    medium INTEGER NOT NULL DEFAULT 0,
                    low INTEGER NOT NULL DEFAULT 0,
                    report_cid TEXT,
                    tx_hash TEXT,
                    updated_at_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_contracts_scan_status ON contracts(scan_status);
                CREATE INDEX IF NOT EXISTS idx_contracts_network ON contracts(network);

                CREATE TABLE IF NOT EXISTS scan_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    address TEXT NOT NULL,
                    network TEXT NOT NULL,
                    code_hash TEXT NOT NULL,
                    risk_level TEXT NOT NULL,
                    overall_score INTEGER NOT NULL,
                    findings_json TEXT NOT NULL,
                    report_cid TEXT NOT NULL,
                    report_offline INTEGER NOT NULL DEFAULT 0,
                    report_id INTEGER,
                    certificate_id INTEGER,
                    tx_hash TEXT,
                    created_at_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_scan_results_address ON scan_results(address);

                CREATE TABLE IF NOT EXISTS alert_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    address TEXT NOT NULL,
                    network TEXT NOT NULL,
                    risk_level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS watch_cursors (
                    network TEXT PRIMARY KEY NOT NULL,
                    last_block INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );
                "#,
            )
        })
        .map(|_| ())
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let max_attempts = 6u32;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            let conn = Connection::open(&self.path).with_context(|| {
                format!("failed to open sqlite database {}", self.path.display())
            })?;
            conn.busy_timeout(Duration::from_millis(5_000))
                .context("failed to configure sqlite busy timeout")?;

            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err.to_string();
                    if is_sqlite_locked_error(&err) && attempt < max_attempts {
                        continue;
                    }
                    return Err(anyhow::anyhow!(
                        "{} failed for {}: {}",
                        context,
                        self.path.display(),
                        last_err
                    ));
                }
            }
        }

        Err(anyhow::anyhow!(
            "{} failed for {} after {} attempt(s): {}",
            context,
            self.path.display(),
            max_attempts,
            last_err
        ))
    }

    /// Compare-and-set claim on a deployment fingerprint.
    ///
    /// Returns `true` when this caller owns the Pending row (unseen address,
    /// or a known address redeployed with different bytecode). Returns
    /// `false` when a row for the same `(address, code_hash)` already exists
    /// in any status, terminal or in-flight. A single upsert statement so two
    /// pollers racing on the same deployment cannot both win.
    pub fn claim_pending(
        &self,
        address: Address,
        network: &str,
        deployer: Option<Address>,
        block_number: u64,
        code_hash: B256,
    ) -> anyhow::Result<bool> {
        let address_hex = format!("{address:#x}");
        let deployer_hex = deployer.map(|d| format!("{d:#x}"));
        let hash_hex = format!("{code_hash:#x}");
        let now = to_i64(now_ms());
        let block = to_i64(block_number);
        let changed = self.with_connection("claim_pending", |conn| {
            conn.execute(
                r#"
                INSERT INTO contracts
                    (address, network, deployer, block_number, code_hash, scan_status, updated_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                ON CONFLICT(address) DO UPDATE SET
                    network = excluded.network,
                    deployer = excluded.deployer,
                    block_number = excluded.block_number,
                    code_hash = excluded.code_hash,
                    scan_status = 'pending',
                    fail_reason = NULL,
                    last_scan_ms = NULL,
                    critical = 0, high = 0, medium = 0, low = 0,
                    report_cid = NULL,
                    tx_hash = NULL,
                    updated_at_ms = excluded.updated_at_ms
                WHERE contracts.code_hash != excluded.code_hash
                "#,
                params![address_hex, network, deployer_hex, block, hash_hex, now],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn fingerprint_status(
        &self,
        address: Address,
        code_hash: B256,
    ) -> anyhow::Result<Option<ScanStatus>> {
        let address_hex = format!("{address:#x}");
        let hash_hex = format!("{code_hash:#x}");
        let status = self
            .with_connection("fingerprint_status", |conn| {
                conn.query_row(
                    "SELECT scan_status FROM contracts WHERE address = ?1 AND code_hash = ?2 LIMIT 1",
                    params![address_hex, hash_hex],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })?
            .and_then(|raw| ScanStatus::from_db(raw.trim()));
        Ok(status)
    }

    pub fn record(&self, address: Address) -> anyhow::Result<Option<ContractRecord>> {
        let address_hex = format!("{address:#x}");
        self.with_connection("record", |conn| {
            conn.query_row(
                r#"SELECT address, network, deployer, block_number, code_hash, scan_status,
                          fail_reason, last_scan_ms, critical, high, medium, low,
                          report_cid, tx_hash
                   FROM contracts WHERE address = ?1 LIMIT 1"#,
                params![address_hex],
                row_to_record,
            )
            .optional()
        })
    }

    /// Terminal success transition, unconditional relative to on-chain
    /// availability: the row is marked scanned even when `onchain` is absent.
    /// Also appends the result to the append-only scan_results log.
    pub fn mark_scanned(&self, result: &ScanResult, code_hash: B256) -> anyhow::Result<()> {
        let address_hex = format!("{:#x}", result.address);
        let hash_hex = format!("{code_hash:#x}");
        let findings_json =
            serde_json::to_string(&result.findings).unwrap_or_else(|_| "[]".to_string());
        let counts = VulnerabilityCounts::from_findings(&result.findings);
        let tx_hash_hex = result.onchain.as_ref().map(|o| format!("{:#x}", o.tx_hash));
        let report_id = result.onchain.as_ref().and_then(|o| o.report_id).map(to_i64);
        let certificate_id = result
            .onchain
            .as_ref()
            .and_then(|o| o.certificate_id)
            .map(to_i64);
        let now = to_i64(now_ms());

        self.with_connection("mark_scanned", |conn| {
            conn.execute(
                r#"UPDATE contracts SET
                       scan_status = 'scanned',
                       fail_reason = NULL,
                       last_scan_ms = ?3,
                       critical = ?4, high = ?5, medium = ?6, low = ?7,
                       report_cid = ?8,
                       tx_hash = ?9,
                       updated_at_ms = ?3
                   WHERE address = ?1 AND code_hash = ?2"#,
                params![
                    address_hex,
                    hash_hex,
                    now,
                    to_i64(counts.critical),
                    to_i64(counts.high),
                    to_i64(counts.medium),
                    to_i64(counts.low),
                    result.report_cid,
                    tx_hash_hex,
                ],
            )?;
            conn.execute(
                r#"INSERT INTO scan_results
                       (address, network, code_hash, risk_level, overall_score, findings_json,
                        report_cid, report_offline, report_id, certificate_id, tx_hash, created_at_ms)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
                params![
                    address_hex,
                    result.network,
                    hash_hex,
                    result.risk_level.as_str(),
                    result.overall_score as i64,
                    findings_json,
                    result.report_cid,
                    result.report_offline as i64,
                    report_id,
                    certificate_id,
                    tx_hash_hex,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Hard-terminal transition: no scan result was produced.
    pub fn mark_failed(
        &self,
        address: Address,
        code_hash: B256,
        reason: &str,
    ) -> anyhow::Result<()> {
        let address_hex = format!("{address:#x}");
        let hash_hex = format!("{code_hash:#x}");
        let now = to_i64(now_ms());
        self.with_connection("mark_failed", |conn| {
            conn.execute(
                r#"UPDATE contracts SET
                       scan_status = 'failed', fail_reason = ?3,
                       last_scan_ms = ?4, updated_at_ms = ?4
                   WHERE address = ?1 AND code_hash = ?2"#,
                params![address_hex, hash_hex, reason, now],
            )
        })
        .map(|_| ())
    }

    pub fn record_alert(
        &self,
        address: Address,
        network: &str,
        risk_level: RiskLevel,
        message: &str,
    ) -> anyhow::Result<()> {
        let address_hex = format!("{address:#x}");
        let now = to_i64(now_ms());
        self.with_connection("record_alert", |conn| {
            conn.execute(
                "INSERT INTO alert_log (address, network, risk_level, message, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![address_hex, network, risk_level.as_str(), message, now],
            )?;
            conn.execute(
                "DELETE FROM alert_log WHERE id NOT IN
                     (SELECT id FROM alert_log ORDER BY id DESC LIMIT ?1)",
                params![ALERT_LOG_CAP as i64],
            )?;
            Ok(())
        })
    }

    pub fn recent_alerts(&self, limit: usize) -> anyhow::Result<Vec<AlertLogEntry>> {
        self.with_connection("recent_alerts", |conn| {
            let mut stmt = conn.prepare(
                "SELECT address, network, risk_level, message, created_at_ms
                 FROM alert_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            let mut alerts = Vec::new();
            for row in rows {
                let (address_raw, network, risk_raw, message, created) = row?;
                let Ok(address) = Address::from_str(address_raw.trim()) else {
                    continue;
                };
                let Some(risk_level) = RiskLevel::from_db(risk_raw.trim()) else {
                    continue;
                };
                alerts.push(AlertLogEntry {
                    address,
                    network,
                    risk_level,
                    message,
                    created_at_ms: created.max(0) as u64,
                });
            }
            Ok(alerts)
        })
    }

    pub fn cursor(&self, network: &str) -> anyhow::Result<Option<u64>> {
        self.with_connection("cursor", |conn| {
            conn.query_row(
                "SELECT last_block FROM watch_cursors WHERE network = ?1 LIMIT 1",
                params![network],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })
        .map(|opt| opt.map(|v| v.max(0) as u64))
    }

    /// The cursor only moves forward; stale writes from a lagging tick are
    /// ignored.
    pub fn advance_cursor(&self, network: &str, block: u64) -> anyhow::Result<()> {
        let now = to_i64(now_ms());
        let block = to_i64(block);
        self.with_connection("advance_cursor", |conn| {
            conn.execute(
                r#"INSERT INTO watch_cursors (network, last_block, updated_at_ms)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(network) DO UPDATE SET
                       last_block = excluded.last_block,
                       updated_at_ms = excluded.updated_at_ms
                   WHERE excluded.last_block > watch_cursors.last_block"#,
                params![network, block, now],
            )
        })
        .map(|_| ())
    }

    pub fn status_counts(&self) -> anyhow::Result<ScanStatusCounts> {
        self.with_connection("status_counts", |conn| {
            let mut stmt =
                conn.prepare("SELECT scan_status, COUNT(*) FROM contracts GROUP BY scan_status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = ScanStatusCounts::default();
            for row in rows {
                let (status_raw, count_raw) = row?;
                let count = if count_raw <= 0 { 0 } else { count_raw as u64 };
                match ScanStatus::from_db(status_raw.trim()) {
                    Some(ScanStatus::Pending) => counts.pending = count,
                    Some(ScanStatus::Scanned) => counts.scanned = count,
                    Some(ScanStatus::Failed) => counts.failed = count,
                    None => {}
                }
            }
            Ok(counts)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContractRecord> {
    let address_raw: String = row.get(0)?;
    let network: String = row.get(1)?;
    let deployer_raw: Option<String> = row.get(2)?;
    let block_number: i64 = row.get(3)?;
    let hash_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let fail_reason: Option<String> = row.get(6)?;
    let last_scan_ms: Option<i64> = row.get(7)?;
    let critical: i64 = row.get(8)?;
    let high: i64 = row.get(9)?;
    let medium: i64 = row.get(10)?;
    let low: i64 = row.get(11)?;
    let report_cid: Option<String> = row.get(12)?;
    let tx_hash_raw: Option<String> = row.get(13)?;

    let address = Address::from_str(address_raw.trim())
        .map_err(|e| rusqlite::Error::InvalidColumnName(format!("address: {e}")))?;
    let code_hash = B256::from_str(hash_raw.trim())
        .map_err(|e| rusqlite::Error::InvalidColumnName(format!("code_hash: {e}")))?;
    let status = ScanStatus::from_db(status_raw.trim())
        .ok_or_else(|| rusqlite::Error::InvalidColumnName(format!("scan_status: {status_raw}")))?;

    Ok(ContractRecord {
        address,
        network,
        deployer: deployer_raw.and_then(|d| Address::from_str(d.trim()).ok()),
        block_number: block_number.max(0) as u64,
        code_hash,
        status,
        fail_reason,
        last_scan_ms: last_scan_ms.map(|v| v.max(0) as u64),
        counts: VulnerabilityCounts {
            critical: critical.max(0) as u64,
            high: high.max(0) as u64,
            medium: medium.max(0) as u64,
            low: low.max(0) as u64,
        },
        report_cid,
        tx_hash: tx_hash_raw.and_then(|h| B256::from_str(h.trim()).ok()),
    })
}
