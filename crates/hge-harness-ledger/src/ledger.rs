// crates/hge-harness-ledger/src/ledger.rs
// ============================================================================
// Module: SQLite Port Ledger
// Description: Cross-process port reservations backed by SQLite.
// Purpose: Hand out unique ports to concurrently running harness workers.
// Dependencies: rand, rusqlite, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`PortLedger`] records every port the harness hands out together with its
//! owner (a pid or a container name). Claims are optimistic: a worker inserts
//! with `INSERT OR IGNORE` and then reads the row back, so exactly one writer
//! wins a contended port and the others move on to `port + 1` after a random
//! backoff. Every scan is bounded and ends in [`LedgerError::Exhausted`]
//! rather than looping forever.
//!
//! Entries left behind by crashed workers are swept whenever the ledger is
//! opened and before every reservation: rows whose owning process is gone,
//! and rows older than [`LedgerConfig::stale_after`].
//!
//! When the file cannot be opened the ledger runs in
//! [`LedgerMode::ProbeOnly`]: ports are chosen by probing loopback sockets and
//! only de-duplicated within the current process.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rand::Rng;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::probe::is_port_open;
use crate::process::current_pid;
use crate::process::is_process_alive;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Ledger schema version.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Age after which a reservation is considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);
/// Number of lost claims tolerated before a scan gives up.
pub const DEFAULT_CLAIM_RETRIES: u32 = 30;
/// Number of candidate ports inspected before a scan gives up.
pub const DEFAULT_SCAN_LIMIT: u32 = 1_000;
/// Lower bound of the randomized backoff after a lost claim (ms).
const DEFAULT_BACKOFF_MIN_MS: u64 = 100;
/// Upper bound of the randomized backoff after a lost claim (ms).
const DEFAULT_BACKOFF_MAX_MS: u64 = 1_500;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Port ledger configuration.
///
/// # Invariants
/// - `backoff_min_ms <= backoff_max_ms`.
/// - `claim_retries` and `scan_limit` are non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Path to the ledger database file.
    pub path: PathBuf,
    /// `SQLite` busy timeout (ms).
    pub busy_timeout_ms: u64,
    /// Reservation age after which the sweep removes an entry.
    pub stale_after: Duration,
    /// Lost claims tolerated per scan.
    pub claim_retries: u32,
    /// Candidate ports inspected per scan.
    pub scan_limit: u32,
    /// Minimum backoff after a lost claim (ms).
    pub backoff_min_ms: u64,
    /// Maximum backoff after a lost claim (ms).
    pub backoff_max_ms: u64,
}

impl LedgerConfig {
    /// Returns the default configuration for the ledger file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            stale_after: DEFAULT_STALE_AFTER,
            claim_retries: DEFAULT_CLAIM_RETRIES,
            scan_limit: DEFAULT_SCAN_LIMIT,
            backoff_min_ms: DEFAULT_BACKOFF_MIN_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }

    /// Validates configuration bounds.
    fn validate(&self) -> Result<(), LedgerError> {
        if self.claim_retries == 0 || self.scan_limit == 0 {
            return Err(LedgerError::Invalid(
                "claim_retries and scan_limit must be greater than zero".to_string(),
            ));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(LedgerError::Invalid(
                "backoff_min_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Types
// ============================================================================

/// Owner of a reserved port. A row has at most one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortOwner {
    /// Local process id.
    Process(u32),
    /// Docker container name.
    Container(String),
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(pid) => write!(f, "pid: {pid}"),
            Self::Container(name) => write!(f, "docker container name: {name}"),
        }
    }
}

/// A live ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedPort {
    /// Reserved TCP port.
    pub port: u16,
    /// Current owner.
    pub owner: Option<PortOwner>,
    /// Optional service label, for example `pgbouncer`.
    pub service: Option<String>,
    /// Reservation time in unix milliseconds.
    pub reserved_at_ms: i64,
}

/// Operating mode of a [`PortLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// Reservations are shared through the ledger file.
    Shared,
    /// No ledger file; loopback probing only.
    ProbeOnly,
}

/// Result of a single claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimOutcome {
    /// The candidate now belongs to this worker.
    Claimed,
    /// The candidate is bound on the host or already in the ledger.
    Taken,
    /// Another worker won the insert race.
    Lost,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Port ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem error around the ledger file.
    #[error("port ledger io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("port ledger db error: {0}")]
    Db(String),
    /// Ledger schema version mismatch.
    #[error("port ledger version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid configuration or stored data.
    #[error("port ledger invalid data: {0}")]
    Invalid(String),
    /// A bounded scan ran out of candidates or retries.
    #[error("no free port from {start} (last tried {last}, {attempts} candidates inspected)")]
    Exhausted {
        /// First candidate port.
        start: u16,
        /// Last candidate port inspected.
        last: u16,
        /// Number of candidates inspected.
        attempts: u32,
    },
}

// ============================================================================
// SECTION: Ledger
// ============================================================================

/// Storage behind a [`PortLedger`].
enum Backend {
    /// Shared ledger file.
    Sqlite(Mutex<Connection>),
    /// Ports handed out by this process while running without a ledger file.
    ProbeOnly(Mutex<BTreeSet<u16>>),
}

/// Cross-process port reservation ledger.
///
/// # Invariants
/// - A port appears in at most one row.
/// - Rows claimed by [`PortLedger::reserve`] are owned by the claiming pid
///   until reassigned with [`PortLedger::assign_process`] or
///   [`PortLedger::assign_container`].
pub struct PortLedger {
    /// Ledger configuration.
    config: LedgerConfig,
    /// Backing storage.
    backend: Backend,
    /// Pid recorded as owner of fresh claims.
    claimant: u32,
}

impl PortLedger {
    /// Opens (creating when needed) the ledger file and sweeps stale entries.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the file cannot be opened or initialized.
    pub fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| LedgerError::Io(err.to_string()))?;
        }
        let mut connection = open_connection(&config)?;
        initialize_schema(&mut connection)?;
        let removed = sweep_stale(&connection, config.stale_after)?;
        if removed > 0 {
            debug!(removed, "swept stale port reservations");
        }
        info!(path = %config.path.display(), "port ledger opened");
        Ok(Self {
            config,
            backend: Backend::Sqlite(Mutex::new(connection)),
            claimant: current_pid(),
        })
    }

    /// Opens the ledger, falling back to [`LedgerMode::ProbeOnly`] on failure.
    #[must_use]
    pub fn open_or_probe_only(config: LedgerConfig) -> Self {
        let path = config.path.clone();
        match Self::open(config.clone()) {
            Ok(ledger) => ledger,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "port ledger unavailable; parallel runs may collide on ports"
                );
                Self::probe_only(config)
            }
        }
    }

    /// Returns a ledger that only probes host sockets.
    #[must_use]
    pub fn probe_only(config: LedgerConfig) -> Self {
        Self {
            config,
            backend: Backend::ProbeOnly(Mutex::new(BTreeSet::new())),
            claimant: current_pid(),
        }
    }

    /// Returns the operating mode.
    #[must_use]
    pub const fn mode(&self) -> LedgerMode {
        match self.backend {
            Backend::Sqlite(_) => LedgerMode::Shared,
            Backend::ProbeOnly(_) => LedgerMode::ProbeOnly,
        }
    }

    /// Returns the ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Reserves the first free port at or above `start`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Exhausted`] when the bounded scan finds nothing,
    /// or a database error when the sweep fails.
    pub fn reserve(&self, start: u16) -> Result<u16, LedgerError> {
        let connection = match &self.backend {
            Backend::Sqlite(connection) => connection,
            Backend::ProbeOnly(handed_out) => return self.reserve_by_probe(start, handed_out),
        };
        {
            let guard = lock(connection)?;
            sweep_stale(&guard, self.config.stale_after)?;
        }

        let mut candidate = start;
        let mut attempts = 0u32;
        let mut lost = 0u32;
        loop {
            if attempts >= self.config.scan_limit || lost >= self.config.claim_retries {
                return Err(LedgerError::Exhausted {
                    start,
                    last: candidate,
                    attempts,
                });
            }
            attempts += 1;
            match self.try_claim(connection, candidate) {
                Ok(ClaimOutcome::Claimed) => {
                    info!(port = candidate, "reserved port");
                    return Ok(candidate);
                }
                Ok(ClaimOutcome::Taken) => {}
                Ok(ClaimOutcome::Lost) => {
                    lost += 1;
                    debug!(port = candidate, retries_left = self.config.claim_retries - lost, "lost port claim");
                    self.backoff();
                }
                Err(err) => {
                    lost += 1;
                    warn!(port = candidate, retries_left = self.config.claim_retries - lost, error = %err, "port claim failed");
                    self.backoff();
                }
            }
            candidate = candidate.checked_add(1).ok_or(LedgerError::Exhausted {
                start,
                last: candidate,
                attempts,
            })?;
        }
    }

    /// Records `pid` as the owner of `port`. The reservation age restarts.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be updated.
    pub fn assign_process(
        &self,
        port: u16,
        pid: u32,
        service: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.assign(port, Some(pid), None, service)
    }

    /// Records container `name` as the owner of `port`. The reservation age
    /// restarts, so the TTL sweep measures time since the last hand-over.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be updated.
    pub fn assign_container(
        &self,
        port: u16,
        name: &str,
        service: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.assign(port, None, Some(name), service)
    }

    /// Deletes every entry owned by `owner` and returns the released ports.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be updated.
    pub fn release_owner(&self, owner: &PortOwner) -> Result<Vec<u16>, LedgerError> {
        let Backend::Sqlite(connection) = &self.backend else {
            return Ok(Vec::new());
        };
        let guard = lock(connection)?;
        let ports = match owner {
            PortOwner::Process(pid) => {
                let ports = select_ports(
                    &guard,
                    "SELECT port FROM reserved_ports WHERE process_id = ?1 ORDER BY port",
                    i64::from(*pid),
                )?;
                guard
                    .execute("DELETE FROM reserved_ports WHERE process_id = ?1", params![i64::from(*pid)])
                    .map_err(|err| LedgerError::Db(err.to_string()))?;
                ports
            }
            PortOwner::Container(name) => {
                let ports = select_ports(
                    &guard,
                    "SELECT port FROM reserved_ports WHERE container_name = ?1 ORDER BY port",
                    name.as_str(),
                )?;
                guard
                    .execute("DELETE FROM reserved_ports WHERE container_name = ?1", params![name])
                    .map_err(|err| LedgerError::Db(err.to_string()))?;
                ports
            }
        };
        for port in &ports {
            info!(port, owner = %owner, "released port");
        }
        Ok(ports)
    }

    /// Deletes the entries for `ports`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be updated.
    pub fn release_ports(&self, ports: &[u16]) -> Result<(), LedgerError> {
        match &self.backend {
            Backend::Sqlite(connection) => {
                let guard = lock(connection)?;
                for port in ports {
                    info!(port, "released port");
                    guard
                        .execute("DELETE FROM reserved_ports WHERE port = ?1", params![i64::from(*port)])
                        .map_err(|err| LedgerError::Db(err.to_string()))?;
                }
            }
            Backend::ProbeOnly(handed_out) => {
                let mut guard = lock(handed_out)?;
                for port in ports {
                    guard.remove(port);
                }
            }
        }
        Ok(())
    }

    /// Returns true when `port` has a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be read.
    pub fn is_reserved(&self, port: u16) -> Result<bool, LedgerError> {
        match &self.backend {
            Backend::Sqlite(connection) => {
                let guard = lock(connection)?;
                port_in_ledger(&guard, port)
            }
            Backend::ProbeOnly(handed_out) => Ok(lock(handed_out)?.contains(&port)),
        }
    }

    /// Lists all live entries ordered by port.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be read.
    pub fn list_reserved(&self) -> Result<Vec<ReservedPort>, LedgerError> {
        let Backend::Sqlite(connection) = &self.backend else {
            return Ok(Vec::new());
        };
        let guard = lock(connection)?;
        let mut statement = guard
            .prepare(
                "SELECT port, process_id, container_name, service_name, reserved_at
                 FROM reserved_ports ORDER BY port",
            )
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        let rows = statement
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        let mut entries = Vec::new();
        for row in rows {
            let (port, process_id, container_name, service, reserved_at_ms) =
                row.map_err(|err| LedgerError::Db(err.to_string()))?;
            let owner = match (process_id, container_name) {
                (_, Some(name)) => Some(PortOwner::Container(name)),
                (Some(pid), None) => Some(PortOwner::Process(
                    u32::try_from(pid)
                        .map_err(|_| LedgerError::Invalid(format!("invalid pid {pid}")))?,
                )),
                (None, None) => None,
            };
            entries.push(ReservedPort {
                port: port_from_row(port)?,
                owner,
                service,
                reserved_at_ms,
            });
        }
        Ok(entries)
    }

    /// Removes entries whose owner process is gone or which outlived the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be updated.
    pub fn sweep_stale(&self) -> Result<usize, LedgerError> {
        let Backend::Sqlite(connection) = &self.backend else {
            return Ok(0);
        };
        let guard = lock(connection)?;
        sweep_stale(&guard, self.config.stale_after)
    }

    /// Registers an HPC coverage (`.tix`) file by absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the path cannot be resolved or stored.
    pub fn add_hpc_file(&self, path: &Path) -> Result<(), LedgerError> {
        let Backend::Sqlite(connection) = &self.backend else {
            return Ok(());
        };
        let absolute = std::path::absolute(path).map_err(|err| LedgerError::Io(err.to_string()))?;
        let filename = absolute
            .to_str()
            .ok_or_else(|| LedgerError::Invalid("hpc file path must be utf-8".to_string()))?;
        let guard = lock(connection)?;
        guard
            .execute("INSERT OR IGNORE INTO hpc_files (filename) VALUES (?1)", params![filename])
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        Ok(())
    }

    /// Lists registered HPC coverage files.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be read.
    pub fn hpc_files(&self) -> Result<Vec<PathBuf>, LedgerError> {
        let Backend::Sqlite(connection) = &self.backend else {
            return Ok(Vec::new());
        };
        let guard = lock(connection)?;
        let mut statement = guard
            .prepare("SELECT filename FROM hpc_files ORDER BY filename")
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        let rows = statement
            .query_map(params![], |row| row.get::<_, String>(0))
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        rows.map(|row| row.map(PathBuf::from).map_err(|err| LedgerError::Db(err.to_string())))
            .collect()
    }

    /// Attempts to claim `candidate` for this worker.
    fn try_claim(
        &self,
        connection: &Mutex<Connection>,
        candidate: u16,
    ) -> Result<ClaimOutcome, LedgerError> {
        {
            let guard = lock(connection)?;
            if port_in_ledger(&guard, candidate)? {
                return Ok(ClaimOutcome::Taken);
            }
        }
        if is_port_open(candidate) {
            return Ok(ClaimOutcome::Taken);
        }
        let token = claim_token(self.claimant);
        let guard = lock(connection)?;
        guard
            .execute(
                "INSERT OR IGNORE INTO reserved_ports
                    (port, process_id, container_name, service_name, reserved_at, claim_token)
                 VALUES (?1, ?2, NULL, NULL, ?3, ?4)",
                params![i64::from(candidate), i64::from(self.claimant), unix_millis(), token],
            )
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        let winner: Option<Option<String>> = guard
            .query_row(
                "SELECT claim_token FROM reserved_ports WHERE port = ?1",
                params![i64::from(candidate)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        if winner.flatten().as_deref() == Some(token.as_str()) {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Lost)
        }
    }

    /// Scans loopback sockets when no ledger file is available.
    fn reserve_by_probe(
        &self,
        start: u16,
        handed_out: &Mutex<BTreeSet<u16>>,
    ) -> Result<u16, LedgerError> {
        let mut guard = lock(handed_out)?;
        let mut candidate = start;
        for attempts in 1..=self.config.scan_limit {
            if !guard.contains(&candidate) && !is_port_open(candidate) {
                guard.insert(candidate);
                info!(port = candidate, "reserved port (probe only)");
                return Ok(candidate);
            }
            candidate = candidate.checked_add(1).ok_or(LedgerError::Exhausted {
                start,
                last: candidate,
                attempts,
            })?;
        }
        Err(LedgerError::Exhausted {
            start,
            last: candidate,
            attempts: self.config.scan_limit,
        })
    }

    /// Upserts the owner columns for `port` and restarts its TTL.
    fn assign(
        &self,
        port: u16,
        pid: Option<u32>,
        container: Option<&str>,
        service: Option<&str>,
    ) -> Result<(), LedgerError> {
        let Backend::Sqlite(connection) = &self.backend else {
            return Ok(());
        };
        let pid = pid.map(i64::from);
        let guard = lock(connection)?;
        guard
            .execute(
                "INSERT OR IGNORE INTO reserved_ports
                    (port, process_id, container_name, service_name, reserved_at, claim_token)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![i64::from(port), pid, container, service, unix_millis()],
            )
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        guard
            .execute(
                "UPDATE reserved_ports
                 SET process_id = ?2, container_name = ?3, service_name = ?4, reserved_at = ?5
                 WHERE port = ?1",
                params![i64::from(port), pid, container, service, unix_millis()],
            )
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        match service {
            Some(service) => info!(port, service, "reserving port"),
            None => info!(port, "reserving port"),
        }
        Ok(())
    }

    /// Sleeps for a random interval inside the configured backoff window.
    fn backoff(&self) {
        let millis =
            rand::thread_rng().gen_range(self.config.backoff_min_ms..=self.config.backoff_max_ms);
        thread::sleep(Duration::from_millis(millis));
    }
}

// ============================================================================
// SECTION: SQLite Helpers
// ============================================================================

/// Opens a `SQLite` connection with the ledger pragmas applied.
fn open_connection(config: &LedgerConfig) -> Result<Connection, LedgerError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    connection
        .execute_batch("PRAGMA journal_mode = wal; PRAGMA synchronous = normal;")
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    Ok(connection)
}

/// Creates the ledger tables or validates the existing schema version.
fn initialize_schema(connection: &mut Connection) -> Result<(), LedgerError> {
    let tx = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS ledger_meta (version INTEGER NOT NULL);")
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM ledger_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    match version {
        None => {
            tx.execute("INSERT INTO ledger_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| LedgerError::Db(err.to_string()))?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS reserved_ports (
                    port INTEGER PRIMARY KEY NOT NULL,
                    process_id INTEGER,
                    container_name TEXT,
                    service_name TEXT,
                    reserved_at INTEGER NOT NULL,
                    claim_token TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_reserved_ports_process
                    ON reserved_ports (process_id);
                CREATE INDEX IF NOT EXISTS idx_reserved_ports_container
                    ON reserved_ports (container_name);
                CREATE TABLE IF NOT EXISTS hpc_files (
                    filename TEXT PRIMARY KEY NOT NULL
                );",
            )
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(LedgerError::VersionMismatch(format!(
                "expected schema version {SCHEMA_VERSION}, found {other}"
            )));
        }
    }
    tx.commit().map_err(|err| LedgerError::Db(err.to_string()))
}

/// Deletes entries of dead owner processes and entries past `stale_after`.
fn sweep_stale(connection: &Connection, stale_after: Duration) -> Result<usize, LedgerError> {
    let mut statement = connection
        .prepare("SELECT DISTINCT process_id FROM reserved_ports WHERE process_id IS NOT NULL")
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    let pids = statement
        .query_map(params![], |row| row.get::<_, i64>(0))
        .map_err(|err| LedgerError::Db(err.to_string()))?
        .collect::<Result<Vec<i64>, _>>()
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    drop(statement);

    let mut removed = 0usize;
    for pid in pids {
        let alive = u32::try_from(pid).is_ok_and(is_process_alive);
        if alive {
            continue;
        }
        let deleted = connection
            .execute("DELETE FROM reserved_ports WHERE process_id = ?1", params![pid])
            .map_err(|err| LedgerError::Db(err.to_string()))?;
        if deleted > 0 {
            info!(pid, deleted, "removed ports of exited process");
        }
        removed += deleted;
    }

    let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
    let cutoff = unix_millis().saturating_sub(stale_ms);
    let expired = connection
        .execute("DELETE FROM reserved_ports WHERE reserved_at < ?1", params![cutoff])
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    if expired > 0 {
        info!(expired, "removed expired port reservations");
    }
    Ok(removed + expired)
}

/// Returns true when `port` has a row.
fn port_in_ledger(connection: &Connection, port: u16) -> Result<bool, LedgerError> {
    let count: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM reserved_ports WHERE port = ?1",
            params![i64::from(port)],
            |row| row.get(0),
        )
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    Ok(count > 0)
}

/// Runs a single-parameter port query.
fn select_ports<P: rusqlite::ToSql>(
    connection: &Connection,
    query: &str,
    param: P,
) -> Result<Vec<u16>, LedgerError> {
    let mut statement = connection.prepare(query).map_err(|err| LedgerError::Db(err.to_string()))?;
    let rows = statement
        .query_map(params![param], |row| row.get::<_, i64>(0))
        .map_err(|err| LedgerError::Db(err.to_string()))?;
    let mut ports = Vec::new();
    for row in rows {
        ports.push(port_from_row(row.map_err(|err| LedgerError::Db(err.to_string()))?)?);
    }
    Ok(ports)
}

/// Converts a stored port value.
fn port_from_row(value: i64) -> Result<u16, LedgerError> {
    u16::try_from(value).map_err(|_| LedgerError::Invalid(format!("invalid port {value}")))
}

/// Locks a mutex, mapping poisoning to a ledger error.
fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, LedgerError> {
    mutex.lock().map_err(|_| LedgerError::Db("mutex poisoned".to_string()))
}

/// Builds a claim token unique to this attempt.
fn claim_token(pid: u32) -> String {
    format!("{pid}-{:016x}", rand::random::<u64>())
}

/// Returns the current unix timestamp in milliseconds.
fn unix_millis() -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
