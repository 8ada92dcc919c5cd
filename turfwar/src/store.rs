//! Backing store for land claims.
//!
//! Every background worker that needs the store opens its own
//! connection through a StoreConnector, so no connection is ever
//! shared between threads.
use crate::claim::Claim;
use crate::result::{TurfError, TurfResult};
use postgres as pg;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Most rows in the recent activity document.
pub const RECENT_LIMIT: usize = 50;

const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_USER: &str = "turfwar";
const DEFAULT_DB_NAME: &str = "turfwar";

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS land (
        ip BIGINT PRIMARY KEY,
        nick TEXT NOT NULL,
        created BIGINT
    )";

/// Only touch an existing row when the nickname changes.
const UPSERT_SQL: &str = "
    INSERT INTO land (ip, nick, created) VALUES ($1, $2, $3)
    ON CONFLICT (ip) DO UPDATE SET nick = EXCLUDED.nick, created = EXCLUDED.created
    WHERE land.nick <> EXCLUDED.nick";

const SCORE_SQL: &str = "
    SELECT nick, ip >> 24, COUNT(*) FROM land
    GROUP BY nick, ip >> 24
    ORDER BY nick, 2";

const RECENT_SQL: &str = "
    SELECT ip, nick, created FROM land
    WHERE created IS NOT NULL
    ORDER BY created DESC
    LIMIT $1";

/// Count of addresses a nickname holds within one /8 block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreRow {
    pub nick: String,
    /// Top octet of the address.
    pub prefix: i64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentRow {
    pub ip: i64,
    pub nick: String,
    pub created: i64,
}

pub trait ClaimStore: Send {
    /// Apply a batch of claims as one transaction.
    fn upsert_claims(&mut self, claims: &[Claim]) -> TurfResult<()>;

    /// Leaderboard rows ordered by nickname then prefix.
    fn score_rows(&mut self) -> TurfResult<Vec<ScoreRow>>;

    /// Newest claims first.
    fn recent_rows(&mut self, limit: usize) -> TurfResult<Vec<RecentRow>>;
}

/// Opens store connections.  Shared by all workers.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> TurfResult<Box<dyn ClaimStore>>;
}

/// Collects PostgreSQL connection parameters.
///
/// Values are applied like so:
///
/// 1. Manually applying a value via set_* method
/// 2. Values provided via getopts::Matches struct.
/// 3. Values from a YAML `database:` section.
/// 4. Values pulled from the environment (e.g. PGHOST) where possible.
/// 5. Default values defined in this module.
#[derive(Debug, Clone, Default)]
pub struct PgConnectorBuilder {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
}

impl PgConnectorBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Add the database options to an in-progress getopts::Options.
    pub fn append_options(options: &mut getopts::Options) {
        options.optopt("", "db-host", "Database Host", "DB_HOST");
        options.optopt("", "db-port", "Database Port", "DB_PORT");
        options.optopt("", "db-user", "Database User", "DB_USER");
        options.optopt("", "db-pass", "Database Password", "DB_PASSWORD");
        options.optopt("", "db-name", "Database Name", "DB_NAME");
    }

    /// Set connection values via getopts matches.
    ///
    /// Values are only applied where values do not already exist.
    pub fn set_opts(&mut self, params: &getopts::Matches) -> TurfResult<()> {
        if self.host.is_none() {
            self.host = params.opt_str("db-host");
        }

        if self.user.is_none() {
            self.user = params.opt_str("db-user");
        }

        if self.password.is_none() {
            self.password = params.opt_str("db-pass");
        }

        if self.database.is_none() {
            self.database = params.opt_str("db-name");
        }

        if self.port.is_none() {
            if let Some(v) = params.opt_str("db-port") {
                let port = v
                    .parse::<u16>()
                    .map_err(|e| format!("Invalid --db-port '{v}': {e}"))?;
                self.port = Some(port);
            }
        }

        Ok(())
    }

    /// Apply values from a YAML `database:` section, again only
    /// where values do not already exist.
    pub fn fill_from_yaml(&mut self, node: &yaml_rust::Yaml) -> TurfResult<()> {
        if self.host.is_none() {
            self.host = node["host"].as_str().map(|s| s.to_string());
        }

        if self.user.is_none() {
            self.user = node["user"].as_str().map(|s| s.to_string());
        }

        if self.password.is_none() {
            self.password = node["pass"].as_str().map(|s| s.to_string());
        }

        if self.database.is_none() {
            self.database = node["name"].as_str().map(|s| s.to_string());
        }

        if self.port.is_none() {
            if let Some(p) = node["port"].as_i64() {
                let port = u16::try_from(p).map_err(|_| format!("Invalid database port: {p}"))?;
                self.port = Some(port);
            }
        }

        Ok(())
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = Some(host.to_string())
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn set_user(&mut self, user: &str) {
        self.user = Some(user.to_string());
    }

    pub fn set_password(&mut self, password: &str) {
        self.password = Some(password.to_string());
    }

    pub fn set_database(&mut self, database: &str) {
        self.database = Some(database.to_string());
    }

    fn from_env(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.is_empty())
    }

    /// Create the connector from the collected parameters.
    ///
    /// ```
    /// use turfwar::store::PgConnectorBuilder;
    ///
    /// let mut builder = PgConnectorBuilder::new();
    /// builder.set_host("db.example.org");
    /// builder.set_port(5433);
    /// builder.set_user("game");
    /// builder.set_database("land");
    ///
    /// let connector = builder.build().unwrap();
    /// assert_eq!(connector.dsn(), "host=db.example.org port=5433 user=game dbname=land");
    /// ```
    pub fn build(self) -> TurfResult<PgConnector> {
        let host = self
            .host
            .or_else(|| Self::from_env("PGHOST"))
            .unwrap_or_else(|| DEFAULT_DB_HOST.to_string());

        let user = self
            .user
            .or_else(|| Self::from_env("PGUSER"))
            .unwrap_or_else(|| DEFAULT_DB_USER.to_string());

        let database = self
            .database
            .or_else(|| Self::from_env("PGDATABASE"))
            .unwrap_or_else(|| DEFAULT_DB_NAME.to_string());

        let password = self.password.or_else(|| Self::from_env("PGPASS"));

        let port = match self.port {
            Some(p) => p,
            None => match Self::from_env("PGPORT") {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|e| format!("Invalid PGPORT '{p}': {e}"))?,
                None => DEFAULT_DB_PORT,
            },
        };

        let mut dsn = format!(
            "host={} port={port} user={} dbname={}",
            dsn_value(&host),
            dsn_value(&user),
            dsn_value(&database)
        );

        if let Some(ref p) = password {
            dsn += &format!(" password={}", dsn_value(p));
        }

        Ok(PgConnector {
            dsn,
            location: format!("{user}@{host}:{port}/{database}"),
        })
    }
}

/// Quote a connection string value when it holds anything the
/// key=value parser would split on or unescape.
///
/// ```
/// use turfwar::store::dsn_value;
///
/// assert_eq!(dsn_value("land"), "land");
/// assert_eq!(dsn_value("two words"), "'two words'");
/// assert_eq!(dsn_value(r"it's\"), r"'it\'s\\'");
/// assert_eq!(dsn_value(""), "''");
/// ```
pub fn dsn_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');

    if plain {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');

    quoted
}

#[derive(Clone)]
pub struct PgConnector {
    dsn: String,
    /// user@host:port/dbname, safe to log.
    location: String,
}

impl PgConnector {
    /// Full connection string, password included.  Never log this.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

impl fmt::Display for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PgConnector({})", self.location)
    }
}

impl StoreConnector for PgConnector {
    /// Non-TLS connections only.
    fn connect(&self) -> TurfResult<Box<dyn ClaimStore>> {
        log::debug!("Connecting to database at {self}");

        let mut client = pg::Client::connect(&self.dsn, pg::NoTls)?;
        client.batch_execute(SCHEMA_SQL)?;

        Ok(Box::new(PgStore { client }))
    }
}

pub struct PgStore {
    client: pg::Client,
}

impl ClaimStore for PgStore {
    fn upsert_claims(&mut self, claims: &[Claim]) -> TurfResult<()> {
        // Dropping an uncommitted transaction rolls it back.
        let mut tx = self.client.transaction()?;
        let stmt = tx.prepare(UPSERT_SQL)?;

        for claim in claims {
            tx.execute(&stmt, &[&claim.ip_number(), &claim.nick(), &claim.created()])?;
        }

        tx.commit()?;

        Ok(())
    }

    fn score_rows(&mut self) -> TurfResult<Vec<ScoreRow>> {
        let mut rows = Vec::new();

        for row in self.client.query(SCORE_SQL, &[])? {
            rows.push(ScoreRow {
                nick: row.try_get(0)?,
                prefix: row.try_get(1)?,
                count: row.try_get(2)?,
            });
        }

        Ok(rows)
    }

    fn recent_rows(&mut self, limit: usize) -> TurfResult<Vec<RecentRow>> {
        let limit = limit as i64;
        let mut rows = Vec::new();

        for row in self.client.query(RECENT_SQL, &[&limit])? {
            rows.push(RecentRow {
                ip: row.try_get(0)?,
                nick: row.try_get(1)?,
                created: row.try_get(2)?,
            });
        }

        Ok(rows)
    }
}

#[derive(Debug, Default)]
struct MemoryLand {
    /// ip => (nick, created)
    rows: HashMap<i64, (String, Option<i64>)>,
    /// Number of upcoming write batches which fail.
    failures: usize,
    connects: usize,
}

/// In-process store with the same upsert and query semantics as the
/// SQL store.  Clones share their data, so a test can hold one handle
/// while the server's workers use others.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    land: Arc<Mutex<MemoryLand>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLand> {
        self.land.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next N write batches fail as a dropped connection would.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failures = count;
    }

    /// How many times a connection has been opened.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Current (nick, created) for an address.
    pub fn owner(&self, ip: i64) -> Option<(String, Option<i64>)> {
        self.lock().rows.get(&ip).cloned()
    }

    /// Insert a row without going through a claim, e.g. legacy rows
    /// with no creation time.
    pub fn insert_row(&self, ip: i64, nick: &str, created: Option<i64>) {
        self.lock().rows.insert(ip, (nick.to_string(), created));
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self) -> TurfResult<Box<dyn ClaimStore>> {
        self.lock().connects += 1;
        Ok(Box::new(self.clone()))
    }
}

impl ClaimStore for MemoryStore {
    fn upsert_claims(&mut self, claims: &[Claim]) -> TurfResult<()> {
        let mut land = self.lock();

        if land.failures > 0 {
            land.failures -= 1;
            return Err(TurfError::Storage("connection reset".to_string()));
        }

        // Apply to a copy so the batch is all or nothing.
        let mut rows = land.rows.clone();

        for claim in claims {
            let fresh = (claim.nick().to_string(), Some(claim.created()));
            match rows.get_mut(&claim.ip_number()) {
                Some(row) => {
                    if row.0 != claim.nick() {
                        *row = fresh;
                    }
                }
                None => {
                    rows.insert(claim.ip_number(), fresh);
                }
            }
        }

        land.rows = rows;

        Ok(())
    }

    fn score_rows(&mut self) -> TurfResult<Vec<ScoreRow>> {
        let mut groups: BTreeMap<(String, i64), i64> = BTreeMap::new();

        for (ip, (nick, _)) in self.lock().rows.iter() {
            *groups.entry((nick.clone(), ip >> 24)).or_insert(0) += 1;
        }

        Ok(groups
            .into_iter()
            .map(|((nick, prefix), count)| ScoreRow {
                nick,
                prefix,
                count,
            })
            .collect())
    }

    fn recent_rows(&mut self, limit: usize) -> TurfResult<Vec<RecentRow>> {
        let mut rows: Vec<RecentRow> = self
            .lock()
            .rows
            .iter()
            .filter_map(|(ip, (nick, created))| {
                created.map(|created| RecentRow {
                    ip: *ip,
                    nick: nick.clone(),
                    created,
                })
            })
            .collect();

        rows.sort_by(|a, b| b.created.cmp(&a.created).then(a.ip.cmp(&b.ip)));
        rows.truncate(limit);

        Ok(rows)
    }
}
