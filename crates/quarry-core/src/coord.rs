//! Coordination store over a Sentinel-backed Redis primary.
//!
//! Master discovery is pub/sub-free: each configured sentinel endpoint is
//! asked `SENTINEL get-master-addr-by-name <master>` in order, and the first
//! answer wins. On connection loss every operation reconnects through the
//! same discovery path with jittered exponential backoff.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{Cmd, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::retry::BackoffPolicy;

pub struct CoordStore {
    sentinels: Vec<(String, u16)>,
    master_name: String,
    password: Option<String>,
    backoff: BackoffPolicy,
    conn: Mutex<Option<MultiplexedConnection>>,
}

/// Handle for a held advisory lock. Release through
/// [`CoordStore::release`]; releasing a lock that expired or was taken over
/// is a no-op.
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub key: String,
    token: String,
}

fn is_transient(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

impl CoordStore {
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let store = Self {
            sentinels: cfg.redis_sentinel_hosts.clone(),
            master_name: cfg.redis_master.clone(),
            password: cfg.redis_password.clone(),
            backoff: BackoffPolicy::default(),
            conn: Mutex::new(None),
        };
        store.reconnect().await?;
        Ok(store)
    }

    async fn discover_master(&self) -> Result<String> {
        for (host, port) in &self.sentinels {
            let url = format!("redis://{host}:{port}/");
            let client = match redis::Client::open(url.as_str()) {
                Ok(c) => c,
                Err(e) => {
                    warn!("bad sentinel url {url}: {e}");
                    continue;
                }
            };
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("sentinel {host}:{port} unreachable: {e}");
                    continue;
                }
            };
            let addr: Result<Option<(String, String)>, RedisError> = redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(&self.master_name)
                .query_async(&mut conn)
                .await;
            match addr {
                Ok(Some((master_host, master_port))) => {
                    debug!("sentinel {host}:{port} reports master at {master_host}:{master_port}");
                    let auth = match &self.password {
                        Some(p) => format!(":{p}@"),
                        None => String::new(),
                    };
                    return Ok(format!("redis://{auth}{master_host}:{master_port}/"));
                }
                Ok(None) => warn!("sentinel {host}:{port} does not know master '{}'", self.master_name),
                Err(e) => warn!("sentinel {host}:{port} query failed: {e}"),
            }
        }
        bail!("no sentinel answered for master '{}'", self.master_name)
    }

    async fn reconnect(&self) -> Result<()> {
        let policy = BackoffPolicy::reconnect();
        let mut attempt: u32 = 0;
        loop {
            match self.try_connect().await {
                Ok(conn) => {
                    *self.conn.lock().await = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(e).context("coordination store reconnect budget exhausted");
                    }
                    let delay = policy.delay(attempt - 1);
                    warn!("coordination store reconnect failed (attempt {attempt}): {e:#}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<MultiplexedConnection> {
        let master_url = self.discover_master().await?;
        let client = redis::Client::open(master_url.as_str()).context("open master url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to master")?;
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.conn.lock().await.clone() {
            return Ok(conn);
        }
        self.reconnect().await?;
        self.conn
            .lock()
            .await
            .clone()
            .context("coordination store has no connection after reconnect")
    }

    /// Run one command with the shared transient-retry policy.
    async fn run<T: redis::FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            let mut conn = self.connection().await?;
            let result: Result<T, RedisError> = cmd.query_async(&mut conn).await;
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) => {
                    attempt += 1;
                    *self.conn.lock().await = None;
                    if attempt >= self.backoff.max_attempts {
                        return Err(e).context("coordination store operation retries exhausted");
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!("coordination store transient error: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e).context("coordination store operation failed"),
            }
        }
    }

    // ── Strings ───────────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.run(redis::cmd("SET").arg(key).arg(value)).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.run(redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl.as_secs()))
            .await
    }

    /// Set if absent. Returns true when this caller created the key.
    pub async fn setnx(&self, key: &str, value: &str) -> Result<bool> {
        self.run(redis::cmd("SETNX").arg(key).arg(value)).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.run(redis::cmd("INCR").arg(key)).await
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let _: i64 = self.run(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: i64 = self.run(redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs())).await?;
        Ok(())
    }

    // ── Hashes ────────────────────────────────────────────────────────────

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.run(redis::cmd("HGET").arg(key).arg(field)).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self.run(redis::cmd("HSET").arg(key).arg(field).arg(value)).await?;
        Ok(())
    }

    pub async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.run(redis::cmd("HKEYS").arg(key)).await
    }

    // ── Sets ──────────────────────────────────────────────────────────────

    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.run(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    pub async fn sadd_all(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key);
        for m in members {
            cmd.arg(m);
        }
        let _: i64 = self.run(&cmd).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.run(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(())
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.run(redis::cmd("SISMEMBER").arg(key).arg(member)).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.run(redis::cmd("SMEMBERS").arg(key)).await
    }

    /// One arbitrary member, or None when the set is empty. The submission
    /// loop uses this as "pick one work item"; items stay in the set until
    /// explicitly removed.
    pub async fn srandmember(&self, key: &str) -> Result<Option<String>> {
        self.run(redis::cmd("SRANDMEMBER").arg(key)).await
    }

    // ── Lists ─────────────────────────────────────────────────────────────

    pub async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let _: i64 = self.run(redis::cmd("RPUSH").arg(key).arg(value)).await?;
        Ok(())
    }

    pub async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        self.run(redis::cmd("LINDEX").arg(key).arg(index)).await
    }

    // ── Advisory locks ────────────────────────────────────────────────────
    //
    // Single-node best-effort semantics with TTL: callers must tolerate lock
    // loss (treat as "another worker beat me") and write idempotently.

    /// Acquire `name`, blocking up to `wait`. Returns None on timeout.
    pub async fn lock(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Option<LockGuard>> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let acquired: Option<String> = self
                .run(
                    redis::cmd("SET")
                        .arg(name)
                        .arg(&token)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl.as_millis() as u64),
                )
                .await?;
            if acquired.is_some() {
                return Ok(Some(LockGuard {
                    key: name.to_string(),
                    token,
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Release an advisory lock. Idempotent: if the lock expired or another
    /// worker holds it now, nothing happens.
    pub async fn release(&self, guard: &LockGuard) -> Result<()> {
        let holder: Option<String> = self.get(&guard.key).await?;
        if holder.as_deref() == Some(guard.token.as_str()) {
            self.del(&guard.key).await?;
        }
        Ok(())
    }
}
