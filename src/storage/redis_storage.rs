//! Redis-backed storage for distributed rate limiting.

use dashmap::DashMap;
use parking_lot::Mutex;
use redis::{Client, Connection, ConnectionLike, RedisError, RedisResult};
use std::time::Duration;
use tracing::{debug, warn};

use super::{format_number, ttl_millis, Script, Storage, StorageResult};
use crate::config::RedisConfig;
use crate::error::{BackendUnavailable, Result, TurnstileError};

/// Storage on a Redis server shared by many processes.
///
/// No client-side lock can serialize callers in other processes, so every
/// operation maps to a single command, a `MULTI`/`EXEC` transaction, or a
/// server-side Lua script.
pub struct RedisStorage {
    client: Client,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    connect_timeout: Duration,
    io_timeout: Duration,
    scripts: DashMap<&'static str, redis::Script>,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("server", &self.client.get_connection_info().addr)
            .field("max_idle", &self.max_idle)
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

impl RedisStorage {
    /// Parse `url` and prepare a client. No connection is made here; an
    /// unreachable server surfaces as [`BackendUnavailable`] on first use.
    pub fn open(url: &str, config: &RedisConfig) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| TurnstileError::ConfigInvalid(format!("bad redis url: {}", e)))?;

        debug!(server = %client.get_connection_info().addr, "Redis storage configured");

        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            max_idle: config.max_idle_connections,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
            io_timeout: Duration::from_millis(config.io_timeout_ms.max(1)),
            scripts: DashMap::new(),
        })
    }

    fn checkout(&self) -> StorageResult<Connection> {
        if let Some(connection) = self.idle.lock().pop() {
            return Ok(connection);
        }
        let connection = self
            .client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(unavailable)?;
        connection
            .set_read_timeout(Some(self.io_timeout))
            .map_err(unavailable)?;
        connection
            .set_write_timeout(Some(self.io_timeout))
            .map_err(unavailable)?;
        Ok(connection)
    }

    fn checkin(&self, connection: Connection) {
        if !connection.is_open() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(connection);
        }
    }

    /// Run `op` on a pooled connection. Connections that failed at the
    /// transport level are dropped instead of returned to the pool.
    fn execute<T>(&self, op: impl FnOnce(&mut Connection) -> RedisResult<T>) -> StorageResult<T> {
        let mut connection = self.checkout()?;
        match op(&mut connection) {
            Ok(value) => {
                self.checkin(connection);
                Ok(value)
            }
            Err(err) => {
                if !is_transport_error(&err) {
                    self.checkin(connection);
                }
                Err(unavailable(err))
            }
        }
    }

    fn script(&self, source: &'static str) -> redis::Script {
        self.scripts
            .entry(source)
            .or_insert_with(|| redis::Script::new(source))
            .clone()
    }
}

fn is_transport_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal()
}

fn unavailable(err: RedisError) -> BackendUnavailable {
    warn!(error = %err, "Redis operation failed");
    BackendUnavailable::new(err.to_string())
}

impl Storage for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn incr(&self, key: &str, ttl: Duration) -> StorageResult<i64> {
        // SET NX only creates the key (with its expiry) when it is absent, so
        // the window is anchored at the first increment.
        self.execute(|con| {
            let (count,): (i64,) = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(key)
                .arg(0)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .arg("NX")
                .ignore()
                .cmd("INCR")
                .arg(key)
                .query(con)?;
            Ok(count)
        })
    }

    fn get(&self, key: &str) -> StorageResult<f64> {
        self.execute(|con| {
            let value: Option<f64> = redis::cmd("GET").arg(key).query(con)?;
            Ok(value.unwrap_or(0.0))
        })
    }

    fn set(&self, key: &str, value: f64, ttl: Duration) -> StorageResult<()> {
        self.execute(|con| {
            redis::cmd("SET")
                .arg(key)
                .arg(format_number(value))
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query(con)
        })
    }

    fn append_list(&self, key: &str, value: i64, ttl: Duration) -> StorageResult<()> {
        self.execute(|con| {
            redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(key)
                .arg(value)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .ignore()
                .query(con)
        })
    }

    fn get_list(&self, key: &str) -> StorageResult<Vec<i64>> {
        self.execute(|con| redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query(con))
    }

    fn trim_list(&self, key: &str, keep: usize) -> StorageResult<()> {
        self.execute(|con| {
            if keep == 0 {
                return redis::cmd("DEL").arg(key).query(con);
            }
            let start = -i64::try_from(keep).unwrap_or(i64::MAX);
            redis::cmd("LTRIM").arg(key).arg(start).arg(-1).query(con)
        })
    }

    fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> StorageResult<()> {
        self.execute(|con| {
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(key)
                .arg(format_number(score))
                .arg(member)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .ignore()
                .query(con)
        })
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StorageResult<usize> {
        self.execute(|con| {
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(format_number(min))
                .arg(format_number(max))
                .query(con)
        })
    }

    fn zcard(&self, key: &str) -> StorageResult<usize> {
        self.execute(|con| redis::cmd("ZCARD").arg(key).query(con))
    }

    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>> {
        self.execute(|con| {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(format_number(min))
                .arg(format_number(max))
                .query(con)
        })
    }

    fn hmset(&self, key: &str, fields: &[(&str, f64)], ttl: Duration) -> StorageResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.execute(|con| {
            let mut hset = redis::cmd("HSET");
            hset.arg(key);
            for (field, value) in fields {
                hset.arg(*field).arg(format_number(*value));
            }
            redis::pipe()
                .atomic()
                .add_command(hset)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .ignore()
                .query(con)
        })
    }

    fn hmget(&self, key: &str, fields: &[&str]) -> StorageResult<Vec<Option<f64>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.execute(|con| redis::cmd("HMGET").arg(key).arg(fields).query(con))
    }

    fn eval(&self, key: &str, script: &dyn Script) -> StorageResult<i64> {
        let lua = self.script(script.source());
        let args = script.args();
        self.execute(|con| {
            let mut invocation = lua.key(key);
            for arg in &args {
                invocation.arg(arg);
            }
            invocation.invoke(con)
        })
    }
}
