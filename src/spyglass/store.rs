use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::time;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const MUTEX_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const MUTEX_LEASE: Duration = Duration::from_secs(10);
const MUTEX_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store: command timed out")]
    Timeout,
}

/// Single-flight lease over a store key.
///
/// An unheld guard is returned when acquisition times out; the caller proceeds
/// without mutual exclusion because the cache converges regardless. Release is
/// idempotent and never fails the request.
#[derive(Debug)]
pub struct MutexGuard {
    key: String,
    token: String,
    held: bool,
}

impl MutexGuard {
    pub fn held(&self) -> bool {
        self.held
    }
}

/// Read-through TTL cache and advisory lock over the shared key-value store.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("store: parse url")?;
        let conn = time::timeout(COMMAND_TIMEOUT, client.get_connection_manager())
            .await
            .context("store: connect timed out")?
            .context("store: connect")?;
        Ok(Self { conn })
    }

    /// Fetch a cache entry and its remaining TTL in one pipelined round-trip.
    /// A value whose TTL is already gone reads as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Duration)>, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().get(key).cmd("PTTL").arg(key);

        let (value, pttl_ms) = time::timeout(
            COMMAND_TIMEOUT,
            pipe.query_async::<(Option<Vec<u8>>, i64)>(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(entry_from(value, pttl_ms))
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64);

        time::timeout(COMMAND_TIMEOUT, cmd.query_async::<()>(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);

        time::timeout(COMMAND_TIMEOUT, cmd.query_async::<i64>(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// Acquire a fleet-wide lease. Blocks up to five seconds; on timeout (or
    /// store trouble) the returned guard is simply not held.
    pub async fn acquire_mutex(&self, name: &str) -> MutexGuard {
        let token = format!("{:016x}", rand::rng().random::<u64>());
        let deadline = time::Instant::now() + MUTEX_ACQUIRE_TIMEOUT;

        loop {
            match self.try_lock(name, &token).await {
                Ok(true) => {
                    return MutexGuard {
                        key: name.to_string(),
                        token,
                        held: true,
                    };
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(key = %name, err = %err, "store: mutex acquire failed");
                    break;
                }
            }

            if time::Instant::now() + MUTEX_RETRY >= deadline {
                tracing::warn!(key = %name, "store: mutex acquire timed out, proceeding unlocked");
                break;
            }
            time::sleep(MUTEX_RETRY).await;
        }

        MutexGuard {
            key: name.to_string(),
            token,
            held: false,
        }
    }

    async fn try_lock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(name)
            .arg(token)
            .arg("PX")
            .arg(MUTEX_LEASE.as_millis() as u64)
            .arg("NX");

        let reply = time::timeout(COMMAND_TIMEOUT, cmd.query_async::<Option<String>>(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(reply.is_some())
    }

    /// Drop the lease if we still own it. Errors are logged and swallowed.
    pub async fn release(&self, guard: &mut MutexGuard) {
        if !guard.held {
            return;
        }
        guard.held = false;

        let mut conn = self.conn.clone();
        let fut = async {
            let mut get = redis::cmd("GET");
            get.arg(&guard.key);
            let owner: Option<String> = get.query_async(&mut conn).await?;

            if owner.as_deref() == Some(guard.token.as_str()) {
                let mut del = redis::cmd("DEL");
                del.arg(&guard.key);
                del.query_async::<i64>(&mut conn).await?;
            }
            Ok::<(), redis::RedisError>(())
        };

        match time::timeout(COMMAND_TIMEOUT, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(key = %guard.key, err = %err, "store: mutex release failed"),
            Err(_) => tracing::debug!(key = %guard.key, "store: mutex release timed out"),
        }
    }
}

/// PTTL replies below zero mean the key is gone or was written without an
/// expiry; either way the read does not count as a cache hit.
fn entry_from(value: Option<Vec<u8>>, pttl_ms: i64) -> Option<(Vec<u8>, Duration)> {
    let value = value?;
    if pttl_ms < 0 {
        return None;
    }
    Some((value, Duration::from_millis(pttl_ms as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_value_is_a_miss() {
        assert!(entry_from(None, 5000).is_none());
    }

    #[test]
    fn expired_ttl_is_a_miss_even_with_a_value() {
        assert!(entry_from(Some(b"x".to_vec()), -2).is_none());
        assert!(entry_from(Some(b"x".to_vec()), -1).is_none());
    }

    #[test]
    fn live_entry_carries_remaining_ttl() {
        let (v, ttl) = entry_from(Some(b"doc".to_vec()), 42_000).unwrap();
        assert_eq!(v, b"doc");
        assert_eq!(ttl, Duration::from_secs(42));
    }

    #[test]
    fn unheld_guard_release_is_a_noop() {
        let guard = MutexGuard {
            key: "java-lock:abc".into(),
            token: "t".into(),
            held: false,
        };
        assert!(!guard.held());
    }
}
