//! Persistence Mirror: an advisory, fire-and-forget mirror of action state
//! into an external key-value store, so an operator-facing tool outside the
//! coordinator process can inspect in-flight work without talking to the
//! coordinator's socket.
//!
//! Writes here are best-effort. A mirror failure is logged and dropped, not
//! surfaced to the dispatch path — the KV store is a read side-channel, not
//! a source of truth.

use coordinator_protocol::ActionKey;

/// Mirrors action lifecycle events into an external store. Implementations
/// must never block the caller on a slow or unreachable backend; the engine
/// calls these from its single-threaded loop and cannot wait on them.
pub trait PersistenceMirror: Send + Sync {
    fn insert(&self, key: &ActionKey, value: &str);
    fn delete(&self, key: &ActionKey);
}

/// No mirror configured: every call is a no-op.
pub struct NullMirror;

impl PersistenceMirror for NullMirror {
    fn insert(&self, _key: &ActionKey, _value: &str) {}
    fn delete(&self, _key: &ActionKey) {}
}

/// Mirrors into Redis. Connection is a `redis::aio::ConnectionManager` so a
/// transient disconnect is retried internally by the client rather than
/// failing the calling write outright; any error that does surface is
/// logged and swallowed.
pub struct RedisMirror {
    conn: redis::aio::ConnectionManager,
    handle: tokio::runtime::Handle,
}

impl RedisMirror {
    pub async fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            handle: tokio::runtime::Handle::current(),
        })
    }
}

/// The single hash all requests are mirrored under, field-keyed by cookie.
const REQUESTS_HASH: &str = "coordinatool_requests";

impl PersistenceMirror for RedisMirror {
    fn insert(&self, key: &ActionKey, value: &str) {
        let mut conn = self.conn.clone();
        let field = format!("{:x}", key.cookie);
        let value = value.to_string();
        self.handle.spawn(async move {
            use redis::AsyncCommands;
            if let Err(err) = conn.hset::<_, _, _, ()>(REQUESTS_HASH, &field, value).await {
                tracing::warn!(field = %field, error = %err, "persistence mirror insert failed");
            }
        });
    }

    fn delete(&self, key: &ActionKey) {
        let mut conn = self.conn.clone();
        let field = format!("{:x}", key.cookie);
        self.handle.spawn(async move {
            use redis::AsyncCommands;
            if let Err(err) = conn.hdel::<_, _, ()>(REQUESTS_HASH, &field).await {
                tracing::warn!(field = %field, error = %err, "persistence mirror delete failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_mirror_never_panics() {
        let mirror = NullMirror;
        let key = ActionKey::new(1, coordinator_protocol::Fid::new(1, 1, 0));
        mirror.insert(&key, "x");
        mirror.delete(&key);
    }
}
