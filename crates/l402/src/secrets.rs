//! Durable mapping from token identifier to signing secret.
//!
//! The store is the root of trust: a token signature proves knowledge of a
//! secret that only ever lives here. The one hard requirement is atomic
//! create-if-absent, so that two racing mints of the same id resolve to
//! exactly one winner.

use dashmap::DashMap;
use std::sync::Mutex;

use crate::error::Error;
use crate::token::TokenId;

/// All persisted keys live under this prefix so the backing store can be
/// shared with other tenants.
pub const STORE_PREFIX: &str = "lsat/proxy";

fn secret_key(id: &TokenId) -> String {
    format!("{STORE_PREFIX}/secrets/{id}")
}

fn random_secret() -> Result<[u8; 32], Error> {
    let mut secret = [0u8; 32];
    getrandom::fill(&mut secret).map_err(|e| Error::Rng(e.to_string()))?;
    Ok(secret)
}

/// Storage backend for token signing secrets.
///
/// Implementations must be thread-safe and must make `new_secret` atomic:
/// for any id, at most one caller ever receives `Ok` across any
/// interleaving of concurrent calls.
pub trait SecretStore: Send + Sync {
    /// Generate and persist a fresh 32-byte secret for `id`.
    /// Fails with [`Error::AlreadyExists`] if the id is taken.
    fn new_secret(&self, id: &TokenId) -> Result<[u8; 32], Error>;

    /// Return the stored secret, or [`Error::NotFound`].
    fn reveal_secret(&self, id: &TokenId) -> Result<[u8; 32], Error>;

    /// Delete the entry. Subsequent `reveal_secret` calls fail. Revoking an
    /// absent id is a no-op.
    fn revoke_secret(&self, id: &TokenId) -> Result<(), Error>;
}

/// In-memory store backed by DashMap. Fast but lost on restart; intended
/// for tests and ephemeral deployments.
pub struct MemSecretStore {
    secrets: DashMap<TokenId, [u8; 32]>,
}

impl MemSecretStore {
    pub fn new() -> Self {
        Self {
            secrets: DashMap::new(),
        }
    }
}

impl Default for MemSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for MemSecretStore {
    fn new_secret(&self, id: &TokenId) -> Result<[u8; 32], Error> {
        use dashmap::mapref::entry::Entry;
        // The entry API makes check-and-insert atomic within the process.
        match self.secrets.entry(*id) {
            Entry::Occupied(_) => Err(Error::AlreadyExists),
            Entry::Vacant(v) => {
                let secret = random_secret()?;
                v.insert(secret);
                Ok(secret)
            }
        }
    }

    fn reveal_secret(&self, id: &TokenId) -> Result<[u8; 32], Error> {
        self.secrets
            .get(id)
            .map(|entry| *entry.value())
            .ok_or(Error::NotFound)
    }

    fn revoke_secret(&self, id: &TokenId) -> Result<(), Error> {
        self.secrets.remove(id);
        Ok(())
    }
}

/// Persistent store backed by SQLite. The table is a generic namespaced
/// key/value mapping; create-if-absent rides on the primary-key constraint,
/// which is atomic at the database level and safe across processes.
pub struct SqliteSecretStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteSecretStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory SQLite database, for tests.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn is_conflict(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SecretStore for SqliteSecretStore {
    fn new_secret(&self, id: &TokenId) -> Result<[u8; 32], Error> {
        let secret = random_secret()?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        match conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)",
            rusqlite::params![secret_key(id), &secret[..]],
        ) {
            Ok(_) => Ok(secret),
            Err(e) if is_conflict(&e) => Err(Error::AlreadyExists),
            Err(e) => Err(Error::StorageUnavailable(e.to_string())),
        }
    }

    fn reveal_secret(&self, id: &TokenId) -> Result<[u8; 32], Error> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let value: Vec<u8> = match conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            [secret_key(id)],
            |row| row.get(0),
        ) {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(Error::NotFound),
            Err(e) => return Err(Error::StorageUnavailable(e.to_string())),
        };
        value
            .try_into()
            .map_err(|_| Error::StorageUnavailable("stored secret is not 32 bytes".into()))
    }

    fn revoke_secret(&self, id: &TokenId) -> Result<(), Error> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("DELETE FROM kv WHERE key = ?1", [secret_key(id)])
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(())
    }
}
