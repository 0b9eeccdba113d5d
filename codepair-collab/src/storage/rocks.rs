//! RocksDB-backed session store.
//!
//! Column families:
//! - `sessions`: one record per session, keyed by the 16-byte session UUID
//! - `messages`: chat history, keyed by `session_id ++ seq (u64 BE)`
//! - `versions`: saved snapshots, keyed by `session_id ++ seq (u64 BE)`
//!
//! Values are bincode-encoded and LZ4 compressed. Read-modify-write cycles
//! are serialized by a single writer lock so concurrent handlers never lose
//! each other's updates. Every database call runs on the blocking pool, so a
//! slow write stalls only the handler waiting for it.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::error::{CollabError, Result};
use crate::model::{ChatMessage, NewSession, Participant, Session, SessionId, Visibility, VersionSnapshot};

const CF_SESSIONS: &str = "sessions";
const CF_MESSAGES: &str = "messages";
const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_MESSAGES, CF_VERSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write. RocksDB's own WAL already survives a process
    /// restart without it; this only matters for power loss.
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codepair_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }

    /// Build a config from a `DURABLE_STORE_URL` value.
    ///
    /// Accepts `rocksdb://<path>`, `file://<path>` or a bare path.
    pub fn from_url(url: &str) -> Self {
        let path = url
            .strip_prefix("rocksdb://")
            .or_else(|| url.strip_prefix("file://"))
            .unwrap_or(url);
        Self {
            path: PathBuf::from(path),
            ..Self::default()
        }
    }
}

pub struct RocksStore {
    inner: Arc<Inner>,
    write_lock: Mutex<()>,
}

/// Database handle shared with blocking tasks.
struct Inner {
    db: DB,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened session store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(Inner { db, config }),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SESSIONS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(3);
            }
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    /// Run `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| CollabError::Internal(format!("store task failed: {e}")))?
    }
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn seq_key(id: SessionId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn load(&self, id: SessionId) -> Result<Session> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(CollabError::SessionNotFound(id)),
        }
    }

    fn put(&self, session: &Session) -> Result<()> {
        let cf = self.cf(CF_SESSIONS)?;
        let value = encode(session)?;
        self.db
            .put_cf_opt(cf, session.id.as_bytes(), value, &self.write_options())
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn modify<T>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut session = self.load(id)?;
        let out = f(&mut session)?;
        self.put(&session)?;
        Ok(out)
    }

    /// Keys stored under `id` in a sequence-keyed column family, oldest first.
    fn keys_for(&self, cf_name: &str, id: SessionId) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start = Self::seq_key(id, 0);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != id.as_bytes() {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn values_for<T: DeserializeOwned>(&self, cf_name: &str, id: SessionId) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start = Self::seq_key(id, 0);
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != id.as_bytes() {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    /// Next free sequence number under `id`.
    fn next_seq(&self, cf_name: &str, id: SessionId) -> Result<u64, StoreError> {
        let cf = self.cf(cf_name)?;
        let end = Self::seq_key(id, u64::MAX);
        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() == 24 && &key[..16] == id.as_bytes() {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&key[16..24]);
                    Ok(u64::from_be_bytes(buf) + 1)
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    fn append_sync(&self, id: SessionId, message: &ChatMessage, cap: usize) -> Result<()> {
        let mut session = self.load(id)?;
        session.touch();

        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let existing = self.keys_for(CF_MESSAGES, id)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_sessions, id.as_bytes(), encode(&session)?);

        // A zero cap keeps nothing, not even the new message
        let keep_new = cap > 0;
        if keep_new {
            let seq = self.next_seq(CF_MESSAGES, id)?;
            batch.put_cf(cf_messages, Self::seq_key(id, seq), encode(message)?);
        }
        let overflow = (existing.len() + usize::from(keep_new)).saturating_sub(cap);
        for key in existing.iter().take(overflow) {
            batch.delete_cf(cf_messages, key);
        }

        self.db
            .write_opt(batch, &self.write_options())
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn save_version_sync(&self, snapshot: &VersionSnapshot) -> Result<()> {
        let id = snapshot.session_id;
        let mut session = self.load(id)?;
        session.touch();

        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let seq = self.next_seq(CF_VERSIONS, id)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, Self::seq_key(id, seq), encode(snapshot)?);
        batch.put_cf(cf_sessions, id.as_bytes(), encode(&session)?);
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn delete_sync(&self, id: SessionId) -> Result<()> {
        // Existence check doubles as NotFound reporting
        self.load(id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SESSIONS)?, id.as_bytes());
        for cf_name in [CF_MESSAGES, CF_VERSIONS] {
            let cf = self.cf(cf_name)?;
            for key in self.keys_for(cf_name, id)? {
                batch.delete_cf(cf, key);
            }
        }
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn all_sessions(&self) -> Result<Vec<Session>> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(StoreError::from)?;
            if key.len() != 16 {
                continue;
            }
            match decode::<Session>(&value) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    let id = Uuid::from_slice(&key).unwrap_or_default();
                    log::error!("Skipping unreadable session record {id}: {e}");
                }
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[async_trait]
impl SessionStore for RocksStore {
    async fn create_session(&self, owner_id: &str, options: NewSession) -> Result<Session> {
        let session = Session::new(owner_id, options);
        let _guard = self.write_lock.lock().await;
        let record = session.clone();
        self.blocking(move |db| db.put(&record)).await?;
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session> {
        self.blocking(move |db| db.load(id)).await
    }

    async fn update_code(&self, id: SessionId, code: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| {
            db.modify(id, |s| {
                s.set_code(code);
                Ok(())
            })
        })
        .await
    }

    async fn update_language(&self, id: SessionId, language: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| {
            db.modify(id, |s| {
                s.set_language(language);
                Ok(())
            })
        })
        .await
    }

    async fn add_member(&self, id: SessionId, participant: Participant) -> Result<Session> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| {
            db.modify(id, |s| {
                s.upsert_member(participant)?;
                Ok(s.clone())
            })
        })
        .await
    }

    async fn update_member(&self, id: SessionId, participant: Participant) -> Result<Session> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| {
            db.modify(id, |s| {
                s.replace_member(participant)?;
                Ok(s.clone())
            })
        })
        .await
    }

    async fn remove_member(&self, id: SessionId, user_id: &str) -> Result<Session> {
        let user_id = user_id.to_string();
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| {
            db.modify(id, |s| {
                s.remove_member(&user_id);
                Ok(s.clone())
            })
        })
        .await
    }

    async fn delete_session(&self, id: SessionId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| db.delete_sync(id)).await
    }

    async fn list_public_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .blocking(|db| db.all_sessions())
            .await?
            .into_iter()
            .filter(|s| s.visibility == Visibility::Public)
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.blocking(|db| db.all_sessions()).await
    }

    async fn append_message(&self, id: SessionId, message: ChatMessage, cap: usize) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| db.append_sync(id, &message, cap)).await
    }

    async fn messages(&self, id: SessionId) -> Result<Vec<ChatMessage>> {
        self.blocking(move |db| {
            db.load(id)?;
            Ok(db.values_for(CF_MESSAGES, id)?)
        })
        .await
    }

    async fn save_version(&self, snapshot: VersionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.blocking(move |db| db.save_version_sync(&snapshot)).await
    }

    async fn versions(&self, id: SessionId) -> Result<Vec<VersionSnapshot>> {
        self.blocking(move |db| {
            db.load(id)?;
            Ok(db.values_for(CF_VERSIONS, id)?)
        })
        .await
    }

    fn is_durable(&self) -> bool {
        true
    }
}
