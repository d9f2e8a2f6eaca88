//! Message store: bounded per-category queues of undelivered messages plus a
//! small property table.
//!
//! Messages are keyed and drained by `(timestamp, topic)`. Storing a message
//! beyond a category's limit evicts the earliest inserted entries of that
//! category, whatever their timestamp.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use crate::config::PersistenceConfig;
use crate::error::PersistenceError;

/// Independent queue a message is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Attribute updates, acknowledgements and transactions
    Update,
    /// Log records
    Log,
    /// Node added / removed events
    Lifecycle,
}

impl Category {
    /// All categories.
    pub const ALL: [Category; 3] = [Category::Update, Category::Log, Category::Lifecycle];

    /// Name used as storage key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Log => "log",
            Self::Lifecycle => "lifecycle",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encoded message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    /// Milliseconds since epoch
    pub timestamp: i64,
    /// Full wire topic
    pub topic: String,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl PersistedMessage {
    /// Ordering key of the message.
    #[must_use]
    pub fn key(&self) -> (i64, String) {
        (self.timestamp, self.topic.clone())
    }
}

/// Property key holding the persisted log level.
pub const LOG_LEVEL_PROPERTY: &str = "logLevel";

/// Bounded, category-keyed, timestamp-ordered message storage.
pub trait MessageStore: Send + Sync {
    /// Store a message, evicting the earliest inserted beyond `limit`. A
    /// limit of zero stores nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn store(&self, category: Category, limit: usize, message: &PersistedMessage) -> Result<(), PersistenceError>;

    /// Oldest message of a category.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn oldest(&self, category: Category) -> Result<Option<PersistedMessage>, PersistenceError>;

    /// Remove the oldest message of a category. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn remove_oldest(&self, category: Category) -> Result<bool, PersistenceError>;

    /// Number of messages in a category.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn count(&self, category: Category) -> Result<usize, PersistenceError>;

    /// All messages of a category, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn messages(&self, category: Category) -> Result<Vec<PersistedMessage>, PersistenceError>;

    /// Remove the messages with the given keys. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn remove(&self, category: Category, keys: &[(i64, String)]) -> Result<usize, PersistenceError>;

    /// Set a property.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn set_property(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    /// Get a property.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn property(&self, key: &str) -> Result<Option<String>, PersistenceError>;
}

/// Open the store selected by `config`.
///
/// # Errors
///
/// Returns error if the store type is unknown or the database cannot be opened.
pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn MessageStore>, PersistenceError> {
    match config.store_type.as_str() {
        "sqlite" => Ok(Arc::new(SqliteStore::open(&config.db_path)?)),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "none" => Ok(Arc::new(NullStore)),
        other => Err(PersistenceError::UnknownStore(other.to_string())),
    }
}

/// `SQLite`-backed message store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), PersistenceError> {
        self.conn.lock().execute_batch(
            r"
            -- Undelivered messages per category
            CREATE TABLE IF NOT EXISTS pending_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                UNIQUE(category, timestamp, topic)
            );

            CREATE INDEX IF NOT EXISTS idx_pending_order
                ON pending_messages(category, timestamp, topic);

            -- Endpoint properties
            CREATE TABLE IF NOT EXISTS properties (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }
}

impl MessageStore for SqliteStore {
    fn store(&self, category: Category, limit: usize, message: &PersistedMessage) -> Result<(), PersistenceError> {
        if limit == 0 {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r"
            INSERT OR REPLACE INTO pending_messages (category, timestamp, topic, payload)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (
                category.as_str(),
                message.timestamp,
                &message.topic,
                &message.payload,
            ),
        )?;
        tx.execute(
            r"
            DELETE FROM pending_messages
            WHERE category = ?1 AND id NOT IN (
                SELECT id FROM pending_messages
                WHERE category = ?1
                ORDER BY id DESC
                LIMIT ?2
            )
            ",
            (category.as_str(), to_i64(limit)?),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn oldest(&self, category: Category) -> Result<Option<PersistedMessage>, PersistenceError> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                r"
                SELECT timestamp, topic, payload FROM pending_messages
                WHERE category = ?1
                ORDER BY timestamp ASC, topic ASC
                LIMIT 1
                ",
                [category.as_str()],
                |row| {
                    Ok(PersistedMessage {
                        timestamp: row.get(0)?,
                        topic: row.get(1)?,
                        payload: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(message)
    }

    fn remove_oldest(&self, category: Category) -> Result<bool, PersistenceError> {
        let deleted = self.conn.lock().execute(
            r"
            DELETE FROM pending_messages
            WHERE id = (
                SELECT id FROM pending_messages
                WHERE category = ?1
                ORDER BY timestamp ASC, topic ASC
                LIMIT 1
            )
            ",
            [category.as_str()],
        )?;
        Ok(deleted > 0)
    }

    fn count(&self, category: Category) -> Result<usize, PersistenceError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM pending_messages WHERE category = ?1",
            [category.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn messages(&self, category: Category) -> Result<Vec<PersistedMessage>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT timestamp, topic, payload FROM pending_messages
            WHERE category = ?1
            ORDER BY timestamp ASC, topic ASC
            ",
        )?;

        let messages = stmt
            .query_map([category.as_str()], |row| {
                Ok(PersistedMessage {
                    timestamp: row.get(0)?,
                    topic: row.get(1)?,
                    payload: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(messages)
    }

    fn remove(&self, category: Category, keys: &[(i64, String)]) -> Result<usize, PersistenceError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM pending_messages WHERE category = ?1 AND timestamp = ?2 AND topic = ?3",
            )?;
            for (timestamp, topic) in keys {
                removed += stmt.execute((category.as_str(), timestamp, topic))?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn set_property(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO properties (key, value) VALUES (?1, ?2)",
            (key, value),
        )?;
        Ok(())
    }

    fn property(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM properties WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

/// Entries in drain order plus their insertion sequence.
#[derive(Default)]
struct Queue {
    entries: BTreeMap<(i64, String), (u64, Vec<u8>)>,
    inserted: BTreeMap<u64, (i64, String)>,
    next: u64,
}

impl Queue {
    fn insert(&mut self, key: (i64, String), payload: Vec<u8>) {
        let seq = self.next;
        self.next += 1;
        if let Some((previous, _)) = self.entries.insert(key.clone(), (seq, payload)) {
            self.inserted.remove(&previous);
        }
        self.inserted.insert(seq, key);
    }

    fn evict_to(&mut self, limit: usize) {
        while self.entries.len() > limit {
            let Some((_, key)) = self.inserted.pop_first() else {
                break;
            };
            self.entries.remove(&key);
        }
    }

    fn remove(&mut self, key: &(i64, String)) -> bool {
        match self.entries.remove(key) {
            Some((seq, _)) => {
                self.inserted.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn pop_first(&mut self) -> bool {
        match self.entries.pop_first() {
            Some((_, (seq, _))) => {
                self.inserted.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn messages(&self) -> impl Iterator<Item = PersistedMessage> + '_ {
        self.entries
            .iter()
            .map(|((timestamp, topic), (_, payload))| PersistedMessage {
                timestamp: *timestamp,
                topic: topic.clone(),
                payload: payload.clone(),
            })
    }
}

/// Volatile message store.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<Category, Queue>>,
    properties: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn store(&self, category: Category, limit: usize, message: &PersistedMessage) -> Result<(), PersistenceError> {
        if limit == 0 {
            return Ok(());
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(category).or_default();
        queue.insert(message.key(), message.payload.clone());
        queue.evict_to(limit);
        Ok(())
    }

    fn oldest(&self, category: Category) -> Result<Option<PersistedMessage>, PersistenceError> {
        Ok(self
            .queues
            .lock()
            .get(&category)
            .and_then(|queue| queue.messages().next()))
    }

    fn remove_oldest(&self, category: Category) -> Result<bool, PersistenceError> {
        Ok(self
            .queues
            .lock()
            .get_mut(&category)
            .is_some_and(Queue::pop_first))
    }

    fn count(&self, category: Category) -> Result<usize, PersistenceError> {
        Ok(self
            .queues
            .lock()
            .get(&category)
            .map_or(0, |queue| queue.entries.len()))
    }

    fn messages(&self, category: Category) -> Result<Vec<PersistedMessage>, PersistenceError> {
        Ok(self
            .queues
            .lock()
            .get(&category)
            .map(|queue| queue.messages().collect())
            .unwrap_or_default())
    }

    fn remove(&self, category: Category, keys: &[(i64, String)]) -> Result<usize, PersistenceError> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(&category) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|key| queue.remove(key)).count())
    }

    fn set_property(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.properties
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn property(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.properties.lock().get(key).cloned())
    }
}

/// Store that keeps nothing; undeliverable messages are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl MessageStore for NullStore {
    fn store(&self, _: Category, _: usize, _: &PersistedMessage) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn oldest(&self, _: Category) -> Result<Option<PersistedMessage>, PersistenceError> {
        Ok(None)
    }

    fn remove_oldest(&self, _: Category) -> Result<bool, PersistenceError> {
        Ok(false)
    }

    fn count(&self, _: Category) -> Result<usize, PersistenceError> {
        Ok(0)
    }

    fn messages(&self, _: Category) -> Result<Vec<PersistedMessage>, PersistenceError> {
        Ok(Vec::new())
    }

    fn remove(&self, _: Category, _: &[(i64, String)]) -> Result<usize, PersistenceError> {
        Ok(0)
    }

    fn set_property(&self, _: &str, _: &str) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn property(&self, _: &str) -> Result<Option<String>, PersistenceError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(timestamp: i64, topic: &str) -> PersistedMessage {
        PersistedMessage {
            timestamp,
            topic: topic.to_string(),
            payload: format!("payload-{timestamp}").into_bytes(),
        }
    }

    fn stores() -> Vec<(&'static str, Box<dyn MessageStore>)> {
        vec![
            ("sqlite", Box::new(SqliteStore::in_memory().unwrap())),
            ("memory", Box::new(MemoryStore::new())),
        ]
    }

    #[test]
    fn limit_keeps_newest_oldest_first() {
        for (name, store) in stores() {
            let limit = 10;
            for ts in 0..(limit + 5) {
                store
                    .store(Category::Update, limit, &message(ts as i64, "@update/a"))
                    .unwrap();
            }
            let kept: Vec<i64> = store
                .messages(Category::Update)
                .unwrap()
                .iter()
                .map(|m| m.timestamp)
                .collect();
            assert_eq!(kept, (5..15).collect::<Vec<i64>>(), "{name}");
        }
    }

    #[test]
    fn limit_evicts_by_insertion_not_timestamp() {
        for (name, store) in stores() {
            for ts in [10, 20, 5] {
                store
                    .store(Category::Log, 2, &message(ts, "@logs/d"))
                    .unwrap();
            }
            let kept: Vec<i64> = store
                .messages(Category::Log)
                .unwrap()
                .iter()
                .map(|m| m.timestamp)
                .collect();
            assert_eq!(kept, vec![5, 20], "{name}");

            store.store(Category::Log, 2, &message(1, "@logs/d")).unwrap();
            let kept: Vec<i64> = store
                .messages(Category::Log)
                .unwrap()
                .iter()
                .map(|m| m.timestamp)
                .collect();
            assert_eq!(kept, vec![1, 5], "{name}");
        }
    }

    #[test]
    fn replaced_entry_counts_as_newest() {
        for (name, store) in stores() {
            store.store(Category::Update, 2, &message(1, "@update/a")).unwrap();
            store.store(Category::Update, 2, &message(2, "@update/a")).unwrap();
            store.store(Category::Update, 2, &message(1, "@update/a")).unwrap();
            store.store(Category::Update, 2, &message(3, "@update/a")).unwrap();
            let kept: Vec<i64> = store
                .messages(Category::Update)
                .unwrap()
                .iter()
                .map(|m| m.timestamp)
                .collect();
            assert_eq!(kept, vec![1, 3], "{name}");
        }
    }

    #[test]
    fn categories_are_independent() {
        for (name, store) in stores() {
            store.store(Category::Log, 1, &message(1, "@logs/d")).unwrap();
            store.store(Category::Log, 1, &message(2, "@logs/d")).unwrap();
            store
                .store(Category::Lifecycle, 5, &message(1, "@nodeAdded/d/n"))
                .unwrap();
            assert_eq!(store.count(Category::Log).unwrap(), 1, "{name}");
            assert_eq!(store.count(Category::Lifecycle).unwrap(), 1, "{name}");
            assert_eq!(store.count(Category::Update).unwrap(), 0, "{name}");
            assert_eq!(store.oldest(Category::Log).unwrap().unwrap().timestamp, 2);
        }
    }

    #[test]
    fn ordered_by_timestamp_then_topic() {
        for (name, store) in stores() {
            store.store(Category::Update, 10, &message(2, "@update/a")).unwrap();
            store.store(Category::Update, 10, &message(1, "@update/b")).unwrap();
            store.store(Category::Update, 10, &message(1, "@update/a")).unwrap();

            let oldest = store.oldest(Category::Update).unwrap().unwrap();
            assert_eq!(oldest.key(), (1, "@update/a".to_string()), "{name}");
            assert!(store.remove_oldest(Category::Update).unwrap());
            let oldest = store.oldest(Category::Update).unwrap().unwrap();
            assert_eq!(oldest.key(), (1, "@update/b".to_string()), "{name}");
        }
    }

    #[test]
    fn same_key_replaces() {
        for (name, store) in stores() {
            store.store(Category::Update, 10, &message(1, "@update/a")).unwrap();
            let mut newer = message(1, "@update/a");
            newer.payload = b"newer".to_vec();
            store.store(Category::Update, 10, &newer).unwrap();
            assert_eq!(store.count(Category::Update).unwrap(), 1, "{name}");
            assert_eq!(store.oldest(Category::Update).unwrap().unwrap().payload, b"newer");
        }
    }

    #[test]
    fn remove_by_key_leaves_others() {
        for (name, store) in stores() {
            for ts in 1..=3 {
                store.store(Category::Update, 10, &message(ts, "@update/a")).unwrap();
            }
            let removed = store
                .remove(
                    Category::Update,
                    &[(1, "@update/a".into()), (3, "@update/a".into()), (9, "@update/x".into())],
                )
                .unwrap();
            assert_eq!(removed, 2, "{name}");
            assert_eq!(store.messages(Category::Update).unwrap(), vec![message(2, "@update/a")]);
        }
    }

    #[test]
    fn zero_limit_stores_nothing() {
        for (name, store) in stores() {
            store.store(Category::Update, 0, &message(1, "@update/a")).unwrap();
            assert_eq!(store.count(Category::Update).unwrap(), 0, "{name}");
        }
    }

    #[test]
    fn properties_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set_property(LOG_LEVEL_PROPERTY, "DEBUG").unwrap();
            store.store(Category::Update, 10, &message(7, "@update/a")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.property(LOG_LEVEL_PROPERTY).unwrap().as_deref(), Some("DEBUG"));
        assert_eq!(store.count(Category::Update).unwrap(), 1);
        assert!(store.property("missing").unwrap().is_none());
    }

    #[test]
    fn open_store_by_type() {
        let mut config = crate::config::EndpointConfig::default().persistence;
        config.store_type = "memory".into();
        assert!(open_store(&config).is_ok());
        config.store_type = "redis".into();
        assert!(matches!(
            open_store(&config),
            Err(PersistenceError::UnknownStore(_))
        ));
    }
}
