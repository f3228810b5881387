//! Transactional key-value store contract.
//!
//! The engine only needs four operations from its persistence layer: point
//! reads, full and prefix scans, and atomic multi-key commits. Values are
//! JSON documents; [`StoreClient`] adds typed helpers and bounds every call
//! with the configured deadline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ItmError, ItmResult};
use crate::tables::Table;

/// A single write inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        value: Value,
    },
    Delete {
        table: Table,
        key: String,
    },
}

impl WriteOp {
    pub fn table(&self) -> Table {
        match self {
            WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => *table,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }
}

/// An ordered list of writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put of `value` encoded as JSON.
    pub fn put<T: Serialize>(
        &mut self,
        table: Table,
        key: impl Into<String>,
        value: &T,
    ) -> ItmResult<&mut Self> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|source| ItmError::Codec {
            table: table.to_string(),
            key: key.clone(),
            source,
        })?;
        self.ops.push(WriteOp::Put { table, key, value });
        Ok(self)
    }

    /// Queues a delete. Deleting an absent key is not an error.
    pub fn delete(&mut self, table: Table, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            table,
            key: key.into(),
        });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Contract required from the external configuration/state store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads one record.
    async fn read(&self, table: Table, key: &str) -> ItmResult<Option<Value>>;

    /// Returns every record of a table, ordered by key.
    async fn scan(&self, table: Table) -> ItmResult<Vec<(String, Value)>>;

    /// Returns every record whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, table: Table, prefix: &str) -> ItmResult<Vec<(String, Value)>>;

    /// Applies all writes of `tx` or none of them.
    async fn commit(&self, tx: Transaction) -> ItmResult<()>;
}

type Tables = BTreeMap<Table, BTreeMap<String, Value>>;

/// In-process store used by tests and the dry-run daemon.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    fail_commits: AtomicU32,
    latency_ms: AtomicU64,
    commits: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a conflict.
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Delays every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of records in `table`.
    pub fn table_len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, |t| t.len())
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn read(&self, table: Table, key: &str) -> ItmResult<Option<Value>> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn scan(&self, table: Table) -> ItmResult<Vec<(String, Value)>> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, table: Table, prefix: &str) -> ItmResult<Vec<(String, Value)>> {
        self.simulate_latency().await;
        let tables = self.tables.read();
        let Some(t) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(&self, tx: Transaction) -> ItmResult<()> {
        self.simulate_latency().await;
        if self.take_injected_failure() {
            let (table, key) = tx
                .ops()
                .first()
                .map(|op| (op.table().to_string(), op.key().to_string()))
                .unwrap_or_default();
            return Err(ItmError::conflict(table, key));
        }

        let mut tables = self.tables.write();
        for op in tx.ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Typed, deadline-bounded access to a [`ConfigStore`].
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn ConfigStore>,
    timeout: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ConfigStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> ItmResult<T>
    where
        F: std::future::Future<Output = ItmResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ItmError::StoreTimeout {
                operation: operation.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn decode<T: DeserializeOwned>(table: Table, key: &str, value: Value) -> ItmResult<T> {
        serde_json::from_value(value).map_err(|source| ItmError::Codec {
            table: table.to_string(),
            key: key.to_string(),
            source,
        })
    }

    /// Reads and decodes one record.
    pub async fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> ItmResult<Option<T>> {
        let value = self.bounded("read", self.store.read(table, key)).await?;
        value.map(|v| Self::decode(table, key, v)).transpose()
    }

    /// Returns true if the record exists.
    pub async fn exists(&self, table: Table, key: &str) -> ItmResult<bool> {
        Ok(self
            .bounded("read", self.store.read(table, key))
            .await?
            .is_some())
    }

    /// Reads and decodes every record of a table.
    pub async fn list<T: DeserializeOwned>(&self, table: Table) -> ItmResult<Vec<(String, T)>> {
        let rows = self.bounded("scan", self.store.scan(table)).await?;
        rows.into_iter()
            .map(|(k, v)| Self::decode(table, &k, v).map(|t| (k, t)))
            .collect()
    }

    /// Reads and decodes every record under a key prefix.
    pub async fn list_prefix<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
    ) -> ItmResult<Vec<(String, T)>> {
        let rows = self
            .bounded("scan_prefix", self.store.scan_prefix(table, prefix))
            .await?;
        rows.into_iter()
            .map(|(k, v)| Self::decode(table, &k, v).map(|t| (k, t)))
            .collect()
    }

    /// Returns the keys under a prefix without decoding values.
    pub async fn keys_with_prefix(&self, table: Table, prefix: &str) -> ItmResult<Vec<String>> {
        let rows = self
            .bounded("scan_prefix", self.store.scan_prefix(table, prefix))
            .await?;
        Ok(rows.into_iter().map(|(k, _)| k).collect())
    }

    /// Commits a transaction. Empty transactions are skipped.
    pub async fn commit(&self, tx: Transaction) -> ItmResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        debug!(ops = tx.len(), "committing transaction");
        self.bounded("commit", self.store.commit(tx)).await
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        weight: u32,
    }

    fn client(store: Arc<InMemoryStore>, timeout_ms: u64) -> StoreClient {
        StoreClient::new(store, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_commit_is_atomic_and_ordered() {
        let store = Arc::new(InMemoryStore::new());
        let client = client(Arc::clone(&store), 1000);

        let mut tx = Transaction::new();
        tx.put(Table::Zone, "tz-a", &Record { name: "a".into(), weight: 1 })
            .unwrap();
        tx.put(Table::Zone, "tz-b", &Record { name: "b".into(), weight: 2 })
            .unwrap();
        tx.delete(Table::Zone, "tz-a");
        client.commit(tx).await.unwrap();

        assert!(!client.exists(Table::Zone, "tz-a").await.unwrap());
        let b: Option<Record> = client.get(Table::Zone, "tz-b").await.unwrap();
        assert_eq!(b, Some(Record { name: "b".into(), weight: 2 }));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = Arc::new(InMemoryStore::new());
        let client = client(Arc::clone(&store), 1000);

        let mut tx = Transaction::new();
        for key in ["1|tunA", "1|tunB", "10|tunC", "2|tunD"] {
            tx.put(Table::DpnTunnel, key, &true).unwrap();
        }
        client.commit(tx).await.unwrap();

        let keys = client.keys_with_prefix(Table::DpnTunnel, "1|").await.unwrap();
        assert_eq!(keys, vec!["1|tunA".to_string(), "1|tunB".to_string()]);
        assert!(client
            .keys_with_prefix(Table::Tunnel, "1|")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_injected_commit_failures() {
        let store = Arc::new(InMemoryStore::new());
        let client = client(Arc::clone(&store), 1000);
        store.fail_next_commits(2);

        for _ in 0..2 {
            let mut tx = Transaction::new();
            tx.put(Table::Gateway, "10.0.0.1", &1u32).unwrap();
            let err = client.commit(tx).await.unwrap_err();
            assert!(matches!(err, ItmError::StoreConflict { .. }));
            assert!(err.is_retryable());
        }

        let mut tx = Transaction::new();
        tx.put(Table::Gateway, "10.0.0.1", &1u32).unwrap();
        client.commit(tx).await.unwrap();
        assert_eq!(store.table_len(Table::Gateway), 1);
    }

    #[tokio::test]
    async fn test_operations_time_out() {
        let store = Arc::new(InMemoryStore::new());
        store.set_latency(Duration::from_millis(200));
        let client = client(Arc::clone(&store), 20);

        let err = client.exists(Table::Zone, "tz").await.unwrap_err();
        assert!(matches!(
            err,
            ItmError::StoreTimeout { ref operation, timeout_ms: 20 } if operation == "read"
        ));
    }

    #[tokio::test]
    async fn test_decode_error_names_record() {
        let store = Arc::new(InMemoryStore::new());
        let client = client(Arc::clone(&store), 1000);

        let mut tx = Transaction::new();
        tx.put(Table::Zone, "tz", &"not a record").unwrap();
        client.commit(tx).await.unwrap();

        let err = client.get::<Record>(Table::Zone, "tz").await.unwrap_err();
        assert!(matches!(err, ItmError::Codec { ref key, .. } if key == "tz"));
    }
}
