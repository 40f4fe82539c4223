//! The remote ledger: typed, encrypted access to a [`RemoteTransport`].

use crate::codec::{from_cbor, to_cbor};
use crate::config::SyncConfig;
use crate::crypto::Cipher;
use crate::error::{SyncError, SyncResult};
use crate::record::{EntityValue, RemoteRecord};
use crate::transport::{
    RawRead, RemoteQuery, RemoteTransport, SealedRecord, WriteOutcome, WriteStatus,
};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Decrypted answer to one conditional read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<V> {
    /// The current remote record.
    Found(RemoteRecord<V>),
    /// Remote timestamp equals the caller's `if_none_match`.
    NotModified,
    /// The key has no remote value.
    NotFound,
}

/// Typed remote access. Values are CBOR-encoded and encrypted before they
/// reach the transport, and decrypted on the way back.
pub struct RemoteLedger<V, T> {
    transport: T,
    cipher: Arc<dyn Cipher>,
    config: SyncConfig,
    _value: PhantomData<fn() -> V>,
}

impl<V: EntityValue, T: RemoteTransport> RemoteLedger<V, T> {
    /// Creates a remote ledger over `transport`.
    pub fn new(transport: T, cipher: Arc<dyn Cipher>, config: SyncConfig) -> Self {
        Self {
            transport,
            cipher,
            config,
            _value: PhantomData,
        }
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs conditional reads, one answer per query in query order.
    ///
    /// The outer error is a transport failure for the whole batch; the
    /// inner errors are per-key decrypt/decode failures.
    ///
    /// # Errors
    ///
    /// Returns the transport error (or [`SyncError::Timeout`]) if any chunk
    /// of the batch fails.
    pub async fn try_read_batch(
        &self,
        queries: &[RemoteQuery],
    ) -> SyncResult<Vec<SyncResult<Fetched<V>>>> {
        let mut results = Vec::with_capacity(queries.len());
        for chunk in queries.chunks(self.config.read_batch_size) {
            let answers = self.bounded(self.transport.read_batch(chunk)).await?;
            if answers.len() != chunk.len() {
                return Err(SyncError::Protocol(format!(
                    "expected {} read results, got {}",
                    chunk.len(),
                    answers.len()
                )));
            }
            for (query, answer) in chunk.iter().zip(answers) {
                results.push(match answer {
                    RawRead::Found(sealed) => self.open(&query.key, sealed).map(Fetched::Found),
                    RawRead::NotModified => Ok(Fetched::NotModified),
                    RawRead::NotFound => Ok(Fetched::NotFound),
                });
            }
        }
        Ok(results)
    }

    /// Reads one key unconditionally.
    ///
    /// # Errors
    ///
    /// Returns transport errors, a decrypt/decode error for the value, or
    /// [`SyncError::NotModified`] if the remote answers a plain read as
    /// unchanged.
    pub async fn read(&self, key: &str) -> SyncResult<Option<RemoteRecord<V>>> {
        let mut results = self.try_read_batch(&[RemoteQuery::any(key)]).await?;
        match results.pop() {
            Some(Ok(Fetched::Found(record))) => Ok(Some(record)),
            Some(Ok(Fetched::NotFound)) | None => Ok(None),
            Some(Ok(Fetched::NotModified)) => Err(SyncError::NotModified {
                key: key.to_string(),
            }),
            Some(Err(e)) => Err(e),
        }
    }

    /// Encrypts and uploads records, one status per record in input order.
    ///
    /// A record that cannot be sealed is reported as rejected and never
    /// sent.
    ///
    /// # Errors
    ///
    /// Returns the transport error (or [`SyncError::Timeout`]) if any chunk
    /// fails; the outcome of an unacknowledged upload is unknown and must be
    /// treated as failed.
    pub async fn write_batch(&self, records: &[RemoteRecord<V>]) -> SyncResult<Vec<WriteStatus>> {
        let mut statuses = Vec::with_capacity(records.len());
        let mut sealed = Vec::with_capacity(records.len());
        for record in records {
            match self.seal(record) {
                Ok(s) => sealed.push(s),
                Err(e) => {
                    tracing::warn!(key = %record.key, error = %e, "cannot seal record for upload");
                    statuses.push(WriteStatus {
                        key: record.key.clone(),
                        outcome: WriteOutcome::Rejected(e.to_string()),
                    });
                }
            }
        }

        for chunk in sealed.chunks(self.config.write_batch_size) {
            let acks = self.bounded(self.transport.write_batch(chunk)).await?;
            statuses.extend(acks);
        }
        Ok(statuses)
    }

    /// Deletes keys remotely. Absent keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns the transport error (or [`SyncError::Timeout`]).
    pub async fn remove_batch(&self, keys: &[String]) -> SyncResult<()> {
        for chunk in keys.chunks(self.config.write_batch_size) {
            self.bounded(self.transport.remove_batch(chunk)).await?;
        }
        Ok(())
    }

    fn seal(&self, record: &RemoteRecord<V>) -> SyncResult<SealedRecord> {
        let plaintext = to_cbor(&record.value)?;
        let payload = self.cipher.encrypt(&plaintext, record.key.as_bytes())?;
        Ok(SealedRecord {
            key: record.key.clone(),
            payload,
            timestamp: record.timestamp,
            version: record.version,
        })
    }

    fn open(&self, requested: &str, sealed: SealedRecord) -> SyncResult<RemoteRecord<V>> {
        if sealed.key != requested {
            return Err(SyncError::Protocol(format!(
                "asked for {requested}, remote answered {}",
                sealed.key
            )));
        }
        let plaintext = self.cipher.decrypt(&sealed.payload, sealed.key.as_bytes())?;
        Ok(RemoteRecord {
            value: from_cbor(&plaintext)?,
            key: sealed.key,
            timestamp: sealed.timestamp,
            version: sealed.version,
        })
    }

    async fn bounded<F, R>(&self, call: F) -> SyncResult<R>
    where
        F: Future<Output = SyncResult<R>>,
    {
        match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| SyncError::Timeout)?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmCipher, EncryptionKey, PlaintextCipher};
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use std::time::Duration;

    fn remote_record(key: &str, value: &str, timestamp: u64) -> RemoteRecord<String> {
        RemoteRecord {
            key: key.into(),
            value: value.into(),
            timestamp,
            version: 1,
        }
    }

    fn encrypted_ledger() -> RemoteLedger<String, Arc<MemoryTransport>> {
        let cipher = Arc::new(AesGcmCipher::new(&EncryptionKey::generate()));
        RemoteLedger::new(Arc::new(MemoryTransport::new()), cipher, SyncConfig::new())
    }

    #[tokio::test]
    async fn values_are_encrypted_on_the_wire() {
        let ledger = encrypted_ledger();
        ledger
            .write_batch(&[remote_record("k1", "plain words", 100)])
            .await
            .unwrap();

        let stored = ledger.transport().get("k1").unwrap();
        assert_eq!(stored.timestamp, 100);
        let needle = b"plain words";
        assert!(!stored.payload.windows(needle.len()).any(|w| w == needle));

        let read = ledger.read("k1").await.unwrap().unwrap();
        assert_eq!(read.value, "plain words");
    }

    #[tokio::test]
    async fn conditional_reads_map_to_fetched() {
        let ledger = encrypted_ledger();
        ledger
            .write_batch(&[remote_record("k1", "v", 100)])
            .await
            .unwrap();

        let results = ledger
            .try_read_batch(&[
                RemoteQuery::if_none_match("k1", 100),
                RemoteQuery::if_none_match("k1", 50),
                RemoteQuery::any("nope"),
            ])
            .await
            .unwrap();

        assert!(matches!(results[0], Ok(Fetched::NotModified)));
        assert!(matches!(&results[1], Ok(Fetched::Found(r)) if r.timestamp == 100));
        assert!(matches!(results[2], Ok(Fetched::NotFound)));
    }

    #[tokio::test]
    async fn undecryptable_value_fails_only_that_key() {
        let ledger = encrypted_ledger();
        ledger
            .write_batch(&[remote_record("good", "v", 1)])
            .await
            .unwrap();
        ledger.transport().seed(SealedRecord {
            key: "bad".into(),
            payload: vec![0u8; 40],
            timestamp: 2,
            version: 1,
        });

        let results = ledger
            .try_read_batch(&[RemoteQuery::any("bad"), RemoteQuery::any("good")])
            .await
            .unwrap();
        assert!(matches!(results[0], Err(SyncError::Crypto(_))));
        assert!(matches!(results[1], Ok(Fetched::Found(_))));
    }

    #[tokio::test]
    async fn batches_are_chunked() {
        let transport = Arc::new(MemoryTransport::new());
        let ledger: RemoteLedger<String, _> = RemoteLedger::new(
            Arc::clone(&transport),
            Arc::new(PlaintextCipher),
            SyncConfig::new()
                .with_read_batch_size(2)
                .with_write_batch_size(2),
        );

        let records: Vec<_> = (0..5)
            .map(|i| remote_record(&format!("k{i}"), "v", 10))
            .collect();
        let statuses = ledger.write_batch(&records).await.unwrap();
        assert_eq!(statuses.len(), 5);
        assert_eq!(transport.counters().writes, 3);

        let queries: Vec<_> = (0..5).map(|i| RemoteQuery::any(format!("k{i}"))).collect();
        let results = ledger.try_read_batch(&queries).await.unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(transport.counters().reads, 3);
    }

    #[tokio::test]
    async fn transport_failure_fails_the_batch() {
        let ledger = encrypted_ledger();
        ledger.transport().set_online(false);
        assert!(ledger.read("k").await.is_err());
        assert!(ledger.remove_batch(&["k".to_string()]).await.is_err());
    }

    struct StalledTransport;

    #[async_trait]
    impl RemoteTransport for StalledTransport {
        async fn read_batch(&self, _queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn write_batch(&self, _records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn remove_batch(&self, _keys: &[String]) -> SyncResult<()> {
            Ok(())
        }
    }

    /// Answers every query with `NotModified`, whatever it asked.
    struct AlwaysNotModified;

    #[async_trait]
    impl RemoteTransport for AlwaysNotModified {
        async fn read_batch(&self, queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>> {
            Ok(queries.iter().map(|_| RawRead::NotModified).collect())
        }

        async fn write_batch(&self, _records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>> {
            Ok(Vec::new())
        }

        async fn remove_batch(&self, _keys: &[String]) -> SyncResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn plain_read_answered_not_modified_is_an_error() {
        let ledger: RemoteLedger<String, _> =
            RemoteLedger::new(AlwaysNotModified, Arc::new(PlaintextCipher), SyncConfig::new());
        let result = ledger.read("k").await;
        assert!(matches!(result, Err(SyncError::NotModified { key }) if key == "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_is_enforced() {
        let ledger: RemoteLedger<String, _> = RemoteLedger::new(
            StalledTransport,
            Arc::new(PlaintextCipher),
            SyncConfig::new().with_request_timeout(Duration::from_millis(200)),
        );
        let result = ledger.write_batch(&[remote_record("k", "v", 1)]).await;
        assert!(matches!(result, Err(SyncError::Timeout)));
    }
}
