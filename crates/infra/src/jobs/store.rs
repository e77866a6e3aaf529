//! Status/result persistence.
//!
//! Two logical namespaces derived from one job id:
//!
//! - `status:{job_id}` → [`StatusRecord`], overwritten on every write, no TTL by default
//! - `result:{job_id}` → [`ResultRecord`], written once per attempt, always with a TTL
//!
//! Records are kept as serialized JSON in every backend, so the in-memory store
//! exercises the same wire contract as the Redis one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use optforge_core::JobId;

use super::types::{JobState, ResultRecord, StatusRecord, StatusUpdate};

/// Default lifetime of a result record (24 hours).
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(86_400);

/// Result store abstraction.
///
/// Errors are never swallowed and never retried here; they surface to the envelope.
pub trait ResultStore: Send + Sync {
    /// Time used for record timestamps, so `completed_at` and `updated_at` agree.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Overwrite the status record of `job_id`. The store stamps `updated_at`.
    fn write_status(&self, job_id: &JobId, update: &StatusUpdate) -> Result<(), ResultStoreError>;

    /// Store the result record of `job_id`; it reads as absent once `ttl` has elapsed.
    fn write_result(
        &self,
        job_id: &JobId,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError>;

    /// Terminal write: result first, then the final status.
    ///
    /// Backends that can apply both at once override this.
    fn write_terminal(
        &self,
        job_id: &JobId,
        status: &StatusUpdate,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        self.write_result(job_id, record, ttl)?;
        self.write_status(job_id, status)
    }

    fn read_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, ResultStoreError>;

    fn read_result(&self, job_id: &JobId) -> Result<Option<ResultRecord>, ResultStoreError>;

    /// Current state as seen by a poller; no status record yet means `queued`.
    fn read_state(&self, job_id: &JobId) -> Result<JobState, ResultStoreError> {
        Ok(self
            .read_status(job_id)?
            .map_or(JobState::Queued, |record| record.status))
    }
}

/// Result store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResultStoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S: ResultStore + ?Sized> ResultStore for Arc<S> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn write_status(&self, job_id: &JobId, update: &StatusUpdate) -> Result<(), ResultStoreError> {
        (**self).write_status(job_id, update)
    }

    fn write_result(
        &self,
        job_id: &JobId,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        (**self).write_result(job_id, record, ttl)
    }

    fn write_terminal(
        &self,
        job_id: &JobId,
        status: &StatusUpdate,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        (**self).write_terminal(job_id, status, record, ttl)
    }

    fn read_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, ResultStoreError> {
        (**self).read_status(job_id)
    }

    fn read_result(&self, job_id: &JobId) -> Result<Option<ResultRecord>, ResultStoreError> {
        (**self).read_result(job_id)
    }
}

/// Key layout shared by all backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: Option<String>,
}

impl KeySpace {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    pub fn status_key(&self, job_id: &JobId) -> String {
        self.key("status", job_id)
    }

    pub fn result_key(&self, job_id: &JobId) -> String {
        self.key("result", job_id)
    }

    fn key(&self, namespace: &str, job_id: &JobId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{namespace}:{job_id}"),
            None => format!("{namespace}:{job_id}"),
        }
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<String, ResultStoreError> {
    serde_json::to_string(value).map_err(|e| ResultStoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, ResultStoreError> {
    serde_json::from_str(raw).map_err(|e| ResultStoreError::Serialization(e.to_string()))
}

/// `now + ttl`, saturating at the latest representable instant.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for expiry tests.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = expiry(*now, by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory result store for tests/dev.
#[derive(Debug)]
pub struct InMemoryResultStore<C: Clock = SystemClock> {
    entries: RwLock<HashMap<String, Entry>>,
    keys: KeySpace,
    clock: C,
    status_ttl: Option<Duration>,
}

impl InMemoryResultStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for InMemoryResultStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryResultStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            keys: KeySpace::default(),
            clock,
            status_ttl: None,
        }
    }

    pub fn with_key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    /// Optional retention for status records (none by default).
    pub fn with_status_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Raw serialized value under `key`, if live.
    pub fn raw(&self, key: &str) -> Result<Option<String>, ResultStoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, ResultStoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }

    /// Number of live entries across both namespaces.
    pub fn len(&self) -> Result<usize, ResultStoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.values().filter(|e| e.is_live(now)).count())
    }

    pub fn is_empty(&self) -> Result<bool, ResultStoreError> {
        Ok(self.len()? == 0)
    }

    fn status_entry(
        &self,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Entry, ResultStoreError> {
        Ok(Entry {
            value: encode(&update.stamp(now))?,
            expires_at: self.status_ttl.map(|ttl| expiry(now, ttl)),
        })
    }

    fn result_entry(
        &self,
        record: &ResultRecord,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Entry, ResultStoreError> {
        Ok(Entry {
            value: encode(record)?,
            expires_at: Some(expiry(now, ttl)),
        })
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ResultStoreError> {
        self.raw(key)?.map(|raw| decode(&raw)).transpose()
    }
}

fn poisoned() -> ResultStoreError {
    ResultStoreError::Storage("result store lock poisoned".to_string())
}

impl<C: Clock> ResultStore for InMemoryResultStore<C> {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn write_status(&self, job_id: &JobId, update: &StatusUpdate) -> Result<(), ResultStoreError> {
        let entry = self.status_entry(update, self.clock.now())?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(self.keys.status_key(job_id), entry);
        Ok(())
    }

    fn write_result(
        &self,
        job_id: &JobId,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        let entry = self.result_entry(record, ttl, self.clock.now())?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(self.keys.result_key(job_id), entry);
        Ok(())
    }

    fn write_terminal(
        &self,
        job_id: &JobId,
        status: &StatusUpdate,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        let now = self.clock.now();
        let result = self.result_entry(record, ttl, now)?;
        let status = self.status_entry(status, now)?;

        // Readers never observe one without the other.
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(self.keys.result_key(job_id), result);
        entries.insert(self.keys.status_key(job_id), status);
        Ok(())
    }

    fn read_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, ResultStoreError> {
        self.read(&self.keys.status_key(job_id))
    }

    fn read_result(&self, job_id: &JobId) -> Result<Option<ResultRecord>, ResultStoreError> {
        self.read(&self.keys.result_key(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use optforge_ai::Metrics;

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn success_record() -> ResultRecord {
        ResultRecord::success(json!({"rule": "identity"}), Metrics::new(), Utc::now())
    }

    #[test]
    fn key_layout() {
        let plain = KeySpace::default();
        assert_eq!(plain.status_key(&job("j1")), "status:j1");
        assert_eq!(plain.result_key(&job("j1")), "result:j1");

        let prefixed = KeySpace::new(Some("optforge".to_string()));
        assert_eq!(prefixed.status_key(&job("j1")), "optforge:status:j1");
        assert_eq!(KeySpace::new(Some(String::new())), KeySpace::default());
    }

    #[test]
    fn status_write_overwrites_and_stamps_time() {
        let clock = ManualClock::default();
        let store = InMemoryResultStore::with_clock(clock.clone());
        let id = job("j1");

        store.write_status(&id, &StatusUpdate::running(10, "a")).unwrap();
        let first = store.read_status(&id).unwrap().unwrap();

        clock.advance(Duration::from_secs(5));
        store.write_status(&id, &StatusUpdate::running(45, "b")).unwrap();
        let second = store.read_status(&id).unwrap().unwrap();

        assert_eq!(second.progress, 45);
        assert_eq!(second.message, "b");
        assert_eq!(second.updated_at - first.updated_at, chrono::Duration::seconds(5));
    }

    #[test]
    fn status_has_no_ttl_by_default() {
        let clock = ManualClock::default();
        let store = InMemoryResultStore::with_clock(clock.clone());
        let id = job("j1");

        store.write_status(&id, &StatusUpdate::running(0, "start")).unwrap();
        clock.advance(Duration::from_secs(365 * 86_400));
        assert!(store.read_status(&id).unwrap().is_some());
    }

    #[test]
    fn optional_status_retention() {
        let clock = ManualClock::default();
        let store = InMemoryResultStore::with_clock(clock.clone())
            .with_status_ttl(Some(Duration::from_secs(60)));
        let id = job("j1");

        store.write_status(&id, &StatusUpdate::running(0, "start")).unwrap();
        clock.advance(Duration::from_secs(61));
        assert!(store.read_status(&id).unwrap().is_none());
    }

    #[test]
    fn result_respects_ttl() {
        let clock = ManualClock::default();
        let store = InMemoryResultStore::with_clock(clock.clone());
        let id = job("j1");
        let ttl = Duration::from_secs(100);

        store.write_result(&id, &success_record(), ttl).unwrap();

        clock.advance(Duration::from_millis(99_999));
        assert!(store.read_result(&id).unwrap().is_some());

        clock.advance(Duration::from_millis(2));
        assert!(store.read_result(&id).unwrap().is_none());
    }

    #[test]
    fn purge_removes_only_expired() {
        let clock = ManualClock::default();
        let store = InMemoryResultStore::with_clock(clock.clone());

        store
            .write_result(&job("short"), &success_record(), Duration::from_secs(1))
            .unwrap();
        store
            .write_result(&job("long"), &success_record(), DEFAULT_RESULT_TTL)
            .unwrap();
        store
            .write_status(&job("short"), &StatusUpdate::completed("done"))
            .unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn terminal_write_sets_both_records() {
        let store = InMemoryResultStore::new();
        let id = job("j1");

        store
            .write_terminal(
                &id,
                &StatusUpdate::completed("done"),
                &success_record(),
                DEFAULT_RESULT_TTL,
            )
            .unwrap();

        assert_eq!(store.read_state(&id).unwrap(), JobState::Completed);
        assert!(store.read_result(&id).unwrap().unwrap().success);
    }

    #[test]
    fn missing_status_reads_as_queued() {
        let store = InMemoryResultStore::new();
        assert_eq!(store.read_state(&job("never-started")).unwrap(), JobState::Queued);
    }

    #[test]
    fn records_are_stored_as_json() {
        let store = InMemoryResultStore::new();
        let id = job("j1");
        store.write_status(&id, &StatusUpdate::running(10, "working")).unwrap();

        let raw = store.raw("status:j1").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["progress"], json!(10));
        assert_eq!(value["message"], json!("working"));
    }

    #[test]
    fn corrupt_payload_surfaces_as_serialization_error() {
        let store = InMemoryResultStore::new();
        store
            .entries
            .write()
            .unwrap()
            .insert(
                "result:j1".to_string(),
                Entry {
                    value: "{not json".to_string(),
                    expires_at: None,
                },
            );

        assert!(matches!(
            store.read_result(&job("j1")),
            Err(ResultStoreError::Serialization(_))
        ));
    }
}
