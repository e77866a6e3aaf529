//! Redis-backed result store.
//!
//! - `status:{job_id}` → `SET` (plain overwrite; `PX` only when a status TTL is configured)
//! - `result:{job_id}` → `SET ... PX <ttl>`
//! - terminal write → both commands in one `MULTI`/`EXEC` pipeline
//!
//! Expiry is enforced by Redis itself; values are the same JSON documents the
//! in-memory store keeps.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use optforge_core::JobId;

use super::store::{KeySpace, ResultStore, ResultStoreError, decode, encode};
use super::types::{ResultRecord, StatusRecord, StatusUpdate};

#[derive(Debug, Clone)]
pub struct RedisResultStore {
    client: Arc<redis::Client>,
    keys: KeySpace,
    status_ttl: Option<Duration>,
}

impl RedisResultStore {
    /// Open a client for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, ResultStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ResultStoreError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            keys: KeySpace::default(),
            status_ttl: None,
        })
    }

    pub fn with_key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_status_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn connection(&self) -> Result<redis::Connection, ResultStoreError> {
        self.client
            .get_connection()
            .map_err(|e| ResultStoreError::Connection(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<String>, ResultStoreError> {
        let mut conn = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))
    }
}

/// `SET key value [PX ms]`
fn set_cmd(key: &str, value: &str, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        // PX rejects 0
        cmd.arg("PX").arg(ttl_millis(ttl));
    }
    cmd
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl ResultStore for RedisResultStore {
    #[instrument(skip(self, update), fields(job_id = %job_id))]
    fn write_status(&self, job_id: &JobId, update: &StatusUpdate) -> Result<(), ResultStoreError> {
        let value = encode(&update.stamp(self.now()))?;
        let mut conn = self.connection()?;
        set_cmd(&self.keys.status_key(job_id), &value, self.status_ttl)
            .query::<()>(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))
    }

    #[instrument(skip(self, record), fields(job_id = %job_id))]
    fn write_result(
        &self,
        job_id: &JobId,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        let value = encode(record)?;
        let mut conn = self.connection()?;
        set_cmd(&self.keys.result_key(job_id), &value, Some(ttl))
            .query::<()>(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))
    }

    #[instrument(skip(self, status, record), fields(job_id = %job_id))]
    fn write_terminal(
        &self,
        job_id: &JobId,
        status: &StatusUpdate,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), ResultStoreError> {
        let result_value = encode(record)?;
        let status_value = encode(&status.stamp(self.now()))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .add_command(set_cmd(&self.keys.result_key(job_id), &result_value, Some(ttl)))
            .ignore()
            .add_command(set_cmd(
                &self.keys.status_key(job_id),
                &status_value,
                self.status_ttl,
            ))
            .ignore();

        let mut conn = self.connection()?;
        pipe.query::<()>(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))
    }

    fn read_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, ResultStoreError> {
        self.get(&self.keys.status_key(job_id))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn read_result(&self, job_id: &JobId) -> Result<Option<ResultRecord>, ResultStoreError> {
        self.get(&self.keys.result_key(job_id))?
            .map(|raw| decode(&raw))
            .transpose()
    }
}
