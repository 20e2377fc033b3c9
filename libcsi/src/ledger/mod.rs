//! Idempotent operation ledger.
//!
//! The provisioning path records every long-running volume operation
//! (create, delete, attach, detach, snapshot) under an idempotency name
//! derived from the claim or snapshot it serves.  When a client retries a
//! request that is still in flight, the ledger tells the caller which task
//! is already running and how it ended, so the side effect is not repeated.
//!
//! Each entry keeps the first operation ever stored and a bounded history of
//! the latest ones.  Updates are read-modify-write against an [`EntryStore`]
//! with optimistic concurrency: a lost race surfaces as
//! [`CsiError::Conflict`] and retrying is up to the caller.

mod store;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

pub use store::{EntryStore, FileEntryStore, MemoryEntryStore};

use crate::error::CsiError;

/// Namespace ledger entries live in unless overridden.
pub const DEFAULT_CSI_NAMESPACE: &str = "rk8s-system-csi";

/// How many recent operations an entry remembers.
pub const MAX_ENTRIES_IN_LATEST_OPERATION_DETAILS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Errored,
}

/// One invocation of a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationDetails {
    /// Opaque identifier of the backend task.
    pub task_id: String,
    /// Identifier of the backend call that started the task.
    pub op_id: String,
    pub invocation_timestamp: SystemTime,
    pub task_status: TaskStatus,
    pub error: Option<String>,
}

impl OperationDetails {
    pub fn new(task_id: impl Into<String>, task_status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            op_id: String::new(),
            invocation_timestamp: SystemTime::now(),
            task_status,
            error: None,
        }
    }
}

/// What callers store and get back.  `operation_details` is the operation
/// being recorded, or on reads the most recent one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeOperationRequestDetails {
    pub name: String,
    pub volume_id: String,
    pub snapshot_id: Option<String>,
    pub capacity: i64,
    pub operation_details: Option<OperationDetails>,
}

impl VolumeOperationRequestDetails {
    pub fn new(
        name: impl Into<String>,
        volume_id: impl Into<String>,
        capacity: i64,
        operation_details: OperationDetails,
    ) -> Self {
        Self {
            name: name.into(),
            volume_id: volume_id.into(),
            snapshot_id: None,
            capacity,
            operation_details: Some(operation_details),
        }
    }
}

/// The persisted form of one idempotency name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub namespace: String,
    pub name: String,
    /// Bumped by the store on every write.
    pub resource_version: u64,
    pub volume_id: String,
    pub snapshot_id: Option<String>,
    pub capacity: i64,
    pub first_operation_details: OperationDetails,
    /// Oldest first, never longer than
    /// [`MAX_ENTRIES_IN_LATEST_OPERATION_DETAILS`].
    pub latest_operation_details: Vec<OperationDetails>,
}

impl LedgerEntry {
    fn new(namespace: &str, details: &VolumeOperationRequestDetails, op: OperationDetails) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: details.name.clone(),
            resource_version: 0,
            volume_id: details.volume_id.clone(),
            snapshot_id: details.snapshot_id.clone(),
            capacity: details.capacity,
            first_operation_details: op.clone(),
            latest_operation_details: vec![op],
        }
    }

    /// Fold `op` into the entry.
    fn record(&mut self, details: &VolumeOperationRequestDetails, op: OperationDetails) {
        self.volume_id = details.volume_id.clone();
        self.snapshot_id = details.snapshot_id.clone();
        self.capacity = details.capacity;

        // NOTE: an entry whose first record lost its task id takes whatever
        // operation comes next as its first one.
        let first = &self.first_operation_details.task_id;
        if first.is_empty() || *first == op.task_id {
            self.first_operation_details = op.clone();
        }

        match self
            .latest_operation_details
            .iter()
            .rposition(|d| d.task_id == op.task_id)
        {
            Some(idx) => self.latest_operation_details[idx] = op,
            None => {
                self.latest_operation_details.push(op);
                if self.latest_operation_details.len() > MAX_ENTRIES_IN_LATEST_OPERATION_DETAILS {
                    self.latest_operation_details.remove(0);
                }
            }
        }
    }
}

/// Persisted request details keyed by idempotency name.
#[async_trait]
pub trait VolumeOperationRequest: Send + Sync {
    /// Details of `name` with its most recent operation.
    async fn get_request_details(&self, name: &str) -> Result<VolumeOperationRequestDetails, CsiError>;

    /// Create or update the entry for `details.name`.
    async fn store_request_details(&self, details: &VolumeOperationRequestDetails) -> Result<(), CsiError>;

    /// Forget `name` once the backing volume is gone.
    async fn delete_request_details(&self, name: &str) -> Result<(), CsiError>;
}

/// [`VolumeOperationRequest`] over any [`EntryStore`].
pub struct OperationRequestStore<S> {
    store: S,
    namespace: String,
}

impl<S: EntryStore> OperationRequestStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_namespace(store, DEFAULT_CSI_NAMESPACE)
    }

    pub fn with_namespace(store: S, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: EntryStore> VolumeOperationRequest for OperationRequestStore<S> {
    #[instrument(skip(self), fields(namespace = %self.namespace, trace_id = %uuid::Uuid::new_v4()))]
    async fn get_request_details(&self, name: &str) -> Result<VolumeOperationRequestDetails, CsiError> {
        let entry = self.store.get(&self.namespace, name).await?.ok_or_else(|| {
            CsiError::NotFound(format!("operation request {}/{name} not found", self.namespace))
        })?;
        debug!(resource_version = entry.resource_version, "found ledger entry");

        let latest = entry.latest_operation_details.last().cloned().ok_or_else(|| {
            CsiError::Internal(
                "length of LatestOperationDetails expected to be greater than 1 if the instance exists"
                    .to_owned(),
            )
        })?;
        Ok(VolumeOperationRequestDetails {
            name: entry.name,
            volume_id: entry.volume_id,
            snapshot_id: entry.snapshot_id,
            capacity: entry.capacity,
            operation_details: Some(latest),
        })
    }

    #[instrument(skip(self, details), fields(name = %details.name, trace_id = %uuid::Uuid::new_v4()))]
    async fn store_request_details(&self, details: &VolumeOperationRequestDetails) -> Result<(), CsiError> {
        let Some(op) = details.operation_details.clone() else {
            error!("cannot store empty operation");
            return Err(CsiError::InvalidArgument("cannot store empty operation".to_owned()));
        };
        let task_id = op.task_id.clone();

        match self.store.get(&self.namespace, &details.name).await? {
            None => {
                let entry = LedgerEntry::new(&self.namespace, details, op);
                self.store.create(entry).await.inspect_err(|e| {
                    error!(error = %e, "failed to create ledger entry");
                })?;
                debug!(%task_id, "created ledger entry");
            }
            Some(mut entry) => {
                entry.record(details, op);
                self.store.update(entry).await.inspect_err(|e| {
                    error!(error = %e, "failed to update ledger entry");
                })?;
                debug!(%task_id, "updated ledger entry");
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn delete_request_details(&self, name: &str) -> Result<(), CsiError> {
        self.store.delete(&self.namespace, name).await
    }
}
