//! Remote apply gateway.
//!
//! `RemoteGateway` is the all-or-nothing batch contract the worker depends
//! on. `BatchedWriteGateway` implements it on top of any document store that
//! can commit a `WriteBatch` atomically.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::error::{RemoteApplyError, RemoteErrorKind};
use crate::types::{AuditInfo, EntityKind, Mutation, MutationType, User};

// ============================================================================
// RemoteGateway: the worker's view of the remote store
// ============================================================================

/// Applies one user's batch of mutations remotely.
///
/// Either every mutation in `mutations` takes effect or none does. Mutation
/// kinds the implementation cannot interpret are a contract violation and
/// must fail the whole batch.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn apply_batch(&self, mutations: &[Mutation], user: &User)
        -> Result<(), RemoteApplyError>;
}

// ============================================================================
// WriteBatch
// ============================================================================

/// One document write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    /// Create or overwrite the document
    Set { path: String, data: Value },
    /// Update the listed fields; dotted keys address nested fields
    Merge { path: String, data: Value },
    Delete { path: String },
}

impl RemoteWrite {
    pub fn path(&self) -> &str {
        match self {
            RemoteWrite::Set { path, .. }
            | RemoteWrite::Merge { path, .. }
            | RemoteWrite::Delete { path } => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub writes: Vec<RemoteWrite>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Map a user's mutations to document writes, preserving order.
    pub fn from_mutations(mutations: &[Mutation], user: &User) -> Result<Self, RemoteApplyError> {
        let mut batch = WriteBatch::default();
        for mutation in mutations {
            batch.writes.push(to_write(mutation, user)?);
        }
        Ok(batch)
    }
}

fn document_path(mutation: &Mutation) -> Result<String, RemoteApplyError> {
    match &mutation.entity_kind {
        EntityKind::Feature => Ok(format!(
            "surveys/{}/features/{}",
            mutation.survey_id, mutation.entity_id
        )),
        EntityKind::Observation => Ok(format!(
            "surveys/{}/observations/{}",
            mutation.survey_id, mutation.entity_id
        )),
        EntityKind::Unrecognized(kind) => {
            error!(mutation_id = %mutation.id, kind = %kind, "unsupported mutation reached gateway");
            Err(RemoteApplyError::with_kind(
                format!("unsupported mutation kind \"{kind}\" in {}", mutation.id),
                RemoteErrorKind::Unsupported,
            ))
        }
    }
}

fn audit_value(mutation: &Mutation, user: &User) -> Result<Value, RemoteApplyError> {
    serde_json::to_value(AuditInfo::new(user, mutation.client_timestamp)).map_err(|e| {
        RemoteApplyError::with_kind(format!("encode audit info: {e}"), RemoteErrorKind::Permanent)
    })
}

fn nullable(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::String(v.to_string()))
}

fn to_write(mutation: &Mutation, user: &User) -> Result<RemoteWrite, RemoteApplyError> {
    let path = document_path(mutation)?;

    match mutation.mutation_type {
        MutationType::Create => {
            let audit = audit_value(mutation, user)?;
            let mut data = Map::new();
            data.insert("id".to_string(), json!(mutation.entity_id));
            data.insert("created".to_string(), audit.clone());
            data.insert("lastModified".to_string(), audit);
            if mutation.entity_kind == EntityKind::Observation {
                data.insert("featureId".to_string(), json!(mutation.feature_id));
                let responses: Map<String, Value> = mutation
                    .field_deltas
                    .iter()
                    .map(|d| (d.field_id.clone(), nullable(d.new_value.as_deref())))
                    .collect();
                data.insert("responses".to_string(), Value::Object(responses));
            }
            Ok(RemoteWrite::Set {
                path,
                data: Value::Object(data),
            })
        }
        MutationType::Update => {
            let mut data = Map::new();
            data.insert("lastModified".to_string(), audit_value(mutation, user)?);
            for delta in &mutation.field_deltas {
                data.insert(
                    format!("responses.{}", delta.field_id),
                    nullable(delta.new_value.as_deref()),
                );
            }
            Ok(RemoteWrite::Merge {
                path,
                data: Value::Object(data),
            })
        }
        MutationType::Delete => Ok(RemoteWrite::Delete { path }),
    }
}

// ============================================================================
// RemoteStore + BatchedWriteGateway
// ============================================================================

/// Document store that commits a `WriteBatch` atomically.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn commit(&self, batch: WriteBatch) -> Result<(), RemoteApplyError>;
}

/// `RemoteGateway` that turns each batch into one `RemoteStore::commit`.
pub struct BatchedWriteGateway {
    store: Arc<dyn RemoteStore>,
}

impl BatchedWriteGateway {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RemoteGateway for BatchedWriteGateway {
    async fn apply_batch(
        &self,
        mutations: &[Mutation],
        user: &User,
    ) -> Result<(), RemoteApplyError> {
        let batch = WriteBatch::from_mutations(mutations, user)?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(user_id = %user.id, writes = batch.len(), "committing write batch");
        self.store.commit(batch).await
    }
}
