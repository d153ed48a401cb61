use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// EntityKind / MutationType
// ============================================================================

/// What a mutation targets. `Unrecognized` carries a kind tag read back from
/// storage that this build cannot interpret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    Feature,
    Observation,
    Unrecognized(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Feature => "FEATURE",
            EntityKind::Observation => "OBSERVATION",
            EntityKind::Unrecognized(tag) => tag,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, EntityKind::Unrecognized(_))
    }
}

impl From<String> for EntityKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "FEATURE" => EntityKind::Feature,
            "OBSERVATION" => EntityKind::Observation,
            _ => EntityKind::Unrecognized(tag),
        }
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Create => "CREATE",
            MutationType::Update => "UPDATE",
            MutationType::Delete => "DELETE",
        }
    }
}

impl FromStr for MutationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(MutationType::Create),
            "UPDATE" => Ok(MutationType::Update),
            "DELETE" => Ok(MutationType::Delete),
            other => Err(format!("unknown mutation type \"{other}\"")),
        }
    }
}

// ============================================================================
// FieldDelta
// ============================================================================

/// Form field type tag. Only `Photo` changes sync behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Text,
    MultipleChoice,
    Number,
    Date,
    Time,
    Photo,
    #[serde(other)]
    Unknown,
}

/// One field-level change within an observation mutation. Values are opaque
/// references; for photo fields they are remote path identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDelta {
    pub field_id: String,
    pub field_type: FieldType,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
}

impl FieldDelta {
    pub fn new(
        field_id: impl Into<String>,
        field_type: FieldType,
        previous_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Self {
        Self {
            field_id: field_id.into(),
            field_type,
            previous_value: previous_value.map(str::to_string),
            new_value: new_value.map(str::to_string),
        }
    }

    pub fn photo(
        field_id: impl Into<String>,
        previous_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Self {
        Self::new(field_id, FieldType::Photo, previous_value, new_value)
    }

    pub fn is_photo(&self) -> bool {
        self.field_type == FieldType::Photo
    }
}

// ============================================================================
// Mutation
// ============================================================================

/// A pending, durable record of one local change to a feature or observation.
///
/// `sequence` is assigned by the mutation log on append and defines creation
/// order; it is `0` for a mutation that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: String,
    pub sequence: i64,
    pub survey_id: String,
    /// Sync scope: the feature itself, or the feature an observation belongs to
    pub feature_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub user_id: String,
    pub mutation_type: MutationType,
    pub field_deltas: Vec<FieldDelta>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub client_timestamp: DateTime<Utc>,
}

impl Mutation {
    fn base(
        survey_id: &str,
        feature_id: &str,
        entity_kind: EntityKind,
        entity_id: &str,
        user_id: &str,
        mutation_type: MutationType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            survey_id: survey_id.to_string(),
            feature_id: feature_id.to_string(),
            entity_kind,
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
            mutation_type,
            field_deltas: Vec::new(),
            retry_count: 0,
            last_error: None,
            client_timestamp: Utc::now(),
        }
    }

    /// A change to a map feature.
    pub fn feature(
        survey_id: &str,
        feature_id: &str,
        user_id: &str,
        mutation_type: MutationType,
    ) -> Self {
        Self::base(
            survey_id,
            feature_id,
            EntityKind::Feature,
            feature_id,
            user_id,
            mutation_type,
        )
    }

    /// A change to an observation attached to `feature_id`.
    pub fn observation(
        survey_id: &str,
        feature_id: &str,
        observation_id: &str,
        user_id: &str,
        mutation_type: MutationType,
    ) -> Self {
        Self::base(
            survey_id,
            feature_id,
            EntityKind::Observation,
            observation_id,
            user_id,
            mutation_type,
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = kind;
        self
    }

    pub fn with_delta(mut self, delta: FieldDelta) -> Self {
        self.field_deltas.push(delta);
        self
    }

    pub fn with_deltas(mut self, deltas: impl IntoIterator<Item = FieldDelta>) -> Self {
        self.field_deltas.extend(deltas);
        self
    }

    pub fn photo_deltas(&self) -> impl Iterator<Item = &FieldDelta> {
        self.field_deltas.iter().filter(|d| d.is_photo())
    }

    /// Terminal when a retry bound is configured and reached.
    pub fn is_abandoned(&self, max_retry_count: Option<u32>) -> bool {
        max_retry_count.is_some_and(|max| self.retry_count >= max)
    }
}

/// A mutation removed from pending state without remote effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardedMutation {
    pub mutation: Mutation,
    pub reason: String,
}

// ============================================================================
// User
// ============================================================================

/// Attribution record: mutations are replayed as the user who created them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

impl User {
    pub fn new(id: &str, email: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            email: email.to_string(),
            display_name: display_name.to_string(),
        }
    }
}

/// Audit stamp written alongside remote documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfo {
    pub user: User,
    pub client_timestamp: DateTime<Utc>,
}

impl AuditInfo {
    pub fn new(user: &User, client_timestamp: DateTime<Utc>) -> Self {
        Self {
            user: user.clone(),
            client_timestamp,
        }
    }
}

// ============================================================================
// Photo transfers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferOperation {
    Upload,
    Delete,
}

/// Photo upload/delete handed to the external durable worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoTransferTask {
    /// Source file for uploads; `None` for deletes
    pub local_path: Option<PathBuf>,
    pub remote_path: String,
    pub operation: TransferOperation,
}

impl PhotoTransferTask {
    pub fn upload(local_path: PathBuf, remote_path: &str) -> Self {
        Self {
            local_path: Some(local_path),
            remote_path: remote_path.to_string(),
            operation: TransferOperation::Upload,
        }
    }

    pub fn delete(remote_path: &str) -> Self {
        Self {
            local_path: None,
            remote_path: remote_path.to_string(),
            operation: TransferOperation::Delete,
        }
    }

    /// Dedup key for the external worker.
    pub fn identity(&self) -> String {
        match self.operation {
            TransferOperation::Upload => format!("upload:{}", self.remote_path),
            TransferOperation::Delete => format!("delete:{}", self.remote_path),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
