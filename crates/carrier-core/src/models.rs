//! Queue entry model and strongly-typed identifiers.
//!
//! Defines the central `QueueEntry` entity shared by the live and history
//! tables, newtype wrappers for record identifiers and queue names, and
//! the processing-state machine with its transition guards. Includes
//! database serialization impls for the Postgres repositories.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed record identifier.
///
/// Wraps the BIGSERIAL primary key assigned by the store on insert.
/// Record ids are strictly increasing per table and serve as the claim
/// ordering key (oldest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Placeholder id for entries not yet persisted. The store assigns
    /// the real id on insert.
    pub const UNASSIGNED: Self = Self(0);
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for RecordId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RecordId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for RecordId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Composite queue identifier scoping entries to a logical queue.
///
/// Multiple logical queues share one physical table; the name is the
/// `service:queue` pair that partitions them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Builds a composite queue name from its service and queue parts.
    pub fn new(service: &str, queue: &str) -> Self {
        Self(format!("{service}:{queue}"))
    }

    /// The composite name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl sqlx::Type<PgDb> for QueueName {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueName {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let name = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(name))
    }
}

impl sqlx::Encode<'_, PgDb> for QueueName {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Processing lifecycle state of a queue entry.
///
/// Transitions within one life of an entry are monotone:
///
/// ```text
/// Available -> InProcessing -> Processed
///          |               -> Failed
///          |               -> Available   (reaped)
///          `-> Removed                    (explicit cancellation)
/// ```
///
/// Processed, Failed, and Removed are terminal: the row moves to the
/// history table and is never visible to claim queries again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Eligible for claiming once its effective date has passed.
    Available,

    /// Claimed by exactly one worker. The claim is a conditional update
    /// performed by the store, never by business code.
    InProcessing,

    /// Handler completed normally. Terminal, archived.
    Processed,

    /// Handler failed terminally or exhausted its retry schedule.
    /// Terminal, archived.
    Failed,

    /// Cancelled before processing. Terminal, archived.
    Removed,
}

impl ProcessingState {
    /// Whether this state archives the entry to the history table.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Removed)
    }

    /// Transition guard for the per-entry state machine.
    ///
    /// Claiming (Available -> InProcessing) and reaping (InProcessing ->
    /// Available) are the only non-terminal transitions.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Available => matches!(next, Self::InProcessing | Self::Removed),
            Self::InProcessing => {
                matches!(next, Self::Processed | Self::Failed | Self::Available)
            },
            Self::Processed | Self::Failed | Self::Removed => false,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::InProcessing => write!(f, "in_processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

impl sqlx::Type<PgDb> for ProcessingState {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProcessingState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "available" => Ok(Self::Available),
            "in_processing" => Ok(Self::InProcessing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "removed" => Ok(Self::Removed),
            _ => Err(format!("invalid processing state: {s}").into()),
        }
    }
}

/// A durable queue entry.
///
/// The live and history tables share this shape. Rows in the history
/// table are immutable after insert and only ever carry terminal states.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueEntry {
    /// Store-assigned primary ordering key.
    pub record_id: RecordId,

    /// Logical queue this entry belongs to.
    pub queue_name: QueueName,

    /// Identity of the process that created the entry.
    pub creating_owner: String,

    /// Identity of the process currently holding the claim, if any.
    /// Always None while the entry is Available.
    pub processing_owner: Option<String>,

    /// Current lifecycle state.
    pub processing_state: ProcessingState,

    /// When the current claim was taken. Set by the store at claim time
    /// and compared against the reaper cutoff.
    pub processing_claimed_date: Option<DateTime<Utc>>,

    /// Serialized type discriminator for the domain event.
    pub event_type: String,

    /// Opaque JSON payload for the domain event.
    pub event_payload: String,

    /// Correlation token carried from the originating request.
    pub user_token: Option<Uuid>,

    /// Correlation token linking a retry attempt back to the entry that
    /// scheduled it.
    pub future_user_token: Option<Uuid>,

    /// Caller-opaque indexed filter column.
    pub search_key1: i64,

    /// Caller-opaque indexed filter column.
    pub search_key2: i64,

    /// When the entry becomes eligible for claiming.
    pub effective_date: DateTime<Utc>,

    /// Number of consecutive processing failures across the retry chain.
    pub error_count: i64,

    /// Insertion timestamp.
    pub created_date: DateTime<Utc>,
}

impl QueueEntry {
    /// Creates a new Available entry ready for insertion.
    ///
    /// The record id is assigned by the store; `effective_date` in the
    /// future produces a scheduled notification.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_name: QueueName,
        creating_owner: String,
        event_type: String,
        event_payload: String,
        effective_date: DateTime<Utc>,
        user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
        created_date: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: RecordId::UNASSIGNED,
            queue_name,
            creating_owner,
            processing_owner: None,
            processing_state: ProcessingState::Available,
            processing_claimed_date: None,
            event_type,
            event_payload,
            user_token,
            future_user_token: None,
            search_key1,
            search_key2,
            effective_date,
            error_count: 0,
            created_date,
        }
    }

    /// Whether the entry is eligible for claiming at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.processing_state == ProcessingState::Available && self.effective_date <= now
    }
}
