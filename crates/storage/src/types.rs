use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt;

use super::error::{
    DecodeInlinePayloadSnafu, InvalidPayloadSnafu, StorageError, StorageResult,
};
use super::ids::{MessageId, RecordId};

/// Default title used when a record is created without one.
pub const DEFAULT_RECORD_TITLE: &str = "New Conversation";

const INLINE_PREFIX: &str = "base64:";
const LOCAL_PREFIX: &str = "local:";
const REMOTE_PREFIX: &str = "remote:";
const STRIPPED_PREFIX: &str = "stripped:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: RecordId,
    pub title: String,
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub created_at: u64,
    pub last_modified: u64,
    pub pinned: bool,
    /// Set when the copy went through payload stripping or text truncation.
    #[serde(default, skip_serializing_if = "is_false")]
    pub reduced: bool,
}

impl ConversationRecord {
    pub fn new(id: RecordId, title: impl Into<String>, now: u64) -> Self {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_RECORD_TITLE.to_string();
        }

        Self {
            id,
            title,
            messages: Vec::new(),
            system_prompt: String::new(),
            created_at: now,
            last_modified: now,
            pinned: false,
            reduced: false,
        }
    }

    pub fn media_parts(&self) -> impl Iterator<Item = &MediaPart> {
        self.messages
            .iter()
            .flat_map(|message| message.content.parts())
            .filter_map(ContentPart::media)
    }

    pub fn media_parts_mut(&mut self) -> impl Iterator<Item = &mut MediaPart> {
        self.messages
            .iter_mut()
            .flat_map(|message| message.content.parts_mut())
            .filter_map(ContentPart::media_mut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
}

impl Message {
    pub fn new(role: MessageRole, content: MessageContent) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content,
            truncated: false,
        }
    }

    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(role, MessageContent::Text(text.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn parts(&self) -> &[ContentPart] {
        match self {
            Self::Text(_) => &[],
            Self::Parts(parts) => parts,
        }
    }

    pub fn parts_mut(&mut self) -> &mut [ContentPart] {
        match self {
            Self::Text(_) => &mut [],
            Self::Parts(parts) => parts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Audio,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image(MediaPart),
    Audio(MediaPart),
    File(MediaPart),
}

impl ContentPart {
    pub fn kind(&self) -> Option<ContentKind> {
        match self {
            Self::Text { .. } => None,
            Self::Image(_) => Some(ContentKind::Image),
            Self::Audio(_) => Some(ContentKind::Audio),
            Self::File(_) => Some(ContentKind::File),
        }
    }

    pub fn media(&self) -> Option<&MediaPart> {
        match self {
            Self::Text { .. } => None,
            Self::Image(part) | Self::Audio(part) | Self::File(part) => Some(part),
        }
    }

    pub fn media_mut(&mut self) -> Option<&mut MediaPart> {
        match self {
            Self::Text { .. } => None,
            Self::Image(part) | Self::Audio(part) | Self::File(part) => Some(part),
        }
    }
}

/// Binary attachment; `size_bytes` and `content_type` survive stripping and offload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPart {
    pub kind: ContentKind,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub payload: Payload,
}

impl MediaPart {
    pub fn inline(kind: ContentKind, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            content_type: content_type.into(),
            file_name: None,
            size_bytes: bytes.len() as u64,
            duration_ms: None,
            payload: Payload::Inline(bytes),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn into_part(self) -> ContentPart {
        match self.kind {
            ContentKind::Image => ContentPart::Image(self),
            ContentKind::Audio => ContentPart::Audio(self),
            ContentKind::File => ContentPart::File(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactStoreKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactReference {
    pub store: ArtifactStoreKind,
    pub id: String,
}

impl ArtifactReference {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            store: ArtifactStoreKind::Local,
            id: id.into(),
        }
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            store: ArtifactStoreKind::Remote,
            id: id.into(),
        }
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.store {
            ArtifactStoreKind::Local => LOCAL_PREFIX,
            ArtifactStoreKind::Remote => REMOTE_PREFIX,
        };
        write!(formatter, "{prefix}{}", self.id)
    }
}

/// Payload field of a media part, persisted as a prefixed string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(Vec<u8>),
    Reference(ArtifactReference),
    Stripped { original_bytes: u64 },
}

impl Payload {
    pub fn encode(&self) -> String {
        match self {
            Self::Inline(bytes) => format!("{INLINE_PREFIX}{}", B64.encode(bytes)),
            Self::Reference(reference) => reference.to_string(),
            Self::Stripped { original_bytes } => format!("{STRIPPED_PREFIX}{original_bytes}"),
        }
    }

    pub fn decode(raw: &str) -> StorageResult<Self> {
        if let Some(data) = raw.strip_prefix(INLINE_PREFIX) {
            return decode_base64(data);
        }
        // Data URLs written by older clients are accepted as inline payloads.
        if raw.starts_with("data:")
            && let Some((_, data)) = raw.split_once(";base64,")
        {
            return decode_base64(data);
        }
        if let Some(id) = raw.strip_prefix(REMOTE_PREFIX) {
            return non_empty_reference(raw, ArtifactReference::remote(id));
        }
        if let Some(id) = raw.strip_prefix(LOCAL_PREFIX) {
            return non_empty_reference(raw, ArtifactReference::local(id));
        }
        if let Some(size) = raw.strip_prefix(STRIPPED_PREFIX)
            && let Ok(original_bytes) = size.parse::<u64>()
        {
            return Ok(Self::Stripped { original_bytes });
        }

        InvalidPayloadSnafu {
            stage: "payload-decode",
            raw: truncate_for_error(raw),
        }
        .fail()
    }

    pub fn inline_len(&self) -> Option<u64> {
        match self {
            Self::Inline(bytes) => Some(bytes.len() as u64),
            Self::Reference(_) | Self::Stripped { .. } => None,
        }
    }

    pub fn reference(&self) -> Option<&ArtifactReference> {
        match self {
            Self::Reference(reference) => Some(reference),
            Self::Inline(_) | Self::Stripped { .. } => None,
        }
    }
}

impl FromStr for Payload {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::decode(raw)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Upsert,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub record_id: RecordId,
    pub operation: SyncOperation,
    pub enqueued_at: u64,
    pub attempts: u32,
    pub next_attempt_at: u64,
    pub last_error: Option<String>,
}

impl SyncQueueEntry {
    pub fn new(record_id: RecordId, operation: SyncOperation, enqueued_at: u64) -> Self {
        Self {
            record_id,
            operation,
            enqueued_at,
            attempts: 0,
            next_attempt_at: enqueued_at,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub remote_id: Option<String>,
    pub last_synced_version: Option<u64>,
    pub last_known_remote_modified: Option<u64>,
}

fn decode_base64(data: &str) -> StorageResult<Payload> {
    let bytes = B64.decode(data).context(DecodeInlinePayloadSnafu {
        stage: "payload-decode-base64",
    })?;
    Ok(Payload::Inline(bytes))
}

fn non_empty_reference(raw: &str, reference: ArtifactReference) -> StorageResult<Payload> {
    if reference.id.is_empty() {
        return InvalidPayloadSnafu {
            stage: "payload-decode-empty-reference",
            raw: raw.to_string(),
        }
        .fail();
    }
    Ok(Payload::Reference(reference))
}

fn truncate_for_error(raw: &str) -> String {
    raw.chars().take(32).collect()
}

fn is_false(value: &bool) -> bool {
    !*value
}
