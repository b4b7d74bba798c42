//! Core data model: records, categories, vault metadata, sync digests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::VaultResult;

/// Current vault document version.
pub const DOCUMENT_VERSION: u32 = 1;

/// Returns the current time as epoch seconds.
#[must_use]
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current time as an ISO-8601 UTC string.
#[must_use]
pub fn now_iso8601() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// =============================================================================
// Records
// =============================================================================

/// Classification of a vault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Standard login credentials.
    #[default]
    Password,
    /// Encrypted text note.
    SecureNote,
    /// Credit card information.
    CreditCard,
    /// Personal identity documents.
    Identity,
    /// WiFi network credentials.
    Wifi,
    /// Server or SSH credentials.
    Server,
    /// API keys and tokens.
    ApiKey,
    /// Database connections.
    Database,
    /// Cryptocurrency wallet info.
    CryptoWallet,
}

/// A single vault record.
///
/// The field set is open: well-known fields are typed, anything else
/// goes into `custom_fields`. The sync engine treats records as opaque
/// except for `id`, `modified`, and the canonical byte serialization
/// used for hashing.
///
/// # Canonical serialization
///
/// [`Record::canonical_bytes`] is the JSON serialization of this
/// struct. Field order is fixed by the struct declaration and
/// `custom_fields` is a `BTreeMap`, so two peers holding equal field
/// values always produce identical bytes, which digest stability
/// across a sync depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// RFC-4122 v4 UUID in its 36-character string form.
    pub id: String,
    /// Record classification.
    #[serde(rename = "type", default)]
    pub kind: RecordKind,
    /// Display name.
    #[serde(default)]
    pub title: String,
    /// Username or login.
    #[serde(default)]
    pub username: String,
    /// The secret itself.
    #[serde(default)]
    pub password: String,
    /// Email, when different from the username.
    #[serde(default)]
    pub email: String,
    /// Website URL.
    #[serde(default)]
    pub url: String,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    /// TOTP seed for 2FA codes.
    #[serde(default)]
    pub totp_secret: String,
    /// Organizational tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Owning category id, empty when uncategorized.
    #[serde(default)]
    pub category_id: String,
    /// Pinned by the user.
    #[serde(default)]
    pub favorite: bool,
    /// Open field set: security questions, PINs, recovery codes, …
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    /// Creation time, epoch seconds.
    #[serde(default)]
    pub created_at: i64,
    /// Last modification time, epoch seconds. Monotonically
    /// nondecreasing on local edits.
    #[serde(default)]
    pub modified: i64,
}

impl Record {
    /// Creates a record with a fresh UUID and current timestamps.
    #[must_use]
    pub fn new<S: Into<String>>(title: S) -> Self {
        let now = now_epoch();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: RecordKind::default(),
            title: title.into(),
            username: String::new(),
            password: String::new(),
            email: String::new(),
            url: String::new(),
            notes: String::new(),
            totp_secret: String::new(),
            tags: Vec::new(),
            category_id: String::new(),
            favorite: false,
            custom_fields: BTreeMap::new(),
            created_at: now,
            modified: now,
        }
    }

    /// Bumps `modified` to the current time, never moving it backwards.
    pub fn touch(&mut self) {
        self.modified = self.modified.max(now_epoch());
    }

    /// Sets a custom field, replacing any previous value.
    pub fn set_custom_field<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.custom_fields.insert(key.into(), value.into());
    }

    /// Returns a custom field value, if present.
    #[must_use]
    pub fn custom_field(&self, key: &str) -> Option<&str> {
        self.custom_fields.get(key).map(String::as_str)
    }

    /// Serializes the record to its canonical byte form for hashing.
    pub fn canonical_bytes(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| crate::error::VaultError::invalid_format(format!("record encoding: {e}")))
    }

    /// Computes the sync digest for this record.
    pub fn digest(&self) -> VaultResult<EntryDigest> {
        Ok(EntryDigest {
            id: self.id.clone(),
            modified: self.modified,
            hash: crypto::sha256_hex(&self.canonical_bytes()?),
        })
    }

    /// Case-insensitive substring match against title, username, and URL.
    #[must_use]
    pub fn matches_query(&self, lowered_query: &str) -> bool {
        self.title.to_lowercase().contains(lowered_query)
            || self.username.to_lowercase().contains(lowered_query)
            || self.url.to_lowercase().contains(lowered_query)
    }
}

// =============================================================================
// Categories
// =============================================================================

/// A display category for organizing records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// RFC-4122 v4 UUID in its string form.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Icon identifier.
    #[serde(default)]
    pub icon: String,
    /// Display color.
    #[serde(default)]
    pub color: String,
    /// Sort position within the category list.
    #[serde(default)]
    pub sort_order: u32,
}

impl Category {
    /// Creates a category with a fresh UUID.
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            icon: String::new(),
            color: String::new(),
            sort_order: 0,
        }
    }
}

// =============================================================================
// Vault document
// =============================================================================

/// Metadata block stored alongside the record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMetadata {
    /// Document format version.
    pub version: u32,
    /// Creation time, ISO-8601.
    pub created_at: String,
    /// Last save time, ISO-8601.
    pub modified_at: String,
    /// Number of records; always equals the entry list length.
    pub entry_count: u32,
}

impl VaultMetadata {
    /// Creates metadata for a new empty vault.
    #[must_use]
    pub fn new() -> Self {
        let now = now_iso8601();
        Self {
            version: DOCUMENT_VERSION,
            created_at: now.clone(),
            modified_at: now,
            entry_count: 0,
        }
    }
}

impl Default for VaultMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// The decrypted vault payload: metadata, records, and categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDocument {
    /// The metadata block.
    pub metadata: VaultMetadata,
    /// Records in insertion (display) order.
    pub entries: Vec<Record>,
    /// Categories in insertion order.
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl VaultDocument {
    /// Creates an empty vault document.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            metadata: VaultMetadata::new(),
            entries: Vec::new(),
            categories: Vec::new(),
        }
    }
}

// =============================================================================
// Sync types
// =============================================================================

/// Content digest of one record, exchanged during a sync.
///
/// Digests are ephemeral; they exist only for the duration of a sync
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDigest {
    /// Record id.
    pub id: String,
    /// Record modification time, epoch seconds.
    pub modified: i64,
    /// Hex-encoded SHA-256 of the record's canonical serialization.
    pub hash: String,
}

/// A peer device observed through discovery.
///
/// Peers are deduplicated by `id`; the most recently observed announce
/// replaces earlier state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Device id from the announce packet.
    pub id: String,
    /// Human-readable device name.
    pub name: String,
    /// Observed source address of the announce.
    pub ip: String,
    /// Port the device is reachable on.
    pub port: u16,
    /// Identifier of the vault the device is announcing.
    pub vault_id: String,
    /// Device's last vault modification time, ISO-8601.
    pub last_modified: String,
    /// Reserved for future key-pinning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}
