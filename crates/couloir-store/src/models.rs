//! Persisted domain models and their typed collection helpers.
//!
//! Three collections exist: rooms (replaced whole on every write), invites
//! (ephemeral, consumed on accept or decline), and messages (routing
//! fields and body sealed per-field under the storage key). Acks are
//! wire-only and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use couloir_shared::crypto::{self, EncryptedField, PublicKey, SymmetricKey};
use couloir_shared::types::{Room, RoomId, RoomKind, UserId};
use couloir_shared::CryptoError;

use crate::error::Result;
use crate::store::RecordStore;

pub const COLLECTION_ROOMS: &str = "rooms";
pub const COLLECTION_INVITES: &str = "invites";
pub const COLLECTION_MESSAGES: &str = "messages";

// ---------------------------------------------------------------------------
// Invite
// ---------------------------------------------------------------------------

/// A pending invite, created when an invite envelope arrives and deleted
/// once the user accepts or declines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub id: String,
    pub from_user_id: UserId,
    pub display_name: String,
    pub kind: RoomKind,
    pub from_pubkey: PublicKey,
}

impl Invite {
    pub fn new(
        from_user_id: UserId,
        display_name: impl Into<String>,
        kind: RoomKind,
        from_pubkey: PublicKey,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_user_id,
            display_name: display_name.into(),
            kind,
            from_pubkey,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One message at rest. Room id, sender id, and body are sealed as
/// independent fields so a decrypt failure on one leaves the others
/// readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub room_id: EncryptedField,
    pub sender_id: EncryptedField,
    #[serde(rename = "bodyCiphertext")]
    pub body: EncryptedField,
    pub read: bool,
    pub delivered: bool,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    /// Seal a plaintext message for persistence.
    pub fn seal(
        key: &SymmetricKey,
        room_id: &RoomId,
        sender_id: &UserId,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> std::result::Result<Self, CryptoError> {
        Ok(Self {
            room_id: crypto::seal_field(key, room_id.to_string().as_bytes())?,
            sender_id: crypto::seal_field(key, sender_id.as_str().as_bytes())?,
            body: crypto::seal_field(key, body.as_bytes())?,
            read: false,
            delivered: false,
            timestamp,
        })
    }

    pub fn open_room_id(&self, key: &SymmetricKey) -> std::result::Result<String, CryptoError> {
        open_string(key, &self.room_id)
    }

    pub fn open_sender_id(&self, key: &SymmetricKey) -> std::result::Result<String, CryptoError> {
        open_string(key, &self.sender_id)
    }

    pub fn open_body(&self, key: &SymmetricKey) -> std::result::Result<String, CryptoError> {
        open_string(key, &self.body)
    }
}

fn open_string(
    key: &SymmetricKey,
    field: &EncryptedField,
) -> std::result::Result<String, CryptoError> {
    let bytes = crypto::open_field(key, field)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::MalformedInput)
}

// ---------------------------------------------------------------------------
// Typed collection helpers
// ---------------------------------------------------------------------------

/// Store a room, replacing any previous version whole.
pub fn save_room(store: &dyn RecordStore, room: &Room) -> Result<()> {
    let value = serde_json::to_value(room)?;
    store.put(COLLECTION_ROOMS, &value, Some(&room.id.to_string()))?;
    Ok(())
}

pub fn load_rooms(store: &dyn RecordStore) -> Result<Vec<Room>> {
    store
        .get_all(COLLECTION_ROOMS)?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(Into::into))
        .collect()
}

pub fn delete_room(store: &dyn RecordStore, id: &RoomId) -> Result<()> {
    store.delete(COLLECTION_ROOMS, &id.to_string())
}

pub fn save_invite(store: &dyn RecordStore, invite: &Invite) -> Result<()> {
    let value = serde_json::to_value(invite)?;
    store.put(COLLECTION_INVITES, &value, Some(&invite.id))?;
    Ok(())
}

pub fn load_invites(store: &dyn RecordStore) -> Result<Vec<Invite>> {
    store
        .get_all(COLLECTION_INVITES)?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(Into::into))
        .collect()
}

/// Fetch and delete an invite in one step: invites are consumed on accept
/// or decline.
pub fn take_invite(store: &dyn RecordStore, id: &str) -> Result<Option<Invite>> {
    let Some(value) = store.get(COLLECTION_INVITES, id)? else {
        return Ok(None);
    };
    let invite = serde_json::from_value(value)?;
    store.delete(COLLECTION_INVITES, id)?;
    Ok(Some(invite))
}

/// Persist a sealed message under a generated key. Returns the key.
pub fn save_message(store: &dyn RecordStore, message: &StoredMessage) -> Result<String> {
    let value = serde_json::to_value(message)?;
    store.put(COLLECTION_MESSAGES, &value, None)
}

pub fn load_messages(store: &dyn RecordStore) -> Result<Vec<StoredMessage>> {
    store
        .get_all(COLLECTION_MESSAGES)?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use couloir_shared::crypto::{derive_storage_key, KeyPair};
    use couloir_shared::types::PeerEntry;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_at(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn sample_room(name: &str) -> Room {
        Room {
            id: RoomId::new(),
            name: name.to_string(),
            kind: RoomKind::Single,
            members: vec![PeerEntry {
                id: UserId::from("u2"),
                username: "bob".to_string(),
                pubkey: KeyPair::generate_static().public(),
            }],
        }
    }

    #[test]
    fn test_room_replaced_whole() {
        let (_dir, store) = open_temp();

        let mut room = sample_room("before");
        save_room(&store, &room).unwrap();

        room.name = "after".to_string();
        room.members.clear();
        save_room(&store, &room).unwrap();

        let rooms = load_rooms(&store).unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "after");
        assert!(rooms[0].members.is_empty());

        delete_room(&store, &room.id).unwrap();
        assert!(load_rooms(&store).unwrap().is_empty());
    }

    #[test]
    fn test_invite_consumed_on_take() {
        let (_dir, store) = open_temp();

        let invite = Invite::new(
            UserId::from("u2"),
            "bob",
            RoomKind::Single,
            KeyPair::generate_static().public(),
        );
        save_invite(&store, &invite).unwrap();
        assert_eq!(load_invites(&store).unwrap().len(), 1);

        let taken = take_invite(&store, &invite.id).unwrap().unwrap();
        assert_eq!(taken, invite);

        // Consumed: a second take finds nothing.
        assert!(take_invite(&store, &invite.id).unwrap().is_none());
        assert!(load_invites(&store).unwrap().is_empty());
    }

    #[test]
    fn test_message_roundtrip_through_store() {
        let (_dir, store) = open_temp();
        let key = derive_storage_key(b"passphrase");

        let room_id = RoomId::new();
        let sealed = StoredMessage::seal(
            &key,
            &room_id,
            &UserId::from("u2"),
            "the corridor is clear",
            Utc::now(),
        )
        .unwrap();

        save_message(&store, &sealed).unwrap();

        let loaded = load_messages(&store).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].open_room_id(&key).unwrap(), room_id.to_string());
        assert_eq!(loaded[0].open_sender_id(&key).unwrap(), "u2");
        assert_eq!(loaded[0].open_body(&key).unwrap(), "the corridor is clear");
        assert!(!loaded[0].read);
        assert!(!loaded[0].delivered);
    }

    #[test]
    fn test_corrupted_field_leaves_others_readable() {
        let key = derive_storage_key(b"passphrase");
        let mut message = StoredMessage::seal(
            &key,
            &RoomId::new(),
            &UserId::from("u2"),
            "still readable",
            Utc::now(),
        )
        .unwrap();

        message.sender_id.ciphertext[0] ^= 0xFF;

        // One bad field surfaces its own failure; the rest of the record
        // stays usable.
        assert_eq!(
            message.open_sender_id(&key),
            Err(CryptoError::AuthenticationFailed)
        );
        assert_eq!(message.open_body(&key).unwrap(), "still readable");
        assert!(message.open_room_id(&key).is_ok());
    }

    #[test]
    fn test_no_plaintext_crosses_the_boundary() {
        let (_dir, store) = open_temp();
        let key = derive_storage_key(b"passphrase");

        let sealed = StoredMessage::seal(
            &key,
            &RoomId::new(),
            &UserId::from("u2"),
            "tres secret",
            Utc::now(),
        )
        .unwrap();
        let record_key = save_message(&store, &sealed).unwrap();

        let raw = store
            .get(COLLECTION_MESSAGES, &record_key)
            .unwrap()
            .unwrap()
            .to_string();
        assert!(!raw.contains("tres secret"));
    }
}
