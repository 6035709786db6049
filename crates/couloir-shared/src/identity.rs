//! Local and remote identities.
//!
//! An identity is created once at account bootstrap and immutable after:
//! a user id, a display name, and a static X25519 key pair. The public key
//! is shared freely (signaling, invites, QR-style payloads); the private
//! key only ever exists outside memory as an [`EncryptedField`] sealed
//! under the passphrase-derived storage key.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, EncryptedField, KeyPair, PublicKey, SymmetricKey};
use crate::error::IdentityError;
use crate::types::UserId;

/// The local identity, private key in memory.
pub struct Identity {
    user_id: UserId,
    display_name: String,
    keypair: KeyPair,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("keypair", &"<redacted>")
            .finish()
    }
}

/// A counterpart identity: everything except the private key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: PublicKey,
}

/// At-rest form of [`Identity`]; the secret key is a sealed field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: PublicKey,
    pub secret_key: EncryptedField,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>, keypair: KeyPair) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            keypair,
        }
    }

    /// Generate a fresh identity (account bootstrap path).
    pub fn generate(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self::new(user_id, display_name, KeyPair::generate_static())
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Export for persistence, private key sealed under the storage key.
    pub fn export_sealed(&self, storage_key: &SymmetricKey) -> Result<SealedIdentity, IdentityError> {
        let secret = self.keypair.secret_bytes();
        let sealed = crypto::seal_field(storage_key, &secret)?;

        Ok(SealedIdentity {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            public_key: self.keypair.public(),
            secret_key: sealed,
        })
    }

    /// Restore from the sealed at-rest form.
    ///
    /// The reconstructed key pair must reproduce the stored public key;
    /// a mismatch means the record was corrupted or reassembled wrong.
    pub fn import_sealed(
        storage_key: &SymmetricKey,
        sealed: &SealedIdentity,
    ) -> Result<Self, IdentityError> {
        let secret = crypto::open_field(storage_key, &sealed.secret_key)?;
        let bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;

        let keypair = KeyPair::from_secret_bytes(&bytes);
        if keypair.public() != sealed.public_key {
            return Err(IdentityError::KeyMismatch);
        }

        Ok(Self {
            user_id: sealed.user_id.clone(),
            display_name: sealed.display_name.clone(),
            keypair,
        })
    }

    /// The public view counterparts see.
    pub fn to_remote(&self) -> RemoteIdentity {
        RemoteIdentity {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            public_key: self.keypair.public(),
        }
    }
}
