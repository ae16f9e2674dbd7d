//! The signing backend used by the duty services: either a single remote
//! signer configured at startup, or the keymanager's dynamic signer set.

use std::sync::Arc;

use vigil_shared::remote_signer::SignableMessage;

use crate::keymanager::{Keymanager, KeymanagerError};
use crate::remote_signer::{RemoteSigner, SignedMessage, SignerError};

pub enum SignatureProvider {
    RemoteSigner(Arc<RemoteSigner>),
    Keymanager(Arc<Keymanager>),
}

impl SignatureProvider {
    pub async fn sign(
        &self,
        message: SignableMessage,
        identifier: &str,
    ) -> Result<SignedMessage, SignerError> {
        match self {
            SignatureProvider::RemoteSigner(signer) => signer.sign(message, identifier).await,
            SignatureProvider::Keymanager(keymanager) => {
                keymanager.sign(message, identifier).await.map_err(|e| match e {
                    KeymanagerError::PubkeyNotFound(pubkey) => SignerError::PubkeyNotFound(pubkey),
                    KeymanagerError::Signer(e) => e,
                    other => SignerError::Worker(other.to_string()),
                })
            }
        }
    }

    /// Returns the successfully signed subset; individual failures are
    /// logged and counted, never aborting the batch.
    pub async fn sign_in_batches(
        &self,
        messages: Vec<SignableMessage>,
        identifiers: Vec<String>,
    ) -> Result<Vec<SignedMessage>, SignerError> {
        match self {
            SignatureProvider::RemoteSigner(signer) => {
                signer.sign_in_batches(messages, identifiers).await
            }
            SignatureProvider::Keymanager(keymanager) => keymanager
                .sign_in_batches(messages, identifiers)
                .await
                .map_err(|e| SignerError::Worker(e.to_string())),
        }
    }

    pub async fn get_public_keys(&self) -> Result<Vec<String>, SignerError> {
        match self {
            SignatureProvider::RemoteSigner(signer) => signer.get_public_keys().await,
            SignatureProvider::Keymanager(keymanager) => keymanager
                .get_public_keys()
                .map_err(|e| SignerError::Worker(e.to_string())),
        }
    }

    pub fn keymanager(&self) -> Option<&Arc<Keymanager>> {
        match self {
            SignatureProvider::Keymanager(keymanager) => Some(keymanager),
            SignatureProvider::RemoteSigner(_) => None,
        }
    }

    /// Keymanager-provided fee recipient override, if any.
    pub fn fee_recipient_override(&self, pubkey: &str) -> Option<String> {
        self.keymanager()
            .and_then(|keymanager| keymanager.fee_recipient_override(pubkey))
    }

    pub fn gas_limit_override(&self, pubkey: &str) -> Option<String> {
        self.keymanager()
            .and_then(|keymanager| keymanager.gas_limit_override(pubkey))
    }

    pub fn graffiti_override(&self, pubkey: &str) -> Option<String> {
        self.keymanager()
            .and_then(|keymanager| keymanager.graffiti_override(pubkey))
    }
}
