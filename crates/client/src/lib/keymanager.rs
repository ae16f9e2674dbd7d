//! Keymanager-backed signature provider.
//!
//! Pubkeys and their remote signer URLs live in the database and can change
//! at runtime; signers are deduplicated by URL. Fee recipient, gas limit and
//! graffiti overrides fall back to the configured defaults when unset.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rusqlite::OptionalExtension;
use thiserror::Error;

use vigil_shared::eth_consensus_layer::VoluntaryExit;
use vigil_shared::keymanager_api::{
    DeleteStatus, DeleteStatusMessage, ImportStatus, ImportStatusMessage, RemoteKey,
    SignedVoluntaryExitMessage, ValidatorFeeRecipient, ValidatorGasLimit, ValidatorGraffiti,
};
use vigil_shared::remote_signer::SignableMessage;
use vigil_shared::util::decode_graffiti;

use crate::beacon_chain::BeaconChain;
use crate::config::Config;
use crate::db::{Db, DbError};
use crate::metrics::Metrics;
use crate::multi_beacon_node::MultiBeaconNode;
use crate::remote_signer::{RemoteSigner, SignedMessage, SignerError};

#[derive(Debug, Error)]
pub enum KeymanagerError {
    #[error("pubkey not found: {0}")]
    PubkeyNotFound(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("failed to find validator index for pubkey: {0}")]
    UnknownValidator(String),
    #[error("{0}")]
    Other(String),
}

pub struct Keymanager {
    db: Arc<Db>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    signers: RwLock<HashMap<String, Arc<RemoteSigner>>>,
    fee_recipient_overrides: RwLock<HashMap<String, String>>,
    gas_limit_overrides: RwLock<HashMap<String, String>>,
    graffiti_overrides: RwLock<HashMap<String, String>>,
}

impl Keymanager {
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, KeymanagerError> {
        let keymanager = Keymanager {
            db,
            config,
            metrics,
            signers: RwLock::new(HashMap::new()),
            fee_recipient_overrides: RwLock::new(HashMap::new()),
            gas_limit_overrides: RwLock::new(HashMap::new()),
            graffiti_overrides: RwLock::new(HashMap::new()),
        };
        keymanager.load_overrides()?;
        keymanager.update_signer_mapping()?;
        Ok(keymanager)
    }

    fn load_overrides(&self) -> Result<(), KeymanagerError> {
        let rows: Vec<(String, Option<String>, Option<String>, Option<String>)> =
            self.db.with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT pubkey, fee_recipient, gas_limit, graffiti FROM keymanager_data;",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })?;

        let mut fee_recipients = self.fee_recipient_overrides.write().expect("lock poisoned");
        let mut gas_limits = self.gas_limit_overrides.write().expect("lock poisoned");
        let mut graffiti = self.graffiti_overrides.write().expect("lock poisoned");
        for (pubkey, fee_recipient, gas_limit, graffiti_value) in rows {
            if let Some(value) = fee_recipient {
                fee_recipients.insert(pubkey.clone(), value);
            }
            if let Some(value) = gas_limit {
                gas_limits.insert(pubkey.clone(), value);
            }
            if let Some(value) = graffiti_value {
                graffiti.insert(pubkey, value);
            }
        }
        Ok(())
    }

    /// Rebuild the pubkey-to-signer mapping from the database. Existing
    /// signers are reused when their URL still matches; pubkeys no longer in
    /// the database are dropped.
    fn update_signer_mapping(&self) -> Result<(), KeymanagerError> {
        let rows: Vec<(String, String)> = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT pubkey, url FROM keymanager_data;")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut signers = self.signers.write().expect("lock poisoned");
        let mut signers_by_url: HashMap<String, Arc<RemoteSigner>> = signers
            .values()
            .map(|signer| (signer.url.clone(), Arc::clone(signer)))
            .collect();

        let mut new_mapping = HashMap::new();
        for (pubkey, url) in rows {
            if let Some(existing) = signers.get(&pubkey) {
                if existing.url == url {
                    new_mapping.insert(pubkey, Arc::clone(existing));
                    continue;
                }
            }
            if let Some(shared) = signers_by_url.get(&url) {
                new_mapping.insert(pubkey, Arc::clone(shared));
                continue;
            }
            let signer = Arc::new(RemoteSigner::new(&url, Arc::clone(&self.metrics))?);
            signers_by_url.insert(url, Arc::clone(&signer));
            new_mapping.insert(pubkey, signer);
        }

        *signers = new_mapping;
        Ok(())
    }

    fn signer_for(&self, pubkey: &str) -> Option<Arc<RemoteSigner>> {
        self.signers
            .read()
            .expect("lock poisoned")
            .get(pubkey)
            .cloned()
    }

    // Remote keys

    pub fn list_remote_keys(&self) -> Vec<RemoteKey> {
        self.signers
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(pubkey, signer)| RemoteKey {
                pubkey: pubkey.clone(),
                url: signer.url.clone(),
            })
            .collect()
    }

    pub fn import_remote_keys(
        &self,
        remote_keys: Vec<RemoteKey>,
    ) -> Result<Vec<ImportStatusMessage>, KeymanagerError> {
        let mut statuses = Vec::with_capacity(remote_keys.len());
        for remote_key in remote_keys {
            let result = self.db.with_connection(|conn| {
                conn.execute(
                    "INSERT INTO keymanager_data VALUES (?1, ?2, NULL, NULL, NULL);",
                    [&remote_key.pubkey, &remote_key.url],
                )
            });
            let message = match result {
                Ok(_) => ImportStatusMessage {
                    status: ImportStatus::Imported,
                    message: String::new(),
                },
                Err(DbError::Sqlite(e))
                    if e.sqlite_error_code()
                        == Some(rusqlite::ErrorCode::ConstraintViolation) =>
                {
                    ImportStatusMessage {
                        status: ImportStatus::Duplicate,
                        message: String::new(),
                    }
                }
                Err(e) => ImportStatusMessage {
                    status: ImportStatus::Error,
                    message: e.to_string(),
                },
            };
            statuses.push(message);
        }

        self.update_signer_mapping()?;
        Ok(statuses)
    }

    pub fn delete_remote_keys(
        &self,
        pubkeys: Vec<String>,
    ) -> Result<Vec<DeleteStatusMessage>, KeymanagerError> {
        let mut statuses = Vec::with_capacity(pubkeys.len());
        for pubkey in pubkeys {
            let result = self.db.with_connection(|conn| {
                conn.execute("DELETE FROM keymanager_data WHERE pubkey=?1;", [&pubkey])
            });
            let message = match result {
                Ok(0) => DeleteStatusMessage {
                    status: DeleteStatus::NotFound,
                    message: String::new(),
                },
                Ok(_) => DeleteStatusMessage {
                    status: DeleteStatus::Deleted,
                    message: String::new(),
                },
                Err(e) => DeleteStatusMessage {
                    status: DeleteStatus::Error,
                    message: e.to_string(),
                },
            };
            statuses.push(message);
        }

        self.update_signer_mapping()?;
        Ok(statuses)
    }

    // Fee recipient

    pub fn fee_recipient_override(&self, pubkey: &str) -> Option<String> {
        self.fee_recipient_overrides
            .read()
            .expect("lock poisoned")
            .get(pubkey)
            .cloned()
    }

    pub fn get_fee_recipient(&self, pubkey: &str) -> Result<ValidatorFeeRecipient, KeymanagerError> {
        let row: Option<Option<String>> = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT fee_recipient FROM keymanager_data WHERE pubkey=?1;",
                [pubkey],
                |row| row.get(0),
            )
            .optional()
        })?;
        let stored = row.ok_or_else(|| KeymanagerError::PubkeyNotFound(pubkey.to_owned()))?;
        Ok(ValidatorFeeRecipient {
            pubkey: pubkey.to_owned(),
            ethaddress: stored.unwrap_or_else(|| self.config.fee_recipient.clone()),
        })
    }

    pub fn set_fee_recipient(&self, pubkey: &str, ethaddress: &str) -> Result<(), KeymanagerError> {
        let updated = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE keymanager_data SET fee_recipient=?1 WHERE pubkey=?2;",
                [ethaddress, pubkey],
            )
        })?;
        if updated == 0 {
            return Err(KeymanagerError::PubkeyNotFound(pubkey.to_owned()));
        }
        self.fee_recipient_overrides
            .write()
            .expect("lock poisoned")
            .insert(pubkey.to_owned(), ethaddress.to_owned());
        Ok(())
    }

    pub fn delete_configured_fee_recipient(&self, pubkey: &str) -> Result<(), KeymanagerError> {
        let updated = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE keymanager_data SET fee_recipient=NULL WHERE pubkey=?1;",
                [pubkey],
            )
        })?;
        if updated == 0 {
            return Err(KeymanagerError::PubkeyNotFound(pubkey.to_owned()));
        }
        self.fee_recipient_overrides
            .write()
            .expect("lock poisoned")
            .remove(pubkey);
        Ok(())
    }

    // Gas limit

    pub fn gas_limit_override(&self, pubkey: &str) -> Option<String> {
        self.gas_limit_overrides
            .read()
            .expect("lock poisoned")
            .get(pubkey)
            .cloned()
    }

    pub fn get_gas_limit(&self, pubkey: &str) -> Result<ValidatorGasLimit, KeymanagerError> {
        let row: Option<Option<String>> = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT gas_limit FROM keymanager_data WHERE pubkey=?1;",
                [pubkey],
                |row| row.get(0),
            )
            .optional()
        })?;
        let stored = row.ok_or_else(|| KeymanagerError::PubkeyNotFound(pubkey.to_owned()))?;
        Ok(ValidatorGasLimit {
            pubkey: pubkey.to_owned(),
            gas_limit: stored.unwrap_or_else(|| self.config.gas_limit.to_string()),
        })
    }

    pub fn set_gas_limit(&self, pubkey: &str, gas_limit: &str) -> Result<(), KeymanagerError> {
        let updated = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE keymanager_data SET gas_limit=?1 WHERE pubkey=?2;",
                [gas_limit, pubkey],
            )
        })?;
        if updated == 0 {
            return Err(KeymanagerError::PubkeyNotFound(pubkey.to_owned()));
        }
        self.gas_limit_overrides
            .write()
            .expect("lock poisoned")
            .insert(pubkey.to_owned(), gas_limit.to_owned());
        Ok(())
    }

    pub fn delete_configured_gas_limit(&self, pubkey: &str) -> Result<(), KeymanagerError> {
        let updated = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE keymanager_data SET gas_limit=NULL WHERE pubkey=?1;",
                [pubkey],
            )
        })?;
        if updated == 0 {
            return Err(KeymanagerError::PubkeyNotFound(pubkey.to_owned()));
        }
        self.gas_limit_overrides
            .write()
            .expect("lock poisoned")
            .remove(pubkey);
        Ok(())
    }

    // Graffiti

    pub fn graffiti_override(&self, pubkey: &str) -> Option<String> {
        self.graffiti_overrides
            .read()
            .expect("lock poisoned")
            .get(pubkey)
            .cloned()
    }

    pub fn get_graffiti(&self, pubkey: &str) -> Result<ValidatorGraffiti, KeymanagerError> {
        let row: Option<Option<String>> = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT graffiti FROM keymanager_data WHERE pubkey=?1;",
                [pubkey],
                |row| row.get(0),
            )
            .optional()
        })?;
        let stored = row.ok_or_else(|| KeymanagerError::PubkeyNotFound(pubkey.to_owned()))?;
        Ok(ValidatorGraffiti {
            pubkey: pubkey.to_owned(),
            graffiti: stored.unwrap_or_else(|| decode_graffiti(&self.config.graffiti)),
        })
    }

    pub fn set_graffiti(&self, pubkey: &str, graffiti: &str) -> Result<(), KeymanagerError> {
        let updated = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE keymanager_data SET graffiti=?1 WHERE pubkey=?2;",
                [graffiti, pubkey],
            )
        })?;
        if updated == 0 {
            return Err(KeymanagerError::PubkeyNotFound(pubkey.to_owned()));
        }
        self.graffiti_overrides
            .write()
            .expect("lock poisoned")
            .insert(pubkey.to_owned(), graffiti.to_owned());
        Ok(())
    }

    pub fn delete_configured_graffiti(&self, pubkey: &str) -> Result<(), KeymanagerError> {
        let updated = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE keymanager_data SET graffiti=NULL WHERE pubkey=?1;",
                [pubkey],
            )
        })?;
        if updated == 0 {
            return Err(KeymanagerError::PubkeyNotFound(pubkey.to_owned()));
        }
        self.graffiti_overrides
            .write()
            .expect("lock poisoned")
            .remove(pubkey);
        Ok(())
    }

    // Signing

    pub fn get_public_keys(&self) -> Result<Vec<String>, KeymanagerError> {
        let pubkeys = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT pubkey FROM keymanager_data;")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(pubkeys)
    }

    pub async fn sign(
        &self,
        message: SignableMessage,
        identifier: &str,
    ) -> Result<SignedMessage, KeymanagerError> {
        // A key may have been deleted while a duty for it was already
        // scheduled; the duty's signature request then fails here.
        let signer = self
            .signer_for(identifier)
            .ok_or_else(|| KeymanagerError::PubkeyNotFound(identifier.to_owned()))?;
        Ok(signer.sign(message, identifier).await?)
    }

    /// Batch signing grouped by signer; messages whose pubkey has no signer
    /// are skipped with a warning.
    pub async fn sign_in_batches(
        &self,
        messages: Vec<SignableMessage>,
        identifiers: Vec<String>,
    ) -> Result<Vec<SignedMessage>, KeymanagerError> {
        let mut per_signer: HashMap<String, (Arc<RemoteSigner>, Vec<SignableMessage>, Vec<String>)> =
            HashMap::new();
        for (message, identifier) in messages.into_iter().zip(identifiers) {
            let Some(signer) = self.signer_for(&identifier) else {
                tracing::warn!("No signer found for {identifier} - not signing message");
                continue;
            };
            let entry = per_signer
                .entry(signer.url.clone())
                .or_insert_with(|| (signer, Vec::new(), Vec::new()));
            entry.1.push(message);
            entry.2.push(identifier);
        }

        let mut signed = Vec::new();
        for (_, (signer, messages, identifiers)) in per_signer {
            signed.extend(signer.sign_in_batches(messages, identifiers).await?);
        }
        Ok(signed)
    }

    /// Sign a voluntary exit for a managed validator. Defaults to the
    /// current epoch when none is given, per the Keymanager API spec.
    pub async fn sign_voluntary_exit(
        &self,
        pubkey: &str,
        epoch: Option<u64>,
        beacon_chain: &BeaconChain,
        multi_beacon_node: &MultiBeaconNode,
    ) -> Result<SignedVoluntaryExitMessage, KeymanagerError> {
        let validators = multi_beacon_node
            .get_validators(vec![pubkey.to_owned()], Vec::new())
            .await
            .map_err(|e| KeymanagerError::Other(e.to_string()))?;
        let validator_index = validators
            .first()
            .ok_or_else(|| KeymanagerError::UnknownValidator(pubkey.to_owned()))?
            .index;

        let epoch = epoch.unwrap_or_else(|| beacon_chain.current_epoch());
        let fork_info = beacon_chain
            .fork_info(beacon_chain.spec.start_slot_of_epoch(epoch))
            .map_err(|e| KeymanagerError::Other(e.to_string()))?;

        let voluntary_exit = VoluntaryExit {
            epoch,
            validator_index,
        };
        let (_, signature, _) = self
            .sign(
                SignableMessage::VoluntaryExit {
                    fork_info,
                    voluntary_exit: voluntary_exit.clone(),
                },
                pubkey,
            )
            .await?;

        Ok(SignedVoluntaryExitMessage {
            message: voluntary_exit,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::networks::Network;

    fn test_keymanager() -> Keymanager {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.run_migrations().unwrap();
        let config = Arc::new(
            ConfigBuilder::new(
                Network::Mainnet,
                vec!["http://localhost:5052".into()],
                format!("0x{}", "ab".repeat(20)),
            )
            .graffiti("vigil".into())
            .enable_keymanager(true)
            .build()
            .unwrap(),
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        Keymanager::new(db, config, metrics).unwrap()
    }

    fn test_pubkey() -> String {
        format!("0x{}", "aa".repeat(48))
    }

    #[test]
    fn import_then_duplicate() {
        let keymanager = test_keymanager();
        let key = RemoteKey {
            pubkey: test_pubkey(),
            url: "http://signer:9000".into(),
        };

        let statuses = keymanager.import_remote_keys(vec![key.clone()]).unwrap();
        assert_eq!(statuses[0].status, ImportStatus::Imported);

        let statuses = keymanager.import_remote_keys(vec![key]).unwrap();
        assert_eq!(statuses[0].status, ImportStatus::Duplicate);

        let listed = keymanager.list_remote_keys();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pubkey, test_pubkey());
    }

    #[test]
    fn fee_recipient_lifecycle() {
        let keymanager = test_keymanager();
        let pubkey = test_pubkey();
        keymanager
            .import_remote_keys(vec![RemoteKey {
                pubkey: pubkey.clone(),
                url: "http://signer:9000".into(),
            }])
            .unwrap();

        // Unset: falls back to the configured default.
        let initial = keymanager.get_fee_recipient(&pubkey).unwrap();
        assert_eq!(initial.ethaddress, format!("0x{}", "ab".repeat(20)));

        let address = format!("0x{}", "aa".repeat(20));
        keymanager.set_fee_recipient(&pubkey, &address).unwrap();
        assert_eq!(
            keymanager.get_fee_recipient(&pubkey).unwrap().ethaddress,
            address
        );
        assert_eq!(keymanager.fee_recipient_override(&pubkey), Some(address));

        keymanager.delete_configured_fee_recipient(&pubkey).unwrap();
        assert_eq!(
            keymanager.get_fee_recipient(&pubkey).unwrap().ethaddress,
            format!("0x{}", "ab".repeat(20))
        );
        assert_eq!(keymanager.fee_recipient_override(&pubkey), None);
    }

    #[test]
    fn unknown_pubkey_is_rejected() {
        let keymanager = test_keymanager();
        let pubkey = test_pubkey();
        assert!(matches!(
            keymanager.get_fee_recipient(&pubkey),
            Err(KeymanagerError::PubkeyNotFound(_))
        ));
        assert!(matches!(
            keymanager.set_fee_recipient(&pubkey, "0xaa"),
            Err(KeymanagerError::PubkeyNotFound(_))
        ));
        assert!(matches!(
            keymanager.set_gas_limit(&pubkey, "1000000"),
            Err(KeymanagerError::PubkeyNotFound(_))
        ));
        assert!(matches!(
            keymanager.set_graffiti(&pubkey, "hello"),
            Err(KeymanagerError::PubkeyNotFound(_))
        ));
    }

    #[test]
    fn delete_remote_keys_reports_not_found() {
        let keymanager = test_keymanager();
        let statuses = keymanager.delete_remote_keys(vec![test_pubkey()]).unwrap();
        assert_eq!(statuses[0].status, DeleteStatus::NotFound);

        keymanager
            .import_remote_keys(vec![RemoteKey {
                pubkey: test_pubkey(),
                url: "http://signer:9000".into(),
            }])
            .unwrap();
        let statuses = keymanager.delete_remote_keys(vec![test_pubkey()]).unwrap();
        assert_eq!(statuses[0].status, DeleteStatus::Deleted);
        assert!(keymanager.list_remote_keys().is_empty());
    }

    #[test]
    fn graffiti_falls_back_to_configured_default() {
        let keymanager = test_keymanager();
        let pubkey = test_pubkey();
        keymanager
            .import_remote_keys(vec![RemoteKey {
                pubkey: pubkey.clone(),
                url: "http://signer:9000".into(),
            }])
            .unwrap();

        assert_eq!(keymanager.get_graffiti(&pubkey).unwrap().graffiti, "vigil");
        keymanager.set_graffiti(&pubkey, "custom").unwrap();
        assert_eq!(keymanager.get_graffiti(&pubkey).unwrap().graffiti, "custom");
        keymanager.delete_configured_graffiti(&pubkey).unwrap();
        assert_eq!(keymanager.get_graffiti(&pubkey).unwrap().graffiti, "vigil");
    }

    #[test]
    fn signers_are_deduplicated_by_url() {
        let keymanager = test_keymanager();
        let other_pubkey = format!("0x{}", "bb".repeat(48));
        keymanager
            .import_remote_keys(vec![
                RemoteKey {
                    pubkey: test_pubkey(),
                    url: "http://signer:9000".into(),
                },
                RemoteKey {
                    pubkey: other_pubkey.clone(),
                    url: "http://signer:9000".into(),
                },
            ])
            .unwrap();

        let signers = keymanager.signers.read().unwrap();
        let first = signers.get(&test_pubkey()).unwrap();
        let second = signers.get(&other_pubkey).unwrap();
        assert!(Arc::ptr_eq(first, second));
    }
}
