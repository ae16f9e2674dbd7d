//! End-to-end keymanager lifecycle against an on-disk database.

use std::sync::Arc;

use vigil_client::config::ConfigBuilder;
use vigil_client::db::Db;
use vigil_client::keymanager::{Keymanager, KeymanagerError};
use vigil_client::metrics::Metrics;
use vigil_client::networks::Network;
use vigil_shared::keymanager_api::{DeleteStatus, ImportStatus, RemoteKey};

fn pubkey(byte: u8) -> String {
    format!("0x{}", hex_byte_repeat(byte, 48))
}

fn hex_byte_repeat(byte: u8, count: usize) -> String {
    format!("{byte:02x}").repeat(count)
}

fn open_keymanager(data_dir: &std::path::Path) -> Keymanager {
    let db = Arc::new(Db::open(data_dir).expect("open database"));
    db.run_migrations().expect("run migrations");
    let config = Arc::new(
        ConfigBuilder::new(
            Network::Mainnet,
            vec!["http://localhost:5052".into()],
            format!("0x{}", hex_byte_repeat(0xab, 20)),
        )
        .graffiti("vigil".into())
        .enable_keymanager(true)
        .build()
        .expect("valid config"),
    );
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    Keymanager::new(db, config, metrics).expect("keymanager")
}

#[test]
fn remote_key_and_fee_recipient_lifecycle_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let keymanager = open_keymanager(dir.path());

        let statuses = keymanager
            .import_remote_keys(vec![RemoteKey {
                pubkey: pubkey(0xaa),
                url: "http://signer-a:9000".into(),
            }])
            .unwrap();
        assert_eq!(statuses[0].status, ImportStatus::Imported);

        let statuses = keymanager
            .import_remote_keys(vec![RemoteKey {
                pubkey: pubkey(0xaa),
                url: "http://signer-a:9000".into(),
            }])
            .unwrap();
        assert_eq!(statuses[0].status, ImportStatus::Duplicate);

        let fee_recipient = format!("0x{}", hex_byte_repeat(0xaa, 20));
        keymanager
            .set_fee_recipient(&pubkey(0xaa), &fee_recipient)
            .unwrap();
        assert_eq!(
            keymanager.get_fee_recipient(&pubkey(0xaa)).unwrap().ethaddress,
            fee_recipient
        );
    }

    // A fresh process sees the persisted key and its override.
    {
        let keymanager = open_keymanager(dir.path());
        let keys = keymanager.get_public_keys().unwrap();
        assert_eq!(keys, vec![pubkey(0xaa)]);
        assert_eq!(
            keymanager.get_fee_recipient(&pubkey(0xaa)).unwrap().ethaddress,
            format!("0x{}", hex_byte_repeat(0xaa, 20))
        );

        keymanager
            .delete_configured_fee_recipient(&pubkey(0xaa))
            .unwrap();
        // Back to the configured default.
        assert_eq!(
            keymanager.get_fee_recipient(&pubkey(0xaa)).unwrap().ethaddress,
            format!("0x{}", hex_byte_repeat(0xab, 20))
        );

        let statuses = keymanager.delete_remote_keys(vec![pubkey(0xaa)]).unwrap();
        assert_eq!(statuses[0].status, DeleteStatus::Deleted);
        assert!(matches!(
            keymanager.get_fee_recipient(&pubkey(0xaa)),
            Err(KeymanagerError::PubkeyNotFound(_))
        ));
    }
}

#[test]
fn unknown_pubkey_mutations_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let keymanager = open_keymanager(dir.path());

    assert!(matches!(
        keymanager.set_fee_recipient(&pubkey(0xbb), "0x00"),
        Err(KeymanagerError::PubkeyNotFound(_))
    ));
    let statuses = keymanager.delete_remote_keys(vec![pubkey(0xbb)]).unwrap();
    assert_eq!(statuses[0].status, DeleteStatus::NotFound);
}
