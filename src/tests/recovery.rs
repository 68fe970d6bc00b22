use serde_json::{json, Value};

use super::{key, open_read, open_write, with_temp_db};
use crate::ErrorKind;

#[tokio::test]
async fn reopen_after_commit_is_idle() {
    with_temp_db(|path| async move {
        let k = key(0, 1);
        let db = open_write(&path).await;
        let tx = db.begin().await.expect("begin should not fail");
        tx.add(k, br#"{"v":1}"#).await.expect("add should not fail");
        tx.commit().await.expect("commit should not fail");
        // The handle is dropped without close, as a crash would leave it.
        drop(db);

        let db = open_write(&path).await;
        assert!(db.active_transaction().await.is_none());
        let out: Value = db.get(k).await.expect("get should not fail");
        assert_eq!(out, json!({"v": 1}));
        db.close().await;
    })
    .await;
}

#[tokio::test]
async fn recovers_a_bare_opening_prefix() {
    with_temp_db(|path| async move {
        let db = open_write(&path).await;
        db.begin().await.expect("begin should not fail");
        drop(db);

        let db = open_write(&path).await;
        let tx = db
            .active_transaction()
            .await
            .expect("the opening prefix should recover as an active transaction");
        let status = tx.status().await;
        assert_eq!(status.rows, 0);
        assert_eq!(status.savepoints, 0);

        // A second transaction cannot start while the recovered one lives.
        let error = db.begin().await.expect_err("begin should be refused");
        assert_eq!(error.kind(), ErrorKind::InvalidAction);

        tx.commit().await.expect("commit should not fail");
        assert!(db.active_transaction().await.is_none());
        db.close().await;
    })
    .await;
}

#[tokio::test]
async fn recovers_a_partial_row_with_payload_and_commits_it() {
    with_temp_db(|path| async move {
        let k1 = key(0, 1);
        let k2 = key(1, 2);
        let db = open_write(&path).await;
        let tx = db.begin().await.expect("begin should not fail");
        tx.add(k1, br#"{"v":41}"#).await.expect("add should not fail");
        tx.add(k2, br#"{"v":42}"#).await.expect("add should not fail");
        drop(tx);
        drop(db);

        // Before recovery finalizes the transaction, its finalized rows
        // resolve to an active transaction, and the key living only in the
        // partial row is not locatable at all.
        let reader = open_read(&path).await;
        let error = reader
            .get_raw(k1)
            .await
            .expect_err("a row of an active transaction is not readable");
        assert_eq!(error.kind(), ErrorKind::TransactionActive);
        let error = reader
            .get_raw(k2)
            .await
            .expect_err("the partial row is not locatable");
        assert_eq!(error.kind(), ErrorKind::KeyNotFound);
        reader.close().await;

        let db = open_write(&path).await;
        let tx = db
            .active_transaction()
            .await
            .expect("the partial row should recover as an active transaction");
        assert_eq!(tx.status().await.rows, 2);
        tx.commit().await.expect("commit should not fail");

        let out: Value = db.get(k1).await.expect("get should not fail");
        assert_eq!(out, json!({"v": 41}));
        let out: Value = db.get(k2).await.expect("get should not fail");
        assert_eq!(out, json!({"v": 42}));
        db.close().await;
    })
    .await;
}

#[tokio::test]
async fn recovers_a_savepoint_marker_and_honors_it() {
    with_temp_db(|path| async move {
        let k1 = key(0, 1);
        let k2 = key(1, 2);

        let db = open_write(&path).await;
        let tx = db.begin().await.expect("begin should not fail");
        tx.add(k1, br#"{"v":1}"#).await.expect("add should not fail");
        tx.savepoint().await.expect("savepoint should not fail");
        drop(tx);
        drop(db);

        let db = open_write(&path).await;
        let tx = db
            .active_transaction()
            .await
            .expect("the marked partial row should recover");
        let status = tx.status().await;
        assert_eq!(status.rows, 1);
        assert_eq!(status.savepoints, 1);

        // The recovered marker still refuses a duplicate declaration.
        let error = tx
            .savepoint()
            .await
            .expect_err("the current row is already a savepoint");
        assert_eq!(error.kind(), ErrorKind::InvalidAction);

        // Recovery allows extending the transaction, not just finishing it.
        tx.add(k2, br#"{"v":2}"#).await.expect("add should not fail");
        tx.rollback(1).await.expect("rollback should not fail");

        assert!(db.get_raw(k1).await.is_ok());
        let error = db.get_raw(k2).await.expect_err("k2 was rolled back");
        assert_eq!(error.kind(), ErrorKind::KeyNotFound);
        db.close().await;
    })
    .await;
}

#[tokio::test]
async fn recovers_a_multi_row_transaction_shape() {
    with_temp_db(|path| async move {
        let keys: Vec<_> = (0..3u64).map(|i| key(i, i as u8 + 1)).collect();

        let db = open_write(&path).await;
        let tx = db.begin().await.expect("begin should not fail");
        tx.add(keys[0], br#"{"i":0}"#).await.expect("add should not fail");
        tx.savepoint().await.expect("savepoint should not fail");
        tx.add(keys[1], br#"{"i":1}"#).await.expect("add should not fail");
        tx.add(keys[2], br#"{"i":2}"#).await.expect("add should not fail");
        drop(tx);
        drop(db);

        let db = open_write(&path).await;
        let tx = db
            .active_transaction()
            .await
            .expect("the transaction should recover");
        let status = tx.status().await;
        assert_eq!(status.rows, 3);
        assert_eq!(status.savepoints, 1);

        tx.commit().await.expect("commit should not fail");
        for k in &keys {
            assert!(db.get_raw(*k).await.is_ok());
        }
        db.close().await;
    })
    .await;
}

#[tokio::test]
async fn recovered_transaction_still_enforces_key_ordering() {
    with_temp_db(|path| async move {
        let db = open_write(&path).await;
        let tx = db.begin().await.expect("begin should not fail");
        tx.add(key(10_000, 1), br#"{"v":1}"#).await.expect("add should not fail");
        drop(tx);
        drop(db);

        let db = open_write(&path).await;
        let tx = db
            .active_transaction()
            .await
            .expect("the transaction should recover");
        // The partial row's own key counts toward the ordering window.
        let stale = super::key_at(super::BASE_TS, 2);
        let error = tx
            .add(stale, br#"{"v":2}"#)
            .await
            .expect_err("a stale key should be refused after recovery");
        assert_eq!(error.kind(), ErrorKind::KeyOrdering);

        tx.rollback(0).await.expect("rollback should not fail");
        db.close().await;
    })
    .await;
}
