//! Crash, claim, and replay scenarios: the on-disk chain must carry every
//! acknowledged commit across a power loss, and nothing else.

mod common;

use common::*;
use zettalog::base_types::*;
use zettalog::records::WrState;
use zettalog::spa::{LogState, Spa};
use zettalog::{claim, Zilog};

use std::sync::Arc;

fn open_fs(spa: &Spa) -> (Arc<TestFs>, Zilog) {
    let fs = TestFs::new(spa);
    let zilog = Zilog::open(spa, OS, fs.clone());
    (fs, zilog)
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_then_claim_then_replay_rebuilds_state() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (fs, zilog) = open_fs(&spa);
    fs.create_object(7);
    warmup(&zilog).await;

    // A few acknowledged commits, never pushed through a txg sync.
    log_write(&zilog, 7, 0, b"hello world", WrState::Copied);
    zilog.commit(ObjectId(7)).await;
    log_write(&zilog, 7, 4096, &[0xcd; 512], WrState::NeedCopy);
    zilog.commit(ObjectId(7)).await;

    // Power loss.
    let spa2 = spa.crash();
    claim(&spa2, OS).await.unwrap();
    let header = spa2.zil_header(OS);
    assert_eq!(header.claim_txg, spa2.first_txg());
    assert!(header.replay_needed);
    assert!(header.claim_lr_seq_valid);
    assert!(header.claim_lr_seq >= 2);

    // Claim again: a no-op on an already-claimed chain.
    let claims = spa2.claimed_count();
    claim(&spa2, OS).await.unwrap();
    assert_eq!(spa2.zil_header(OS), header);
    assert_eq!(spa2.claimed_count(), claims);

    // Replay into a filesystem that lost its in-memory state.
    let (fs2, zilog2) = open_fs(&spa2);
    fs2.create_object(7);
    assert!(zilog2.replay(fs2.clone()).await);

    let content = fs2.object(7);
    assert_eq!(&content[..11], b"hello world");
    assert_eq!(&content[4096..4608], &[0xcd; 512][..]);

    // The replayed chain was destroyed and the header cleared.
    spa2.txg_wait_synced(Txg(0)).await;
    let header = spa2.zil_header(OS);
    assert!(!header.replay_needed);
    assert!(header.log.is_hole());
}

#[tokio::test(flavor = "multi_thread")]
async fn indirect_write_claims_and_replays_its_data_block() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (fs, zilog) = open_fs(&spa);
    fs.create_object(9);
    warmup(&zilog).await;

    let payload: Vec<u8> = (0..8192u64).map(|i| (i % 199) as u8).collect();
    log_write(&zilog, 9, 0, &payload, WrState::Indirect);
    zilog.commit(ObjectId(9)).await;

    let spa2 = spa.crash();
    claim(&spa2, OS).await.unwrap();
    assert!(spa2.zil_header(OS).replay_needed);
    // Both the log blocks and the indirect data block are reserved.
    assert!(spa2.claimed_count() >= 2);

    let (fs2, zilog2) = open_fs(&spa2);
    fs2.create_object(9);
    assert!(zilog2.replay(fs2.clone()).await);
    assert_eq!(fs2.object(9), payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_block_ends_the_chain_at_the_break() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (_fs, zilog) = open_fs(&spa);
    warmup(&zilog).await;

    for i in 0..3u64 {
        log_write(&zilog, 7, i * 256, &[i as u8 + 1; 256], WrState::Copied);
        zilog.commit(ObjectId(7)).await;
    }

    let (_result, collector) = collect_chain(&spa, OS).await;
    assert_eq!(write_records(&collector).len(), 3);
    // Block 0 is the empty chain head; blocks 1..=3 carry one record each.
    assert!(collector.bps.len() >= 4);

    // Snap the chain at the third block: everything before it still
    // parses, everything after is gone.
    spa.corrupt_block(&collector.bps[2]);
    let (result, collector) = collect_chain(&spa, OS).await;
    assert_eq!(result.error, Some(ZilError::Cksum));
    assert!(result.io_error().is_ok());
    assert_eq!(write_records(&collector).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_record_for_missing_object_is_skipped() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (fs, zilog) = open_fs(&spa);
    fs.create_object(55);
    warmup(&zilog).await;

    log_write(&zilog, 55, 0, &[0xee; 128], WrState::Copied);
    zilog.commit(ObjectId(55)).await;

    let spa2 = spa.crash();
    claim(&spa2, OS).await.unwrap();

    // Object 55 no longer exists on the reimported side; TX_WRITE is an
    // out-of-order type, so the record is quietly dropped.
    let (fs2, zilog2) = open_fs(&spa2);
    assert!(zilog2.replay(fs2.clone()).await);
    assert!(fs2.objects.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn log_clear_import_erases_the_chain() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (_fs, zilog) = open_fs(&spa);
    warmup(&zilog).await;
    log_write(&zilog, 7, 0, &[3; 64], WrState::Copied);
    zilog.commit(ObjectId(7)).await;

    let spa2 = spa.crash();
    spa2.set_log_state(LogState::Clear);
    claim(&spa2, OS).await.unwrap();

    let header = spa2.zil_header(OS);
    assert_eq!(header, ZilHeaderPhys::default());
    assert_eq!(spa2.claimed_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreplayed_log_refuses_suspend() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (fs, zilog) = open_fs(&spa);
    fs.create_object(7);
    warmup(&zilog).await;
    log_write(&zilog, 7, 0, &[8; 64], WrState::Copied);
    zilog.commit(ObjectId(7)).await;

    let spa2 = spa.crash();
    claim(&spa2, OS).await.unwrap();

    let (_fs2, zilog2) = open_fs(&spa2);
    assert_eq!(zilog2.suspend().await.unwrap_err(), ZilError::Busy);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_chain_replays_zero_records_and_clears() {
    init_logging();
    let spa = Spa::new(2, 0);
    let (_fs, zilog) = open_fs(&spa);
    warmup(&zilog).await;

    // The chain holds only its empty head block (plus the pre-allocated
    // tail); claim still marks it for replay, which applies nothing.
    let spa2 = spa.crash();
    claim(&spa2, OS).await.unwrap();
    let header = spa2.zil_header(OS);
    assert!(header.replay_needed);
    assert_eq!(header.claim_lr_seq, 0);

    let (fs2, zilog2) = open_fs(&spa2);
    assert!(zilog2.replay(fs2.clone()).await);
    assert!(fs2.objects.lock().unwrap().is_empty());

    spa2.txg_wait_synced(Txg(0)).await;
    assert!(spa2.zil_header(OS).log.is_hole());
}

#[tokio::test(flavor = "multi_thread")]
async fn dataset_without_chain_has_nothing_to_replay() {
    init_logging();
    let spa = Spa::new(2, 0);
    let spa2 = spa.crash();
    claim(&spa2, OS).await.unwrap();
    assert_eq!(spa2.zil_header(OS), ZilHeaderPhys::default());

    let (fs2, zilog2) = open_fs(&spa2);
    assert!(!zilog2.replay(fs2).await);
}
