//! Per-dataset intent-log state and the commit entry points. The writer
//! pipeline itself lives in writer.rs, claim/check in claim.rs, and replay
//! in replay.rs; they are all methods on `Zilog`.

use crate::base_types::*;
use crate::chain;
use crate::itx::{self, Itx, ItxgRing};
use crate::lwb::{CommitWaiter, Lwb, LwbState};
use crate::records::{GetData, TxType, WrState, WRITE_RECORD_SIZE};
use crate::spa::{Spa, Tx, TxgHook};
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::*;
use more_asserts::*;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use util::get_tunable;

lazy_static! {
    /// Percentage of the lwb latency EWMA a committing thread waits before
    /// issuing its still-open lwb itself.
    pub(crate) static ref COMMIT_TIMEOUT_PCT: u64 = get_tunable("zfs_commit_timeout_pct", 10);
    /// Skip replay at mount. Recovery hazard.
    pub(crate) static ref REPLAY_DISABLE: bool = get_tunable("zil_replay_disable", false);
    /// Burst bytes above which slog writes are issued at async priority.
    pub(crate) static ref SLOG_BULK: u64 = get_tunable("zil_slog_bulk", 64 * 1024 * 1024);
    static ref MAXBLOCKSIZE: u64 = get_tunable("zil_maxblocksize", 128 * 1024);
    static ref MAXCOPIED: u64 = get_tunable("zil_maxcopied", 7680);
    static ref IMMEDIATE_WRITE_SZ: u64 = get_tunable("zfs_immediate_write_sz", 32768);
    /// Treat special vdevs as slog for write-state selection.
    static ref SPECIAL_IS_SLOG: bool = get_tunable("zil_special_is_slog", true);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPolicy {
    Standard,
    Always,
    Disabled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogBias {
    Latency,
    Throughput,
}

/// State guarded by the zilog's central lock: the lwb list (whose order is
/// create order is on-disk order), and everything completion callbacks
/// touch.
pub(crate) struct ZlState {
    pub lwb_list: VecDeque<Arc<Lwb>>,
    pub last_lwb_opened: Option<Arc<Lwb>>,
    /// Highest record seq known durable through the last completed lwb.
    pub commit_lr_seq: u64,
    /// EWMA of lwb issue-to-flush latency.
    pub last_lwb_latency: Duration,
    pub suspend: u64,
    pub suspending: bool,
    pub destroy_txg: Txg,
    pub keep_first: bool,
    pub dirty_max_txg: Txg,
    pub replayed_seq: [u64; TXG_SIZE],
}

/// State owned by whichever thread holds the issuer lock: the commit list
/// being drained and the burst-sizing history.
pub(crate) struct IssuerState {
    pub commit_list: VecDeque<Itx>,
    pub cur_size: u64,
    pub cur_left: u64,
    pub cur_max: u64,
    pub parallel: u64,
    pub prev_min: [u64; ZIL_BURSTS],
    pub prev_opt: [u64; ZIL_BURSTS],
    pub prev_rotor: usize,
}

pub(crate) struct LwbIoState {
    pub inflight: [u64; TXG_SIZE],
    pub max_issued_txg: Txg,
}

pub(crate) struct ZilogInner {
    pub os: ObjsetId,
    pub spa: Spa,
    pub get_data: Mutex<Option<Arc<dyn GetData>>>,
    /// In-core header; pushed into the dataset metadata during sync.
    pub header: Mutex<ZilHeaderPhys>,
    pub issuer: tokio::sync::Mutex<IssuerState>,
    pub zl: Mutex<ZlState>,
    pub lwb_io: Mutex<LwbIoState>,
    pub lwb_io_cv: Notify,
    pub itxg: ItxgRing,
    pub suspend_cv: Notify,
    pub max_block_size: u64,
    pub lwb_ids: AtomicU64,
    /// Next record sequence number for this chain.
    pub lr_seq: AtomicU64,
    pub sync_policy: Mutex<SyncPolicy>,
    pub logbias: Mutex<LogBias>,
    pub replaying: AtomicBool,
    pub replaying_seq: AtomicU64,
    pub replay_blks: AtomicU64,
}

/// Per-dataset intent log controller. Cheaply cloneable handle.
#[derive(Clone)]
pub struct Zilog {
    pub(crate) inner: Arc<ZilogInner>,
}

/// Registered with the pool so sync passes reach the log without keeping it
/// alive.
struct ZilogHook {
    inner: Weak<ZilogInner>,
}

#[async_trait]
impl TxgHook for ZilogHook {
    async fn sync(&self, txg: Txg) {
        if let Some(inner) = self.inner.upgrade() {
            Zilog { inner }.sync_txg(txg).await;
        }
    }

    async fn clean(&self, txg: Txg) {
        if let Some(inner) = self.inner.upgrade() {
            Zilog { inner }.clean(txg);
        }
    }
}

impl Zilog {
    /// Open the intent log of a dataset, wiring in the producer's get_data
    /// callback.
    pub fn open(spa: &Spa, os: ObjsetId, get_data: Arc<dyn GetData>) -> Zilog {
        let header = spa.zil_header(os);
        let max_block_size = std::cmp::max(*MAXBLOCKSIZE / ZIL_MIN_BLKSZ * ZIL_MIN_BLKSZ, ZIL_MIN_BLKSZ);
        let inner = Arc::new(ZilogInner {
            os,
            spa: spa.clone(),
            get_data: Mutex::new(Some(get_data)),
            header: Mutex::new(header),
            issuer: tokio::sync::Mutex::new(IssuerState {
                commit_list: VecDeque::new(),
                cur_size: 0,
                cur_left: 0,
                cur_max: 0,
                parallel: 0,
                prev_min: [0; ZIL_BURSTS],
                prev_opt: [max_block_size - *chain::TRAILER_SIZE; ZIL_BURSTS],
                prev_rotor: 0,
            }),
            zl: Mutex::new(ZlState {
                lwb_list: VecDeque::new(),
                last_lwb_opened: None,
                commit_lr_seq: 0,
                last_lwb_latency: Duration::from_micros(0),
                suspend: 0,
                suspending: false,
                destroy_txg: Txg(TXG_INITIAL.0 - 1),
                keep_first: false,
                dirty_max_txg: Txg(0),
                replayed_seq: [0; TXG_SIZE],
            }),
            lwb_io: Mutex::new(LwbIoState {
                inflight: [0; TXG_SIZE],
                max_issued_txg: Txg(0),
            }),
            lwb_io_cv: Notify::new(),
            itxg: ItxgRing::default(),
            suspend_cv: Notify::new(),
            max_block_size,
            lwb_ids: AtomicU64::new(1),
            lr_seq: AtomicU64::new(0),
            sync_policy: Mutex::new(SyncPolicy::Standard),
            logbias: Mutex::new(LogBias::Latency),
            replaying: AtomicBool::new(false),
            replaying_seq: AtomicU64::new(0),
            replay_blks: AtomicU64::new(0),
        });
        spa.register(Arc::new(ZilogHook {
            inner: Arc::downgrade(&inner),
        }));
        Zilog { inner }
    }

    pub fn objset(&self) -> ObjsetId {
        self.inner.os
    }

    pub fn spa(&self) -> &Spa {
        &self.inner.spa
    }

    pub fn header(&self) -> ZilHeaderPhys {
        *self.inner.header.lock().unwrap()
    }

    pub fn set_sync(&self, policy: SyncPolicy) {
        *self.inner.sync_policy.lock().unwrap() = policy;
    }

    pub fn set_logbias(&self, logbias: LogBias) {
        *self.inner.logbias.lock().unwrap() = logbias;
    }

    pub fn max_block_size(&self) -> u64 {
        self.inner.max_block_size
    }

    /// States of the in-memory lwbs, in create (= chain) order.
    pub fn lwb_states(&self) -> Vec<LwbState> {
        self.inner
            .zl
            .lock()
            .unwrap()
            .lwb_list
            .iter()
            .map(|lwb| lwb.state())
            .collect()
    }

    /// Highest record sequence number known durable through the last
    /// completed lwb.
    pub fn commit_lr_seq(&self) -> u64 {
        self.inner.zl.lock().unwrap().commit_lr_seq
    }

    /// Maximum record bytes that fit in a single maximum-size log block,
    /// after the chain trailer and `hdrsize` bytes of record header.
    pub fn max_log_data(&self, hdrsize: u64) -> u64 {
        self.inner.max_block_size - *chain::TRAILER_SIZE - hdrsize
    }

    /// Space we agree to waste at the tail of a block rather than split
    /// another WR_NEED_COPY chunk (~6%).
    pub(crate) fn max_waste_space(&self) -> u64 {
        self.max_log_data(*WRITE_RECORD_SIZE) / 16
    }

    /// Cap on WR_COPIED payloads. Larger writes must use WR_NEED_COPY or
    /// WR_INDIRECT, since a WR_COPIED record cannot be split.
    pub fn max_copied_data(&self) -> u64 {
        std::cmp::min(self.max_log_data(*WRITE_RECORD_SIZE), *MAXCOPIED)
    }

    /// Pick the write state for a TX_WRITE of `size` bytes into an object
    /// with the given block size.
    pub fn write_state(&self, size: u64, blocksize: u64, o_direct: bool, commit: bool) -> WrState {
        if *self.inner.logbias.lock().unwrap() == LogBias::Throughput || o_direct {
            return WrState::Indirect;
        }

        // Too-small writes aren't worth an indirect block; writes under
        // half a block that will commit immediately would inflate if the
        // next write rewrites the same block.
        let mut indirect = size >= *IMMEDIATE_WRITE_SZ && (size >= blocksize / 2 || !commit);

        if self.inner.spa.has_slog() {
            indirect = false;
        } else if self.inner.spa.has_special() && *SPECIAL_IS_SLOG {
            indirect = false;
        }

        if indirect {
            WrState::Indirect
        } else if commit {
            WrState::Copied
        } else {
            WrState::NeedCopy
        }
    }

    pub(crate) fn next_lr_seq(&self) -> u64 {
        self.inner.lr_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn otxg(&self) -> Txg {
        if self.inner.spa.frozen() {
            ZILTEST_TXG
        } else {
            self.inner.spa.last_synced_txg().next()
        }
    }

    fn dirty(&self, txg: Txg) {
        assert!(self.inner.spa.writable());
        let mut zl = self.inner.zl.lock().unwrap();
        zl.dirty_max_txg = std::cmp::max(zl.dirty_max_txg, txg);
    }

    /*
     * Itx intake
     */

    /// Queue an itx on the per-txg store. Data-before-metadata: a rename
    /// first forces the renamed object's async itxs onto the sync queue.
    pub fn itx_assign(&self, itx: Itx, tx: &Tx) {
        if itx.txtype() == TxType::Rename {
            self.async_to_sync(itx.oid);
        }
        // An unlinked object's id can be reused next txg; drop its strays.
        if itx.txtype() == TxType::Remove && itx.oid != ObjectId(0) {
            self.remove_async(itx.oid);
        }

        let real_txg = tx.txg();
        let txg = if self.inner.spa.frozen() {
            ZILTEST_TXG
        } else {
            real_txg
        };

        let stale = self.inner.itxg.assign(itx, txg, real_txg);
        // Dirty with the real txg even when frozen: ZILTEST_TXG is never
        // cleaned, the real one is.
        self.dirty(real_txg);
        if let Some(stale) = stale {
            itx::destroy_itxs(stale);
        }
    }

    /// Move the async itxs for `foid` (or all objects when foid is 0) to
    /// the sync queues so a commit drains them.
    pub(crate) fn async_to_sync(&self, foid: ObjectId) {
        self.inner.itxg.async_to_sync(self.otxg(), foid);
    }

    /// Drop all pending async itxs for an object being removed.
    pub fn remove_async(&self, oid: ObjectId) {
        let dropped = self.inner.itxg.remove_async(self.otxg(), oid);
        drop(dropped);
    }

    /// Reclaim the in-memory itxs of a synced txg.
    pub(crate) fn clean(&self, synced_txg: Txg) {
        assert_lt!(synced_txg, ZILTEST_TXG);
        if let Some(itxs) = self.inner.itxg.clean(synced_txg) {
            // Freeing can run callbacks; push it off the sync path.
            tokio::spawn(async move { itx::destroy_itxs(itxs) });
        }
    }

    /*
     * Commit entry points
     */

    /// Commit all pending sync itxs, plus the async itxs of `foid` (all
    /// objects if foid is 0), blocking until they are stable on disk.
    pub async fn commit(&self, foid: ObjectId) {
        if *self.inner.sync_policy.lock().unwrap() == SyncPolicy::Disabled {
            return;
        }

        if !self.inner.spa.writable() {
            // A non-writable pool can't have pending itxs; nothing to do.
            let zl = self.inner.zl.lock().unwrap();
            assert!(zl.lwb_list.is_empty());
            assert!(zl.last_lwb_opened.is_none());
            return;
        }

        // While suspended the log may not be dirtied; synchronous semantics
        // come from waiting out the txg instead.
        if self.inner.zl.lock().unwrap().suspend > 0 {
            self.inner.spa.txg_wait_synced(Txg(0)).await;
            return;
        }

        self.commit_impl(foid).await;
    }

    pub(crate) async fn commit_impl(&self, foid: ObjectId) {
        // Async itxs must reach the sync queues before the commit itx is
        // queued behind them.
        self.async_to_sync(foid);

        let zcw = CommitWaiter::new();
        self.commit_itx_assign(&zcw);

        let wtxg = self.commit_writer(&zcw).await;
        self.commit_waiter(&zcw).await;

        if let Some(error) = zcw.error() {
            // The lwbs this thread cares about failed; fall back to the
            // main pool for durability.
            debug!("commit waiter observed {:?}; falling back to txg sync", error);
            self.inner.spa.txg_wait_synced(Txg(0)).await;
        } else if wtxg != Txg(0) {
            // Lost a race with suspend; these itxs sync with their txg.
            self.inner.spa.txg_wait_synced(wtxg).await;
        }
    }

    fn commit_itx_assign(&self, zcw: &Arc<CommitWaiter>) {
        let tx = self.inner.spa.tx_assign();
        let itx = Itx::new_commit(zcw.clone());
        self.itx_assign(itx, &tx);
        drop(tx);
    }

    /// Block until the waiter is done; if we wait longer than the scaled
    /// timeout and the lwb is still open, close and issue it ourselves.
    async fn commit_waiter(&self, zcw: &Arc<CommitWaiter>) {
        let pct = std::cmp::max(*COMMIT_TIMEOUT_PCT, 1);
        let latency = self.inner.zl.lock().unwrap().last_lwb_latency;
        let sleep = latency * u32::try_from(pct).unwrap() / 100;
        let deadline = tokio::time::Instant::now() + sleep;
        let mut timedout = false;

        loop {
            let notified = zcw.cv.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if zcw.done() {
                return;
            }

            let lwb = zcw.linked_lwb();
            let opened = lwb.as_ref().map_or(false, |l| l.state() == LwbState::Opened);

            if opened && !timedout {
                match tokio::time::timeout_at(deadline, notified).await {
                    Ok(()) => continue,
                    Err(_) => {
                        timedout = true;
                        if !zcw.done() {
                            self.commit_waiter_timeout(zcw).await;
                        }
                    }
                }
            } else {
                // Already issued (or about to be skipped); no timeout
                // needed, completion will signal us.
                notified.await;
            }
        }
    }

    async fn commit_waiter_timeout(&self, zcw: &Arc<CommitWaiter>) {
        let lwb = match zcw.linked_lwb() {
            Some(lwb) => lwb,
            None => return,
        };
        if lwb.state() != LwbState::Opened {
            return;
        }

        let mut iss = self.inner.issuer.lock().await;

        // Re-check now that we hold the issuer lock; another thread may
        // have closed it, or completed the waiter, while we waited.
        if zcw.done() || lwb.state() != LwbState::Opened {
            return;
        }

        trace!("commit waiter timeout; issuing lwb {}", lwb.id());
        self.burst_done(&mut iss);
        match self.lwb_write_close(&mut iss, &lwb, LwbState::New) {
            None => {
                // Allocation of the next block failed; issue what we have
                // and stall the pipeline until sync frees the chain.
                self.lwb_write_issue(&lwb).await;
                self.writer_stall().await;
                drop(iss);
            }
            Some(_nlwb) => {
                drop(iss);
                self.lwb_write_issue(&lwb).await;
            }
        }
    }

    /*
     * Txg-driven reclamation (invoked from the pool's sync pass)
     */

    pub(crate) async fn sync_txg(&self, txg: Txg) {
        // Every lwb issued in this txg must be past its completion callback
        // before its memory and block can be reclaimed.
        self.lwb_flush_wait_all(txg).await;

        let spa = self.inner.spa.clone();
        let mut header = self.inner.header.lock().unwrap();
        let mut zl = self.inner.zl.lock().unwrap();

        let slot = txg.slot();
        if zl.replayed_seq[slot] != 0 {
            assert_lt!(header.replay_seq, zl.replayed_seq[slot]);
            header.replay_seq = zl.replayed_seq[slot];
            zl.replayed_seq[slot] = 0;
        }

        if zl.destroy_txg == txg {
            let blk = header.log;
            assert!(zl.lwb_list.is_empty());

            *header = ZilHeaderPhys::default();
            zl.replayed_seq = [0; TXG_SIZE];

            if zl.keep_first {
                // The kept first block may have belonged to a chain that
                // couldn't be claimed; give the new chain a fresh guid so
                // whatever blk points at cannot revalidate.
                let mut blk = blk;
                blk.seed = chain::init_chain_seed(self.inner.os);
                header.log = blk;
            }
        }

        while let Some(lwb) = zl.lwb_list.front().cloned() {
            let core = lwb.core.lock().unwrap();
            header.log = core.blk;
            if core.state != LwbState::FlushDone || core.alloc_txg > txg || core.max_txg > txg {
                break;
            }
            let blk = core.blk;
            drop(core);
            zl.lwb_list.pop_front();
            spa.free_block(txg, &blk);
            Self::free_lwb(&mut zl, &lwb);

            // Nothing left means the chain stalled on an allocation
            // failure; zero the pointer so the block isn't freed twice.
            if zl.lwb_list.is_empty() {
                header.log = BlockPtr::hole();
            }
        }

        spa.set_zil_header(self.inner.os, *header);
    }

    fn free_lwb(zl: &mut ZlState, lwb: &Arc<Lwb>) {
        let core = lwb.core.lock().unwrap();
        assert!(core.state == LwbState::New || core.state == LwbState::FlushDone);
        assert!(core.itxs.is_empty());
        assert!(core.waiters.is_empty());
        drop(core);
        if zl
            .last_lwb_opened
            .as_ref()
            .map_or(false, |last| Arc::ptr_eq(last, lwb))
        {
            zl.last_lwb_opened = None;
        }
    }

    /// Wait until every lwb issued in `txg` has completed its flush
    /// callback.
    pub(crate) async fn lwb_flush_wait_all(&self, txg: Txg) {
        loop {
            let notified = self.inner.lwb_io_cv.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lwb_io.lock().unwrap().inflight[txg.slot()] == 0 {
                break;
            }
            notified.await;
        }
    }

    /*
     * Destroy
     */

    /// Free every block of the chain and clear the header. With
    /// `keep_first`, the first block stays allocated so the next chain
    /// creation doesn't need to wait out a txg.
    pub async fn destroy(&self, keep_first: bool) -> bool {
        // Wait for any previous destroy to complete.
        let destroy_txg = self.inner.zl.lock().unwrap().destroy_txg;
        self.inner.spa.txg_wait_synced(destroy_txg).await;

        let header = self.header();
        if header.log.is_hole() {
            return false;
        }

        let tx = self.inner.spa.tx_assign();
        let txg = tx.txg();

        let mut parse_free = false;
        {
            let mut zl = self.inner.zl.lock().unwrap();
            assert_lt!(zl.destroy_txg, txg);
            zl.destroy_txg = txg;
            zl.keep_first = keep_first;

            if !zl.lwb_list.is_empty() {
                assert_eq!(header.claim_txg, Txg(0));
                assert!(!keep_first);
                while let Some(lwb) = zl.lwb_list.pop_front() {
                    let mut core = lwb.core.lock().unwrap();
                    core.buf = None;
                    let blk = core.blk;
                    drop(core);
                    if !blk.is_hole() {
                        self.inner.spa.free_block(txg, &blk);
                    }
                    Self::free_lwb(&mut zl, &lwb);
                }
            } else if !keep_first {
                parse_free = true;
            }
        }
        if parse_free {
            self.destroy_sync(txg).await;
        }
        drop(tx);
        true
    }

    /// Free the on-disk chain by walking it; used when there is no
    /// in-memory lwb state (import-time destroy, replay cleanup).
    pub(crate) async fn destroy_sync(&self, txg: Txg) {
        let header = self.header();
        let mut visitor = crate::claim::FreeVisitor::new(self.inner.spa.clone(), txg);
        let result = chain::parse(
            &self.inner.spa,
            &header,
            &mut visitor,
            header.claim_txg,
            false,
        )
        .await;
        trace!("destroy parse freed {} blocks", result.blk_count);
    }

    /*
     * Suspend / resume
     */

    /// Quiesce the log: drain everything in flight to FLUSH_DONE, push the
    /// data through a txg sync, and destroy the chain. Until `resume`,
    /// commits fall back to txg waits.
    pub async fn suspend(&self) -> Result<()> {
        {
            let header = self.header();
            let mut zl = self.inner.zl.lock().unwrap();

            if header.replay_needed {
                // An unreplayed log; import normally to replay it first.
                return Err(ZilError::Busy);
            }

            zl.suspend += 1;

            if zl.suspend > 1 {
                // Someone else is already suspending; wait them out.
                drop(zl);
                loop {
                    let notified = self.inner.suspend_cv.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !self.inner.zl.lock().unwrap().suspending {
                        return Ok(());
                    }
                    notified.await;
                }
            }

            if header.log.is_hole() {
                // No chain; suspended with nothing to clean up.
                return Ok(());
            }

            // Committing the log reads through the dataset's key; if it
            // isn't loaded we can't drain.
            if self.inner.spa.os_encrypted(self.inner.os) {
                if let Err(e) = self.inner.spa.create_key_mapping(self.inner.os) {
                    zl.suspend -= 1;
                    return Err(e);
                }
            }

            zl.suspending = true;
        }

        // commit_impl rather than commit: zl_suspend is set, and we need
        // the full drain of OPENED/CLOSED/READY lwbs through FLUSH_DONE,
        // not the txg_wait_synced shortcut.
        self.commit_impl(ObjectId(0)).await;

        // Push the logged data into the main pool before destroying.
        self.inner.spa.txg_wait_synced(Txg(0)).await;

        self.destroy(false).await;

        {
            let mut zl = self.inner.zl.lock().unwrap();
            zl.suspending = false;
        }
        self.inner.suspend_cv.notify_waiters();

        if self.inner.spa.os_encrypted(self.inner.os) {
            self.inner.spa.remove_key_mapping(self.inner.os);
        }
        Ok(())
    }

    pub fn resume(&self) {
        let mut zl = self.inner.zl.lock().unwrap();
        assert_gt!(zl.suspend, 0);
        zl.suspend -= 1;
    }

    /// Bookkeeping for replay functions: while a record is being applied,
    /// remember its seq against the applying txg so sync folds it into the
    /// header, making re-replay after a crash idempotent.
    pub fn replaying(&self, tx: &Tx) -> bool {
        if *self.inner.sync_policy.lock().unwrap() == SyncPolicy::Disabled {
            return true;
        }
        if self.inner.replaying.load(Ordering::Acquire) {
            let seq = self.inner.replaying_seq.load(Ordering::Acquire);
            self.inner.zl.lock().unwrap().replayed_seq[tx.txg().slot()] = seq;
            return true;
        }
        false
    }

    /// Close the log: commit what's pending, wait for every involved txg,
    /// and drop the remaining (unissued) tail lwb.
    pub async fn close(&self) {
        self.commit(ObjectId(0)).await;

        let mut txg = {
            let zl = self.inner.zl.lock().unwrap();
            let mut txg = zl.dirty_max_txg;
            if let Some(lwb) = zl.lwb_list.back() {
                let core = lwb.core.lock().unwrap();
                txg = std::cmp::max(txg, core.alloc_txg);
                txg = std::cmp::max(txg, core.max_txg);
            }
            txg
        };
        // An lwb may have been issued in a later txg than anything it
        // contains.
        txg = std::cmp::max(txg, self.inner.lwb_io.lock().unwrap().max_issued_txg);

        if txg != Txg(0) {
            self.inner.spa.txg_wait_synced(txg).await;
        }

        *self.inner.get_data.lock().unwrap() = None;

        let mut zl = self.inner.zl.lock().unwrap();
        if let Some(lwb) = zl.lwb_list.pop_front() {
            assert!(zl.lwb_list.is_empty());
            assert_eq!(lwb.state(), LwbState::New);
            lwb.core.lock().unwrap().buf = None;
            Self::free_lwb(&mut zl, &lwb);
        }
        drop(zl);

        // Itxs that never dirtied a cleaned txg (e.g. frozen-pool itxs)
        // are dropped here.
        for itxs in self.inner.itxg.clean_all() {
            itx::destroy_itxs(itxs);
        }
    }
}
