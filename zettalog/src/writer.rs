//! The writer pipeline: drain the per-txg sync lists onto the commit list,
//! pack itxs into lwbs, and issue the lwbs as a strictly ordered chain.
//!
//! At most one task runs the close/allocate/issue sequence at a time (the
//! issuer lock); producers keep assigning itxs into their txg slots
//! concurrently. The zio dependency graph of the original becomes explicit
//! completion ordering here: every lwb's completion task waits out its
//! predecessor's published completion before finishing its own, so lwbs
//! complete in creation order no matter how the device reorders the writes.

use crate::base_types::*;
use crate::chain;
use crate::itx::Itx;
use crate::lwb::{wait_io, Lwb, LwbState};
use crate::records::{self, WrState, LR_HEADER_SIZE, WRITE_RECORD_SIZE};
use crate::spa::WritePriority;
use crate::zilog::{IssuerState, Zilog, SLOG_BULK};
use log::*;
use more_asserts::*;
use std::sync::Arc;
use std::time::Instant;
use util::From64;

impl Zilog {
    /// Ensure the waiter's commit itx lands in an lwb: drain the txg slots,
    /// prune leading commit itxs, pack the rest, and issue every lwb that
    /// got closed along the way. Returns a txg to wait out if a suspend
    /// raced with us (0 otherwise).
    pub(crate) async fn commit_writer(&self, zcw: &Arc<crate::lwb::CommitWaiter>) -> Txg {
        assert!(self.inner.spa.writable());

        let mut ilwbs: Vec<Arc<Lwb>> = Vec::new();
        let mut wtxg = Txg(0);
        {
            let mut iss = self.inner.issuer.lock().await;

            // Another thread may have committed this waiter to an lwb
            // while we waited for the issuer lock; bail out early rather
            // than contending further.
            if zcw.linked_lwb().is_none() && !zcw.done() {
                wtxg = self.get_commit_list(&mut iss);
                self.prune_commit_list(&mut iss);
                self.process_commit_list(&mut iss, zcw, &mut ilwbs).await;
            }
        }
        for lwb in ilwbs {
            self.lwb_write_issue(&lwb).await;
        }
        wtxg
    }

    /// Splice the sync lists of the active txgs onto the commit list,
    /// accumulating burst-size inputs for the predictor. Inherently racy
    /// against the last-synced txg moving; that only means we may commit
    /// something that was already synced, which is harmless.
    fn get_commit_list(&self, iss: &mut IssuerState) -> Txg {
        let otxg = if self.inner.spa.frozen() {
            ZILTEST_TXG
        } else {
            self.inner.spa.last_synced_txg().next()
        };

        let mut wtxg = Txg(0);
        for txg in otxg.0..otxg.0 + TXG_CONCURRENT_STATES {
            let txg = Txg(txg);

            if self.inner.zl.lock().unwrap().suspend > 0 {
                // The log was just suspended, but we lost the race. Leave
                // the itxs for the txg sync and tell the caller to wait
                // for it.
                if self.inner.itxg.sync_nonempty(txg) {
                    wtxg = std::cmp::max(wtxg, txg);
                }
                continue;
            }

            if let Some(list) = self.inner.itxg.splice_sync(txg) {
                for itx in &list {
                    let s = itx.full_size();
                    iss.cur_size += s;
                    iss.cur_left += s;
                    iss.cur_max = std::cmp::max(iss.cur_max, itx.record_size());
                }
                iss.commit_list.extend(list);
            }
        }
        wtxg
    }

    /// Leading commit itxs don't need an lwb of their own: attach their
    /// waiters to the last still-pending lwb, or mark them done outright if
    /// nothing is pending.
    fn prune_commit_list(&self, iss: &mut IssuerState) {
        while let Some(front) = iss.commit_list.front() {
            if !front.is_commit() {
                break;
            }
            let itx = iss.commit_list.pop_front().unwrap();
            let waiter = itx.private.waiter().unwrap().clone();
            {
                let zl = self.inner.zl.lock().unwrap();
                match &zl.last_lwb_opened {
                    Some(last) if last.state() != LwbState::FlushDone => {
                        waiter.link_lwb(last);
                    }
                    _ => {
                        // Everything this waiter could be waiting on has
                        // already completed.
                        waiter.skip();
                    }
                }
            }
            drop(itx);
        }
    }

    /// Pack the commit list into lwbs, closing full ones onto `ilwbs` for
    /// the caller to issue.
    async fn process_commit_list(
        &self,
        iss: &mut IssuerState,
        zcw: &Arc<crate::lwb::CommitWaiter>,
        ilwbs: &mut Vec<Arc<Lwb>>,
    ) {
        let spa = self.inner.spa.clone();

        let mut lwb_opt = self.inner.zl.lock().unwrap().lwb_list.back().cloned();
        if let Some(lwb) = &lwb_opt {
            let state = lwb.state();
            assert!(state == LwbState::New || state == LwbState::Opened);

            // A still-open lwb means a second writer got here while the
            // first was packing: the workload is multi-threaded and worth
            // planning extra space for. An unflushed predecessor hints the
            // same, more weakly.
            if state == LwbState::Opened {
                iss.parallel = ZIL_BURSTS as u64;
            } else {
                let zl = self.inner.zl.lock().unwrap();
                let n = zl.lwb_list.len();
                let plwb = if n >= 2 { zl.lwb_list.get(n - 2) } else { None };
                if plwb.map_or(false, |p| p.state() != LwbState::FlushDone) {
                    iss.parallel = std::cmp::max(iss.parallel, (ZIL_BURSTS / 2) as u64);
                }
            }
        } else {
            // Don't dirty the pool when there is nothing to commit.
            if iss.commit_list.is_empty() {
                return;
            }
            lwb_opt = self.create_chain().await;
        }

        let mut nolwb_itxs: Vec<Itx> = Vec::new();
        let mut nolwb_waiters = Vec::new();

        while let Some(itx) = iss.commit_list.pop_front() {
            let txg = itx.hdr.txg;
            assert_ne!(txg, Txg(0));

            let synced = txg <= spa.last_synced_txg();
            let frozen = txg > spa.freeze_txg();

            // An already-synced itx needs no lwb; its data made it out via
            // the main pool. Commit itxs are the exception: they must
            // always attach their waiter to *some* lwb, or an OPENED lwb
            // could sit waiterless forever. A frozen pool commits
            // everything, since nothing else makes it durable.
            if frozen || !synced || itx.is_commit() {
                if let Some(lwb) = lwb_opt.clone() {
                    match self.lwb_assign(iss, lwb, itx, ilwbs).await {
                        Ok(new_lwb) => {
                            let moved_on = zcw
                                .linked_lwb()
                                .map_or(false, |l| !Arc::ptr_eq(&l, &new_lwb));
                            lwb_opt = Some(new_lwb);
                            if moved_on || zcw.done() {
                                // Our waiter's lwb is full (or done);
                                // leave the rest of the list to whoever
                                // cares about it.
                                iss.parallel = ZIL_BURSTS as u64;
                                break;
                            }
                        }
                        Err(itx) => {
                            iss.cur_left = iss.cur_left.saturating_sub(itx.full_size());
                            nolwb_itxs.push(itx);
                            lwb_opt = None;
                        }
                    }
                } else {
                    if itx.is_commit() {
                        nolwb_waiters.push(itx.private.waiter().unwrap().clone());
                    }
                    iss.cur_left = iss.cur_left.saturating_sub(itx.full_size());
                    nolwb_itxs.push(itx);
                }
            } else {
                assert!(!itx.is_commit());
                iss.cur_left = iss.cur_left.saturating_sub(itx.full_size());
                drop(itx);
            }
        }

        match lwb_opt {
            None => {
                // The chain broke on an allocation failure. Issue what was
                // already closed, then stall until sync reclaims the whole
                // chain; the next writer starts a fresh one.
                for lwb in ilwbs.drain(..) {
                    self.lwb_write_issue(&lwb).await;
                }
                self.writer_stall().await;

                // Without an lwb there is no completion callback to signal
                // these waiters; do it here.
                for waiter in nolwb_waiters {
                    waiter.skip();
                }
                for itx in nolwb_itxs {
                    drop(itx);
                }
            }
            Some(lwb) => {
                assert!(nolwb_waiters.is_empty());
                assert!(nolwb_itxs.is_empty());
                let state = lwb.state();
                assert!(state == LwbState::New || state == LwbState::Opened);

                // Leave an opened lwb for a parallel workload to fill
                // further; otherwise close and issue it now. (If we leave
                // it, either the next committer closes it, or its waiter's
                // timeout does.)
                if state == LwbState::Opened
                    && (iss.parallel == 0 || self.inner.zl.lock().unwrap().suspend > 0)
                {
                    self.burst_done(iss);
                    ilwbs.push(lwb.clone());
                    if self.lwb_write_close(iss, &lwb, LwbState::New).is_none() {
                        for lwb in ilwbs.drain(..) {
                            self.lwb_write_issue(&lwb).await;
                        }
                        self.writer_stall().await;
                    }
                }
            }
        }
    }

    /// Estimate space for the itx and attach it to the lwb, closing filled
    /// lwbs onto `ilwbs` and splitting oversized WR_NEED_COPY records.
    /// Returns the lwb to keep packing into, or gives the itx back if a
    /// new block could not be allocated.
    async fn lwb_assign(
        &self,
        iss: &mut IssuerState,
        mut lwb: Arc<Lwb>,
        mut itx: Itx,
        ilwbs: &mut Vec<Arc<Lwb>>,
    ) -> Result<Arc<Lwb>, Itx> {
        self.lwb_write_open(&lwb);

        // A commit itx carries no on-disk state; it exists to hang its
        // waiter on the right lwb.
        if itx.is_commit() {
            itx.private.waiter().unwrap().link_lwb(&lwb);
            lwb.core.lock().unwrap().itxs.push(itx);
            return Ok(lwb);
        }

        let reclen = itx.hdr.reclen;
        assert_ge!(reclen, LR_HEADER_SIZE);
        assert_le!(reclen, self.max_log_data(0));
        let mut dlen = itx.data_size();
        let txg = itx.hdr.txg;
        let max_log_data = self.max_log_data(*WRITE_RECORD_SIZE);

        loop {
            let mut lwb_sp = {
                let core = lwb.core.lock().unwrap();
                core.nmax - core.nused
            };

            // Start a new block if the record can't fit, or if packing the
            // remaining data here would fragment it badly for little
            // space gain.
            if reclen > lwb_sp
                || (reclen + dlen > lwb_sp
                    && lwb_sp < self.max_waste_space()
                    && (dlen % max_log_data == 0 || lwb_sp < reclen + dlen % max_log_data))
            {
                ilwbs.push(lwb.clone());
                match self.lwb_write_close(iss, &lwb, LwbState::Opened) {
                    Some(next) => lwb = next,
                    None => return Err(itx),
                }
                let core = lwb.core.lock().unwrap();
                lwb_sp = core.nmax - core.nused;
            }

            // WR_COPIED must fit whole; WR_NEED_COPY only needs room for
            // one word of data per block.
            assert_le!(reclen + std::cmp::min(dlen, 8), lwb_sp);

            let dnow = std::cmp::min(dlen, lwb_sp - reclen);
            if dlen > dnow {
                assert_eq!(itx.txtype(), crate::records::TxType::Write);
                assert_eq!(itx.wr_state, Some(WrState::NeedCopy));
                let mut citx = itx.clone_for_split();
                let mut cwb = citx.write_body().unwrap();
                cwb.length = dnow;
                citx.set_write_body(&cwb);
                let mut wb = itx.write_body().unwrap();
                wb.offset += dnow;
                wb.length -= dnow;
                itx.set_write_body(&wb);
                iss.cur_left = iss.cur_left.saturating_sub(dnow);

                citx.hdr.seq = self.next_lr_seq();
                let mut core = lwb.core.lock().unwrap();
                core.nused += reclen + dnow;
                assert_le!(core.nused, core.nmax);
                assert_eq!(core.nused % 8, 0);
                core.itxs.push(citx);
                drop(core);
                lwb.add_txg(txg);

                dlen -= dnow;
            } else {
                // The record is making it in: stamp the on-chain sequence
                // number. Not the itx seq; not every itx gets here.
                itx.hdr.seq = self.next_lr_seq();
                let charged = reclen + dlen;
                let mut core = lwb.core.lock().unwrap();
                core.nused += charged;
                assert_le!(core.nused, core.nmax);
                assert_eq!(core.nused % 8, 0);
                drop(core);
                lwb.add_txg(txg);
                iss.cur_left = iss.cur_left.saturating_sub(charged);
                let is_frozen_write = itx.txtype() == crate::records::TxType::Write
                    && txg > self.inner.spa.freeze_txg();
                lwb.core.lock().unwrap().itxs.push(itx);

                if is_frozen_write {
                    self.inner.spa.txg_wait_synced(txg).await;
                }
                return Ok(lwb);
            }
        }
    }

    fn lwb_write_open(&self, lwb: &Arc<Lwb>) {
        let mut core = lwb.core.lock().unwrap();
        if core.state != LwbState::New {
            assert_eq!(core.state, LwbState::Opened);
            return;
        }
        core.state = LwbState::Opened;
        drop(core);
        self.inner.zl.lock().unwrap().last_lwb_opened = Some(lwb.clone());
    }

    /// Close the block for issue and allocate its successor, whose size
    /// comes from the burst plan. None means this lwb carries an
    /// allocation error and the caller must stall.
    pub(crate) fn lwb_write_close(
        &self,
        iss: &mut IssuerState,
        lwb: &Arc<Lwb>,
        state: LwbState,
    ) -> Option<Arc<Lwb>> {
        {
            let mut core = lwb.core.lock().unwrap();
            assert_eq!(core.state, LwbState::Opened);
            core.state = LwbState::Closed;
            core.burst_size = iss.cur_size;
            if core.error.is_some() {
                return None;
            }
        }

        // Log blocks are pre-allocated: pick the next block's size from
        // what's left of this burst and the history. Always allocating the
        // maximum would exhaust log space, so be reasonable.
        let plan = if iss.cur_left > 0 {
            let (p, _) = self.lwb_plan(iss, iss.cur_left);
            if iss.parallel > 0 {
                // More writers may pile on before the block fills; plan
                // for the predicted burst on top of what we know about.
                let (p2, _) = self.lwb_plan(iss, iss.cur_left + self.lwb_predict(iss));
                std::cmp::max(p, p2)
            } else {
                p
            }
        } else {
            self.lwb_predict(iss)
        };
        let blksz = std::cmp::min(
            (plan + *chain::TRAILER_SIZE + ZIL_MIN_BLKSZ - 1) / ZIL_MIN_BLKSZ * ZIL_MIN_BLKSZ,
            self.inner.max_block_size,
        );
        trace!("next log block size {} (plan {})", blksz, plan);

        Some(self.alloc_lwb(None, blksz, false, Txg(0), state))
    }

    /// Plan splitting of `size` burst bytes between blocks. Returns the
    /// even block size to use and the minimum first-block size that would
    /// still serve the burst in one pass.
    pub(crate) fn lwb_plan(&self, iss: &IssuerState, size: u64) -> (u64, u64) {
        let md = self.max_log_data(0);

        if size <= md {
            // Small bursts are written as-is in one block.
            return (size, size);
        }
        if size > 8 * md {
            // Big bursts use maximum blocks; the first block size is hard
            // to predict and does not really matter.
            return (md, 0);
        }

        // Medium bursts divide evenly to better utilize several slog
        // vdevs. The first block size assumes the worst case of maxing
        // out the others.
        let per_block = md - *WRITE_RECORD_SIZE;
        let n = (size + per_block - 1) / per_block;
        let chunk = (size + n - 1) / n;
        let waste = std::cmp::max(self.max_waste_space(), iss.cur_max);
        if chunk <= md - waste {
            let min = std::cmp::max(size.saturating_sub((md - waste) * (n - 1)), waste);
            (chunk, min)
        } else {
            (md, 0)
        }
    }

    /// Predict the next block size from the burst history: enough for 7 of
    /// the 8 previous bursts, but don't chase a single spike unless the
    /// smaller size saves less than half the space.
    pub(crate) fn lwb_predict(&self, iss: &IssuerState) -> u64 {
        let (mut o, m) = if iss.cur_size > 0 {
            let (chunk, min) = self.lwb_plan(iss, iss.cur_size);
            (chunk, min)
        } else {
            (u64::MAX, 0)
        };

        // The minimum optimal size; no point going below it.
        for i in 0..ZIL_BURSTS {
            o = std::cmp::min(o, iss.prev_opt[i]);
        }

        // The two biggest minimal first-block sizes above that.
        let mut m1 = std::cmp::max(m, o);
        let mut m2 = o;
        for i in 0..ZIL_BURSTS {
            let m = iss.prev_min[i];
            if m >= m1 {
                m2 = m1;
                m1 = m;
            } else if m > m2 {
                m2 = m;
            }
        }

        // If the second minimum halves the space, take it; one extra write
        // later is worth that much saving.
        if m1 < m2 * 2 {
            m1
        } else {
            m2
        }
    }

    /// A burst ended (commit list drained): record it in the prediction
    /// history and reset the accumulators.
    pub(crate) fn burst_done(&self, iss: &mut IssuerState) {
        if !iss.commit_list.is_empty() || iss.cur_size == 0 {
            return;
        }

        if iss.parallel > 0 {
            iss.parallel -= 1;
        }
        let r = (iss.prev_rotor + 1) & (ZIL_BURSTS - 1);
        iss.prev_rotor = r;
        let (opt, min) = self.lwb_plan(iss, iss.cur_size);
        iss.prev_opt[r] = opt;
        iss.prev_min[r] = min;

        iss.cur_size = 0;
        iss.cur_max = 0;
        iss.cur_left = 0;
    }

    pub(crate) fn alloc_lwb(
        &self,
        bp: Option<BlockPtr>,
        sz: u64,
        slog: bool,
        alloc_txg: Txg,
        state: LwbState,
    ) -> Arc<Lwb> {
        let id = self.inner.lwb_ids.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let lwb = Lwb::new(
            id,
            bp,
            sz,
            self.inner.spa.slim_supported(),
            slog,
            alloc_txg,
            state,
        );
        let mut zl = self.inner.zl.lock().unwrap();
        zl.lwb_list.push_back(lwb.clone());
        if state != LwbState::New {
            zl.last_lwb_opened = Some(lwb.clone());
        }
        lwb
    }

    /// Create an on-disk intent log: allocate the first block if the
    /// header doesn't already point at one.
    pub(crate) async fn create_chain(&self) -> Option<Arc<Lwb>> {
        // Wait for any previous destroy to complete.
        let destroy_txg = self.inner.zl.lock().unwrap().destroy_txg;
        self.inner.spa.txg_wait_synced(destroy_txg).await;

        let header = self.header();
        assert_eq!(header.claim_txg, Txg(0));
        assert_eq!(header.replay_seq, 0);

        let mut blk = header.log;
        let mut slog = false;
        let mut error = None;
        let mut alloc_txg = None;

        if blk.is_hole() {
            let tx = self.inner.spa.tx_assign();
            let txg = tx.txg();
            match self.inner.spa.alloc_log_block(txg, ZIL_MIN_BLKSZ) {
                Ok((mut bp, s)) => {
                    bp.seed = chain::init_chain_seed(self.inner.os);
                    blk = bp;
                    slog = s;
                }
                Err(e) => error = Some(e),
            }
            alloc_txg = Some(txg);
            drop(tx);
        }

        let lwb = if error.is_none() {
            Some(self.alloc_lwb(
                Some(blk),
                0,
                slog,
                alloc_txg.unwrap_or(Txg(0)),
                LwbState::New,
            ))
        } else {
            warn!("log chain creation failed: {:?}", error);
            None
        };

        // If we just allocated the first block, wait for sync to stuff the
        // pointer into the on-disk header.
        if let Some(txg) = alloc_txg {
            self.inner.spa.txg_wait_synced(txg).await;
        }
        lwb
    }

    /// The next log block could not be allocated, so the previously issued
    /// lwb has no pointer to its successor; wait for sync to reclaim every
    /// lwb so the next writer starts a fresh chain instead of leaking a
    /// block nothing points to. Runs with the issuer lock held so no new
    /// writer sneaks in before the list is empty.
    pub(crate) async fn writer_stall(&self) {
        warn!("writer stalled on log block allocation failure");
        self.inner.spa.txg_wait_synced(Txg(0)).await;
        assert!(self.inner.zl.lock().unwrap().lwb_list.is_empty());
    }

    /*
     * Issue path
     */

    /// Finalize a closed block: copy the record payloads in, then write it
    /// out, allocating the successor's block along the way. If this lwb
    /// has no block pointer yet, the predecessor's issue will pick it up.
    pub(crate) async fn lwb_write_issue(&self, lwb: &Arc<Lwb>) {
        assert_eq!(lwb.state(), LwbState::Closed);
        self.lwb_fill(lwb).await;

        // Ready to go out, but only if the block pointer already arrived
        // (or allocation already failed).
        {
            let mut core = lwb.core.lock().unwrap();
            core.state = LwbState::Ready;
            if core.blk.is_hole() && core.error.is_none() {
                return;
            }
        }

        let mut next = self.issue_one(lwb.clone()).await;
        while let Some(lwb) = next {
            next = self.issue_one(lwb).await;
        }
    }

    /// Copy each attached itx's record into the block buffer, fetching
    /// write payloads from the producer as needed.
    async fn lwb_fill(&self, lwb: &Arc<Lwb>) {
        let (mut buf, itxs, nused) = {
            let mut core = lwb.core.lock().unwrap();
            assert_eq!(core.state, LwbState::Closed);
            (
                core.buf.take().unwrap(),
                std::mem::take(&mut core.itxs),
                core.nused,
            )
        };
        let mut nfilled = lwb.core.lock().unwrap().nfilled;
        let get_data = self.inner.get_data.lock().unwrap().clone();

        let mut kept = Vec::with_capacity(itxs.len());
        for mut itx in itxs {
            self.lwb_fill_itx(lwb, &mut buf, nused, &mut nfilled, &mut itx, &get_data)
                .await;
            kept.push(itx);
        }

        let mut core = lwb.core.lock().unwrap();
        core.buf = Some(buf);
        core.itxs = kept;
        core.nfilled = nfilled;
        // Skipped records release their reservation.
        core.nused = nfilled;
        assert_le!(core.nused, core.nmax);
    }

    async fn lwb_fill_itx(
        &self,
        lwb: &Arc<Lwb>,
        buf: &mut [u8],
        nused: u64,
        nfilled: &mut u64,
        itx: &mut Itx,
        get_data: &Option<Arc<dyn records::GetData>>,
    ) {
        if itx.is_commit() {
            return;
        }

        let reclen = itx.hdr.reclen;
        let dlen = itx.data_size();
        assert_le!(reclen + dlen, nused - *nfilled);

        let off = usize::from64(*nfilled);
        let body_off = off + usize::from64(LR_HEADER_SIZE);

        // Header first; for WR_NEED_COPY the in-block reclen grows to
        // cover the inline payload.
        let mut hdr = itx.hdr;
        if itx.wr_state == Some(WrState::NeedCopy) {
            hdr.reclen = reclen + dlen;
        }
        records::encode_into(&mut buf[off..], &hdr);
        buf[body_off..body_off + itx.body.len()].copy_from_slice(&itx.body);

        if itx.txtype() == crate::records::TxType::Write && itx.wr_state != Some(WrState::Copied) {
            let get_data = match get_data {
                Some(g) => g.clone(),
                None => return,
            };
            let mut wb = itx.write_body().unwrap();
            let result = if itx.wr_state == Some(WrState::NeedCopy) {
                let dbuf_off = off + usize::from64(reclen);
                let dbuf = &mut buf[dbuf_off..dbuf_off + usize::from64(dlen)];
                let r = get_data
                    .get_data(itx.private.as_any(), itx.gen, &mut wb, Some(dbuf), lwb)
                    .await;
                if r.is_ok() {
                    // Zero the padding after the payload.
                    let len = usize::from64(wb.length);
                    dbuf[len..].iter_mut().for_each(|b| *b = 0);
                }
                r
            } else {
                assert_eq!(itx.wr_state, Some(WrState::Indirect));
                get_data
                    .get_data(itx.private.as_any(), itx.gen, &mut wb, None, lwb)
                    .await
            };

            match result {
                Ok(()) => {
                    // The producer may have revised the record (indirect
                    // block pointer, shortened length).
                    records::encode_into(&mut buf[body_off..], &wb);
                }
                Err(ZilError::Io) => {
                    // Neither an inline nor an indirect write happened;
                    // this record's data reaches disk with its txg
                    // instead, and the record is dropped from the block.
                    warn!("get_data returned Io; falling back to txg sync");
                    self.inner.spa.txg_wait_synced(itx.hdr.txg).await;
                    return;
                }
                Err(ZilError::NotFound) | Err(ZilError::Exists) | Err(ZilError::Already) => {
                    // The object is gone or already up to date on disk.
                    return;
                }
                Err(e) => {
                    warn!("get_data returned unexpected {:?}; falling back to txg sync", e);
                    self.inner.spa.txg_wait_synced(itx.hdr.txg).await;
                    return;
                }
            }
        }

        *nfilled += reclen + dlen;
        assert_eq!(*nfilled % 8, 0);
    }

    /// Issue one ready lwb: allocate the successor's block, seal the
    /// trailer, capture ordering dependencies, and hand the write to a
    /// completion task. Returns the successor if it was already filled and
    /// waiting on us for its block pointer.
    async fn issue_one(&self, lwb: Arc<Lwb>) -> Option<Arc<Lwb>> {
        let spa = self.inner.spa.clone();

        // Open a transaction to cover the successor's block allocation.
        let tx = spa.tx_assign();
        let txg = tx.txg();

        let (nlwb, nlwb_sz, nlwb_slim) = {
            let zl = self.inner.zl.lock().unwrap();
            let pos = zl
                .lwb_list
                .iter()
                .position(|l| Arc::ptr_eq(l, &lwb))
                .expect("issued lwb is on the list");
            match zl.lwb_list.get(pos + 1) {
                Some(n) => {
                    let core = n.core.lock().unwrap();
                    (Some(n.clone()), core.sz, core.slim)
                }
                None => (None, 0, true),
            }
        };

        let mut error = lwb.core.lock().unwrap().error;
        let mut next_bp = BlockPtr::hole();
        let mut next_slog = false;
        if error.is_none() {
            if nlwb.is_some() {
                match spa.alloc_log_block(txg, nlwb_sz) {
                    Ok((mut bp, slog)) => {
                        assert_eq!(bp.birth, txg);
                        bp.kind = if nlwb_slim {
                            ChainKind::Slim
                        } else {
                            ChainKind::Legacy
                        };
                        bp.seed = lwb.blk().seed.advance();
                        next_bp = bp;
                        next_slog = slog;
                    }
                    Err(e) => error = Some(e),
                }
            }
        }

        // Keep the txg open time short: account the inflight write and let
        // the transaction go; sync waits on the inflight count instead.
        {
            let mut io = self.inner.lwb_io.lock().unwrap();
            lwb.core.lock().unwrap().issued_txg = txg;
            io.inflight[txg.slot()] += 1;
            io.max_issued_txg = std::cmp::max(io.max_issued_txg, txg);
        }
        drop(tx);

        // Seal the block: trailer carries the used bytes and the pointer
        // (with advanced checksum seed) the chain continues at.
        let (write_data, bp, priority) = {
            let mut core = lwb.core.lock().unwrap();
            let bp = core.blk;
            if core.error.is_none() {
                let mut buf = core.buf.take().unwrap();
                let wsz = if core.slim {
                    (core.nused + ZIL_MIN_BLKSZ - 1) / ZIL_MIN_BLKSZ * ZIL_MIN_BLKSZ
                } else {
                    core.sz
                };
                buf.truncate(usize::from64(wsz));
                let zero_from = usize::from64(core.nused);
                buf[zero_from..].iter_mut().for_each(|b| *b = 0);
                chain::seal_block(
                    &mut buf,
                    bp.kind,
                    core.nused,
                    if error.is_none() { next_bp } else { BlockPtr::hole() },
                );
                let priority = if !core.slog || core.burst_size <= *SLOG_BULK {
                    WritePriority::SyncWrite
                } else {
                    WritePriority::AsyncWrite
                };
                drop(core);
                lwb.add_vdev(bp.vdev);
                (Some(buf), bp, priority)
            } else {
                core.buf = None;
                (None, bp, WritePriority::SyncWrite)
            }
        };

        // Dependencies on the predecessor, mirroring the completion-order
        // discipline: our completion waits its completion out, and -- when
        // it may defer its flushes to us -- our write completion waits out
        // its write completion, so we never flush vdevs its data hasn't
        // reached.
        let (prev_write_rx, prev_root_rx, continue_with) = {
            let zl = self.inner.zl.lock().unwrap();
            let pos = zl
                .lwb_list
                .iter()
                .position(|l| Arc::ptr_eq(l, &lwb))
                .expect("issued lwb is on the list");

            let mut prev_write_rx = None;
            let mut prev_root_rx = None;
            if pos > 0 {
                let prev = &zl.lwb_list[pos - 1];
                let pcore = prev.core.lock().unwrap();
                if pcore.state != LwbState::FlushDone {
                    if pcore.state == LwbState::Issued && pcore.waiters.is_empty() {
                        prev_write_rx = Some(prev.subscribe_write_done());
                    }
                    prev_root_rx = Some(prev.subscribe_root_done());
                }
            }

            {
                let mut core = lwb.core.lock().unwrap();
                assert_eq!(core.state, LwbState::Ready);
                core.state = LwbState::Issued;
                core.issued_at = Some(Instant::now());
            }

            // Hand the successor its block pointer (or the error). If it
            // was already filled and ready, issuing it is on us.
            let mut continue_with = None;
            if let Some(n) = &nlwb {
                let mut ncore = n.core.lock().unwrap();
                ncore.blk = next_bp;
                ncore.error = error;
                ncore.slog = next_slog;
                ncore.alloc_txg = txg;
                if ncore.state == LwbState::Ready {
                    continue_with = Some(n.clone());
                }
            }
            drop(zl);
            (prev_write_rx, prev_root_rx, continue_with)
        };

        let zilog = self.clone();
        let task_lwb = lwb.clone();
        tokio::spawn(async move {
            zilog
                .lwb_io_task(task_lwb, write_data, bp, priority, prev_write_rx, prev_root_rx)
                .await;
        });

        continue_with
    }

    /// Completion pipeline for one issued lwb: producer children, the block
    /// write, deferred-or-direct vdev flushes, and -- strictly after the
    /// predecessor has completed -- the terminal state transition that
    /// signals the waiters.
    async fn lwb_io_task(
        &self,
        lwb: Arc<Lwb>,
        write_data: Option<Vec<u8>>,
        bp: BlockPtr,
        priority: WritePriority,
        prev_write_rx: Option<tokio::sync::watch::Receiver<crate::lwb::IoStatus>>,
        prev_root_rx: Option<tokio::sync::watch::Receiver<crate::lwb::IoStatus>>,
    ) {
        let spa = self.inner.spa.clone();

        // Producer data blocks (WR_INDIRECT) must be on disk before the
        // log block that points at them is considered written.
        let child_error = lwb.child().wait().await.err();

        let mut write_error = lwb.core.lock().unwrap().error.or(child_error);
        if write_error.is_none() {
            if let Some(data) = write_data {
                write_error = spa.write_block(&bp, data, priority).await.err();
            }
        }

        // When the predecessor defers its flushes to us, our write must
        // not count as complete before its data is down.
        if let Some(mut rx) = prev_write_rx {
            let prev_error = wait_io(&mut rx).await;
            write_error = write_error.or(prev_error);
        }

        // Write-done: decide between flushing our vdevs and deferring them
        // to the successor.
        let flushes: Vec<VdevId> = {
            let zl = self.inner.zl.lock().unwrap();
            let mut core = lwb.core.lock().unwrap();
            assert_eq!(core.state, LwbState::Issued);
            core.state = LwbState::WriteDone;
            assert!(core.buf.is_none());

            // A successor that isn't issued yet never captured a write
            // dependency on us, so deferring to it would race; flush
            // ourselves in that case.
            let pos = zl
                .lwb_list
                .iter()
                .position(|l| Arc::ptr_eq(l, &lwb))
                .expect("completing lwb is on the list");
            let nlwb = zl
                .lwb_list
                .get(pos + 1)
                .filter(|n| n.state() == LwbState::Issued)
                .cloned();

            if write_error.is_some() {
                // No point flushing after the write failed; the error
                // propagates to the waiters either way.
                lwb.take_vdevs();
                Vec::new()
            } else if core.waiters.is_empty() && nlwb.is_some() {
                // Nobody is waiting on this lwb: let the successor issue
                // one flush for both of us.
                drop(core);
                lwb.flush_defer(nlwb.as_ref().unwrap());
                Vec::new()
            } else {
                lwb.take_vdevs().into_iter().collect()
            }
        };
        let _ = lwb.write_done.send(Some(write_error));

        // Flush errors propagate to the waiters along with write errors.
        let mut flush_error = None;
        for vdev in flushes {
            if let Err(e) = spa.flush_vdev(vdev).await {
                warn!("cache flush of {} failed: {:?}", vdev, e);
                flush_error = flush_error.or(Some(e));
            }
        }

        // Completion order is creation order: wait the predecessor out,
        // inheriting its error, before declaring this lwb stable.
        let prev_error = match prev_root_rx {
            Some(mut rx) => wait_io(&mut rx).await,
            None => None,
        };
        let root_error = prev_error.or(write_error).or(flush_error);

        self.flush_vdevs_done(&lwb, root_error);
        let _ = lwb.root_done.send(Some(root_error));
    }

    /// Everything in this lwb is as durable as it is going to get: retire
    /// the itxs, wake the waiters, feed the latency EWMA, and release the
    /// txg inflight count.
    fn flush_vdevs_done(&self, lwb: &Arc<Lwb>, error: Option<ZilError>) {
        let (itxs, waiters, issued_txg) = {
            let mut zl = self.inner.zl.lock().unwrap();
            let mut core = lwb.core.lock().unwrap();

            if let Some(at) = core.issued_at {
                let t = at.elapsed();
                let old = zl.last_lwb_latency;
                zl.last_lwb_latency = (old * 7 + t) / 8;
            }

            assert_eq!(core.state, LwbState::WriteDone);
            core.state = LwbState::FlushDone;

            if zl
                .last_lwb_opened
                .as_ref()
                .map_or(false, |last| Arc::ptr_eq(last, lwb))
            {
                // The whole chain so far has completed; remember the
                // highest durable record seq.
                zl.commit_lr_seq = self.inner.lr_seq.load(std::sync::atomic::Ordering::Relaxed);
            }

            (
                std::mem::take(&mut core.itxs),
                std::mem::take(&mut core.waiters),
                core.issued_txg,
            )
        };

        trace!(
            "lwb {} flush done, {} itxs, {} waiters, error {:?}",
            lwb.id(),
            itxs.len(),
            waiters.len(),
            error
        );

        // Itx callbacks fire here, exactly once.
        drop(itxs);

        for waiter in waiters {
            waiter.signal(error);
        }

        let mut io = self.inner.lwb_io.lock().unwrap();
        assert_gt!(io.inflight[issued_txg.slot()], 0);
        io.inflight[issued_txg.slot()] -= 1;
        let drained = io.inflight[issued_txg.slot()] == 0;
        drop(io);
        if drained {
            self.inner.lwb_io_cv.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::NullGetData;
    use crate::spa::Spa;
    use std::collections::VecDeque;

    fn fresh_issuer(zilog: &Zilog) -> IssuerState {
        IssuerState {
            commit_list: VecDeque::new(),
            cur_size: 0,
            cur_left: 0,
            cur_max: 0,
            parallel: 0,
            prev_min: [0; ZIL_BURSTS],
            prev_opt: [zilog.max_block_size() - *chain::TRAILER_SIZE; ZIL_BURSTS],
            prev_rotor: 0,
        }
    }

    fn test_zilog() -> Zilog {
        Zilog::open(&Spa::new(1, 0), ObjsetId(1), Arc::new(NullGetData))
    }

    #[test]
    fn predictor_converges_on_steady_bursts() {
        let zilog = test_zilog();
        let mut iss = fresh_issuer(&zilog);

        for _ in 0..ZIL_BURSTS {
            iss.cur_size = 16 * 1024;
            iss.cur_max = 512;
            zilog.burst_done(&mut iss);
        }

        // Eight identical bursts fill the whole history; the prediction is
        // exactly the burst size.
        assert_eq!(zilog.lwb_predict(&iss), 16 * 1024);
    }

    #[test]
    fn predictor_ignores_single_spike() {
        let zilog = test_zilog();
        let mut iss = fresh_issuer(&zilog);

        for i in 0..ZIL_BURSTS {
            iss.cur_size = if i == 3 { 96 * 1024 } else { 8 * 1024 };
            iss.cur_max = 512;
            zilog.burst_done(&mut iss);
        }

        // One 96K burst among 8K bursts: serving the spike would cost 12x
        // the space, so the prediction stays at the small size.
        assert_eq!(zilog.lwb_predict(&iss), 8 * 1024);
    }

    #[test]
    fn plan_shapes_by_burst_size() {
        let zilog = test_zilog();
        let iss = fresh_issuer(&zilog);
        let md = zilog.max_log_data(0);

        // Small bursts go out as-is.
        assert_eq!(zilog.lwb_plan(&iss, 4096), (4096, 4096));
        // Huge bursts just use maximum blocks.
        assert_eq!(zilog.lwb_plan(&iss, 9 * md), (md, 0));
        // Medium bursts split roughly evenly.
        let (chunk, min) = zilog.lwb_plan(&iss, 2 * md);
        assert_gt!(chunk, md / 2);
        assert_le!(chunk, md);
        assert_gt!(min, 0);
    }

    #[test]
    fn burst_done_rotates_history() {
        let zilog = test_zilog();
        let mut iss = fresh_issuer(&zilog);

        iss.cur_size = 4096;
        iss.parallel = 2;
        zilog.burst_done(&mut iss);
        assert_eq!(iss.prev_rotor, 1);
        assert_eq!(iss.prev_opt[1], 4096);
        assert_eq!(iss.cur_size, 0);
        assert_eq!(iss.parallel, 1);

        // A pending commit list means the burst isn't over.
        iss.cur_size = 4096;
        iss.commit_list
            .push_back(Itx::new(crate::records::TxType::Setattr, vec![0; 8]));
        zilog.burst_done(&mut iss);
        assert_eq!(iss.prev_rotor, 1);
        assert_eq!(iss.cur_size, 4096);
    }
}

