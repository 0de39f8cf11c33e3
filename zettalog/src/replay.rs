//! Post-claim replay: walk the claimed chain and re-apply each record
//! through the caller's replay vector, then destroy the chain.

use crate::base_types::*;
use crate::chain::{self, BpSet, ParseVisitor};
use crate::records::{self, GetData, LrHeader, ReplayOps, TxType, WriteBody, LR_HEADER_SIZE, WRITE_RECORD_SIZE};
use crate::zilog::{Zilog, REPLAY_DISABLE};
use async_trait::async_trait;
use log::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use util::From64;

/// get_data stub for logs opened only to claim, replay, or destroy; those
/// paths never fetch write payloads.
pub struct NullGetData;

#[async_trait]
impl GetData for NullGetData {
    async fn get_data(
        &self,
        _private: Option<&(dyn std::any::Any + Send + Sync)>,
        _gen: u64,
        _lr: &mut WriteBody,
        _wbuf: Option<&mut [u8]>,
        _lwb: &crate::lwb::Lwb,
    ) -> Result<()> {
        Err(ZilError::Io)
    }
}

struct ReplayVisitor {
    zilog: Zilog,
    ops: Arc<dyn ReplayOps>,
    scratch: Vec<u8>,
}

impl ReplayVisitor {
    fn replay_error(&self, hdr: &LrHeader, error: ZilError) -> Result<()> {
        // We did not actually replay this one.
        self.zilog
            .inner
            .replaying_seq
            .fetch_sub(1, Ordering::Release);
        warn!(
            "replay error {:?}, {} seq {:#x} txtype {}{}",
            error,
            self.zilog.objset(),
            hdr.seq,
            hdr.txtype & !records::TX_CI,
            if hdr.txtype & records::TX_CI != 0 { " CI" } else { "" },
        );
        Err(error)
    }
}

#[async_trait]
impl ParseVisitor for ReplayVisitor {
    async fn block(&mut self, _bps: &mut BpSet, _bp: &BlockPtr, _claim_txg: Txg) -> Result<()> {
        self.zilog.inner.replay_blks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn record(
        &mut self,
        _bps: &mut BpSet,
        hdr: &LrHeader,
        record: &[u8],
        claim_txg: Txg,
    ) -> Result<()> {
        let header = self.zilog.header();
        self.zilog
            .inner
            .replaying_seq
            .store(hdr.seq, Ordering::Release);

        if hdr.seq <= header.replay_seq {
            // Already replayed before a previous interruption.
            return Ok(());
        }
        if hdr.txg < claim_txg {
            // Already committed to the main pool.
            return Ok(());
        }

        // The case-insensitivity bit may still be set in the stored type.
        let txtype = match hdr.txtype() {
            Ok(t) if t != TxType::Commit => t,
            _ => return self.replay_error(hdr, ZilError::Invalid),
        };

        // Types that can be logged out of order may legitimately name an
        // object that no longer exists.
        if self.ops.out_of_order_mask() & (1 << txtype.raw()) != 0 {
            let foid = records::record_foid(&record[usize::from64(LR_HEADER_SIZE)..])?;
            if !self.ops.object_exists(foid).await {
                return Ok(());
            }
        }

        // Copy the record so it can be revised and extended.
        self.scratch.clear();
        self.scratch.extend_from_slice(record);

        // An indirect write carries only a pointer; suck the data in.
        if txtype == TxType::Write && hdr.reclen == *WRITE_RECORD_SIZE {
            let wb: WriteBody = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;
            match chain::read_log_data(self.zilog.spa(), &wb.blkptr, wb.length).await {
                Ok(data) => {
                    let len = std::cmp::min(data.len(), usize::from64(wb.length));
                    self.scratch.extend_from_slice(&data[..len]);
                    self.scratch.resize(
                        usize::from64(hdr.reclen + wb.length),
                        0,
                    );
                }
                Err(e) => return self.replay_error(hdr, e),
            }
        }

        // This crate's chains are defined little-endian, so the stored
        // record never needs swapping before dispatch.
        let byteswap = false;
        if let Err(first) = self.ops.replay(txtype, &self.scratch, byteswap).await {
            // The dnode layer doesn't see removes until their txg commits,
            // so a replay can spuriously collide with a dying object. Sync
            // out the removes and retry once.
            self.zilog.spa().txg_wait_synced(Txg(0)).await;
            if self.ops.replay(txtype, &self.scratch, false).await.is_err() {
                return self.replay_error(hdr, first);
            }
        }
        Ok(())
    }
}

impl Zilog {
    /// If this dataset has a non-empty intent log, replay it and destroy
    /// it. Returns whether there were any entries to replay.
    pub async fn replay(&self, ops: Arc<dyn ReplayOps>) -> bool {
        let header = self.header();
        if !header.replay_needed {
            return self.destroy(true).await;
        }

        if *REPLAY_DISABLE {
            warn!("{}: replay disabled; discarding intent log", self.objset());
            let destroyed = self.destroy(false).await;
            let destroy_txg = self.inner.zl.lock().unwrap().destroy_txg;
            self.inner.spa.txg_wait_synced(destroy_txg).await;
            return destroyed;
        }

        // Let in-progress removes settle before applying anything.
        self.inner.spa.txg_wait_synced(Txg(0)).await;

        info!("{}: starting replay at seq {:#x}", self.objset(), header.replay_seq);
        self.inner.replaying.store(true, Ordering::Release);
        self.inner.replay_blks.store(0, Ordering::Relaxed);

        let mut visitor = ReplayVisitor {
            zilog: self.clone(),
            ops,
            scratch: Vec::with_capacity(usize::from64(2 * self.max_block_size())),
        };
        let result = chain::parse(
            &self.inner.spa,
            &header,
            &mut visitor,
            header.claim_txg,
            true,
        )
        .await;
        info!(
            "{}: replay applied {} records from {} blocks (stopped: {:?})",
            self.objset(),
            result.lr_count,
            result.blk_count,
            result.error
        );

        self.destroy(false).await;
        let destroy_txg = self.inner.zl.lock().unwrap().destroy_txg;
        self.inner.spa.txg_wait_synced(destroy_txg).await;
        self.inner.replaying.store(false, Ordering::Release);

        true
    }
}
