//! Import-time handling of on-disk chains: the parse visitors that
//! reserve (claim), erase (clear), and release (free) chain blocks, and
//! the claim/check passes built on them.

use crate::base_types::*;
use crate::chain::{self, BpSet, ParseVisitor};
use crate::records::{self, CloneRangeBody, LrHeader, TxType, WriteBody, LR_HEADER_SIZE, WRITE_RECORD_SIZE};
use crate::spa::{LogState, Spa};
use async_trait::async_trait;
use log::*;
use more_asserts::*;
use util::From64;

/// Erases a chain that is invalid after a checkpoint rewind (or when the
/// pool was told to discard logs).
pub(crate) struct ClearVisitor {
    spa: Spa,
}

#[async_trait]
impl ParseVisitor for ClearVisitor {
    async fn block(&mut self, bps: &mut BpSet, bp: &BlockPtr, first_txg: Txg) -> Result<()> {
        assert!(!bp.is_hole());

        // Blocks born after the txg we rewound to may have had their
        // locations reused; stop the walk rather than read them.
        if bp.birth >= first_txg {
            return Err(ZilError::Invalid);
        }

        if bps.add(bp).is_ok() {
            self.spa.free_block(first_txg, bp);
        }
        Ok(())
    }

    async fn record(
        &mut self,
        _bps: &mut BpSet,
        _hdr: &LrHeader,
        _record: &[u8],
        _first_txg: Txg,
    ) -> Result<()> {
        Ok(())
    }
}

/// Speculatively reserves every block of a chain (and the data blocks its
/// indirect write records point to) so the allocator cannot reuse them
/// before replay decides their fate. With `tx == None` it only verifies
/// that claiming would succeed.
pub(crate) struct ClaimVisitor {
    spa: Spa,
    tx: Option<Txg>,
}

impl ClaimVisitor {
    fn claim_block(&self, bps: &mut BpSet, bp: &BlockPtr, first_txg: Txg) -> Result<()> {
        // Skip blocks already committed before this pool generation, and
        // blocks this parse already claimed.
        if bp.is_hole() || bp.birth < first_txg || bps.add(bp).is_err() {
            return Ok(());
        }
        self.spa.claim_block(self.tx, bp)
    }

    async fn claim_write(
        &mut self,
        bps: &mut BpSet,
        hdr: &LrHeader,
        record: &[u8],
        first_txg: Txg,
    ) -> Result<()> {
        assert_ge!(hdr.reclen, *WRITE_RECORD_SIZE);
        let wb: WriteBody = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;

        // If the data block is not readable, don't claim anything further.
        // This happens legitimately when a log block reached disk before
        // the dmu-synced blocks it points to; no one can have been told
        // that data was durable, so this is the end of the log.
        if wb.blkptr.birth >= first_txg {
            self.spa.read_block(&wb.blkptr).await?;
        }

        self.claim_block(bps, &wb.blkptr, first_txg)
    }

    fn claim_clone_range(&mut self, record: &[u8], first_txg: Txg) -> Result<()> {
        let body: CloneRangeBody = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;

        if self.tx.is_none() {
            return Ok(());
        }

        for bp in &body.bps {
            if bp.is_hole() {
                continue;
            }
            // A pointer from the future is not yet allocated; something is
            // wrong, stop before the pool gets corrupted.
            if bp.birth >= first_txg {
                return Err(ZilError::NotFound);
            }
        }

        for bp in &body.bps {
            if !bp.is_hole() {
                self.spa.brt_pending_add(bp);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ParseVisitor for ClaimVisitor {
    async fn block(&mut self, bps: &mut BpSet, bp: &BlockPtr, first_txg: Txg) -> Result<()> {
        self.claim_block(bps, bp, first_txg)
    }

    async fn record(
        &mut self,
        bps: &mut BpSet,
        hdr: &LrHeader,
        record: &[u8],
        first_txg: Txg,
    ) -> Result<()> {
        match hdr.txtype() {
            Ok(TxType::Write) => self.claim_write(bps, hdr, record, first_txg).await,
            Ok(TxType::CloneRange) => self.claim_clone_range(record, first_txg),
            _ => Ok(()),
        }
    }
}

/// Releases a (claimed) chain: every chain block, plus the data blocks its
/// records reference, go back to the allocator.
pub(crate) struct FreeVisitor {
    spa: Spa,
    /// Txg the frees are charged to.
    txg: Txg,
}

impl FreeVisitor {
    pub(crate) fn new(spa: Spa, txg: Txg) -> FreeVisitor {
        FreeVisitor { spa, txg }
    }
}

#[async_trait]
impl ParseVisitor for FreeVisitor {
    async fn block(&mut self, _bps: &mut BpSet, bp: &BlockPtr, _claim_txg: Txg) -> Result<()> {
        self.spa.free_block(self.txg, bp);
        Ok(())
    }

    async fn record(
        &mut self,
        bps: &mut BpSet,
        hdr: &LrHeader,
        record: &[u8],
        claim_txg: Txg,
    ) -> Result<()> {
        // An unclaimed chain owns no record data.
        if claim_txg == Txg(0) {
            return Ok(());
        }
        match hdr.txtype() {
            Ok(TxType::Write) => {
                let wb: WriteBody = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;
                // Free only what claim reserved.
                if !wb.blkptr.is_hole()
                    && wb.blkptr.birth >= claim_txg
                    && bps.add(&wb.blkptr).is_ok()
                {
                    self.spa.free_block(self.txg, &wb.blkptr);
                }
                Ok(())
            }
            Ok(TxType::CloneRange) => {
                let body: CloneRangeBody =
                    records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;
                for bp in &body.bps {
                    if !bp.is_hole() {
                        self.spa.free_block(self.txg, bp);
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Import-time claim of a dataset's chain. Called for every dataset
/// reachable at import, in the pool's first txg.
pub async fn claim(spa: &Spa, os: ObjsetId) -> Result<()> {
    let mut header = spa.zil_header(os);
    let first_txg = spa.min_claim_txg();

    // A checkpointed uberblock with an unclaimed header means we rewound
    // (or crashed mid-rewind): the chain's blocks may have been reused
    // since the checkpoint, so erase rather than claim. Chains claimed
    // before the checkpoint stay; clearing those would leak their space.
    if spa.log_state() == LogState::Clear || (spa.checkpointed() && header.claim_txg == Txg(0)) {
        if !header.log.is_hole() {
            info!("{}: clearing intent log chain", os);
            let mut visitor = ClearVisitor { spa: spa.clone() };
            chain::parse(spa, &header, &mut visitor, first_txg, false).await;
        }
        spa.set_zil_header(os, ZilHeaderPhys::default());
        return Ok(());
    }

    // Claim all log blocks if we haven't already, and remember the highest
    // claimed sequence numbers. If only part of the chain is readable now
    // (say a device is missing) but all of it later, we must not replay or
    // destroy past the last block claimed here.
    assert_le!(header.claim_txg, first_txg);
    if header.claim_txg == Txg(0) && !header.log.is_hole() {
        let mut visitor = ClaimVisitor {
            spa: spa.clone(),
            tx: Some(first_txg),
        };
        let result = chain::parse(spa, &header, &mut visitor, first_txg, false).await;
        header.claim_txg = first_txg;
        header.claim_blk_seq = result.max_blk_seq;
        header.claim_lr_seq = result.max_lr_seq;
        if result.lr_count > 0 || result.blk_count > 1 {
            header.replay_needed = true;
        }
        header.claim_lr_seq_valid = true;
        info!(
            "{}: claimed {} blocks / {} records, replay_needed={}",
            os, result.blk_count, result.lr_count, header.replay_needed
        );
        spa.set_zil_header(os, header);
    }

    assert_eq!(first_txg, spa.last_synced_txg().next());
    Ok(())
}

/// Walk the chain without claiming, to verify it is intact. Checksum
/// errors are fine (they are the end of the chain); any other error means
/// a device problem the import should know about.
pub async fn check_log_chain(spa: &Spa, os: ObjsetId) -> Result<()> {
    let header = spa.zil_header(os);

    if !header.log.is_hole() {
        // A rewind with an unclaimed header: the chain belongs to the
        // pre-rewind pool state; nothing to verify.
        if spa.checkpointed() && header.claim_txg == Txg(0) {
            return Ok(());
        }
    }

    let first_txg = if header.claim_txg != Txg(0) {
        Txg(u64::MAX)
    } else {
        spa.min_claim_txg()
    };
    let mut visitor = ClaimVisitor {
        spa: spa.clone(),
        tx: None,
    };
    let result = chain::parse(spa, &header, &mut visitor, first_txg, false).await;
    result.io_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::seal_block;
    use crate::records::LrHeader;
    use crate::spa::WritePriority;

    const OS: ObjsetId = ObjsetId(9);

    /// Hand-build a one-block chain holding the given records and point
    /// the dataset header at it.
    async fn install_chain(spa: &Spa, records_bytes: &[u8]) -> BlockPtr {
        let txg = spa.open_txg();
        let (mut bp, _slog) = spa.alloc_log_block(txg, ZIL_MIN_BLKSZ).unwrap();
        bp.seed = chain::init_chain_seed(OS);

        let mut buf = vec![0u8; usize::from64(ZIL_MIN_BLKSZ)];
        let start = usize::from64(*chain::TRAILER_SIZE);
        buf[start..start + records_bytes.len()].copy_from_slice(records_bytes);
        let mut next = BlockPtr::hole();
        next.seed = bp.seed.advance();
        seal_block(
            &mut buf,
            bp.kind,
            *chain::TRAILER_SIZE + records_bytes.len() as u64,
            next,
        );
        spa.write_block(&bp, buf, WritePriority::SyncWrite)
            .await
            .unwrap();
        spa.flush_vdev(bp.vdev).await.unwrap();

        let header = ZilHeaderPhys {
            log: bp,
            ..Default::default()
        };
        spa.set_zil_header(OS, header);
        bp
    }

    fn clone_range_record(seq: u64, txg: Txg, bps: Vec<BlockPtr>) -> Vec<u8> {
        let body = records::encode(&CloneRangeBody {
            foid: ObjectId(7),
            offset: 0,
            length: 4096,
            bps,
        });
        let padded = (body.len() as u64 + 7) / 8 * 8;
        let hdr = LrHeader {
            txtype: TxType::CloneRange.raw(),
            reclen: LR_HEADER_SIZE + padded,
            txg,
            seq,
        };
        let mut record = records::encode(&hdr);
        record.extend_from_slice(&body);
        record.resize(usize::from64(LR_HEADER_SIZE + padded), 0);
        record
    }

    #[tokio::test]
    async fn claim_registers_clone_range_references() {
        let spa = Spa::new(1, 0);
        // A data block committed before this pool generation.
        let (data_bp, _) = spa.alloc_log_block(Txg(1), ZIL_MIN_BLKSZ).unwrap();

        let record = clone_range_record(1, spa.open_txg(), vec![data_bp]);
        install_chain(&spa, &record).await;

        claim(&spa, OS).await.unwrap();

        let header = spa.zil_header(OS);
        assert_eq!(header.claim_txg, spa.min_claim_txg());
        assert!(header.replay_needed);
        assert_eq!(header.claim_lr_seq, 1);
        assert_eq!(spa.brt_refs(&data_bp), 1);
    }

    #[tokio::test]
    async fn clone_range_pointing_at_the_future_stops_the_claim() {
        let spa = Spa::new(1, 0);
        let (future_bp, _) = spa.alloc_log_block(Txg(1000), ZIL_MIN_BLKSZ).unwrap();

        let record = clone_range_record(1, spa.open_txg(), vec![future_bp]);
        install_chain(&spa, &record).await;

        claim(&spa, OS).await.unwrap();

        // The record was rejected; nothing referenced, no record claimed.
        let header = spa.zil_header(OS);
        assert_eq!(header.claim_lr_seq, 0);
        assert_eq!(spa.brt_refs(&future_bp), 0);
    }

    #[tokio::test]
    async fn check_log_chain_accepts_intact_and_broken_chains() {
        let spa = Spa::new(1, 0);
        let bp = install_chain(&spa, &[]).await;
        check_log_chain(&spa, OS).await.unwrap();

        // A snapped chain is still fine: checksum failure is the normal
        // end-of-chain signal.
        spa.corrupt_block(&bp);
        check_log_chain(&spa, OS).await.unwrap();
    }
}

