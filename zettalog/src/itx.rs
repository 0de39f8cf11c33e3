//! In-memory intent transactions and the per-txg store they wait in until
//! a commit drains them into the writer pipeline.

use crate::base_types::*;
use crate::lwb::CommitWaiter;
use crate::records::{self, LrHeader, TxType, WrState, WriteBody, LR_HEADER_SIZE};
use log::*;
use more_asserts::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use util::From64;

/// Per-itx payload handed back to the producer's get_data callback, or the
/// commit waiter for TX_COMMIT itxs.
pub enum ItxPrivate {
    None,
    Waiter(Arc<CommitWaiter>),
    Data(Arc<dyn Any + Send + Sync>),
}

impl Clone for ItxPrivate {
    fn clone(&self) -> Self {
        match self {
            ItxPrivate::None => ItxPrivate::None,
            ItxPrivate::Waiter(w) => ItxPrivate::Waiter(w.clone()),
            ItxPrivate::Data(d) => ItxPrivate::Data(d.clone()),
        }
    }
}

impl std::fmt::Debug for ItxPrivate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItxPrivate::None => write!(f, "None"),
            ItxPrivate::Waiter(_) => write!(f, "Waiter"),
            ItxPrivate::Data(_) => write!(f, "Data"),
        }
    }
}

impl ItxPrivate {
    pub fn as_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        match self {
            ItxPrivate::Data(d) => Some(&**d),
            _ => None,
        }
    }

    pub(crate) fn waiter(&self) -> Option<&Arc<CommitWaiter>> {
        match self {
            ItxPrivate::Waiter(w) => Some(w),
            _ => None,
        }
    }
}

/// A single operation to log. The body is opaque to the core except for
/// TX_WRITE and TX_CLONE_RANGE, which it must interpret to move data.
pub struct Itx {
    pub hdr: LrHeader,
    pub body: Vec<u8>,
    /// Write itxs only.
    pub wr_state: Option<WrState>,
    pub sync: bool,
    /// Owning object, for async bucketing and rename ordering.
    pub oid: ObjectId,
    pub gen: u64,
    pub private: ItxPrivate,
    pub(crate) callback: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Itx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Itx")
            .field("hdr", &self.hdr)
            .field("wr_state", &self.wr_state)
            .field("sync", &self.sync)
            .field("oid", &self.oid)
            .finish()
    }
}

impl Drop for Itx {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

fn pad8(len: u64) -> u64 {
    (len + 7) / 8 * 8
}

impl Itx {
    /// Allocate an itx whose record body is `body` padded to 8 bytes.
    /// Defaults: synchronous, no callback, seq assigned at commit.
    pub fn new(txtype: TxType, mut body: Vec<u8>) -> Itx {
        let padded = pad8(body.len() as u64);
        body.resize(usize::from64(padded), 0);
        Itx {
            hdr: LrHeader {
                txtype: txtype.raw(),
                reclen: LR_HEADER_SIZE + padded,
                txg: Txg(0),
                seq: 0,
            },
            body,
            wr_state: None,
            sync: true,
            oid: ObjectId(0),
            gen: 0,
            private: ItxPrivate::None,
            callback: None,
        }
    }

    pub(crate) fn new_commit(waiter: Arc<CommitWaiter>) -> Itx {
        let mut itx = Itx::new(TxType::Commit, Vec::new());
        itx.private = ItxPrivate::Waiter(waiter);
        itx
    }

    /// Build a TX_WRITE itx. For WR_COPIED the payload is inline and
    /// covered by reclen; otherwise it is fetched from the producer later.
    pub fn new_write(
        foid: ObjectId,
        offset: u64,
        length: u64,
        wr_state: WrState,
        data: Option<&[u8]>,
    ) -> Itx {
        let write_body = WriteBody {
            foid,
            offset,
            length,
            blkoff: 0,
            blkptr: BlockPtr::hole(),
        };
        let mut body = records::encode(&write_body);
        // The payload always starts right after the padded write body, no
        // matter which write state carried it into the block.
        body.resize(usize::from64(pad8(body.len() as u64)), 0);
        if wr_state == WrState::Copied {
            let data = data.expect("WR_COPIED itx carries its payload");
            assert_eq!(data.len() as u64, length);
            body.extend_from_slice(data);
        } else {
            assert!(data.is_none());
        }
        let mut itx = Itx::new(TxType::Write, body);
        itx.wr_state = Some(wr_state);
        itx.oid = foid;
        itx
    }

    pub fn set_callback(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.callback = Some(callback);
    }

    pub fn txtype(&self) -> TxType {
        self.hdr.txtype().unwrap()
    }

    pub fn is_commit(&self) -> bool {
        self.txtype() == TxType::Commit
    }

    pub(crate) fn write_body(&self) -> Option<WriteBody> {
        if self.txtype() == TxType::Write {
            Some(records::decode(&self.body).unwrap())
        } else {
            None
        }
    }

    pub(crate) fn set_write_body(&mut self, wb: &WriteBody) {
        assert_eq!(self.txtype(), TxType::Write);
        records::encode_into(&mut self.body, wb);
    }

    /// Space the record itself takes in a block (commit itxs take none).
    pub(crate) fn record_size(&self) -> u64 {
        if self.is_commit() {
            return 0;
        }
        assert_ge!(self.hdr.reclen, LR_HEADER_SIZE);
        self.hdr.reclen
    }

    /// Payload bytes that will be added to the record at issue time.
    pub(crate) fn data_size(&self) -> u64 {
        if self.txtype() == TxType::Write && self.wr_state == Some(WrState::NeedCopy) {
            pad8(self.write_body().unwrap().length)
        } else {
            0
        }
    }

    pub(crate) fn full_size(&self) -> u64 {
        self.record_size() + self.data_size()
    }

    /// Clone for splitting a WR_NEED_COPY record across blocks. The clone
    /// never carries the callback; it fires once, from the original.
    pub(crate) fn clone_for_split(&self) -> Itx {
        Itx {
            hdr: self.hdr,
            body: self.body.clone(),
            wr_state: self.wr_state,
            sync: self.sync,
            oid: self.oid,
            gen: self.gen,
            private: self.private.clone(),
            callback: None,
        }
    }
}

/// The itxs accumulated for one txg: a sync list ordered by assignment, and
/// per-object async lists.
#[derive(Debug, Default)]
pub struct Itxs {
    pub sync_list: Vec<Itx>,
    pub async_tree: BTreeMap<ObjectId, Vec<Itx>>,
}

#[derive(Debug, Default)]
struct ItxGroupInner {
    txg: Txg,
    itxs: Option<Itxs>,
}

/// One slot of the per-txg ring. An empty slot has txg == 0.
#[derive(Debug, Default)]
pub struct ItxGroup {
    inner: Mutex<ItxGroupInner>,
}

#[derive(Debug, Default)]
pub struct ItxgRing {
    groups: [ItxGroup; TXG_SIZE],
}

impl ItxgRing {
    fn group(&self, txg: Txg) -> &ItxGroup {
        &self.groups[txg.slot()]
    }

    /// Insert an itx for `txg` (the slot key; ZILTEST_TXG when frozen).
    /// `real_txg` is stamped into the record. Returns itxs whose cleanup
    /// was missed and must be freed by the caller.
    pub fn assign(&self, mut itx: Itx, txg: Txg, real_txg: Txg) -> Option<Itxs> {
        let mut inner = self.group(txg).inner.lock().unwrap();
        let mut stale = None;
        if inner.txg != txg || inner.itxs.is_none() {
            if let Some(old) = inner.itxs.take() {
                debug!("missed itx cleanup for txg {}", inner.txg);
                stale = Some(old);
            }
            inner.txg = txg;
            inner.itxs = Some(Itxs::default());
        }
        itx.hdr.txg = real_txg;
        let sync = itx.sync;
        let oid = itx.oid;
        let itxs = inner.itxs.as_mut().unwrap();
        if sync {
            itxs.sync_list.push(itx);
        } else {
            itxs.async_tree.entry(oid).or_default().push(itx);
        }
        stale
    }

    /// Move async itxs into the sync lists: those of `foid`, or all of them
    /// when foid is 0. Appended at the tail so creates stay ordered first.
    pub fn async_to_sync(&self, otxg: Txg, foid: ObjectId) {
        for txg in otxg.0..otxg.0 + TXG_CONCURRENT_STATES {
            let txg = Txg(txg);
            let mut inner = self.group(txg).inner.lock().unwrap();
            if inner.txg != txg || inner.itxs.is_none() {
                continue;
            }
            let itxs = inner.itxs.as_mut().unwrap();
            if foid != ObjectId(0) {
                if let Some(list) = itxs.async_tree.remove(&foid) {
                    itxs.sync_list.extend(list);
                }
            } else {
                let tree = std::mem::take(&mut itxs.async_tree);
                for (_oid, list) in tree {
                    itxs.sync_list.extend(list);
                }
            }
        }
    }

    /// Drop all pending async itxs for an object whose id may be reused.
    pub fn remove_async(&self, otxg: Txg, oid: ObjectId) -> Vec<Itx> {
        assert_ne!(oid, ObjectId(0));
        let mut clean_list = Vec::new();
        for txg in otxg.0..otxg.0 + TXG_CONCURRENT_STATES {
            let txg = Txg(txg);
            let mut inner = self.group(txg).inner.lock().unwrap();
            if inner.txg != txg || inner.itxs.is_none() {
                continue;
            }
            if let Some(list) = inner.itxs.as_mut().unwrap().async_tree.remove(&oid) {
                clean_list.extend(list);
            }
        }
        clean_list
    }

    /// Take the sync list for `txg` if the slot currently owns that txg.
    pub fn splice_sync(&self, txg: Txg) -> Option<Vec<Itx>> {
        let mut inner = self.group(txg).inner.lock().unwrap();
        if inner.txg != txg || inner.itxs.is_none() {
            return None;
        }
        Some(std::mem::take(&mut inner.itxs.as_mut().unwrap().sync_list))
    }

    pub fn sync_nonempty(&self, txg: Txg) -> bool {
        let inner = self.group(txg).inner.lock().unwrap();
        inner.txg == txg
            && inner
                .itxs
                .as_ref()
                .map_or(false, |itxs| !itxs.sync_list.is_empty())
    }

    /// Detach the itxs of a synced txg for freeing. ZILTEST itxs are never
    /// cleaned this way.
    pub fn clean(&self, synced_txg: Txg) -> Option<Itxs> {
        let group = &self.groups[synced_txg.slot()];
        let mut inner = group.inner.lock().unwrap();
        if inner.itxs.is_none() || inner.txg == ZILTEST_TXG {
            return None;
        }
        assert_le!(inner.txg, synced_txg);
        assert_ne!(inner.txg, Txg(0));
        inner.txg = Txg(0);
        inner.itxs.take()
    }

    /// Detach everything; used when tearing the log down.
    pub fn clean_all(&self) -> Vec<Itxs> {
        self.groups
            .iter()
            .filter_map(|group| {
                let mut inner = group.inner.lock().unwrap();
                inner.txg = Txg(0);
                inner.itxs.take()
            })
            .collect()
    }
}

/// Free a detached set of itxs. Commit itxs can legitimately still be here
/// if spa_sync beat the writer to them; their waiters are marked skipped so
/// the committing threads make progress.
pub(crate) fn destroy_itxs(itxs: Itxs) {
    for itx in itxs.sync_list {
        if itx.is_commit() {
            if let Some(waiter) = itx.private.waiter() {
                waiter.skip();
            }
        }
        drop(itx);
    }
    for (_oid, list) in itxs.async_tree {
        for itx in list {
            // Commit itxs are never async.
            assert_ne!(itx.txtype(), TxType::Commit);
            drop(itx);
        }
    }
}
