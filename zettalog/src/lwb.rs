//! Log write blocks: the unit of the on-disk chain, a buffer plus the state
//! machine that carries it from open to flushed, and the commit waiters
//! that sleep on it.

use crate::base_types::*;
use crate::itx::Itx;
use crate::records::ChildIo;
use lazy_static::lazy_static;
use log::*;
use more_asserts::*;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, Notify};
use util::get_tunable;
use util::From64;

lazy_static! {
    /// Skip vdev cache flushes entirely. Durability hazard on devices with
    /// volatile caches.
    pub static ref NOCACHEFLUSH: bool = get_tunable("zil_nocacheflush", false);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LwbState {
    New,
    Opened,
    Closed,
    Ready,
    Issued,
    WriteDone,
    FlushDone,
}

/// Completion status published on an lwb's write/root watches: None until
/// the event happens, then Some(first error observed, if any).
pub type IoStatus = Option<Option<ZilError>>;

pub(crate) struct LwbCore {
    pub state: LwbState,
    pub blk: BlockPtr,
    pub slim: bool,
    pub slog: bool,
    /// Allocation error inherited from the predecessor's issue.
    pub error: Option<ZilError>,
    pub sz: u64,
    pub nmax: u64,
    pub nused: u64,
    pub nfilled: u64,
    pub buf: Option<Vec<u8>>,
    pub itxs: Vec<Itx>,
    pub waiters: Vec<Arc<CommitWaiter>>,
    pub alloc_txg: Txg,
    pub max_txg: Txg,
    pub issued_txg: Txg,
    pub issued_at: Option<Instant>,
    /// Snapshot of the burst size at close time, for write priority.
    pub burst_size: u64,
}

pub struct Lwb {
    id: u64,
    pub(crate) core: Mutex<LwbCore>,
    /// Vdevs whose caches must be flushed before this lwb is durable.
    vdevs: Mutex<BTreeSet<VdevId>>,
    /// Data-block writes created by the producer for WR_INDIRECT records;
    /// the lwb's own write is not done until these are.
    pub(crate) child: ChildIo,
    pub(crate) write_done: watch::Sender<IoStatus>,
    pub(crate) root_done: watch::Sender<IoStatus>,
}

impl std::fmt::Debug for Lwb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock().unwrap();
        f.debug_struct("Lwb")
            .field("id", &self.id)
            .field("state", &core.state)
            .field("blk", &core.blk)
            .field("nused", &core.nused)
            .field("nmax", &core.nmax)
            .finish()
    }
}

impl Lwb {
    /// We may already have a block pointer, in which case size and layout
    /// come from there. Or we may not yet, in which case we choose them
    /// here and later make the block allocation match.
    pub(crate) fn new(
        id: u64,
        bp: Option<BlockPtr>,
        mut sz: u64,
        slim_default: bool,
        slog: bool,
        alloc_txg: Txg,
        state: LwbState,
    ) -> Arc<Lwb> {
        let (blk, slim) = match bp {
            Some(bp) => {
                sz = bp.size;
                (bp, bp.kind == ChainKind::Slim)
            }
            None => (BlockPtr::hole(), slim_default),
        };
        let trailer = *crate::chain::TRAILER_SIZE;
        let (nmax, nused) = if slim {
            (sz, trailer)
        } else {
            (sz - trailer, 0)
        };
        let (write_done, _) = watch::channel(None);
        let (root_done, _) = watch::channel(None);
        Arc::new(Lwb {
            id,
            core: Mutex::new(LwbCore {
                state,
                blk,
                slim,
                slog,
                error: None,
                sz,
                nmax,
                nused,
                nfilled: nused,
                buf: Some(vec![0; usize::from64(sz)]),
                itxs: Vec::new(),
                waiters: Vec::new(),
                alloc_txg,
                max_txg: Txg(0),
                issued_txg: Txg(0),
                issued_at: None,
                burst_size: 0,
            }),
            vdevs: Mutex::new(BTreeSet::new()),
            child: ChildIo::default(),
            write_done,
            root_done,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> LwbState {
        self.core.lock().unwrap().state
    }

    pub fn blk(&self) -> BlockPtr {
        self.core.lock().unwrap().blk
    }

    /// Data-block writes for WR_INDIRECT records are registered here by the
    /// producer; the lwb's write completes only after they do.
    pub fn child(&self) -> &ChildIo {
        &self.child
    }

    /// Record a vdev written to on behalf of this lwb.
    pub fn add_vdev(&self, vdev: VdevId) {
        let core = self.core.lock().unwrap();
        assert_lt!(core.state, LwbState::WriteDone);
        drop(core);
        if *NOCACHEFLUSH {
            return;
        }
        self.vdevs.lock().unwrap().insert(vdev);
    }

    pub(crate) fn take_vdevs(&self) -> BTreeSet<VdevId> {
        std::mem::take(&mut *self.vdevs.lock().unwrap())
    }

    /// Merge this lwb's flush obligations into its successor, which will
    /// issue the flushes after its own write.
    pub(crate) fn flush_defer(&self, next: &Lwb) {
        let mine = self.take_vdevs();
        if mine.is_empty() {
            return;
        }
        trace!("lwb {} deferring flush of {:?} to lwb {}", self.id, mine, next.id);
        next.vdevs.lock().unwrap().extend(mine);
    }

    pub(crate) fn add_txg(&self, txg: Txg) {
        let mut core = self.core.lock().unwrap();
        core.max_txg = std::cmp::max(core.max_txg, txg);
    }

    pub(crate) fn subscribe_write_done(&self) -> watch::Receiver<IoStatus> {
        self.write_done.subscribe()
    }

    pub(crate) fn subscribe_root_done(&self) -> watch::Receiver<IoStatus> {
        self.root_done.subscribe()
    }
}

pub(crate) async fn wait_io(rx: &mut watch::Receiver<IoStatus>) -> Option<ZilError> {
    loop {
        if let Some(status) = *rx.borrow() {
            return status;
        }
        if rx.changed().await.is_err() {
            // The sender is gone without completing; whatever it last
            // published stands, and silence counts as an i/o error.
            return (*rx.borrow()).unwrap_or(Some(ZilError::Io));
        }
    }
}

#[derive(Debug, Default)]
struct WaiterState {
    lwb: Option<Arc<Lwb>>,
    done: bool,
    error: Option<ZilError>,
}

/// Blocking handle a committing thread sleeps on until the lwb carrying its
/// commit itx is stable on disk. Created by `commit`, freed when `commit`
/// returns.
#[derive(Default)]
pub struct CommitWaiter {
    state: Mutex<WaiterState>,
    pub(crate) cv: Notify,
}

impl std::fmt::Debug for CommitWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CommitWaiter")
            .field("done", &state.done)
            .field("error", &state.error)
            .field("linked", &state.lwb.as_ref().map(|l| l.id()))
            .finish()
    }
}

impl CommitWaiter {
    pub fn new() -> Arc<CommitWaiter> {
        Default::default()
    }

    pub fn done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    pub fn error(&self) -> Option<ZilError> {
        self.state.lock().unwrap().error
    }

    pub(crate) fn linked_lwb(&self) -> Option<Arc<Lwb>> {
        self.state.lock().unwrap().lwb.clone()
    }

    /// Link this waiter to the lwb that will make its itx durable. From
    /// here the waiter is referenced by the lwb rather than the commit itx.
    pub(crate) fn link_lwb(self: &Arc<CommitWaiter>, lwb: &Arc<Lwb>) {
        let mut core = lwb.core.lock().unwrap();
        assert_ne!(core.state, LwbState::New);
        assert_ne!(core.state, LwbState::FlushDone);
        core.waiters.push(self.clone());
        drop(core);

        let mut state = self.state.lock().unwrap();
        assert!(state.lwb.is_none());
        state.lwb = Some(lwb.clone());
    }

    /// Mark done without ever having been attached to a completed lwb;
    /// used when the itx was committed by the main pool instead.
    pub(crate) fn skip(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.done);
        state.done = true;
        drop(state);
        self.cv.notify_waiters();
    }

    /// Completion: record the error observed by the lwb's root i/o and wake
    /// the committing thread.
    pub(crate) fn signal(&self, error: Option<ZilError>) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.done);
        state.lwb = None;
        state.error = error;
        state.done = true;
        drop(state);
        self.cv.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_accounting_by_layout() {
        let trailer = *crate::chain::TRAILER_SIZE;
        let slim = Lwb::new(1, None, ZIL_MIN_BLKSZ, true, false, Txg(0), LwbState::New);
        {
            let core = slim.core.lock().unwrap();
            assert_eq!(core.nmax, ZIL_MIN_BLKSZ);
            assert_eq!(core.nused, trailer);
            assert_eq!(core.nfilled, trailer);
        }
        let legacy = Lwb::new(2, None, ZIL_MIN_BLKSZ, false, false, Txg(0), LwbState::New);
        {
            let core = legacy.core.lock().unwrap();
            assert_eq!(core.nmax, ZIL_MIN_BLKSZ - trailer);
            assert_eq!(core.nused, 0);
        }
    }

    #[test]
    fn flush_defer_merges_vdev_sets() {
        let a = Lwb::new(1, None, ZIL_MIN_BLKSZ, true, false, Txg(0), LwbState::New);
        let b = Lwb::new(2, None, ZIL_MIN_BLKSZ, true, false, Txg(0), LwbState::New);
        a.add_vdev(VdevId(0));
        a.add_vdev(VdevId(1));
        b.add_vdev(VdevId(1));
        a.flush_defer(&b);
        assert!(a.take_vdevs().is_empty());
        assert_eq!(
            b.take_vdevs().into_iter().collect::<Vec<_>>(),
            vec![VdevId(0), VdevId(1)]
        );
    }
}
