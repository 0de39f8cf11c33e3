//! Pool-side collaborators of the log core: a vdev-backed block store with
//! volatile write caches, a log-block allocator, transaction-group state,
//! and the inline sync machinery that drives per-dataset sync/clean hooks.
//!
//! Vdevs model a disk with a volatile write cache: writes land in the cache,
//! an explicit flush makes them stable, and a crash discards whatever was
//! not flushed. This is exactly the failure surface the log exists to
//! manage, so recovery tests exercise it directly.

use crate::base_types::*;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::*;
use more_asserts::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use util::get_tunable;
use util::FailInjector;
use util::From64;

lazy_static! {
    static ref VDEV_SIZE: u64 = get_tunable("vdev_size", 64 * 1024 * 1024);
    /// How long a txg stays open with no one asking for a sync.
    static ref TXG_TIMEOUT_MS: u64 = get_tunable("zfs_txg_timeout_ms", 5000);
}

/// Per-dataset hooks invoked while a txg is syncing. The log registers
/// itself here so its on-disk header is updated and its in-memory itx
/// groups are reclaimed in txg order.
#[async_trait]
pub trait TxgHook: Send + Sync {
    async fn sync(&self, txg: Txg);
    async fn clean(&self, txg: Txg);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Normal,
    /// Import was told to discard intent logs; claim erases chains.
    Clear,
}

/// Scheduling class for a log write. The in-memory store completes writes
/// immediately either way; the class is recorded for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePriority {
    SyncWrite,
    AsyncWrite,
}

#[derive(Debug, Default)]
struct VdevStore {
    /// Written but possibly still in the device's volatile cache.
    cache: BTreeMap<u64, Vec<u8>>,
    /// Survives power loss.
    stable: BTreeMap<u64, Vec<u8>>,
}

#[derive(Debug)]
struct Vdev {
    id: VdevId,
    is_slog: bool,
    size: u64,
    store: Mutex<VdevStore>,
}

impl Vdev {
    fn read(&self, offset: u64) -> Option<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .cache
            .get(&offset)
            .or_else(|| store.stable.get(&offset))
            .cloned()
    }

    fn write(&self, offset: u64, data: Vec<u8>) {
        assert_le!(offset + data.len() as u64, self.size);
        self.store.lock().unwrap().cache.insert(offset, data);
    }

    fn flush(&self) {
        let mut store = self.store.lock().unwrap();
        let cached = std::mem::take(&mut store.cache);
        for (offset, data) in cached {
            store.stable.insert(offset, data);
        }
    }
}

#[derive(Debug, Default)]
struct AllocState {
    /// Bump pointer per vdev.
    next: HashMap<VdevId, u64>,
    /// Freed extents available for reuse, (vdev, offset) -> size.
    freed: BTreeMap<(VdevId, u64), u64>,
}

#[derive(Debug)]
struct TxgState {
    open: Txg,
    syncing: Option<Txg>,
    /// Open transaction handles per txg slot; sync waits for its slot to
    /// drain before running dataset hooks.
    open_count: [u64; TXG_SIZE],
    freeze_txg: Txg,
}

/// The storage pool the log writes into. Cheaply cloneable handle.
#[derive(Clone)]
pub struct Spa {
    inner: Arc<SpaInner>,
}

impl std::ops::Deref for Spa {
    type Target = SpaInner;
    fn deref(&self) -> &SpaInner {
        &self.inner
    }
}

pub struct SpaInner {
    vdevs: Vec<Vdev>,
    slim: bool,
    writable: bool,
    alloc: Mutex<AllocState>,
    txg: Mutex<TxgState>,
    tx_drained: Notify,
    synced_tx: watch::Sender<Txg>,
    synced_rx: watch::Receiver<Txg>,
    sync_lock: tokio::sync::Mutex<()>,
    datasets: Mutex<Vec<Arc<dyn TxgHook>>>,
    headers: Mutex<HashMap<ObjsetId, ZilHeaderPhys>>,
    claimed: Mutex<HashSet<DiskLocation>>,
    /// Block-reference tracker for cloned ranges.
    brt: Mutex<HashMap<DiskLocation, u64>>,
    log_state: Mutex<LogState>,
    checkpointed: bool,
    first_txg: Txg,
    has_special: std::sync::atomic::AtomicBool,
    /// objset -> key loaded, present only for encrypted datasets.
    encryption: Mutex<HashMap<ObjsetId, bool>>,
    pub injector: FailInjector,
}

/// An open transaction handle; holds its txg open until dropped.
pub struct Tx {
    spa: Arc<SpaInner>,
    txg: Txg,
}

impl Tx {
    pub fn txg(&self) -> Txg {
        self.txg
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        let mut txg = self.spa.txg.lock().unwrap();
        let slot = self.txg.slot();
        assert_gt!(txg.open_count[slot], 0);
        txg.open_count[slot] -= 1;
        if txg.open_count[slot] == 0 {
            self.spa.tx_drained.notify_waiters();
        }
    }
}

impl Spa {
    pub fn new(num_main: usize, num_slog: usize) -> Spa {
        Spa::create(num_main, num_slog, true)
    }

    /// A pool that predates the slim block layout.
    pub fn new_legacy(num_main: usize, num_slog: usize) -> Spa {
        Spa::create(num_main, num_slog, false)
    }

    fn create(num_main: usize, num_slog: usize, slim: bool) -> Spa {
        let spa = Spa::build(num_main, num_slog, slim);
        spa.spawn_syncer();
        spa
    }

    fn build(num_main: usize, num_slog: usize, slim: bool) -> Spa {
        assert_gt!(num_main, 0);
        let mut vdevs = Vec::new();
        for i in 0..num_main + num_slog {
            vdevs.push(Vdev {
                id: VdevId(i as u64),
                is_slog: i >= num_main,
                size: *VDEV_SIZE,
                store: Default::default(),
            });
        }
        let (synced_tx, synced_rx) = watch::channel(Txg(TXG_INITIAL.0 - 1));
        info!(
            "creating pool with {} vdevs ({} slog), slim={}",
            num_main + num_slog,
            num_slog,
            slim
        );
        Spa {
            inner: Arc::new(SpaInner {
                vdevs,
                slim,
                writable: true,
                alloc: Default::default(),
                txg: Mutex::new(TxgState {
                    open: TXG_INITIAL,
                    syncing: None,
                    open_count: [0; TXG_SIZE],
                    freeze_txg: Txg(u64::MAX),
                }),
                tx_drained: Notify::new(),
                synced_tx,
                synced_rx,
                sync_lock: Default::default(),
                datasets: Default::default(),
                headers: Default::default(),
                claimed: Default::default(),
                brt: Default::default(),
                log_state: Mutex::new(LogState::Normal),
                checkpointed: false,
                first_txg: TXG_INITIAL,
                has_special: Default::default(),
                encryption: Default::default(),
                injector: Default::default(),
            }),
        }
    }

    /// The background syncer mirrors the txg sync thread: with no one
    /// explicitly waiting, open txgs still sync out after a timeout. That
    /// is what resolves commit waiters parked by a suspend race.
    fn spawn_syncer(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return,
        };
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(*TXG_TIMEOUT_MS)).await;
                let spa = match weak.upgrade() {
                    Some(inner) => Spa { inner },
                    None => return,
                };
                let open = spa.open_txg();
                spa.txg_wait_synced(open).await;
            }
        });
    }

    /// Power-loss followed by reimport: volatile caches are gone, stable
    /// storage, synced metadata and the block-reference tracker survive.
    /// In-core claims do not; the claim pass rebuilds them.
    pub fn crash(&self) -> Spa {
        let synced = *self.inner.synced_rx.borrow();
        let mut vdevs = Vec::new();
        for vdev in &self.inner.vdevs {
            let stable = vdev.store.lock().unwrap().stable.clone();
            vdevs.push(Vdev {
                id: vdev.id,
                is_slog: vdev.is_slog,
                size: vdev.size,
                store: Mutex::new(VdevStore {
                    cache: Default::default(),
                    stable,
                }),
            });
        }
        let (synced_tx, synced_rx) = watch::channel(synced);
        warn!("simulated power loss; reimporting at txg {}", synced);
        let spa = Spa {
            inner: Arc::new(SpaInner {
                vdevs,
                slim: self.inner.slim,
                writable: true,
                alloc: Mutex::new(self.inner.alloc.lock().unwrap().clone_state()),
                txg: Mutex::new(TxgState {
                    open: synced.next(),
                    syncing: None,
                    open_count: [0; TXG_SIZE],
                    freeze_txg: Txg(u64::MAX),
                }),
                tx_drained: Notify::new(),
                synced_tx,
                synced_rx,
                sync_lock: Default::default(),
                datasets: Default::default(),
                headers: Mutex::new(self.inner.headers.lock().unwrap().clone()),
                claimed: Default::default(),
                brt: Mutex::new(self.inner.brt.lock().unwrap().clone()),
                log_state: Mutex::new(*self.inner.log_state.lock().unwrap()),
                checkpointed: self.inner.checkpointed,
                first_txg: synced.next(),
                has_special: std::sync::atomic::AtomicBool::new(
                    self.inner.has_special.load(std::sync::atomic::Ordering::Relaxed),
                ),
                encryption: Mutex::new(self.inner.encryption.lock().unwrap().clone()),
                injector: Default::default(),
            }),
        };
        spa.spawn_syncer();
        spa
    }

    /// Register a dataset's sync hooks. The hook should hold its dataset
    /// weakly; a hook whose dataset is gone is simply skipped.
    pub fn register(&self, dataset: Arc<dyn TxgHook>) {
        self.inner.datasets.lock().unwrap().push(dataset);
    }

    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    pub fn slim_supported(&self) -> bool {
        self.inner.slim
    }

    pub fn has_slog(&self) -> bool {
        self.inner.vdevs.iter().any(|v| v.is_slog)
    }

    pub fn has_special(&self) -> bool {
        self.inner
            .has_special
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_has_special(&self, value: bool) {
        self.inner
            .has_special
            .store(value, std::sync::atomic::Ordering::Relaxed);
    }

    /*
     * Encryption is out of scope except as a gating condition: a suspended
     * log cannot be drained without the dataset's key mapped.
     */

    pub fn set_encrypted(&self, os: ObjsetId, key_loaded: bool) {
        self.inner.encryption.lock().unwrap().insert(os, key_loaded);
    }

    pub fn os_encrypted(&self, os: ObjsetId) -> bool {
        self.inner.encryption.lock().unwrap().contains_key(&os)
    }

    pub fn create_key_mapping(&self, os: ObjsetId) -> Result<()> {
        match self.inner.encryption.lock().unwrap().get(&os) {
            Some(false) => Err(ZilError::Access),
            _ => Ok(()),
        }
    }

    pub fn remove_key_mapping(&self, _os: ObjsetId) {}

    pub fn set_log_state(&self, state: LogState) {
        *self.inner.log_state.lock().unwrap() = state;
    }

    pub fn log_state(&self) -> LogState {
        *self.inner.log_state.lock().unwrap()
    }

    pub fn checkpointed(&self) -> bool {
        self.inner.checkpointed
    }

    pub fn min_claim_txg(&self) -> Txg {
        self.inner.first_txg
    }

    pub fn first_txg(&self) -> Txg {
        self.inner.first_txg
    }

    /*
     * Txg machinery
     */

    pub fn last_synced_txg(&self) -> Txg {
        *self.inner.synced_rx.borrow()
    }

    pub fn syncing_txg(&self) -> Option<Txg> {
        self.inner.txg.lock().unwrap().syncing
    }

    pub fn open_txg(&self) -> Txg {
        self.inner.txg.lock().unwrap().open
    }

    /// Stop trusting the main pool for durability; from here on only the
    /// log carries data (the frozen-pool test mode). Anything assigned in
    /// the still-open txg or later counts as frozen.
    pub fn freeze(&self) {
        let mut txg = self.inner.txg.lock().unwrap();
        txg.freeze_txg = Txg(txg.open.0 - 1);
        info!("pool frozen at txg {}", txg.freeze_txg);
    }

    pub fn freeze_txg(&self) -> Txg {
        self.inner.txg.lock().unwrap().freeze_txg
    }

    pub fn frozen(&self) -> bool {
        self.freeze_txg() != Txg(u64::MAX)
    }

    pub fn tx_assign(&self) -> Tx {
        let mut txg = self.inner.txg.lock().unwrap();
        let t = txg.open;
        let slot = t.slot();
        txg.open_count[slot] += 1;
        Tx {
            spa: self.inner.clone(),
            txg: t,
        }
    }

    /// Sync all txgs through `txg` (0 means "whatever is open right now").
    /// Sync passes run inline on the calling task, one at a time; each pass
    /// waits for the txg's open transactions to drain, runs every dataset's
    /// sync hook, publishes the txg as synced, then runs the clean hooks.
    pub async fn txg_wait_synced(&self, txg: Txg) {
        let target = if txg == Txg(0) { self.open_txg() } else { txg };
        let mut synced_rx = self.inner.synced_rx.clone();
        loop {
            if *synced_rx.borrow() >= target {
                return;
            }
            let guard = self.inner.sync_lock.lock().await;
            let synced = *synced_rx.borrow();
            if synced >= target {
                return;
            }
            self.sync_one(synced.next()).await;
            drop(guard);
        }
    }

    async fn sync_one(&self, txg: Txg) {
        trace!("starting sync of txg {}", txg);
        {
            let mut state = self.inner.txg.lock().unwrap();
            assert_eq!(txg, self.last_synced_txg().next());
            if state.open <= txg {
                state.open = txg.next();
            }
            state.syncing = Some(txg);
        }

        // Wait for open transactions of this txg to drain.
        loop {
            let drained = self.inner.tx_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.txg.lock().unwrap().open_count[txg.slot()] == 0 {
                break;
            }
            drained.await;
        }

        let datasets = self.hooks();
        for ds in &datasets {
            ds.sync(txg).await;
        }

        self.inner.txg.lock().unwrap().syncing = None;
        self.inner.synced_tx.send(txg).unwrap();
        trace!("synced txg {}", txg);

        for ds in &datasets {
            ds.clean(txg).await;
        }
    }

    fn hooks(&self) -> Vec<Arc<dyn TxgHook>> {
        self.inner.datasets.lock().unwrap().clone()
    }

    /*
     * Dataset metadata (the log header lives here; updated in syncing
     * context only, so it survives a crash exactly as of the last sync).
     */

    pub fn zil_header(&self, os: ObjsetId) -> ZilHeaderPhys {
        self.inner
            .headers
            .lock()
            .unwrap()
            .get(&os)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_zil_header(&self, os: ObjsetId, header: ZilHeaderPhys) {
        self.inner.headers.lock().unwrap().insert(os, header);
    }

    /*
     * Log block allocation
     */

    /// Allocate a log block of `size` bytes with birth `txg`, preferring a
    /// dedicated log device. Returns the pointer (seed left for the caller
    /// to stamp) and whether it landed on a slog.
    pub fn alloc_log_block(&self, txg: Txg, size: u64) -> Result<(BlockPtr, bool)> {
        assert_eq!(size % ZIL_MIN_BLKSZ, 0);
        if self.inner.injector.hit("alloc_log_block") {
            return Err(ZilError::NoSpace);
        }
        let mut alloc = self.inner.alloc.lock().unwrap();
        let mut ordered: Vec<&Vdev> = self.inner.vdevs.iter().collect();
        ordered.sort_by_key(|v| !v.is_slog);
        for vdev in ordered {
            // Prefer an exact-size freed extent before bumping.
            let mut reuse = None;
            for (&key, &sz) in alloc.freed.iter() {
                if key.0 == vdev.id && sz == size {
                    reuse = Some(key);
                    break;
                }
            }
            let offset = match reuse {
                Some(key) => {
                    alloc.freed.remove(&key);
                    key.1
                }
                None => {
                    let next = alloc.next.entry(vdev.id).or_insert(0);
                    if *next + size > vdev.size {
                        continue;
                    }
                    let offset = *next;
                    *next += size;
                    offset
                }
            };
            let bp = BlockPtr {
                vdev: vdev.id,
                offset,
                size,
                birth: txg,
                kind: if self.inner.slim {
                    ChainKind::Slim
                } else {
                    ChainKind::Legacy
                },
                seed: Default::default(),
            };
            trace!("allocated log block {:?} (slog={})", bp, vdev.is_slog);
            return Ok((bp, vdev.is_slog));
        }
        warn!("log block allocation of {} bytes failed", size);
        Err(ZilError::NoSpace)
    }

    /// Return a block's space to the allocator. The bytes themselves are
    /// not erased (frees are logically deferred to the txg), so a chain
    /// walk that frees blocks as it goes can still read ahead of itself.
    pub fn free_block(&self, txg: Txg, bp: &BlockPtr) {
        if bp.is_hole() {
            return;
        }
        trace!("freeing {:?} in txg {}", bp, txg);
        self.inner.claimed.lock().unwrap().remove(&bp.location());
        self.inner
            .alloc
            .lock()
            .unwrap()
            .freed
            .insert((bp.vdev, bp.offset), bp.size);
    }

    /// Speculatively reserve a block found in a log chain at import so the
    /// allocator cannot hand it out before replay decides its fate.
    pub fn claim_block(&self, txg: Option<Txg>, bp: &BlockPtr) -> Result<()> {
        if bp.is_hole() {
            return Ok(());
        }
        if txg.is_some() {
            self.inner.claimed.lock().unwrap().insert(bp.location());
        }
        Ok(())
    }

    pub fn claimed_count(&self) -> usize {
        self.inner.claimed.lock().unwrap().len()
    }

    /// Register a pending reference for a cloned block.
    pub fn brt_pending_add(&self, bp: &BlockPtr) {
        *self
            .inner
            .brt
            .lock()
            .unwrap()
            .entry(bp.location())
            .or_insert(0) += 1;
    }

    pub fn brt_refs(&self, bp: &BlockPtr) -> u64 {
        self.inner
            .brt
            .lock()
            .unwrap()
            .get(&bp.location())
            .copied()
            .unwrap_or(0)
    }

    /*
     * Block i/o
     */

    fn vdev(&self, id: VdevId) -> &Vdev {
        &self.inner.vdevs[usize::from64(id.0)]
    }

    pub fn vdev_is_slog(&self, id: VdevId) -> bool {
        self.vdev(id).is_slog
    }

    /// Read a block. An allocated-but-never-written location reads as
    /// zeroes, the way an uninitialized disk region would; the chain layer
    /// turns that into a checksum failure (end of chain).
    pub async fn read_block(&self, bp: &BlockPtr) -> Result<Vec<u8>> {
        if bp.is_hole() {
            return Err(ZilError::Io);
        }
        let vdev = self.vdev(bp.vdev);
        if bp.offset + bp.size > vdev.size {
            return Err(ZilError::Io);
        }
        Ok(vdev
            .read(bp.offset)
            .unwrap_or_else(|| vec![0; usize::from64(bp.size)]))
    }

    pub async fn write_block(
        &self,
        bp: &BlockPtr,
        data: Vec<u8>,
        priority: WritePriority,
    ) -> Result<()> {
        assert!(!bp.is_hole());
        assert_le!(data.len() as u64, bp.size);
        if self.inner.injector.hit("lwb_write") {
            return Err(ZilError::Io);
        }
        trace!("writing {:?} ({} bytes, {:?})", bp, data.len(), priority);
        self.vdev(bp.vdev).write(bp.offset, data);
        Ok(())
    }

    /// Flip a byte of a written block, in both the cache and stable
    /// storage. Recovery tests use this to snap a chain mid-walk.
    pub fn corrupt_block(&self, bp: &BlockPtr) {
        let mut store = self.vdev(bp.vdev).store.lock().unwrap();
        if let Some(data) = store.cache.get_mut(&bp.offset) {
            let mid = data.len() / 2;
            data[mid] ^= 0xff;
        }
        if let Some(data) = store.stable.get_mut(&bp.offset) {
            let mid = data.len() / 2;
            data[mid] ^= 0xff;
        }
    }

    /// Make every write that reached this vdev's cache stable.
    pub async fn flush_vdev(&self, id: VdevId) -> Result<()> {
        if self.inner.injector.hit("vdev_flush") {
            return Err(ZilError::Io);
        }
        trace!("flushing {}", id);
        self.vdev(id).flush();
        Ok(())
    }
}

impl AllocState {
    fn clone_state(&self) -> AllocState {
        AllocState {
            next: self.next.clone(),
            freed: self.freed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_is_volatile_until_flush() {
        let spa = Spa::new(1, 0);
        let (bp, slog) = spa.alloc_log_block(TXG_INITIAL, ZIL_MIN_BLKSZ).unwrap();
        assert!(!slog);
        spa.write_block(&bp, vec![0xab; 512], WritePriority::SyncWrite)
            .await
            .unwrap();
        assert_eq!(spa.read_block(&bp).await.unwrap(), vec![0xab; 512]);

        // Unflushed write does not survive power loss; the location reads
        // back as an uninitialized region.
        let reimported = spa.crash();
        assert_eq!(
            reimported.read_block(&bp).await.unwrap(),
            vec![0; ZIL_MIN_BLKSZ as usize]
        );

        spa.flush_vdev(bp.vdev).await.unwrap();
        let reimported = spa.crash();
        assert_eq!(reimported.read_block(&bp).await.unwrap(), vec![0xab; 512]);
    }

    #[tokio::test]
    async fn slog_preferred_for_allocation() {
        let spa = Spa::new(1, 1);
        let (bp, slog) = spa.alloc_log_block(TXG_INITIAL, ZIL_MIN_BLKSZ).unwrap();
        assert!(slog);
        assert!(spa.vdev_is_slog(bp.vdev));
    }

    #[tokio::test]
    async fn txg_sync_advances_and_waits_for_open_txs() {
        let spa = Spa::new(1, 0);
        assert_eq!(spa.last_synced_txg(), Txg(TXG_INITIAL.0 - 1));
        let tx = spa.tx_assign();
        let txg = tx.txg();
        assert_eq!(txg, TXG_INITIAL);

        let spa2 = spa.clone();
        let waiter = tokio::spawn(async move { spa2.txg_wait_synced(txg).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(tx);
        waiter.await.unwrap();
        assert_ge!(spa.last_synced_txg(), txg);
        assert_gt!(spa.open_txg(), txg);
    }

    #[tokio::test]
    async fn alloc_failure_injection() {
        let spa = Spa::new(1, 0);
        spa.injector.arm("alloc_log_block", 1, 1);
        assert!(spa.alloc_log_block(TXG_INITIAL, ZIL_MIN_BLKSZ).is_ok());
        assert_eq!(
            spa.alloc_log_block(TXG_INITIAL, ZIL_MIN_BLKSZ).unwrap_err(),
            ZilError::NoSpace
        );
        assert!(spa.alloc_log_block(TXG_INITIAL, ZIL_MIN_BLKSZ).is_ok());
    }
}
