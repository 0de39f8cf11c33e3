use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::*;
use thiserror::Error;

/*
 * Things that are stored on disk.
 */
pub trait OnDisk: Serialize + DeserializeOwned {}

/// Number of per-txg slots kept in memory (itx groups, inflight counters).
pub const TXG_SIZE: usize = 4;

/// Number of txgs that can hold unsynced state at once (open, quiescing,
/// syncing).
pub const TXG_CONCURRENT_STATES: u64 = 3;

/// Smallest (and unit of) log block size.
pub const ZIL_MIN_BLKSZ: u64 = 4096;

/// Depth of the block-size prediction history.
pub const ZIL_BURSTS: usize = 8;

/// First txg of a pool; earlier values are reserved.
pub const TXG_INITIAL: Txg = Txg(TXG_SIZE as u64);

/// Txg used for itxs while the pool is frozen; never synced, and high
/// enough that it can never collide with a real txg.
pub const ZILTEST_TXG: Txg = Txg(u64::MAX - TXG_CONCURRENT_STATES);

#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Txg(pub u64);
impl OnDisk for Txg {}
impl Display for Txg {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Txg {
    pub fn next(&self) -> Txg {
        Txg(self.0 + 1)
    }

    /// Slot in a TXG_SIZE ring.
    pub fn slot(&self) -> usize {
        (self.0 % TXG_SIZE as u64) as usize
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ObjsetId(pub u64);
impl OnDisk for ObjsetId {}
impl Display for ObjsetId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "os{}", self.0)
    }
}

/// Object (file) id within a dataset; "foid" in log-record terms.
#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ObjectId(pub u64);
impl OnDisk for ObjectId {}
impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct VdevId(pub u64);
impl Display for VdevId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "vdev{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct DiskLocation {
    pub vdev: VdevId,
    pub offset: u64,
}

/// The checksum-continuation seed carried in every block pointer of a log
/// chain. The seed of block N+1 is block N's seed with seq incremented;
/// the initial seed is {random guids, objset id, seq=1}.
#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChainSeed {
    pub guid: [u64; 2],
    pub objset: u64,
    pub seq: u64,
}

impl ChainSeed {
    pub fn advance(&self) -> ChainSeed {
        ChainSeed {
            seq: self.seq + 1,
            ..*self
        }
    }
}

/// Which of the two on-disk block layouts a pointer refers to: trailer at
/// byte 0 (slim) or at the end of the block (legacy).
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChainKind {
    Slim,
    Legacy,
}

impl Default for ChainKind {
    fn default() -> Self {
        ChainKind::Slim
    }
}

/// Pointer to one log block. A pointer with size == 0 is a hole (end of
/// chain / no chain).
#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockPtr {
    pub vdev: VdevId,
    pub offset: u64,
    pub size: u64,
    pub birth: Txg,
    pub kind: ChainKind,
    pub seed: ChainSeed,
}
impl OnDisk for BlockPtr {}

impl BlockPtr {
    pub fn hole() -> BlockPtr {
        Default::default()
    }

    pub fn is_hole(&self) -> bool {
        self.size == 0
    }

    pub fn location(&self) -> DiskLocation {
        DiskLocation {
            vdev: self.vdev,
            offset: self.offset,
        }
    }
}

/// On-disk intent-log header, stored in the dataset metadata.
#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZilHeaderPhys {
    pub claim_txg: Txg,
    pub replay_seq: u64,
    pub log: BlockPtr,
    pub claim_blk_seq: u64,
    pub claim_lr_seq: u64,
    pub replay_needed: bool,
    pub claim_lr_seq_valid: bool,
}
impl OnDisk for ZilHeaderPhys {}

/// Errno-like error discrimination required by the log core. Checksum
/// failure doubles as the end-of-chain signal during parse.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZilError {
    #[error("checksum mismatch or end of chain")]
    Cksum,
    #[error("I/O error")]
    Io,
    #[error("allocation failed")]
    NoSpace,
    #[error("no such object")]
    NotFound,
    #[error("object exists")]
    Exists,
    #[error("already updated")]
    Already,
    #[error("busy")]
    Busy,
    #[error("encryption key unavailable")]
    Access,
    #[error("invalid record")]
    Invalid,
}

pub type Result<T, E = ZilError> = std::result::Result<T, E>;
