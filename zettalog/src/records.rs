use crate::base_types::*;
use async_trait::async_trait;
use bincode::Options;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Every log record starts with this header. `reclen` is 8-byte aligned and
/// covers the header plus the record body (plus, for WR_NEED_COPY records
/// already written to a block, the inline payload).
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LrHeader {
    pub txtype: u64,
    pub reclen: u64,
    pub txg: Txg,
    pub seq: u64,
}
impl OnDisk for LrHeader {}

pub const LR_HEADER_SIZE: u64 = 32;

/// Case-insensitivity marker, possibly set on txtype in the log record.
pub const TX_CI: u64 = 1 << 63;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u64)]
pub enum TxType {
    Create = 1,
    Mkdir = 2,
    Mkxattr = 3,
    Symlink = 4,
    Remove = 5,
    Rmdir = 6,
    Link = 7,
    Rename = 8,
    Write = 9,
    Truncate = 10,
    Setattr = 11,
    AclV0 = 12,
    Acl = 13,
    CreateAcl = 14,
    CreateAttr = 15,
    CreateAclAttr = 16,
    MkdirAcl = 17,
    MkdirAttr = 18,
    MkdirAclAttr = 19,
    Write2 = 20,
    Setsaxattr = 21,
    RenameExchange = 22,
    RenameWhiteout = 23,
    CloneRange = 24,
    Commit = 25,
}

pub const TX_MAX_TYPE: u64 = 26;

impl TryFrom<u64> for TxType {
    type Error = ZilError;

    fn try_from(value: u64) -> Result<TxType> {
        use TxType::*;
        Ok(match value & !TX_CI {
            1 => Create,
            2 => Mkdir,
            3 => Mkxattr,
            4 => Symlink,
            5 => Remove,
            6 => Rmdir,
            7 => Link,
            8 => Rename,
            9 => Write,
            10 => Truncate,
            11 => Setattr,
            12 => AclV0,
            13 => Acl,
            14 => CreateAcl,
            15 => CreateAttr,
            16 => CreateAclAttr,
            17 => MkdirAcl,
            18 => MkdirAttr,
            19 => MkdirAclAttr,
            20 => Write2,
            21 => Setsaxattr,
            22 => RenameExchange,
            23 => RenameWhiteout,
            24 => CloneRange,
            25 => Commit,
            _ => return Err(ZilError::Invalid),
        })
    }
}

impl TxType {
    pub fn raw(self) -> u64 {
        self as u64
    }

    /// Record types that async producers may log out of order with respect
    /// to the object's other operations. During replay, a missing target
    /// object is legitimate for these.
    pub fn out_of_order(self) -> bool {
        default_ooo_mask() & (1 << self.raw()) != 0
    }
}

pub fn default_ooo_mask() -> u64 {
    use TxType::*;
    [Write, Truncate, Setattr, AclV0, Acl, Write2, Setsaxattr]
        .iter()
        .fold(0, |mask, t| mask | (1 << t.raw()))
}

impl LrHeader {
    pub fn txtype(&self) -> Result<TxType> {
        TxType::try_from(self.txtype)
    }
}

/// Dispositions for the payload of a TX_WRITE record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WrState {
    /// Data is inline in the itx body; reclen covers it.
    Copied,
    /// Data is fetched from the producer at issue time and written inline
    /// after the record; may be split across blocks.
    NeedCopy,
    /// Only a block pointer is logged; the producer writes the data block
    /// itself as a child I/O of the log write.
    Indirect,
}

/// Body of a TX_WRITE record (follows the LrHeader). For WR_COPIED the
/// inline payload follows this struct within the same record.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WriteBody {
    pub foid: ObjectId,
    pub offset: u64,
    pub length: u64,
    pub blkoff: u64,
    pub blkptr: BlockPtr,
}
impl OnDisk for WriteBody {}

lazy_static::lazy_static! {
    pub static ref WRITE_BODY_SIZE: u64 = encoded_size(&WriteBody::default());
    /// Length of a TX_WRITE record as stored: header plus the body padded
    /// to 8 bytes. An on-disk write record of exactly this length carries
    /// no inline payload (WR_INDIRECT).
    pub static ref WRITE_RECORD_SIZE: u64 =
        LR_HEADER_SIZE + (*WRITE_BODY_SIZE + 7) / 8 * 8;
}

/// Body of a TX_CLONE_RANGE record.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CloneRangeBody {
    pub foid: ObjectId,
    pub offset: u64,
    pub length: u64,
    pub bps: Vec<BlockPtr>,
}
impl OnDisk for CloneRangeBody {}

/*
 * On-disk encoding. Everything this crate persists is encoded with
 * fixed-width little-endian bincode, so record offsets are stable and the
 * byteswap question of other-endian chains does not arise.
 */
fn ondisk_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    ondisk_options().serialize(value).unwrap()
}

pub fn encode_into<T: Serialize>(buf: &mut [u8], value: &T) {
    let bytes = encode(value);
    buf[..bytes.len()].copy_from_slice(&bytes);
}

pub fn encoded_size<T: Serialize>(value: &T) -> u64 {
    ondisk_options().serialized_size(value).unwrap()
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    ondisk_options().deserialize(buf).map_err(|_| ZilError::Invalid)
}

/// Read the owning object id out of a record body; all object-addressed
/// record bodies lead with their foid.
pub fn record_foid(body: &[u8]) -> Result<ObjectId> {
    decode(body)
}

/// Collects data-block writes created by the producer for WR_INDIRECT
/// records. The log write for an lwb is not considered done until every
/// child added here has completed.
#[derive(Debug, Default)]
pub struct ChildIo {
    handles: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl ChildIo {
    pub fn add(&self, handle: JoinHandle<Result<()>>) {
        self.handles.lock().unwrap().push(handle);
    }

    /// Wait for all children; the first error wins.
    pub(crate) async fn wait(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let mut result = Ok(());
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => (),
                Ok(Err(e)) => result = result.and(Err(e)),
                Err(_) => result = result.and(Err(ZilError::Io)),
            }
        }
        result
    }
}

/// Producer contract: supply the payload of a TX_WRITE record at issue time.
///
/// When `wbuf` is Some, copy `lr.length` bytes of the object's data at
/// `lr.offset` into it. When `wbuf` is None (WR_INDIRECT), write the data
/// block directly (as a child I/O on `lwb.child()`) and store its pointer
/// into `lr.blkptr`; call `lwb.add_vdev()` for the vdev written so its
/// cache gets flushed with the log block's.
///
/// Errors: `Io` makes the caller fall back to waiting for the txg; NotFound/
/// Exists/Already make it skip the record silently (the object is gone or
/// the data already made it out another way).
#[async_trait]
pub trait GetData: Send + Sync {
    async fn get_data(
        &self,
        private: Option<&(dyn std::any::Any + Send + Sync)>,
        gen: u64,
        lr: &mut WriteBody,
        wbuf: Option<&mut [u8]>,
        lwb: &crate::lwb::Lwb,
    ) -> Result<()>;
}

/// Replay contract: one replay function per txtype, dispatched with a copy
/// of the full record (header + body + any pulled TX_WRITE data).
/// `byteswap` reports whether the containing block was written with the
/// opposite byte order; with this crate's little-endian encoding it is
/// always false, but the flag remains part of the contract.
#[async_trait]
pub trait ReplayOps: Send + Sync {
    async fn replay(&self, txtype: TxType, record: &[u8], byteswap: bool) -> Result<()>;

    /// Used for out-of-order record types whose target may be legitimately
    /// gone by replay time.
    async fn object_exists(&self, obj: ObjectId) -> bool;

    fn out_of_order_mask(&self) -> u64 {
        default_ooo_mask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_stable() {
        assert_eq!(encoded_size(&LrHeader::default()), LR_HEADER_SIZE);
    }

    #[test]
    fn txtype_roundtrip() {
        for raw in 1..TX_MAX_TYPE {
            let t = TxType::try_from(raw).unwrap();
            assert_eq!(t.raw(), raw);
            assert_eq!(TxType::try_from(raw | TX_CI).unwrap(), t);
        }
        assert!(TxType::try_from(0).is_err());
        assert!(TxType::try_from(TX_MAX_TYPE).is_err());
    }

    #[test]
    fn write_body_leads_with_foid() {
        let body = WriteBody {
            foid: ObjectId(7),
            offset: 4096,
            length: 512,
            ..Default::default()
        };
        assert_eq!(record_foid(&encode(&body)).unwrap(), ObjectId(7));
    }
}
