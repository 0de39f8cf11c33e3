//! Shared harness for the integration tests: a tiny in-memory filesystem
//! that produces write payloads for the log and replays records back into
//! itself.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use util::From64;
use zettalog::base_types::*;
use zettalog::chain::{self, BpSet, ParseVisitor};
use zettalog::records::{self, GetData, LrHeader, ReplayOps, TxType, WriteBody, LR_HEADER_SIZE,
    WRITE_RECORD_SIZE};
use zettalog::spa::{Spa, WritePriority};
use zettalog::{Itx, ItxPrivate, Zilog};

pub const OS: ObjsetId = ObjsetId(1);

/// Payload carried on a WR_NEED_COPY/WR_INDIRECT itx for get_data to fetch.
pub struct WritePayload {
    pub base: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct TestFs {
    spa: Mutex<Option<Spa>>,
    pub objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
}

impl TestFs {
    pub fn new(spa: &Spa) -> Arc<TestFs> {
        let fs = Arc::new(TestFs::default());
        *fs.spa.lock().unwrap() = Some(spa.clone());
        fs
    }

    fn spa(&self) -> Spa {
        self.spa.lock().unwrap().clone().unwrap()
    }

    pub fn create_object(&self, foid: u64) {
        self.objects
            .lock()
            .unwrap()
            .insert(ObjectId(foid), Vec::new());
    }

    pub fn object(&self, foid: u64) -> Vec<u8> {
        self.objects
            .lock()
            .unwrap()
            .get(&ObjectId(foid))
            .cloned()
            .unwrap_or_default()
    }

    pub fn apply_write(&self, foid: ObjectId, offset: u64, data: &[u8]) {
        let mut objects = self.objects.lock().unwrap();
        let content = objects.entry(foid).or_default();
        let end = usize::from64(offset) + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[usize::from64(offset)..end].copy_from_slice(data);
    }
}

#[async_trait]
impl GetData for TestFs {
    async fn get_data(
        &self,
        private: Option<&(dyn std::any::Any + Send + Sync)>,
        _gen: u64,
        lr: &mut WriteBody,
        wbuf: Option<&mut [u8]>,
        lwb: &zettalog::Lwb,
    ) -> Result<()> {
        let payload = private
            .and_then(|p| p.downcast_ref::<WritePayload>())
            .ok_or(ZilError::NotFound)?;
        let start = usize::from64(lr.offset - payload.base);
        let data = payload.data[start..start + usize::from64(lr.length)].to_vec();

        match wbuf {
            Some(wbuf) => {
                wbuf[..data.len()].copy_from_slice(&data);
            }
            None => {
                // WR_INDIRECT: put the data block down ourselves and hang
                // the write off the lwb.
                let spa = self.spa();
                let tx = spa.tx_assign();
                let size = (lr.length + ZIL_MIN_BLKSZ - 1) / ZIL_MIN_BLKSZ * ZIL_MIN_BLKSZ;
                let (bp, _slog) = spa.alloc_log_block(tx.txg(), size)?;
                drop(tx);
                lr.blkptr = bp;
                lwb.add_vdev(bp.vdev);
                let mut block = data;
                block.resize(usize::from64(size), 0);
                let write_spa = spa.clone();
                lwb.child().add(tokio::spawn(async move {
                    write_spa
                        .write_block(&bp, block, WritePriority::SyncWrite)
                        .await
                }));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReplayOps for TestFs {
    async fn replay(&self, txtype: TxType, record: &[u8], _byteswap: bool) -> Result<()> {
        match txtype {
            TxType::Write => {
                let wb: WriteBody = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;
                let data_off = usize::from64(*WRITE_RECORD_SIZE);
                let data = &record[data_off..data_off + usize::from64(wb.length)];
                self.apply_write(wb.foid, wb.offset, data);
                Ok(())
            }
            TxType::Create => {
                let foid: ObjectId = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;
                self.objects.lock().unwrap().entry(foid).or_default();
                Ok(())
            }
            TxType::Remove => {
                let foid: ObjectId = records::decode(&record[usize::from64(LR_HEADER_SIZE)..])?;
                self.objects.lock().unwrap().remove(&foid);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn object_exists(&self, obj: ObjectId) -> bool {
        self.objects.lock().unwrap().contains_key(&obj)
    }
}

/// Build a TX_WRITE itx the way a filesystem producer would.
pub fn write_itx(foid: u64, offset: u64, data: &[u8], state: records::WrState) -> Itx {
    match state {
        records::WrState::Copied => {
            Itx::new_write(ObjectId(foid), offset, data.len() as u64, state, Some(data))
        }
        _ => {
            let mut itx =
                Itx::new_write(ObjectId(foid), offset, data.len() as u64, state, None);
            itx.private = ItxPrivate::Data(Arc::new(WritePayload {
                base: offset,
                data: data.to_vec(),
            }));
            itx
        }
    }
}

pub fn log_write(zilog: &Zilog, foid: u64, offset: u64, data: &[u8], state: records::WrState) {
    let tx = zilog.spa().tx_assign();
    zilog.itx_assign(write_itx(foid, offset, data, state), &tx);
}

pub fn log_write_async(
    zilog: &Zilog,
    foid: u64,
    offset: u64,
    data: &[u8],
    state: records::WrState,
) {
    let tx = zilog.spa().tx_assign();
    let mut itx = write_itx(foid, offset, data, state);
    itx.sync = false;
    zilog.itx_assign(itx, &tx);
}

/// Establish the on-disk chain so later commits exercise the steady state
/// instead of the create-and-sync path.
pub async fn warmup(zilog: &Zilog) {
    zilog.commit(ObjectId(0)).await;
    assert!(!zilog.header().log.is_hole());
}

/// Parse visitor that keeps every block pointer and record it sees.
#[derive(Default)]
pub struct RecordCollector {
    pub bps: Vec<BlockPtr>,
    pub records: Vec<(LrHeader, Vec<u8>)>,
}

#[async_trait]
impl ParseVisitor for RecordCollector {
    async fn block(&mut self, _bps: &mut BpSet, bp: &BlockPtr, _first_txg: Txg) -> Result<()> {
        self.bps.push(*bp);
        Ok(())
    }

    async fn record(
        &mut self,
        _bps: &mut BpSet,
        hdr: &LrHeader,
        record: &[u8],
        _first_txg: Txg,
    ) -> Result<()> {
        self.records.push((*hdr, record.to_vec()));
        Ok(())
    }
}

/// Walk the current on-disk chain of `os` and return everything on it.
pub async fn collect_chain(spa: &Spa, os: ObjsetId) -> (chain::ParseResult, RecordCollector) {
    let header = spa.zil_header(os);
    let mut collector = RecordCollector::default();
    let result = chain::parse(spa, &header, &mut collector, header.claim_txg, false).await;
    (result, collector)
}

/// TX_WRITE records only, decoded, in chain order.
pub fn write_records(collector: &RecordCollector) -> Vec<(WriteBody, Vec<u8>)> {
    collector
        .records
        .iter()
        .filter(|(hdr, _)| hdr.txtype().unwrap() == TxType::Write)
        .map(|(hdr, record)| {
            let wb: WriteBody =
                records::decode(&record[usize::from64(LR_HEADER_SIZE)..]).unwrap();
            let data_off = usize::from64(*WRITE_RECORD_SIZE);
            let available = record.len() - data_off.min(record.len());
            let len = available.min(usize::from64(wb.length));
            let data = if hdr.reclen > *WRITE_RECORD_SIZE {
                record[data_off..data_off + len].to_vec()
            } else {
                Vec::new()
            };
            (wb, data)
        })
        .collect()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
