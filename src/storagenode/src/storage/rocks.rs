// Copyright 2023-present The Strom Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use prost::Message;
use rocksdb::{Direction, IteratorMode, Options, WriteOptions, DB};
use strom_api::v1::{CommitContext, LogEntry};
use strom_api::{Glsn, Llsn};
use strom_base::num::{decode_u64, encode_u64};

use super::{CommitBatch, RecoveryPoints, Scanner, Storage, WriteBatch};
use crate::{Error, Result, StorageConfig};

const DATA_KEY_PREFIX: u8 = b'd';
const COMMIT_KEY_PREFIX: u8 = b'c';
const COMMIT_CONTEXT_KEY: [u8; 1] = [b'x'];

/// Durable log stream storage backed by rocksdb.
///
/// Keyspace: `d<LLSN>` holds payloads, `c<GLSN>` binds a GLSN to its LLSN,
/// and a single `x` key holds the latest commit context.
pub struct RocksStorage {
    db: DB,
    cfg: StorageConfig,
}

fn data_key(llsn: Llsn) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = DATA_KEY_PREFIX;
    key[1..].copy_from_slice(&encode_u64(llsn));
    key
}

fn commit_key(glsn: Glsn) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = COMMIT_KEY_PREFIX;
    key[1..].copy_from_slice(&encode_u64(glsn));
    key
}

fn decode_seq(prefix: u8, key: &[u8]) -> Option<u64> {
    if key.len() != 9 || key[0] != prefix {
        return None;
    }
    decode_u64(&key[1..])
}

impl RocksStorage {
    pub fn open(path: impl AsRef<Path>, cfg: StorageConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(RocksStorage { db, cfg })
    }

    fn write_options(&self, without_sync: bool) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(!without_sync);
        opts
    }

    fn lookup_llsn(&self, glsn: Glsn) -> Result<Option<Llsn>> {
        match self.db.get(commit_key(glsn))? {
            Some(value) => Ok(decode_u64(&value)),
            None => Ok(None),
        }
    }

    fn read_by_llsn(&self, llsn: Llsn, glsn: Glsn) -> Result<LogEntry> {
        let data = self
            .db
            .get(data_key(llsn))?
            .ok_or_else(|| Error::Internal(format!("missing data for llsn {llsn}")))?;
        Ok(LogEntry { llsn, glsn, data })
    }

    fn last_key_with_prefix(&self, prefix: u8) -> Result<Option<u64>> {
        let mut bound = [0xffu8; 9];
        bound[0] = prefix;
        let mut iter = self.db.iterator(IteratorMode::From(&bound, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_seq(prefix, &key))
            }
            None => Ok(None),
        }
    }
}

impl Storage for RocksStorage {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn write(&self, llsn: Llsn, data: &[u8]) -> Result<()> {
        let opts = self.write_options(self.cfg.without_write_sync);
        self.db.put_opt(data_key(llsn), data, &opts)?;
        Ok(())
    }

    fn new_write_batch(&self) -> Box<dyn WriteBatch + '_> {
        Box::new(RocksWriteBatch { storage: self, batch: rocksdb::WriteBatch::default() })
    }

    fn commit(&self, llsn: Llsn, glsn: Glsn) -> Result<()> {
        let opts = self.write_options(self.cfg.without_commit_sync);
        self.db.put_opt(commit_key(glsn), encode_u64(llsn), &opts)?;
        Ok(())
    }

    fn new_commit_batch(&self) -> Box<dyn CommitBatch + '_> {
        Box::new(RocksCommitBatch { storage: self, batch: rocksdb::WriteBatch::default() })
    }

    fn store_commit_context(&self, commit_context: CommitContext) -> Result<()> {
        let opts = self.write_options(self.cfg.without_commit_sync);
        self.db.put_opt(COMMIT_CONTEXT_KEY, commit_context.encode_to_vec(), &opts)?;
        Ok(())
    }

    fn read(&self, glsn: Glsn) -> Result<LogEntry> {
        let llsn =
            self.lookup_llsn(glsn)?.ok_or_else(|| Error::NotExist(format!("glsn {glsn}")))?;
        self.read_by_llsn(llsn, glsn)
    }

    fn scan(&self, begin: Glsn, end: Glsn) -> Result<Box<dyn Scanner + '_>> {
        let iter =
            self.db.iterator(IteratorMode::From(&commit_key(begin), Direction::Forward));
        Ok(Box::new(RocksScanner { storage: self, iter, end }))
    }

    fn delete_committed(&self, glsn: Glsn) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let iter = self.db.iterator(IteratorMode::From(&commit_key(0), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(committed_glsn) = decode_seq(COMMIT_KEY_PREFIX, &key) else {
                break;
            };
            if committed_glsn > glsn {
                break;
            }
            batch.delete(&key);
            if let Some(llsn) = decode_u64(&value) {
                batch.delete(data_key(llsn));
            }
        }
        let opts = self.write_options(self.cfg.without_delete_committed_sync);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn delete_uncommitted(&self, llsn: Llsn) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let iter =
            self.db.iterator(IteratorMode::From(&data_key(llsn), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if decode_seq(DATA_KEY_PREFIX, &key).is_none() {
                break;
            }
            batch.delete(&key);
        }
        let opts = self.write_options(self.cfg.without_delete_uncommitted_sync);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn read_recovery_points(&self) -> Result<RecoveryPoints> {
        let commit_context = match self.db.get(COMMIT_CONTEXT_KEY)? {
            Some(raw) => Some(CommitContext::decode(raw.as_slice())?),
            None => None,
        };
        let last_committed = match self.last_key_with_prefix(COMMIT_KEY_PREFIX)? {
            Some(glsn) => self.lookup_llsn(glsn)?.map(|llsn| (llsn, glsn)),
            None => None,
        };
        let last_written_llsn = self.last_key_with_prefix(DATA_KEY_PREFIX)?.unwrap_or(0);
        Ok(RecoveryPoints { commit_context, last_committed, last_written_llsn })
    }
}

struct RocksWriteBatch<'a> {
    storage: &'a RocksStorage,
    batch: rocksdb::WriteBatch,
}

struct RocksCommitBatch<'a> {
    storage: &'a RocksStorage,
    batch: rocksdb::WriteBatch,
}

struct RocksScanner<'a> {
    storage: &'a RocksStorage,
    iter: rocksdb::DBIteratorWithThreadMode<'a, DB>,
    end: Glsn,
}

impl WriteBatch for RocksWriteBatch<'_> {
    fn put(&mut self, llsn: Llsn, data: &[u8]) -> Result<()> {
        self.batch.put(data_key(llsn), data);
        Ok(())
    }

    fn apply(self: Box<Self>) -> Result<()> {
        let opts = self.storage.write_options(self.storage.cfg.without_write_sync);
        self.storage.db.write_opt(self.batch, &opts)?;
        Ok(())
    }
}

impl CommitBatch for RocksCommitBatch<'_> {
    fn put(&mut self, llsn: Llsn, glsn: Glsn) -> Result<()> {
        self.batch.put(commit_key(glsn), encode_u64(llsn));
        Ok(())
    }

    fn apply(self: Box<Self>) -> Result<()> {
        let opts = self.storage.write_options(self.storage.cfg.without_commit_sync);
        self.storage.db.write_opt(self.batch, &opts)?;
        Ok(())
    }
}

impl Scanner for RocksScanner<'_> {
    fn next(&mut self) -> Result<Option<LogEntry>> {
        let Some(item) = self.iter.next() else {
            return Ok(None);
        };
        let (key, value) = item?;
        let Some(glsn) = decode_seq(COMMIT_KEY_PREFIX, &key) else {
            return Ok(None);
        };
        if glsn >= self.end {
            return Ok(None);
        }
        let llsn = decode_u64(&value)
            .ok_or_else(|| Error::InvalidData("commit key value".to_owned()))?;
        self.storage.read_by_llsn(llsn, glsn).map(Some)
    }
}
