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

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use strom_api::v1::{CommitContext, LogEntry};
use strom_api::{Glsn, Llsn};

use super::{CommitBatch, RecoveryPoints, Scanner, Storage, WriteBatch};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    // llsn -> payload
    written: BTreeMap<Llsn, Vec<u8>>,
    // glsn -> llsn
    committed: BTreeMap<Glsn, Llsn>,
    commit_context: Option<CommitContext>,
}

/// An in-memory storage used by tests.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

struct MemoryWriteBatch<'a> {
    storage: &'a MemoryStorage,
    entries: Vec<(Llsn, Vec<u8>)>,
}

struct MemoryCommitBatch<'a> {
    storage: &'a MemoryStorage,
    entries: Vec<(Llsn, Glsn)>,
}

struct MemoryScanner {
    entries: std::vec::IntoIter<LogEntry>,
}

impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, llsn: Llsn, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("Poisoned");
        inner.written.insert(llsn, data.to_vec());
        Ok(())
    }

    fn new_write_batch(&self) -> Box<dyn WriteBatch + '_> {
        Box::new(MemoryWriteBatch { storage: self, entries: Vec::new() })
    }

    fn commit(&self, llsn: Llsn, glsn: Glsn) -> Result<()> {
        let mut inner = self.inner.lock().expect("Poisoned");
        if !inner.written.contains_key(&llsn) {
            return Err(Error::Internal(format!("commit of unwritten llsn {llsn}")));
        }
        inner.committed.insert(glsn, llsn);
        Ok(())
    }

    fn new_commit_batch(&self) -> Box<dyn CommitBatch + '_> {
        Box::new(MemoryCommitBatch { storage: self, entries: Vec::new() })
    }

    fn store_commit_context(&self, commit_context: CommitContext) -> Result<()> {
        let mut inner = self.inner.lock().expect("Poisoned");
        inner.commit_context = Some(commit_context);
        Ok(())
    }

    fn read(&self, glsn: Glsn) -> Result<LogEntry> {
        let inner = self.inner.lock().expect("Poisoned");
        let llsn =
            *inner.committed.get(&glsn).ok_or_else(|| Error::NotExist(format!("glsn {glsn}")))?;
        let data = inner
            .written
            .get(&llsn)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("missing data for llsn {llsn}")))?;
        Ok(LogEntry { llsn, glsn, data })
    }

    fn scan(&self, begin: Glsn, end: Glsn) -> Result<Box<dyn Scanner + '_>> {
        let inner = self.inner.lock().expect("Poisoned");
        let mut entries = Vec::new();
        for (&glsn, &llsn) in inner.committed.range(begin..end) {
            let data = inner
                .written
                .get(&llsn)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("missing data for llsn {llsn}")))?;
            entries.push(LogEntry { llsn, glsn, data });
        }
        Ok(Box::new(MemoryScanner { entries: entries.into_iter() }))
    }

    fn delete_committed(&self, glsn: Glsn) -> Result<()> {
        let mut inner = self.inner.lock().expect("Poisoned");
        let targets: Vec<(Glsn, Llsn)> =
            inner.committed.range(..=glsn).map(|(&g, &l)| (g, l)).collect();
        for (g, l) in targets {
            inner.committed.remove(&g);
            inner.written.remove(&l);
        }
        Ok(())
    }

    fn delete_uncommitted(&self, llsn: Llsn) -> Result<()> {
        let mut inner = self.inner.lock().expect("Poisoned");
        let targets: Vec<Llsn> = inner.written.range(llsn..).map(|(&l, _)| l).collect();
        for l in targets {
            inner.written.remove(&l);
        }
        Ok(())
    }

    fn read_recovery_points(&self) -> Result<RecoveryPoints> {
        let inner = self.inner.lock().expect("Poisoned");
        Ok(RecoveryPoints {
            commit_context: inner.commit_context.clone(),
            last_committed: inner.committed.iter().next_back().map(|(&g, &l)| (l, g)),
            last_written_llsn: inner.written.keys().next_back().copied().unwrap_or(0),
        })
    }
}

impl WriteBatch for MemoryWriteBatch<'_> {
    fn put(&mut self, llsn: Llsn, data: &[u8]) -> Result<()> {
        self.entries.push((llsn, data.to_vec()));
        Ok(())
    }

    fn apply(self: Box<Self>) -> Result<()> {
        let mut inner = self.storage.inner.lock().expect("Poisoned");
        for (llsn, data) in self.entries {
            inner.written.insert(llsn, data);
        }
        Ok(())
    }
}

impl CommitBatch for MemoryCommitBatch<'_> {
    fn put(&mut self, llsn: Llsn, glsn: Glsn) -> Result<()> {
        self.entries.push((llsn, glsn));
        Ok(())
    }

    fn apply(self: Box<Self>) -> Result<()> {
        let mut inner = self.storage.inner.lock().expect("Poisoned");
        for (llsn, glsn) in self.entries {
            inner.committed.insert(glsn, llsn);
        }
        Ok(())
    }
}

impl Scanner for MemoryScanner {
    fn next(&mut self) -> Result<Option<LogEntry>> {
        Ok(self.entries.next())
    }
}
