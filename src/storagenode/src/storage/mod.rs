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

mod memory;
mod rocks;

use strom_api::v1::{CommitContext, LogEntry};
use strom_api::{Glsn, Llsn};

use crate::Result;

pub use self::memory::MemoryStorage;
pub use self::rocks::RocksStorage;

/// Recovery state read back on startup: the most recent durable commit
/// context plus the highest committed `(LLSN, GLSN)` pair and the highest
/// written LLSN.
#[derive(Clone, Debug, Default)]
pub struct RecoveryPoints {
    pub commit_context: Option<CommitContext>,
    pub last_committed: Option<(Llsn, Glsn)>,
    pub last_written_llsn: Llsn,
}

/// A forward scanner over committed log entries, ordered by GLSN.
pub trait Scanner: Send {
    fn next(&mut self) -> Result<Option<LogEntry>>;
}

/// A single-use batch of uncommitted writes. Owned by the writer worker.
pub trait WriteBatch: Send {
    fn put(&mut self, llsn: Llsn, data: &[u8]) -> Result<()>;
    fn apply(self: Box<Self>) -> Result<()>;
}

/// A single-use batch of `(LLSN, GLSN)` mappings belonging to one commit
/// round.
pub trait CommitBatch: Send {
    fn put(&mut self, llsn: Llsn, glsn: Glsn) -> Result<()>;
    fn apply(self: Box<Self>) -> Result<()>;
}

/// Durable store for one log stream replica.
///
/// Writes record uncommitted data by LLSN; commits bind an LLSN to its
/// assigned GLSN; reads and scans address committed entries by GLSN.
pub trait Storage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn write(&self, llsn: Llsn, data: &[u8]) -> Result<()>;

    fn new_write_batch(&self) -> Box<dyn WriteBatch + '_>;

    fn commit(&self, llsn: Llsn, glsn: Glsn) -> Result<()>;

    fn new_commit_batch(&self) -> Box<dyn CommitBatch + '_>;

    /// Durably record the commit round before any of its mappings are
    /// flushed.
    fn store_commit_context(&self, commit_context: CommitContext) -> Result<()>;

    fn read(&self, glsn: Glsn) -> Result<LogEntry>;

    /// Scan committed entries within the half-open range `[begin, end)`.
    fn scan(&self, begin: Glsn, end: Glsn) -> Result<Box<dyn Scanner + '_>>;

    /// Remove committed entries with `GLSN <= glsn`.
    fn delete_committed(&self, glsn: Glsn) -> Result<()>;

    /// Remove written but uncommitted entries with `LLSN >= llsn`.
    fn delete_uncommitted(&self, llsn: Llsn) -> Result<()>;

    fn read_recovery_points(&self) -> Result<RecoveryPoints>;
}
