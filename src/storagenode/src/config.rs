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

use std::path::PathBuf;
use std::time::Duration;

use strom_api::{ClusterId, StorageNodeId};

use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub cluster_id: ClusterId,
    pub storage_node_id: StorageNodeId,
    pub address: String,
    pub volume: PathBuf,
    pub executor: ExecutorConfig,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.storage_node_id == 0 {
            return Err(Error::InvalidArgument("storage node id".to_owned()));
        }
        if self.volume.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("volume".to_owned()));
        }
        self.executor.validate()
    }
}

/// Budgets of the append pipeline. Every stage reports `DeadlineExceeded`
/// when its budget overflows.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub append_queue_size: usize,
    pub commit_queue_size: usize,
    pub append_enqueue_timeout: Duration,
    pub write_timeout: Duration,
    pub replicate_timeout: Duration,
    pub commit_wait_timeout: Duration,
    pub commit_enqueue_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            append_queue_size: 1024,
            commit_queue_size: 256,
            append_enqueue_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            replicate_timeout: Duration::from_secs(5),
            commit_wait_timeout: Duration::from_secs(10),
            commit_enqueue_timeout: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.append_queue_size == 0 || self.commit_queue_size == 0 {
            return Err(Error::InvalidArgument("queue size".to_owned()));
        }
        Ok(())
    }
}

/// Per-batch durability relaxations of the storage engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct StorageConfig {
    pub without_write_sync: bool,
    pub without_commit_sync: bool,
    pub without_delete_committed_sync: bool,
    pub without_delete_uncommitted_sync: bool,
}
