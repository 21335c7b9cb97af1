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

use std::time::Duration;

use strom_api::{ClusterId, NodeId, INVALID_NODE_ID};

use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct MrConfig {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub replication_factor: usize,
    /// Commit rounds are proposed on this cadence while this node leads.
    pub commit_tick_interval: Duration,
    /// A consensus snapshot is taken every this many applied entries.
    pub snapshot_interval: u64,
    pub propose_queue_size: usize,
    pub collector: CollectorConfig,
}

impl Default for MrConfig {
    fn default() -> Self {
        MrConfig {
            cluster_id: 1,
            node_id: INVALID_NODE_ID,
            replication_factor: 1,
            commit_tick_interval: Duration::from_millis(1),
            snapshot_interval: 10_000,
            propose_queue_size: 4096,
            collector: CollectorConfig::default(),
        }
    }
}

impl MrConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id == INVALID_NODE_ID {
            return Err(Error::InvalidArgument("node id".to_owned()));
        }
        if self.replication_factor == 0 {
            return Err(Error::InvalidArgument("replication factor".to_owned()));
        }
        if self.propose_queue_size == 0 {
            return Err(Error::InvalidArgument("propose queue size".to_owned()));
        }
        self.collector.validate()
    }
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    /// Cadence of report pulls from every storage node.
    pub report_interval: Duration,
    /// Deduplicated streams are re-reported in full after this long.
    pub report_all_interval: Duration,
    pub rpc_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            report_interval: Duration::from_millis(10),
            report_all_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.report_interval.is_zero() || self.rpc_timeout.is_zero() {
            return Err(Error::InvalidArgument("collector interval".to_owned()));
        }
        Ok(())
    }
}
