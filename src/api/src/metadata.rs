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

use crate::v1::*;
use crate::{LogStreamId, StorageNodeId};

impl LogStreamStatus {
    #[inline]
    pub fn is_running(self) -> bool {
        self == LogStreamStatus::Running
    }

    /// Sealing and sealed streams both refuse new appends.
    #[inline]
    pub fn is_sealed(self) -> bool {
        matches!(self, LogStreamStatus::Sealing | LogStreamStatus::Sealed)
    }

    #[inline]
    pub fn is_deleted(self) -> bool {
        self == LogStreamStatus::Deleted
    }
}

impl StorageNodeStatus {
    #[inline]
    pub fn is_deleted(self) -> bool {
        self == StorageNodeStatus::Deleted
    }
}

/// The metadata descriptor keeps its storage node and log stream lists sorted
/// by id so lookups are binary searches.
impl MetadataDescriptor {
    pub fn get_storage_node(&self, id: StorageNodeId) -> Option<&StorageNodeDescriptor> {
        self.storage_nodes
            .binary_search_by_key(&id, |sn| sn.storage_node_id)
            .ok()
            .map(|idx| &self.storage_nodes[idx])
    }

    /// Insert or replace a storage node descriptor, keeping the list sorted.
    pub fn insert_storage_node(&mut self, sn: StorageNodeDescriptor) {
        match self.storage_nodes.binary_search_by_key(&sn.storage_node_id, |s| s.storage_node_id) {
            Ok(idx) => self.storage_nodes[idx] = sn,
            Err(idx) => self.storage_nodes.insert(idx, sn),
        }
    }

    pub fn delete_storage_node(&mut self, id: StorageNodeId) -> bool {
        match self.storage_nodes.binary_search_by_key(&id, |sn| sn.storage_node_id) {
            Ok(idx) => {
                self.storage_nodes.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// A storage node can be unregistered only while no live log stream
    /// references it as a replica.
    pub fn can_unregister_storage_node(&self, id: StorageNodeId) -> bool {
        !self.log_streams.iter().any(|ls| {
            !ls.status().is_deleted() && ls.replicas.iter().any(|r| r.storage_node_id == id)
        })
    }

    pub fn get_log_stream(&self, id: LogStreamId) -> Option<&LogStreamDescriptor> {
        self.log_streams
            .binary_search_by_key(&id, |ls| ls.log_stream_id)
            .ok()
            .map(|idx| &self.log_streams[idx])
    }

    pub fn get_log_stream_mut(&mut self, id: LogStreamId) -> Option<&mut LogStreamDescriptor> {
        self.log_streams
            .binary_search_by_key(&id, |ls| ls.log_stream_id)
            .ok()
            .map(|idx| &mut self.log_streams[idx])
    }

    /// Insert or replace a log stream descriptor, keeping the list sorted.
    pub fn insert_log_stream(&mut self, ls: LogStreamDescriptor) {
        match self.log_streams.binary_search_by_key(&ls.log_stream_id, |l| l.log_stream_id) {
            Ok(idx) => self.log_streams[idx] = ls,
            Err(idx) => self.log_streams.insert(idx, ls),
        }
    }

    pub fn delete_log_stream(&mut self, id: LogStreamId) -> bool {
        match self.log_streams.binary_search_by_key(&id, |ls| ls.log_stream_id) {
            Ok(idx) => {
                self.log_streams.remove(idx);
                true
            }
            Err(_) => false,
        }
    }
}
