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

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{info, warn};
use strom_api::v1::{
    GetPrevCommitInfoResponse, LogStreamCommitResults, LogStreamStatus, StorageNodeDescriptor,
    StorageNodeMetadata, StorageNodeStatus, StorageNodeUncommitReport,
};
use strom_api::{Glsn, Llsn, LogStreamId, TopicId};
use strom_runtime::TaskGroup;

use crate::executor::{CommittedStatus, LogStreamExecutor};
use crate::replication::{GrpcReplicatorConnector, Replicator};
use crate::storage::{RocksStorage, Storage};
use crate::volume;
use crate::{Error, NodeConfig, Result, StorageConfig};

struct ReplicaHandle {
    executor: Arc<LogStreamExecutor>,
    path: PathBuf,
}

/// One storage node: the set of log stream replicas it hosts, addressed by
/// log stream id.
pub struct StorageNode {
    cfg: NodeConfig,
    executors: RwLock<HashMap<LogStreamId, ReplicaHandle>>,
    task_group: TaskGroup,
}

impl StorageNode {
    pub fn new(cfg: NodeConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        Ok(Arc::new(StorageNode {
            cfg,
            executors: RwLock::new(HashMap::new()),
            task_group: TaskGroup::default(),
        }))
    }

    #[inline]
    pub fn storage_node_id(&self) -> strom_api::StorageNodeId {
        self.cfg.storage_node_id
    }

    pub(crate) fn task_group(&self) -> &TaskGroup {
        &self.task_group
    }

    /// Reopen every log stream replica found under the volume.
    pub fn load_volume(&self) -> Result<Vec<LogStreamId>> {
        let paths = volume::read_log_stream_paths(
            &self.cfg.volume,
            self.cfg.cluster_id,
            self.cfg.storage_node_id,
        )?;
        let mut loaded = Vec::with_capacity(paths.len());
        for (log_stream_id, path) in paths {
            let storage = Arc::new(RocksStorage::open(&path, StorageConfig::default())?);
            self.install_log_stream(0, log_stream_id, storage, path.clone())?;
            info!("storage node {}: restored log stream {log_stream_id} from {}",
                self.cfg.storage_node_id, path.display());
            loaded.push(log_stream_id);
        }
        Ok(loaded)
    }

    /// Create a new log stream replica backed by an on-disk store under the
    /// volume.
    pub fn add_log_stream(&self, topic_id: TopicId, log_stream_id: LogStreamId) -> Result<PathBuf> {
        let path = volume::create_log_stream_path(
            &self.cfg.volume,
            self.cfg.cluster_id,
            self.cfg.storage_node_id,
            log_stream_id,
        )?;
        let storage = Arc::new(RocksStorage::open(&path, StorageConfig::default())?);
        self.install_log_stream(topic_id, log_stream_id, storage, path.clone())?;
        Ok(path)
    }

    /// Create a log stream replica on a caller-provided storage. Used by
    /// tests with the in-memory store.
    pub fn add_log_stream_with_storage(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        storage: Arc<dyn Storage>,
    ) -> Result<()> {
        self.install_log_stream(topic_id, log_stream_id, storage, PathBuf::new())
    }

    fn install_log_stream(
        &self,
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        storage: Arc<dyn Storage>,
        path: PathBuf,
    ) -> Result<()> {
        let mut executors = self.executors.write().expect("Poisoned");
        if executors.contains_key(&log_stream_id) {
            return Err(Error::AlreadyExists(format!("log stream {log_stream_id}")));
        }
        let replicator = Replicator::new(Box::new(GrpcReplicatorConnector {
            replicate_timeout: self.cfg.executor.replicate_timeout,
        }));
        let executor = Arc::new(LogStreamExecutor::new(
            topic_id,
            log_stream_id,
            storage,
            replicator,
            self.cfg.executor.clone(),
        )?);
        executors.insert(log_stream_id, ReplicaHandle { executor, path });
        Ok(())
    }

    pub fn remove_log_stream(&self, log_stream_id: LogStreamId) -> Result<()> {
        let handle = self
            .executors
            .write()
            .expect("Poisoned")
            .remove(&log_stream_id)
            .ok_or_else(|| Error::NotExist(format!("log stream {log_stream_id}")))?;
        handle.executor.close();
        Ok(())
    }

    pub fn get_executor(&self, log_stream_id: LogStreamId) -> Result<Arc<LogStreamExecutor>> {
        self.executors
            .read()
            .expect("Poisoned")
            .get(&log_stream_id)
            .map(|handle| Arc::clone(&handle.executor))
            .ok_or_else(|| Error::NotExist(format!("log stream {log_stream_id}")))
    }

    /// Uncommitted-region report over every hosted replica, sorted by log
    /// stream id.
    pub fn get_report(&self) -> StorageNodeUncommitReport {
        let executors = self.executors.read().expect("Poisoned");
        let mut reports: Vec<_> =
            executors.values().map(|handle| handle.executor.get_report()).collect();
        reports.sort_by_key(|report| report.log_stream_id);
        StorageNodeUncommitReport {
            storage_node_id: self.cfg.storage_node_id,
            uncommit_reports: reports,
        }
    }

    /// Fan a commit round out to the hosted replicas it names. Decisions for
    /// replicas this node does not host are skipped.
    pub async fn commit(&self, results: LogStreamCommitResults) -> Result<()> {
        let targets: Vec<(Arc<LogStreamExecutor>, CommittedStatus)> = {
            let executors = self.executors.read().expect("Poisoned");
            results
                .commit_results
                .iter()
                .filter_map(|cr| {
                    executors.get(&cr.log_stream_id).map(|handle| {
                        (
                            Arc::clone(&handle.executor),
                            CommittedStatus {
                                log_stream_id: cr.log_stream_id,
                                high_watermark: results.high_watermark,
                                prev_high_watermark: results.prev_high_watermark,
                                committed_glsn_offset: cr.committed_glsn_offset,
                                committed_glsn_length: cr.committed_glsn_length,
                            },
                        )
                    })
                })
                .collect()
        };

        for (executor, status) in targets {
            if let Err(err) = executor.commit(status).await {
                warn!(
                    "storage node {}: commit push to log stream {}: {err}",
                    self.cfg.storage_node_id,
                    executor.log_stream_id()
                );
            }
        }
        Ok(())
    }

    pub fn seal(
        &self,
        log_stream_id: LogStreamId,
        last_committed_glsn: Glsn,
    ) -> Result<(LogStreamStatus, Glsn)> {
        let executor = self.get_executor(log_stream_id)?;
        Ok(executor.seal(last_committed_glsn))
    }

    pub fn unseal(&self, log_stream_id: LogStreamId) -> Result<()> {
        let executor = self.get_executor(log_stream_id)?;
        executor.unseal()
    }

    pub async fn replicate(
        &self,
        log_stream_id: LogStreamId,
        llsn: Llsn,
        payload: Bytes,
    ) -> Result<()> {
        let executor = self.get_executor(log_stream_id)?;
        executor.replicate(llsn, payload).await
    }

    pub fn get_metadata(&self) -> StorageNodeMetadata {
        let executors = self.executors.read().expect("Poisoned");
        let mut log_streams: Vec<_> = executors
            .iter()
            .map(|(_, handle)| {
                let mut meta = handle.executor.metadata();
                meta.path = handle.path.display().to_string();
                meta
            })
            .collect();
        log_streams.sort_by_key(|meta| meta.log_stream_id);
        StorageNodeMetadata {
            storage_node: Some(StorageNodeDescriptor {
                storage_node_id: self.cfg.storage_node_id,
                address: self.cfg.address.clone(),
                status: StorageNodeStatus::Running as i32,
                storages: vec![strom_api::v1::StorageDescriptor {
                    path: self.cfg.volume.display().to_string(),
                }],
            }),
            log_streams,
        }
    }

    pub fn get_prev_commit_info(&self, high_watermark: Glsn) -> GetPrevCommitInfoResponse {
        let executors = self.executors.read().expect("Poisoned");
        let mut commit_infos: Vec<_> = executors
            .values()
            .map(|handle| handle.executor.get_prev_commit_info(high_watermark))
            .collect();
        commit_infos.sort_by_key(|info| info.log_stream_id);
        GetPrevCommitInfoResponse { storage_node_id: self.cfg.storage_node_id, commit_infos }
    }

    pub fn close(&self) {
        let executors = self.executors.read().expect("Poisoned");
        for handle in executors.values() {
            handle.executor.close();
        }
        self.task_group.abort_all();
    }
}

impl Drop for StorageNode {
    fn drop(&mut self) {
        self.close();
    }
}
