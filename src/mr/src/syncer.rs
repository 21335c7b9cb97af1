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

//! Cold-start recovery of the metadata repository from surviving storage
//! nodes: union their metadata, install each log stream as sealed, and
//! rebuild the committed history round by round from per-replica commit
//! infos.

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use strom_api::v1::management_client::ManagementClient as RawManagementClient;
use strom_api::v1::*;
use strom_api::{Glsn, Llsn, LogStreamId, StorageNodeId, INVALID_GLSN, MAX_GLSN, MIN_LLSN};

use crate::storage::MetadataStorage;
use crate::{async_trait, Error, Result};

#[async_trait]
pub trait ManagementClient: Send + Sync {
    fn peer_storage_node_id(&self) -> StorageNodeId;

    async fn get_metadata(&self) -> Result<StorageNodeMetadata>;

    async fn get_prev_commit_info(&self, hwm: Glsn) -> Result<GetPrevCommitInfoResponse>;
}

pub struct GrpcManagementClient {
    storage_node_id: StorageNodeId,
    raw: RawManagementClient<tonic::transport::Channel>,
}

impl GrpcManagementClient {
    pub async fn connect(
        storage_node_id: StorageNodeId,
        address: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{address}"))
            .map_err(Error::Transport)?
            .connect_timeout(timeout);
        let channel = endpoint.connect().await?;
        Ok(GrpcManagementClient { storage_node_id, raw: RawManagementClient::new(channel) })
    }
}

#[async_trait]
impl ManagementClient for GrpcManagementClient {
    fn peer_storage_node_id(&self) -> StorageNodeId {
        self.storage_node_id
    }

    async fn get_metadata(&self) -> Result<StorageNodeMetadata> {
        let mut raw = self.raw.clone();
        let rsp = raw.get_metadata(GetMetadataRequest {}).await.map_err(Error::from)?;
        rsp.into_inner().metadata.ok_or_else(|| Error::InvalidData("metadata".to_owned()))
    }

    async fn get_prev_commit_info(&self, hwm: Glsn) -> Result<GetPrevCommitInfoResponse> {
        let mut raw = self.raw.clone();
        let rsp = raw
            .get_prev_commit_info(GetPrevCommitInfoRequest { high_watermark: hwm })
            .await
            .map_err(Error::from)?;
        Ok(rsp.into_inner())
    }
}

pub struct StateMachineSyncer {
    replication_factor: usize,
    clients: Vec<Box<dyn ManagementClient>>,
}

impl StateMachineSyncer {
    pub fn new(clients: Vec<Box<dyn ManagementClient>>, replication_factor: usize) -> Self {
        StateMachineSyncer { replication_factor, clients }
    }

    /// Union descriptors from every surviving storage node into `storage`.
    /// Streams with a full replica set are installed sealed; over-replicated
    /// ones keep the replicas with the highest watermark, breaking ties by
    /// most recent update.
    pub async fn sync_metadata(&self, storage: &MetadataStorage) -> Result<()> {
        let mut collected: HashMap<LogStreamId, Vec<(StorageNodeId, LogStreamReplicaMetadata)>> =
            HashMap::new();

        for client in &self.clients {
            let meta = client.get_metadata().await?;
            let Some(sn) = meta.storage_node else {
                continue;
            };
            info!("syncer: storage node {} reports {} log streams",
                sn.storage_node_id, meta.log_streams.len());

            match storage.register_storage_node(&sn, 0, 0) {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
            for ls in meta.log_streams {
                collected.entry(ls.log_stream_id).or_default().push((sn.storage_node_id, ls));
            }
        }

        for ls in storage.get_log_streams() {
            if !collected.contains_key(&ls.log_stream_id) {
                return Err(Error::Internal(format!(
                    "log stream {} missing from every surviving storage node",
                    ls.log_stream_id
                )));
            }
        }

        for (lsid, mut replicas) in collected {
            let old = storage.lookup_log_stream(lsid);
            if let Some(old) = &old {
                if same_replica_set(&old.replicas, &replicas) {
                    continue;
                }
            }

            if replicas.len() < self.replication_factor {
                if old.is_some() {
                    return Err(Error::Internal(format!(
                        "log stream {lsid}: {} of {} replicas survived",
                        replicas.len(),
                        self.replication_factor
                    )));
                }
                if replicas.iter().any(|(_, r)| r.local_high_watermark != INVALID_GLSN) {
                    return Err(Error::Internal(format!(
                        "log stream {lsid}: committed replicas below the replication factor"
                    )));
                }
                // The stream never finished creation; skip it.
                continue;
            }

            if replicas.len() > self.replication_factor {
                replicas.sort_by(|(_, a), (_, b)| {
                    b.local_high_watermark
                        .cmp(&a.local_high_watermark)
                        .then(b.updated_at_millis.cmp(&a.updated_at_millis))
                });
                replicas.truncate(self.replication_factor);
            }

            let topic_id = replicas[0].1.topic_id;
            let descriptor = LogStreamDescriptor {
                log_stream_id: lsid,
                topic_id,
                status: LogStreamStatus::Sealed as i32,
                replicas: replicas
                    .iter()
                    .map(|(snid, replica)| ReplicaDescriptor {
                        storage_node_id: *snid,
                        path: replica.path.clone(),
                    })
                    .collect(),
            };

            if old.is_none() {
                storage.register_log_stream(&descriptor, 0, 0)?;
            } else {
                storage.update_log_stream(&descriptor, 0, 0)?;
            }
        }

        Ok(())
    }

    /// Rebuild the committed history from the storage nodes, one round at a
    /// time, until no node knows a round past the reconstructed watermark.
    pub async fn sync_commit_results(&self, storage: &MetadataStorage) -> Result<()> {
        self.sync_metadata(storage).await?;

        loop {
            let prev = storage.get_last_commit_results();
            let mut ctx = self.init_commit_result_context(&prev).await?;
            if ctx.results.high_watermark == INVALID_GLSN {
                break;
            }
            ctx.build_commit_results()?;
            ctx.validate()?;
            storage.append_commit_results(ctx.results);
        }

        Ok(())
    }

    async fn init_commit_result_context(
        &self,
        prev: &Option<LogStreamCommitResults>,
    ) -> Result<CommitResultContext> {
        let prev_hwm = prev.as_ref().map(|p| p.high_watermark).unwrap_or(INVALID_GLSN);
        let mut ctx = CommitResultContext {
            prev: prev.clone(),
            commit_infos: HashMap::new(),
            highest_llsns: HashMap::new(),
            sorted_lsids: Vec::new(),
            expected_commit: 0,
            num_commit: 0,
            results: LogStreamCommitResults::default(),
        };

        for client in &self.clients {
            let snid = client.peer_storage_node_id();
            let rsp = client.get_prev_commit_info(prev_hwm).await?;
            for info in rsp.commit_infos {
                match info.status() {
                    CommitInfoStatus::Inconsistent => {
                        return Err(Error::Internal(format!(
                            "inconsistent commit info, snid {snid}, hwm {prev_hwm}"
                        )));
                    }
                    CommitInfoStatus::Ok => {
                        ctx.results.high_watermark = info.high_watermark;
                        ctx.results.prev_high_watermark = info.prev_high_watermark;
                    }
                    CommitInfoStatus::None => {}
                }

                if !ctx.commit_infos.contains_key(&info.log_stream_id) {
                    ctx.sorted_lsids.push(info.log_stream_id);
                }
                // What every replica has written bounds what may have been
                // committed.
                let highest =
                    ctx.highest_llsns.entry(info.log_stream_id).or_insert(info.highest_written_llsn);
                if *highest > info.highest_written_llsn {
                    *highest = info.highest_written_llsn;
                }
                ctx.commit_infos.entry(info.log_stream_id).or_default().push(info);
            }
        }

        if ctx.results.high_watermark != INVALID_GLSN {
            ctx.sorted_lsids.sort_unstable();
            ctx.expected_commit = ctx.results.high_watermark - ctx.results.prev_high_watermark;
        }
        Ok(ctx)
    }
}

struct CommitResultContext {
    prev: Option<LogStreamCommitResults>,
    commit_infos: HashMap<LogStreamId, Vec<LogStreamCommitInfo>>,
    highest_llsns: HashMap<LogStreamId, Llsn>,
    sorted_lsids: Vec<LogStreamId>,
    expected_commit: u64,
    num_commit: u64,
    results: LogStreamCommitResults,
}

impl CommitResultContext {
    fn build_commit_results(&mut self) -> Result<()> {
        for &lsid in &self.sorted_lsids {
            let mut cr = LogStreamCommitResult {
                log_stream_id: lsid,
                committed_llsn_offset: strom_api::INVALID_LLSN,
                committed_glsn_offset: INVALID_GLSN,
                committed_glsn_length: 0,
            };
            if let Some(infos) = self.commit_infos.get(&lsid) {
                if let Some(info) =
                    infos.iter().find(|info| info.status() == CommitInfoStatus::Ok)
                {
                    cr.committed_llsn_offset = info.committed_llsn_offset;
                    cr.committed_glsn_offset = info.committed_glsn_offset;
                    cr.committed_glsn_length = info.committed_glsn_length;
                }
            }
            self.num_commit += cr.committed_glsn_length;
            self.results.commit_results.push(cr);
        }
        self.fill_commit_results()
    }

    /// Bound the committed length of streams nobody has an authoritative
    /// record for, so the round still sums to its watermark delta.
    fn fill_commit_results(&mut self) -> Result<()> {
        let mut cursor = self
            .prev
            .as_ref()
            .map(|prev| prev.high_watermark)
            .unwrap_or(INVALID_GLSN)
            + 1;

        for idx in 0..self.results.commit_results.len() {
            let cr = &self.results.commit_results[idx];
            if cr.committed_glsn_offset != INVALID_GLSN {
                if cursor != cr.committed_glsn_offset {
                    return Err(Error::Internal(format!(
                        "committed glsn offset mismatch: lsid {}, expected {cursor}, got {}",
                        cr.log_stream_id, cr.committed_glsn_offset
                    )));
                }
                cursor = cr.committed_glsn_offset + cr.committed_glsn_length;
                continue;
            }

            let lsid = cr.log_stream_id;
            let highest_llsn = self.highest_llsns.get(&lsid).copied().unwrap_or(0);
            let last_committed_llsn = self
                .prev
                .as_ref()
                .and_then(|prev| prev.lookup_commit_result(lsid))
                .map(|prev_cr| prev_cr.committed_llsn_offset + prev_cr.committed_glsn_length - 1)
                .unwrap_or(strom_api::INVALID_LLSN);
            if highest_llsn < last_committed_llsn {
                return Err(Error::Internal(format!(
                    "log stream {lsid}: written {highest_llsn} behind committed \
                     {last_committed_llsn}"
                )));
            }

            let num_uncommit = highest_llsn - last_committed_llsn;
            let boundary =
                boundary_committed_glsn_offset(&self.results.commit_results[idx + 1..]) - cursor;
            let length =
                (self.expected_commit - self.num_commit).min(num_uncommit).min(boundary);

            let cr = &mut self.results.commit_results[idx];
            cr.committed_glsn_length = length;
            cr.committed_llsn_offset = last_committed_llsn + 1;
            cr.committed_glsn_offset = cursor;

            self.num_commit += length;
            cursor += length;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let empty = Vec::new();
        let prev_results =
            self.prev.as_ref().map(|prev| &prev.commit_results).unwrap_or(&empty);
        let cur_results = &self.results.commit_results;

        let mut i = 0;
        let mut j = 0;
        let mut nr_committed = 0u64;
        while i < prev_results.len() && j < cur_results.len() {
            let prev = &prev_results[i];
            let cur = &cur_results[j];
            if prev.log_stream_id < cur.log_stream_id {
                return Err(Error::Internal(
                    "new commit results must include all prior streams".to_owned(),
                ));
            } else if prev.log_stream_id > cur.log_stream_id {
                if cur.committed_llsn_offset != MIN_LLSN {
                    return Err(Error::Internal(format!(
                        "newbie log stream {} must start at the first llsn",
                        cur.log_stream_id
                    )));
                }
                nr_committed += cur.committed_glsn_length;
                j += 1;
            } else {
                if prev.committed_llsn_offset + prev.committed_glsn_length
                    != cur.committed_llsn_offset
                {
                    return Err(Error::Internal(format!(
                        "log stream {}: llsn range is not contiguous",
                        cur.log_stream_id
                    )));
                }
                nr_committed += cur.committed_glsn_length;
                i += 1;
                j += 1;
            }
        }
        if i < prev_results.len() {
            return Err(Error::Internal(
                "new commit results must include all prior streams".to_owned(),
            ));
        }
        while j < cur_results.len() {
            let cur = &cur_results[j];
            if cur.committed_llsn_offset != MIN_LLSN {
                return Err(Error::Internal(format!(
                    "newbie log stream {} must start at the first llsn",
                    cur.log_stream_id
                )));
            }
            nr_committed += cur.committed_glsn_length;
            j += 1;
        }

        if nr_committed != self.results.high_watermark - self.results.prev_high_watermark {
            return Err(Error::Internal("commit length does not match watermark delta".to_owned()));
        }
        Ok(())
    }
}

fn boundary_committed_glsn_offset(commit_results: &[LogStreamCommitResult]) -> Glsn {
    for cr in commit_results {
        if cr.committed_glsn_offset != INVALID_GLSN {
            return cr.committed_glsn_offset;
        }
    }
    MAX_GLSN
}

fn same_replica_set(
    orig: &[ReplicaDescriptor],
    collected: &[(StorageNodeId, LogStreamReplicaMetadata)],
) -> bool {
    if orig.len() != collected.len() {
        return false;
    }
    let mut orig_snids: Vec<StorageNodeId> = orig.iter().map(|r| r.storage_node_id).collect();
    let mut collected_snids: Vec<StorageNodeId> =
        collected.iter().map(|(snid, _)| *snid).collect();
    orig_snids.sort_unstable();
    collected_snids.sort_unstable();
    orig_snids == collected_snids
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeNode {
        snid: StorageNodeId,
        metadata: StorageNodeMetadata,
        commit_infos: HashMap<Glsn, Vec<LogStreamCommitInfo>>,
        highest_written: HashMap<LogStreamId, Llsn>,
    }

    impl FakeNode {
        fn new(snid: StorageNodeId, lsids: &[LogStreamId], local_hwm: Glsn) -> Self {
            FakeNode {
                snid,
                metadata: StorageNodeMetadata {
                    storage_node: Some(StorageNodeDescriptor {
                        storage_node_id: snid,
                        address: format!("sn-{snid}"),
                        ..Default::default()
                    }),
                    log_streams: lsids
                        .iter()
                        .map(|&log_stream_id| LogStreamReplicaMetadata {
                            log_stream_id,
                            topic_id: 1,
                            status: LogStreamStatus::Running as i32,
                            path: format!("/vol/cid_1/snid_{snid}/lsid_{log_stream_id}"),
                            local_low_watermark: 0,
                            local_high_watermark: local_hwm,
                            updated_at_millis: snid,
                        })
                        .collect(),
                },
                commit_infos: HashMap::new(),
                highest_written: lsids.iter().map(|&lsid| (lsid, 0)).collect(),
            }
        }

        fn with_round(
            mut self,
            queried_hwm: Glsn,
            hwm: Glsn,
            prev: Glsn,
            infos: &[(LogStreamId, Llsn, Glsn, u64)],
        ) -> Self {
            let mut commit_infos: Vec<LogStreamCommitInfo> = infos
                .iter()
                .map(|&(lsid, llsn_offset, glsn_offset, length)| LogStreamCommitInfo {
                    log_stream_id: lsid,
                    status: CommitInfoStatus::Ok as i32,
                    committed_llsn_offset: llsn_offset,
                    committed_glsn_offset: glsn_offset,
                    committed_glsn_length: length,
                    highest_written_llsn: *self.highest_written.get(&lsid).unwrap_or(&0),
                    high_watermark: hwm,
                    prev_high_watermark: prev,
                })
                .collect();
            // A real node answers for every hosted stream, without a record
            // where it has none.
            for ls in &self.metadata.log_streams {
                if !commit_infos.iter().any(|info| info.log_stream_id == ls.log_stream_id) {
                    commit_infos.push(LogStreamCommitInfo {
                        log_stream_id: ls.log_stream_id,
                        status: CommitInfoStatus::None as i32,
                        highest_written_llsn: *self
                            .highest_written
                            .get(&ls.log_stream_id)
                            .unwrap_or(&0),
                        ..Default::default()
                    });
                }
            }
            self.commit_infos.insert(queried_hwm, commit_infos);
            self
        }

        fn with_highest_written(mut self, lsid: LogStreamId, llsn: Llsn) -> Self {
            self.highest_written.insert(lsid, llsn);
            for infos in self.commit_infos.values_mut() {
                for info in infos.iter_mut() {
                    if info.log_stream_id == lsid {
                        info.highest_written_llsn = llsn;
                    }
                }
            }
            self
        }

        fn none_infos(&self) -> Vec<LogStreamCommitInfo> {
            self.metadata
                .log_streams
                .iter()
                .map(|ls| LogStreamCommitInfo {
                    log_stream_id: ls.log_stream_id,
                    status: CommitInfoStatus::None as i32,
                    highest_written_llsn: *self
                        .highest_written
                        .get(&ls.log_stream_id)
                        .unwrap_or(&0),
                    ..Default::default()
                })
                .collect()
        }
    }

    #[async_trait]
    impl ManagementClient for FakeNode {
        fn peer_storage_node_id(&self) -> StorageNodeId {
            self.snid
        }

        async fn get_metadata(&self) -> Result<StorageNodeMetadata> {
            Ok(self.metadata.clone())
        }

        async fn get_prev_commit_info(&self, hwm: Glsn) -> Result<GetPrevCommitInfoResponse> {
            Ok(GetPrevCommitInfoResponse {
                storage_node_id: self.snid,
                commit_infos: self
                    .commit_infos
                    .get(&hwm)
                    .cloned()
                    .unwrap_or_else(|| self.none_infos()),
            })
        }
    }

    #[tokio::test]
    async fn rebuilds_history_from_surviving_nodes() {
        // Two storage nodes, both hosting streams 1 and 2, with two commit
        // rounds: 0 -> 2 and 2 -> 4, one entry per stream each.
        let make_node = |snid| {
            FakeNode::new(snid, &[1, 2], 4)
                .with_highest_written(1, 2)
                .with_highest_written(2, 2)
                .with_round(0, 2, 0, &[(1, 1, 1, 1), (2, 1, 2, 1)])
                .with_round(2, 4, 2, &[(1, 2, 3, 1), (2, 2, 4, 1)])
        };
        let syncer =
            StateMachineSyncer::new(vec![Box::new(make_node(1)), Box::new(make_node(2))], 2);

        let storage = MetadataStorage::new(None, 10_000);
        storage.run();
        syncer.sync_commit_results(&storage).await.unwrap();

        // Metadata: both nodes registered, streams installed sealed.
        assert!(storage.lookup_storage_node(1).is_some());
        assert!(storage.lookup_storage_node(2).is_some());
        let ls = storage.lookup_log_stream(1).unwrap();
        assert_eq!(ls.status(), LogStreamStatus::Sealed);
        assert_eq!(ls.replicas.len(), 2);

        // History: both rounds reconstructed.
        assert_eq!(storage.get_high_watermark(), 4);
        let round = storage.lookup_commit_results(4).unwrap();
        assert_eq!(round.prev_high_watermark, 2);
        assert_eq!(round.commit_results.len(), 2);
        assert_eq!(round.commit_results[0].committed_llsn_offset, 2);
        storage.close();
    }

    #[tokio::test]
    async fn fills_streams_without_authoritative_records() {
        // The node has an authoritative record for stream 1 only; stream 2's
        // share of the round is bounded by what was written.
        let node = FakeNode::new(1, &[1, 2], 3)
            .with_highest_written(1, 1)
            .with_highest_written(2, 2)
            .with_round(0, 3, 0, &[(1, 1, 1, 1)]);
        let syncer = StateMachineSyncer::new(vec![Box::new(node)], 1);

        let storage = MetadataStorage::new(None, 10_000);
        storage.run();
        syncer.sync_commit_results(&storage).await.unwrap();

        assert_eq!(storage.get_high_watermark(), 3);
        let round = storage.lookup_commit_results(3).unwrap();
        let filled = round.lookup_commit_result(2).unwrap();
        assert_eq!(filled.committed_llsn_offset, MIN_LLSN);
        assert_eq!(filled.committed_glsn_offset, 2);
        assert_eq!(filled.committed_glsn_length, 2);
        storage.close();
    }

    #[tokio::test]
    async fn inconsistent_commit_info_aborts() {
        let mut node = FakeNode::new(1, &[1], 2).with_round(0, 2, 0, &[(1, 1, 1, 2)]);
        node.commit_infos.get_mut(&0).unwrap()[0].status = CommitInfoStatus::Inconsistent as i32;
        let syncer = StateMachineSyncer::new(vec![Box::new(node)], 1);

        let storage = MetadataStorage::new(None, 10_000);
        storage.run();
        assert!(syncer.sync_commit_results(&storage).await.is_err());
        storage.close();
    }

    #[tokio::test]
    async fn over_replicated_streams_keep_the_freshest_replicas() {
        // Three survivors for a replication factor of two: the replica with
        // the lowest watermark is dropped.
        let nodes: Vec<Box<dyn ManagementClient>> = vec![
            Box::new(FakeNode::new(1, &[1], 5)),
            Box::new(FakeNode::new(2, &[1], 5)),
            Box::new(FakeNode::new(3, &[1], 2)),
        ];
        let syncer = StateMachineSyncer::new(nodes, 2);

        let storage = MetadataStorage::new(None, 10_000);
        storage.run();
        syncer.sync_metadata(&storage).await.unwrap();

        let ls = storage.lookup_log_stream(1).unwrap();
        let mut snids: Vec<StorageNodeId> =
            ls.replicas.iter().map(|r| r.storage_node_id).collect();
        snids.sort_unstable();
        assert_eq!(snids, vec![1, 2]);
        storage.close();
    }
}
