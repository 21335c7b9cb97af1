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

//! The metadata repository: proposals in, ordered state transitions out.
//!
//! Every mutation travels through the consensus log and is applied by a
//! single sequential task. Admin operations are guaranteed proposals acked
//! through a per-request channel once applied; reports and periodic commit
//! rounds are best-effort and simply retried on the next tick when the
//! propose channel is saturated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use prost::Message;
use strom_api::v1::raft_entry::Request;
use strom_api::v1::*;
use strom_api::{Glsn, LogStreamId, NodeId, StorageNodeId, INVALID_GLSN, MAX_GLSN, MIN_LLSN};
use strom_runtime::{Shutdown, ShutdownNotifier, TaskGroup};
use tokio::sync::{mpsc, oneshot, watch};

use crate::consensus::{CommittedEntry, ConfChange, ConfChangeKind, RaftHandle, RaftRole};
use crate::report_collector::{CollectorHelper, ReportCollector};
use crate::reporter_client::{ReporterClient, ReporterClientFactory};
use crate::storage::{CacheCallback, MetadataStorage};
use crate::{async_trait, Error, MrConfig, Result};

const UNUSED_REQUEST_INDEX: u64 = 0;

/// Pending acks of guaranteed proposals, keyed by request index. The
/// metadata storage completes them when the metadata cache catches up with
/// the applied entry.
struct AckHub {
    node_id: NodeId,
    next_request_index: AtomicU64,
    requests: DashMap<u64, oneshot::Sender<Result<()>>>,
}

impl AckHub {
    fn new(node_id: NodeId) -> Arc<Self> {
        Arc::new(AckHub { node_id, next_request_index: AtomicU64::new(1), requests: DashMap::new() })
    }

    fn register(&self) -> (u64, oneshot::Receiver<Result<()>>) {
        let request_index = self.next_request_index.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();
        self.requests.insert(request_index, tx);
        (request_index, rx)
    }

    fn forget(&self, request_index: u64) {
        self.requests.remove(&request_index);
    }

    fn ack(&self, node_index: u64, request_index: u64, result: Result<()>) {
        if node_index != self.node_id || request_index == UNUSED_REQUEST_INDEX {
            return;
        }
        if let Some((_, tx)) = self.requests.remove(&request_index) {
            let _ = tx.send(result);
        }
    }
}

/// The collector's window into this metadata repository: reporter clients,
/// the best-effort report propose path, and commit round lookups.
struct CollectorBridge {
    node_id: NodeId,
    storage: Arc<MetadataStorage>,
    propose_tx: mpsc::Sender<Vec<u8>>,
    factory: Arc<dyn ReporterClientFactory>,
}

#[async_trait]
impl CollectorHelper for CollectorBridge {
    async fn get_reporter_client(
        &self,
        sn: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>> {
        self.factory.get_reporter_client(sn).await
    }

    fn propose_report(
        &self,
        snid: StorageNodeId,
        reports: Vec<LogStreamUncommitReport>,
    ) -> Result<()> {
        let entry = RaftEntry {
            node_index: self.node_id,
            request_index: UNUSED_REQUEST_INDEX,
            applied_index: 0,
            request: Some(Request::Report(Report {
                report: Some(StorageNodeUncommitReport {
                    storage_node_id: snid,
                    uncommit_reports: reports,
                }),
            })),
        };
        self.propose_tx.try_send(entry.encode_to_vec()).map_err(|_| Error::Ignore)
    }

    fn lookup_next_commit_results(&self, glsn: Glsn) -> Result<Option<LogStreamCommitResults>> {
        if let Some(first) = self.storage.get_first_commit_results() {
            if first.prev_high_watermark > glsn {
                return Err(Error::Trimmed);
            }
        }
        Ok(self.storage.lookup_next_commit_results(glsn))
    }
}

pub struct MetadataRepository {
    inner: Arc<MrInner>,
    task_group: TaskGroup,
    shutdown: ShutdownNotifier,
}

struct MrInner {
    cfg: MrConfig,
    storage: Arc<MetadataStorage>,
    collector: Arc<ReportCollector>,
    acks: Arc<AckHub>,
    propose_tx: mpsc::Sender<Vec<u8>>,
    conf_change_tx: mpsc::Sender<ConfChange>,
    is_leader: AtomicBool,
}

impl MetadataRepository {
    /// Wire the state machine to its consensus log and start the apply,
    /// role and commit-tick loops.
    pub fn start(
        cfg: MrConfig,
        raft: RaftHandle,
        factory: Arc<dyn ReporterClientFactory>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;

        let acks = AckHub::new(cfg.node_id);
        let cache_cb: CacheCallback = {
            let acks = Arc::clone(&acks);
            Box::new(move |node_index, request_index, result| {
                acks.ack(node_index, request_index, result)
            })
        };
        let storage = MetadataStorage::new(Some(cache_cb), cfg.snapshot_interval);
        storage.run();

        let bridge = Arc::new(CollectorBridge {
            node_id: cfg.node_id,
            storage: Arc::clone(&storage),
            propose_tx: raft.propose_tx.clone(),
            factory,
        });
        let collector = Arc::new(ReportCollector::new(bridge, cfg.collector.clone()));
        collector.run();

        let inner = Arc::new(MrInner {
            cfg,
            storage,
            collector,
            acks,
            propose_tx: raft.propose_tx,
            conf_change_tx: raft.conf_change_tx,
            is_leader: AtomicBool::new(false),
        });

        let shutdown = ShutdownNotifier::new();
        let task_group = TaskGroup::default();
        task_group.add_task(strom_runtime::spawn(MrInner::apply_loop(
            Arc::clone(&inner),
            raft.commit_rx,
            shutdown.subscribe(),
        )));
        task_group.add_task(strom_runtime::spawn(MrInner::role_loop(
            Arc::clone(&inner),
            raft.role_rx,
            shutdown.subscribe(),
        )));
        task_group.add_task(strom_runtime::spawn(MrInner::commit_tick_loop(
            Arc::clone(&inner),
            shutdown.subscribe(),
        )));

        Ok(Arc::new(MetadataRepository { inner, task_group, shutdown }))
    }

    pub fn close(&self) {
        self.shutdown.notify();
        self.inner.collector.close();
        self.inner.storage.close();
        self.task_group.abort_all();
    }

    // ---- admin surface (guaranteed proposals) ----

    pub async fn register_storage_node(&self, sn: StorageNodeDescriptor) -> Result<()> {
        self.inner
            .propose_and_wait(Request::RegisterStorageNode(RegisterStorageNode {
                storage_node: Some(sn),
            }))
            .await
    }

    pub async fn unregister_storage_node(&self, snid: StorageNodeId) -> Result<()> {
        self.inner
            .propose_and_wait(Request::UnregisterStorageNode(UnregisterStorageNode {
                storage_node_id: snid,
            }))
            .await
    }

    pub async fn register_log_stream(&self, ls: LogStreamDescriptor) -> Result<()> {
        self.inner
            .propose_and_wait(Request::RegisterLogStream(RegisterLogStream {
                log_stream: Some(ls),
            }))
            .await
    }

    pub async fn unregister_log_stream(&self, lsid: LogStreamId) -> Result<()> {
        self.inner
            .propose_and_wait(Request::UnregisterLogStream(UnregisterLogStream {
                log_stream_id: lsid,
            }))
            .await
    }

    pub async fn update_log_stream(&self, ls: LogStreamDescriptor) -> Result<()> {
        self.inner
            .propose_and_wait(Request::UpdateLogStream(UpdateLogStream { log_stream: Some(ls) }))
            .await
    }

    /// Seal `lsid`: drain quorum-acknowledged entries with a final commit
    /// round, freeze the stream, and return its last committed GLSN.
    pub async fn seal(&self, lsid: LogStreamId) -> Result<Glsn> {
        match self.inner.propose_and_wait(Request::Seal(Seal { log_stream_id: lsid })).await {
            Ok(()) | Err(Error::Ignore) => Ok(self.inner.get_last_committed(lsid)),
            Err(err) => Err(err),
        }
    }

    pub async fn unseal(&self, lsid: LogStreamId) -> Result<()> {
        match self.inner.propose_and_wait(Request::Unseal(Unseal { log_stream_id: lsid })).await {
            Ok(()) | Err(Error::Ignore) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn register_endpoint(&self, node_id: NodeId, url: String) -> Result<()> {
        self.inner
            .propose_and_wait(Request::RegisterEndpoint(RegisterEndpoint { node_id, url }))
            .await
    }

    pub async fn add_peer(&self, node_id: NodeId, url: String) -> Result<()> {
        let change = ConfChange { kind: ConfChangeKind::AddNode, node_id, context: url };
        self.inner.conf_change_tx.send(change).await.map_err(|_| Error::Closed)
    }

    pub async fn remove_peer(&self, node_id: NodeId) -> Result<()> {
        let change =
            ConfChange { kind: ConfChangeKind::RemoveNode, node_id, context: String::new() };
        self.inner.conf_change_tx.send(change).await.map_err(|_| Error::Closed)
    }

    // ---- read surface ----

    pub fn get_metadata(&self) -> Arc<MetadataDescriptor> {
        self.inner.storage.get_metadata()
    }

    pub fn high_watermark(&self) -> Glsn {
        self.inner.storage.get_high_watermark()
    }

    pub fn lookup_endpoint(&self, node_id: NodeId) -> Option<String> {
        self.inner.storage.lookup_endpoint(node_id)
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.inner.storage.is_member(node_id)
    }

    pub fn storage(&self) -> &Arc<MetadataStorage> {
        &self.inner.storage
    }

    pub fn collector(&self) -> &Arc<ReportCollector> {
        &self.inner.collector
    }

    /// Install a consensus snapshot and rebuild the collector tree from it.
    pub fn restore_from_snapshot(&self, data: &[u8], applied_index: u64) -> Result<()> {
        self.inner.storage.apply_snapshot(data, applied_index)?;
        self.inner.collector.reset();
        self.inner.collector.recover(
            &self.inner.storage.get_storage_nodes(),
            &self.inner.storage.get_log_streams(),
            self.inner.storage.get_high_watermark(),
        )?;
        Ok(())
    }
}

impl MrInner {
    async fn propose_and_wait(&self, request: Request) -> Result<()> {
        let (request_index, rx) = self.acks.register();
        let entry = RaftEntry {
            node_index: self.cfg.node_id,
            request_index,
            applied_index: 0,
            request: Some(request),
        };
        if self.propose_tx.send(entry.encode_to_vec()).await.is_err() {
            self.acks.forget(request_index);
            return Err(Error::Closed);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        }
    }

    fn propose_best_effort(&self, request: Request) -> Result<()> {
        let entry = RaftEntry {
            node_index: self.cfg.node_id,
            request_index: UNUSED_REQUEST_INDEX,
            applied_index: 0,
            request: Some(request),
        };
        self.propose_tx.try_send(entry.encode_to_vec()).map_err(|_| Error::Ignore)
    }

    async fn apply_loop(
        inner: Arc<MrInner>,
        mut commit_rx: mpsc::Receiver<CommittedEntry>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let entry = tokio::select! {
                _ = shutdown.wait() => break,
                entry = commit_rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            match entry {
                CommittedEntry::Entry { index, data } => inner.apply_entry(index, &data),
                CommittedEntry::ConfChange { index, change } => {
                    inner.apply_conf_change(index, change)
                }
            }
        }
    }

    async fn role_loop(
        inner: Arc<MrInner>,
        mut role_rx: watch::Receiver<RaftRole>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let role = *role_rx.borrow();
            inner.is_leader.store(role == RaftRole::Leader, Ordering::Release);
            tokio::select! {
                _ = shutdown.wait() => break,
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn commit_tick_loop(inner: Arc<MrInner>, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(inner.cfg.commit_tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            }
            // Only the leader schedules commit rounds; followers still apply
            // them from the log.
            if !inner.is_leader.load(Ordering::Acquire) {
                continue;
            }
            // Saturation means a round is already queued up; skip the tick.
            let _ = inner.propose_best_effort(Request::Commit(Commit {}));
        }
    }

    fn apply_entry(&self, index: u64, data: &[u8]) {
        let entry = match RaftEntry::decode(data) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("undecodable raft entry at index {index}: {err}");
                return;
            }
        };
        let node_index = entry.node_index;
        let request_index = entry.request_index;

        match entry.request {
            Some(Request::RegisterStorageNode(r)) => {
                self.apply_register_storage_node(r, node_index, request_index)
            }
            Some(Request::UnregisterStorageNode(r)) => {
                self.apply_unregister_storage_node(r, node_index, request_index)
            }
            Some(Request::RegisterLogStream(r)) => {
                self.apply_register_log_stream(r, node_index, request_index)
            }
            Some(Request::UnregisterLogStream(r)) => {
                self.apply_unregister_log_stream(r, node_index, request_index)
            }
            Some(Request::UpdateLogStream(r)) => {
                self.apply_update_log_stream(r, node_index, request_index)
            }
            Some(Request::Report(r)) => self.apply_report(r),
            Some(Request::Commit(_)) => self.apply_commit(),
            Some(Request::Seal(r)) => self.apply_seal(r, node_index, request_index),
            Some(Request::Unseal(r)) => self.apply_unseal(r, node_index, request_index),
            Some(Request::RegisterEndpoint(r)) => {
                self.storage.register_endpoint(r.node_id, &r.url, node_index, request_index)
            }
            None => {}
        }

        self.storage.update_applied_index(index);
    }

    fn apply_conf_change(&self, index: u64, change: ConfChange) {
        match change.kind {
            ConfChangeKind::AddNode => {
                info!("add peer {} at {}", change.node_id, change.context);
                self.storage.add_peer(change.node_id, &change.context);
            }
            ConfChangeKind::RemoveNode => {
                info!("remove peer {}", change.node_id);
                self.storage.remove_peer(change.node_id);
            }
        }
        self.storage.update_applied_index(index);
    }

    fn apply_register_storage_node(
        &self,
        r: RegisterStorageNode,
        node_index: u64,
        request_index: u64,
    ) {
        let Some(sn) = r.storage_node.filter(|sn| sn.storage_node_id != 0) else {
            self.acks.ack(
                node_index,
                request_index,
                Err(Error::InvalidArgument("storage node descriptor".to_owned())),
            );
            return;
        };
        if self.storage.register_storage_node(&sn, node_index, request_index).is_ok() {
            if let Err(err) = self.collector.register_storage_node(&sn) {
                warn!("collector register storage node {}: {err}", sn.storage_node_id);
            }
        }
    }

    fn apply_unregister_storage_node(
        &self,
        r: UnregisterStorageNode,
        node_index: u64,
        request_index: u64,
    ) {
        if self
            .storage
            .unregister_storage_node(r.storage_node_id, node_index, request_index)
            .is_ok()
        {
            if let Err(err) = self.collector.unregister_storage_node(r.storage_node_id) {
                warn!("collector unregister storage node {}: {err}", r.storage_node_id);
            }
        }
    }

    fn apply_register_log_stream(&self, r: RegisterLogStream, node_index: u64, request_index: u64) {
        let Some(ls) = r.log_stream.filter(|ls| ls.log_stream_id != 0) else {
            self.acks.ack(
                node_index,
                request_index,
                Err(Error::InvalidArgument("log stream descriptor".to_owned())),
            );
            return;
        };
        if self.storage.register_log_stream(&ls, node_index, request_index).is_ok() {
            let hwm = self.storage.get_high_watermark();
            for replica in &ls.replicas {
                if let Err(err) = self.collector.register_log_stream(
                    replica.storage_node_id,
                    ls.log_stream_id,
                    hwm,
                    ls.status(),
                ) {
                    warn!(
                        "collector register log stream {} on {}: {err}",
                        ls.log_stream_id, replica.storage_node_id
                    );
                }
            }
        }
    }

    fn apply_unregister_log_stream(
        &self,
        r: UnregisterLogStream,
        node_index: u64,
        request_index: u64,
    ) {
        let replicas = self
            .storage
            .lookup_log_stream(r.log_stream_id)
            .map(|ls| ls.replicas)
            .unwrap_or_default();
        if self.storage.unregister_log_stream(r.log_stream_id, node_index, request_index).is_ok() {
            for replica in replicas {
                if let Err(err) = self
                    .collector
                    .unregister_log_stream(replica.storage_node_id, r.log_stream_id)
                {
                    warn!(
                        "collector unregister log stream {} on {}: {err}",
                        r.log_stream_id, replica.storage_node_id
                    );
                }
            }
        }
    }

    fn apply_update_log_stream(&self, r: UpdateLogStream, node_index: u64, request_index: u64) {
        let Some(ls) = r.log_stream else {
            self.acks.ack(
                node_index,
                request_index,
                Err(Error::InvalidArgument("log stream descriptor".to_owned())),
            );
            return;
        };
        let old_replicas = self
            .storage
            .lookup_log_stream(ls.log_stream_id)
            .map(|old| old.replicas)
            .unwrap_or_default();
        if self.storage.update_log_stream(&ls, node_index, request_index).is_ok() {
            let hwm = self.storage.get_high_watermark();
            for replica in &old_replicas {
                if !ls.replicas.iter().any(|r| r.storage_node_id == replica.storage_node_id) {
                    let _ = self
                        .collector
                        .unregister_log_stream(replica.storage_node_id, ls.log_stream_id);
                }
            }
            for replica in &ls.replicas {
                if !old_replicas.iter().any(|r| r.storage_node_id == replica.storage_node_id) {
                    let _ = self.collector.register_log_stream(
                        replica.storage_node_id,
                        ls.log_stream_id,
                        hwm,
                        ls.status(),
                    );
                }
            }
        }
    }

    /// Absorb a storage node's uncommitted-region report. Only entries whose
    /// uncommitted end advanced replace the stored replica state.
    fn apply_report(&self, r: Report) {
        let Some(report) = r.report else {
            return;
        };
        let snid = report.storage_node_id;
        for ls_report in report.uncommit_reports {
            let incoming = UncommitReportReplica {
                uncommitted_llsn_offset: ls_report.uncommitted_llsn_offset,
                uncommitted_llsn_length: ls_report.uncommitted_llsn_length,
                known_high_watermark: ls_report.high_watermark,
            };
            let stored = self.storage.lookup_uncommit_report(ls_report.log_stream_id, snid);
            let advanced = stored
                .map(|s| s.uncommitted_llsn_end() < incoming.uncommitted_llsn_end())
                .unwrap_or(true);
            if advanced {
                self.storage.update_uncommit_report(ls_report.log_stream_id, snid, incoming);
            }
        }
    }

    /// One commit round: aggregate per-stream reports into a
    /// `LogStreamCommitResults`, assigning GLSNs sequentially in log stream
    /// order.
    fn apply_commit(&self) {
        let cur_hwm = self.storage.get_high_watermark();
        let mut trim_hwm = MAX_GLSN;
        let mut committed_offset = cur_hwm + 1;
        let mut nr_committed: u64 = 0;

        let mut results = LogStreamCommitResults {
            prev_high_watermark: cur_hwm,
            ..Default::default()
        };

        if self.storage.num_update_since_commit() > 0 {
            let prev_round = self.storage.get_last_commit_results();
            for lsid in self.storage.get_uncommit_report_ids() {
                let replicas = self.storage.lookup_uncommit_reports(lsid);
                let (known_hwm, min_hwm, mut nr_uncommit) = self.calculate_commit(replicas.as_ref());
                if min_hwm < trim_hwm {
                    trim_hwm = min_hwm;
                }

                if known_hwm != cur_hwm {
                    // The freshest replica lags the current round: discount
                    // entries already committed since its watermark.
                    let already_committed = self.num_commit_since(lsid, known_hwm);
                    if already_committed > nr_uncommit {
                        panic!(
                            "log stream {lsid}: commit count {already_committed} exceeds \
                             uncommitted count {nr_uncommit}, known {known_hwm}, cur {cur_hwm}"
                        );
                    }
                    nr_uncommit -= already_committed;
                }

                let committed_llsn_offset = prev_round
                    .as_ref()
                    .and_then(|round| round.lookup_commit_result(lsid))
                    .map(|cr| cr.committed_llsn_offset + cr.committed_glsn_length)
                    .unwrap_or(MIN_LLSN);

                let mut commit = LogStreamCommitResult {
                    log_stream_id: lsid,
                    committed_glsn_offset: committed_offset,
                    committed_glsn_length: nr_uncommit,
                    committed_llsn_offset,
                };
                if nr_uncommit > 0 {
                    committed_offset = commit.committed_glsn_offset + commit.committed_glsn_length;
                } else {
                    // Idempotent zero-length result carrying the prior
                    // committed end.
                    commit.committed_glsn_offset = self.get_last_committed(lsid);
                    commit.committed_glsn_length = 0;
                }
                results.commit_results.push(commit);
                nr_committed += nr_uncommit;
            }
        }
        results.high_watermark = cur_hwm + nr_committed;

        if nr_committed > 0 {
            self.storage.append_commit_results(results);
            if trim_hwm != MAX_GLSN && trim_hwm != INVALID_GLSN {
                self.storage.trim_commit_history(trim_hwm);
            }
        }

        self.collector.commit();
    }

    /// Aggregate one stream's replica reports:
    /// `(knownHWM = max, trimHWM = min, uncommitted = min end - max begin)`.
    fn calculate_commit(&self, replicas: Option<&UncommitReportReplicas>) -> (Glsn, Glsn, u64) {
        let Some(replicas) = replicas else {
            return (INVALID_GLSN, INVALID_GLSN, 0);
        };
        if replicas.replicas.len() < self.cfg.replication_factor {
            return (INVALID_GLSN, INVALID_GLSN, 0);
        }

        let mut begin_llsn = 0;
        let mut end_llsn = u64::MAX;
        let mut known_hwm = INVALID_GLSN;
        let mut trim_hwm = MAX_GLSN;
        for replica in replicas.replicas.values() {
            begin_llsn = begin_llsn.max(replica.uncommitted_llsn_offset);
            end_llsn = end_llsn.min(replica.uncommitted_llsn_end());
            // The freshest observation stands in for the quorum's progress.
            known_hwm = known_hwm.max(replica.known_high_watermark);
            trim_hwm = trim_hwm.min(replica.known_high_watermark);
        }
        if trim_hwm == MAX_GLSN {
            trim_hwm = INVALID_GLSN;
        }

        if begin_llsn > end_llsn {
            return (known_hwm, trim_hwm, 0);
        }
        (known_hwm, trim_hwm, end_llsn - begin_llsn)
    }

    /// Number of entries committed to `lsid` in rounds after `glsn`.
    fn num_commit_since(&self, lsid: LogStreamId, glsn: Glsn) -> u64 {
        let mut num = 0;
        let mut cursor = glsn;
        let highest = self.storage.get_high_watermark();
        while cursor < highest {
            let Some(round) = self.storage.lookup_next_commit_results(cursor) else {
                panic!("no commit round after {cursor}, highest {highest}, lsid {lsid}");
            };
            let Some(cr) = round.lookup_commit_result(lsid) else {
                panic!(
                    "log stream {lsid} missing from commit round {}",
                    round.high_watermark
                );
            };
            num += cr.committed_glsn_length;
            cursor = round.high_watermark;
        }
        num
    }

    /// The last GLSN committed to `lsid`, `INVALID_GLSN` for a newbie.
    fn get_last_committed(&self, lsid: LogStreamId) -> Glsn {
        self.storage
            .get_last_commit_results()
            .and_then(|round| round.lookup_commit_result(lsid).map(|cr| cr.last_committed_glsn()))
            .unwrap_or(INVALID_GLSN)
    }

    fn apply_seal(&self, r: Seal, node_index: u64, request_index: u64) {
        // Drain whatever the quorum already acknowledged before freezing.
        self.apply_commit();
        if self.storage.seal_log_stream(r.log_stream_id, node_index, request_index).is_ok() {
            self.collector.seal(r.log_stream_id);
        }
    }

    fn apply_unseal(&self, r: Unseal, node_index: u64, request_index: u64) {
        if self.storage.unseal_log_stream(r.log_stream_id, node_index, request_index).is_ok() {
            self.collector.unseal(r.log_stream_id, self.storage.get_high_watermark());
        }
    }
}
