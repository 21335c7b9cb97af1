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

//! Deterministic state machine of the metadata repository.
//!
//! The state is held as two descriptors: an `orig` snapshot which stays
//! immutable while an asynchronous job (consensus snapshot or metadata-cache
//! rebuild) is in flight, and a `diff` overlay receiving mutations in the
//! meantime. Lookups consult the overlay first, honoring tombstones; once no
//! job is running the overlay is folded back into `orig`. Mutation happens
//! only while applying a consensus-ordered entry.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::warn;
use prost::Message;
use strom_api::v1::*;
use strom_api::{Glsn, LogStreamId, NodeId, StorageNodeId, INVALID_GLSN, MAX_GLSN, MIN_LLSN};
use strom_runtime::TaskGroup;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Completion callback of metadata-cache rebuilds, used to ack guaranteed
/// proposals: `(node_index, request_index, result)`.
pub type CacheCallback = Box<dyn Fn(u64, u64, Result<()>) + Send + Sync>;

const JOB_QUEUE_SIZE: usize = 4096;

enum StorageJob {
    Snapshot { state: Arc<MetadataRepositoryDescriptor>, applied_index: u64 },
    Cache { applied_index: u64, node_index: u64, request_index: u64 },
}

#[derive(Default)]
struct SnapshotCell {
    data: Vec<u8>,
    applied_index: u64,
}

pub struct MetadataStorage {
    orig: RwLock<Arc<MetadataRepositoryDescriptor>>,
    diff: RwLock<MetadataRepositoryDescriptor>,
    copy_on_write: AtomicBool,

    snap: RwLock<SnapshotCell>,
    applied_index: AtomicU64,
    snapshot_interval: u64,

    meta_cache: RwLock<Arc<MetadataDescriptor>>,
    meta_applied_index: AtomicU64,
    cache_cb: Option<CacheCallback>,

    nr_running: AtomicI64,
    nr_update_since_commit: AtomicU64,

    job_tx: mpsc::Sender<StorageJob>,
    job_rx: std::sync::Mutex<Option<mpsc::Receiver<StorageJob>>>,
    task_group: TaskGroup,
}

fn empty_state() -> MetadataRepositoryDescriptor {
    MetadataRepositoryDescriptor {
        metadata: Some(MetadataDescriptor::default()),
        ..Default::default()
    }
}

fn meta(desc: &MetadataRepositoryDescriptor) -> &MetadataDescriptor {
    desc.metadata.as_ref().expect("metadata is always set")
}

fn meta_mut(desc: &mut MetadataRepositoryDescriptor) -> &mut MetadataDescriptor {
    desc.metadata.get_or_insert_with(Default::default)
}

impl MetadataStorage {
    pub fn new(cache_cb: Option<CacheCallback>, snapshot_interval: u64) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_SIZE);
        Arc::new(MetadataStorage {
            orig: RwLock::new(Arc::new(empty_state())),
            diff: RwLock::new(empty_state()),
            copy_on_write: AtomicBool::new(false),
            snap: RwLock::new(SnapshotCell::default()),
            applied_index: AtomicU64::new(0),
            snapshot_interval,
            meta_cache: RwLock::new(Arc::new(MetadataDescriptor::default())),
            meta_applied_index: AtomicU64::new(0),
            cache_cb,
            nr_running: AtomicI64::new(0),
            nr_update_since_commit: AtomicU64::new(0),
            job_tx,
            job_rx: std::sync::Mutex::new(Some(job_rx)),
            task_group: TaskGroup::default(),
        })
    }

    /// Start the async job worker. Must be called inside a runtime.
    pub fn run(self: &Arc<Self>) {
        let Some(mut job_rx) = self.job_rx.lock().expect("Poisoned").take() else {
            return;
        };
        let storage = Arc::clone(self);
        self.task_group.add_task(strom_runtime::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                match job {
                    StorageJob::Snapshot { state, applied_index } => {
                        storage.create_snapshot(&state, applied_index);
                    }
                    StorageJob::Cache { applied_index, node_index, request_index } => {
                        storage.create_metadata_cache(applied_index, node_index, request_index);
                    }
                }
                storage.nr_running.fetch_sub(1, Ordering::AcqRel);
            }
        }));
    }

    pub fn close(&self) {
        self.task_group.abort_all();
    }

    #[inline]
    fn is_copy_on_write(&self) -> bool {
        self.copy_on_write.load(Ordering::Acquire)
    }

    #[inline]
    fn set_copy_on_write(&self) {
        self.copy_on_write.store(true, Ordering::Release);
    }

    #[inline]
    fn release_copy_on_write(&self) {
        self.copy_on_write.store(false, Ordering::Release);
    }

    /// Run `f` against the read view `(pre, cur)`. `pre` and `cur` are the
    /// same state unless a copy-on-write overlay is active.
    fn with_view<R>(
        &self,
        f: impl FnOnce(&MetadataRepositoryDescriptor, &MetadataRepositoryDescriptor) -> R,
    ) -> R {
        let orig = self.orig.read().expect("Poisoned").clone();
        if self.is_copy_on_write() {
            let diff = self.diff.read().expect("Poisoned");
            f(&orig, &diff)
        } else {
            f(&orig, &orig)
        }
    }

    /// Run `f` against the mutable state: the overlay while copy-on-write is
    /// active, the origin otherwise. Only the apply loop may call this.
    fn with_cur<R>(&self, f: impl FnOnce(&mut MetadataRepositoryDescriptor) -> R) -> R {
        if self.is_copy_on_write() {
            let mut diff = self.diff.write().expect("Poisoned");
            f(&mut diff)
        } else {
            let mut orig = self.orig.write().expect("Poisoned");
            f(Arc::make_mut(&mut orig))
        }
    }

    fn ack(&self, node_index: u64, request_index: u64, result: Result<()>) {
        if let Some(cb) = &self.cache_cb {
            cb(node_index, request_index, result);
        }
    }

    // ---- descriptor lookups ----

    pub fn lookup_storage_node(&self, id: StorageNodeId) -> Option<StorageNodeDescriptor> {
        self.with_view(|pre, cur| {
            if let Some(sn) = meta(cur).get_storage_node(id) {
                if sn.status().is_deleted() {
                    return None;
                }
                return Some(sn.clone());
            }
            if std::ptr::eq(pre, cur) {
                return None;
            }
            meta(pre).get_storage_node(id).cloned()
        })
    }

    pub fn lookup_log_stream(&self, id: LogStreamId) -> Option<LogStreamDescriptor> {
        self.with_view(|pre, cur| {
            if let Some(ls) = meta(cur).get_log_stream(id) {
                if ls.status().is_deleted() {
                    return None;
                }
                return Some(ls.clone());
            }
            if std::ptr::eq(pre, cur) {
                return None;
            }
            meta(pre).get_log_stream(id).cloned()
        })
    }

    /// All live storage nodes, merged across the overlay.
    pub fn get_storage_nodes(&self) -> Vec<StorageNodeDescriptor> {
        self.with_view(|pre, cur| {
            let mut merged = meta(pre).clone();
            if !std::ptr::eq(pre, cur) {
                for sn in &meta(cur).storage_nodes {
                    if sn.status().is_deleted() {
                        merged.delete_storage_node(sn.storage_node_id);
                    } else {
                        merged.insert_storage_node(sn.clone());
                    }
                }
            }
            merged.storage_nodes
        })
    }

    /// All live log streams, merged across the overlay.
    pub fn get_log_streams(&self) -> Vec<LogStreamDescriptor> {
        self.with_view(|pre, cur| {
            let mut merged = meta(pre).clone();
            if !std::ptr::eq(pre, cur) {
                for ls in &meta(cur).log_streams {
                    if ls.status().is_deleted() {
                        merged.delete_log_stream(ls.log_stream_id);
                    } else {
                        merged.insert_log_stream(ls.clone());
                    }
                }
            }
            merged.log_streams.retain(|ls| !ls.status().is_deleted());
            merged.log_streams
        })
    }

    // ---- registration ----

    fn do_register_storage_node(&self, sn: &StorageNodeDescriptor) -> Result<()> {
        if self.lookup_storage_node(sn.storage_node_id).is_some() {
            return Err(Error::AlreadyExists(format!("storage node {}", sn.storage_node_id)));
        }
        self.with_cur(|cur| meta_mut(cur).insert_storage_node(sn.clone()));
        self.meta_applied_index.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn register_storage_node(
        &self,
        sn: &StorageNodeDescriptor,
        node_index: u64,
        request_index: u64,
    ) -> Result<()> {
        if let Err(err) = self.do_register_storage_node(sn) {
            self.ack(node_index, request_index, Err(err));
            return Err(Error::AlreadyExists(format!("storage node {}", sn.storage_node_id)));
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    fn do_unregister_storage_node(&self, id: StorageNodeId) -> Result<()> {
        let exists = self.with_view(|pre, cur| {
            meta(cur).get_storage_node(id).is_some()
                || (!std::ptr::eq(pre, cur) && meta(pre).get_storage_node(id).is_some())
        });
        if !exists {
            return Err(Error::NotExist(format!("storage node {id}")));
        }

        let unregistable = self.with_view(|pre, cur| {
            meta(cur).can_unregister_storage_node(id)
                && (std::ptr::eq(pre, cur) || meta(pre).can_unregister_storage_node(id))
        });
        if !unregistable {
            return Err(Error::InvalidArgument(format!("storage node {id} is in use")));
        }

        let copy_on_write = self.is_copy_on_write();
        self.with_cur(|cur| {
            meta_mut(cur).delete_storage_node(id);
            if copy_on_write {
                meta_mut(cur).insert_storage_node(StorageNodeDescriptor {
                    storage_node_id: id,
                    status: StorageNodeStatus::Deleted as i32,
                    ..Default::default()
                });
            }
        });
        self.meta_applied_index.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn unregister_storage_node(
        &self,
        id: StorageNodeId,
        node_index: u64,
        request_index: u64,
    ) -> Result<()> {
        if let Err(err) = self.do_unregister_storage_node(id) {
            let failed = matches!(err, Error::NotExist(_));
            self.ack(node_index, request_index, Err(err));
            return Err(if failed {
                Error::NotExist(format!("storage node {id}"))
            } else {
                Error::InvalidArgument(format!("storage node {id} is in use"))
            });
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    fn do_register_log_stream(&self, ls: &LogStreamDescriptor) -> Result<()> {
        if ls.replicas.is_empty() {
            return Err(Error::InvalidArgument("log stream replicas".to_owned()));
        }
        for replica in &ls.replicas {
            if self.lookup_storage_node(replica.storage_node_id).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "storage node {} is not registered",
                    replica.storage_node_id
                )));
            }
        }
        if self.lookup_log_stream(ls.log_stream_id).is_some() {
            return Err(Error::AlreadyExists(format!("log stream {}", ls.log_stream_id)));
        }

        // New replicas start with the current watermark as already known, so
        // commit accounting never walks history from before their creation.
        let known_high_watermark = self.get_high_watermark();
        self.with_cur(|cur| {
            meta_mut(cur).insert_log_stream(ls.clone());
            let mut replicas = UncommitReportReplicas {
                status: LogStreamStatus::Running as i32,
                ..Default::default()
            };
            for replica in &ls.replicas {
                replicas.replicas.insert(
                    replica.storage_node_id,
                    UncommitReportReplica {
                        uncommitted_llsn_offset: MIN_LLSN,
                        uncommitted_llsn_length: 0,
                        known_high_watermark,
                    },
                );
            }
            cur.uncommit_reports.insert(ls.log_stream_id, replicas);
        });
        self.meta_applied_index.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn register_log_stream(
        &self,
        ls: &LogStreamDescriptor,
        node_index: u64,
        request_index: u64,
    ) -> Result<()> {
        if let Err(err) = self.do_register_log_stream(ls) {
            let out = copy_registration_error(&err, ls.log_stream_id);
            self.ack(node_index, request_index, Err(err));
            return Err(out);
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    fn do_unregister_log_stream(&self, id: LogStreamId) -> Result<()> {
        let exists = self.with_view(|pre, cur| {
            meta(cur).get_log_stream(id).is_some()
                || (!std::ptr::eq(pre, cur) && meta(pre).get_log_stream(id).is_some())
        });
        if !exists {
            return Err(Error::NotExist(format!("log stream {id}")));
        }

        let copy_on_write = self.is_copy_on_write();
        self.with_cur(|cur| {
            meta_mut(cur).delete_log_stream(id);
            cur.uncommit_reports.remove(&id);
            if copy_on_write {
                meta_mut(cur).insert_log_stream(LogStreamDescriptor {
                    log_stream_id: id,
                    status: LogStreamStatus::Deleted as i32,
                    ..Default::default()
                });
                cur.uncommit_reports.insert(
                    id,
                    UncommitReportReplicas {
                        status: LogStreamStatus::Deleted as i32,
                        ..Default::default()
                    },
                );
            }
        });
        self.meta_applied_index.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn unregister_log_stream(
        &self,
        id: LogStreamId,
        node_index: u64,
        request_index: u64,
    ) -> Result<()> {
        if let Err(err) = self.do_unregister_log_stream(id) {
            self.ack(node_index, request_index, Err(err));
            return Err(Error::NotExist(format!("log stream {id}")));
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    fn do_update_log_stream(&self, ls: &LogStreamDescriptor) -> Result<()> {
        if ls.replicas.is_empty() {
            return Err(Error::InvalidArgument("log stream replicas".to_owned()));
        }
        for replica in &ls.replicas {
            if self.lookup_storage_node(replica.storage_node_id).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "storage node {} is not registered",
                    replica.storage_node_id
                )));
            }
        }
        if self.lookup_log_stream(ls.log_stream_id).is_none() {
            return Err(Error::NotExist(format!("log stream {}", ls.log_stream_id)));
        }

        let old = self.lookup_uncommit_reports(ls.log_stream_id).ok_or_else(|| {
            Error::Internal(format!("no uncommit reports for log stream {}", ls.log_stream_id))
        })?;

        let known_high_watermark = self.get_high_watermark();
        self.with_cur(|cur| {
            meta_mut(cur).insert_log_stream(ls.clone());
            // Replicas surviving the update keep their reported progress.
            let mut replicas =
                UncommitReportReplicas { status: ls.status, ..Default::default() };
            for replica in &ls.replicas {
                let report = old.replicas.get(&replica.storage_node_id).cloned().unwrap_or(
                    UncommitReportReplica {
                        uncommitted_llsn_offset: MIN_LLSN,
                        uncommitted_llsn_length: 0,
                        known_high_watermark,
                    },
                );
                replicas.replicas.insert(replica.storage_node_id, report);
            }
            cur.uncommit_reports.insert(ls.log_stream_id, replicas);
        });
        self.meta_applied_index.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn update_log_stream(
        &self,
        ls: &LogStreamDescriptor,
        node_index: u64,
        request_index: u64,
    ) -> Result<()> {
        if let Err(err) = self.do_update_log_stream(ls) {
            let out = copy_registration_error(&err, ls.log_stream_id);
            self.ack(node_index, request_index, Err(err));
            return Err(out);
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    // ---- seal / unseal ----

    fn update_log_stream_status(&self, id: LogStreamId, status: LogStreamStatus) -> Result<()> {
        let ls = self
            .lookup_log_stream(id)
            .ok_or_else(|| Error::NotExist(format!("log stream {id}")))?;
        if ls.status() == status {
            return Err(Error::Ignore);
        }
        self.with_cur(|cur| {
            let mut ls = ls;
            ls.status = status as i32;
            meta_mut(cur).insert_log_stream(ls);
        });
        self.meta_applied_index.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn update_uncommit_reports_status(
        &self,
        id: LogStreamId,
        status: LogStreamStatus,
    ) -> Result<()> {
        let mut replicas = self
            .lookup_uncommit_reports(id)
            .ok_or_else(|| Error::Internal(format!("no uncommit reports for log stream {id}")))?;
        if replicas.status() == status {
            return Err(Error::Ignore);
        }

        if status == LogStreamStatus::Sealed {
            // Freeze every replica's uncommitted range at the shortest one:
            // only the quorum-written suffix survives the seal.
            let min_end = replicas
                .replicas
                .values()
                .map(|replica| replica.uncommitted_llsn_end())
                .min()
                .unwrap_or(MIN_LLSN);
            for replica in replicas.replicas.values_mut() {
                if replica.seal(min_end) == strom_api::INVALID_LLSN {
                    return Err(Error::Internal(format!(
                        "log stream {id}: seal at {min_end} out of range"
                    )));
                }
            }
        }
        replicas.status = status as i32;
        self.with_cur(|cur| {
            cur.uncommit_reports.insert(id, replicas);
        });
        Ok(())
    }

    pub fn seal_log_stream(&self, id: LogStreamId, node_index: u64, request_index: u64) -> Result<()> {
        if let Err(err) = self
            .update_log_stream_status(id, LogStreamStatus::Sealed)
            .and_then(|()| self.update_uncommit_reports_status(id, LogStreamStatus::Sealed))
        {
            let out = copy_status_error(&err);
            self.ack(node_index, request_index, Err(err));
            return Err(out);
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    pub fn unseal_log_stream(
        &self,
        id: LogStreamId,
        node_index: u64,
        request_index: u64,
    ) -> Result<()> {
        if let Err(err) = self
            .update_log_stream_status(id, LogStreamStatus::Running)
            .and_then(|()| self.update_uncommit_reports_status(id, LogStreamStatus::Running))
        {
            let out = copy_status_error(&err);
            self.ack(node_index, request_index, Err(err));
            return Err(out);
        }
        self.trigger_metadata_cache(node_index, request_index);
        Ok(())
    }

    // ---- uncommit reports ----

    pub fn lookup_uncommit_reports(&self, id: LogStreamId) -> Option<UncommitReportReplicas> {
        self.with_view(|pre, cur| {
            if let Some(replicas) = cur.uncommit_reports.get(&id) {
                if replicas.status().is_deleted() {
                    return None;
                }
                return Some(replicas.clone());
            }
            pre.uncommit_reports.get(&id).cloned()
        })
    }

    pub fn lookup_uncommit_report(
        &self,
        id: LogStreamId,
        snid: StorageNodeId,
    ) -> Option<UncommitReportReplica> {
        self.with_view(|pre, cur| {
            if let Some(replicas) = cur.uncommit_reports.get(&id) {
                if replicas.status().is_deleted() {
                    return None;
                }
                if let Some(replica) = replicas.replicas.get(&snid) {
                    return Some(replica.clone());
                }
            }
            if std::ptr::eq(pre, cur) {
                return None;
            }
            pre.uncommit_reports.get(&id).and_then(|replicas| replicas.replicas.get(&snid)).cloned()
        })
    }

    /// Ids of all live log streams with report state, ascending.
    pub fn get_uncommit_report_ids(&self) -> Vec<LogStreamId> {
        self.with_view(|pre, cur| {
            let mut ids: Vec<LogStreamId> = Vec::new();
            let mut deleted: Vec<LogStreamId> = Vec::new();
            for (id, replicas) in &pre.uncommit_reports {
                if replicas.status().is_deleted() {
                    deleted.push(*id);
                } else {
                    ids.push(*id);
                }
            }
            if !std::ptr::eq(pre, cur) {
                for (id, replicas) in &cur.uncommit_reports {
                    if replicas.status().is_deleted() {
                        deleted.push(*id);
                    } else if !ids.contains(id) {
                        ids.push(*id);
                    }
                }
            }
            ids.retain(|id| !deleted.contains(id));
            ids.sort_unstable();
            ids
        })
    }

    /// The reported watermark is only credible if it names a commit round we
    /// still remember (or the bottom of the retained history).
    fn verify_uncommit_report(&self, replica: &UncommitReportReplica) -> bool {
        self.with_view(|pre, cur| {
            let first = first_commit_results(pre, cur);
            let last = last_commit_results(pre, cur);
            let Some(first) = first else {
                return true;
            };
            let last = last.expect("non-empty history has a last round");
            let known = replica.known_high_watermark;
            if first.prev_high_watermark > known || last.high_watermark < known {
                return false;
            }
            known == first.prev_high_watermark
                || lookup_commit_results(pre, cur, known).is_some()
        })
    }

    /// Apply one reported replica state. Progress is only recorded when the
    /// uncommitted end advanced and the reported watermark verifies against
    /// the history; sealed streams clamp the incoming range at the seal end.
    pub fn update_uncommit_report(
        &self,
        id: LogStreamId,
        snid: StorageNodeId,
        mut incoming: UncommitReportReplica,
    ) {
        let Some(mut replicas) = self.lookup_uncommit_reports(id) else {
            return;
        };
        if replicas.status().is_deleted() {
            return;
        }
        let Some(stored) = replicas.replicas.get(&snid).cloned() else {
            return;
        };

        if !self.verify_uncommit_report(&incoming) {
            warn!(
                "could not apply report: invalid hwm, lsid {id}, snid {snid}, known {}",
                incoming.known_high_watermark
            );
            return;
        }

        if replicas.status().is_sealed() {
            if stored.known_high_watermark >= incoming.known_high_watermark
                || incoming.uncommitted_llsn_offset > stored.uncommitted_llsn_end()
            {
                return;
            }
            incoming.uncommitted_llsn_length =
                stored.uncommitted_llsn_end() - incoming.uncommitted_llsn_offset;
        }

        replicas.replicas.insert(snid, incoming);
        self.with_cur(|cur| {
            cur.uncommit_reports.insert(id, replicas);
        });
        self.nr_update_since_commit.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn num_update_since_commit(&self) -> u64 {
        self.nr_update_since_commit.load(Ordering::Acquire)
    }

    // ---- commit history ----

    pub fn append_commit_results(&self, mut results: LogStreamCommitResults) {
        self.nr_update_since_commit.store(0, Ordering::Release);
        if results.commit_results.is_empty() {
            return;
        }
        results.commit_results.sort_by_key(|cr| cr.log_stream_id);
        self.with_cur(|cur| cur.commit_history.push(results));
    }

    pub fn trim_commit_history(&self, trim_glsn: Glsn) {
        if trim_glsn == MAX_GLSN || trim_glsn == INVALID_GLSN {
            return;
        }
        self.with_cur(|cur| {
            if cur.trim_glsn < trim_glsn {
                cur.trim_glsn = trim_glsn;
            }
        });
    }

    pub fn lookup_commit_results(&self, hwm: Glsn) -> Option<LogStreamCommitResults> {
        self.with_view(|pre, cur| lookup_commit_results(pre, cur, hwm).cloned())
    }

    pub fn lookup_next_commit_results(&self, prev: Glsn) -> Option<LogStreamCommitResults> {
        self.with_view(|pre, cur| {
            if !std::ptr::eq(pre, cur) {
                if let Some(results) = cur.lookup_next_commit_results(prev) {
                    return Some(results.clone());
                }
            }
            pre.lookup_next_commit_results(prev).cloned()
        })
    }

    pub fn get_first_commit_results(&self) -> Option<LogStreamCommitResults> {
        self.with_view(|pre, cur| first_commit_results(pre, cur).cloned())
    }

    pub fn get_last_commit_results(&self) -> Option<LogStreamCommitResults> {
        self.with_view(|pre, cur| last_commit_results(pre, cur).cloned())
    }

    pub fn get_high_watermark(&self) -> Glsn {
        self.get_last_commit_results().map(|gls| gls.high_watermark).unwrap_or(INVALID_GLSN)
    }

    pub fn get_min_high_watermark(&self) -> Glsn {
        self.get_first_commit_results().map(|gls| gls.high_watermark).unwrap_or(INVALID_GLSN)
    }

    // ---- peers & endpoints ----

    pub fn add_peer(&self, node_id: NodeId, url: &str) {
        self.with_cur(|cur| {
            cur.peers.insert(node_id, url.to_owned());
        });
    }

    pub fn remove_peer(&self, node_id: NodeId) {
        let copy_on_write = self.is_copy_on_write();
        self.with_cur(|cur| {
            if copy_on_write {
                cur.peers.insert(node_id, String::new());
                cur.endpoints.insert(node_id, String::new());
            } else {
                cur.peers.remove(&node_id);
                cur.endpoints.remove(&node_id);
            }
        });
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.with_view(|pre, cur| {
            if let Some(url) = cur.peers.get(&node_id) {
                return !url.is_empty();
            }
            pre.peers.get(&node_id).map(|url| !url.is_empty()).unwrap_or(false)
        })
    }

    pub fn register_endpoint(
        &self,
        node_id: NodeId,
        url: &str,
        node_index: u64,
        request_index: u64,
    ) {
        self.with_cur(|cur| {
            cur.endpoints.insert(node_id, url.to_owned());
        });
        self.ack(node_index, request_index, Ok(()));
    }

    pub fn lookup_endpoint(&self, node_id: NodeId) -> Option<String> {
        self.with_view(|pre, cur| {
            if let Some(url) = cur.endpoints.get(&node_id) {
                return Some(url.clone());
            }
            pre.endpoints.get(&node_id).cloned()
        })
    }

    // ---- metadata cache ----

    pub fn get_metadata(&self) -> Arc<MetadataDescriptor> {
        self.meta_cache.read().expect("Poisoned").clone()
    }

    fn create_metadata_cache(&self, applied_index: u64, node_index: u64, request_index: u64) {
        let stale = {
            let cache = self.meta_cache.read().expect("Poisoned");
            cache.applied_index >= applied_index && cache.applied_index > 0
        };
        if !stale {
            let mut cache = meta(&self.orig.read().expect("Poisoned")).clone();
            {
                let diff = self.diff.read().expect("Poisoned");
                for sn in &meta(&diff).storage_nodes {
                    if sn.status().is_deleted() {
                        cache.delete_storage_node(sn.storage_node_id);
                    } else {
                        cache.insert_storage_node(sn.clone());
                    }
                }
                for ls in &meta(&diff).log_streams {
                    if ls.status().is_deleted() {
                        cache.delete_log_stream(ls.log_stream_id);
                    } else {
                        cache.insert_log_stream(ls.clone());
                    }
                }
            }
            cache.applied_index = self.meta_applied_index.load(Ordering::Acquire);
            *self.meta_cache.write().expect("Poisoned") = Arc::new(cache);
        }
        self.ack(node_index, request_index, Ok(()));
    }

    // ---- snapshots & merging ----

    pub fn update_applied_index(&self, applied_index: u64) {
        self.applied_index.store(applied_index, Ordering::Release);
        // Merge before snapshotting so `orig` holds this entry's effects.
        self.merge_state_machine();
        let snap_index = self.snap.read().expect("Poisoned").applied_index;
        if applied_index - snap_index > self.snapshot_interval {
            self.trigger_snapshot(applied_index);
        }
    }

    fn merge_state_machine(&self) {
        if self.nr_running.load(Ordering::Acquire) != 0 || !self.is_copy_on_write() {
            return;
        }

        let mut orig_guard = self.orig.write().expect("Poisoned");
        let orig = Arc::make_mut(&mut orig_guard);
        let mut diff = self.diff.write().expect("Poisoned");

        for sn in std::mem::take(&mut meta_mut(&mut diff).storage_nodes) {
            if sn.status().is_deleted() {
                meta_mut(orig).delete_storage_node(sn.storage_node_id);
            } else {
                meta_mut(orig).insert_storage_node(sn);
            }
        }
        for ls in std::mem::take(&mut meta_mut(&mut diff).log_streams) {
            if ls.status().is_deleted() {
                meta_mut(orig).delete_log_stream(ls.log_stream_id);
            } else {
                meta_mut(orig).insert_log_stream(ls);
            }
        }

        for (id, replicas) in std::mem::take(&mut diff.uncommit_reports) {
            if replicas.status().is_deleted() {
                orig.uncommit_reports.remove(&id);
            } else {
                orig.uncommit_reports.insert(id, replicas);
            }
        }

        if orig.trim_glsn < diff.trim_glsn {
            orig.trim_glsn = diff.trim_glsn;
        }
        orig.commit_history.append(&mut diff.commit_history);
        trim_commit_history_in_place(orig);

        for (node_id, url) in std::mem::take(&mut diff.peers) {
            if url.is_empty() {
                orig.peers.remove(&node_id);
            } else {
                orig.peers.insert(node_id, url);
            }
        }
        for (node_id, url) in std::mem::take(&mut diff.endpoints) {
            if url.is_empty() {
                orig.endpoints.remove(&node_id);
            } else {
                orig.endpoints.insert(node_id, url);
            }
        }

        self.release_copy_on_write();
    }

    fn trigger_snapshot(&self, applied_index: u64) {
        if self.nr_running.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_err() {
            // While another job runs there is no guarantee the entry at
            // `applied_index` has reached `orig` yet.
            return;
        }
        self.set_copy_on_write();

        let state = self.orig.read().expect("Poisoned").clone();
        if self.job_tx.try_send(StorageJob::Snapshot { state, applied_index }).is_err() {
            self.nr_running.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn trigger_metadata_cache(&self, node_index: u64, request_index: u64) {
        self.nr_running.fetch_add(1, Ordering::AcqRel);
        self.set_copy_on_write();

        let job = StorageJob::Cache {
            applied_index: self.meta_applied_index.load(Ordering::Acquire),
            node_index,
            request_index,
        };
        if self.job_tx.try_send(job).is_err() {
            self.nr_running.fetch_sub(1, Ordering::AcqRel);
            self.ack(node_index, request_index, Err(Error::Ignore));
        }
    }

    fn create_snapshot(&self, state: &MetadataRepositoryDescriptor, applied_index: u64) {
        let data = state.encode_to_vec();
        let mut snap = self.snap.write().expect("Poisoned");
        snap.data = data;
        snap.applied_index = applied_index;
    }

    pub fn get_snapshot(&self) -> (Vec<u8>, u64) {
        let snap = self.snap.read().expect("Poisoned");
        (snap.data.clone(), snap.applied_index)
    }

    pub fn apply_snapshot(&self, data: &[u8], applied_index: u64) -> Result<()> {
        if applied_index < self.applied_index.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument("outdated snapshot".to_owned()));
        }
        let mut state = MetadataRepositoryDescriptor::decode(data)?;
        if state.metadata.is_none() {
            state.metadata = Some(MetadataDescriptor::default());
        }

        {
            let mut snap = self.snap.write().expect("Poisoned");
            snap.data = data.to_vec();
            snap.applied_index = applied_index;
        }

        let mut cache = meta(&state).clone();
        cache.applied_index = applied_index;
        *self.meta_cache.write().expect("Poisoned") = Arc::new(cache);
        self.meta_applied_index.store(applied_index, Ordering::Release);

        *self.orig.write().expect("Poisoned") = Arc::new(state);
        *self.diff.write().expect("Poisoned") = empty_state();
        self.release_copy_on_write();
        self.applied_index.store(applied_index, Ordering::Release);

        // Force the next commit round so catch-up resumes after restore.
        self.nr_update_since_commit.store(1, Ordering::Release);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_copy_on_write(&self) {
        self.nr_running.fetch_add(1, Ordering::AcqRel);
        self.set_copy_on_write();
    }

    #[cfg(test)]
    pub(crate) fn release_job(&self) {
        self.nr_running.fetch_sub(1, Ordering::AcqRel);
    }
}

fn copy_registration_error(err: &Error, id: LogStreamId) -> Error {
    match err {
        Error::AlreadyExists(_) => Error::AlreadyExists(format!("log stream {id}")),
        Error::NotExist(_) => Error::NotExist(format!("log stream {id}")),
        Error::Internal(msg) => Error::Internal(msg.clone()),
        _ => Error::InvalidArgument(format!("log stream {id}")),
    }
}

fn copy_status_error(err: &Error) -> Error {
    match err {
        Error::Ignore => Error::Ignore,
        Error::NotExist(msg) => Error::NotExist(msg.clone()),
        Error::Internal(msg) => Error::Internal(msg.clone()),
        _ => Error::InvalidArgument("status change".to_owned()),
    }
}

fn first_commit_results<'a>(
    pre: &'a MetadataRepositoryDescriptor,
    cur: &'a MetadataRepositoryDescriptor,
) -> Option<&'a LogStreamCommitResults> {
    pre.first_commit_results().or_else(|| cur.first_commit_results())
}

fn last_commit_results<'a>(
    pre: &'a MetadataRepositoryDescriptor,
    cur: &'a MetadataRepositoryDescriptor,
) -> Option<&'a LogStreamCommitResults> {
    cur.last_commit_results().or_else(|| pre.last_commit_results())
}

fn lookup_commit_results<'a>(
    pre: &'a MetadataRepositoryDescriptor,
    cur: &'a MetadataRepositoryDescriptor,
    hwm: Glsn,
) -> Option<&'a LogStreamCommitResults> {
    if !std::ptr::eq(pre, cur) {
        if let Some(results) = cur.lookup_commit_results(hwm) {
            return Some(results);
        }
    }
    pre.lookup_commit_results(hwm)
}

fn trim_commit_history_in_place(state: &mut MetadataRepositoryDescriptor) {
    let trim_glsn = state.trim_glsn;
    if let Ok(idx) =
        state.commit_history.binary_search_by_key(&trim_glsn, |gls| gls.high_watermark)
    {
        state.commit_history.drain(..idx);
    }
}
