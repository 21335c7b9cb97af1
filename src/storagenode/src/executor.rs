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

//! Per-replica write/commit pipeline.
//!
//! Appends flow through a bounded queue into a single writer worker which
//! assigns LLSNs, persists the payload and triggers replication. Commit
//! decisions pushed by the metadata repository flow through a second queue
//! into a committer worker which binds GLSNs and wakes the pending appends.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{trace, warn};
use strom_api::v1::{
    CommitContext, CommitInfoStatus, LogEntry, LogStreamCommitInfo, LogStreamReplicaMetadata,
    LogStreamStatus, LogStreamUncommitReport, SyncPosition,
};
use strom_api::{Glsn, Llsn, LogStreamId, TopicId, INVALID_GLSN, MIN_LLSN};
use strom_runtime::{Shutdown, ShutdownNotifier, TaskGroup};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::replication::{Replica, Replicator};
use crate::storage::Storage;
use crate::{Error, ExecutorConfig, Result};

const COMMIT_HISTORY_LIMIT: usize = 4096;
const SUBSCRIBE_CHANNEL_SIZE: usize = 32;

/// A commit decision for one log stream, as consumed from the report
/// collector push.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommittedStatus {
    pub log_stream_id: LogStreamId,
    pub high_watermark: Glsn,
    pub prev_high_watermark: Glsn,
    pub committed_glsn_offset: Glsn,
    pub committed_glsn_length: u64,
}

enum WriteTask {
    Append { data: Bytes, replicas: Vec<Replica>, tx: oneshot::Sender<Result<Glsn>> },
    Replicate { llsn: Llsn, data: Bytes, tx: oneshot::Sender<Result<()>> },
}

#[derive(Default)]
struct LogStreamContext {
    /// Exclusive end of locally written LLSNs; the next LLSN to assign.
    uncommitted_llsn_end: AtomicU64,
    /// Exclusive end of committed LLSNs. Always `<= uncommitted_llsn_end`.
    committed_llsn_end: AtomicU64,
    local_low_watermark: AtomicU64,
    local_high_watermark: AtomicU64,
    /// High watermark of the last accepted commit round.
    global_high_watermark: AtomicU64,
}

struct StatusCell {
    status: LogStreamStatus,
    updated_at: SystemTime,
}

pub struct LogStreamExecutor {
    inner: Arc<ExecutorInner>,
    task_group: TaskGroup,
    shutdown: ShutdownNotifier,
}

struct ExecutorInner {
    topic_id: TopicId,
    log_stream_id: LogStreamId,
    cfg: ExecutorConfig,
    status: RwLock<StatusCell>,
    lsc: LogStreamContext,
    trackers: Mutex<BTreeMap<Llsn, oneshot::Sender<Result<Glsn>>>>,
    storage: Arc<dyn Storage>,
    replicator: Replicator,
    write_tx: mpsc::Sender<WriteTask>,
    commit_tx: mpsc::Sender<CommittedStatus>,
    commit_history: Mutex<VecDeque<CommitContext>>,
}

impl LogStreamExecutor {
    pub fn new(
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        storage: Arc<dyn Storage>,
        replicator: Replicator,
        cfg: ExecutorConfig,
    ) -> Result<Self> {
        cfg.validate()?;

        let (write_tx, write_rx) = mpsc::channel(cfg.append_queue_size);
        let (commit_tx, commit_rx) = mpsc::channel(cfg.commit_queue_size);

        let points = storage.read_recovery_points()?;
        let lsc = LogStreamContext::default();
        lsc.uncommitted_llsn_end.store(points.last_written_llsn + 1, Ordering::Release);
        let committed_end = points.last_committed.map(|(llsn, _)| llsn + 1).unwrap_or(MIN_LLSN);
        lsc.committed_llsn_end.store(committed_end, Ordering::Release);
        lsc.local_high_watermark
            .store(points.last_committed.map(|(_, glsn)| glsn).unwrap_or(INVALID_GLSN), Ordering::Release);

        // The reported watermark resumes from the last fully applied round;
        // a round interrupted mid-flush is reported as not yet seen so it
        // will be resent.
        let mut history = VecDeque::new();
        let known_hwm = match &points.commit_context {
            Some(cc) => {
                let applied_end = cc.committed_llsn_offset + cc.committed_glsn_length;
                history.push_back(cc.clone());
                if committed_end >= applied_end {
                    cc.high_watermark
                } else {
                    cc.prev_high_watermark
                }
            }
            None => INVALID_GLSN,
        };
        lsc.global_high_watermark.store(known_hwm, Ordering::Release);

        let inner = Arc::new(ExecutorInner {
            topic_id,
            log_stream_id,
            cfg,
            status: RwLock::new(StatusCell {
                status: LogStreamStatus::Running,
                updated_at: SystemTime::now(),
            }),
            lsc,
            trackers: Mutex::new(BTreeMap::new()),
            storage,
            replicator,
            write_tx,
            commit_tx,
            commit_history: Mutex::new(history),
        });
        inner.restore_low_watermark()?;

        let shutdown = ShutdownNotifier::new();
        let task_group = TaskGroup::default();
        task_group.add_task(strom_runtime::spawn(ExecutorInner::writer_loop(
            Arc::clone(&inner),
            write_rx,
            shutdown.subscribe(),
        )));
        task_group.add_task(strom_runtime::spawn(ExecutorInner::committer_loop(
            Arc::clone(&inner),
            commit_rx,
            shutdown.subscribe(),
        )));

        Ok(LogStreamExecutor { inner, task_group, shutdown })
    }

    #[inline]
    pub fn log_stream_id(&self) -> LogStreamId {
        self.inner.log_stream_id
    }

    #[inline]
    pub fn topic_id(&self) -> TopicId {
        self.inner.topic_id
    }

    #[inline]
    pub fn status(&self) -> LogStreamStatus {
        self.inner.status()
    }

    pub fn last_updated(&self) -> SystemTime {
        self.inner.status.read().expect("Poisoned").updated_at
    }

    /// Append `data` to the log stream and replicate it to `replicas`.
    /// Resolves with the assigned GLSN once the entry is committed.
    pub async fn append(&self, data: Bytes, replicas: Vec<Replica>) -> Result<Glsn> {
        if !self.inner.status().is_running() {
            return Err(Error::Sealed);
        }

        let (tx, rx) = oneshot::channel();
        let task = WriteTask::Append { data, replicas, tx };
        match timeout(self.inner.cfg.append_enqueue_timeout, self.inner.write_tx.send(task)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => return Err(Error::DeadlineExceeded("append enqueue".to_owned())),
        }

        match timeout(self.inner.cfg.commit_wait_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::DeadlineExceeded("commit wait".to_owned())),
        }
    }

    /// Backup-side write. Entries must arrive in dense LLSN order; a
    /// duplicate delivery after reconnect is acknowledged without rewriting.
    pub async fn replicate(&self, llsn: Llsn, data: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let task = WriteTask::Replicate { llsn, data, tx };
        match timeout(self.inner.cfg.write_timeout, self.inner.write_tx.send(task)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => return Err(Error::DeadlineExceeded("replicate enqueue".to_owned())),
        }
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn read(&self, glsn: Glsn) -> Result<LogEntry> {
        if glsn > self.inner.lsc.local_high_watermark.load(Ordering::Acquire) {
            return Err(Error::Undecidable);
        }
        if glsn < self.inner.lsc.local_low_watermark.load(Ordering::Acquire) {
            return Err(Error::Trimmed);
        }
        self.inner.storage.read(glsn)
    }

    /// Lazily scan the half-open range `[begin, end)`. The returned channel
    /// yields entries in GLSN order and terminates with [`Error::EndOfRange`].
    pub fn subscribe(&self, begin: Glsn, end: Glsn) -> Result<mpsc::Receiver<Result<LogEntry>>> {
        if begin >= end {
            return Err(Error::InvalidArgument(format!("subscribe range [{begin}, {end})")));
        }
        if begin < self.inner.lsc.local_low_watermark.load(Ordering::Acquire) {
            return Err(Error::Trimmed);
        }
        if end > self.inner.lsc.local_high_watermark.load(Ordering::Acquire) + 1 {
            return Err(Error::Undecidable);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBE_CHANNEL_SIZE);
        let inner = Arc::clone(&self.inner);
        self.task_group.add_task(strom_runtime::spawn(async move {
            inner.pump_subscription(begin, end, tx).await;
        }));
        Ok(rx)
    }

    /// Prune committed entries with `GLSN <= glsn`. The erase runs
    /// asynchronously in the storage layer.
    pub fn trim(&self, glsn: Glsn) -> Result<()> {
        let hwm = self.inner.lsc.local_high_watermark.load(Ordering::Acquire);
        if glsn >= hwm {
            return Err(Error::InvalidArgument(format!(
                "trim {glsn} is not before the local high watermark {hwm}"
            )));
        }

        let low = self.inner.lsc.local_low_watermark.load(Ordering::Acquire);
        if glsn + 1 > low {
            self.inner.lsc.local_low_watermark.store(glsn + 1, Ordering::Release);
        }

        let inner = Arc::clone(&self.inner);
        self.task_group.add_task(strom_runtime::spawn(async move {
            if let Err(err) = inner.storage.delete_committed(glsn) {
                warn!("log stream {}: trim at {glsn}: {err}", inner.log_stream_id);
            }
        }));
        Ok(())
    }

    /// Feed one commit decision into the pipeline.
    pub async fn commit(&self, status: CommittedStatus) -> Result<()> {
        if status.log_stream_id != self.inner.log_stream_id {
            return Err(Error::InvalidArgument(format!(
                "commit for log stream {}",
                status.log_stream_id
            )));
        }
        match timeout(self.inner.cfg.commit_enqueue_timeout, self.inner.commit_tx.send(status))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::DeadlineExceeded("commit enqueue".to_owned())),
        }
    }

    pub fn get_report(&self) -> LogStreamUncommitReport {
        let offset = self.inner.lsc.committed_llsn_end.load(Ordering::Acquire);
        let end = self.inner.lsc.uncommitted_llsn_end.load(Ordering::Acquire);
        LogStreamUncommitReport {
            log_stream_id: self.inner.log_stream_id,
            uncommitted_llsn_offset: offset,
            uncommitted_llsn_length: end.saturating_sub(offset),
            high_watermark: self.inner.lsc.global_high_watermark.load(Ordering::Acquire),
        }
    }

    /// Freeze the log stream at `last_committed_glsn`.
    ///
    /// The replica keeps accepting commits while it lags behind the seal
    /// point and reports `Sealing`; once its local high watermark reaches the
    /// seal point it becomes `Sealed`, the uncommitted tail is erased and
    /// pending appends fail. A local high watermark beyond the seal point
    /// means the replicas diverged.
    pub fn seal(&self, last_committed_glsn: Glsn) -> (LogStreamStatus, Glsn) {
        let local_hwm = self.inner.lsc.local_high_watermark.load(Ordering::Acquire);
        if local_hwm > last_committed_glsn {
            panic!(
                "log stream {}: local high watermark {local_hwm} beyond seal point {last_committed_glsn}",
                self.inner.log_stream_id
            );
        }

        if local_hwm < last_committed_glsn {
            self.inner.set_status(LogStreamStatus::Sealing);
            return (LogStreamStatus::Sealing, local_hwm);
        }

        self.inner.set_status(LogStreamStatus::Sealed);
        let end = self.inner.lsc.committed_llsn_end.load(Ordering::Acquire);
        if let Err(err) = self.inner.storage.delete_uncommitted(end) {
            warn!("log stream {}: delete uncommitted from {end}: {err}", self.inner.log_stream_id);
        }
        self.inner.lsc.uncommitted_llsn_end.store(end, Ordering::Release);
        self.inner.drain_trackers(|| Error::Sealed);
        (LogStreamStatus::Sealed, local_hwm)
    }

    /// Return a sealed log stream to service.
    pub fn unseal(&self) -> Result<()> {
        let mut cell = self.inner.status.write().expect("Poisoned");
        if cell.status != LogStreamStatus::Sealed {
            return Err(Error::InvalidArgument(format!("unseal in {:?}", cell.status)));
        }
        cell.status = LogStreamStatus::Running;
        cell.updated_at = SystemTime::now();
        Ok(())
    }

    /// Stop accepting appends after a local write failure. Commits already
    /// decided keep flowing in so the replica can still reach a seal point.
    pub fn seal_itself(&self) {
        self.inner.seal_itself();
    }

    pub fn get_prev_commit_info(&self, hwm: Glsn) -> LogStreamCommitInfo {
        self.inner.get_prev_commit_info(hwm)
    }

    /// Install one historical entry copied from another replica.
    pub async fn sync_replicate(
        &self,
        first: SyncPosition,
        last: SyncPosition,
        entry: LogEntry,
    ) -> Result<()> {
        self.inner.sync_replicate(first, last, entry)
    }

    pub fn metadata(&self) -> LogStreamReplicaMetadata {
        let cell = self.inner.status.read().expect("Poisoned");
        LogStreamReplicaMetadata {
            log_stream_id: self.inner.log_stream_id,
            topic_id: self.inner.topic_id,
            status: cell.status as i32,
            path: String::new(),
            local_low_watermark: self.inner.lsc.local_low_watermark.load(Ordering::Acquire),
            local_high_watermark: self.inner.lsc.local_high_watermark.load(Ordering::Acquire),
            updated_at_millis: cell
                .updated_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
        }
    }

    pub fn close(&self) {
        self.shutdown.notify();
        self.inner.drain_trackers(|| Error::Closed);
        self.inner.replicator.close();
        self.task_group.abort_all();
    }
}

impl ExecutorInner {
    fn status(&self) -> LogStreamStatus {
        self.status.read().expect("Poisoned").status
    }

    fn set_status(&self, status: LogStreamStatus) {
        let mut cell = self.status.write().expect("Poisoned");
        if cell.status == status {
            return;
        }
        cell.status = status;
        cell.updated_at = SystemTime::now();
    }

    fn seal_itself(&self) {
        self.set_status(LogStreamStatus::Sealing);
    }

    fn restore_low_watermark(&self) -> Result<()> {
        let mut scanner = self.storage.scan(strom_api::MIN_GLSN, strom_api::MAX_GLSN)?;
        if let Some(entry) = scanner.next()? {
            self.lsc.local_low_watermark.store(entry.glsn, Ordering::Release);
        }
        Ok(())
    }

    fn drain_trackers(&self, err: impl Fn() -> Error) {
        let mut trackers = self.trackers.lock().expect("Poisoned");
        while let Some((_, tx)) = trackers.pop_first() {
            let _ = tx.send(Err(err()));
        }
    }

    fn fail_tracker(&self, llsn: Llsn, err: Error) {
        let tracker = self.trackers.lock().expect("Poisoned").remove(&llsn);
        if let Some(tx) = tracker {
            let _ = tx.send(Err(err));
        }
    }

    async fn writer_loop(
        inner: Arc<ExecutorInner>,
        mut rx: mpsc::Receiver<WriteTask>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let task = tokio::select! {
                _ = shutdown.wait() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            inner.handle_write_task(task).await;
        }

        rx.close();
        while let Ok(task) = rx.try_recv() {
            match task {
                WriteTask::Append { tx, .. } => {
                    let _ = tx.send(Err(Error::Closed));
                }
                WriteTask::Replicate { tx, .. } => {
                    let _ = tx.send(Err(Error::Closed));
                }
            }
        }
    }

    async fn handle_write_task(self: &Arc<Self>, task: WriteTask) {
        match task {
            WriteTask::Append { data, replicas, tx } => {
                if !self.status().is_running() {
                    let _ = tx.send(Err(Error::Sealed));
                    return;
                }

                let llsn = self.lsc.uncommitted_llsn_end.load(Ordering::Acquire);
                if let Err(err) = self.storage.write(llsn, &data) {
                    warn!("log stream {}: write llsn {llsn}: {err}", self.log_stream_id);
                    self.seal_itself();
                    let _ = tx.send(Err(err));
                    return;
                }

                // The tracker must be registered before the report can cover
                // this entry, or a prompt commit round could miss it.
                self.trackers.lock().expect("Poisoned").insert(llsn, tx);
                self.lsc.uncommitted_llsn_end.store(llsn + 1, Ordering::Release);

                if !replicas.is_empty() {
                    let inner = Arc::clone(self);
                    let on_error: Arc<dyn Fn(Error) + Send + Sync> = Arc::new(move |err| {
                        inner.fail_tracker(llsn, err);
                    });
                    self.replicator.replicate(llsn, data, &replicas, on_error).await;
                }
            }
            WriteTask::Replicate { llsn, data, tx } => {
                let end = self.lsc.uncommitted_llsn_end.load(Ordering::Acquire);
                let result = if llsn < end {
                    // Duplicate delivery after a reconnect.
                    Ok(())
                } else if llsn != end {
                    Err(Error::InvalidArgument(format!("replicate llsn {llsn}, expected {end}")))
                } else {
                    self.storage.write(llsn, &data).map(|()| {
                        self.lsc.uncommitted_llsn_end.store(llsn + 1, Ordering::Release);
                    })
                };
                let _ = tx.send(result);
            }
        }
    }

    async fn committer_loop(
        inner: Arc<ExecutorInner>,
        mut rx: mpsc::Receiver<CommittedStatus>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let status = tokio::select! {
                _ = shutdown.wait() => break,
                status = rx.recv() => match status {
                    Some(status) => status,
                    None => break,
                },
            };
            inner.apply_commit(status);
        }
    }

    fn apply_commit(&self, status: CommittedStatus) {
        let known = self.lsc.global_high_watermark.load(Ordering::Acquire);
        if status.prev_high_watermark != known {
            // Stale or gapped decision; catch-up resends from our report.
            trace!(
                "log stream {}: drop commit round {} -> {}, known {known}",
                self.log_stream_id,
                status.prev_high_watermark,
                status.high_watermark
            );
            return;
        }

        let begin_llsn = self.lsc.committed_llsn_end.load(Ordering::Acquire);
        let written_end = self.lsc.uncommitted_llsn_end.load(Ordering::Acquire);
        if status.committed_glsn_length > written_end - begin_llsn {
            panic!(
                "log stream {}: commit count {} exceeds uncommitted count {}",
                self.log_stream_id,
                status.committed_glsn_length,
                written_end - begin_llsn
            );
        }

        // The round is durable before any of its mappings.
        let commit_context = CommitContext {
            high_watermark: status.high_watermark,
            prev_high_watermark: status.prev_high_watermark,
            committed_glsn_offset: status.committed_glsn_offset,
            committed_glsn_length: status.committed_glsn_length,
            committed_llsn_offset: begin_llsn,
        };
        if let Err(err) = self.storage.store_commit_context(commit_context.clone()) {
            panic!("log stream {}: store commit context: {err}", self.log_stream_id);
        }

        if status.committed_glsn_length > 0 {
            let mut batch = self.storage.new_commit_batch();
            for i in 0..status.committed_glsn_length {
                if let Err(err) = batch.put(begin_llsn + i, status.committed_glsn_offset + i) {
                    panic!("log stream {}: commit batch: {err}", self.log_stream_id);
                }
            }
            if let Err(err) = batch.apply() {
                panic!("log stream {}: commit apply: {err}", self.log_stream_id);
            }

            let mut trackers = self.trackers.lock().expect("Poisoned");
            for i in 0..status.committed_glsn_length {
                if let Some(tx) = trackers.remove(&(begin_llsn + i)) {
                    let _ = tx.send(Ok(status.committed_glsn_offset + i));
                }
            }
            drop(trackers);

            self.lsc
                .committed_llsn_end
                .store(begin_llsn + status.committed_glsn_length, Ordering::Release);
            let last_glsn = status.committed_glsn_offset + status.committed_glsn_length - 1;
            self.lsc.local_high_watermark.store(last_glsn, Ordering::Release);
            if self.lsc.local_low_watermark.load(Ordering::Acquire) == INVALID_GLSN {
                self.lsc.local_low_watermark.store(status.committed_glsn_offset, Ordering::Release);
            }
        }

        self.lsc.global_high_watermark.store(status.high_watermark, Ordering::Release);

        let mut history = self.commit_history.lock().expect("Poisoned");
        history.push_back(commit_context);
        while history.len() > COMMIT_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    async fn pump_subscription(&self, begin: Glsn, end: Glsn, tx: mpsc::Sender<Result<LogEntry>>) {
        let mut scanner = match self.storage.scan(begin, end) {
            Ok(scanner) => scanner,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let mut last_glsn = INVALID_GLSN;
        let mut last_llsn = 0;
        loop {
            match scanner.next() {
                Ok(Some(entry)) => {
                    let ordered = (last_glsn == INVALID_GLSN || entry.glsn > last_glsn)
                        && (last_llsn == 0 || entry.llsn == last_llsn + 1);
                    if !ordered {
                        let _ = tx
                            .send(Err(Error::Internal(format!(
                                "out of order scan at llsn {} glsn {}",
                                entry.llsn, entry.glsn
                            ))))
                            .await;
                        return;
                    }
                    last_glsn = entry.glsn;
                    last_llsn = entry.llsn;
                    if tx.send(Ok(entry)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Err(Error::EndOfRange)).await;
                    return;
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }

    fn get_prev_commit_info(&self, hwm: Glsn) -> LogStreamCommitInfo {
        let history = self.commit_history.lock().expect("Poisoned");
        let highest_written_llsn =
            self.lsc.uncommitted_llsn_end.load(Ordering::Acquire).saturating_sub(1);
        let mut info = LogStreamCommitInfo {
            log_stream_id: self.log_stream_id,
            status: CommitInfoStatus::None as i32,
            highest_written_llsn,
            ..Default::default()
        };

        match history.iter().find(|cc| cc.prev_high_watermark == hwm) {
            Some(cc) => {
                info.status = CommitInfoStatus::Ok as i32;
                info.committed_llsn_offset = cc.committed_llsn_offset;
                info.committed_glsn_offset = cc.committed_glsn_offset;
                info.committed_glsn_length = cc.committed_glsn_length;
                info.high_watermark = cc.high_watermark;
                info.prev_high_watermark = cc.prev_high_watermark;
            }
            None => {
                let last_hwm =
                    history.back().map(|cc| cc.high_watermark).unwrap_or(INVALID_GLSN);
                if hwm < last_hwm {
                    info.status = CommitInfoStatus::Inconsistent as i32;
                }
            }
        }
        info
    }

    fn sync_replicate(&self, first: SyncPosition, last: SyncPosition, entry: LogEntry) -> Result<()> {
        if entry.llsn == 0 || entry.glsn == 0 {
            return Err(Error::InvalidArgument("sync replicate position".to_owned()));
        }

        self.storage.write(entry.llsn, &entry.data)?;
        self.storage.commit(entry.llsn, entry.glsn)?;

        self.lsc.uncommitted_llsn_end.store(entry.llsn + 1, Ordering::Release);
        self.lsc.committed_llsn_end.store(entry.llsn + 1, Ordering::Release);
        self.lsc.local_high_watermark.store(entry.glsn, Ordering::Release);
        if entry.llsn == first.llsn
            && self.lsc.local_low_watermark.load(Ordering::Acquire) == INVALID_GLSN
        {
            self.lsc.local_low_watermark.store(entry.glsn, Ordering::Release);
        }
        if entry.llsn == last.llsn {
            self.lsc.global_high_watermark.store(last.glsn, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use strom_api::MIN_GLSN;

    use super::*;
    use crate::replication::ReplicatorClientFactory;
    use crate::storage::{CommitBatch, MemoryStorage, RecoveryPoints, Scanner, WriteBatch};
    use crate::async_trait;

    const LSID: LogStreamId = 1;

    struct NopConnector;

    #[async_trait]
    impl ReplicatorClientFactory for NopConnector {
        async fn connect(
            &self,
            _replica: &Replica,
        ) -> Result<Arc<dyn crate::replication::ReplicatorClient>> {
            Err(Error::Internal("no transport in tests".to_owned()))
        }
    }

    fn test_replicator() -> Replicator {
        Replicator::new(Box::new(NopConnector))
    }

    fn new_executor(storage: Arc<dyn Storage>) -> LogStreamExecutor {
        LogStreamExecutor::new(1, LSID, storage, test_replicator(), ExecutorConfig::default())
            .unwrap()
    }

    fn status_at(hwm: Glsn, offset: Glsn, length: u64) -> CommittedStatus {
        CommittedStatus {
            log_stream_id: LSID,
            high_watermark: hwm,
            prev_high_watermark: hwm.saturating_sub(length),
            committed_glsn_offset: offset,
            committed_glsn_length: length,
        }
    }

    /// Push the decision once the entry is written, mimicking the report ->
    /// commit round trip of the metadata repository.
    async fn drive_commit(lse: &LogStreamExecutor, hwm: Glsn, prev: Glsn, offset: Glsn, len: u64) {
        loop {
            let report = lse.get_report();
            if report.high_watermark >= hwm {
                return;
            }
            if report.uncommitted_llsn_length >= len {
                lse.commit(CommittedStatus {
                    log_stream_id: LSID,
                    high_watermark: hwm,
                    prev_high_watermark: prev,
                    committed_glsn_offset: offset,
                    committed_glsn_length: len,
                })
                .await
                .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn append_committed(lse: &LogStreamExecutor, data: &str, glsn: Glsn) -> Glsn {
        let (appended, _) = tokio::join!(
            lse.append(Bytes::from(data.to_owned()), vec![]),
            drive_commit(lse, glsn, glsn - 1, glsn, 1)
        );
        appended.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_dense_glsns() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);

        for i in MIN_GLSN..=100 {
            let expected = format!("log-{i:03}");
            let glsn = append_committed(&lse, &expected, i).await;
            assert_eq!(glsn, i);

            let entry = lse.read(i).unwrap();
            assert_eq!(entry.data, expected.into_bytes());
            assert_eq!(entry.llsn, i);
        }
        assert_eq!(lse.get_report().high_watermark, 100);
        assert_eq!(lse.get_report().uncommitted_llsn_length, 0);
        lse.close();
    }

    #[tokio::test]
    async fn read_guards() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);

        assert!(matches!(lse.read(MIN_GLSN), Err(Error::Undecidable)));

        for i in 1..=3 {
            append_committed(&lse, "log", i).await;
        }
        lse.trim(1).unwrap();
        loop {
            match lse.read(1) {
                Err(Error::Trimmed) => break,
                Err(err) => panic!("unexpected error: {err}"),
                Ok(_) => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
        assert_eq!(lse.read(2).unwrap().glsn, 2);
        lse.close();
    }

    #[tokio::test]
    async fn trim_rejects_future_and_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);

        for i in 1..=3 {
            append_committed(&lse, "log", i).await;
        }

        // cannot trim at or beyond the local high watermark
        assert!(lse.trim(3).is_err());
        assert!(lse.trim(4).is_err());

        lse.trim(1).unwrap();
        lse.trim(1).unwrap();
        lse.close();
    }

    #[tokio::test]
    async fn subscribe_yields_range_then_end_of_range() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);
        for i in 1..=5 {
            append_committed(&lse, &format!("log-{i}"), i).await;
        }

        let mut sub = lse.subscribe(1, 4).unwrap();
        for expected in 1..=3u64 {
            let entry = sub.recv().await.unwrap().unwrap();
            assert_eq!(entry.glsn, expected);
            assert_eq!(entry.llsn, expected);
        }
        assert!(matches!(sub.recv().await.unwrap(), Err(Error::EndOfRange)));
        assert!(sub.recv().await.is_none());

        // undecidable upper bound
        assert!(matches!(lse.subscribe(6, 7), Err(Error::Undecidable)));

        lse.trim(2).unwrap();
        assert!(matches!(lse.subscribe(1, 4), Err(Error::Trimmed)));
        lse.close();
    }

    #[tokio::test]
    async fn sealing_follows_the_metadata_repository() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);
        append_committed(&lse, "log-1", 1).await;

        // The seal point is ahead of this replica: it keeps catching up.
        let (status, sealed_glsn) = lse.seal(2);
        assert_eq!(status, LogStreamStatus::Sealing);
        assert_eq!(sealed_glsn, 1);

        // Sealing cannot unseal.
        assert!(lse.unseal().is_err());

        // One more committed entry reaches the seal point.
        append_committed(&lse, "log-2", 2).await;
        let (status, sealed_glsn) = lse.seal(2);
        assert_eq!(status, LogStreamStatus::Sealed);
        assert_eq!(sealed_glsn, 2);

        // Reads of the sealed prefix still succeed; appends fail.
        assert_eq!(lse.read(1).unwrap().glsn, 1);
        assert!(matches!(
            lse.append(Bytes::from_static(b"never"), vec![]).await,
            Err(Error::Sealed)
        ));

        lse.unseal().unwrap();
        assert_eq!(lse.status(), LogStreamStatus::Running);
        append_committed(&lse, "log-3", 3).await;
        lse.close();
    }

    #[tokio::test]
    async fn sealing_fresh_stream_with_invalid_glsn_succeeds() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);
        let (status, sealed_glsn) = lse.seal(INVALID_GLSN);
        assert_eq!(status, LogStreamStatus::Sealed);
        assert_eq!(sealed_glsn, INVALID_GLSN);
        lse.close();
    }

    #[tokio::test]
    #[should_panic(expected = "beyond seal point")]
    async fn sealing_behind_local_high_watermark_panics() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);
        for i in 1..=2 {
            append_committed(&lse, "log", i).await;
        }
        lse.seal(1);
    }

    #[tokio::test]
    async fn seal_erases_uncommitted_tail_and_fails_pending_appends() {
        let storage = Arc::new(MemoryStorage::new());
        let cfg = ExecutorConfig {
            commit_wait_timeout: Duration::from_millis(100),
            ..ExecutorConfig::default()
        };
        let lse = LogStreamExecutor::new(1, LSID, storage.clone(), test_replicator(), cfg).unwrap();

        append_committed(&lse, "log-1", 1).await;

        // Two writes that never commit.
        for _ in 0..2 {
            let err = lse.append(Bytes::from_static(b"uncommitted"), vec![]).await.unwrap_err();
            assert!(matches!(err, Error::DeadlineExceeded(_)));
        }
        assert_eq!(lse.get_report().uncommitted_llsn_length, 2);

        let (status, sealed_glsn) = lse.seal(1);
        assert_eq!(status, LogStreamStatus::Sealed);
        assert_eq!(sealed_glsn, 1);
        assert_eq!(lse.get_report().uncommitted_llsn_length, 0);

        let points = storage.read_recovery_points().unwrap();
        assert_eq!(points.last_written_llsn, 1);
        lse.close();
    }

    #[tokio::test]
    async fn empty_commit_round_stores_commit_context() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage.clone());

        lse.commit(CommittedStatus {
            log_stream_id: LSID,
            high_watermark: 10,
            prev_high_watermark: 0,
            committed_glsn_offset: 1,
            committed_glsn_length: 0,
        })
        .await
        .unwrap();

        loop {
            if lse.get_report().high_watermark == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let cc = storage.read_recovery_points().unwrap().commit_context.unwrap();
        assert_eq!(cc.high_watermark, 10);
        assert_eq!(cc.committed_glsn_length, 0);
        lse.close();
    }

    #[tokio::test]
    async fn stale_and_gapped_commits_are_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);
        append_committed(&lse, "log-1", 1).await;

        // duplicate of the applied round
        lse.commit(status_at(1, 1, 1)).await.unwrap();
        // a round with a gapped predecessor
        lse.commit(CommittedStatus {
            log_stream_id: LSID,
            high_watermark: 6,
            prev_high_watermark: 5,
            committed_glsn_offset: 6,
            committed_glsn_length: 1,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lse.get_report().high_watermark, 1);
        lse.close();
    }

    #[tokio::test]
    async fn backup_writes_must_be_dense() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);

        lse.replicate(1, Bytes::from_static(b"a")).await.unwrap();
        lse.replicate(2, Bytes::from_static(b"b")).await.unwrap();
        // duplicate delivery after reconnect is acknowledged
        lse.replicate(1, Bytes::from_static(b"a")).await.unwrap();
        // a hole is rejected
        assert!(matches!(
            lse.replicate(4, Bytes::from_static(b"d")).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(lse.get_report().uncommitted_llsn_length, 2);
        lse.close();
    }

    #[tokio::test]
    async fn prev_commit_info_statuses() {
        let storage = Arc::new(MemoryStorage::new());
        let lse = new_executor(storage);
        for i in 1..=2 {
            append_committed(&lse, "log", i).await;
        }

        struct Test {
            hwm: Glsn,
            expect: CommitInfoStatus,
        }
        let tests = vec![
            Test { hwm: 0, expect: CommitInfoStatus::Ok },
            Test { hwm: 1, expect: CommitInfoStatus::Ok },
            Test { hwm: 2, expect: CommitInfoStatus::None },
            Test { hwm: 7, expect: CommitInfoStatus::None },
        ];
        for Test { hwm, expect } in tests {
            let info = lse.get_prev_commit_info(hwm);
            assert_eq!(info.status(), expect, "hwm {hwm}");
            if expect == CommitInfoStatus::Ok {
                assert_eq!(info.high_watermark, hwm + 1);
                assert_eq!(info.committed_glsn_length, 1);
            }
        }
        assert_eq!(lse.get_prev_commit_info(0).highest_written_llsn, 2);
        lse.close();
    }

    #[tokio::test]
    async fn restart_restores_watermarks() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let lse = new_executor(storage.clone());
            for i in 1..=3 {
                append_committed(&lse, "log", i).await;
            }
            lse.close();
        }

        let lse = new_executor(storage);
        let report = lse.get_report();
        assert_eq!(report.high_watermark, 3);
        assert_eq!(report.uncommitted_llsn_offset, 4);
        assert_eq!(report.uncommitted_llsn_length, 0);
        assert_eq!(lse.read(2).unwrap().llsn, 2);
        lse.close();
    }

    #[tokio::test]
    async fn restart_mid_round_reports_previous_watermark() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write(1, b"log").unwrap();
        // The commit context of round 3 -> 5 is durable but none of its
        // mappings were flushed before the crash.
        storage
            .store_commit_context(CommitContext {
                high_watermark: 5,
                prev_high_watermark: 3,
                committed_glsn_offset: 4,
                committed_glsn_length: 1,
                committed_llsn_offset: 1,
            })
            .unwrap();

        let lse = new_executor(storage);
        assert_eq!(lse.get_report().high_watermark, 3);
        lse.close();
    }

    #[tokio::test]
    async fn append_timeout_reports_deadline_exceeded() {
        let storage = Arc::new(MemoryStorage::new());
        let cfg = ExecutorConfig {
            commit_wait_timeout: Duration::from_millis(10),
            ..ExecutorConfig::default()
        };
        let lse = LogStreamExecutor::new(1, LSID, storage, test_replicator(), cfg).unwrap();
        let err = lse.append(Bytes::from_static(b"log"), vec![]).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
        lse.close();
    }

    /// A storage wrapper whose writes can be forced to fail.
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: AtomicBool,
    }

    impl Storage for FlakyStorage {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn write(&self, llsn: Llsn, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::Acquire) {
                return Err(Error::Internal("injected write failure".to_owned()));
            }
            self.inner.write(llsn, data)
        }
        fn new_write_batch(&self) -> Box<dyn WriteBatch + '_> {
            self.inner.new_write_batch()
        }
        fn commit(&self, llsn: Llsn, glsn: Glsn) -> Result<()> {
            self.inner.commit(llsn, glsn)
        }
        fn new_commit_batch(&self) -> Box<dyn CommitBatch + '_> {
            self.inner.new_commit_batch()
        }
        fn store_commit_context(&self, commit_context: CommitContext) -> Result<()> {
            self.inner.store_commit_context(commit_context)
        }
        fn read(&self, glsn: Glsn) -> Result<LogEntry> {
            self.inner.read(glsn)
        }
        fn scan(&self, begin: Glsn, end: Glsn) -> Result<Box<dyn Scanner + '_>> {
            self.inner.scan(begin, end)
        }
        fn delete_committed(&self, glsn: Glsn) -> Result<()> {
            self.inner.delete_committed(glsn)
        }
        fn delete_uncommitted(&self, llsn: Llsn) -> Result<()> {
            self.inner.delete_uncommitted(llsn)
        }
        fn read_recovery_points(&self) -> Result<RecoveryPoints> {
            self.inner.read_recovery_points()
        }
    }

    #[tokio::test]
    async fn write_failure_seals_the_replica() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryStorage::new(),
            fail_writes: AtomicBool::new(true),
        });
        let lse = new_executor(storage);

        let err = lse.append(Bytes::from_static(b"log"), vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(lse.status(), LogStreamStatus::Sealing);

        // Later appends are refused before entering the pipeline.
        assert!(matches!(
            lse.append(Bytes::from_static(b"log"), vec![]).await,
            Err(Error::Sealed)
        ));
        lse.close();
    }
}
