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

//! Report collection and commit distribution.
//!
//! The collector runs one executor per storage node and one committer per
//! log stream replica set on that node. The executor's report loop pulls
//! uncommitted-region reports and proposes them into consensus best-effort;
//! each committer pushes committed rounds back to its storage node in strict
//! high-watermark order, catching the replica up from its reported
//! watermark. Workers address each other by id through the collector, never
//! by back-pointer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::{trace, warn};
use strom_api::v1::{
    LogStreamCommitResults, LogStreamStatus, LogStreamUncommitReport, StorageNodeDescriptor,
};
use strom_api::{Glsn, Llsn, LogStreamId, StorageNodeId};
use strom_runtime::{JoinHandle, Shutdown, ShutdownNotifier};
use tokio::sync::Notify;

use crate::reporter_client::ReporterClient;
use crate::{async_trait, CollectorConfig, Error, Result};

/// The collector's view of its metadata repository.
#[async_trait]
pub trait CollectorHelper: Send + Sync + 'static {
    async fn get_reporter_client(
        &self,
        sn: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>>;

    /// Best-effort propose of freshly pulled reports. `Err(Ignore)` means
    /// the propose channel is saturated; the loop retries next tick.
    fn propose_report(
        &self,
        snid: StorageNodeId,
        reports: Vec<LogStreamUncommitReport>,
    ) -> Result<()>;

    /// The commit round following `glsn`, `Ok(None)` when caught up, and
    /// `Err(Trimmed)` when `glsn` precedes the retained history.
    fn lookup_next_commit_results(&self, glsn: Glsn) -> Result<Option<LogStreamCommitResults>>;
}

pub struct ReportCollector {
    helper: Arc<dyn CollectorHelper>,
    cfg: CollectorConfig,
    executors: RwLock<HashMap<StorageNodeId, Arc<CollectExecutor>>>,
    running: AtomicBool,
}

impl ReportCollector {
    pub fn new(helper: Arc<dyn CollectorHelper>, cfg: CollectorConfig) -> Self {
        ReportCollector {
            helper,
            cfg,
            executors: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        let mut executors = self.executors.write().expect("Poisoned");
        for (_, executor) in executors.drain() {
            executor.stop();
        }
    }

    /// Wipe all executors, keeping the collector usable for `recover`.
    pub fn reset(&self) {
        let mut executors = self.executors.write().expect("Poisoned");
        for (_, executor) in executors.drain() {
            executor.stop();
        }
    }

    /// Rebuild executors and committers from recovered metadata. A no-op on
    /// a closed collector.
    pub fn recover(
        &self,
        sns: &[StorageNodeDescriptor],
        lss: &[strom_api::v1::LogStreamDescriptor],
        high_watermark: Glsn,
    ) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        for sn in sns {
            self.register_storage_node(sn)?;
        }
        for ls in lss {
            for replica in &ls.replicas {
                self.register_log_stream(
                    replica.storage_node_id,
                    ls.log_stream_id,
                    high_watermark,
                    ls.status(),
                )?;
            }
        }
        Ok(())
    }

    pub fn register_storage_node(&self, sn: &StorageNodeDescriptor) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if sn.storage_node_id == 0 {
            return Err(Error::InvalidArgument("storage node descriptor".to_owned()));
        }

        let mut executors = self.executors.write().expect("Poisoned");
        if executors.contains_key(&sn.storage_node_id) {
            return Err(Error::AlreadyExists(format!("storage node {}", sn.storage_node_id)));
        }
        let executor = CollectExecutor::spawn(sn.clone(), Arc::clone(&self.helper), self.cfg.clone());
        executors.insert(sn.storage_node_id, executor);
        Ok(())
    }

    pub fn unregister_storage_node(&self, snid: StorageNodeId) -> Result<()> {
        let mut executors = self.executors.write().expect("Poisoned");
        let executor =
            executors.get(&snid).ok_or_else(|| Error::NotExist(format!("storage node {snid}")))?;
        if executor.num_committers() != 0 {
            return Err(Error::NotEmpty);
        }
        let executor = executors.remove(&snid).expect("checked above");
        executor.stop();
        Ok(())
    }

    pub fn register_log_stream(
        &self,
        snid: StorageNodeId,
        lsid: LogStreamId,
        known_high_watermark: Glsn,
        status: LogStreamStatus,
    ) -> Result<()> {
        let executor = self.lookup_executor(snid)?;
        executor.register_committer(lsid, known_high_watermark, status)
    }

    pub fn unregister_log_stream(&self, snid: StorageNodeId, lsid: LogStreamId) -> Result<()> {
        let executor = self.lookup_executor(snid)?;
        executor.unregister_committer(lsid)
    }

    /// Wake every committer to push newly decided rounds.
    pub fn commit(&self) {
        let executors = self.executors.read().expect("Poisoned");
        for executor in executors.values() {
            executor.wake_committers();
        }
    }

    /// Suppress commit pushes for `lsid` on every storage node.
    pub fn seal(&self, lsid: LogStreamId) {
        let executors = self.executors.read().expect("Poisoned");
        for executor in executors.values() {
            executor.seal_committer(lsid);
        }
    }

    /// Resume commit pushes for `lsid`, seeding catch-up at `high_watermark`.
    pub fn unseal(&self, lsid: LogStreamId, high_watermark: Glsn) {
        let executors = self.executors.read().expect("Poisoned");
        for executor in executors.values() {
            executor.unseal_committer(lsid, high_watermark);
        }
    }

    pub fn num_executors(&self) -> usize {
        self.executors.read().expect("Poisoned").len()
    }

    pub fn num_committers(&self) -> usize {
        self.executors.read().expect("Poisoned").values().map(|e| e.num_committers()).sum()
    }

    /// The watermark `lsid` most recently reported through `snid`, if any.
    pub fn reported_high_watermark(
        &self,
        snid: StorageNodeId,
        lsid: LogStreamId,
    ) -> Option<Glsn> {
        let executors = self.executors.read().expect("Poisoned");
        executors.get(&snid).and_then(|executor| executor.reported_high_watermark(lsid))
    }

    fn lookup_executor(&self, snid: StorageNodeId) -> Result<Arc<CollectExecutor>> {
        self.executors
            .read()
            .expect("Poisoned")
            .get(&snid)
            .cloned()
            .ok_or_else(|| Error::NotExist(format!("storage node {snid}")))
    }
}

impl Drop for ReportCollector {
    fn drop(&mut self) {
        self.close();
    }
}

/// A streaming client shared by one executor and all of its committers.
/// Invalidation closes only the instance the caller observed failing, so a
/// racing reconnect is never torn down by a stale handle.
struct SharedClient {
    helper: Arc<dyn CollectorHelper>,
    storage_node: StorageNodeDescriptor,
    current: tokio::sync::Mutex<Option<Arc<dyn ReporterClient>>>,
}

impl SharedClient {
    fn new(helper: Arc<dyn CollectorHelper>, storage_node: StorageNodeDescriptor) -> Arc<Self> {
        Arc::new(SharedClient { helper, storage_node, current: tokio::sync::Mutex::new(None) })
    }

    async fn get(&self) -> Result<Arc<dyn ReporterClient>> {
        let mut current = self.current.lock().await;
        if let Some(client) = current.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = self.helper.get_reporter_client(&self.storage_node).await?;
        *current = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn invalidate(&self, observed: &Arc<dyn ReporterClient>) {
        let mut current = self.current.lock().await;
        if let Some(client) = current.as_ref() {
            if Arc::ptr_eq(client, observed) {
                client.close();
                *current = None;
            }
        }
    }

    async fn close(&self) {
        let mut current = self.current.lock().await;
        if let Some(client) = current.take() {
            client.close();
        }
    }
}

struct CollectExecutor {
    storage_node: StorageNodeDescriptor,
    helper: Arc<dyn CollectorHelper>,
    cfg: CollectorConfig,
    client: Arc<SharedClient>,
    committers: RwLock<HashMap<LogStreamId, Arc<Committer>>>,
    /// Latest reported high watermark per log stream, shared with the
    /// committers as their catch-up base.
    reported: Arc<RwLock<HashMap<LogStreamId, Glsn>>>,
    /// Last proposed uncommitted end per log stream, for dedup.
    last_sent: Mutex<HashMap<LogStreamId, Llsn>>,
    last_full_report: Mutex<Instant>,
    shutdown: ShutdownNotifier,
    report_task: Mutex<Option<JoinHandle<()>>>,
}

impl CollectExecutor {
    fn spawn(
        storage_node: StorageNodeDescriptor,
        helper: Arc<dyn CollectorHelper>,
        cfg: CollectorConfig,
    ) -> Arc<Self> {
        let client = SharedClient::new(Arc::clone(&helper), storage_node.clone());
        let executor = Arc::new(CollectExecutor {
            storage_node,
            helper,
            cfg,
            client,
            committers: RwLock::new(HashMap::new()),
            reported: Arc::new(RwLock::new(HashMap::new())),
            last_sent: Mutex::new(HashMap::new()),
            last_full_report: Mutex::new(Instant::now()),
            shutdown: ShutdownNotifier::new(),
            report_task: Mutex::new(None),
        });

        let task = strom_runtime::spawn(Self::report_loop(
            Arc::clone(&executor),
            executor.shutdown.subscribe(),
        ));
        *executor.report_task.lock().expect("Poisoned") = Some(task);
        executor
    }

    fn stop(&self) {
        self.shutdown.notify();
        let mut committers = self.committers.write().expect("Poisoned");
        for (_, committer) in committers.drain() {
            committer.stop();
        }
        self.report_task.lock().expect("Poisoned").take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = Arc::clone(&self.client);
            handle.spawn(async move { client.close().await });
        }
    }

    fn num_committers(&self) -> usize {
        self.committers.read().expect("Poisoned").len()
    }

    fn reported_high_watermark(&self, lsid: LogStreamId) -> Option<Glsn> {
        self.reported.read().expect("Poisoned").get(&lsid).copied()
    }

    fn register_committer(
        &self,
        lsid: LogStreamId,
        known_high_watermark: Glsn,
        status: LogStreamStatus,
    ) -> Result<()> {
        let mut committers = self.committers.write().expect("Poisoned");
        if committers.contains_key(&lsid) {
            return Err(Error::AlreadyExists(format!("log stream {lsid}")));
        }
        let committer = Committer::spawn(
            lsid,
            known_high_watermark,
            status,
            Arc::clone(&self.helper),
            Arc::clone(&self.client),
            Arc::clone(&self.reported),
        );
        committers.insert(lsid, committer);
        Ok(())
    }

    fn unregister_committer(&self, lsid: LogStreamId) -> Result<()> {
        let committer = self
            .committers
            .write()
            .expect("Poisoned")
            .remove(&lsid)
            .ok_or_else(|| Error::NotExist(format!("log stream {lsid}")))?;
        committer.stop();
        Ok(())
    }

    fn wake_committers(&self) {
        let committers = self.committers.read().expect("Poisoned");
        for committer in committers.values() {
            committer.notify.notify_one();
        }
    }

    fn seal_committer(&self, lsid: LogStreamId) {
        if let Some(committer) = self.committers.read().expect("Poisoned").get(&lsid) {
            committer.seal();
        }
    }

    fn unseal_committer(&self, lsid: LogStreamId, high_watermark: Glsn) {
        if let Some(committer) = self.committers.read().expect("Poisoned").get(&lsid) {
            committer.unseal(high_watermark);
        }
    }

    async fn report_loop(executor: Arc<CollectExecutor>, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(executor.cfg.report_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            }
            executor.collect_report_once().await;
        }
    }

    async fn collect_report_once(&self) {
        let client = match self.client.get().await {
            Ok(client) => client,
            Err(err) => {
                trace!(
                    "storage node {}: reporter connect: {err}",
                    self.storage_node.storage_node_id
                );
                return;
            }
        };
        let report = match client.get_report().await {
            Ok(report) => report,
            Err(err) => {
                trace!("storage node {}: get report: {err}", self.storage_node.storage_node_id);
                self.client.invalidate(&client).await;
                return;
            }
        };

        {
            let mut reported = self.reported.write().expect("Poisoned");
            for ls_report in &report.uncommit_reports {
                reported.insert(ls_report.log_stream_id, ls_report.high_watermark);
            }
        }

        // Propose a per-stream entry only when its uncommitted end advanced
        // since the last sent one, or when the full-report deadline elapsed.
        let full = {
            let mut last_full = self.last_full_report.lock().expect("Poisoned");
            if last_full.elapsed() >= self.cfg.report_all_interval {
                *last_full = Instant::now();
                true
            } else {
                false
            }
        };
        let to_send: Vec<LogStreamUncommitReport> = {
            let last_sent = self.last_sent.lock().expect("Poisoned");
            report
                .uncommit_reports
                .iter()
                .filter(|ls_report| {
                    full || last_sent
                        .get(&ls_report.log_stream_id)
                        .map(|&end| ls_report.uncommitted_llsn_end() > end)
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };
        if to_send.is_empty() {
            return;
        }

        match self.helper.propose_report(report.storage_node_id, to_send.clone()) {
            Ok(()) => {
                let mut last_sent = self.last_sent.lock().expect("Poisoned");
                for ls_report in &to_send {
                    last_sent.insert(ls_report.log_stream_id, ls_report.uncommitted_llsn_end());
                }
            }
            Err(Error::Ignore) => {}
            Err(err) => {
                warn!("storage node {}: propose report: {err}", report.storage_node_id);
            }
        }
    }
}

struct CommitterState {
    status: LogStreamStatus,
    sent_high_watermark: Glsn,
}

struct Committer {
    log_stream_id: LogStreamId,
    helper: Arc<dyn CollectorHelper>,
    client: Arc<SharedClient>,
    reported: Arc<RwLock<HashMap<LogStreamId, Glsn>>>,
    state: Mutex<CommitterState>,
    notify: Arc<Notify>,
    shutdown: ShutdownNotifier,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Committer {
    fn spawn(
        log_stream_id: LogStreamId,
        known_high_watermark: Glsn,
        status: LogStreamStatus,
        helper: Arc<dyn CollectorHelper>,
        client: Arc<SharedClient>,
        reported: Arc<RwLock<HashMap<LogStreamId, Glsn>>>,
    ) -> Arc<Self> {
        let status = if status == LogStreamStatus::Sealed {
            LogStreamStatus::Sealed
        } else {
            LogStreamStatus::Running
        };
        let committer = Arc::new(Committer {
            log_stream_id,
            helper,
            client,
            reported,
            state: Mutex::new(CommitterState {
                status,
                sent_high_watermark: known_high_watermark,
            }),
            notify: Arc::new(Notify::new()),
            shutdown: ShutdownNotifier::new(),
            task: Mutex::new(None),
        });

        let task = strom_runtime::spawn(Self::commit_loop(
            Arc::clone(&committer),
            committer.shutdown.subscribe(),
        ));
        *committer.task.lock().expect("Poisoned") = Some(task);
        committer
    }

    fn stop(&self) {
        self.shutdown.notify();
        self.task.lock().expect("Poisoned").take();
    }

    fn seal(&self) {
        self.state.lock().expect("Poisoned").status = LogStreamStatus::Sealed;
    }

    fn unseal(&self, high_watermark: Glsn) {
        let mut state = self.state.lock().expect("Poisoned");
        state.status = LogStreamStatus::Running;
        state.sent_high_watermark = high_watermark;
        self.notify.notify_one();
    }

    pub(crate) fn status(&self) -> LogStreamStatus {
        self.state.lock().expect("Poisoned").status
    }

    async fn commit_loop(committer: Arc<Committer>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = committer.notify.notified() => {}
            }
            committer.catchup().await;
        }
    }

    /// Send every round after the replica's reported watermark, in order.
    /// A trimmed gap skips this cycle; the next report either reveals the
    /// replica already advanced or the gap persists until it does.
    async fn catchup(&self) {
        let mut cursor = {
            let state = self.state.lock().expect("Poisoned");
            if state.status == LogStreamStatus::Sealed {
                return;
            }
            self.reported
                .read()
                .expect("Poisoned")
                .get(&self.log_stream_id)
                .copied()
                .unwrap_or(state.sent_high_watermark)
        };

        loop {
            let results = match self.helper.lookup_next_commit_results(cursor) {
                Ok(Some(results)) => results,
                Ok(None) => return,
                Err(err) => {
                    trace!("log stream {}: catch-up from {cursor}: {err}", self.log_stream_id);
                    return;
                }
            };
            if self.state.lock().expect("Poisoned").status == LogStreamStatus::Sealed {
                return;
            }

            let client = match self.client.get().await {
                Ok(client) => client,
                Err(_) => return,
            };
            let next = results.high_watermark;
            if let Err(err) = client.commit(results).await {
                trace!("log stream {}: push commit {next}: {err}", self.log_stream_id);
                self.client.invalidate(&client).await;
                return;
            }

            cursor = next;
            self.state.lock().expect("Poisoned").sent_high_watermark = cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::time::Duration;

    use strom_api::v1::{LogStreamCommitResult, LogStreamDescriptor, ReplicaDescriptor};
    use strom_api::{INVALID_GLSN, MIN_LLSN};

    use super::*;
    use crate::reporter_client::{DummyReporterClientFactory, ReporterClientFactory};

    struct DummyHelper {
        factory: Arc<DummyReporterClientFactory>,
        reports: Mutex<VecDeque<(StorageNodeId, Vec<LogStreamUncommitReport>)>>,
        rounds: Mutex<Vec<LogStreamCommitResults>>,
    }

    impl DummyHelper {
        fn new(factory: Arc<DummyReporterClientFactory>) -> Arc<Self> {
            Arc::new(DummyHelper {
                factory,
                reports: Mutex::new(VecDeque::new()),
                rounds: Mutex::new(Vec::new()),
            })
        }

        fn take_report(&self) -> Option<(StorageNodeId, Vec<LogStreamUncommitReport>)> {
            self.reports.lock().expect("Poisoned").pop_front()
        }

        fn append_round(&self, results: LogStreamCommitResults) {
            self.rounds.lock().expect("Poisoned").push(results);
        }

        fn trim(&self, glsn: Glsn) {
            let mut rounds = self.rounds.lock().expect("Poisoned");
            if let Some(idx) = rounds.iter().position(|gls| gls.high_watermark == glsn) {
                rounds.drain(..idx);
            }
        }
    }

    #[async_trait]
    impl CollectorHelper for DummyHelper {
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
            let mut queue = self.reports.lock().expect("Poisoned");
            if queue.len() >= 4096 {
                return Err(Error::Ignore);
            }
            queue.push_back((snid, reports));
            Ok(())
        }

        fn lookup_next_commit_results(
            &self,
            glsn: Glsn,
        ) -> Result<Option<LogStreamCommitResults>> {
            let rounds = self.rounds.lock().expect("Poisoned");
            let Some(first) = rounds.first() else {
                return Ok(None);
            };
            if first.prev_high_watermark > glsn {
                return Err(Error::Trimmed);
            }
            Ok(rounds.iter().find(|gls| gls.prev_high_watermark == glsn).cloned())
        }
    }

    /// Produces consecutive rounds the way the state machine would: one
    /// entry per live stream, sealed streams get zero-length results.
    struct CommitSim {
        offsets: Vec<Llsn>,
        sealed: HashSet<LogStreamId>,
    }

    impl CommitSim {
        fn new() -> Self {
            CommitSim { offsets: Vec::new(), sealed: HashSet::new() }
        }

        fn seal(&mut self, lsid: LogStreamId) {
            self.sealed.insert(lsid);
        }

        fn unseal(&mut self, lsid: LogStreamId) {
            self.sealed.remove(&lsid);
        }

        fn next_round(&mut self, prev: Glsn, nr_log_streams: u64) -> LogStreamCommitResults {
            while (self.offsets.len() as u64) < nr_log_streams {
                self.offsets.push(MIN_LLSN);
            }
            let mut glsn = prev + 1;
            let mut commit_results = Vec::new();
            for i in 0..nr_log_streams {
                let lsid = i + 1;
                let length = if self.sealed.contains(&lsid) { 0 } else { 1 };
                commit_results.push(LogStreamCommitResult {
                    log_stream_id: lsid,
                    committed_glsn_offset: glsn,
                    committed_glsn_length: length,
                    committed_llsn_offset: self.offsets[i as usize],
                });
                self.offsets[i as usize] += length;
                glsn += length;
            }
            LogStreamCommitResults {
                high_watermark: glsn - 1,
                prev_high_watermark: prev,
                commit_results,
            }
        }
    }

    fn storage_node(id: StorageNodeId) -> StorageNodeDescriptor {
        StorageNodeDescriptor { storage_node_id: id, ..Default::default() }
    }

    fn collector_config() -> CollectorConfig {
        CollectorConfig {
            report_interval: Duration::from_millis(5),
            report_all_interval: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn register_storage_node_rules() {
        let factory = DummyReporterClientFactory::new(1, true);
        let helper = DummyHelper::new(factory);
        let collector = ReportCollector::new(helper, collector_config());
        collector.run();

        assert!(matches!(
            collector.register_storage_node(&storage_node(0)),
            Err(Error::InvalidArgument(_))
        ));

        collector.register_storage_node(&storage_node(1)).unwrap();
        assert_eq!(collector.num_executors(), 1);
        assert!(matches!(
            collector.register_storage_node(&storage_node(1)),
            Err(Error::AlreadyExists(_))
        ));
        collector.close();
    }

    #[tokio::test]
    async fn register_log_stream_rules() {
        let factory = DummyReporterClientFactory::new(1, true);
        let helper = DummyHelper::new(factory);
        let collector = ReportCollector::new(helper, collector_config());
        collector.run();

        assert!(matches!(
            collector.register_log_stream(1, 1, INVALID_GLSN, LogStreamStatus::Running),
            Err(Error::NotExist(_))
        ));

        collector.register_storage_node(&storage_node(1)).unwrap();
        collector.register_log_stream(1, 1, INVALID_GLSN, LogStreamStatus::Running).unwrap();
        assert_eq!(collector.num_committers(), 1);
        assert!(matches!(
            collector.register_log_stream(1, 1, INVALID_GLSN, LogStreamStatus::Running),
            Err(Error::AlreadyExists(_))
        ));
        collector.close();
    }

    #[tokio::test]
    async fn unregister_rules() {
        let factory = DummyReporterClientFactory::new(1, true);
        let helper = DummyHelper::new(factory);
        let collector = ReportCollector::new(helper, collector_config());
        collector.run();

        assert!(matches!(collector.unregister_storage_node(1), Err(Error::NotExist(_))));
        assert!(matches!(collector.unregister_log_stream(1, 1), Err(Error::NotExist(_))));

        collector.register_storage_node(&storage_node(1)).unwrap();
        collector.register_log_stream(1, 1, INVALID_GLSN, LogStreamStatus::Running).unwrap();

        // A storage node with attached committers cannot be unregistered.
        assert!(matches!(collector.unregister_storage_node(1), Err(Error::NotEmpty)));

        collector.unregister_log_stream(1, 1).unwrap();
        assert_eq!(collector.num_committers(), 0);
        collector.unregister_storage_node(1).unwrap();
        assert_eq!(collector.num_executors(), 0);
        collector.close();
    }

    #[tokio::test]
    async fn reset_and_recover_rebuild_the_tree() {
        let factory = DummyReporterClientFactory::new(1, true);
        let helper = DummyHelper::new(factory);
        let collector = ReportCollector::new(helper, collector_config());
        collector.run();

        let mut sns = Vec::new();
        let mut lss = Vec::new();
        for i in 1..=5u64 {
            let sn = storage_node(i);
            collector.register_storage_node(&sn).unwrap();
            collector.register_log_stream(i, i, INVALID_GLSN, LogStreamStatus::Running).unwrap();
            sns.push(sn);
            let status = match i {
                1 => LogStreamStatus::Sealing,
                2 => LogStreamStatus::Sealed,
                _ => LogStreamStatus::Running,
            };
            lss.push(LogStreamDescriptor {
                log_stream_id: i,
                topic_id: 1,
                status: status as i32,
                replicas: vec![ReplicaDescriptor { storage_node_id: i, ..Default::default() }],
            });
        }
        assert_eq!(collector.num_executors(), 5);

        collector.reset();
        assert_eq!(collector.num_executors(), 0);

        collector.recover(&sns, &lss, 1).unwrap();
        assert_eq!(collector.num_executors(), 5);
        assert_eq!(collector.num_committers(), 5);

        // A sealed stream's committer starts sealed; a sealing one runs so
        // it can drain to its seal point.
        let executors = collector.executors.read().unwrap();
        let sealing = executors[&1].committers.read().unwrap()[&1].status();
        let sealed = executors[&2].committers.read().unwrap()[&2].status();
        assert_eq!(sealing, LogStreamStatus::Running);
        assert_eq!(sealed, LogStreamStatus::Sealed);
        drop(executors);

        // Recovering a closed collector is a no-op.
        collector.close();
        collector.recover(&sns, &lss, 1).unwrap();
        assert_eq!(collector.num_executors(), 0);
    }

    #[tokio::test]
    async fn reports_flow_from_registered_storage_nodes() {
        let factory = DummyReporterClientFactory::new(1, false);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), collector_config());
        collector.run();

        for i in 1..=3u64 {
            collector.register_storage_node(&storage_node(i)).unwrap();
        }

        let mut seen: HashSet<StorageNodeId> = HashSet::new();
        wait_until(|| {
            while let Some((snid, _)) = helper.take_report() {
                seen.insert(snid);
            }
            seen.len() == 3
        })
        .await;
        collector.close();
    }

    #[tokio::test]
    async fn report_dedup_only_sends_advanced_streams() {
        let factory = DummyReporterClientFactory::new(3, true);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), CollectorConfig {
            report_interval: Duration::from_millis(5),
            report_all_interval: Duration::from_secs(3600),
            rpc_timeout: Duration::from_secs(1),
        });
        collector.run();
        collector.register_storage_node(&storage_node(1)).unwrap();

        // The first report covers all streams.
        let mut first = None;
        wait_until(|| {
            first = helper.take_report();
            first.is_some()
        })
        .await;
        assert_eq!(first.unwrap().1.len(), 3);

        let client = factory.lookup_client(1).unwrap();
        for idx in 0..3usize {
            client.increase_uncommitted(idx);
            let mut next = None;
            wait_until(|| {
                next = helper.take_report();
                next.is_some()
            })
            .await;
            let (_, reports) = next.unwrap();
            assert_eq!(reports.len(), 1, "only the advanced stream is re-proposed");
            assert_eq!(reports[0].log_stream_id, client.log_stream_ids()[idx]);
        }
        collector.close();
    }

    #[tokio::test]
    async fn full_reports_resume_after_report_all_interval() {
        let factory = DummyReporterClientFactory::new(3, true);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), CollectorConfig {
            report_interval: Duration::from_millis(5),
            report_all_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_secs(1),
        });
        collector.run();
        collector.register_storage_node(&storage_node(1)).unwrap();

        let mut full_reports = 0;
        wait_until(|| {
            while let Some((_, reports)) = helper.take_report() {
                if reports.len() == 3 {
                    full_reports += 1;
                }
            }
            full_reports >= 2
        })
        .await;
        collector.close();
    }

    #[tokio::test]
    async fn commit_broadcast_converges_in_order() {
        let nr_storage = 5u64;
        let factory = DummyReporterClientFactory::new(1, false);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), collector_config());
        collector.run();

        for i in 1..=nr_storage {
            collector.register_storage_node(&storage_node(i)).unwrap();
            collector.register_log_stream(i, i, INVALID_GLSN, LogStreamStatus::Running).unwrap();
        }

        let mut sim = CommitSim::new();
        let mut hwm = INVALID_GLSN;

        let round = sim.next_round(hwm, nr_storage);
        hwm = round.high_watermark;
        helper.append_round(round);
        collector.commit();
        for i in 1..=nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }

        // Two pending rounds arrive in order; the replica accepts both.
        for _ in 0..2 {
            let round = sim.next_round(hwm, nr_storage);
            hwm = round.high_watermark;
            helper.append_round(round);
        }
        collector.commit();
        for i in 1..=nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }
        collector.close();
    }

    #[tokio::test]
    async fn late_storage_node_catches_up_from_its_watermark() {
        let mut nr_storage = 5u64;
        let factory = DummyReporterClientFactory::new(1, false);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), collector_config());
        collector.run();

        for i in 1..=nr_storage {
            collector.register_storage_node(&storage_node(i)).unwrap();
            collector.register_log_stream(i, i, INVALID_GLSN, LogStreamStatus::Running).unwrap();
        }

        let mut sim = CommitSim::new();
        let mut hwm = INVALID_GLSN;
        for _ in 0..3 {
            let round = sim.next_round(hwm, nr_storage);
            hwm = round.high_watermark;
            helper.append_round(round);
        }
        for i in 1..=nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }
        helper.trim(hwm);

        // A new storage node seeded at the current watermark only receives
        // rounds decided after it joined.
        nr_storage += 1;
        collector.register_storage_node(&storage_node(nr_storage)).unwrap();
        collector
            .register_log_stream(nr_storage, nr_storage, hwm, LogStreamStatus::Running)
            .unwrap();

        let round = sim.next_round(hwm, nr_storage);
        hwm = round.high_watermark;
        helper.append_round(round);
        for i in 1..=nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }
        collector.close();
    }

    #[tokio::test]
    async fn sealed_committer_suppresses_pushes_until_unseal() {
        let nr_storage = 3u64;
        let factory = DummyReporterClientFactory::new(1, false);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), collector_config());
        collector.run();

        for i in 1..=nr_storage {
            collector.register_storage_node(&storage_node(i)).unwrap();
            collector.register_log_stream(i, i, INVALID_GLSN, LogStreamStatus::Running).unwrap();
        }

        let mut sim = CommitSim::new();
        let mut hwm = INVALID_GLSN;
        let round = sim.next_round(hwm, nr_storage);
        hwm = round.high_watermark;
        helper.append_round(round);
        for i in 1..=nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }

        let sealed_lsid = 3;
        collector.seal(sealed_lsid);
        sim.seal(sealed_lsid);
        let sealed_hwm = hwm;

        let round = sim.next_round(hwm, nr_storage);
        hwm = round.high_watermark;
        helper.append_round(round);
        for i in 1..nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }
        // The sealed stream's storage node received nothing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.commit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.lookup_client(sealed_lsid).unwrap().known_high_watermark(), sealed_hwm);

        // Unsealing seeds catch-up from the sealed watermark.
        collector.unseal(sealed_lsid, sealed_hwm);
        sim.unseal(sealed_lsid);
        let round = sim.next_round(hwm, nr_storage);
        hwm = round.high_watermark;
        helper.append_round(round);
        for i in 1..=nr_storage {
            let client = factory.lookup_client(i).unwrap();
            wait_until(|| {
                collector.commit();
                client.known_high_watermark() == hwm
            })
            .await;
        }
        collector.close();
    }

    #[tokio::test]
    async fn committer_catches_a_replica_up_from_its_reported_watermark() {
        let factory = DummyReporterClientFactory::new(1, false);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), collector_config());
        collector.run();
        collector.register_storage_node(&storage_node(1)).unwrap();
        collector.register_log_stream(1, 1, INVALID_GLSN, LogStreamStatus::Running).unwrap();

        let mut sim = CommitSim::new();
        let round = sim.next_round(INVALID_GLSN, 1);
        let mut hwm = round.high_watermark;
        helper.append_round(round);
        // The transport reconnects underneath the test, so always address
        // the live client instance through the factory.
        wait_until(|| factory.lookup_client(1).is_some()).await;
        wait_until(|| {
            collector.commit();
            factory.lookup_client(1).unwrap().known_high_watermark() == hwm
        })
        .await;
        wait_until(|| collector.reported_high_watermark(1, 1) == Some(hwm)).await;
        let stale_reported = hwm;

        // The report path goes dark while two more rounds are decided. The
        // committer keeps resending from the last reported watermark until
        // the replica converges; the replica drops what it already has.
        factory.lookup_client(1).unwrap().disable_report();
        for _ in 0..2 {
            let round = sim.next_round(hwm, 1);
            hwm = round.high_watermark;
            helper.append_round(round);
        }
        wait_until(|| {
            collector.commit();
            factory.lookup_client(1).unwrap().known_high_watermark() == hwm
        })
        .await;
        assert_eq!(collector.reported_high_watermark(1, 1), Some(stale_reported));

        // Reports resume and reveal the replica already advanced.
        factory.lookup_client(1).unwrap().enable_report();
        wait_until(|| collector.reported_high_watermark(1, 1) == Some(hwm)).await;

        // Even with the history trimmed during the gap, the next round after
        // the next report converges the replica.
        helper.trim(hwm);
        let round = sim.next_round(hwm, 1);
        hwm = round.high_watermark;
        helper.append_round(round);
        wait_until(|| {
            collector.commit();
            factory.lookup_client(1).unwrap().known_high_watermark() == hwm
        })
        .await;
        collector.close();
    }

    #[tokio::test]
    async fn crashed_reporter_stops_reports_until_recovery() {
        let factory = DummyReporterClientFactory::new(1, false);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let collector = ReportCollector::new(Arc::clone(&helper), collector_config());
        collector.run();
        collector.register_storage_node(&storage_node(1)).unwrap();

        wait_until(|| helper.take_report().is_some()).await;

        factory.crash_rpc(1);
        // Drain in-flight reports, then confirm silence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while helper.take_report().is_some() {}
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(helper.take_report().is_none());

        factory.recover_rpc(1);
        wait_until(|| helper.take_report().is_some()).await;
        collector.close();
    }

    #[tokio::test]
    async fn shared_client_reconnect_keeps_stale_handles_harmless() {
        let factory = DummyReporterClientFactory::new(1, true);
        let helper = DummyHelper::new(Arc::clone(&factory));
        let shared = SharedClient::new(helper, storage_node(1));

        let first = shared.get().await.unwrap();
        let again = shared.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // Invalidate the observed client: a fresh connection replaces it.
        shared.invalidate(&first).await;
        let fresh = shared.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(first.get_report().await.is_err());
        assert!(fresh.get_report().await.is_ok());

        // Invalidating through the stale handle must not close the fresh
        // connection.
        shared.invalidate(&again).await;
        let current = shared.get().await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &current));
        assert!(current.get_report().await.is_ok());
    }
}
