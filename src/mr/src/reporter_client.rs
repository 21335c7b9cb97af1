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

//! Clients used by the report collector to pull reports from and push
//! commits to storage nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strom_api::v1::log_stream_reporter_client::LogStreamReporterClient;
use strom_api::v1::{
    CommitRequest, GetReportRequest, GetReportResponse, LogStreamCommitResults,
    StorageNodeDescriptor, StorageNodeUncommitReport,
};
use strom_api::{Glsn, Llsn, LogStreamId, StorageNodeId, MIN_LLSN};
use strom_runtime::TaskGroup;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;

use crate::{async_trait, Error, Result};

#[async_trait]
pub trait ReporterClient: Send + Sync {
    async fn get_report(&self) -> Result<StorageNodeUncommitReport>;

    async fn commit(&self, commit_results: LogStreamCommitResults) -> Result<()>;

    fn close(&self);
}

#[async_trait]
pub trait ReporterClientFactory: Send + Sync {
    async fn get_reporter_client(
        &self,
        sn: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>>;
}

/// Streaming gRPC reporter client. One report stream and one commit stream
/// stay open per storage node; a transport error poisons the client and the
/// collector dials a fresh one.
pub struct GrpcReporterClient {
    report_tx: mpsc::Sender<GetReportRequest>,
    report_rx: tokio::sync::Mutex<Streaming<GetReportResponse>>,
    commit_tx: mpsc::Sender<CommitRequest>,
    rpc_timeout: Duration,
    closed: Arc<AtomicBool>,
    task_group: TaskGroup,
}

pub struct GrpcReporterClientFactory {
    pub rpc_timeout: Duration,
}

#[async_trait]
impl ReporterClientFactory for GrpcReporterClientFactory {
    async fn get_reporter_client(
        &self,
        sn: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>> {
        let client = GrpcReporterClient::connect(&sn.address, self.rpc_timeout).await?;
        Ok(Arc::new(client))
    }
}

impl GrpcReporterClient {
    pub async fn connect(address: &str, rpc_timeout: Duration) -> Result<Self> {
        let mut raw = LogStreamReporterClient::connect(format!("http://{address}")).await?;

        let (report_tx, report_req_rx) = mpsc::channel(16);
        let report_rx = raw
            .get_report(ReceiverStream::new(report_req_rx))
            .await
            .map_err(Error::Rpc)?
            .into_inner();

        let (commit_tx, commit_req_rx) = mpsc::channel(128);
        let closed = Arc::new(AtomicBool::new(false));
        let task_group = TaskGroup::default();
        {
            // The commit call resolves only when its request stream ends;
            // hold it for the lifetime of the client.
            let closed = Arc::clone(&closed);
            let mut raw = raw.clone();
            task_group.add_task(strom_runtime::spawn(async move {
                let _ = raw.commit(ReceiverStream::new(commit_req_rx)).await;
                closed.store(true, Ordering::Release);
            }));
        }

        Ok(GrpcReporterClient {
            report_tx,
            report_rx: tokio::sync::Mutex::new(report_rx),
            commit_tx,
            rpc_timeout,
            closed,
            task_group,
        })
    }
}

#[async_trait]
impl ReporterClient for GrpcReporterClient {
    async fn get_report(&self) -> Result<StorageNodeUncommitReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.report_tx.send(GetReportRequest {}).await.map_err(|_| Error::Closed)?;

        let mut report_rx = self.report_rx.lock().await;
        let response = tokio::time::timeout(self.rpc_timeout, report_rx.message())
            .await
            .map_err(|_| Error::DeadlineExceeded("get report".to_owned()))?;
        match response {
            Ok(Some(rsp)) => {
                rsp.report.ok_or_else(|| Error::InvalidData("uncommit report".to_owned()))
            }
            Ok(None) => Err(Error::Closed),
            Err(status) => Err(Error::from(status)),
        }
    }

    async fn commit(&self, commit_results: LogStreamCommitResults) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let request = CommitRequest { commit_results: Some(commit_results) };
        tokio::time::timeout(self.rpc_timeout, self.commit_tx.send(request))
            .await
            .map_err(|_| Error::DeadlineExceeded("commit".to_owned()))?
            .map_err(|_| Error::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task_group.abort_all();
    }
}

// ---- scriptable doubles ----
//
// One simulated storage node per client: every hosted log stream accrues
// uncommitted entries, commits apply like a real replica, and the factory
// can crash or recover the transport underneath the collector.

#[derive(Clone, Copy, PartialEq, Eq)]
enum DummyStatus {
    Running,
    Closed,
    Crashed,
}

#[derive(Clone)]
struct DummyStream {
    log_stream_id: LogStreamId,
    uncommitted_llsn_offset: Llsn,
    uncommitted_llsn_length: u64,
}

struct DummyState {
    status: DummyStatus,
    known_high_watermark: Glsn,
    streams: Vec<DummyStream>,
    report_enabled: bool,
    commit_delay: Option<Duration>,
}

pub struct DummyReporterClient {
    storage_node_id: StorageNodeId,
    manual: bool,
    state: Mutex<DummyState>,
}

pub struct DummyReporterClientFactory {
    nr_log_streams: u64,
    manual: bool,
    assigned: Mutex<HashMap<StorageNodeId, Vec<LogStreamId>>>,
    clients: Mutex<HashMap<StorageNodeId, Arc<DummyReporterClient>>>,
}

impl DummyReporterClientFactory {
    /// `manual` clients only accrue uncommitted entries through
    /// [`DummyReporterClient::increase_uncommitted`]; automatic ones grow by
    /// one entry per pulled report.
    pub fn new(nr_log_streams: u64, manual: bool) -> Arc<Self> {
        Arc::new(DummyReporterClientFactory {
            nr_log_streams,
            manual,
            assigned: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Host an explicit set of log streams on `snid` instead of the default
    /// one-stream-per-node layout. Lets tests share one log stream across
    /// storage nodes.
    pub fn assign_log_streams(&self, snid: StorageNodeId, lsids: Vec<LogStreamId>) {
        self.assigned.lock().expect("Poisoned").insert(snid, lsids);
    }

    pub fn lookup_client(&self, snid: StorageNodeId) -> Option<Arc<DummyReporterClient>> {
        self.clients.lock().expect("Poisoned").get(&snid).cloned()
    }

    pub fn crash_rpc(&self, snid: StorageNodeId) {
        if let Some(client) = self.lookup_client(snid) {
            client.state.lock().expect("Poisoned").status = DummyStatus::Crashed;
        }
    }

    pub fn recover_rpc(&self, snid: StorageNodeId) {
        let clients = self.clients.lock().expect("Poisoned");
        if let Some(old) = clients.get(&snid) {
            let mut state = old.state.lock().expect("Poisoned");
            state.status = DummyStatus::Running;
        }
    }
}

#[async_trait]
impl ReporterClientFactory for DummyReporterClientFactory {
    async fn get_reporter_client(
        &self,
        sn: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn ReporterClient>> {
        let mut clients = self.clients.lock().expect("Poisoned");
        let reopen = match clients.get(&sn.storage_node_id) {
            None => true,
            // A closed transport reconnects to the same simulated node; its
            // on-disk progress survives.
            Some(client) => {
                client.state.lock().expect("Poisoned").status == DummyStatus::Closed
            }
        };
        if reopen {
            let (known, streams, report_enabled, commit_delay) = match clients
                .get(&sn.storage_node_id)
            {
                Some(old) => {
                    let state = old.state.lock().expect("Poisoned");
                    (
                        state.known_high_watermark,
                        state.streams.clone(),
                        state.report_enabled,
                        state.commit_delay,
                    )
                }
                None => {
                    let lsids = self
                        .assigned
                        .lock()
                        .expect("Poisoned")
                        .get(&sn.storage_node_id)
                        .cloned()
                        .unwrap_or_else(|| {
                            (0..self.nr_log_streams)
                                .map(|i| {
                                    (sn.storage_node_id - 1) * self.nr_log_streams + i + 1
                                })
                                .collect()
                        });
                    (
                        0,
                        lsids
                            .into_iter()
                            .map(|log_stream_id| DummyStream {
                                log_stream_id,
                                uncommitted_llsn_offset: MIN_LLSN,
                                uncommitted_llsn_length: 0,
                            })
                            .collect(),
                        true,
                        None,
                    )
                }
            };
            clients.insert(
                sn.storage_node_id,
                Arc::new(DummyReporterClient {
                    storage_node_id: sn.storage_node_id,
                    manual: self.manual,
                    state: Mutex::new(DummyState {
                        status: DummyStatus::Running,
                        known_high_watermark: known,
                        streams,
                        report_enabled,
                        commit_delay,
                    }),
                }),
            );
        }
        Ok(clients.get(&sn.storage_node_id).expect("just inserted").clone())
    }
}

impl DummyReporterClient {
    pub fn log_stream_ids(&self) -> Vec<LogStreamId> {
        let state = self.state.lock().expect("Poisoned");
        state.streams.iter().map(|stream| stream.log_stream_id).collect()
    }

    pub fn increase_uncommitted(&self, idx: usize) {
        let mut state = self.state.lock().expect("Poisoned");
        state.streams[idx].uncommitted_llsn_length += 1;
    }

    pub fn num_uncommitted(&self, idx: usize) -> u64 {
        let state = self.state.lock().expect("Poisoned");
        state.streams[idx].uncommitted_llsn_length
    }

    pub fn known_high_watermark(&self) -> Glsn {
        let state = self.state.lock().expect("Poisoned");
        state.known_high_watermark
    }

    pub fn disable_report(&self) {
        self.state.lock().expect("Poisoned").report_enabled = false;
    }

    pub fn enable_report(&self) {
        self.state.lock().expect("Poisoned").report_enabled = true;
    }

    pub fn set_commit_delay(&self, delay: Duration) {
        self.state.lock().expect("Poisoned").commit_delay = Some(delay);
    }
}

#[async_trait]
impl ReporterClient for DummyReporterClient {
    async fn get_report(&self) -> Result<StorageNodeUncommitReport> {
        let mut state = self.state.lock().expect("Poisoned");
        match state.status {
            DummyStatus::Crashed => return Err(Error::Internal("crash".to_owned())),
            DummyStatus::Closed => return Err(Error::Closed),
            DummyStatus::Running => {}
        }
        if !state.report_enabled {
            return Err(Error::Internal("report disabled".to_owned()));
        }

        if !self.manual {
            for stream in &mut state.streams {
                stream.uncommitted_llsn_length += 1;
            }
        }
        let known = state.known_high_watermark;
        Ok(StorageNodeUncommitReport {
            storage_node_id: self.storage_node_id,
            uncommit_reports: state
                .streams
                .iter()
                .map(|stream| strom_api::v1::LogStreamUncommitReport {
                    log_stream_id: stream.log_stream_id,
                    uncommitted_llsn_offset: stream.uncommitted_llsn_offset,
                    uncommitted_llsn_length: stream.uncommitted_llsn_length,
                    high_watermark: known,
                })
                .collect(),
        })
    }

    async fn commit(&self, commit_results: LogStreamCommitResults) -> Result<()> {
        let delay = {
            let state = self.state.lock().expect("Poisoned");
            match state.status {
                DummyStatus::Crashed => return Err(Error::Internal("crash".to_owned())),
                DummyStatus::Closed => return Err(Error::Closed),
                DummyStatus::Running => {}
            }
            state.commit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().expect("Poisoned");
        if state.known_high_watermark != 0
            && commit_results.prev_high_watermark != state.known_high_watermark
        {
            // Stale or gapped round, ignore like a real replica.
            return Ok(());
        }

        state.known_high_watermark = commit_results.high_watermark;
        for cr in &commit_results.commit_results {
            if let Some(stream) =
                state.streams.iter_mut().find(|s| s.log_stream_id == cr.log_stream_id)
            {
                stream.uncommitted_llsn_offset += cr.committed_glsn_length;
                stream.uncommitted_llsn_length =
                    stream.uncommitted_llsn_length.saturating_sub(cr.committed_glsn_length);
            }
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("Poisoned");
        if state.status != DummyStatus::Crashed {
            state.status = DummyStatus::Closed;
        }
    }
}
