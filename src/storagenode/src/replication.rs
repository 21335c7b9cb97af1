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

//! Primary to backup replication.
//!
//! The primary holds one streaming client per backup. Requests are pushed in
//! LLSN order and the backup acks each entry by echoing its LLSN; acks are
//! matched against a FIFO of pending callbacks, so any mismatch means the
//! replicas have diverged and is unrecoverable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use strom_api::v1::replicator_client::ReplicatorClient as GrpcClient;
use strom_api::v1::{LogEntry, ReplicationRequest, SyncPosition, SyncReplicateRequest};
use strom_api::{Llsn, LogStreamId, StorageNodeId, TopicId};
use strom_runtime::TaskGroup;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{async_trait, Error, Result};

const REQUEST_QUEUE_SIZE: usize = 512;

/// One backup replica of a log stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    pub storage_node_id: StorageNodeId,
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    pub address: String,
}

pub type ReplicateCallback = Box<dyn FnOnce(Result<()>) + Send>;

#[async_trait]
pub trait ReplicatorClient: Send + Sync {
    fn peer(&self) -> &Replica;

    /// Enqueue one entry for replication. `cb` fires with the backup's ack
    /// or with the transport error that tore the stream down.
    async fn replicate(&self, llsn: Llsn, data: Bytes, cb: ReplicateCallback);

    async fn sync_replicate(
        &self,
        first: SyncPosition,
        last: SyncPosition,
        entry: LogEntry,
    ) -> Result<()>;

    fn close(&self);
}

#[async_trait]
pub trait ReplicatorClientFactory: Send + Sync {
    async fn connect(&self, replica: &Replica) -> Result<Arc<dyn ReplicatorClient>>;
}

/// Fans one entry out to every backup of a log stream, reusing one client
/// per storage node. A failed client is dropped so the next append dials a
/// fresh connection; stale handles keep returning errors but never panic.
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

struct ReplicatorInner {
    factory: Box<dyn ReplicatorClientFactory>,
    clients: Mutex<HashMap<StorageNodeId, Arc<dyn ReplicatorClient>>>,
}

impl Replicator {
    pub fn new(factory: Box<dyn ReplicatorClientFactory>) -> Self {
        Replicator {
            inner: Arc::new(ReplicatorInner { factory, clients: Mutex::new(HashMap::new()) }),
        }
    }

    /// Replicate `data` at `llsn` to all `replicas`. `on_error` fires at most
    /// once per failed backup; success is observed through the commit path.
    pub async fn replicate(
        &self,
        llsn: Llsn,
        data: Bytes,
        replicas: &[Replica],
        on_error: Arc<dyn Fn(Error) + Send + Sync>,
    ) {
        for replica in replicas {
            let client = match self.inner.get_client(replica).await {
                Ok(client) => client,
                Err(err) => {
                    on_error(err);
                    continue;
                }
            };

            let inner = Arc::clone(&self.inner);
            let snid = replica.storage_node_id;
            let on_error = Arc::clone(&on_error);
            let cb: ReplicateCallback = Box::new(move |result| {
                if let Err(err) = result {
                    inner.invalidate(snid);
                    on_error(err);
                }
            });
            client.replicate(llsn, data.clone(), cb).await;
        }
    }

    pub async fn get_client(&self, replica: &Replica) -> Result<Arc<dyn ReplicatorClient>> {
        self.inner.get_client(replica).await
    }

    pub fn close(&self) {
        let mut clients = self.inner.clients.lock().expect("Poisoned");
        for (_, client) in clients.drain() {
            client.close();
        }
    }
}

impl ReplicatorInner {
    async fn get_client(&self, replica: &Replica) -> Result<Arc<dyn ReplicatorClient>> {
        if let Some(client) =
            self.clients.lock().expect("Poisoned").get(&replica.storage_node_id)
        {
            return Ok(Arc::clone(client));
        }

        let client = self.factory.connect(replica).await?;
        let mut clients = self.clients.lock().expect("Poisoned");
        // Another caller may have connected while we did; keep the first one.
        let entry = clients
            .entry(replica.storage_node_id)
            .or_insert_with(|| Arc::clone(&client));
        if !Arc::ptr_eq(entry, &client) {
            client.close();
        }
        Ok(Arc::clone(entry))
    }

    fn invalidate(&self, snid: StorageNodeId) {
        self.clients.lock().expect("Poisoned").remove(&snid);
    }
}

/// Streaming gRPC replication client.
pub struct GrpcReplicatorClient {
    replica: Replica,
    raw: GrpcClient<tonic::transport::Channel>,
    request_tx: mpsc::Sender<ReplicationRequest>,
    callbacks: Arc<Mutex<VecDeque<(Llsn, ReplicateCallback)>>>,
    closed: Arc<AtomicBool>,
    replicate_timeout: Duration,
    task_group: TaskGroup,
}

pub struct GrpcReplicatorConnector {
    pub replicate_timeout: Duration,
}

#[async_trait]
impl ReplicatorClientFactory for GrpcReplicatorConnector {
    async fn connect(&self, replica: &Replica) -> Result<Arc<dyn ReplicatorClient>> {
        let client = GrpcReplicatorClient::connect(replica.clone(), self.replicate_timeout).await?;
        Ok(Arc::new(client))
    }
}

impl GrpcReplicatorClient {
    pub async fn connect(replica: Replica, replicate_timeout: Duration) -> Result<Self> {
        let addr = format!("http://{}", replica.address);
        let mut raw = GrpcClient::connect(addr).await?;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let response = raw.replicate(ReceiverStream::new(request_rx)).await.map_err(Error::Rpc)?;
        let mut stream = response.into_inner();

        let callbacks: Arc<Mutex<VecDeque<(Llsn, ReplicateCallback)>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let task_group = TaskGroup::default();
        {
            let callbacks = Arc::clone(&callbacks);
            let closed = Arc::clone(&closed);
            let peer = replica.clone();
            task_group.add_task(strom_runtime::spawn(async move {
                let reason = loop {
                    match stream.message().await {
                        Ok(Some(rsp)) => {
                            let pending = callbacks.lock().expect("Poisoned").pop_front();
                            match pending {
                                Some((llsn, cb)) if llsn == rsp.llsn => cb(Ok(())),
                                Some((llsn, _)) => {
                                    panic!("llsn mismatch: {} != {}", llsn, rsp.llsn)
                                }
                                None => panic!("replication ack without pending request"),
                            }
                        }
                        Ok(None) => break Error::Closed,
                        Err(status) => break Error::from(status),
                    }
                };
                closed.store(true, Ordering::Release);
                info!(
                    "replication stream to storage node {} closed: {}",
                    peer.storage_node_id, reason
                );
                // Stream teardown flushes every pending callback.
                let mut pending = callbacks.lock().expect("Poisoned");
                while let Some((_, cb)) = pending.pop_front() {
                    cb(Err(Error::Closed));
                }
            }));
        }

        Ok(GrpcReplicatorClient {
            replica,
            raw,
            request_tx,
            callbacks,
            closed,
            replicate_timeout,
            task_group,
        })
    }
}

#[async_trait]
impl ReplicatorClient for GrpcReplicatorClient {
    fn peer(&self) -> &Replica {
        &self.replica
    }

    async fn replicate(&self, llsn: Llsn, data: Bytes, cb: ReplicateCallback) {
        if self.closed.load(Ordering::Acquire) {
            cb(Err(Error::Closed));
            return;
        }

        self.callbacks.lock().expect("Poisoned").push_back((llsn, cb));

        let request = ReplicationRequest {
            topic_id: self.replica.topic_id,
            log_stream_id: self.replica.log_stream_id,
            llsn,
            payload: data.to_vec(),
        };
        let pushed =
            tokio::time::timeout(self.replicate_timeout, self.request_tx.send(request)).await;
        let err = match pushed {
            Ok(Ok(())) => return,
            Ok(Err(_)) => Error::Closed,
            Err(_) => Error::DeadlineExceeded("replicate enqueue".to_owned()),
        };

        // The request never entered the stream; unwind the callback we just
        // queued. Only the writer worker pushes, so it is the back entry.
        let pending = self.callbacks.lock().expect("Poisoned").pop_back();
        if let Some((_, cb)) = pending {
            cb(Err(err));
        } else {
            warn!("replication callback for llsn {llsn} already flushed");
        }
    }

    async fn sync_replicate(
        &self,
        first: SyncPosition,
        last: SyncPosition,
        entry: LogEntry,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut raw = self.raw.clone();
        let request = SyncReplicateRequest {
            log_stream_id: self.replica.log_stream_id,
            first: Some(first),
            last: Some(last),
            payload: Some(entry),
        };
        raw.sync_replicate(request).await.map_err(Error::from)?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task_group.abort_all();
        let mut pending = self.callbacks.lock().expect("Poisoned");
        while let Some((_, cb)) = pending.pop_front() {
            cb(Err(Error::Closed));
        }
    }
}
