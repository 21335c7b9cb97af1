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

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use strom_api::v1::log_stream_reporter_server::LogStreamReporterServer;
use strom_api::v1::management_server::ManagementServer;
use strom_api::v1::replicator_server::ReplicatorServer;
use strom_api::{Glsn, LogStreamId, StorageNodeId, TopicId};
use strom_storagenode::executor::{CommittedStatus, LogStreamExecutor};
use strom_storagenode::replication::Replica;
use strom_storagenode::storage::Storage;
use strom_storagenode::{NodeConfig, Server, StorageNode};
use tokio_stream::wrappers::TcpListenerStream;

pub const TOPIC_ID: TopicId = 1;
pub const LOG_STREAM_ID: LogStreamId = 1;
pub const BACKUP_SNID: StorageNodeId = 2;

pub fn node_config(storage_node_id: StorageNodeId, volume: &std::path::Path) -> NodeConfig {
    NodeConfig {
        cluster_id: 1,
        storage_node_id,
        address: String::new(),
        volume: volume.to_path_buf(),
        executor: Default::default(),
    }
}

/// Spawn a storage node hosting one log stream replica and serve it on an
/// ephemeral port.
pub async fn spawn_node(
    storage_node_id: StorageNodeId,
    storage: Arc<dyn Storage>,
) -> (Arc<StorageNode>, SocketAddr, tokio::task::JoinHandle<()>) {
    let volume = tempfile::tempdir().unwrap();
    let node = StorageNode::new(node_config(storage_node_id, volume.path())).unwrap();
    node.add_log_stream_with_storage(TOPIC_ID, LOG_STREAM_ID, storage).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(Arc::clone(&node));
    let handle = tokio::spawn(async move {
        let _volume = volume;
        tonic::transport::Server::builder()
            .add_service(LogStreamReporterServer::new(server.clone()))
            .add_service(ReplicatorServer::new(server.clone()))
            .add_service(ManagementServer::new(server))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .ok();
    });
    (node, addr, handle)
}

pub async fn spawn_backup(
    storage: Arc<dyn Storage>,
) -> (Arc<StorageNode>, SocketAddr, tokio::task::JoinHandle<()>) {
    spawn_node(BACKUP_SNID, storage).await
}

/// Push the decision once the entry is written, mimicking the report ->
/// commit round trip of the metadata repository.
pub async fn drive_commit(lse: &LogStreamExecutor, hwm: Glsn, prev: Glsn, offset: Glsn, len: u64) {
    loop {
        let report = lse.get_report();
        if report.high_watermark >= hwm {
            return;
        }
        if report.uncommitted_llsn_length >= len {
            lse.commit(CommittedStatus {
                log_stream_id: lse.log_stream_id(),
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

pub async fn append_committed(
    lse: &LogStreamExecutor,
    replicas: Vec<Replica>,
    data: &str,
    glsn: Glsn,
) -> Glsn {
    let (appended, _) = tokio::join!(
        lse.append(Bytes::from(data.to_owned()), replicas),
        drive_commit(lse, glsn, glsn - 1, glsn, 1)
    );
    appended.unwrap()
}

pub async fn wait_until(budget: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > budget {
            panic!("condition not reached within {budget:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
