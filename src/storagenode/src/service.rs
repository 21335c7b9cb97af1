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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use strom_api::v1::log_stream_reporter_server::{LogStreamReporter, LogStreamReporterServer};
use strom_api::v1::management_server::{Management, ManagementServer};
use strom_api::v1::replicator_server::{Replicator, ReplicatorServer};
use strom_api::v1::*;
use strom_runtime::Shutdown;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::{async_trait, StorageNode};

/// gRPC front of one storage node.
#[derive(Clone)]
pub struct Server {
    node: Arc<StorageNode>,
}

impl Server {
    pub fn new(node: Arc<StorageNode>) -> Self {
        Server { node }
    }

    /// Serve the report, replication and management services until the
    /// shutdown token fires.
    pub async fn serve(self, addr: SocketAddr, mut shutdown: Shutdown) -> crate::Result<()> {
        tonic::transport::Server::builder()
            .add_service(LogStreamReporterServer::new(self.clone()))
            .add_service(ReplicatorServer::new(self.clone()))
            .add_service(ManagementServer::new(self))
            .serve_with_shutdown(addr, async move { shutdown.wait().await })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogStreamReporter for Server {
    type GetReportStream = ReceiverStream<Result<GetReportResponse, Status>>;

    async fn get_report(
        &self,
        request: Request<Streaming<GetReportRequest>>,
    ) -> Result<Response<Self::GetReportStream>, Status> {
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let node = Arc::clone(&self.node);
        self.node.task_group().add_task(strom_runtime::spawn(async move {
            while let Ok(Some(_)) = requests.message().await {
                let report = node.get_report();
                if tx.send(Ok(GetReportResponse { report: Some(report) })).await.is_err() {
                    break;
                }
            }
        }));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn commit(
        &self,
        request: Request<Streaming<CommitRequest>>,
    ) -> Result<Response<CommitResponse>, Status> {
        let mut requests = request.into_inner();
        while let Some(req) = requests.message().await? {
            if let Some(commit_results) = req.commit_results {
                self.node.commit(commit_results).await.map_err(Status::from)?;
            }
        }
        Ok(Response::new(CommitResponse {}))
    }
}

#[async_trait]
impl Replicator for Server {
    type ReplicateStream = ReceiverStream<Result<ReplicationResponse, Status>>;

    async fn replicate(
        &self,
        request: Request<Streaming<ReplicationRequest>>,
    ) -> Result<Response<Self::ReplicateStream>, Status> {
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(128);
        let node = Arc::clone(&self.node);
        self.node.task_group().add_task(strom_runtime::spawn(async move {
            loop {
                let req = match requests.message().await {
                    Ok(Some(req)) => req,
                    Ok(None) | Err(_) => break,
                };
                let llsn = req.llsn;
                let result = node
                    .replicate(req.log_stream_id, llsn, Bytes::from(req.payload))
                    .await;
                let response = match result {
                    Ok(()) => Ok(ReplicationResponse { llsn }),
                    Err(err) => Err(Status::from(err)),
                };
                let failed = response.is_err();
                if tx.send(response).await.is_err() || failed {
                    break;
                }
            }
        }));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn sync_replicate(
        &self,
        request: Request<SyncReplicateRequest>,
    ) -> Result<Response<SyncReplicateResponse>, Status> {
        let req = request.into_inner();
        let first = req.first.unwrap_or_default();
        let last = req.last.unwrap_or_default();
        let entry = req
            .payload
            .ok_or_else(|| Status::invalid_argument("SyncReplicateRequest::payload is empty"))?;
        let executor = self.node.get_executor(req.log_stream_id).map_err(Status::from)?;
        executor.sync_replicate(first, last, entry).await.map_err(Status::from)?;
        Ok(Response::new(SyncReplicateResponse {}))
    }
}

#[async_trait]
impl Management for Server {
    async fn get_metadata(
        &self,
        _request: Request<GetMetadataRequest>,
    ) -> Result<Response<GetMetadataResponse>, Status> {
        Ok(Response::new(GetMetadataResponse { metadata: Some(self.node.get_metadata()) }))
    }

    async fn seal(&self, request: Request<SealRequest>) -> Result<Response<SealResponse>, Status> {
        let req = request.into_inner();
        let (status, sealed_glsn) =
            self.node.seal(req.log_stream_id, req.last_committed_glsn).map_err(Status::from)?;
        Ok(Response::new(SealResponse { status: status as i32, sealed_glsn }))
    }

    async fn unseal(
        &self,
        request: Request<UnsealRequest>,
    ) -> Result<Response<UnsealResponse>, Status> {
        let req = request.into_inner();
        self.node.unseal(req.log_stream_id).map_err(Status::from)?;
        Ok(Response::new(UnsealResponse {}))
    }

    async fn get_prev_commit_info(
        &self,
        request: Request<GetPrevCommitInfoRequest>,
    ) -> Result<Response<GetPrevCommitInfoResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(self.node.get_prev_commit_info(req.high_watermark)))
    }
}
