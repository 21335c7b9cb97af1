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

mod helper;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strom_api::v1::log_stream_reporter_client::LogStreamReporterClient;
use strom_api::v1::management_client::ManagementClient;
use strom_api::v1::{
    CommitRequest, GetReportRequest, LogStreamCommitResult, LogStreamCommitResults,
    LogStreamStatus,
};
use strom_storagenode::storage::MemoryStorage;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::helper::*;

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn commit_round(hwm: u64, prev: u64, offset: u64, llsn_offset: u64, len: u64) -> CommitRequest {
    CommitRequest {
        commit_results: Some(LogStreamCommitResults {
            high_watermark: hwm,
            prev_high_watermark: prev,
            commit_results: vec![LogStreamCommitResult {
                log_stream_id: LOG_STREAM_ID,
                committed_glsn_offset: offset,
                committed_glsn_length: len,
                committed_llsn_offset: llsn_offset,
            }],
        }),
    }
}

#[tokio::test]
async fn report_and_commit_streams_drive_the_replica() {
    let storage = Arc::new(MemoryStorage::new());
    let (node, addr, _server) = spawn_node(1, storage).await;

    let mut reporter =
        LogStreamReporterClient::connect(format!("http://{addr}")).await.unwrap();

    // Open the report stream and pull one report: the replica is empty.
    let (report_tx, report_rx) = mpsc::channel(4);
    let mut reports = reporter
        .get_report(ReceiverStream::new(report_rx))
        .await
        .unwrap()
        .into_inner();
    report_tx.send(GetReportRequest {}).await.unwrap();
    let report = reports.message().await.unwrap().unwrap().report.unwrap();
    assert_eq!(report.storage_node_id, 1);
    assert_eq!(report.uncommit_reports[0].uncommitted_llsn_length, 0);

    // A blocked append surfaces in the next report.
    let executor = node.get_executor(LOG_STREAM_ID).unwrap();
    let append = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.append(Bytes::from_static(b"log-001"), vec![]).await })
    };
    wait_until(Duration::from_secs(5), || {
        node.get_report().uncommit_reports[0].uncommitted_llsn_length == 1
    })
    .await;

    // Push the commit decision through the commit stream.
    let (commit_tx, commit_rx) = mpsc::channel(4);
    let commit_call = {
        let mut reporter = reporter.clone();
        tokio::spawn(async move { reporter.commit(ReceiverStream::new(commit_rx)).await })
    };
    commit_tx.send(commit_round(1, 0, 1, 1, 1)).await.unwrap();

    let glsn = append.await.unwrap().unwrap();
    assert_eq!(glsn, 1);

    // The stream closes cleanly once the sender goes away.
    drop(commit_tx);
    commit_call.await.unwrap().unwrap();

    // The next report carries the advanced watermark.
    report_tx.send(GetReportRequest {}).await.unwrap();
    let report = reports.message().await.unwrap().unwrap().report.unwrap();
    assert_eq!(report.uncommit_reports[0].high_watermark, 1);
    assert_eq!(report.uncommit_reports[0].uncommitted_llsn_length, 0);

    // Management surface: seal and unseal round trip.
    let mut management = ManagementClient::connect(format!("http://{addr}")).await.unwrap();
    let sealed = management
        .seal(strom_api::v1::SealRequest {
            topic_id: TOPIC_ID,
            log_stream_id: LOG_STREAM_ID,
            last_committed_glsn: 1,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(sealed.status(), LogStreamStatus::Sealed);
    assert_eq!(sealed.sealed_glsn, 1);

    management
        .unseal(strom_api::v1::UnsealRequest { topic_id: TOPIC_ID, log_stream_id: LOG_STREAM_ID })
        .await
        .unwrap();
    assert_eq!(executor.status(), LogStreamStatus::Running);
}
