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

//! Seam to the consensus primitive.
//!
//! The metadata repository talks to its Raft-like log through channels:
//! serialized entries go out on the propose channel, totally ordered
//! committed entries come back on the commit channel, and a role watch gates
//! leader-only work. [`LocalRaft`] is the in-process single-voter
//! implementation used by tests and single-node deployments.

use strom_api::NodeId;
use strom_runtime::{JoinHandle, Shutdown, ShutdownNotifier};
use tokio::sync::{mpsc, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
}

/// A membership change ordered through the consensus log.
#[derive(Clone, Debug)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub node_id: NodeId,
    /// The peer url for `AddNode`.
    pub context: String,
}

/// One entry delivered by the consensus log. Entries arrive in index order
/// and must be applied strictly sequentially.
#[derive(Clone, Debug)]
pub enum CommittedEntry {
    Entry { index: u64, data: Vec<u8> },
    ConfChange { index: u64, change: ConfChange },
}

/// The channel surface handed to the metadata repository.
pub struct RaftHandle {
    pub propose_tx: mpsc::Sender<Vec<u8>>,
    pub conf_change_tx: mpsc::Sender<ConfChange>,
    pub commit_rx: mpsc::Receiver<CommittedEntry>,
    pub role_rx: watch::Receiver<RaftRole>,
}

/// In-process single-voter consensus: one task assigns indexes to proposals
/// and commits them immediately. It reports itself leader.
pub struct LocalRaft {
    role_tx: watch::Sender<RaftRole>,
    shutdown: ShutdownNotifier,
    _task: JoinHandle<()>,
}

impl LocalRaft {
    pub fn start(queue_size: usize) -> (RaftHandle, LocalRaft) {
        let (propose_tx, propose_rx) = mpsc::channel(queue_size);
        let (conf_change_tx, conf_change_rx) = mpsc::channel(16);
        let (commit_tx, commit_rx) = mpsc::channel(queue_size);
        let (role_tx, role_rx) = watch::channel(RaftRole::Leader);

        let shutdown = ShutdownNotifier::new();
        let task = strom_runtime::spawn(Self::order_loop(
            propose_rx,
            conf_change_rx,
            commit_tx,
            shutdown.subscribe(),
        ));

        let handle = RaftHandle { propose_tx, conf_change_tx, commit_rx, role_rx };
        (handle, LocalRaft { role_tx, shutdown, _task: task })
    }

    /// Flip the reported role, e.g. to silence the commit ticker in tests.
    pub fn set_role(&self, role: RaftRole) {
        let _ = self.role_tx.send(role);
    }

    pub fn stop(&self) {
        self.shutdown.notify();
    }

    async fn order_loop(
        mut propose_rx: mpsc::Receiver<Vec<u8>>,
        mut conf_change_rx: mpsc::Receiver<ConfChange>,
        commit_tx: mpsc::Sender<CommittedEntry>,
        mut shutdown: Shutdown,
    ) {
        let mut index = 0u64;
        loop {
            let entry = tokio::select! {
                _ = shutdown.wait() => break,
                data = propose_rx.recv() => match data {
                    Some(data) => {
                        index += 1;
                        CommittedEntry::Entry { index, data }
                    }
                    None => break,
                },
                change = conf_change_rx.recv() => match change {
                    Some(change) => {
                        index += 1;
                        CommittedEntry::ConfChange { index, change }
                    }
                    None => break,
                },
            };
            if commit_tx.send(entry).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn proposals_commit_in_order() {
        let (mut handle, raft) = LocalRaft::start(16);
        for i in 0..10u8 {
            handle.propose_tx.send(vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            match handle.commit_rx.recv().await.unwrap() {
                CommittedEntry::Entry { index, data } => {
                    assert_eq!(index, u64::from(i) + 1);
                    assert_eq!(data, vec![i]);
                }
                CommittedEntry::ConfChange { .. } => panic!("unexpected conf change"),
            }
        }
        raft.stop();
    }
}
