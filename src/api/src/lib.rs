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

mod commit;
mod metadata;
mod report;

pub mod v1 {
    #![allow(clippy::all)]
    tonic::include_proto!("strom.v1");
}

/// Identifier aliases. All ids are unsigned 64-bit values and zero is
/// reserved as the invalid sentinel.
pub type ClusterId = u64;
pub type NodeId = u64;
pub type StorageNodeId = u64;
pub type LogStreamId = u64;
pub type TopicId = u64;

/// Local log sequence number, dense and monotonic per log stream.
pub type Llsn = u64;
/// Global log sequence number, dense and monotonic cluster-wide.
pub type Glsn = u64;
/// The most recent committed GLSN observed by consensus.
pub type Version = u64;

pub const INVALID_NODE_ID: NodeId = 0;

pub const INVALID_LLSN: Llsn = 0;
pub const MIN_LLSN: Llsn = 1;

pub const INVALID_GLSN: Glsn = 0;
pub const MIN_GLSN: Glsn = 1;
pub const MAX_GLSN: Glsn = u64::MAX;

#[inline]
pub fn is_invalid_glsn(glsn: Glsn) -> bool {
    glsn == INVALID_GLSN
}

#[inline]
pub fn is_invalid_llsn(llsn: Llsn) -> bool {
    llsn == INVALID_LLSN
}
