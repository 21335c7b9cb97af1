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

mod config;
mod error;
mod node;
mod service;

pub mod executor;
pub mod replication;
pub mod storage;
pub mod volume;

pub(crate) use tonic::async_trait;

pub use crate::config::*;
pub use crate::error::{Error, Result};
pub use crate::node::StorageNode;
pub use crate::service::Server;
