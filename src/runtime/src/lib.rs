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

mod executor;
mod group;
mod shutdown;

use serde::{Deserialize, Serialize};
pub use tokio::select;
pub use tokio::task::yield_now;

pub use self::executor::*;
pub use self::group::TaskGroup;
pub use self::shutdown::{Shutdown, ShutdownNotifier};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub event_interval: Option<u32>,
    pub global_event_interval: Option<u32>,
    pub max_blocking_threads: Option<usize>,
}
