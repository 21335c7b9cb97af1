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

use tokio::sync::watch;

/// The owner side of a shutdown signal. Every long-running loop holds a
/// [`Shutdown`] subscribed from this notifier and terminates once it fires.
pub struct ShutdownNotifier {
    sender: watch::Sender<bool>,
}

/// The subscriber side of a shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        ShutdownNotifier { sender }
    }
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { receiver: self.sender.subscribe() }
    }

    /// Fire the signal. All subscribed [`Shutdown`] tokens are released.
    pub fn notify(&self) {
        let _ = self.sender.send(true);
    }
}

impl Shutdown {
    /// Wait until the shutdown signal fires. Returns immediately if it
    /// already has.
    pub async fn wait(&mut self) {
        if *self.receiver.borrow() {
            return;
        }
        // The sender half dropping is also a shutdown.
        while self.receiver.changed().await.is_ok() {
            if *self.receiver.borrow() {
                return;
            }
        }
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        *self.receiver.borrow()
    }
}
