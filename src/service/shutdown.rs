// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::broadcast;

/// Listens for the broker-wide shutdown broadcast.
///
/// A dropped sender counts as a shutdown signal too, so connection tasks never
/// outlive the broker that spawned them.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn subscribe(sender: &broadcast::Sender<()>) -> Shutdown {
        Shutdown::new(sender.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Waits for the signal; returns immediately once it has been seen.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_is_sticky() {
        let (sender, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::subscribe(&sender);
        assert!(!shutdown.is_shutdown());
        sender.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (sender, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::subscribe(&sender);
        drop(sender);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
