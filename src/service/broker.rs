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

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::{runtime, signal};
use tracing::{error, info, trace};

use crate::engine::{Container, MemoryContainer};
use crate::service::Server;
use crate::AppError::IllegalStateError;
use crate::AppResult;

use super::{AmqpConfig, BrokerConfig};

pub struct Broker {
    config: BrokerConfig,
    container: Arc<dyn Container>,
}

impl Broker {
    /// A broker backed by in-memory queues.
    pub fn new(config: BrokerConfig) -> Self {
        let container = Arc::new(MemoryContainer::new(
            config.container_id(),
            config.amqp.link_credit,
        ));
        Broker::with_container(config, container)
    }

    pub fn with_container(config: BrokerConfig, container: Arc<dyn Container>) -> Self {
        Broker { config, container }
    }

    /// Runs the broker on a fresh multi-thread runtime until ctrl-c.
    pub fn start(&mut self) -> AppResult<()> {
        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

        let network_conf = &self.config.network;
        let listen_address = format!("{}:{}", network_conf.ip, network_conf.port);
        let listener = match rt.block_on(TcpListener::bind(&listen_address)) {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                error!(error_msg);
                return Err(IllegalStateError(error_msg));
            }
        };
        info!("tcp server binding to {} for listening", &listen_address);

        rt.block_on(Self::serve(
            listener,
            self.config.amqp.clone(),
            network_conf.max_connection,
            self.container.clone(),
            async {
                if let Err(err) = signal::ctrl_c().await {
                    error!("listening for ctrl-c failed: {}", err);
                }
                info!("get shutdown signal");
            },
        ))?;
        info!("broker shutdown complete");
        Ok(())
    }

    /// Serves connections from `listener` until `shutdown` completes, then
    /// closes every connection and waits for their handlers to finish.
    pub async fn serve(
        listener: TcpListener,
        config: AmqpConfig,
        max_connection: usize,
        container: Arc<dyn Container>,
        shutdown: impl Future<Output = ()>,
    ) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let server = Server::new(
            listener,
            Arc::new(Semaphore::new(max_connection)),
            notify_shutdown.clone(),
            shutdown_complete_tx,
            config,
            container,
        );
        tokio::select! {
          res = server.run() => {
              if let Err(err) = res {
                  error!(cause = %err, "failed to accept");
              }
          }
          _ = shutdown => {}
        }

        // tcp server has been shutdown, send shutdown signal
        let _ = notify_shutdown.send(());
        drop(server);
        // wait for shutdown complete
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        Ok(())
    }
}
