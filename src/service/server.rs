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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::engine::{Connection, ConnectionEvent, Container};
use crate::network::{write_loop, ChannelTransport, SocketReader};
use crate::protocol::{condition, AmqpError, PROTOCOL_HEADER_SIZE};
use crate::AppError;
use crate::AppResult;

use super::{AmqpConfig, Shutdown};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const TICK_FALLBACK: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(10);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<Mutex<Connection<ChannelTransport>>>;

// handler for each connection
struct ConnectionHandler {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    connection_id: u64,
    client_ip: String,
    reader: SocketReader<OwnedReadHalf>,
    connection: SharedConnection,
}

impl ConnectionHandler {
    /// Pull loop: asks the engine how many bytes complete the current stage,
    /// reads exactly that many and feeds them in. Runs the idle ticker
    /// alongside and gives up on shutdown, on a writer failure or once the
    /// engine closed its read side.
    async fn handle_connection(
        &mut self,
        mut write_failed: oneshot::Receiver<AppError>,
    ) -> AppResult<()> {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let read_closed = self.connection.lock().transport().read_closed_notify();
        let mut writer_running = true;
        let mut next_tick = Instant::now() + TICK_FALLBACK;

        loop {
            let (expected, period) = {
                let connection = self.connection.lock();
                if connection.is_closed() || connection.transport().is_read_closed() {
                    break;
                }
                (connection.bytes_expected(), tick_period(&connection))
            };
            if expected == 0 {
                break;
            }

            tokio::select! {
                read = self.reader.read_exact(expected) => match read {
                    Ok(Some(data)) => {
                        self.connection.lock().receive(&data, Instant::now());
                    }
                    Ok(None) => {
                        debug!("connection {} closed by {}", self.connection_id, self.client_ip);
                        self.connection.lock().on_transport_closed();
                    }
                    Err(err) => {
                        self.connection.lock().on_transport_error(err);
                    }
                },
                _ = time::sleep_until(next_tick.into()) => {
                    let now = Instant::now();
                    self.connection.lock().tick(now);
                    next_tick = now + period;
                }
                failure = &mut write_failed, if writer_running => {
                    writer_running = false;
                    if let Ok(err) = failure {
                        self.connection.lock().on_transport_error(err);
                    }
                }
                _ = read_closed.notified() => {
                    trace!("read side of connection {} closed", self.connection_id);
                }
                _ = shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    self.connection.lock().close(Some(AmqpError::new(
                        condition::CONNECTION_FORCED,
                        "broker is shutting down",
                    )));
                    break;
                }
            }
            self.log_events();
        }

        self.connection.lock().on_transport_closed();
        self.log_events();
        debug!("connection handler exit read loop");
        Ok(())
    }

    fn log_events(&self) {
        let mut connection = self.connection.lock();
        while let Some(event) = connection.poll_event() {
            match event {
                ConnectionEvent::Opened {
                    remote_container_id,
                } => info!(
                    "connection {} from {} opened by container {}",
                    self.connection_id, self.client_ip, remote_container_id
                ),
                ConnectionEvent::Closed { error: Some(error) } => warn!(
                    "connection {} closed with error: {}",
                    self.connection_id, error
                ),
                event => debug!("connection {}: {:?}", self.connection_id, event),
            }
        }
    }
}

fn tick_period(connection: &Connection<ChannelTransport>) -> Duration {
    connection
        .tick_interval()
        .map_or(TICK_FALLBACK, |interval| (interval / 2).max(MIN_TICK))
}

/// Accepts AMQP connections and runs one engine per socket.
pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    config: AmqpConfig,
    container: Arc<dyn Container>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        config: AmqpConfig,
        container: Arc<dyn Container>,
    ) -> Self {
        Server {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            config,
            container,
        }
    }

    /// Accepts connections until accepting fails for good.
    ///
    /// Each connection is bounded by a semaphore permit and served by two
    /// tasks: the handler running the read loop and the idle ticker, and a
    /// writer draining the engine's transport into the socket.
    ///
    // Graceful shutdown sequence:
    // 1. The run loop is cancelled by the broker on ctrl-c.
    // 2. Each connection handler receives the broadcast, sends Close with
    //    amqp:connection:forced and closes its transport.
    // 3. The writer task flushes the Close and shuts the socket down.
    // 4. Dropping the handler drops its `shutdown_complete_tx`; the broker exits
    //    once all of them are gone.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limiter closed: {}", e)))?;

            debug!("accept new connection");

            let socket = self.accept().await?;
            let client_ip = socket
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            if let Err(err) = socket.set_nodelay(true) {
                warn!("set TCP_NODELAY failed for {}: {}", client_ip, err);
            }

            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            let (reader, writer) = socket.into_split();
            let (transport, commands) = ChannelTransport::new();
            let connection = Arc::new(Mutex::new(Connection::new(
                self.config.clone(),
                transport,
                self.container.clone(),
            )));

            let (write_failed_tx, write_failed_rx) = oneshot::channel();
            let writer_task = tokio::spawn(async move {
                let mut writer = BufWriter::new(writer);
                if let Err(err) = write_loop(&mut writer, commands).await {
                    error!("writer for connection {} failed: {}", connection_id, err);
                    let _ = write_failed_tx.send(err);
                }
            });

            let mut handler = ConnectionHandler {
                notify_shutdown: self.notify_shutdown.clone(),
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
                connection_id,
                client_ip,
                reader: SocketReader::new(reader, PROTOCOL_HEADER_SIZE),
                connection,
            };

            tokio::spawn(async move {
                if let Err(err) = handler.handle_connection(write_failed_rx).await {
                    error!("Connection error: {:?}", err);
                }
                if time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
                    warn!("writer for connection {} did not drain in time", handler.connection_id);
                }
                // whether gracefully or unexpectedly closed, release connection
                drop(handler);
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("connection handler {} dropped", self.connection_id);
    }
}
