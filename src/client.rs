//! Solo mining client orchestrator
//!
//! One event loop merges timer-driven template polling, push notifications,
//! and submissions into a single consistent current-job view. Template
//! supersession checks and listener notifications are serialized here, so
//! the listener never observes jobs out of (height, previous-hash) order
//! even though the two refresh triggers race.

use crate::config::Config;
use crate::notify::NotifyChannel;
use crate::rpc::RpcClient;
use crate::template::BlockTemplate;
use crate::types::{ConnectionState, JobListener, JobResult, SubmitOutcome};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::lookup_host;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer-driven polling cycle.
///
/// The first tick completes immediately so a fresh client fetches its
/// initial template without waiting a full interval; missed ticks are
/// skipped rather than bursted.
pub struct PollScheduler {
    interval: Interval,
}

impl PollScheduler {
    /// Create a scheduler firing every `period`
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    /// Wait for the next poll tick
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Commands sent through a [`SoloClientHandle`]
enum Command {
    Submit {
        result: JobResult,
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Handle for interacting with a running [`SoloClient`]
#[derive(Clone)]
pub struct SoloClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl SoloClientHandle {
    /// Submit a solved job.
    ///
    /// Fails with `NotConnected` when no active template exists. A job id
    /// that no longer matches the current template is logged and tagged
    /// stale but still transmitted: a late solution may still be the
    /// network-accepted block. Returns the request identifier echoed in
    /// `JobListener::on_submit_result`.
    pub async fn submit(&self, result: JobResult) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                result,
                reply: reply_tx,
            })
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Tear the client down.
    ///
    /// Safe to call from any state, including mid-handshake or mid-fetch;
    /// in-flight operations become no-ops. Idempotent.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// The solo mining client orchestrator
pub struct SoloClient {
    config: Config,
    rpc: RpcClient,
    listener: Arc<dyn JobListener>,
    state: ConnectionState,
    current: Option<Arc<BlockTemplate>>,
    next_request_id: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl SoloClient {
    /// Create a client and its handle from a validated configuration
    pub fn new(config: Config, listener: Arc<dyn JobListener>) -> Result<(Self, SoloClientHandle)> {
        config.validate()?;

        let rpc = RpcClient::new(
            config.node_url()?,
            config.http_timeout(),
            config.insecure,
            config.rpc_auth(),
        )?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = SoloClientHandle {
            commands: command_tx,
            cancel: cancel.clone(),
        };

        let client = Self {
            config,
            rpc,
            listener,
            state: ConnectionState::Unconnected,
            current: None,
            next_request_id: 1,
            commands,
            cancel,
        };

        Ok((client, handle))
    }

    /// Run until disconnected.
    ///
    /// Never returns an error for transient failures: resolution,
    /// connection, handshake and template problems all retry on the poll
    /// interval indefinitely.
    pub async fn run(mut self) -> Result<()> {
        let (host, port) = self.config.rpc_endpoint()?;
        info!("connecting to node {host}:{port}");
        self.set_state(ConnectionState::Connecting);

        if !self.wait_resolved(&host, port).await {
            self.set_state(ConnectionState::Unconnected);
            return Ok(());
        }

        let (notify_tx, mut notifications) = mpsc::unbounded_channel();
        let notify_task = self.spawn_notify_task(&host, notify_tx);

        let cancel = self.cancel.clone();
        let mut poll = PollScheduler::new(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => self.refresh_template("poll").await,
                Some(()) = notifications.recv() => {
                    debug!("push notification: new block may exist");
                    self.refresh_template("notify").await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Submit { result, reply }) => {
                        let _ = reply.send(self.start_submit(result));
                    }
                    None => {
                        debug!("all client handles dropped, shutting down");
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
        if let Some(task) = notify_task {
            let _ = task.await;
        }
        self.set_state(ConnectionState::Unconnected);
        info!("disconnected");
        Ok(())
    }

    /// Resolve the node host, retrying on the poll interval.
    ///
    /// Returns false when cancelled before resolution succeeded.
    async fn wait_resolved(&self, host: &str, port: u16) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                resolved = lookup_host((host.to_owned(), port)) => match resolved {
                    Ok(mut addrs) => match addrs.next() {
                        Some(addr) => {
                            debug!("resolved {host} to {addr}");
                            return true;
                        }
                        None => warn!("resolution of {host} returned no addresses"),
                    },
                    Err(e) => warn!(
                        "failed to resolve {host}: {e}; retrying in {:?}",
                        self.config.poll_interval()
                    ),
                },
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = sleep(self.config.poll_interval()) => {}
            }
        }
    }

    /// Start the push-notification task when a notify port is configured.
    ///
    /// The channel reconnects on its own schedule; its failures never
    /// interrupt RPC polling.
    fn spawn_notify_task(
        &self,
        host: &str,
        notify_tx: mpsc::UnboundedSender<()>,
    ) -> Option<JoinHandle<()>> {
        let port = self.config.notify_port?;
        let host = host.to_owned();
        let retry = self.config.poll_interval();
        let cancel = self.cancel.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    connected = NotifyChannel::connect(&host, port) => match connected {
                        Ok(mut channel) => {
                            info!("subscribed to block notifications on {host}:{port}");
                            match run_channel(&mut channel, &cancel, &notify_tx).await {
                                ChannelExit::Cancelled | ChannelExit::OrchestratorGone => {
                                    channel.close(true).await;
                                    return;
                                }
                                ChannelExit::Failed => channel.close(false).await,
                            }
                        }
                        Err(e) => warn!("notification channel unavailable: {e}"),
                    },
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(retry) => {}
                }
            }
        }))
    }

    /// Fetch a template and apply the supersession rule
    async fn refresh_template(&mut self, trigger: &'static str) {
        match self.rpc.get_block_template().await {
            Ok(result) => {
                self.set_state(ConnectionState::Connected);
                match BlockTemplate::from_rpc_result(&result) {
                    Ok(template) => self.apply_template(template, trigger),
                    // Transient malformed responses are not fatal: keep the
                    // current template and let the next trigger try again
                    Err(e) => warn!("ignoring template ({trigger}): {e}"),
                }
            }
            Err(e) => {
                warn!(
                    "template fetch failed ({trigger}): {e}; retrying in {:?}",
                    self.config.poll_interval()
                );
                self.set_state(ConnectionState::Connecting);
            }
        }
    }

    /// Replace the current template and notify the listener, unless the
    /// candidate is a duplicate
    fn apply_template(&mut self, template: BlockTemplate, trigger: &'static str) {
        if let Some(current) = &self.current {
            if current.is_outdated(template.height, &template.prev_hash) {
                debug!(
                    "duplicate template at height {} ({trigger})",
                    template.height
                );
                return;
            }
        }

        let template = Arc::new(template);
        info!("new {template} via {trigger}");
        self.current = Some(template.clone());
        self.listener.on_job(template);
    }

    /// Encode and transmit a solved job.
    ///
    /// The HTTP exchange runs in its own task so a slow node cannot stall
    /// template refresh; the verdict arrives through the listener under the
    /// request id returned here.
    fn start_submit(&mut self, result: JobResult) -> Result<u64> {
        let template = self.current.clone().ok_or(Error::NotConnected)?;

        let stale = result.job_id != template.job_id;
        if stale {
            warn!(
                "{}; submitting anyway",
                Error::stale_job(result.job_id.clone())
            );
        }

        let block_hex = template.encode_submission(&result.nonce)?;
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let rpc = self.rpc.clone();
        let listener = self.listener.clone();
        let cancel = self.cancel.clone();
        let work_id = template.work_id.clone();
        let height = template.height;
        tokio::spawn(async move {
            let outcome = match rpc.submit_block(&block_hex, work_id.as_deref()).await {
                Ok(()) => {
                    info!("block at height {height} accepted (request {request_id})");
                    SubmitOutcome::accepted(stale)
                }
                Err(e) => {
                    warn!("submission {request_id} failed: {e}");
                    SubmitOutcome::rejected(stale, e.to_string())
                }
            };
            if cancel.is_cancelled() {
                debug!("dropping submit result {request_id} after disconnect");
                return;
            }
            listener.on_submit_result(request_id, outcome);
        });

        Ok(request_id)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("connection state: {} -> {}", self.state, state);
            self.state = state;
            self.listener.on_connection_state(state);
        }
    }
}

enum ChannelExit {
    Cancelled,
    Failed,
    OrchestratorGone,
}

/// Forward notifications from an established channel until it fails or the
/// client shuts down
async fn run_channel<S>(
    channel: &mut NotifyChannel<S>,
    cancel: &CancellationToken,
    notify_tx: &mpsc::UnboundedSender<()>,
) -> ChannelExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ChannelExit::Cancelled,
            notification = channel.next_notification() => match notification {
                Ok(()) => {
                    if notify_tx.send(()).is_err() {
                        return ChannelExit::OrchestratorGone;
                    }
                }
                Err(e) => {
                    warn!("notification channel error: {e}");
                    return ChannelExit::Failed;
                }
            },
        }
    }
}
