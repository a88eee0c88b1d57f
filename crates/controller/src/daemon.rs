//! Controller daemon lifecycle.
//!
//! [`Controller`] owns the long-lived pieces: the device adapter, the
//! shared resource table, and the control channel. `start` brings them up
//! in order (devices, table, channel) and hands them to a worker thread
//! running the poll loop; `stop` tears them down in reverse. The adapter
//! survives a stop so the controller can be started again.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use resource_table::ResourceTable;
use resource_table::TableError;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::channel::ChannelMode;
use crate::channel::ControlChannel;
use crate::device::DeviceAdapter;
use crate::dispatch::Dispatcher;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("controller is already running")]
    AlreadyRunning,

    #[error("failed to spawn the poll worker: {0}")]
    Spawn(io::Error),

    #[error("no GPUs visible to the device adapter")]
    NoGpus,

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Clone)]
pub struct ControllerSettings {
    pub endpoint: String,
    pub app_name: String,
    pub mode: ChannelMode,
    pub table_name: String,
    pub poll_interval: Duration,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Option<Dispatcher>>,
}

pub struct Controller {
    settings: ControllerSettings,
    adapter: Option<Box<dyn DeviceAdapter>>,
    worker: Option<Worker>,
    local_endpoint: Option<SocketAddr>,
}

impl Controller {
    pub fn new(settings: ControllerSettings, adapter: Box<dyn DeviceAdapter>) -> Self {
        Self {
            settings,
            adapter: Some(adapter),
            worker: None,
            local_endpoint: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Endpoint the control channel actually bound, once running. Only
    /// listening modes report one.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint
    }

    /// Brings up the table and channel and spawns the poll loop worker.
    pub fn start(&mut self) -> Result<(), DaemonError> {
        if self.worker.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }
        let adapter = self.adapter.take().ok_or(DaemonError::AlreadyRunning)?;

        let (channel, dispatcher) = match self.bring_up(adapter) {
            Ok(parts) => parts,
            Err((adapter, err)) => {
                self.adapter = Some(adapter);
                return Err(err);
            }
        };
        self.local_endpoint = channel.local_endpoint();

        let stop = Arc::new(AtomicBool::new(false));
        let poll_interval = self.settings.poll_interval;

        // The worker takes ownership of the channel and dispatcher only
        // after the spawn succeeds; a failed spawn must leave them with us
        // so the bring-up can be unwound like any other start failure.
        let (handoff, resources) = mpsc::sync_channel(1);
        let spawned = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("controller-poll".to_string())
                .spawn(move || {
                    let Ok((channel, dispatcher)) = resources.recv() else {
                        return None;
                    };
                    Some(poll_loop(channel, dispatcher, poll_interval, || {
                        stop.load(Ordering::Relaxed)
                    }))
                })
        };
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                drop(channel);
                self.tear_down(dispatcher);
                return Err(DaemonError::Spawn(err));
            }
        };
        if handoff.send((channel, dispatcher)).is_err() {
            tracing::error!("poll worker exited before taking its resources");
        }

        self.worker = Some(Worker { stop, handle });
        tracing::info!(
            endpoint = %self.settings.endpoint,
            table = %self.settings.table_name,
            "controller started"
        );
        Ok(())
    }

    /// Runs the poll loop on the calling thread until `stop` reports true,
    /// then tears everything down. Used by deployments that do not want a
    /// worker thread.
    pub fn run_inline(&mut self, stop: impl Fn() -> bool) -> Result<(), DaemonError> {
        if self.worker.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }
        let adapter = self.adapter.take().ok_or(DaemonError::AlreadyRunning)?;

        let (channel, dispatcher) = match self.bring_up(adapter) {
            Ok(parts) => parts,
            Err((adapter, err)) => {
                self.adapter = Some(adapter);
                return Err(err);
            }
        };
        self.local_endpoint = channel.local_endpoint();

        let dispatcher = poll_loop(channel, dispatcher, self.settings.poll_interval, stop);
        self.tear_down(dispatcher);
        Ok(())
    }

    /// Stops the worker and tears the resources down in reverse order. A
    /// stop without a running worker is a no-op.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Relaxed);
        match worker.handle.join() {
            Ok(Some(dispatcher)) => self.tear_down(dispatcher),
            Ok(None) => tracing::error!("poll worker never received its resources"),
            Err(_) => tracing::error!("controller poll worker panicked"),
        }
    }

    fn bring_up(
        &self,
        adapter: Box<dyn DeviceAdapter>,
    ) -> Result<(Box<dyn ControlChannel>, Dispatcher), (Box<dyn DeviceAdapter>, DaemonError)> {
        let gpu_count = adapter.gpu_count();
        if gpu_count == 0 {
            return Err((adapter, DaemonError::NoGpus));
        }

        let table = match ResourceTable::create(&self.settings.table_name, gpu_count) {
            Ok(table) => table,
            Err(err) => return Err((adapter, err.into())),
        };
        tracing::info!(
            name = %self.settings.table_name,
            gpu_count,
            "created shared resource table"
        );

        let channel = match self
            .settings
            .mode
            .open(&self.settings.endpoint, &self.settings.app_name)
        {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(err) = table.destroy() {
                    tracing::warn!("failed to remove resource table: {err}");
                }
                return Err((adapter, err.into()));
            }
        };

        let format = self.settings.mode.wire_format();
        Ok((channel, Dispatcher::new(adapter, table, format)))
    }

    fn tear_down(&mut self, dispatcher: Dispatcher) {
        self.local_endpoint = None;
        let (adapter, table) = dispatcher.into_parts();
        if let Err(err) = table.destroy() {
            tracing::warn!("failed to remove resource table: {err}");
        }
        self.adapter = Some(adapter);
        tracing::info!("controller stopped");
    }

    /// Final teardown: stops the worker if needed and shuts the adapter
    /// down. The controller cannot be started afterwards.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(mut adapter) = self.adapter.take() {
            adapter.shutdown();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drains the control channel until asked to stop. Per-command failures
/// are logged and swallowed; only the stop signal ends the loop.
fn poll_loop(
    mut channel: Box<dyn ControlChannel>,
    mut dispatcher: Dispatcher,
    poll_interval: Duration,
    stop: impl Fn() -> bool,
) -> Dispatcher {
    while !stop() {
        match channel.recv_timeout(poll_interval) {
            Ok(Some(payload)) => {
                if let Err(err) = dispatcher.handle_payload(&payload) {
                    tracing::warn!("dropping control command: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("control channel receive failed: {err}");
            }
        }
    }
    tracing::debug!("poll loop exiting");
    dispatcher
}
