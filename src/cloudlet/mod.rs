//! Cloudlets and their workload trackers.
//!
//! Every registered cloudlet owns one background task that holds a
//! long-lived telemetry stream open and copies each reported client count
//! into the node's workload counter.  The DNS handler only ever reads that
//! counter; it never waits on a stream.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::WorkloadStatusMessage;

pub mod http;
pub mod node;

pub use self::http::HttpTelemetry;
pub use self::node::CloudletNode;

/// Ordered, unbounded sequence of workload reports from one cloudlet.
/// Dropping the stream releases the underlying connection.
pub type WorkloadStream = BoxStream<'static, Result<WorkloadStatusMessage>>;

/// Where workload reports come from.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Open the workload stream of the cloudlet at `ip`.
    async fn subscribe(&self, ip: IpAddr) -> Result<WorkloadStream>;
}

/// Handle to a running workload tracker.
///
/// `cancel` asks the task to stop at its next suspension point and drop its
/// stream; `join` waits until it has.  Once `join` returns no further update
/// reaches the counter.
#[derive(Debug)]
pub struct WorkloadTracker {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkloadTracker {
    /// Spawn the tracker on the current tokio runtime.
    pub(crate) fn spawn(
        cloudlet: String,
        ip: IpAddr,
        source: Arc<dyn TelemetrySource>,
        workload: Arc<AtomicI32>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(track(cloudlet, ip, source, workload, cancel.clone()));
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the task has exited, whatever the reason.
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Wait for the task to exit.  Only the first caller waits; later calls
    /// return immediately.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Workload tracker task panicked: {}", e);
            }
        }
    }
}

impl Drop for WorkloadTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn track(
    cloudlet: String,
    ip: IpAddr,
    source: Arc<dyn TelemetrySource>,
    workload: Arc<AtomicI32>,
    cancel: CancellationToken,
) {
    let mut stream = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            info!("Workload monitoring of cloudlet {} cancelled before connecting", cloudlet);
            return;
        }

        result = source.subscribe(ip) => match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot query workload of cloudlet {} at {}: {}", cloudlet, ip, e);
                return;
            }
        },
    };
    info!("Monitoring workload of cloudlet {} at {}", cloudlet, ip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            next = stream.next() => match next {
                Some(Ok(status)) => {
                    workload.store(status.client_count, Ordering::Release);
                    debug!("Cloudlet {} workload is {}", cloudlet, status.client_count);
                }
                Some(Err(e)) => {
                    warn!("Workload stream of cloudlet {} broke: {}", cloudlet, e);
                    break;
                }
                None => {
                    info!("Cloudlet {} closed its workload stream", cloudlet);
                    break;
                }
            },
        }
    }

    drop(stream);
    info!("Workload monitoring of cloudlet {} stopped", cloudlet);
}
