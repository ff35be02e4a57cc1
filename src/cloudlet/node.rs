use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use super::{TelemetrySource, WorkloadTracker};
use crate::error::{Error, Result};
use crate::types::Service;

/// An edge node able to serve one or more services.
///
/// The workload counter has a single steady writer, the node's tracker.
/// The DNS handler also bumps it after routing a client here so bursts
/// that arrive faster than telemetry spread out; whichever write lands
/// last wins.
#[derive(Debug)]
pub struct CloudletNode {
    name: String,
    ip: IpAddr,
    domain: String,
    services: RwLock<HashSet<Service>>,
    workload: Arc<AtomicI32>,
    tracker: WorkloadTracker,
}

impl CloudletNode {
    /// Validate the registration and start tracking the node's workload.
    ///
    /// Returns as soon as the tracker is spawned; it connects in the
    /// background.  Must be called from within a tokio runtime.
    pub fn new(
        name: &str,
        ip: &str,
        domain: &str,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument("cloudlet name is empty".into()));
        }
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid cloudlet address {:?}", ip)))?;

        info!(
            "Got register request from {}, IP {} and domain {}",
            name, ip, domain
        );

        let workload = Arc::new(AtomicI32::new(0));
        let tracker = WorkloadTracker::spawn(name.to_string(), ip, telemetry, workload.clone());

        Ok(Self {
            name: name.to_string(),
            ip,
            domain: domain.trim().trim_end_matches('.').to_string(),
            services: RwLock::new(HashSet::new()),
            workload,
            tracker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn current_workload(&self) -> i32 {
        self.workload.load(Ordering::Acquire)
    }

    pub fn set_current_workload(&self, value: i32) {
        self.workload.store(value, Ordering::Release);
    }

    /// Add `service` to the node.  Services are keyed by domain; adding a
    /// known domain again replaces the entry and returns false.
    pub fn add_service(&self, service: Service) -> bool {
        self.services.write().replace(service).is_none()
    }

    /// Whether the node provides a service with this name.
    pub fn provides(&self, service_name: &str) -> bool {
        self.services.read().iter().any(|s| s.name == service_name)
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.read().iter().cloned().collect()
    }

    pub fn tracker(&self) -> &WorkloadTracker {
        &self.tracker
    }

    /// Stop tracking this node.  Safe to call more than once.
    pub fn unregister(&self) {
        if !self.tracker.is_cancelled() {
            info!("Unregistering cloudlet {}", self.name);
        }
        self.tracker.cancel();
    }

    /// Stop tracking and wait for the tracker's stream to be torn down.
    pub async fn shutdown(&self) {
        self.unregister();
        self.tracker.join().await;
    }
}
