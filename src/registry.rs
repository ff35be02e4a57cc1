//! Registry of services and cloudlets.
//!
//! Both tables sit behind one lock.  Writers only ever touch in-memory maps
//! while holding it: node construction happens before the lock is taken and
//! tracker teardown after it is released, so DNS lookups never queue behind
//! network I/O.
//!
//! Removal policy: unregistering a cloudlet stops its tracker and drops it
//! from the table; services stay registered.  A service nobody provides is
//! answered from upstream like any unknown name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::cloudlet::{CloudletNode, TelemetrySource};
use crate::config::CloudletSeed;
use crate::error::{Error, Result};
use crate::types::Service;

/// Thread-safe registry shared by the DNS handler and the registration hooks.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    telemetry: Arc<dyn TelemetrySource>,
}

#[derive(Default)]
struct RegistryInner {
    /// domain -> Service
    services: HashMap<String, Service>,

    /// cloudlet name -> node
    cloudlets: HashMap<String, CloudletEntry>,

    /// Registration counter; orders candidates for tie-breaking.
    next_seq: u64,
}

struct CloudletEntry {
    seq: u64,
    node: Arc<CloudletNode>,
}

fn domain_key(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl Registry {
    /// Create an empty registry whose cloudlets report through `telemetry`.
    pub fn new(telemetry: Arc<dyn TelemetrySource>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            telemetry,
        }
    }

    /// Insert or replace the service reachable under `domain`.
    pub fn add_service(&self, domain: &str, service: Service) {
        let key = domain_key(domain);
        debug!("Adding service {} under {}", service.name, key);
        self.inner.write().services.insert(key, service);
    }

    /// Service registered under `domain`.
    pub fn get_service(&self, domain: &str) -> Result<Service> {
        let key = domain_key(domain);
        self.inner
            .read()
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {}", key)))
    }

    /// Register a cloudlet and start tracking its workload.  A cloudlet
    /// already registered under the same name is replaced and its tracker
    /// stopped.
    pub fn register_cloudlet(&self, name: &str, ip: &str, domain: &str) -> Result<Arc<CloudletNode>> {
        let node = Arc::new(CloudletNode::new(name, ip, domain, self.telemetry.clone())?);

        let previous = {
            let mut inner = self.inner.write();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.cloudlets.insert(
                node.name().to_string(),
                CloudletEntry {
                    seq,
                    node: node.clone(),
                },
            )
        };

        if let Some(previous) = previous {
            warn!("Cloudlet {} registered again, replacing previous node", node.name());
            previous.node.unregister();
        }
        info!("Registered cloudlet {} at {}", node.name(), node.ip());
        Ok(node)
    }

    /// Declare that `cloudlet` serves `service`.  Fails with
    /// [`Error::NotFound`] for an unregistered cloudlet, leaving the registry
    /// untouched.  Associating the same service twice is a no-op.
    pub fn associate_service(&self, cloudlet: &str, service: Service) -> Result<()> {
        let inner = self.inner.read();
        let entry = inner
            .cloudlets
            .get(cloudlet)
            .ok_or_else(|| Error::NotFound(format!("cloudlet {}", cloudlet)))?;
        let name = service.name.clone();
        if entry.node.add_service(service) {
            info!("Cloudlet {} now serves {}", cloudlet, name);
        }
        Ok(())
    }

    pub fn get_cloudlet(&self, name: &str) -> Result<Arc<CloudletNode>> {
        self.inner
            .read()
            .cloudlets
            .get(name)
            .map(|entry| entry.node.clone())
            .ok_or_else(|| Error::NotFound(format!("cloudlet {}", name)))
    }

    /// All cloudlets in registration order.
    pub fn cloudlets(&self) -> Vec<Arc<CloudletNode>> {
        self.select_cloudlets(|_| true)
    }

    /// Cloudlets providing a service named `service_name`, in registration
    /// order.
    pub fn candidates(&self, service_name: &str) -> Vec<Arc<CloudletNode>> {
        self.select_cloudlets(|node| node.provides(service_name))
    }

    fn select_cloudlets(&self, keep: impl Fn(&CloudletNode) -> bool) -> Vec<Arc<CloudletNode>> {
        let inner = self.inner.read();
        let mut entries: Vec<&CloudletEntry> = inner
            .cloudlets
            .values()
            .filter(|entry| keep(&entry.node))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.node.clone()).collect()
    }

    /// Overwrite a cloudlet's workload from an external report.
    pub fn report_workload(&self, cloudlet: &str, workload: i32) -> Result<()> {
        self.get_cloudlet(cloudlet)?.set_current_workload(workload);
        Ok(())
    }

    /// Remove a cloudlet and wait for its tracker to stop.
    pub async fn unregister_cloudlet(&self, name: &str) -> Result<()> {
        let entry = self
            .inner
            .write()
            .cloudlets
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("cloudlet {}", name)))?;
        entry.node.shutdown().await;
        info!("Cloudlet {} unregistered", name);
        Ok(())
    }

    /// Stop every tracker.  Cloudlets stay registered so in-flight queries
    /// still resolve against their last known workload.
    pub async fn shutdown(&self) {
        let nodes = self.cloudlets();
        for node in &nodes {
            node.unregister();
        }
        for node in &nodes {
            node.tracker().join().await;
        }
        info!("Stopped {} workload trackers", nodes.len());
    }

    pub fn services_count(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn cloudlets_count(&self) -> usize {
        self.inner.read().cloudlets.len()
    }

    /// Load services from a file holding one domain per line.  Blank lines
    /// and `#` comments are skipped.
    pub async fn seed_services_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut added = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let service = Service::from_domain(line);
            self.add_service(&service.domain.clone(), service);
            added += 1;
        }
        info!(
            "Loaded {} services from {}",
            added,
            path.as_ref().display()
        );
        Ok(added)
    }

    /// Register a cloudlet declared in configuration along with its
    /// services.
    pub fn seed_cloudlet(&self, seed: &CloudletSeed) -> Result<Arc<CloudletNode>> {
        let node = self.register_cloudlet(&seed.name, &seed.ip, &seed.domain)?;
        for domain in &seed.services {
            let service = match self.get_service(domain) {
                Ok(service) => service,
                Err(_) => {
                    let service = Service::from_domain(domain);
                    self.add_service(domain, service.clone());
                    service
                }
            };
            self.associate_service(node.name(), service)?;
        }
        Ok(node)
    }
}
