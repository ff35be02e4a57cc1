//! Shared test infrastructure for the DNS front end tests.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use hickory_server::proto::op::{Message, MessageType, OpCode, Query};
use hickory_server::proto::rr::{DNSClass, Name, RData, Record, RecordType};

use cloudlet_dns::cache::MemoryStore;
use cloudlet_dns::cloudlet::{TelemetrySource, WorkloadStream};
use cloudlet_dns::error::{Error, Result};
use cloudlet_dns::resolver::address_record;
use cloudlet_dns::{
    AddressFamily, CacheAsideResolver, LoadBalancer, Registry, Service, Upstream,
    WorkloadStatusMessage,
};

// --- Fakes ---

/// Telemetry source that reports a fixed sequence of client counts per
/// address, then keeps the stream open.
#[derive(Default)]
pub struct ScriptedTelemetry {
    scripts: Mutex<Vec<(IpAddr, Vec<i32>)>>,
}

impl ScriptedTelemetry {
    pub fn script(&self, ip: &str, counts: &[i32]) {
        self.scripts
            .lock()
            .unwrap()
            .push((ip.parse().unwrap(), counts.to_vec()));
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn subscribe(&self, ip: IpAddr) -> Result<WorkloadStream> {
        let counts = self
            .scripts
            .lock()
            .unwrap()
            .iter()
            .find(|(addr, _)| *addr == ip)
            .map(|(_, counts)| counts.clone())
            .unwrap_or_default();
        let reports = counts
            .into_iter()
            .map(|client_count| Ok(WorkloadStatusMessage { client_count }));
        Ok(stream::iter(reports).chain(stream::pending()).boxed())
    }
}

/// Upstream answering A questions from a fixed table.
#[derive(Default)]
pub struct FakeUpstream {
    answers: Mutex<Vec<(String, IpAddr)>>,
    calls: AtomicUsize,
}

impl FakeUpstream {
    pub fn answer(&self, name: &str, ip: &str) {
        self.answers
            .lock()
            .unwrap()
            .push((format!("{}.", name), ip.parse().unwrap()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let wanted = name.to_ascii();
        let records: Vec<Record> = self
            .answers
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == wanted)
            .filter_map(|(_, ip)| {
                let family = AddressFamily::from_record_type(record_type)?;
                address_record(name.clone(), 300, *ip, family)
            })
            .collect();
        if records.is_empty() {
            return Err(Error::NoData(wanted));
        }
        Ok(records)
    }
}

// --- Fixture ---

pub struct Fixture {
    pub telemetry: Arc<ScriptedTelemetry>,
    pub upstream: Arc<FakeUpstream>,
    pub store: Arc<MemoryStore>,
    pub registry: Registry,
    pub max_workload: i32,
}

impl Fixture {
    pub fn new(max_workload: i32) -> Self {
        let telemetry = Arc::new(ScriptedTelemetry::default());
        Self {
            registry: Registry::new(telemetry.clone()),
            telemetry,
            upstream: Arc::new(FakeUpstream::default()),
            store: Arc::new(MemoryStore::new()),
            max_workload,
        }
    }

    /// Register `name` at `ip` serving `domain`, with its tracker reporting
    /// `workload`.
    pub fn cloudlet(&self, name: &str, ip: &str, domain: &str, workload: i32) {
        self.telemetry.script(ip, &[workload]);
        let service = Service::from_domain(domain);
        self.registry.add_service(domain, service.clone());
        self.registry.register_cloudlet(name, ip, "").unwrap();
        self.registry.associate_service(name, service).unwrap();
    }

    /// Wait until every cloudlet's tracker has applied its scripted report.
    pub async fn settle(&self, expected: &[(&str, i32)]) {
        for _ in 0..200 {
            let done = expected.iter().all(|(name, workload)| {
                self.registry.get_cloudlet(name).unwrap().current_workload() == *workload
            });
            if done {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("trackers never reported {:?}", expected);
    }

    pub fn handler(&self, ttl_secs: i64) -> LoadBalancer {
        let resolver = Arc::new(CacheAsideResolver::new(
            self.store.clone(),
            self.upstream.clone(),
            ttl_secs,
        ));
        LoadBalancer::new(self.registry.clone(), resolver, self.max_workload)
    }
}

// --- Query construction ---

/// Build a DNS query with one question per name.
pub fn build_query(questions: &[(&str, RecordType)], id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    for (name, record_type) in questions {
        let mut query = Query::new();
        query.set_name(Name::from_ascii(name).unwrap());
        query.set_query_type(*record_type);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
    }
    msg
}

pub fn build_query_bytes(questions: &[(&str, RecordType)], id: u16) -> Vec<u8> {
    build_query(questions, id).to_vec().unwrap()
}

/// Run `query` through the handler's datagram path and decode the reply.
pub async fn ask(handler: &LoadBalancer, query: &Message) -> Message {
    let client: SocketAddr = "192.0.2.10:5300".parse().unwrap();
    let reply = handler
        .handle_datagram(client, &query.to_vec().unwrap())
        .await
        .expect("handler produced no reply");
    Message::from_vec(&reply).expect("failed to parse DNS reply")
}

/// Extract A addresses from a response, in answer order.
pub fn a_records(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            _ => None,
        })
        .collect()
}
