//! DNS server subsystem.
//!
//! This module implements the director's DNS front end on top of the
//! [hickory-dns](https://crates.io/crates/hickory-server) wire types.  The
//! server owns its UDP socket and answers every question of a query
//! message as follows:
//!
//! * **Registered service names**: the cloudlets providing the service are
//!   compared by current workload and the least loaded one is returned in
//!   an authoritative A/AAAA answer, provided its workload is within the
//!   configured threshold.
//! * **Everything else**, including services whose cloudlets are all
//!   saturated: answered by the cache-aside resolver, non-authoritatively.
//!
//! Questions fail independently; a question nobody can answer simply
//! contributes no records.  Replies are written without name compression.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_server::proto::op::{Edns, Header, Message, MessageType, OpCode, ResponseCode};
use hickory_server::proto::rr::{Name, Record, RecordType};
use hickory_server::proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable, BinEncoder};
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cloudlet::CloudletNode;
use crate::error::Result;
use crate::registry::Registry;
use crate::resolver::{address_record, CacheAsideResolver};
use crate::types::AddressFamily;

/// TTL of routed answers.  Zero keeps clients from pinning a cloudlet.
const ROUTED_TTL: u32 = 0;

/// Reply size limit for clients that do not advertise EDNS.
const MAX_UDP_PAYLOAD: usize = 512;

/// Payload size we advertise back to EDNS clients.
const EDNS_PAYLOAD: u16 = 1232;

/// Receive buffer; larger datagrams are cut short and fail to decode.
const MAX_DATAGRAM: usize = 4096;

/// Records produced for one question.
#[derive(Debug, Clone, Default)]
pub struct Answer {
    pub records: Vec<Record>,
    /// True only when a cloudlet was selected.
    pub authoritative: bool,
}

/// Pick the least loaded node.  Ties go to the earliest node in `nodes`.
/// Each node's workload is read exactly once.
pub fn least_loaded(nodes: &[Arc<CloudletNode>]) -> Option<(&Arc<CloudletNode>, i32)> {
    let mut nodes = nodes.iter();
    let first = nodes.next()?;
    let mut best = (first, first.current_workload());
    for node in nodes {
        let workload = node.current_workload();
        if workload < best.1 {
            best = (node, workload);
        }
    }
    Some(best)
}

/// Query handler that routes service names to cloudlets.
pub struct LoadBalancer {
    registry: Registry,
    resolver: Arc<CacheAsideResolver>,
    max_workload: i32,
}

impl LoadBalancer {
    pub fn new(registry: Registry, resolver: Arc<CacheAsideResolver>, max_workload: i32) -> Self {
        Self {
            registry,
            resolver,
            max_workload,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Choose a cloudlet for `domain` if it names a service with at least
    /// one provider of `family` under the workload threshold.  The chosen node's
    /// workload is bumped by one before returning.
    pub fn route(&self, client: SocketAddr, domain: &str, family: AddressFamily) -> Option<Arc<CloudletNode>> {
        let service = self.registry.get_service(domain).ok()?;
        let candidates: Vec<_> = self
            .registry
            .candidates(&service.name)
            .into_iter()
            .filter(|node| AddressFamily::of(node.ip()) == family)
            .collect();
        let Some((node, workload)) = least_loaded(&candidates) else {
            debug!(
                "No cloudlet provides {} over {}, go to normal server",
                service.name,
                family.record_type()
            );
            return None;
        };

        if workload > self.max_workload {
            info!(
                "Current workload {} exceeds threshold {}, go to normal server",
                workload, self.max_workload
            );
            return None;
        }

        node.set_current_workload(workload.saturating_add(1));
        info!(
            "IP {} goes to cloudlet {}, with workload {}",
            client.ip(),
            node.name(),
            workload
        );
        Some(node.clone())
    }

    /// Answer one question.
    pub async fn answer(&self, client: SocketAddr, name: &Name, record_type: RecordType) -> Answer {
        let Some(family) = AddressFamily::from_record_type(record_type) else {
            debug!("Unsupported question type {} for {}", record_type, name);
            return Answer::default();
        };
        let cleaned = name.to_ascii();
        let cleaned = cleaned.trim_end_matches('.');

        if let Some(node) = self.route(client, cleaned, family) {
            if let Some(record) = address_record(name.clone(), ROUTED_TTL, node.ip(), family) {
                return Answer {
                    records: vec![record],
                    authoritative: true,
                };
            }
        }

        match self.resolver.resolve(cleaned, family).await {
            Ok(resolution) => Answer {
                records: resolution.records,
                authoritative: false,
            },
            Err(e) => {
                warn!("Cannot resolve {} {}: {}", cleaned, record_type, e);
                Answer::default()
            }
        }
    }

    /// Build the reply to a query message, answering each question on its
    /// own.  Opcodes other than QUERY get NOTIMP.
    pub async fn handle_message(&self, client: SocketAddr, request: &Message) -> Message {
        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true)
            .add_queries(request.queries().iter().cloned());
        if request.extensions().is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(EDNS_PAYLOAD);
            reply.set_edns(edns);
        }

        if request.op_code() != OpCode::Query {
            debug!("Ignoring {:?} message from {}", request.op_code(), client);
            reply.set_response_code(ResponseCode::NotImp);
            return reply;
        }

        let mut authoritative = false;
        for query in request.queries() {
            let answer = self.answer(client, query.name(), query.query_type()).await;
            authoritative |= answer.authoritative;
            reply.add_answers(answer.records);
        }
        reply
            .set_authoritative(authoritative)
            .set_response_code(ResponseCode::NoError);
        reply
    }

    /// Answer one datagram.  Returns `None` when nothing should be sent
    /// back: responses, and input too short to carry a header.
    pub async fn handle_datagram(&self, client: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(datagram) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed query from {}: {}", client, e);
                let reply = format_error(datagram)?;
                return encode_reply(reply, MAX_UDP_PAYLOAD)
                    .map_err(|e| error!("Failed to encode FORMERR for {}: {}", client, e))
                    .ok();
            }
        };
        if request.message_type() != MessageType::Query {
            debug!("Dropping response message from {}", client);
            return None;
        }

        let limit = request
            .extensions()
            .as_ref()
            .map_or(MAX_UDP_PAYLOAD, |edns| usize::from(edns.max_payload()).max(MAX_UDP_PAYLOAD));
        let reply = self.handle_message(client, &request).await;
        match encode_reply(reply, limit) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode reply to {}: {}", client, e);
                None
            }
        }
    }
}

/// FORMERR reply for a datagram whose header parses but whose body does not.
fn format_error(datagram: &[u8]) -> Option<Message> {
    let header = Header::read(&mut BinDecoder::new(datagram)).ok()?;
    if header.message_type() != MessageType::Query {
        return None;
    }
    let mut reply = Message::new();
    reply
        .set_id(header.id())
        .set_message_type(MessageType::Response)
        .set_op_code(header.op_code())
        .set_response_code(ResponseCode::FormErr);
    Some(reply)
}

fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(MAX_UDP_PAYLOAD);
    {
        let mut encoder = BinEncoder::new(&mut buf);
        // Every name is written out in full.
        encoder.set_canonical_names(true);
        message.emit(&mut encoder)?;
    }
    Ok(buf)
}

/// Encode `reply`, dropping its answers and setting TC if it exceeds `limit`.
fn encode_reply(mut reply: Message, limit: usize) -> Result<Vec<u8>> {
    let bytes = encode(&reply)?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }
    debug!("Reply of {} bytes exceeds {}, truncating", bytes.len(), limit);
    reply.take_answers();
    reply.set_truncated(true);
    encode(&reply)
}

/// Serve DNS on an already bound socket until `shutdown` fires.
///
/// Each datagram is handled on its own task.  On shutdown the socket stops
/// being read and queries already received are answered before returning.
pub async fn serve(socket: UdpSocket, handler: LoadBalancer, shutdown: CancellationToken) -> Result<()> {
    let socket = Arc::new(socket);
    let handler = Arc::new(handler);
    let mut in_flight = JoinSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Query task failed: {}", e);
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (len, client) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive datagram: {}", e);
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let socket = socket.clone();
                let handler = handler.clone();
                in_flight.spawn(async move {
                    if let Some(reply) = handler.handle_datagram(client, &datagram).await {
                        if let Err(e) = socket.send_to(&reply, client).await {
                            warn!("Failed to send response to {}: {}", client, e);
                        }
                    }
                });
            }
        }
    }

    info!(
        "DNS server shutdown requested, {} queries in flight",
        in_flight.len()
    );
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Query task failed: {}", e);
        }
    }
    info!("DNS server stopped");
    Ok(())
}

/// Start the DNS server.  Failing to bind is fatal.
pub async fn run_dns_server(
    bind_addr: SocketAddr,
    handler: LoadBalancer,
    shutdown: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    info!("Start domain name server at {}", socket.local_addr()?);
    serve(socket, handler, shutdown).await
}
