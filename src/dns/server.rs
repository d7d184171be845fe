//! DNS Server (spec §4.5): intercept/bypass/block decision gateway, built
//! on `hickory-server`'s `RequestHandler`/`ServerFuture` pattern.

use std::iter;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_resolver::TokioResolver;
use tracing::{info, warn};

use crate::dns::cache::{BypassCache, BypassCacheKey};
use crate::facts::FactGatherer;
use crate::policy::{DnsAction, PolicyEvaluator};

pub struct DnsServerConfig {
    pub proxy_ip: Ipv4Addr,
    pub intercept_ttl: u32,
    pub bypass_ttl_cap: u32,
    pub block_ttl: u32,
    pub intercept_fallback: bool,
    pub enable_udp: bool,
    pub enable_tcp: bool,
}

#[derive(Clone)]
pub struct DnsServer {
    facts: Arc<FactGatherer>,
    evaluator: Arc<PolicyEvaluator>,
    upstream: Arc<TokioResolver>,
    cache: Arc<BypassCache>,
    proxy_ip: Ipv4Addr,
    intercept_ttl: u32,
    bypass_ttl_cap: u32,
    block_ttl: u32,
    intercept_fallback: bool,
    enable_udp: bool,
    enable_tcp: bool,
}

impl DnsServer {
    pub fn new(
        facts: Arc<FactGatherer>,
        evaluator: Arc<PolicyEvaluator>,
        upstream: TokioResolver,
        cache: BypassCache,
        cfg: DnsServerConfig,
    ) -> Self {
        Self {
            facts,
            evaluator,
            upstream: Arc::new(upstream),
            cache: Arc::new(cache),
            proxy_ip: cfg.proxy_ip,
            intercept_ttl: cfg.intercept_ttl,
            bypass_ttl_cap: cfg.bypass_ttl_cap,
            block_ttl: cfg.block_ttl,
            intercept_fallback: cfg.intercept_fallback,
            enable_udp: cfg.enable_udp,
            enable_tcp: cfg.enable_tcp,
        }
    }

    /// Binds UDP and/or TCP per `dns.enable_udp`/`dns.enable_tcp` (spec §6
    /// configuration surface). At least one transport must be enabled.
    pub async fn serve(self, udp: std::net::SocketAddr, tcp: std::net::SocketAddr) -> anyhow::Result<()> {
        use hickory_server::ServerFuture;
        use tokio::net::{TcpListener, UdpSocket};

        if !self.enable_udp && !self.enable_tcp {
            anyhow::bail!("dns.enable_udp and dns.enable_tcp are both false, no transport to serve on");
        }

        let enable_udp = self.enable_udp;
        let enable_tcp = self.enable_tcp;
        let mut server = ServerFuture::new(self);

        if enable_udp {
            let udp_socket = UdpSocket::bind(udp).await?;
            server.register_socket(udp_socket);
        }
        if enable_tcp {
            let tcp_listener = TcpListener::bind(tcp).await?;
            server.register_listener(tcp_listener, Duration::from_secs(10));
        }

        server.block_until_done().await?;
        Ok(())
    }

    fn intercept_record(&self, qname: &Name) -> Record {
        let mut record = Record::from_rdata(qname.clone(), self.intercept_ttl, RData::A(A(self.proxy_ip)));
        record.set_dns_class(hickory_proto::rr::DNSClass::IN);
        record
    }

    fn block_record(&self, qname: &Name) -> Record {
        let mut record = Record::from_rdata(qname.clone(), self.block_ttl, RData::A(A(Ipv4Addr::UNSPECIFIED)));
        record.set_dns_class(hickory_proto::rr::DNSClass::IN);
        record
    }

    async fn bypass_records(&self, qname: &Name, qtype: RecordType) -> (Vec<Record>, ResponseCode, &'static str) {
        let key = BypassCacheKey::new(&qname.to_ascii(), qtype);
        if let Some(cached) = self.cache.get(&key).await {
            return (cached.records, ResponseCode::NoError, "cache");
        }

        match self.upstream.lookup(qname.clone(), qtype).await {
            Ok(lookup) => {
                let mut records: Vec<Record> = lookup.records().iter().cloned().collect();
                self.cache.cap_ttl(&mut records);
                self.cache.insert(key, records.clone()).await;
                (records, ResponseCode::NoError, "upstream")
            }
            Err(e) => {
                warn!(error = %e, qname = %qname, "all upstream resolvers failed");
                (vec![], ResponseCode::ServFail, "upstream")
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsServer {
    async fn handle_request<R: ResponseHandler>(&self, req: &Request, mut response: R) -> ResponseInfo {
        let start = Instant::now();

        let query = match req.queries().first() {
            Some(q) => q.clone(),
            None => {
                let msg = MessageResponseBuilder::from_message_request(req)
                    .error_msg(req.header(), ResponseCode::ServFail);
                return response
                    .send_response(msg)
                    .await
                    .unwrap_or_else(|_| ResponseInfo::from(*req.header()));
            }
        };

        let qname = query.name().clone();
        let qtype = query.query_type();
        let client_ip = req.src().ip();
        let domain = qname.to_ascii().trim_end_matches('.').to_ascii_lowercase();

        let dns_fact = self.facts.build_dns_fact(&domain, client_ip).await;

        if !matches!(qtype, RecordType::A | RecordType::AAAA) {
            let (records, rcode, upstream) = self.bypass_records(&qname, qtype).await;
            return self
                .respond(req, &mut response, &records, rcode, start, &domain, qtype, client_ip, "forward", upstream)
                .await;
        }

        let decision = self.evaluator.evaluate_dns(&dns_fact);

        let (records, rcode, action_label, upstream_label) = match decision.action {
            DnsAction::Intercept => {
                if qtype == RecordType::A {
                    (vec![self.intercept_record(&qname)], ResponseCode::NoError, "INTERCEPT", "none")
                } else {
                    (vec![], ResponseCode::NoError, "INTERCEPT", "none")
                }
            }
            DnsAction::Bypass => {
                let (records, rcode, upstream) = self.bypass_records(&qname, qtype).await;
                if rcode != ResponseCode::NoError && self.intercept_fallback {
                    let record = if qtype == RecordType::A {
                        vec![self.intercept_record(&qname)]
                    } else {
                        vec![]
                    };
                    (record, ResponseCode::NoError, "INTERCEPT_FALLBACK", upstream)
                } else {
                    (records, rcode, "BYPASS", upstream)
                }
            }
            DnsAction::Block => (vec![self.block_record(&qname)], ResponseCode::NoError, "BLOCK", "none"),
        };

        self.respond(
            req,
            &mut response,
            &records,
            rcode,
            start,
            &domain,
            qtype,
            client_ip,
            action_label,
            upstream_label,
        )
        .await
    }
}

impl DnsServer {
    #[allow(clippy::too_many_arguments)]
    async fn respond<R: ResponseHandler>(
        &self,
        req: &Request,
        response: &mut R,
        records: &[Record],
        rcode: ResponseCode,
        start: Instant,
        domain: &str,
        qtype: RecordType,
        client_ip: std::net::IpAddr,
        action: &str,
        upstream: &str,
    ) -> ResponseInfo {
        let mut header = *req.header();
        header.set_message_type(MessageType::Response);
        header.set_op_code(OpCode::Query);
        header.set_response_code(rcode);
        header.set_recursion_desired(req.recursion_desired());
        header.set_recursion_available(true);
        header.set_authoritative(false);

        let response_ip = records.first().and_then(|r| match r.data() {
            RData::A(a) => Some(a.0.to_string()),
            _ => None,
        });

        let msg = MessageResponseBuilder::from_message_request(req).build(
            header,
            records.iter(),
            iter::empty(),
            iter::empty(),
            iter::empty(),
        );

        let info = response
            .send_response(msg)
            .await
            .unwrap_or_else(|_| ResponseInfo::from(*req.header()));

        info!(
            %client_ip,
            domain,
            qtype = %qtype,
            action,
            response_ip = response_ip.as_deref().unwrap_or("-"),
            upstream,
            latency_ms = start.elapsed().as_millis() as u64,
            "dns query"
        );

        info
    }
}
