//! Upstream resolver construction for the BYPASS path (spec §4.5: "fan out
//! to configured upstream resolvers in list order; first non-error reply
//! wins").

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;

pub async fn build_upstream_resolver(upstreams: &[String], timeout: Duration) -> anyhow::Result<TokioResolver> {
    let mut group = NameServerConfigGroup::new();

    for u in upstreams {
        let addr: SocketAddr = u.parse().with_context(|| format!("invalid upstream address: {u}"))?;

        group.push(NameServerConfig {
            socket_addr: addr,
            protocol: Protocol::Udp,
            tls_dns_name: None,
            trust_negative_responses: true,
            bind_addr: None,
            http_endpoint: None,
        });
        group.push(NameServerConfig {
            socket_addr: addr,
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: true,
            bind_addr: None,
            http_endpoint: None,
        });
    }

    let mut cfg = ResolverConfig::new();
    for ns in group.into_iter() {
        cfg.add_name_server(ns);
    }

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts.timeout = timeout;

    let mut builder = TokioResolver::builder_with_config(cfg, TokioConnectionProvider::default());
    *builder.options_mut() = opts;
    Ok(builder.build())
}
