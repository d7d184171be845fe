//! Proxy Server (spec §4.6): terminates HTTP on port 80 and HTTPS on port
//! 443, applies the proxy decision, and forwards, tunnels, or renders a
//! block page. Built on `hyper` + `hyper-util` + `tokio-rustls`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::ca::CertificateAuthority;
use crate::clock::Clock;
use crate::facts::FactGatherer;
use crate::policy::{PolicyEvaluator, ProxyAction};
use crate::proxy::{blockpage, forward, mitm};
use crate::usage::UsageTracker;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct ProxyServerConfig {
    pub http_listen: SocketAddr,
    pub https_listen: SocketAddr,
    pub dial_timeout: Duration,
}

pub struct ProxyServer {
    facts: Arc<FactGatherer>,
    evaluator: Arc<PolicyEvaluator>,
    usage: Arc<UsageTracker>,
    ca: Arc<CertificateAuthority>,
    clock: Arc<dyn Clock>,
    root_store: Arc<rustls::RootCertStore>,
    cfg: ProxyServerConfig,
}

impl ProxyServer {
    pub fn new(
        facts: Arc<FactGatherer>,
        evaluator: Arc<PolicyEvaluator>,
        usage: Arc<UsageTracker>,
        ca: Arc<CertificateAuthority>,
        clock: Arc<dyn Clock>,
        cfg: ProxyServerConfig,
    ) -> anyhow::Result<Self> {
        let root_store = mitm::load_system_root_store()?;
        Ok(Self {
            facts,
            evaluator,
            usage,
            ca,
            clock,
            root_store,
            cfg,
        })
    }

    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let http_listener = TcpListener::bind(self.cfg.http_listen).await?;
        let https_listener = TcpListener::bind(self.cfg.https_listen).await?;

        let http_self = self.clone();
        let http_task = tokio::spawn(async move { http_self.accept_plain(http_listener).await });

        let https_self = self.clone();
        let https_task = tokio::spawn(async move { https_self.accept_tls(https_listener).await });

        let _ = tokio::try_join!(http_task, https_task)?;
        Ok(())
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_connection(stream, peer.ip(), false).await {
                    warn!(error = %e, client_ip = %peer.ip(), "plain connection ended with error");
                }
            });
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                let tls_stream = match mitm::accept_tls(stream, &this.ca).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, client_ip = %peer.ip(), "TLS handshake failed");
                        return;
                    }
                };
                if let Err(e) = this.serve_hyper(tls_stream, peer.ip(), true).await {
                    warn!(error = %e, client_ip = %peer.ip(), "encrypted connection ended with error");
                }
            });
        }
    }

    async fn serve_connection(self: &Arc<Self>, stream: TcpStream, client_ip: IpAddr, encrypted: bool) -> anyhow::Result<()> {
        self.serve_hyper(stream, client_ip, encrypted).await
    }

    async fn serve_hyper<S>(self: &Arc<Self>, stream: S, client_ip: IpAddr, encrypted: bool) -> anyhow::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let this = self.clone();

        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let this = this.clone();
                    async move { this.route(req, client_ip, encrypted).await }
                }),
            )
            .with_upgrades()
            .await?;
        Ok(())
    }

    async fn route(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
        encrypted: bool,
    ) -> Result<Response<BoxBody>, hyper::Error> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req, client_ip).await);
        }
        Ok(self.handle_request(req, client_ip, encrypted).await)
    }

    /// CONNECT support for explicit-proxy scenarios (spec §4.6 step 4):
    /// evaluates on the target host; ALLOW and BYPASS both open a raw
    /// tunnel (bypass traffic is, by definition, not mediated further);
    /// BLOCK returns a status without establishing a tunnel.
    async fn handle_connect(&self, req: Request<Incoming>, client_ip: IpAddr) -> Response<BoxBody> {
        let authority = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();
        let (host, port) = split_host_port(&authority, 443);

        let fact = self.facts.build_proxy_fact(&host, "", client_ip).await;
        let decision = self.evaluator.evaluate_proxy(&fact);

        info!(%client_ip, host, action = ?decision.action(), reason = %decision.reason, "connect request");

        match decision.action() {
            ProxyAction::Block => status_response(StatusCode::FORBIDDEN, "blocked by policy"),
            ProxyAction::Allow | ProxyAction::Bypass => {
                if let Some(category) = decision.category.clone() {
                    self.usage.record_activity(&fact.device_id, &category).await;
                }
                self.tunnel(req, host, port).await
            }
        }
    }

    async fn tunnel(&self, req: Request<Incoming>, host: String, port: u16) -> Response<BoxBody> {
        let dial = tokio::time::timeout(self.cfg.dial_timeout, TcpStream::connect((host.as_str(), port))).await;
        let origin = match dial {
            Ok(Ok(stream)) => stream,
            _ => return status_response(StatusCode::BAD_GATEWAY, "upstream unavailable"),
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut upgraded = TokioIo::new(upgraded);
                    let mut origin = origin;
                    if let Err(e) = tokio::io::copy_bidirectional(&mut upgraded, &mut origin).await {
                        warn!(error = %e, "connect tunnel closed with error");
                    }
                }
                Err(e) => warn!(error = %e, "failed to upgrade connect request"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
    }

    async fn handle_request(&self, req: Request<Incoming>, client_ip: IpAddr, encrypted: bool) -> Response<BoxBody> {
        let start = Instant::now();
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let fact = self.facts.build_proxy_fact(&host, &path, client_ip).await;
        let decision = self.evaluator.evaluate_proxy(&fact);

        let response = match decision.action() {
            ProxyAction::Block => {
                let url = format!("http{}://{}{}", if encrypted { "s" } else { "" }, host, path);
                let html = blockpage::render(&fact.device_id, &decision.reason, &url, self.clock.now());
                html_response(StatusCode::OK, html)
            }
            ProxyAction::Allow | ProxyAction::Bypass => {
                if decision.action() == ProxyAction::Allow {
                    if let Some(category) = &decision.category {
                        self.usage.record_activity(&fact.device_id, category).await;
                    }
                }
                match self.forward_to_origin(req, &host, client_ip, encrypted).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(error = %e, host, "origin forward failed");
                        html_response(
                            StatusCode::BAD_GATEWAY,
                            format!("upstream unavailable: {e}"),
                        )
                    }
                }
            }
        };

        info!(
            %client_ip,
            %method,
            host,
            path,
            status = response.status().as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            action = ?decision.action(),
            matched_rule = %decision.matched_rule_id,
            reason = %decision.reason,
            category = decision.category.as_deref().unwrap_or("-"),
            encrypted,
            "proxy request"
        );

        response
    }

    async fn forward_to_origin(
        &self,
        req: Request<Incoming>,
        host: &str,
        client_ip: IpAddr,
        encrypted: bool,
    ) -> anyhow::Result<Response<BoxBody>> {
        let req = forward::prepare_outbound_request(req, client_ip);
        let port = if encrypted { 443 } else { 80 };

        if encrypted {
            let tls = mitm::dial_origin_tls(host, port, self.root_store.clone()).await?;
            self.send_over(req, tls).await
        } else {
            let tcp = tokio::time::timeout(self.cfg.dial_timeout, TcpStream::connect((host, port))).await??;
            self.send_over(req, tcp).await
        }
    }

    async fn send_over<S>(&self, req: Request<Incoming>, io: S) -> anyhow::Result<Response<BoxBody>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = %e, "origin connection closed with error");
            }
        });

        let resp = sender.send_request(req).await?;
        let resp = forward::prepare_inbound_response(resp);
        let (parts, body) = resp.into_parts();
        let boxed = body.map_err(|e| e).boxed();
        Ok(Response::from_parts(parts, boxed))
    }
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    }
}

fn empty_body() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn status_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())).map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn html_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(http::header::CACHE_CONTROL, "no-store")
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}
