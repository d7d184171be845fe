//! Hop-by-hop header handling and `Via`/`X-Forwarded-For` injection
//! (spec §6 "HTTP interception semantics", §4.6 step 3).

use std::net::IpAddr;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response};
use hyper::body::Incoming;

/// RFC 7230 §6.1 hop-by-hop headers, stripped on both the request and the
/// response leg.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailers",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

pub fn inject_via_and_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    headers.insert(
        HeaderName::from_static("via"),
        HeaderValue::from_static("1.1 kproxy"),
    );

    let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}

pub fn prepare_outbound_request(mut req: Request<Incoming>, client_ip: IpAddr) -> Request<Incoming> {
    strip_hop_by_hop(req.headers_mut());
    inject_via_and_forwarded_for(req.headers_mut(), client_ip);
    req
}

pub fn prepare_inbound_response<B>(mut resp: Response<B>) -> Response<B> {
    strip_hop_by_hop(resp.headers_mut());
    resp
}
