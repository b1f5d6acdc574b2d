// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP listeners - thin wrappers around hyper-util.
//!
//! Two sockets: the data plane ([`run_gateway_listener`]) feeds every
//! connection through [`Gateway::handle`], streaming bodies both ways; the
//! management plane ([`run_management_server`]) hosts liveness, the
//! Prometheus exposition, the admin JSON API and the developer portal.
//! Both accept HTTP/1.1 and HTTP/2 on the same port via the auto builder.


use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::header;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::DevPortalConfig;
use crate::gateway::{Gateway, GatewayRequest, GatewayResponse};
use crate::store::CatalogStore;
use crate::{admin, devportal};

/// Errors binding or running a listener.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Accept Go-style listen strings: `":8080"` binds all interfaces.
pub fn parse_listen_addr(listen: &str) -> Result<SocketAddr, ServerError> {
    let candidate = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    candidate
        .parse()
        .map_err(|_| ServerError::InvalidAddress(listen.to_string()))
}

/// A finished management-plane response body.
#[derive(Debug)]
pub(crate) struct ApiResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body: Bytes::from(body),
            },
            Err(e) => Self::text(500, &format!("encode error: {e}")),
        }
    }

    pub fn text(status: u16, msg: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: Bytes::from(msg.to_string()),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "not found")
    }

    pub fn method_not_allowed() -> Self {
        Self::text(405, "method not allowed")
    }
}

fn into_hyper_response(resp: ApiResponse) -> Response<Full<Bytes>> {
    Response::builder()
        .status(resp.status)
        .header(header::CONTENT_TYPE, resp.content_type)
        .body(Full::new(resp.body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"response build error"))))
}

/// Translate a hyper request into the pipeline's representation. The body
/// is streamed, not buffered.
fn convert_gateway_request(req: Request<Incoming>, remote_addr: SocketAddr) -> GatewayRequest {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let host = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let headers = req.headers().clone();
    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

    GatewayRequest {
        method,
        host,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        remote_addr,
        body,
        started_at: Instant::now(),
    }
}

fn convert_gateway_response(resp: GatewayResponse) -> Response<reqwest::Body> {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = resp.headers;
    }
    builder.body(resp.body).unwrap_or_else(|e| {
        log::error!("failed to build response: {e}");
        Response::builder()
            .status(500)
            .body(reqwest::Body::from("Internal Server Error"))
            .expect("static 500 response")
    })
}

/// The bound data-plane socket, split from the accept loop so callers (and
/// tests) can learn the address before serving.
#[derive(Debug)]
pub struct GatewayListener {
    listener: TcpListener,
}

impl GatewayListener {
    pub async fn bind(listen: &str) -> Result<Self, ServerError> {
        let addr = parse_listen_addr(listen)?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop: each connection is served on its own task; every
    /// request dispatches through the gateway's current chain.
    pub async fn serve(self, gateway: Arc<Gateway>) -> Result<(), ServerError> {
        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("accept error: {e}");
                    continue;
                }
            };
            let gateway = gateway.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let gateway = gateway.clone();
                    async move {
                        let proxy_req = convert_gateway_request(req, remote_addr);
                        let proxy_resp = gateway.handle(proxy_req).await;
                        Ok::<_, Infallible>(convert_gateway_response(proxy_resp))
                    }
                });
                let builder = AutoBuilder::new(TokioExecutor::new());
                if let Err(e) = builder.serve_connection(io, service).await {
                    log::debug!("connection error: {e}");
                }
            });
        }
    }
}

/// Bind and run the data-plane listener.
pub async fn run_gateway_listener(
    listen: &str,
    gateway: Arc<Gateway>,
) -> Result<(), ServerError> {
    let listener = GatewayListener::bind(listen).await?;
    log::info!(
        "apimgate gateway listening on http://{}",
        listener.local_addr()?
    );
    listener.serve(gateway).await
}

/// Everything the management handlers need.
pub struct ManagementContext {
    pub store: Arc<CatalogStore>,
    pub gateway: Arc<Gateway>,
    pub registry: Registry,
    pub devportal: DevPortalConfig,
}

/// The bound management socket, split from the accept loop like
/// [`GatewayListener`].
#[derive(Debug)]
pub struct ManagementListener {
    listener: TcpListener,
}

impl ManagementListener {
    pub async fn bind(listen: &str) -> Result<Self, ServerError> {
        let addr = parse_listen_addr(listen)?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, ctx: Arc<ManagementContext>) -> Result<(), ServerError> {
        loop {
            let (stream, _remote_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("accept error: {e}");
                    continue;
                }
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let ctx = ctx.clone();
                    async move { Ok::<_, Infallible>(route_management(req, ctx).await) }
                });
                let builder = AutoBuilder::new(TokioExecutor::new());
                if let Err(e) = builder.serve_connection(io, service).await {
                    log::debug!("management connection error: {e}");
                }
            });
        }
    }
}

/// Bind and run the management listener: `/health`, `/ready`, `/metrics`,
/// the admin JSON API under `/api/admin/` and the developer portal.
pub async fn run_management_server(
    listen: &str,
    ctx: Arc<ManagementContext>,
) -> Result<(), ServerError> {
    let listener = ManagementListener::bind(listen).await?;
    log::info!(
        "apimgate server listening on http://{} (admin, devportal, metrics)",
        listener.local_addr()?
    );
    listener.serve(ctx).await
}

async fn route_management(
    req: Request<Incoming>,
    ctx: Arc<ManagementContext>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return into_hyper_response(ApiResponse::text(400, &format!("body read error: {e}")))
        }
    };

    let portal_api_prefix = format!("{}/api", ctx.devportal.path);
    let resp = match path.as_str() {
        "/health" | "/ready" => ApiResponse::text(200, "OK"),
        "/metrics" => metrics_exposition(&ctx.registry),
        p if p.starts_with(admin::PREFIX) => {
            admin::handle(&method, p, query.as_deref(), &body, &ctx.store, &ctx.gateway)
        }
        p if p.starts_with(&portal_api_prefix) => {
            devportal::handle(&method, p, query.as_deref(), &ctx.devportal.path, &ctx.store)
        }
        p if ctx.devportal.enabled && p.starts_with(&ctx.devportal.path) => {
            devportal::static_asset(p, &ctx.devportal.path)
        }
        _ => ApiResponse::not_found(),
    };
    into_hyper_response(resp)
}

fn metrics_exposition(registry: &Registry) -> ApiResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
        return ApiResponse::text(500, &format!("metrics encode error: {e}"));
    }
    ApiResponse {
        status: 200,
        content_type: "text/plain; version=0.0.4",
        body: Bytes::from(buf),
    }
}
