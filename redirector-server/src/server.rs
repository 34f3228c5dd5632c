//! HTTP surface for handling incoming connections and answering with redirects.
//!
//! `GET /sessions[/{id}]` drains test-mode session logs, `DELETE` on the same
//! paths clears them, and `GET /capacity` reports host counts. Every other
//! request is routed: its query parameters become the routing context.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use redirector_core::{Context, RedirectorEngine};

/// Accept connections on `listener` until it fails.
pub async fn serve(listener: TcpListener, engine: Arc<RedirectorEngine>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, app = %engine.app(), "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let engine = Arc::clone(&engine);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let engine = Arc::clone(&engine);
                async move { Ok::<_, Infallible>(handle_request(&engine, &req, peer)) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(%peer, error = %err, "error serving connection");
            }
        });
    }
}

fn handle_request<B>(engine: &RedirectorEngine, req: &Request<B>, peer: SocketAddr) -> Response<Full<Bytes>> {
    debug!(%peer, method = %req.method(), uri = %req.uri(), "request");
    respond(engine, req.method(), req.uri())
}

/// Build the response for one request.
pub fn respond(engine: &RedirectorEngine, method: &Method, uri: &Uri) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["sessions"]) => json(StatusCode::OK, &engine.sessions().poll_all()),
        (&Method::GET, ["sessions", id]) => json(StatusCode::OK, &engine.sessions().poll(id)),
        (&Method::DELETE, ["sessions"]) => {
            engine.sessions().clear_all();
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::DELETE, ["sessions", id]) => {
            engine.sessions().clear(id);
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::GET, ["capacity"]) => json(StatusCode::OK, &Capacity::of(engine)),
        (&Method::GET | &Method::HEAD, _) => redirect(engine, uri),
        _ => empty(StatusCode::METHOD_NOT_ALLOWED),
    }
}

#[derive(Serialize)]
struct Capacity {
    default_hosts: usize,
    distribution_hosts: usize,
    percent_deviation: u32,
}

impl Capacity {
    fn of(engine: &RedirectorEngine) -> Self {
        Self {
            default_hosts: engine.get_count_of_hosts_for_default_server(),
            distribution_hosts: engine.get_count_of_hosts_for_distribution(),
            percent_deviation: engine.get_percent_deviation_count_of_hosts_for_distribution(),
        }
    }
}

fn redirect(engine: &RedirectorEngine, uri: &Uri) -> Response<Full<Bytes>> {
    let context: Context = form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect();

    let Some(route) = engine.redirect(&context) else {
        return text(StatusCode::NOT_FOUND, "no route");
    };
    let Ok(location) = HeaderValue::from_str(&route.url) else {
        warn!(url = %route.url, "resolved url is not a valid header value");
        return text(StatusCode::INTERNAL_SERVER_ERROR, "unusable route");
    };

    let mut response = text(StatusCode::FOUND, &route.url);
    response.headers_mut().insert(LOCATION, location);
    response
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!(error = %e, "failed to encode response");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
