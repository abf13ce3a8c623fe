//! HTTP server for the admin operations

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{AdminApi, PublishMsg, Response, CODE_PARAM_ERROR};

type HttpResponse = hyper::Response<Full<Bytes>>;

/// HTTP server exposing [`AdminApi`]
pub struct AdminServer {
    api: AdminApi,
    addr: SocketAddr,
}

impl AdminServer {
    pub fn new(api: AdminApi, addr: SocketAddr) -> Self {
        Self { api, addr }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!("Admin server listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let api = self.api.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let api = api.clone();
                    async move { handle_request(req, api).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving admin connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(req: Request<Incoming>, api: AdminApi) -> Result<HttpResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("failed to read admin request body: {}", e);
            return Ok(json_response(&Response::error(CODE_PARAM_ERROR, e)));
        }
    };
    Ok(route(&api, &method, &path, &body).await)
}

pub(super) async fn route(api: &AdminApi, method: &Method, path: &str, body: &[u8]) -> HttpResponse {
    debug!("admin {} {}", method, path);
    let response = match (method, path) {
        (&Method::GET, "/health") => return text_response(StatusCode::OK, "OK"),
        (&Method::GET, "/info") => api.server_info(),
        (&Method::GET, "/connections") => api.connection_list(),
        (&Method::GET, "/topics") => api.topic_list(),
        (&Method::POST, "/publish") => match parse_msg(body) {
            Ok(msg) => api.send_publish(msg).await,
            Err(resp) => resp,
        },
        (&Method::POST, "/retain") => match parse_msg(body) {
            Ok(msg) => api.set_retain_msg(msg),
            Err(resp) => resp,
        },
        (&Method::POST, _) => match stop_target(path) {
            Some(client_id) => api.stop_connection(client_id),
            None => return not_found(),
        },
        _ => return not_found(),
    };
    json_response(&response)
}

/// Client id of `/connections/{client_id}/stop`
fn stop_target(path: &str) -> Option<&str> {
    path.strip_prefix("/connections/")?
        .strip_suffix("/stop")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

fn parse_msg(body: &[u8]) -> Result<PublishMsg, Response> {
    serde_json::from_slice(body).map_err(|e| Response::error(CODE_PARAM_ERROR, e))
}

fn json_response(response: &Response) -> HttpResponse {
    match serde_json::to_vec(response) {
        Ok(body) => {
            let mut resp = hyper::Response::new(Full::new(Bytes::from(body)));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!("Failed to encode admin response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut resp = hyper::Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}

fn not_found() -> HttpResponse {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}
