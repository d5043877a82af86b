use crate::index::Changes;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn, Instrument};

pub type Body = http_body_util::Full<Bytes>;

/// Serves `/healthz` and `/invoke`.
#[derive(Clone, Debug)]
pub struct Surface {
    changes: Changes,
}

// === impl Surface ===

impl Surface {
    pub fn new(changes: Changes) -> Self {
        Self { changes }
    }

    pub fn respond<B>(&self, req: &Request<B>) -> Response<Body> {
        match (req.uri().path(), req.method()) {
            ("/healthz", &Method::GET) => text(StatusCode::OK, "Ok"),
            ("/invoke", &Method::POST) => {
                info!("Recomputation requested");
                self.changes.signal();
                text(StatusCode::OK, "Invoked")
            }
            ("/healthz" | "/invoke", _) => {
                text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            }
            _ => text(StatusCode::NOT_FOUND, "Not found"),
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp
}

/// Accepts HTTP/1 connections until shutdown.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve(listener: TcpListener, surface: Surface, drain: drain::Watch) {
    info!("HTTP server listening");

    tokio::pin! {
        let shutdown = drain.signaled();
    }

    loop {
        let (io, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = (&mut shutdown) => {
                debug!("Shutting down");
                return;
            }
        };

        let surface = surface.clone();
        let svc = service_fn(move |req| {
            let rsp = surface.respond(&req);
            async move { Ok::<_, Infallible>(rsp) }
        });
        tokio::spawn(
            async move {
                if let Err(error) = http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc)
                    .await
                {
                    debug!(%error, %client, "Connection failed");
                }
            }
            .in_current_span(),
        );
    }
}
