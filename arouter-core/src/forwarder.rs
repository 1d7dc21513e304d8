//! The catch-all server / forwarder (C8).
//!
//! `tonic::transport::Server`'s `Router` requires every registered service
//! to implement `NamedService` with a fixed path prefix, which cannot
//! express "any method, any service" dispatch. This forwarder instead sits
//! directly on `hyper::server::conn::http2` and implements
//! `tower::Service<http::Request<BoxBody>>` itself, using tonic's low-level
//! `tonic::server::Grpc<Codec>` helper — the same primitive tonic-build's
//! generated service impls use — to perform gRPC wire framing for a method
//! it has never seen a `.proto` definition for.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body as TonicBody;
use tonic::server::{Grpc, StreamingService};
use tonic::{Request as TonicRequest, Response as TonicResponse, Status, Streaming};
use tower::Service;

use crate::codec::{ClientCodec, ServerCodec};
use crate::connection::Connection;
use crate::method::MethodDetails;
use crate::router::{RequestFrame, ResponseFrame, Router};

pub type ResponseStream = ReceiverStream<Result<ResponseFrame, Status>>;

/// One accepted server: the set of routers it exposes, keyed by
/// `package.Service`, as configured by `ServerConfig.routers`.
#[derive(Clone)]
pub struct Forwarder {
    routers: Arc<HashMap<String, Arc<dyn Router>>>,
    reply_handler_failures: Arc<AtomicU64>,
}

impl Forwarder {
    pub fn new(routers: HashMap<String, Arc<dyn Router>>) -> Self {
        Forwarder { routers: Arc::new(routers), reply_handler_failures: Arc::new(AtomicU64::new(0)) }
    }

    pub fn reply_handler_failures(&self) -> u64 {
        self.reply_handler_failures.load(Ordering::Relaxed)
    }

    fn router_for(&self, method: &MethodDetails) -> Result<Arc<dyn Router>, Status> {
        if !method.is_well_formed() {
            return Err(Status::unimplemented(format!("cannot route malformed method {:?}", method.all)));
        }
        self.routers
            .get(&method.package_service())
            .cloned()
            .ok_or_else(|| Status::unimplemented(format!("no router registered for {:?}", method.package_service())))
    }

    /// Bind a listener and accept connections until `shutdown` fires,
    /// handing each one to its own HTTP/2 connection task.
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "forwarder listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(%addr, "forwarder shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let forwarder = self.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = hyper_util::service::TowerToHyperService::new(forwarder.for_peer(peer));
                        let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service);
                        tokio::select! {
                            result = conn => {
                                if let Err(err) = result {
                                    tracing::warn!(%peer, error = %err, "connection error");
                                }
                            }
                            _ = conn_shutdown.cancelled() => {}
                        }
                    });
                }
            }
        }
    }

    fn for_peer(&self, peer: SocketAddr) -> PeerForwarder {
        PeerForwarder { forwarder: self.clone(), peer }
    }
}

/// A `Forwarder` bound to one accepted connection's peer address, so the
/// `source` router can key on it.
#[derive(Clone)]
struct PeerForwarder {
    forwarder: Forwarder,
    peer: SocketAddr,
}

impl Service<Request<hyper::body::Incoming>> for PeerForwarder {
    type Response = Response<TonicBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        let forwarder = self.forwarder.clone();
        let peer = self.peer;
        Box::pin(async move {
            let method = MethodDetails::parse(req.uri().path());
            let router = match forwarder.router_for(&method) {
                Ok(router) => router,
                Err(status) => return Ok(status_response(status)),
            };

            let req = req.map(TonicBody::new);

            let service = ForwardService {
                router,
                method,
                source: peer.to_string(),
                reply_handler_failures: forwarder.reply_handler_failures.clone(),
            };

            let mut grpc = Grpc::new(ServerCodec);
            Ok(grpc.streaming(service, req).await)
        })
    }
}

fn status_response(status: Status) -> Response<TonicBody> {
    status.into_http()
}

/// The "unknown method handler": given the first decoded request frame,
/// open a paired upstream connection and pump frames in both directions.
#[derive(Clone)]
struct ForwardService {
    router: Arc<dyn Router>,
    method: MethodDetails,
    source: String,
    reply_handler_failures: Arc<AtomicU64>,
}

impl StreamingService<RequestFrame> for ForwardService {
    type Response = ResponseFrame;
    type ResponseStream = ResponseStream;
    type Future = Pin<Box<dyn Future<Output = Result<TonicResponse<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: TonicRequest<Streaming<RequestFrame>>) -> Self::Future {
        let router = self.router.clone();
        let method = self.method.clone();
        let source = self.source.clone();
        let reply_handler_failures = self.reply_handler_failures.clone();
        let incoming_metadata = request.metadata().clone();
        let mut inbound = request.into_inner();

        Box::pin(async move {
            let mut frame = match inbound.message().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(Status::invalid_argument("empty request stream")),
                Err(status) => return Err(status),
            };
            frame.method = method.clone();
            frame.metadata = incoming_metadata;
            frame.source = Some(source);

            let decision = router.route(&mut frame)?;
            let pending_header = frame.pending_header.take();

            let connection = decision
                .backend
                .select_connection(decision.association_key.as_deref())
                .map_err(Status::from)?;

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(pump(connection, router.clone(), decision.clone(), method.clone(), frame, inbound, tx, reply_handler_failures));

            let mut response = TonicResponse::new(ReceiverStream::new(rx));
            if let Some((key, value)) = pending_header {
                if let (Ok(name), Ok(val)) = (
                    tonic::metadata::MetadataKey::from_bytes(key.as_bytes()),
                    tonic::metadata::MetadataValue::try_from(value.as_str()),
                ) {
                    response.metadata_mut().insert(name, val);
                }
            }

            Ok(response)
        })
    }
}

/// Opens the upstream call on `connection` and pumps frames downstream
/// (server streaming) while feeding any additional client-streamed request
/// frames upstream, invoking `Router::reply_handler` on every response.
async fn pump(
    connection: Arc<Connection>,
    router: Arc<dyn crate::router::Router>,
    decision: crate::router::RouteDecision,
    method: MethodDetails,
    first_frame: RequestFrame,
    mut inbound: Streaming<RequestFrame>,
    outbound: mpsc::Sender<Result<ResponseFrame, Status>>,
    reply_handler_failures: Arc<AtomicU64>,
) {
    let Some(channel) = connection.channel() else {
        let _ = outbound.send(Err(Status::unavailable("upstream connection is not ready"))).await;
        return;
    };

    let mut client = tonic::client::Grpc::new(channel);
    if let Err(err) = client.ready().await {
        connection.report_transport_error();
        let _ = outbound
            .send(Err(Status::unavailable(format!("upstream connection failed: {err}"))))
            .await;
        return;
    }

    let (upstream_tx, upstream_rx) = mpsc::channel::<RequestFrame>(1);
    let _ = upstream_tx.send(first_frame).await;

    let forward_inbound = async move {
        while let Ok(Some(frame)) = inbound.message().await {
            if upstream_tx.send(frame).await.is_err() {
                break;
            }
        }
    };
    tokio::spawn(forward_inbound);

    let path = http::uri::PathAndQuery::try_from(method.all.as_str()).unwrap_or_else(|_| http::uri::PathAndQuery::from_static("/"));
    let upstream_request = TonicRequest::new(ReceiverStream::new(upstream_rx));
    let call = client.streaming(upstream_request, path, ClientCodec).await;

    match call {
        Ok(response) => {
            connection.report_success();
            let mut upstream_responses = response.into_inner();
            while let Some(item) = upstream_responses.message().await.transpose() {
                match item {
                    Ok(frame) => {
                        if let Err(err) = router.reply_handler(&decision, &frame) {
                            reply_handler_failures_increment(&reply_handler_failures, &method, &err);
                        }
                        if outbound.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        connection.report_transport_error();
                        let _ = outbound.send(Err(status)).await;
                        break;
                    }
                }
            }
        }
        Err(status) => {
            connection.report_transport_error();
            let _ = outbound.send(Err(status)).await;
        }
    }
}

fn reply_handler_failures_increment(counter: &AtomicU64, method: &MethodDetails, err: &crate::error::ArouterError) {
    tracing::warn!(method = %method.all, error = %err, "reply handler failed to learn affinity");
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_rejects_unrouted_package() {
        let forwarder = Forwarder::new(HashMap::new());
        let method = MethodDetails::parse("/voltha.VolthaService/ListDevices");
        assert!(forwarder.router_for(&method).is_err());
    }

    #[test]
    fn forwarder_rejects_malformed_method() {
        let forwarder = Forwarder::new(HashMap::new());
        let method = MethodDetails::parse("garbage");
        let err = match forwarder.router_for(&method) {
            Err(e) => e,
            Ok(_) => panic!("expected router_for to reject a malformed method"),
        };
        assert_eq!(err.code(), Status::unimplemented("").code());
    }

    #[test]
    fn reply_handler_failure_increments_the_counter() {
        let forwarder = Forwarder::new(HashMap::new());
        assert_eq!(forwarder.reply_handler_failures(), 0);
        let method = MethodDetails::parse("/voltha.VolthaService/Subscribe");
        let err = crate::error::ArouterError::Routing("boom".to_string());
        reply_handler_failures_increment(&forwarder.reply_handler_failures, &method, &err);
        assert_eq!(forwarder.reply_handler_failures(), 1);
    }
}
