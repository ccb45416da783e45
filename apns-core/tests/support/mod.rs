//! A minimal in-process HTTP/2 server double: accepts one connection,
//! serves each stream a scripted response in the order streams arrive.
//! No TLS — paired with a `Dialer` that connects straight to the listener.

use std::sync::Arc;

use apns_proxy::{BoxedStream, DialError, Dialer, Endpoint};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};

/// A scripted per-stream response.
pub struct ScriptedResponse {
    pub status: u16,
    pub body: Value,
}

impl ScriptedResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn failure(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Starts an in-process `h2::server` that serves `script` in order, one
/// response per accepted stream, and returns the local address it is
/// listening on.
pub async fn spawn_server(script: Vec<ScriptedResponse>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut connection = h2::server::handshake(socket).await.unwrap();

        let script = Arc::new(Mutex::new(script.into_iter()));

        while let Some(result) = connection.accept().await {
            let (request, mut respond) = result.unwrap();
            let script = script.clone();
            tokio::spawn(async move {
                let _ = request;
                let next = script.lock().next();
                let (status, body) = match next {
                    Some(scripted) => (scripted.status, scripted.body),
                    None => (500, serde_json::json!({"reason": "InternalServerError"})),
                };

                let response = http::Response::builder()
                    .status(status)
                    .body(())
                    .unwrap();

                let payload = Bytes::from(serde_json::to_vec(&body).unwrap());
                let mut send_stream = respond.send_response(response, false).unwrap();
                let _ = send_stream.send_data(payload, true);
            });
        }
    });

    addr
}

/// Dials straight to a fixed local address, ignoring the requested
/// `Endpoint` entirely. Stands in for TLS + real DNS in integration tests.
pub struct LoopbackDialer {
    addr: std::net::SocketAddr,
}

impl LoopbackDialer {
    pub fn new(addr: std::net::SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, _target: &Endpoint) -> Result<BoxedStream, DialError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(DialError::Connect)?;
        Ok(Box::new(stream))
    }
}
