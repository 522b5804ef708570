#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// One request as the upstream application saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// How the upstream answers.
#[derive(Debug, Clone, Copy)]
pub struct Behaviour {
    pub status: StatusCode,
    /// Wait before sending response headers.
    pub delay: Duration,
    /// When set, the body goes out as five chunks with this pause between them.
    pub chunk_gap: Option<Duration>,
}

impl Behaviour {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
            chunk_gap: None,
        }
    }
}

#[derive(Clone)]
struct Shared {
    seen: Arc<Mutex<Vec<Seen>>>,
    behaviour: Behaviour,
}

/// A local application that records every request before answering.
#[derive(Clone)]
pub struct Upstream {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Upstream {
    pub async fn spawn(status: StatusCode) -> Self {
        Self::spawn_with(Behaviour::status(status)).await
    }

    pub async fn spawn_with(behaviour: Behaviour) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().fallback(record).with_state(Shared {
            seen: seen.clone(),
            behaviour,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, seen }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

async fn record(State(shared): State<Shared>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap();
    shared.seen.lock().unwrap().push(Seen {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body,
    });

    let behaviour = shared.behaviour;
    tokio::time::sleep(behaviour.delay).await;
    let body = match behaviour.chunk_gap {
        None => Body::from("upstream-ok"),
        Some(gap) => Body::from_stream(futures::stream::unfold(0u8, move |n| async move {
            if n == 5 {
                return None;
            }
            if n > 0 {
                tokio::time::sleep(gap).await;
            }
            Some((Ok::<_, std::io::Error>(Bytes::from(format!("part-{n};"))), n + 1))
        })),
    };
    (
        behaviour.status,
        [("x-upstream", "yes"), ("keep-alive", "timeout=5")],
        body,
    )
        .into_response()
}

/// A port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
