//! Minimal in-process HTTP/1.1 server for exercising the network paths in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_length: bool,
    /// Send half the body, then hang.
    pub stall: bool,
}

impl Route {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_length: true,
            stall: false,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_length: true,
            stall: false,
        }
    }

    pub fn without_length(mut self) -> Self {
        self.content_length = false;
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

pub struct TestServer {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server addr");
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::new(Mutex::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_owned(), route))
                .collect(),
        ));
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let bodies = Arc::new(Mutex::new(HashMap::new()));

        let task_routes = routes.clone();
        let task_hits = hits.clone();
        let task_bodies = bodies.clone();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let routes = task_routes.clone();
                let hits = task_hits.clone();
                let bodies = task_bodies.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, &routes, &hits, &bodies).await;
                });
            }
        });

        Self {
            addr,
            routes,
            hits,
            bodies,
            handle,
        }
    }

    /// Add or replace a route; useful when a body must embed the server's own URL.
    pub fn set_route(&self, path: &str, route: Route) {
        self.routes
            .lock()
            .expect("routes lock")
            .insert(path.to_owned(), route);
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .expect("hits lock")
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn last_body(&self, path: &str) -> Option<Vec<u8>> {
        self.bodies.lock().expect("bodies lock").get(path).cloned()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    routes: &Mutex<HashMap<String, Route>>,
    hits: &Mutex<HashMap<String, usize>>,
    bodies: &Mutex<HashMap<String, Vec<u8>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let read = socket.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_owned();
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < body_len {
        let read = socket.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    *hits.lock().expect("hits lock").entry(target.clone()).or_insert(0) += 1;
    bodies.lock().expect("bodies lock").insert(target.clone(), body);

    let route = routes
        .lock()
        .expect("routes lock")
        .get(&target)
        .cloned()
        .unwrap_or(Route::status(404));
    let mut response = format!("HTTP/1.1 {} {}\r\n", route.status, reason(route.status));
    response.push_str("Content-Type: application/octet-stream\r\n");
    if route.content_length {
        response.push_str(&format!("Content-Length: {}\r\n", route.body.len()));
    }
    response.push_str("Connection: close\r\n\r\n");
    socket.write_all(response.as_bytes()).await?;

    if route.stall {
        let half = route.body.len() / 2;
        socket.write_all(&route.body[..half]).await?;
        socket.flush().await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        return Ok(());
    }

    socket.write_all(&route.body).await?;
    socket.flush().await?;
    socket.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
