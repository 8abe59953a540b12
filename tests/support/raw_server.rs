//! Hand-rolled HTTP/1.1 server for bodies wiremock cannot shape: throttled
//! streams and chunked transfers without `Content-Length`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::http_mocks::parse_range;

const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Clone, Copy)]
enum Shape {
    /// Range-aware, `Content-Length` framed, written `chunk` bytes per `interval`.
    Throttled { chunk: usize, interval: Duration },
    /// `Transfer-Encoding: chunked`, no size and no range support.
    Chunked,
}

/// Serves one body on every path until dropped.
pub struct RawHttpServer {
    addr: SocketAddr,
    ranges: Arc<Mutex<Vec<String>>>,
    accept_loop: JoinHandle<()>,
}

impl RawHttpServer {
    pub async fn throttled(body: Vec<u8>, chunk: usize, interval: Duration) -> Self {
        Self::start(body, Shape::Throttled { chunk, interval }).await
    }

    pub async fn chunked(body: Vec<u8>) -> Self {
        Self::start(body, Shape::Chunked).await
    }

    async fn start(body: Vec<u8>, shape: Shape) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Arc::new(body);
        let ranges = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&ranges);
        let accept_loop = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let body = Arc::clone(&body);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    // a client that hangs up mid-body is expected on pause
                    let _ = serve(socket, &body, shape, &seen).await;
                });
            }
        });

        Self {
            addr,
            ranges,
            accept_loop,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// `Range` header values seen so far, in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Drop for RawHttpServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn read_head(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 || head.len() > MAX_HEAD_BYTES {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn serve(
    mut socket: TcpStream,
    body: &[u8],
    shape: Shape,
    ranges: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let head = read_head(&mut socket).await?;
    let mut lines = head.lines();
    let is_head = lines
        .next()
        .is_some_and(|line| line.starts_with("HEAD "));
    let range = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .map(|(_, value)| value.trim().to_string());

    match shape {
        Shape::Chunked => {
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
                .await?;
            if !is_head {
                for piece in body.chunks(1000) {
                    socket
                        .write_all(format!("{:x}\r\n", piece.len()).as_bytes())
                        .await?;
                    socket.write_all(piece).await?;
                    socket.write_all(b"\r\n").await?;
                }
                socket.write_all(b"0\r\n\r\n").await?;
            }
        }
        Shape::Throttled { chunk, interval } => {
            let len = body.len() as u64;
            let (status, first, last) = match range.as_deref().and_then(|r| parse_range(r, len)) {
                Some((start, end)) => ("206 Partial Content", start, end),
                None => ("200 OK", 0, len.saturating_sub(1)),
            };
            if let Some(range) = &range
                && let Ok(mut seen) = ranges.lock()
            {
                seen.push(range.clone());
            }
            let slice = &body[usize::try_from(first).unwrap()..=usize::try_from(last).unwrap()];
            let mut response = format!(
                "HTTP/1.1 {status}\r\nAccept-Ranges: bytes\r\nContent-Length: {}\r\nConnection: close\r\n",
                slice.len()
            );
            if range.is_some() {
                response.push_str(&format!("Content-Range: bytes {first}-{last}/{len}\r\n"));
            }
            response.push_str("\r\n");
            socket.write_all(response.as_bytes()).await?;
            if !is_head {
                for piece in slice.chunks(chunk) {
                    socket.write_all(piece).await?;
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
    socket.flush().await?;
    socket.shutdown().await
}
