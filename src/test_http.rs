// src/test_http.rs
//! Loopback HTTP/1.1 server for client tests: each accepted connection gets
//! the next canned response, written in pieces with a pause between them.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct Canned {
    pub pieces: Vec<Vec<u8>>,
}

impl Canned {
    /// Head plus body, sent as given pieces of the body.
    pub fn split(head: &str, body_pieces: &[&[u8]]) -> Self {
        let mut pieces = vec![head.as_bytes().to_vec()];
        pieces.extend(body_pieces.iter().map(|p| p.to_vec()));
        Self { pieces }
    }

    pub fn ok(body: &str) -> Self {
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        Self::split(&head, &[body.as_bytes()])
    }

    pub fn redirect(location: &str) -> Self {
        let head = format!(
            "HTTP/1.1 302 Found\r\nlocation: {location}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
        Self::split(&head, &[])
    }
}

pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Serve `responses` in order; returns how many requests were answered.
pub fn serve(listener: TcpListener, responses: Vec<Canned>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut served = 0;
        for canned in responses {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            read_request(&mut sock).await;
            for piece in canned.pieces {
                if sock.write_all(&piece).await.is_err() {
                    break;
                }
                let _ = sock.flush().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            let _ = sock.shutdown().await;
            served += 1;
        }
        served
    })
}

async fn read_request(sock: &mut TcpStream) {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let Ok(n) = sock.read(&mut buf).await else {
            return;
        };
        if n == 0 {
            return;
        }
        data.extend_from_slice(&buf[..n]);
        let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= end + 4 + body_len {
            return;
        }
    }
}
