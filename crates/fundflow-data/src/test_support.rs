//! Local HTTP stub for exercising the provider clients without the network.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A running stub. `base_url` has no trailing slash.
pub struct StubServer {
    pub base_url: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    /// Request targets (path and query) received so far, in arrival order.
    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().expect("lock not poisoned").clone()
    }

    /// Number of requests whose target contains `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.hits().iter().filter(|hit| hit.contains(needle)).count()
    }
}

/// Serves every request with `handler(target) -> (status, json_body)` on an
/// ephemeral localhost port until the runtime shuts down.
pub async fn serve<F>(handler: F) -> StubServer
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub should bind");
    let addr = listener.local_addr().expect("stub has an address");
    let handler = Arc::new(handler);
    let hits = Arc::new(Mutex::new(Vec::new()));

    let served = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            let hits = Arc::clone(&served);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }

                let head = String::from_utf8_lossy(&request);
                let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                hits.lock().expect("lock not poisoned").push(target.clone());

                let (status, body) = handler(&target);
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    StubServer {
        base_url: format!("http://{addr}"),
        hits,
    }
}

/// Value of query parameter `name` in a request target.
pub fn query_param<'a>(target: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = target.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
