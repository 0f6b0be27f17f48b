// mock_ws_server: a mock cloud relay for testing the remote tunnel client.
//
// Binds to ws://localhost:<port>, accepts a single handshake frame of the
// shape `{"remote":{"auth/encoder":{"key":..., "version":...}}}`, and
// replies either `{"remote":{"auth/encoder":true}}` or `{"remote":
// {"auth/encoder":false}}` depending on how the server was configured.
// Frames received after a successful handshake are recorded for
// inspection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock relay server for remote-tunnel integration tests.
///
/// Binds to a random available port so each test gets its own isolated
/// instance.
pub struct MockRelayServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockRelayServer {
    /// Start the mock relay. `accept` controls the handshake outcome sent
    /// to every connecting client.
    pub async fn start(accept: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let received = received.clone();
            tokio::spawn(async move {
                Self::accept_loop(listener, accept, received).await;
            })
        };

        Ok(Self {
            addr,
            received,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Frames received after the handshake, in arrival order.
    pub fn received_frames(&self) -> Vec<Value> {
        self.received.lock().expect("lock not poisoned").clone()
    }

    async fn accept_loop(listener: TcpListener, accept: bool, received: Arc<Mutex<Vec<Value>>>) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let received = received.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, accept, received).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        accept: bool,
        received: Arc<Mutex<Vec<Value>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let Some(Ok(Message::Text(handshake))) = read.next().await else {
            return Ok(());
        };
        let handshake: Value = serde_json::from_str(&handshake)?;
        received.lock().expect("lock not poisoned").push(handshake);

        let reply = json!({"remote": {"auth/encoder": accept}});
        write.send(Message::Text(reply.to_string().into())).await?;

        if !accept {
            write.send(Message::Close(None)).await?;
            return Ok(());
        }

        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text)?;
                    received.lock().expect("lock not poisoned").push(value);
                }
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }

        Ok(())
    }

    /// Whether any handshake frame received so far carried the given key.
    pub async fn accepted_key(&self, expected: &str) -> bool {
        self.received_frames().iter().any(|frame| {
            frame
                .get("remote")
                .and_then(|r| r.get("auth/encoder"))
                .and_then(|a| a.get("key"))
                .and_then(Value::as_str)
                == Some(expected)
        })
    }
}
