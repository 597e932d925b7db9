use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strata_common::config::Config;
use strata_server::{Pipeline, Server};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};

pub type Client = Framed<TcpStream, LinesCodec>;

pub struct TestServer {
    pub pipeline: Arc<Pipeline>,
    pub addr: std::net::SocketAddr,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default().with_root(dir.path());
        config.processor.accelerator = false;
        config.processor.workers = 2;
        config.processor.batch_linger_ms = 10;
        config.render.view_distance = 1;

        let pipeline = Arc::new(Pipeline::open(config).await.unwrap());
        pipeline.start().await;
        let server = Server::bind(pipeline.clone(), "127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        Self {
            pipeline,
            addr,
            task,
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        Framed::new(stream, LinesCodec::new())
    }

    pub async fn stop(self) {
        self.task.abort();
        self.pipeline.shutdown().await;
    }
}

pub async fn send(client: &mut Client, message: Value) {
    client.send(message.to_string()).await.unwrap();
}

/// Next message from the server, failing the test after five seconds.
pub async fn next_message(client: &mut Client) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for the server")
        .expect("connection closed")
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

/// Reads messages until one satisfies `matches`, returning everything read.
pub async fn read_until(client: &mut Client, matches: impl Fn(&Value) -> bool) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let message = next_message(client).await;
        let done = matches(&message);
        seen.push(message);
        if done {
            return seen;
        }
    }
}
