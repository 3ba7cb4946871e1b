#![allow(dead_code)]

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;

use devscale_core::proto::{self, Reply, ServiceRequest, WorkItem, WorkRequest};
use devscale_core::wire;

/// Find a free TCP port.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to free port");
    listener.local_addr().unwrap().port()
}

/// Resolve a binary path from the workspace target directory.
fn workspace_binary(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // crates/
    path.pop(); // workspace root
    path.push("target");
    path.push("debug");
    path.push(name);
    path
}

/// Spawn a workspace binary with piped, drained stderr so the process
/// never blocks on a full pipe.
fn spawn_binary(name: &str, args: &[String]) -> Child {
    let binary = workspace_binary(name);
    assert!(
        binary.exists(),
        "{name} binary not found at {binary:?}. Run `cargo build` first."
    );

    let mut child = Command::new(&binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("start {name}: {e}"));

    // drain both pipes so the process never blocks on a full pipe
    let stdout = child.stdout.take().expect("stdout");
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            if line.is_err() {
                break;
            }
        }
    });
    let stderr = child.stderr.take().expect("stderr");
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            if line.is_err() {
                break;
            }
        }
    });

    child
}

/// Poll TCP until `addr` accepts connections.
fn wait_reachable(addr: &str) {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        if std::net::TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{addr} did not become reachable within 10s");
}

/// A spawned workspace binary, killed on drop.
pub struct TestProcess {
    child: Option<Child>,
}

impl TestProcess {
    /// Wait up to `timeout` for the process to exit on its own; returns
    /// its exit code.
    pub fn wait_exit(&mut self, timeout: Duration) -> i32 {
        let child = self.child.as_mut().expect("process already reaped");
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(status)) = child.try_wait() {
                self.child = None;
                return status.code().unwrap_or(-1);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("process did not exit within {timeout:?}");
    }
}

impl Drop for TestProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A running frontend on random ports.
pub struct Frontend {
    proc: TestProcess,
    pub caddr: String,
    pub waddr: String,
    pub maddr: String,
}

impl Frontend {
    /// Start a frontend serving `queues`, with extra flags appended.
    pub fn start(queues: &[&str], extra: &[&str]) -> Self {
        let caddr = format!("127.0.0.1:{}", free_port());
        let waddr = format!("127.0.0.1:{}", free_port());
        let maddr = format!("127.0.0.1:{}", free_port());

        let mut args = vec![
            "--caddr".to_string(),
            caddr.clone(),
            "--waddr".to_string(),
            waddr.clone(),
            "--maddr".to_string(),
            maddr.clone(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.extend(queues.iter().map(|s| s.to_string()));

        let child = spawn_binary("devscale-frontend", &args);
        wait_reachable(&maddr);
        wait_reachable(&caddr);
        wait_reachable(&waddr);

        Self {
            proc: TestProcess { child: Some(child) },
            caddr,
            waddr,
            maddr,
        }
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.maddr)
    }
}

/// A running backend pointed at a frontend worker address.
pub struct Backend {
    pub proc: TestProcess,
}

impl Backend {
    /// Start a backend polling `waddr`, with extra flags and the
    /// workload argument vector appended.
    pub fn start(waddr: &str, extra: &[&str], workload: &[&str]) -> Self {
        let mut args = vec!["--faddr".to_string(), waddr.to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.extend(workload.iter().map(|s| s.to_string()));

        let child = spawn_binary("devscale-backend", &args);
        Self {
            proc: TestProcess { child: Some(child) },
        }
    }
}

/// A running client pointed at a frontend client address.
pub struct Client {
    pub proc: TestProcess,
    pub caddr: String,
}

impl Client {
    pub fn start(faddr: &str, extra: &[&str]) -> Self {
        let caddr = format!("127.0.0.1:{}", free_port());
        let mut args = vec![
            "--caddr".to_string(),
            caddr.clone(),
            "--faddr".to_string(),
            faddr.to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));

        let child = spawn_binary("devscale-client", &args);
        wait_reachable(&caddr);
        Self {
            proc: TestProcess { child: Some(child) },
            caddr,
        }
    }

    /// Start a client without waiting for its control endpoint; for
    /// tests that expect startup to fail.
    pub fn start_unchecked(faddr: &str, extra: &[&str]) -> Self {
        let caddr = format!("127.0.0.1:{}", free_port());
        let mut args = vec![
            "--caddr".to_string(),
            caddr.clone(),
            "--faddr".to_string(),
            faddr.to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));

        let child = spawn_binary("devscale-client", &args);
        Self {
            proc: TestProcess { child: Some(child) },
            caddr,
        }
    }

    pub fn control_url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.caddr, path_and_query)
    }
}

/// Send one service request and wait for the reply.
pub async fn send_request(caddr: &str, req: &ServiceRequest) -> Reply {
    let mut conn = open_request(caddr, req).await;
    read_reply(&mut conn).await
}

/// Send one service request and leave the connection open; the reply
/// arrives whenever a worker completes the item.
pub async fn open_request(caddr: &str, req: &ServiceRequest) -> TcpStream {
    let mut conn = TcpStream::connect(caddr).await.expect("connect to frontend");
    let data = proto::encode(req).expect("encode service request");
    wire::write_message(&mut conn, &data)
        .await
        .expect("send service request");
    conn
}

/// Read and decode the reply on an open request connection.
pub async fn read_reply(conn: &mut TcpStream) -> Reply {
    let data = wire::read_message(conn).await.expect("read reply");
    proto::decode(&data).expect("decode reply")
}

/// Send raw bytes as a request and return the raw reply.
pub async fn send_raw(caddr: &str, payload: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(caddr).await.expect("connect to frontend");
    wire::write_message(&mut conn, payload)
        .await
        .expect("send payload");
    wire::read_message(&mut conn).await.expect("read reply")
}

/// Pull one work item, playing the worker role. The connection stays
/// open so the caller can send the worker reply on it.
pub async fn pull_work(waddr: &str, queue: &str) -> (TcpStream, WorkItem) {
    let mut conn = TcpStream::connect(waddr).await.expect("connect as worker");
    let data = proto::encode(&WorkRequest {
        queue: queue.to_string(),
    })
    .expect("encode work request");
    wire::write_message(&mut conn, &data)
        .await
        .expect("send work request");
    let data = wire::read_message(&mut conn).await.expect("read work item");
    let item = proto::decode(&data).expect("decode work item");
    (conn, item)
}

/// Complete a pulled work item with the given worker reply.
pub async fn answer_work(mut conn: TcpStream, reply: &Reply) {
    let data = proto::encode(reply).expect("encode worker reply");
    wire::write_message(&mut conn, &data)
        .await
        .expect("send worker reply");
}

/// A plausible worker reply for tests that play the backend role.
pub fn worker_reply(runtime: f64) -> Reply {
    Reply {
        node: "test-node".to_string(),
        pod: "test-pod".to_string(),
        device: "card0".to_string(),
        runtime,
        retcode: 0,
        ..Reply::default()
    }
}

/// Fetch a metrics/control page body.
pub async fn http_get(url: &str) -> String {
    reqwest::get(url).await.expect("GET").text().await.expect("body")
}

/// Value of the metric line starting with `name_and_labels`.
pub fn metric(text: &str, name_and_labels: &str) -> Option<f64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(name_and_labels)?;
        rest.trim().parse().ok()
    })
}
