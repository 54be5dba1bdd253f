//! Mock LMS CLI (telnet, port 9090) for testing
//!
//! Expects a login line first (any credentials when none are configured),
//! echoes subscribe/listen commands, pushes scripted notification lines and
//! can drop every connection on demand.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

struct Shared {
    credentials: Option<(String, String)>,
    /// Lines received from clients after login
    received: Mutex<Vec<String>>,
    connections: AtomicUsize,
    logins: AtomicUsize,
    notifications: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

pub struct MockCliServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockCliServer {
    /// Start on a random port. The first line must be `login <user> <pass>`,
    /// matching `credentials` when given; anything else closes the connection.
    pub async fn start(credentials: Option<(&str, &str)>) -> Self {
        let (notifications, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            credentials: credentials.map(|(u, p)| (u.to_string(), p.to_string())),
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            notifications,
            kick,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Accepted login handshakes
    pub fn logins(&self) -> usize {
        self.shared.logins.load(Ordering::SeqCst)
    }

    pub async fn received(&self) -> Vec<String> {
        self.shared.received.lock().await.clone()
    }

    /// Send one raw line to every connected client
    pub fn notify(&self, line: &str) {
        if self.shared.notifications.send(line.to_string()).is_err() {
            eprintln!("mock cli: no client connected for {:?}", line);
        }
    }

    /// Close every open connection
    pub fn kick_all(&self) {
        if self.shared.kick.send(()).is_err() {
            eprintln!("mock cli: no client to kick");
        }
    }

    /// Wait until `n` subscribe/listen commands have arrived
    pub async fn wait_for_subscriptions(&self, n: usize) -> bool {
        for _ in 0..100 {
            let count = self
                .received()
                .await
                .iter()
                .filter(|l| l.starts_with("subscribe") || l.starts_with("listen"))
                .count();
            if count >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Stop accepting; new connections are refused once the listener drops
    pub fn close_listener(&self) {
        self.handle.abort();
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let mut notifications = shared.notifications.subscribe();
    let mut kick = shared.kick.subscribe();

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Ok(Some(line)) = lines.next_line().await else {
        return;
    };
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("login") {
        return;
    }
    let user = tokens.next().unwrap_or("").to_string();
    let pass = tokens.next().unwrap_or("").to_string();
    if let Some((expected_user, expected_pass)) = &shared.credentials {
        if user != *expected_user || pass != *expected_pass {
            return;
        }
    }
    let ack = format!("login {} ******\n", user);
    if writer.write_all(ack.as_bytes()).await.is_err() {
        return;
    }
    shared.logins.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                let line = line.trim().to_string();
                shared.received.lock().await.push(line.clone());
                if line.starts_with("subscribe") || line.starts_with("listen") {
                    let echo = format!("{}\n", urlencoding::encode(&line).replace("%20", " "));
                    if writer.write_all(echo.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            note = notifications.recv() => {
                let Ok(note) = note else { return };
                if writer.write_all(format!("{}\n", note).as_bytes()).await.is_err() {
                    return;
                }
            }
            _ = kick.recv() => return,
        }
    }
}
