//! TCP acceptor for chat connections.
//!
//! Binds the listening socket and hands every accepted connection to its
//! own supervisor task.

use crate::chatlog::ChatLog;
use crate::config::Config;
use crate::connection::{self, Limits};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a failed accept, so a persistent error (e.g. fd
/// exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    chatlog: Arc<ChatLog>,
    limits: Limits,
}

impl Server {
    /// Create the log directory and bind the listening socket on all
    /// interfaces at `config.port`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        Self::bind_addr(addr, config)
    }

    /// Like `bind`, with an explicit address.
    pub fn bind_addr(addr: SocketAddr, config: &Config) -> io::Result<Self> {
        let chatlog = ChatLog::open(&config.log_dir)?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            chatlog,
            limits: Limits::from(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a reference to the client log registry for testing
    #[cfg(test)]
    pub fn chatlog(&self) -> &Arc<ChatLog> {
        &self.chatlog
    }

    /// Accept connections forever. Accept errors are logged and retried.
    pub async fn run(self) {
        match self.local_addr() {
            Ok(addr) => info!(
                address = %addr,
                log_dir = %self.chatlog.dir().display(),
                "Server listening"
            ),
            Err(e) => error!(error = %e, "Listening on unknown address"),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let chatlog = Arc::clone(&self.chatlog);
                    tokio::spawn(connection::supervise(stream, peer, chatlog, self.limits));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            port: 0,
            log_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    async fn start(config: &Config) -> (SocketAddr, Arc<ChatLog>) {
        let server = Server::bind_addr("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let addr = server.local_addr().unwrap();
        let chatlog = Arc::clone(server.chatlog());
        tokio::spawn(server.run());
        (addr, chatlog)
    }

    struct Client {
        reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Client {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send(&mut self, line: &str) -> String {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.recv().await
        }

        async fn recv(&mut self) -> String {
            let mut reply = String::new();
            self.reader.read_line(&mut reply).await.unwrap();
            reply
        }

        async fn expect_closed(&mut self) {
            let mut rest = Vec::new();
            let n = self.reader.read_to_end(&mut rest).await.unwrap();
            assert_eq!(n, 0, "unexpected data: {:?}", String::from_utf8_lossy(&rest));
        }
    }

    /// Wait for the server side to drop every handle.
    async fn wait_released(chatlog: &ChatLog) {
        for _ in 0..200 {
            if chatlog.len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client log handles were never released");
    }

    fn logged_messages(chatlog: &ChatLog, host: &str) -> Vec<String> {
        std::fs::read_to_string(chatlog.path_for(host))
            .unwrap()
            .lines()
            .map(|l| l.split_once("] ").unwrap().1.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let first = Server::bind_addr("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let taken = first.local_addr().unwrap();

        assert!(Server::bind_addr(taken, &config).is_err());
    }

    #[tokio::test]
    async fn test_commands_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, chatlog) = start(&test_config(dir.path())).await;
        let mut client = Client::connect(addr).await;

        assert_eq!(client.send("/echo hello world").await, "hello world\n");
        assert_eq!(client.send("HELLO").await, "Hi, there!\n");
        assert_eq!(client.send("").await, "Say something...\n");
        assert_eq!(client.send("  spaced out  ").await, "spaced out\n");

        let time = client.send("/time").await;
        let stamp = time.strip_suffix('\n').unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").is_ok());

        // Still open after /time.
        assert_eq!(client.send("ping").await, "ping\n");

        assert_eq!(
            client.send("bye").await,
            "So long, and thanks for all the fish!\n"
        );
        client.expect_closed().await;

        wait_released(&chatlog).await;
        assert_eq!(
            logged_messages(&chatlog, "127.0.0.1"),
            vec!["/echo hello world", "HELLO", "", "spaced out", "/time", "ping", "bye"]
        );
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _chatlog) = start(&test_config(dir.path())).await;
        let mut client = Client::connect(addr).await;

        assert_eq!(client.send("/quit").await, "Closing connection...\n");
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn test_long_message_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _chatlog) = start(&test_config(dir.path())).await;
        let mut client = Client::connect(addr).await;

        let long = "m".repeat(3000);
        assert_eq!(client.send(&long).await, "[!] Message truncated\n");
        assert_eq!(client.recv().await, format!("{}\n", "m".repeat(1024)));

        let exact = "e".repeat(1024);
        assert_eq!(client.send(&exact).await, format!("{}\n", exact));
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            idle_timeout: Duration::from_millis(300),
            ..test_config(dir.path())
        };
        let (addr, chatlog) = start(&config).await;
        let mut client = Client::connect(addr).await;

        // Activity keeps pushing the deadline out well past one window.
        for i in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(client.send(&format!("tick {}", i)).await, format!("tick {}\n", i));
        }

        let started = std::time::Instant::now();
        client.expect_closed().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        wait_released(&chatlog).await;
    }

    #[tokio::test]
    async fn test_concurrent_clients_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, chatlog) = start(&test_config(dir.path())).await;

        // The first client stalls mid-line; the second is still served.
        let mut slow = Client::connect(addr).await;
        slow.writer.write_all(b"half a li").await.unwrap();

        let mut fast = Client::connect(addr).await;
        assert_eq!(fast.send("first").await, "first\n");
        assert_eq!(fast.send("bye").await, "So long, and thanks for all the fish!\n");

        assert_eq!(slow.send("ne").await, "half a line\n");
        assert_eq!(slow.send("/quit").await, "Closing connection...\n");

        wait_released(&chatlog).await;
        assert_eq!(
            logged_messages(&chatlog, "127.0.0.1"),
            vec!["first", "bye", "half a line", "/quit"]
        );
    }

    #[tokio::test]
    async fn test_reconnect_appends_to_same_log() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, chatlog) = start(&test_config(dir.path())).await;

        let mut client = Client::connect(addr).await;
        client.send("first visit").await;
        client.send("bye").await;
        client.expect_closed().await;
        wait_released(&chatlog).await;

        let mut client = Client::connect(addr).await;
        client.send("second visit").await;
        client.send("/quit").await;
        client.expect_closed().await;
        wait_released(&chatlog).await;

        assert_eq!(
            logged_messages(&chatlog, "127.0.0.1"),
            vec!["first visit", "bye", "second visit", "/quit"]
        );
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_sibling_connection_keeps_log_open() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, chatlog) = start(&test_config(dir.path())).await;

        let mut a = Client::connect(addr).await;
        let mut b = Client::connect(addr).await;
        a.send("from a").await;
        b.send("from b").await;

        a.send("bye").await;
        a.expect_closed().await;

        // b's lease keeps the host entry alive.
        assert_eq!(b.send("b again").await, "b again\n");
        assert!(chatlog.is_open("127.0.0.1"));

        b.send("bye").await;
        b.expect_closed().await;
        wait_released(&chatlog).await;
        assert_eq!(
            logged_messages(&chatlog, "127.0.0.1"),
            vec!["from a", "from b", "bye", "b again", "bye"]
        );
    }
}
