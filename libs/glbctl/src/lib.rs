//! glbd control socket client.
//!
//! glbd exposes a line-oriented TCP control socket. Every [`GlbCtl`] is a
//! single session: connect, issue commands, and drop to close. Callers in
//! the controller open one session per operation and never pool them.

pub mod error;
pub mod protocol;

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

pub use error::{GlbCtlError, Result};
pub use protocol::{Node, RouterEntry};

/// Snapshot of the glbd router table.
#[derive(Debug, Clone, Default)]
pub struct RouterInfo {
    entries: HashMap<Node, RouterEntry>,
}

impl RouterInfo {
    pub fn router(&self) -> &HashMap<Node, RouterEntry> {
        &self.entries
    }

    pub fn into_router(self) -> HashMap<Node, RouterEntry> {
        self.entries
    }
}

/// An open control session.
pub struct GlbCtl {
    stream: BufReader<TcpStream>,
    addr: String,
}

impl GlbCtl {
    /// Connect to the control socket. `host` is resolved on every call.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| GlbCtlError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        debug!(addr = %addr, "Connected to glbd control socket");

        Ok(Self {
            stream: BufReader::new(stream),
            addr,
        })
    }

    /// Set the weight of a destination. `-1` removes it from the router.
    pub async fn update(&mut self, node: &Node, weight: i32) -> Result<()> {
        let command = protocol::encode_update(node, weight);
        self.send(&command).await?;

        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            return Err(GlbCtlError::UnexpectedEof);
        }

        debug!(addr = %self.addr, command = %command, reply = %reply.trim(), "glbd update");
        protocol::parse_reply(&reply)
    }

    /// Fetch the current router table.
    pub async fn get_info(&mut self) -> Result<RouterInfo> {
        self.send(protocol::GETINFO).await?;

        let mut text = String::new();
        let mut read_any = false;
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                break;
            }
            read_any = true;
            let done = line.trim_start().starts_with(protocol::SUMMARY_PREFIX);
            text.push_str(&line);
            if done {
                break;
            }
        }

        if !read_any {
            return Err(GlbCtlError::UnexpectedEof);
        }

        Ok(RouterInfo {
            entries: protocol::parse_router(&text),
        })
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve one connection, answering the first command line with `reply`.
    async fn fake_glbd(reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut command = String::new();
            socket.read_line(&mut command).await.unwrap();
            socket.get_mut().write_all(reply.as_bytes()).await.unwrap();
            command
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_update_sends_command_and_accepts_ok() {
        let (port, server) = fake_glbd("Ok\n").await;

        let mut ctl = GlbCtl::connect("127.0.0.1", port).await.unwrap();
        ctl.update(&Node::new("10.0.0.5", 8080), 0).await.unwrap();

        assert_eq!(server.await.unwrap(), "10.0.0.5:8080:0\n");
    }

    #[tokio::test]
    async fn test_update_unknown_destination() {
        let (port, _server) = fake_glbd("Error: no such destination\n").await;

        let mut ctl = GlbCtl::connect("127.0.0.1", port).await.unwrap();
        let err = ctl
            .update(&Node::new("10.0.0.5", 8080), -1)
            .await
            .unwrap_err();

        assert!(matches!(err, GlbCtlError::UnknownDestination(msg) if msg.contains("no such destination")));
    }

    #[tokio::test]
    async fn test_update_rejected_for_other_reasons() {
        let (port, _server) = fake_glbd("Error: -22 (Invalid argument)\n").await;

        let mut ctl = GlbCtl::connect("127.0.0.1", port).await.unwrap();
        let err = ctl
            .update(&Node::new("10.0.0.5", 8080), -1)
            .await
            .unwrap_err();

        assert!(matches!(err, GlbCtlError::Rejected(msg) if msg.contains("Invalid argument")));
    }

    #[tokio::test]
    async fn test_update_eof_before_reply() {
        let (port, _server) = fake_glbd("").await;

        let mut ctl = GlbCtl::connect("127.0.0.1", port).await.unwrap();
        let err = ctl.update(&Node::new("10.0.0.5", 8080), 1).await.unwrap_err();

        assert!(matches!(err, GlbCtlError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_get_info_reads_until_summary() {
        let (port, server) = fake_glbd(
            "Router:\n\
             ------------------------------------------------------\n\
             \x20       Address       :   weight   usage    map  conns\n\
             \x2010.0.0.5:8080        :    0.000   0.000    N/A      2\n\
             ------------------------------------------------------\n\
             Destinations: 1, total connections: 2 of 493 max\n",
        )
        .await;

        let mut ctl = GlbCtl::connect("127.0.0.1", port).await.unwrap();
        let info = ctl.get_info().await.unwrap();

        assert_eq!(server.await.unwrap(), "getinfo\n");
        let entry = info.router()[&Node::new("10.0.0.5", 8080)];
        assert_eq!(entry.weight, 0.0);
        assert_eq!(entry.connections, 2);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = GlbCtl::connect("127.0.0.1", port).await.err().unwrap();
        assert!(matches!(err, GlbCtlError::Connect { .. }));
    }
}
