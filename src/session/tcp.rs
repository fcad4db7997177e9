//! Raw-socket TSP transport.
//!
//! Instruments with a LAN interface accept TSP commands on a raw TCP socket
//! (port 5025). Lines are newline terminated in both directions. There is no
//! out-of-band status byte on a raw socket, so [`TcpTransport`] queries
//! `*STB?` in band and keeps any output that was already waiting in a local
//! buffer so it is not mistaken for the status reply.

use super::{status_byte, syntax, Transport};
use crate::config::SessionConfig;
use crate::error::{TspError, TspResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Time allowed for output already in flight to arrive before a status query.
const PENDING_OUTPUT_WINDOW: Duration = Duration::from_millis(2);

/// TSP over a raw TCP socket.
pub struct TcpTransport {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
    pending: VecDeque<String>,
    // Bytes of a line cut short by a receive timeout.
    partial: Vec<u8>,
}

impl TcpTransport {
    /// Connects to `config.address`.
    pub async fn connect(config: &SessionConfig) -> TspResult<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = timeout(connect_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| TspError::Timeout {
                action: format!("connecting to {}", config.address),
                timeout: connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        info!(address = %config.address, "connected");
        Ok(Self {
            address: config.address.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
            io_timeout: config.io_timeout(),
            pending: VecDeque::new(),
            partial: Vec::new(),
        })
    }

    /// Receives one line; `None` when `limit` expires first.
    ///
    /// `read_until` keeps partially read bytes in `partial`, so a line split
    /// across two calls is not lost.
    async fn receive(&mut self, limit: Duration) -> TspResult<Option<String>> {
        match timeout(limit, self.reader.read_until(b'\n', &mut self.partial)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(TspError::Transport(format!(
                "connection to {} closed",
                self.address
            ))),
            Ok(Ok(_)) => {
                let bytes = std::mem::take(&mut self.partial);
                let line = String::from_utf8_lossy(&bytes);
                Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_line(&mut self, line: &str) -> TspResult<()> {
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line);
        frame.push('\n');
        timeout(self.io_timeout, self.writer.write_all(frame.as_bytes()))
            .await
            .map_err(|_| TspError::Timeout {
                action: format!("writing '{line}'"),
                timeout: self.io_timeout,
            })??;
        Ok(())
    }

    async fn read_line(&mut self) -> TspResult<String> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(line);
        }
        self.receive(self.io_timeout)
            .await?
            .ok_or_else(|| TspError::Timeout {
                action: "reading a reply".to_string(),
                timeout: self.io_timeout,
            })
    }

    async fn read_status_byte(&mut self) -> TspResult<u8> {
        while let Some(line) = self.receive(PENDING_OUTPUT_WINDOW).await? {
            self.pending.push_back(line);
        }
        self.write_line(syntax::STATUS_BYTE_QUERY).await?;
        let reply = self
            .receive(self.io_timeout)
            .await?
            .ok_or_else(|| TspError::Timeout {
                action: "reading the status byte".to_string(),
                timeout: self.io_timeout,
            })?;
        let value = reply
            .trim()
            .parse::<f64>()
            .map_err(|_| TspError::Parse {
                query: syntax::STATUS_BYTE_QUERY.to_string(),
                reply: reply.clone(),
            })?;
        let mut status = value as u8;
        if !self.pending.is_empty() {
            status |= status_byte::MESSAGE_AVAILABLE;
        }
        Ok(status)
    }

    async fn discard_unread_data(&mut self, limit: Duration) -> TspResult<usize> {
        let mut discarded = self.pending.len();
        self.pending.clear();
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive(remaining.max(PENDING_OUTPUT_WINDOW)).await? {
                Some(line) => {
                    debug!(line = %line, "discarding");
                    discarded += 1;
                }
                None => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(discarded)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}
