// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Line transports for MCP connections.
//!
//! Both sides of every connection exchange newline-delimited JSON.  The
//! subprocess transport frames the child's stdin/stdout with a lines codec;
//! the in-process transport is a crossed pair of channels carrying the same
//! lines, so client code cannot tell the difference.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

/// Buffered line capacity between the connection and its forwarding tasks.
const CHANNEL_CAPACITY: usize = 64;

/// A bidirectional line stream to one MCP server.
///
/// `send` fails once the peer is gone; `recv` returns `None` on EOF.
/// Dropping the transport closes the outgoing side (EOF to a subprocess)
/// and, for subprocess transports, kills the child via `kill_on_drop`.
pub struct Transport {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<String>,
    /// Keeps the child handle alive; `None` for in-process transports.
    child: Option<Child>,
}

impl Transport {
    /// Spawn a subprocess MCP server and frame its stdio.
    ///
    /// stderr is piped and relayed to the log so a misbehaving server's
    /// diagnostics are not lost.
    pub fn spawn_subprocess(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning tool server '{command}'"))?;

        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;
        let stderr = child.stderr.take().context("child stderr unavailable")?;

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        // Writer task: serializes all outgoing frames onto the child's stdin.
        // Ends (closing stdin → EOF for the child) when the sender is dropped.
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, LinesCodec::new());
            while let Some(line) = out_rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    debug!(error = %e, "tool server stdin closed");
                    break;
                }
            }
        });

        // Reader task: forwards complete stdout lines until EOF.
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(item) = lines.next().await {
                match item {
                    Ok(line) => {
                        if in_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tool server stdout read error");
                        break;
                    }
                }
            }
        });

        // Relay stderr lines at warn level.
        let cmd_name = command.to_string();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                warn!(server = %cmd_name, "tool server stderr: {line}");
            }
        });

        Ok(Self {
            outgoing: out_tx,
            incoming: in_rx,
            child: Some(child),
        })
    }

    /// Create a crossed pair of in-process transports.
    ///
    /// Lines sent on one end arrive on the other; the first element is the
    /// client side, the second the server side.
    pub fn in_process_pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        (
            Self {
                outgoing: a_tx,
                incoming: b_rx,
                child: None,
            },
            Self {
                outgoing: b_tx,
                incoming: a_rx,
                child: None,
            },
        )
    }

    /// Send one frame.  Fails when the peer has gone away.
    pub async fn send(&self, line: String) -> anyhow::Result<()> {
        self.outgoing
            .send(line)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    /// Receive the next frame; `None` on EOF.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Split into an outgoing handle and the incoming receiver, for
    /// connections that run one writer and one reader task.
    pub fn split(self) -> (TransportSender, mpsc::Receiver<String>, Option<Child>) {
        (
            TransportSender {
                outgoing: self.outgoing,
            },
            self.incoming,
            self.child,
        )
    }
}

/// Cloneable outgoing half of a transport.
#[derive(Clone)]
pub struct TransportSender {
    outgoing: mpsc::Sender<String>,
}

impl TransportSender {
    pub async fn send(&self, line: String) -> anyhow::Result<()> {
        self.outgoing
            .send(line)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
