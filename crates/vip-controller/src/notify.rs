//! keepalived notify-hook channel.
//!
//! keepalived runs `vip-controller notify` on every VRRP transition; that
//! client writes one JSON line to the controller's Unix socket, where the
//! listener forwards it to the sync worker's role channel.

use crate::types::RoleTransition;
use common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts notify-hook connections and forwards their transitions.
pub struct NotifyListener {
    socket_path: PathBuf,
    roles_tx: mpsc::Sender<RoleTransition>,
}

impl NotifyListener {
    pub fn new(socket_path: impl Into<PathBuf>, roles_tx: mpsc::Sender<RoleTransition>) -> Self {
        Self {
            socket_path: socket_path.into(),
            roles_tx,
        }
    }

    /// Bind the socket, replacing a stale one.
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(dir) = self.socket_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Notify listener started");
        Ok(listener)
    }

    /// Serve until cancelled.
    pub async fn serve(self, listener: UnixListener, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let tx = self.roles_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, tx).await {
                                warn!(error = %e, "Notify connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept notify connection"),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "Cannot remove notify socket");
        }
        info!("Notify listener stopped");
        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, tx: mpsc::Sender<RoleTransition>) -> Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RoleTransition>(line) {
            Ok(transition) => {
                debug!(
                    instance = %transition.instance,
                    state = %transition.state,
                    "Received role transition"
                );
                if tx.send(transition).await.is_err() {
                    return Err(Error::other("role channel closed"));
                }
            }
            Err(e) => warn!(error = %e, line = %line, "Failed to parse notify message"),
        }
    }
    Ok(())
}

/// Deliver one transition to a running controller.
pub async fn send_transition(socket_path: &Path, transition: &RoleTransition) -> Result<()> {
    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
        Error::other(format!("cannot connect to {}: {}", socket_path.display(), e))
    })?;
    let mut json = serde_json::to_string(transition)?;
    json.push('\n');
    stream.write_all(json.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VrrpState;

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let handle = tokio::spawn(handle_connection(server, tx));
        client
            .write_all(b"not json\n{\"kind\":\"INSTANCE\",\"instance\":\"vips\",\"state\":\"MASTER\",\"priority\":101}\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let t = rx.recv().await.unwrap();
        assert_eq!(t.state, VrrpState::Master);
        assert_eq!(t.priority, Some(101));
        handle.await.unwrap().unwrap();
    }
}
