use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Block size for the sender→receiver splice.
const SPLICE_BLOCK: usize = 64 * 1024;

/// Terminal result of one bridged session, reported exactly once.
#[derive(Debug)]
pub enum BridgeOutcome {
    Completed { session_id: String },
    Failed { session_id: String, error: String },
}

/// First line sent by each data-plane connection.
#[derive(Debug, Deserialize)]
struct BridgeHello {
    session_id: String,
    role: String,
    user_id: String,
}

struct SenderHalf {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct ReceiverHalf {
    _reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

#[derive(Default)]
struct Slot {
    sender_id: String,
    receiver_id: String,
    sender: Option<SenderHalf>,
    receiver: Option<ReceiverHalf>,
    started: bool,
}

/// Dedicated TCP server that splices a file-session sender stream into the
/// receiver stream. Sessions are provisioned by the signaling service on
/// `file/accept`; both peers identify themselves with a one-line JSON
/// handshake before any payload bytes flow.
pub struct FileBridge {
    sessions: DashMap<String, Slot>,
    outcome_tx: mpsc::Sender<BridgeOutcome>,
}

impl FileBridge {
    pub fn new(outcome_tx: mpsc::Sender<BridgeOutcome>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            outcome_tx,
        })
    }

    /// Reserve a bridge slot for an accepted file session.
    pub fn prepare_session(&self, session_id: &str, sender_id: &str, receiver_id: &str) {
        self.sessions.insert(
            session_id.to_string(),
            Slot {
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                ..Slot::default()
            },
        );
        tracing::debug!("Prepared file session {session_id} from {sender_id} to {receiver_id}");
    }

    /// Drop every pending slot; paired transfers notice via closed sockets.
    pub fn shutdown(&self) {
        self.sessions.clear();
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_client(stream).await {
                            tracing::warn!("File transfer handshake failed from {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("File bridge accept failed: {e}");
                }
            }
        }
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let hello: BridgeHello = serde_json::from_str(line.trim_end()).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("Invalid handshake: {e}"))
        })?;

        let ready = {
            let Some(mut slot) = self.sessions.get_mut(&hello.session_id) else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Unknown session",
                ));
            };
            if slot.started {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "Session already bridged",
                ));
            }
            match hello.role.as_str() {
                "sender" => {
                    if hello.user_id != slot.sender_id {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "Sender mismatch",
                        ));
                    }
                    slot.sender = Some(SenderHalf {
                        reader,
                        writer: write_half,
                    });
                }
                "receiver" => {
                    if hello.user_id != slot.receiver_id {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "Receiver mismatch",
                        ));
                    }
                    slot.receiver = Some(ReceiverHalf {
                        _reader: reader.into_inner(),
                        writer: write_half,
                    });
                }
                other => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Invalid role '{other}'"),
                    ));
                }
            }
            tracing::debug!(
                "File session {} registered {} connection",
                hello.session_id,
                hello.role
            );

            if slot.sender.is_some() && slot.receiver.is_some() {
                slot.started = true;
                let sender = slot.sender.take();
                let receiver = slot.receiver.take();
                sender.zip(receiver)
            } else {
                None
            }
        };

        if let Some((sender, receiver)) = ready {
            let bridge = Arc::clone(&self);
            let session_id = hello.session_id.clone();
            tokio::spawn(async move {
                bridge.splice(session_id, sender, receiver).await;
            });
        }
        Ok(())
    }

    /// Copy sender bytes into the receiver socket until EOF, then report
    /// the outcome and tear the session down.
    async fn splice(&self, session_id: String, mut sender: SenderHalf, mut receiver: ReceiverHalf) {
        tracing::info!("Starting file bridge for session {session_id}");
        let mut buf = vec![0u8; SPLICE_BLOCK];
        let result: std::io::Result<()> = async {
            loop {
                let n = sender.reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                receiver.writer.write_all(&buf[..n]).await?;
            }
            receiver.writer.flush().await?;
            Ok(())
        }
        .await;

        let outcome = match result {
            Ok(()) => BridgeOutcome::Completed {
                session_id: session_id.clone(),
            },
            Err(e) => {
                tracing::error!("File bridge error for {session_id}: {e}");
                BridgeOutcome::Failed {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                }
            }
        };

        let _ = receiver.writer.shutdown().await;
        let _ = sender.writer.shutdown().await;
        self.sessions.remove(&session_id);

        if self.outcome_tx.send(outcome).await.is_err() {
            tracing::warn!("Bridge outcome for {session_id} dropped: channel closed");
        }
        tracing::info!("File session {session_id} closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn start_bridge() -> (Arc<FileBridge>, std::net::SocketAddr, mpsc::Receiver<BridgeOutcome>) {
        let (tx, rx) = mpsc::channel(8);
        let bridge = FileBridge::new(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&bridge).serve(listener));
        (bridge, addr, rx)
    }

    async fn connect(addr: std::net::SocketAddr, session: &str, role: &str, user: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = format!(
            "{}\n",
            serde_json::json!({"session_id": session, "role": role, "user_id": user})
        );
        stream.write_all(hello.as_bytes()).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn splices_bytes_and_reports_completion() {
        let (bridge, addr, mut outcomes) = start_bridge().await;
        bridge.prepare_session("s1", "alice", "bob");

        let mut receiver = connect(addr, "s1", "receiver", "bob").await;
        let mut sender = connect(addr, "s1", "sender", "alice").await;

        let payload = vec![7u8; 200_000];
        sender.write_all(&payload).await.unwrap();
        sender.shutdown().await.unwrap();

        let mut received = Vec::new();
        receiver.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        match outcomes.recv().await.unwrap() {
            BridgeOutcome::Completed { session_id } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_identity_mismatch() {
        let (bridge, addr, _outcomes) = start_bridge().await;
        bridge.prepare_session("s2", "alice", "bob");

        // Wrong user for the sender role: the server closes the socket.
        let mut stream = connect(addr, "s2", "sender", "mallory").await;
        let mut buf = Vec::new();
        let n = stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn rejects_unknown_session() {
        let (_bridge, addr, _outcomes) = start_bridge().await;
        let mut stream = connect(addr, "nope", "sender", "alice").await;
        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
