use crate::models::Frame;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound side of one websocket connection.
///
/// Every frame for a connection goes through this channel and is written by
/// that connection's single writer task. Terminals hold a clone to know where
/// their output goes; two handles are the same socket iff their ids match.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame. Returns false once the connection is gone.
    pub fn send(&self, frame: &Frame) -> bool {
        self.tx.send(frame.to_json()).is_ok()
    }
}
