use crate::klog::{klog_1, response_status, Status};
use crate::protocol::CommandKind;
use crate::*;

use bytes::Bytes;
use pelikan_net::TCP_SEND_BYTE;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

/// Reply used when an upstream abandons a request without completing it.
pub(crate) const UPSTREAM_UNAVAILABLE: &[u8] = b"SERVER_ERROR upstream unavailable\r\n";

/// One request in flight to an upstream: the bytes to forward, the command
/// kind (which determines how the reply is framed), and the completion side
/// of the response slot waiting in the client's response queue.
pub struct PendingMessage {
    request: Bytes,
    kind: CommandKind,
    completion: oneshot::Sender<Bytes>,
}

impl PendingMessage {
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Fills the response and fires the completion. If the client is already
    /// gone the reply is dropped.
    pub fn complete(self, response: Bytes) {
        let _ = self.completion.send(response);
    }

    /// Completes with a synthetic error reply.
    pub fn fail(self) {
        self.complete(Bytes::from_static(UPSTREAM_UNAVAILABLE));
    }
}

/// The queue side of one in-flight request: awaited by the drain task in
/// record order.
pub struct ResponseSlot {
    kind: CommandKind,
    key: Box<[u8]>,
    completion: oneshot::Receiver<Bytes>,
}

#[cfg(test)]
impl ResponseSlot {
    pub(crate) async fn response(self) -> Bytes {
        self.completion
            .await
            .unwrap_or_else(|_| Bytes::from_static(UPSTREAM_UNAVAILABLE))
    }
}

/// Creates the two halves of one in-flight request: the message handed to an
/// upstream client and the slot recorded in the client's response queue.
pub fn pending(request: Bytes, kind: CommandKind, key: &[u8]) -> (PendingMessage, ResponseSlot) {
    let (tx, rx) = oneshot::channel();

    (
        PendingMessage {
            request,
            kind,
            completion: tx,
        },
        ResponseSlot {
            kind,
            key: key.into(),
            completion: rx,
        },
    )
}

/// Producer half of a per-client response queue. Slots recorded here are
/// drained back to the client socket strictly in record order, regardless of
/// the order their upstream completions fire in.
pub struct ResponseQueue {
    sender: mpsc::Sender<ResponseSlot>,
}

impl ResponseQueue {
    pub fn new(depth: usize) -> (Self, ResponseDrain) {
        let (sender, receiver) = mpsc::channel(depth);

        (Self { sender }, ResponseDrain { receiver })
    }

    /// Appends a slot to the tail of the queue. Fails only once the drain
    /// task has stopped, which means the client connection is closing.
    pub async fn record_outgoing(&self, slot: ResponseSlot) -> Result<(), ()> {
        self.sender.send(slot).await.map_err(|_| ())
    }
}

/// Consumer half of a per-client response queue, owned by the drain task.
pub struct ResponseDrain {
    receiver: mpsc::Receiver<ResponseSlot>,
}

impl ResponseDrain {
    /// Runs for the lifetime of the connection: awaits the head slot's
    /// completion, writes its reply to the client, pops, repeats. Returns
    /// when the queue producer is dropped and every recorded slot has been
    /// written, or with an error as soon as a client write fails.
    pub async fn drain<S: AsyncWrite + Unpin>(mut self, mut sink: S) -> ProxyResult {
        while let Some(slot) = self.receiver.recv().await {
            // a dropped completion means the upstream task abandoned the
            // request without filling the reply
            let response = match slot.completion.await {
                Ok(response) => response,
                Err(_) => Bytes::from_static(UPSTREAM_UNAVAILABLE),
            };

            let status = response_status(slot.kind, &response);
            if slot.kind.is_retrieval() {
                match status {
                    Status::Hit => GET_KEY_HIT.increment(),
                    Status::Miss => GET_KEY_MISS.increment(),
                    _ => 0,
                };
            }
            klog_1(slot.kind.verb(), &slot.key, status, response.len());

            SESSION_SEND.increment();
            SESSION_SEND_BYTE.add(response.len() as _);
            TCP_SEND_BYTE.add(response.len() as _);

            if let Err(e) = sink.write_all(&response).await {
                SESSION_SEND_EX.increment();
                return Err(ProxyError::ClientWrite(e));
            }
        }

        Ok(())
    }
}
