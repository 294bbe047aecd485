use crate::protocol::{reply_len, CommandKind};
use crate::queue::PendingMessage;
use crate::*;

use bytes::Bytes;
use pelikan_net::TCP_RECV_BYTE;
use session::{Buf, BufMut, Buffer};
use std::borrow::{Borrow, BorrowMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::sleep;

// requests written ahead of their replies on one upstream connection
const INFLIGHT_DEPTH: usize = 128;

const RECONNECT_DELAY: Duration = Duration::from_millis(100);

pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Handle to one configured upstream memcached server. Cloneable; all clones
/// feed the same send queue, serviced by a single task that owns the
/// connection.
#[derive(Clone)]
pub struct UpstreamClient {
    endpoint: Arc<String>,
    sender: mpsc::Sender<PendingMessage>,
}

impl UpstreamClient {
    /// Creates the client and spawns its service task. The connection is
    /// established (and re-established) by the task, so this never blocks.
    pub fn connect(endpoint: &str, queue_depth: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_depth);

        tokio::spawn(service(endpoint.to_string(), receiver));

        Self {
            endpoint: Arc::new(endpoint.to_string()),
            sender,
        }
    }

    /// Enqueues one pending message. Requests are written to the upstream in
    /// enqueue order and replies matched first-in first-out. Suspends while
    /// the send queue is at its high water mark, which stalls the calling
    /// connection driver and, transitively, that client's socket reads.
    pub async fn send_async(&self, msg: PendingMessage) {
        if let Err(e) = self.sender.send(msg).await {
            e.0.fail();
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

async fn connect(endpoint: &str) -> std::io::Result<Box<dyn Stream>> {
    // same convention as listening endpoints: a colon means tcp, anything
    // else is a path to a unix socket
    if endpoint.contains(':') {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    } else {
        Ok(Box::new(UnixStream::connect(endpoint).await?))
    }
}

/// Owns one upstream for the lifetime of the process: connects, services the
/// send queue until the connection fails, then reconnects. While degraded,
/// queued messages complete with a synthetic error reply instead of waiting
/// for the upstream to come back.
async fn service(endpoint: String, mut queue: mpsc::Receiver<PendingMessage>) {
    loop {
        let stream = match connect(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("failed to connect to upstream {endpoint}: {e}");
                BACKEND_EX.increment();

                while let Ok(msg) = queue.try_recv() {
                    msg.fail();
                }

                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        BACKEND_CONNECT.increment();
        debug!("connected to upstream {endpoint}");

        let (read_half, write_half) = tokio::io::split(stream);
        let (inflight_tx, inflight_rx) = mpsc::channel(INFLIGHT_DEPTH);

        let reader = tokio::spawn(read_replies(read_half, inflight_rx));

        let shutdown = drive_writes(&mut queue, write_half, &inflight_tx).await;

        // the reader fails whatever it still holds once the connection is
        // gone and the in-flight channel is dropped
        drop(inflight_tx);
        let _ = reader.await;

        if shutdown {
            return;
        }

        // messages that queued up while the connection was failing
        while let Ok(msg) = queue.try_recv() {
            msg.fail();
        }
    }
}

/// Writes queued requests to the upstream in order, handing each to the
/// reader for reply matching. Returns true when the queue itself has closed
/// (process shutdown) rather than the connection.
async fn drive_writes(
    queue: &mut mpsc::Receiver<PendingMessage>,
    mut write_half: WriteHalf<Box<dyn Stream>>,
    inflight: &mpsc::Sender<PendingMessage>,
) -> bool {
    loop {
        tokio::select! {
            // the reader dropping its half means the connection failed
            _ = inflight.closed() => {
                return false;
            }
            message = queue.recv() => {
                match message {
                    Some(msg) => {
                        BACKEND_REQUEST.increment();

                        if let Err(e) = write_half.write_all(msg.request()).await {
                            debug!("upstream write error: {e}");
                            BACKEND_EX.increment();
                            msg.fail();
                            return false;
                        }

                        if let Err(e) = inflight.send(msg).await {
                            e.0.fail();
                            return false;
                        }
                    }
                    None => {
                        return true;
                    }
                }
            }
        }
    }
}

/// Reads replies off the connection and completes in-flight messages in the
/// order their requests were written, relying on memcache's first-in
/// first-out reply contract on a single connection.
async fn read_replies(
    mut read_half: ReadHalf<Box<dyn Stream>>,
    mut inflight: mpsc::Receiver<PendingMessage>,
) {
    let mut buffer = Buffer::new(INITIAL_BUFFER_SIZE);

    while let Some(msg) = inflight.recv().await {
        match read_reply(&mut read_half, &mut buffer, msg.kind()).await {
            Ok(response) => {
                msg.complete(response);
            }
            Err(e) => {
                debug!("upstream read error: {e}");
                BACKEND_EX.increment();
                msg.fail();

                // every request written behind this one died with the
                // connection
                inflight.close();
                while let Ok(msg) = inflight.try_recv() {
                    msg.fail();
                }

                return;
            }
        }
    }
}

/// Frames one reply for a command of the given kind, reading more bytes as
/// needed. The returned bytes are the verbatim upstream reply.
async fn read_reply(
    read_half: &mut ReadHalf<Box<dyn Stream>>,
    buffer: &mut Buffer,
    kind: CommandKind,
) -> ProxyResult<Bytes> {
    loop {
        match reply_len(kind, buffer.borrow()) {
            Ok(len) => {
                let response = Bytes::copy_from_slice(&buffer.borrow()[..len]);
                buffer.advance(len);
                return Ok(response);
            }
            Err(e) if e.is_incomplete() => {
                fill(read_half, buffer).await?;
            }
            Err(_) => {
                return Err(ProxyError::UpstreamProtocol);
            }
        }
    }
}

async fn fill(read_half: &mut ReadHalf<Box<dyn Stream>>, buffer: &mut Buffer) -> ProxyResult<()> {
    match read_half.read(buffer.borrow_mut()).await? {
        0 => {
            // zero length reads mean we got a HUP
            Err(ProxyError::Io(Error::from(ErrorKind::ConnectionReset)))
        }
        n => {
            TCP_RECV_BYTE.add(n as _);

            unsafe {
                buffer.advance_mut(n);
            }

            // if the buffer is low on space, we will grow the buffer
            if buffer.remaining_mut() * 2 < INITIAL_BUFFER_SIZE {
                buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, Duration};

    /// A scripted stand-in for a memcached server.
    ///
    /// Retrieval of key `k` returns `value_k`, except `miss` which returns a
    /// bare `END` and `quit` which drops the connection without replying.
    /// The key `slow` is answered after a delay, to let tests force reply
    /// reordering across upstreams. Storage commands consume their body and
    /// return `STORED`, deletes return `DELETED`. The returned counter is
    /// incremented once per request received.
    pub(crate) async fn mock_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        tokio::spawn(serve(socket, counter.clone()));
                    }
                    Err(_) => return,
                }
            }
        });

        (addr, requests)
    }

    async fn serve(socket: TcpStream, requests: Arc<AtomicUsize>) {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }

            requests.fetch_add(1, Ordering::Relaxed);

            let tokens: Vec<&str> = line.split_whitespace().collect();
            let verb = tokens.first().copied().unwrap_or("");
            let key = tokens.get(1).copied().unwrap_or("");

            let reply = match verb {
                "get" | "gets" => {
                    if key == "quit" {
                        return;
                    } else if key == "slow" {
                        sleep(Duration::from_millis(200)).await;
                        let value = format!("value_{key}");
                        format!("VALUE {key} 0 {}\r\n{value}\r\nEND\r\n", value.len())
                    } else if key == "miss" {
                        "END\r\n".to_string()
                    } else {
                        let value = format!("value_{key}");
                        format!("VALUE {key} 0 {}\r\n{value}\r\nEND\r\n", value.len())
                    }
                }
                "delete" => "DELETED\r\n".to_string(),
                "set" | "add" | "replace" | "append" | "prepend" => {
                    let len: usize = tokens.get(4).and_then(|t| t.parse().ok()).unwrap_or(0);
                    let mut body = vec![0u8; len + 2];
                    if reader.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    "STORED\r\n".to_string()
                }
                _ => "ERROR\r\n".to_string(),
            };

            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
