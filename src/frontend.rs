// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::protocol::RequestParser;
use crate::queue::{pending, ResponseQueue};
use crate::router::ShardMap;
use crate::*;

use bytes::Bytes;
use session::Buf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

// upper bound on replies awaiting transmission for one client
const RESPONSE_QUEUE_DEPTH: usize = 1024;

/// Drives one accepted client connection: frames commands off the socket,
/// routes each to an upstream by key, and records it in the response queue
/// so the reply goes back in request order.
///
/// Any protocol error closes the connection, since the byte stream can no
/// longer be realigned to command boundaries. Upstream failures do not: the
/// affected requests complete with a synthetic error reply and the
/// connection stays usable.
pub(crate) async fn handle_client<S>(socket: S, shard_map: Arc<ShardMap>, buffer_size: usize)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(socket);

    let mut read_buffer = Buffer::new(buffer_size);
    let parser = RequestParser::new();

    let (queue, drain) = ResponseQueue::new(RESPONSE_QUEUE_DEPTH);

    // replies are written back by a separate task so that upstream work for
    // later commands proceeds while earlier replies are still pending
    let drain_task = tokio::spawn(async move {
        if let Err(e) = drain.drain(write_half).await {
            debug!("closing client connection: {e}");
        }
    });

    'session: loop {
        if do_read(&mut read_half, &mut read_buffer).await.is_err() {
            break 'session;
        }

        // dispatch every complete command in the buffer before reading again
        'requests: loop {
            let borrowed = read_buffer.borrow();

            match parser.parse(borrowed) {
                Ok(parsed) => {
                    let consumed = parsed.consumed();
                    let request = parsed.into_inner();

                    metrics::record_command(request.kind());

                    let raw = Bytes::copy_from_slice(&borrowed[..consumed]);
                    let (msg, slot) = pending(raw, request.kind(), request.key());

                    // recording before dispatch pins the reply order to the
                    // request order, no matter when completions fire
                    if queue.record_outgoing(slot).await.is_err() {
                        // the drain task is gone, the client write side failed
                        break 'session;
                    }

                    shard_map.route(request.key()).send_async(msg).await;

                    read_buffer.advance(consumed);
                }
                Err(e) if e.is_incomplete() => {
                    break 'requests;
                }
                Err(e) => {
                    REQUEST_PARSE_EX.increment();
                    debug!("closing client connection: {e}");
                    break 'session;
                }
            }
        }
    }

    // dropping the queue lets the drain finish writing whatever was already
    // recorded, then stop
    drop(queue);
    let _ = drain_task.await;
}
