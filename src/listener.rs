// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::router::ShardMap;
use pelikan_net::{TCP_ACCEPT, TCP_CLOSE, TCP_CONN_CURR};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};

/// A bound listening endpoint. Endpoint strings containing a colon are tcp
/// `host:port` addresses, anything else is a path to a unix stream socket.
pub(crate) enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenerSocket {
    pub async fn bind(endpoint: &str) -> std::io::Result<Self> {
        if endpoint.contains(':') {
            Ok(Self::Tcp(TcpListener::bind(endpoint).await?))
        } else {
            // a stale socket file from a previous run would fail the bind
            let _ = std::fs::remove_file(endpoint);
            Ok(Self::Unix(UnixListener::bind(endpoint)?))
        }
    }
}

/// Accepts clients on one endpoint and spawns a task per connection. Each
/// endpoint carries its own shard map, so distinct endpoints can front
/// distinct upstream pools.
pub(crate) async fn listener(socket: ListenerSocket, shard_map: Arc<ShardMap>, buffer_size: usize) {
    loop {
        match &socket {
            ListenerSocket::Tcp(listener) => match listener.accept().await {
                Ok((stream, _)) => {
                    TCP_ACCEPT.increment();

                    let _ = stream.set_nodelay(true);
                    let shard_map = shard_map.clone();

                    // spawn a task for managing requests for the client
                    tokio::spawn(async move {
                        TCP_CONN_CURR.increment();

                        crate::frontend::handle_client(stream, shard_map, buffer_size).await;

                        TCP_CONN_CURR.decrement();
                        TCP_CLOSE.increment();
                    });
                }
                Err(e) => {
                    error!("error accepting client: {e}");
                }
            },
            ListenerSocket::Unix(listener) => match listener.accept().await {
                Ok((stream, _)) => {
                    let shard_map = shard_map.clone();

                    tokio::spawn(async move {
                        crate::frontend::handle_client(stream, shard_map, buffer_size).await;
                    });
                }
                Err(e) => {
                    error!("error accepting client: {e}");
                }
            },
        }
    }
}
