// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate logger;

use ::config::AdminConfig;
use backtrace::Backtrace;
use clap::{Arg, Command};
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use logger::configure_logging;
use memshard_proxy::MemshardProxyConfig;
use metriken::*;
use pelikan_net::TCP_RECV_BYTE;
use protocol_admin::*;
use session::*;
use std::borrow::{Borrow, BorrowMut};
use std::io::{Error, ErrorKind};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;

use crate::error::{ProxyError, ProxyResult};
use crate::listener::ListenerSocket;
use crate::router::ShardMap;
use crate::upstream::UpstreamClient;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

const S: u64 = 1_000_000_000; // one second in nanoseconds
const US: u64 = 1_000; // one microsecond in nanoseconds

mod admin;
mod error;
mod frontend;
mod klog;
mod listener;
mod memshard_proxy;
mod metrics;
mod protocol;
mod queue;
mod router;
mod upstream;

pub use metrics::*;

// NOTES:
//
// This is a proxy which shards the memcache ASCII protocol across a pool of
// memcached servers. Clients speak ordinary memcache to one frontend
// endpoint; each request is dispatched to an upstream selected by hashing
// the key, and replies stream back in request order.

// Default for linux, should work well enough for the majority of platforms.
pub const PAGESIZE: usize = 4096;

// default size for the connection buffers
pub const INITIAL_BUFFER_SIZE: usize = 16 * KB;

pub const fn default_buffer_size() -> NonZeroUsize {
    NonZeroUsize::new(INITIAL_BUFFER_SIZE).expect("initial buffer size cannot be zero")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        error!("{}", s);
        println!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // parse command line options
    let matches = Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "A proxy that shards a limited subset of the memcache ASCII
            protocol across a pool of memcached servers. Each request is
            routed by a stable hash of its key and replies are returned to
            each client in the order its requests were received.

            The supported commands are limited to: get/gets/delete and the
            storage commands set/add/replace/append/prepend, one key per
            request.",
        )
        .arg(
            Arg::new("stats")
                .short('s')
                .long("stats")
                .help("List all metrics in stats")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("CONFIG")
                .help("Server configuration file")
                .action(clap::ArgAction::Set)
                .index(1),
        )
        .get_matches();

    // load config from file
    let config = if let Some(file) = matches.get_one::<String>("CONFIG") {
        match MemshardProxyConfig::load(file) {
            Ok(c) => c,
            Err(e) => {
                println!("{e}");
                std::process::exit(1);
            }
        }
    } else {
        Default::default()
    };

    // initialize logging
    let mut log = configure_logging(&config);

    info!("starting memshard-proxy v{}", env!("CARGO_PKG_VERSION"));

    // validate config parameters
    for listener in config.listeners() {
        let endpoint = listener.endpoint();

        if listener.is_tcp() {
            if let Err(e) = listener.socket_addr() {
                eprintln!("listen endpoint `{endpoint}` is not valid: {e}");
                std::process::exit(1);
            }
        } else if endpoint.is_empty() {
            eprintln!("listen endpoint must not be empty");
            std::process::exit(1);
        }

        if listener.upstreams().is_empty() {
            eprintln!("no upstreams specified for endpoint `{endpoint}`");
            std::process::exit(1);
        }

        for upstream in listener.upstreams() {
            if upstream.contains(':') {
                if let Err(e) = upstream.to_socket_addrs() {
                    eprintln!("upstream address `{upstream}` is not valid: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    // initialize metrics
    common::metrics::init();

    // output stats descriptions and exit if the `stats` option was provided
    if matches.get_flag("stats") {
        println!("{:<31} {:<15} DESCRIPTION", "NAME", "TYPE");

        let mut metrics = Vec::new();

        for metric in &metriken::metrics() {
            let any = match metric.as_any() {
                Some(any) => any,
                None => {
                    continue;
                }
            };

            if any.downcast_ref::<Counter>().is_some() {
                metrics.push(format!("{:<31} counter", metric.name()));
            } else if any.downcast_ref::<Gauge>().is_some() {
                metrics.push(format!("{:<31} gauge", metric.name()));
            } else if any.downcast_ref::<AtomicHistogram>().is_some()
                || any.downcast_ref::<RwLockHistogram>().is_some()
            {
                for (label, _) in metrics::PERCENTILES {
                    let name = format!("{}_{}", metric.name(), label);
                    metrics.push(format!("{name:<31} percentile"));
                }
            } else {
                continue;
            }
        }

        metrics.sort();
        for metric in metrics {
            println!("{metric}");
        }
        std::process::exit(0);
    }

    // initialize async runtime for the admin thread
    let admin_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .thread_name("memshard_admin")
        .build()
        .expect("failed to launch async runtime");

    let mut runtime = Builder::new_multi_thread();

    runtime.thread_name_fn(|| {
        static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
        let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
        format!("memshard_wrk_{id}")
    });

    if let Some(threads) = config.threads() {
        runtime.worker_threads(threads);
    }

    // spawn logging thread
    admin_runtime.spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let _ = log.flush();
        }
    });

    let runtime = runtime
        .enable_all()
        .build()
        .expect("failed to launch tokio runtime");

    runtime.block_on(spawn(config))
}

async fn spawn(config: MemshardProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let admin_addr = config
        .admin()
        .socket_addr()
        .expect("bad admin listen address");
    let admin_listener = TcpListener::bind(&admin_addr).await?;
    info!("starting proxy admin listener on: {}", admin_addr);

    if config.listeners().is_empty() {
        eprintln!("no listeners specified in the config");
        std::process::exit(1);
    }

    let mut frontends = Vec::new();

    for listener in config.listeners() {
        let endpoint = listener.endpoint().to_string();

        let mut upstreams = Vec::new();
        for upstream in listener.upstreams() {
            let client = UpstreamClient::connect(upstream, listener.queue_depth());
            debug!("upstream {} serving endpoint {}", client.endpoint(), endpoint);
            upstreams.push(client);
        }

        // each endpoint gets its own shard map over its own upstream pool
        let shard_map = Arc::new(ShardMap::new(upstreams));

        let socket = match ListenerSocket::bind(&endpoint).await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("could not bind listener on `{endpoint}`: {e}");
                std::process::exit(1);
            }
        };

        info!("starting proxy frontend listener on: {}", endpoint);

        let buffer_size = listener.buffer_size();
        frontends.push(tokio::spawn(async move {
            listener::listener(socket, shard_map, buffer_size).await;
        }));
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = admin::admin(admin_listener) => {}
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    // closing the listeners stops new connections; anything in flight is
    // abandoned when the process exits
    for frontend in &frontends {
        frontend.abort();
    }
    let _ = futures::future::join_all(frontends).await;

    Ok(())
}

async fn do_read<S: AsyncRead + Unpin>(
    socket: &mut S,
    buf: &mut Buffer,
) -> Result<NonZeroUsize, Error> {
    match socket.read(buf.borrow_mut()).await {
        Ok(0) => {
            SESSION_RECV.increment();
            // zero length reads mean we got a HUP. close it
            Err(Error::from(ErrorKind::ConnectionReset))
        }
        Ok(n) => {
            SESSION_RECV.increment();
            SESSION_RECV_BYTE.add(n as _);
            TCP_RECV_BYTE.add(n as _);

            // non-zero means we have some data, mark the buffer as
            // having additional content
            unsafe {
                buf.advance_mut(n);
            }

            // if the buffer is low on space, we will grow the
            // buffer
            if buf.remaining_mut() * 2 < INITIAL_BUFFER_SIZE {
                buf.reserve(INITIAL_BUFFER_SIZE);
            }

            // SAFETY: we have already checked that the number of bytes read was
            // greater than zero, so this unchecked conversion is safe
            Ok(unsafe { NonZeroUsize::new_unchecked(n) })
        }
        Err(e) => {
            SESSION_RECV.increment();
            SESSION_RECV_EX.increment();
            // we had some other error reading from the socket,
            // return an error so the connection can be closed
            Err(e)
        }
    }
}

common::metrics::test_no_duplicates!();
