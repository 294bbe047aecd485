use crate::default_buffer_size;
use crate::PAGESIZE;
use std::net::AddrParseError;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use config::Admin;
use config::AdminConfig;
use config::Debug;
use config::DebugConfig;
use config::Klog;
use config::KlogConfig;
use serde::{Deserialize, Serialize};

use std::io::Read;

fn queue_depth() -> NonZeroUsize {
    NonZeroUsize::new(1024).expect("1024 is nonzero")
}

// struct definitions
#[derive(Clone, Serialize, Default, Deserialize, Debug)]
pub struct MemshardProxyConfig {
    // application modules
    #[serde(default)]
    admin: Admin,
    #[serde(default)]
    proxy: Proxy,
    #[serde(default)]
    listener: Vec<Listener>,
    #[serde(default)]
    debug: Debug,
    #[serde(default)]
    klog: Klog,
}

#[derive(Default, Clone, Copy, Serialize, Deserialize, Debug)]
pub struct Proxy {
    threads: Option<usize>,
}

// definitions
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Listener {
    /// `host:port` for tcp, otherwise a unix socket path
    endpoint: String,
    /// the memcached servers behind this endpoint, sharded by key
    upstreams: Vec<String>,
    /// per-upstream send queue bound; a full queue stalls client reads
    #[serde(default = "queue_depth")]
    queue_depth: NonZeroUsize,
    #[serde(default = "default_buffer_size")]
    buffer_size: NonZeroUsize,
}

// implementation
impl Listener {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_tcp(&self) -> bool {
        self.endpoint.contains(':')
    }

    /// Return the result of parsing a tcp endpoint
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.endpoint.parse()
    }

    pub fn upstreams(&self) -> &[String] {
        &self.upstreams
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.get()
    }

    pub fn buffer_size(&self) -> usize {
        // rounds the buffer size up to the next nearest multiple of the
        // pagesize
        std::cmp::max(1, self.buffer_size.get()).div_ceil(PAGESIZE) * PAGESIZE
    }
}

// implementation
impl MemshardProxyConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        match toml::from_str(&content) {
            Ok(t) => Ok(t),
            Err(e) => {
                eprintln!("{e}");
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Error parsing config",
                ))
            }
        }
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listener
    }

    pub fn threads(&self) -> Option<usize> {
        self.proxy.threads
    }
}

impl AdminConfig for MemshardProxyConfig {
    fn admin(&self) -> &Admin {
        &self.admin
    }
}

impl DebugConfig for MemshardProxyConfig {
    fn debug(&self) -> &Debug {
        &self.debug
    }
}

impl KlogConfig for MemshardProxyConfig {
    fn klog(&self) -> &Klog {
        &self.klog
    }
}
