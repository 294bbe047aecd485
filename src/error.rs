// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use thiserror::Error;

pub type ProxyResult<T = ()> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream reply could not be framed")]
    UpstreamProtocol,
    #[error("client write error: {0}")]
    ClientWrite(#[source] std::io::Error),
}
