pub mod buffer;
pub mod config;
pub mod connection;
pub mod http;
pub mod io;
pub mod map;
pub mod message;
pub mod poll;
pub mod provider;
pub mod queue;
pub mod resolver;
pub mod task;
pub mod tls;
pub mod transaction;
#[cfg(target_os = "linux")]
pub mod uring;
pub mod worker;

pub use buffer::ByteBuffer;
pub use config::Config;
pub use connection::{ConnectionManager, TcpSettings};
pub use map::ShardedMap;
pub use message::{FailureCode, MessageResult, MessageState, OriginalMessage};
pub use provider::Provider;
pub use queue::RingQueue;
pub use transaction::Transaction;
pub use worker::{Stopper, WorkerGroup, WorkerHandle};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket creation failed")]
    SocketCreate(#[source] std::io::Error),
    #[error("could not resolve '{host}:{port}'")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to '{0}' timed out")]
    ConnectTimeout(String),
    #[error("kernel ring setup failed")]
    Ring(#[source] std::io::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error("invalid TLS server name '{0}'")]
    TlsServerName(String),
    #[error("could not load native root certificates")]
    TlsRoots(#[source] std::io::Error),
    #[error("fixed buffer cannot grow beyond its capacity of {capacity} bytes")]
    BufferFixed { capacity: usize },
    #[error("{0}")]
    HttpProtocol(&'static str),
    #[error("provider refused to build the request: {0}")]
    Provider(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
