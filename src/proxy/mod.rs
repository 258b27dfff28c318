pub mod client;
pub mod connset;
pub mod pump;
pub mod tls;

pub use client::{Client, ClientOptions};
pub use connset::{ConnHandle, ConnSet};

use std::io;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::ProxyError;
use crate::instance::InstanceName;

/// Any bidirectional byte stream the proxy can pump.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Boxed local (or fake) stream; closing is dropping.
pub type BoxedStream = Box<dyn Stream>;

/// A remote instance stream after the TLS handshake.
pub type RemoteStream = tokio_rustls::client::TlsStream<BoxedStream>;

/// An accepted local connection on its way from a listener to the broker.
pub struct Conn {
    pub instance: InstanceName,
    pub stream: BoxedStream,
}

/// Transport seam: how the broker reaches a remote address. Tests inject
/// fakes; production uses [`TcpDialer`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Default dialer: plain OS TCP.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

/// Process-wide default broker for the convenience [`dial`] entry point.
/// Library users embedding several brokers should ignore this and hold their
/// own [`Client`].
static DEFAULT_CLIENT: ArcSwapOption<Client> = ArcSwapOption::const_empty();

pub fn set_default_client(client: Client) {
    DEFAULT_CLIENT.store(Some(Arc::new(client)));
}

/// Dial an instance through the process-wide default broker.
pub async fn dial(instance: &str) -> Result<RemoteStream, ProxyError> {
    let Some(client) = DEFAULT_CLIENT.load_full() else {
        return Err(ProxyError::Internal(
            "no default broker configured".to_string(),
        ));
    };
    let name = InstanceName::parse(instance)?;
    client.dial(&name).await
}
