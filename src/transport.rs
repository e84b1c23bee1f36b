//! Socket transport.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    client::Endpoint,
    error::{Error, Result},
};

/// Trait object for an async stream usable for debug-server I/O.
pub trait AsyncDebugStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncDebugStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected debug-server stream.
///
/// Boxed so the rest of the crate does not care whether the underlying
/// connection is Unix or TCP.
pub type DebugStream = Box<dyn AsyncDebugStream>;

/// Dial a debug-server endpoint.
pub async fn connect(endpoint: Endpoint) -> Result<DebugStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let s = tokio::net::UnixStream::connect(&path)
                .await
                .map_err(Error::from)?;
            Ok(Box::new(s))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::protocol(
            "unix sockets are not supported on this platform",
        )),
        Endpoint::Tcp { host, port } => {
            let addr = (host.as_str(), port);
            let s = tokio::net::TcpStream::connect(addr)
                .await
                .map_err(Error::from)?;
            // Command latency matters more than throughput here.
            let _ = s.set_nodelay(true);
            Ok(Box::new(s))
        }
    }
}
