//! TLS connections for `serve_with_incoming`, using whatever server config
//! the credential store holds when each connection arrives.
//!
//! tonic's built-in server TLS freezes one config at startup. Here every
//! accepted socket asks the store for its current snapshot, so a rotated
//! certificate or CA is picked up by the next handshake without a restart.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use certwatch_tls::CredentialStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::{debug, error, info, warn};

/// Handshakes that take longer than this are dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const BACKLOG: usize = 64;

/// A server-side TLS stream accepted by [`TlsIncoming`].
pub struct TlsConn(TlsStream<TcpStream>);

impl TlsConn {
    pub const fn get_ref(&self) -> &TlsStream<TcpStream> {
        &self.0
    }
}

impl std::fmt::Debug for TlsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConn")
            .field("peer", &self.0.get_ref().0.peer_addr().ok())
            .finish()
    }
}

impl Connected for TlsConn {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.0.get_ref().0.connect_info()
    }
}

impl AsyncRead for TlsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.0.is_write_vectored()
    }
}

/// Accepts TCP connections and completes TLS handshakes in the background.
pub struct TlsIncoming;

impl TlsIncoming {
    /// Start accepting on `listener` until `cancel` fires.
    ///
    /// The returned stream yields only connections whose handshake
    /// succeeded; failed handshakes are logged and dropped.
    pub fn spawn(
        listener: TcpListener,
        store: Arc<CredentialStore>,
        cancel: CancellationToken,
    ) -> ReceiverStream<Result<TlsConn, io::Error>> {
        let (tx, rx) = mpsc::channel(BACKLOG);

        tokio::spawn(async move {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "Accepting TLS connections");
            }

            loop {
                let (stream, peer) = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("TLS accept loop stopped");
                        return;
                    }
                    () = tx.closed() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept TCP connection");
                            continue;
                        }
                    },
                };

                let snapshot = match store.server_config() {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!(error = %e, %peer, "No server config available, dropping connection");
                        continue;
                    }
                };

                let acceptor = TlsAcceptor::from(Arc::clone(snapshot.config()));
                let tx = tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls)) => {
                            debug!(%peer, generation = snapshot.generation(), "TLS handshake complete");
                            let _ = tx.send(Ok(TlsConn(tls))).await;
                        }
                        Ok(Err(e)) => warn!(%peer, error = %e, "TLS handshake failed"),
                        Err(_) => warn!(%peer, "TLS handshake timed out"),
                    }
                });
            }
        });

        ReceiverStream::new(rx)
    }
}
