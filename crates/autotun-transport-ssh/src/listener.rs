//! Remote listener backed by an SSH `tcpip-forward` request

use crate::handler::{ForwardTable, Forwarded};
use crate::session::SharedHandle;
use async_trait::async_trait;
use autotun_transport::{BoxedStream, Endpoint, StreamListener, TransportError, TransportResult};
use russh::client::Msg;
use russh::Channel;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Yields connections accepted by the SSH server on a remote port
pub struct SshRemoteListener {
    endpoint: Endpoint,
    incoming: mpsc::UnboundedReceiver<Forwarded<Channel<Msg>>>,
    handle: SharedHandle,
    forwards: ForwardTable<Channel<Msg>>,
    closed: CancellationToken,
}

impl SshRemoteListener {
    pub(crate) fn new(
        endpoint: Endpoint,
        incoming: mpsc::UnboundedReceiver<Forwarded<Channel<Msg>>>,
        handle: SharedHandle,
        forwards: ForwardTable<Channel<Msg>>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            incoming,
            handle,
            forwards,
            closed,
        }
    }
}

impl fmt::Debug for SshRemoteListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshRemoteListener")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl StreamListener for SshRemoteListener {
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::SessionClosed),
            next = self.incoming.recv() => match next {
                Some((channel, originator)) => Ok((Box::new(channel.into_stream()), originator)),
                None => Err(TransportError::SessionClosed),
            },
        }
    }

    fn local_description(&self) -> String {
        self.endpoint.to_string()
    }
}

impl Drop for SshRemoteListener {
    fn drop(&mut self) {
        self.forwards.unregister(self.endpoint.port);

        if self.closed.is_cancelled() {
            return;
        }

        // Best effort: ask the server to stop listening, if a runtime is still around
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            let endpoint = self.endpoint.clone();
            runtime.spawn(async move {
                let result = handle
                    .lock()
                    .await
                    .cancel_tcpip_forward(endpoint.host.as_str(), u32::from(endpoint.port))
                    .await;
                if let Err(e) = result {
                    debug!(endpoint = %endpoint, error = %e, "cancel-tcpip-forward failed");
                }
            });
        }
    }
}
