//! Async client for the local control plane.
//!
//! [`IpcClient`] pairs requests with responses in order. Push frames that
//! arrive while a response is awaited are buffered and handed out by
//! [`IpcClient::next_push`]. [`IpcConnector`] adapts the client to the
//! reconnecting [`PushClient`](crate::bridge::reconnect::PushClient).

use std::collections::VecDeque;

use futures_util::StreamExt;
use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf, Stream};
use interprocess::local_socket::GenericNamespaced;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;
use tracing::debug;

use super::protocol::{IpcRequest, ServerLine};
use crate::bridge::reconnect::{ConnectFuture, PushConnection, PushConnector};
use crate::bridge::PushFrame;
use crate::codec::NdjsonCodec;
use crate::{AppError, Result};

/// One connection to the IPC server.
pub struct IpcClient {
    lines: FramedRead<RecvHalf, NdjsonCodec>,
    writer: SendHalf,
    pushes: VecDeque<PushFrame>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("buffered_pushes", &self.pushes.len())
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Connect to the server listening on `ipc_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the name is invalid or nothing listens.
    pub async fn connect(ipc_name: &str) -> Result<Self> {
        let name = ipc_name
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{ipc_name}': {err}")))?;
        let stream = Stream::connect(name)
            .await
            .map_err(|err| AppError::Ipc(format!("failed to connect to '{ipc_name}': {err}")))?;
        let (reader, writer) = stream.split();
        Ok(Self {
            lines: FramedRead::new(reader, NdjsonCodec::new()),
            writer,
            pushes: VecDeque::new(),
        })
    }

    /// Send `request` and wait for its response payload.
    ///
    /// # Errors
    ///
    /// The server's error mapped by
    /// [`IpcResponse::into_result`](super::protocol::IpcResponse::into_result),
    /// or `AppError::Ipc` if the connection drops first.
    pub async fn request(&mut self, request: &IpcRequest) -> Result<serde_json::Value> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Ipc(format!("failed to send request: {err}")))?;

        loop {
            match self.read_line().await? {
                Some(ServerLine::Response(response)) => return response.into_result(),
                Some(ServerLine::Push(envelope)) => self.pushes.push_back(envelope.push),
                None => {
                    return Err(AppError::Ipc(format!(
                        "connection closed before {} response",
                        request.verb()
                    )))
                }
            }
        }
    }

    /// Next pushed frame; `Ok(None)` once the server closed the connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` for unreadable lines or an unexpected
    /// response.
    pub async fn next_push(&mut self) -> Result<Option<PushFrame>> {
        if let Some(frame) = self.pushes.pop_front() {
            return Ok(Some(frame));
        }
        match self.read_line().await? {
            Some(ServerLine::Push(envelope)) => Ok(Some(envelope.push)),
            Some(ServerLine::Response(response)) => Err(AppError::Ipc(format!(
                "unexpected response without request: {response:?}"
            ))),
            None => Ok(None),
        }
    }

    async fn read_line(&mut self) -> Result<Option<ServerLine>> {
        loop {
            let Some(line) = self.lines.next().await else {
                return Ok(None);
            };
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str(&line)
                .map_err(|err| AppError::Ipc(format!("invalid server line: {err}")))?;
            return Ok(Some(parsed));
        }
    }
}

impl PushConnection for IpcClient {
    fn subscribe(&mut self, session_id: &str) -> ConnectFuture<'_, ()> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let request = IpcRequest::Subscribe {
                session_id: session_id.clone(),
                include_existing: None,
            };
            self.request(&request).await?;
            debug!(session_id, "subscribed over ipc");
            Ok(())
        })
    }

    fn unsubscribe(&mut self, session_id: &str) -> ConnectFuture<'_, ()> {
        let request = IpcRequest::Unsubscribe {
            session_id: session_id.to_owned(),
        };
        Box::pin(async move {
            self.request(&request).await?;
            Ok(())
        })
    }

    fn next_frame(&mut self) -> ConnectFuture<'_, Option<PushFrame>> {
        Box::pin(self.next_push())
    }
}

/// Opens [`IpcClient`] connections for a [`PushClient`](crate::bridge::reconnect::PushClient).
#[derive(Debug, Clone)]
pub struct IpcConnector {
    ipc_name: String,
}

impl IpcConnector {
    /// Connector for the server listening on `ipc_name`.
    #[must_use]
    pub fn new(ipc_name: impl Into<String>) -> Self {
        Self {
            ipc_name: ipc_name.into(),
        }
    }
}

impl PushConnector for IpcConnector {
    fn connect(&self) -> ConnectFuture<'_, Box<dyn PushConnection>> {
        Box::pin(async move {
            let client = IpcClient::connect(&self.ipc_name).await?;
            Ok(Box::new(client) as Box<dyn PushConnection>)
        })
    }
}
