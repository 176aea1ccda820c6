//! Local IPC server for `agent-conductor-ctl` and other local clients.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Each connection reads line-delimited
//! [`IpcRequest`]s and writes one [`IpcResponse`] per request. A `subscribe`
//! request additionally starts pushing `{"push": frame}` lines for that
//! session on the same connection; the subscribe response is always written
//! before the first pushed frame.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{CommandInput, IpcRequest, IpcResponse, PushEnvelope};
use crate::bridge::{PushFrame, Subscription};
use crate::codec::NdjsonCodec;
use crate::conductor::Conductor;
use crate::models::activity::ActivityFilter;
use crate::orchestrator::queue_executor::QueueRunOptions;
use crate::orchestrator::scheduler::RunOptions;
use crate::{AppError, Result};

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    conductor: Arc<Conductor>,
    ct: CancellationToken,
) -> Result<JoinHandle<()>> {
    let name = conductor.config().ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let conductor = Arc::clone(&conductor);
                                tokio::spawn(handle_connection(stream, conductor, ct.child_token()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

/// Forwarders for the sessions one connection follows.
#[derive(Default)]
struct ConnectionSubscriptions {
    active: HashMap<String, (u64, JoinHandle<()>)>,
}

impl ConnectionSubscriptions {
    async fn remove(&mut self, conductor: &Conductor, session_id: &str) -> bool {
        let Some((subscription_id, forwarder)) = self.active.remove(session_id) else {
            return false;
        };
        forwarder.abort();
        conductor
            .bridge()
            .unsubscribe(session_id, subscription_id)
            .await;
        true
    }

    /// Subscribe and start forwarding; the response goes out before any push.
    async fn add(
        &mut self,
        conductor: &Conductor,
        out: &mpsc::UnboundedSender<String>,
        session_id: String,
        include_existing: Option<bool>,
    ) {
        let subscription = match conductor
            .bridge()
            .subscribe(&session_id, include_existing)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                send_line(out, &IpcResponse::from_error(&err));
                return;
            }
        };
        self.remove(conductor, &session_id).await;
        send_line(out, &IpcResponse::success(json!({ "session_id": session_id })));
        let id = subscription.id();
        let forwarder = tokio::spawn(forward(subscription, out.clone()));
        debug!(session_id, subscription = id, "ipc subscription started");
        self.active.insert(session_id, (id, forwarder));
    }

    async fn clear(&mut self, conductor: &Conductor) {
        let sessions: Vec<String> = self.active.keys().cloned().collect();
        for session_id in sessions {
            self.remove(conductor, &session_id).await;
        }
    }
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    conductor: Arc<Conductor>,
    ct: CancellationToken,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut lines = FramedRead::new(reader, NdjsonCodec::new());

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(mut line) = out_rx.recv().await {
                line.push('\n');
                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    warn!(%err, "failed to write ipc line");
                    break;
                }
            }
        });

        let mut subscriptions = ConnectionSubscriptions::default();
        loop {
            let next = tokio::select! {
                () = ct.cancelled() => break,
                next = lines.next() => next,
            };
            let line = match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(AppError::Parse(msg))) => {
                    send_line(&out_tx, &IpcResponse::error(format!("invalid line: {msg}")));
                    continue;
                }
                Some(Err(err)) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<IpcRequest>(trimmed) {
                Ok(request) => request,
                Err(err) => {
                    send_line(&out_tx, &IpcResponse::error(format!("invalid json: {err}")));
                    continue;
                }
            };

            match request {
                IpcRequest::Subscribe {
                    session_id,
                    include_existing,
                } => {
                    subscriptions
                        .add(&conductor, &out_tx, session_id, include_existing)
                        .await;
                }
                IpcRequest::Unsubscribe { session_id } => {
                    let removed = subscriptions.remove(&conductor, &session_id).await;
                    send_line(
                        &out_tx,
                        &IpcResponse::success(
                            json!({ "session_id": session_id, "removed": removed }),
                        ),
                    );
                }
                other => {
                    let response = dispatch_command(&other, &conductor).await;
                    send_line(&out_tx, &response);
                }
            }
        }

        subscriptions.clear(&conductor).await;
        drop(out_tx);
        if let Err(err) = writer_task.await {
            warn!(%err, "ipc writer task failed");
        }
        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

fn send_line<T: serde::Serialize>(out: &mpsc::UnboundedSender<String>, value: &T) {
    let line = serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned());
    // A closed writer means the connection is going away.
    let _ = out.send(line);
}

/// Push every message of `subscription` until its close frame.
async fn forward(mut subscription: Subscription, out: mpsc::UnboundedSender<String>) {
    let session_id = subscription.session_id().to_owned();
    while let Some(message) = subscription.recv().await {
        let push = PushFrame::from_message(&session_id, &message);
        let closing = push.is_close();
        send_line(&out, &PushEnvelope { push });
        if closing || out.is_closed() {
            break;
        }
    }
}

/// Route a non-subscription command to the engine.
async fn dispatch_command(request: &IpcRequest, conductor: &Conductor) -> IpcResponse {
    let span = info_span!("ipc_command", command = request.verb());
    let result = execute(request, conductor).instrument(span).await;
    match result {
        Ok(data) => IpcResponse::success(data),
        Err(err) => {
            info!(command = request.verb(), %err, "ipc command rejected");
            IpcResponse::from_error(&err)
        }
    }
}

async fn execute(request: &IpcRequest, conductor: &Conductor) -> Result<serde_json::Value> {
    if let Some(value) = execute_group(request, conductor).await? {
        return Ok(value);
    }
    if let Some(value) = execute_queue(request, conductor).await? {
        return Ok(value);
    }
    execute_session(request, conductor).await
}

/// Group commands; `None` for any other request.
async fn execute_group(
    request: &IpcRequest,
    conductor: &Conductor,
) -> Result<Option<serde_json::Value>> {
    let groups = conductor.groups();
    let value = match request {
        IpcRequest::CreateGroup {
            name,
            max_concurrent,
            specs,
        } => serde_json::to_value(
            groups
                .create_group(name, *max_concurrent, specs.clone())
                .await?,
        )?,
        IpcRequest::AddSession { group_id, spec } => {
            serde_json::to_value(groups.add_session(group_id, spec.clone()).await?)?
        }
        IpcRequest::AddDependency {
            group_id,
            spec_id,
            depends_on,
        } => serde_json::to_value(groups.add_dependency(group_id, spec_id, depends_on).await?)?,
        IpcRequest::RunGroup {
            group_id,
            fail_fast,
        } => {
            let options = fail_fast.map_or_else(
                || groups.default_options(),
                |fail_fast| RunOptions { fail_fast },
            );
            serde_json::to_value(groups.run(group_id, options).await?)?
        }
        IpcRequest::PauseGroup { group_id } => serde_json::to_value(groups.pause(group_id).await?)?,
        IpcRequest::ResumeGroup { group_id } => {
            serde_json::to_value(groups.resume(group_id).await?)?
        }
        IpcRequest::DeleteGroup { group_id } => {
            serde_json::to_value(conductor.delete_group(group_id).await?)?
        }
        IpcRequest::GetGroup { group_id } => serde_json::to_value(groups.get(group_id).await?)?,
        IpcRequest::ListGroups { status } => {
            json!({ "groups": groups.list(*status).await })
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Queue commands; `None` for any other request.
async fn execute_queue(
    request: &IpcRequest,
    conductor: &Conductor,
) -> Result<Option<serde_json::Value>> {
    let queues = conductor.queues();
    let value = match request {
        IpcRequest::CreateQueue {
            name,
            project_path,
            commands,
        } => {
            let commands = commands.iter().cloned().map(CommandInput::into_command).collect();
            serde_json::to_value(queues.create_queue(name, project_path, commands).await?)?
        }
        IpcRequest::AddCommand { queue_id, input } => serde_json::to_value(
            queues
                .add_command(queue_id, input.clone().into_command())
                .await?,
        )?,
        IpcRequest::UpdateCommand {
            queue_id,
            command_id,
            edit,
        } => serde_json::to_value(
            queues
                .update_command(queue_id, command_id, edit.clone())
                .await?,
        )?,
        IpcRequest::RemoveCommand {
            queue_id,
            command_id,
        } => serde_json::to_value(queues.remove_command(queue_id, command_id).await?)?,
        IpcRequest::RunQueue {
            queue_id,
            stop_on_failure,
        } => {
            let options = stop_on_failure.map_or_else(
                || queues.default_options(),
                |stop_on_failure| QueueRunOptions { stop_on_failure },
            );
            serde_json::to_value(queues.run(queue_id, options).await?)?
        }
        IpcRequest::PauseQueue { queue_id } => serde_json::to_value(queues.pause(queue_id).await?)?,
        IpcRequest::ResumeQueue { queue_id } => {
            serde_json::to_value(queues.resume(queue_id).await?)?
        }
        IpcRequest::StopQueue { queue_id } => serde_json::to_value(queues.stop(queue_id).await?)?,
        IpcRequest::DeleteQueue { queue_id } => {
            serde_json::to_value(conductor.delete_queue(queue_id).await?)?
        }
        IpcRequest::GetQueue { queue_id } => serde_json::to_value(queues.get(queue_id).await?)?,
        IpcRequest::ListQueues { status } => {
            json!({ "queues": queues.list(*status).await })
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Session activity queries. Subscriptions only work on a streaming
/// connection, where `handle_connection` intercepts them.
async fn execute_session(
    request: &IpcRequest,
    conductor: &Conductor,
) -> Result<serde_json::Value> {
    match request {
        IpcRequest::Activity {
            status,
            project_path,
        } => {
            let filter = ActivityFilter {
                status: *status,
                project_path: project_path.clone(),
            };
            Ok(json!({ "sessions": conductor.tracker().list(&filter).await }))
        }
        other => Err(AppError::Ipc(format!(
            "{} is only valid on a streaming connection",
            other.verb()
        ))),
    }
}
