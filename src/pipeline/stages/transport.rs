//! The bottom stage: hands requests to the [`Transport`](crate::transport::Transport)
//! and owns every connection state transition.
//!
//! In-flight publishes and subscriptions are tracked so a disconnect, a lost
//! connection or shutdown can fail them instead of leaving callers waiting.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Credential,
    error::PipelineError,
    event::Event,
    operation::{OpId, OpKind, OpOutput, OpResult, Operation},
    pipeline::chain::{Stage, StageContext},
    state::{ConnectionState, Nucleus},
    transport::{ConnectArgs, TransportReply, TransportRequest},
};

type Pending = Arc<Mutex<HashMap<OpId, Operation>>>;

/// Bottom of the chain: drives the transport and owns connection state
/// transitions.
pub struct TransportStage {
    pending: Pending,
}

impl Default for TransportStage {
    fn default() -> Self {
        Self::new()
    }
}

fn connect_args(nucleus: &Nucleus) -> ConnectArgs {
    let config = nucleus.config();
    let credential = nucleus.credential();
    ConnectArgs {
        hostname: config.connect_hostname().to_string(),
        client_id: config.client_id(),
        username: config.username(),
        password: credential.password(),
        x509: match credential {
            Credential::X509(cert) => Some(cert.clone()),
            Credential::SasToken(_) => None,
        },
        keep_alive: config.keep_alive(),
        websockets: config.websockets,
        cipher: config.cipher.clone(),
        proxy: config.proxy.clone(),
        server_verification_cert: config.server_verification_cert.clone(),
    }
}

fn transition(nucleus: &Nucleus, next: ConnectionState) {
    if let Err(e) = nucleus.transition(next) {
        error!(error = %e, "Connection state machine out of step with transport");
    }
}

impl TransportStage {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn take_all(&self) -> Vec<Operation> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, op)| op)
            .collect()
    }

    fn fail_all(&self, error: PipelineError) {
        let ops = self.take_all();
        if !ops.is_empty() {
            debug!(count = ops.len(), error = %error, "Failing in-flight operations");
        }
        for op in ops {
            op.fail(error.clone());
        }
    }

    #[instrument(skip_all)]
    fn connect(&self, ctx: &StageContext, nucleus: Arc<Nucleus>, op: Operation) {
        if let Err(e) = nucleus.transition(ConnectionState::Connecting) {
            return op.fail(e);
        }
        let Some(transport) = ctx.transport() else {
            return op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        };
        info!(hostname = %nucleus.config().connect_hostname(), "Connecting");
        let up = ctx.clone();
        transport.submit(
            TransportRequest::Connect(connect_args(&nucleus)),
            Box::new(move |result| match result {
                Ok(_) => match nucleus.transition(ConnectionState::Connected) {
                    Ok(_) => {
                        up.send_event_up(Event::Connected);
                        op.complete_ok();
                    }
                    Err(e) => {
                        // The connection was lost or torn down while connecting.
                        warn!(error = %e, state = %nucleus.connection_state(), "Connect completed too late");
                        op.fail(PipelineError::ConnectionDropped(
                            "connection lost while connecting".into(),
                        ));
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Connect failed");
                    transition(&nucleus, ConnectionState::Disconnected);
                    op.fail(e);
                }
            }),
        );
    }

    #[instrument(skip_all)]
    fn disconnect(&self, ctx: &StageContext, nucleus: Arc<Nucleus>, op: Operation) {
        self.fail_all(PipelineError::OperationCancelled(
            "Explicit disconnect invoked".into(),
        ));
        if nucleus.connection_state() == ConnectionState::Disconnected {
            return op.complete_ok();
        }
        if let Err(e) = nucleus.transition(ConnectionState::Disconnecting) {
            return op.fail(e);
        }
        let Some(transport) = ctx.transport() else {
            transition(&nucleus, ConnectionState::Disconnected);
            return op.complete_ok();
        };
        info!("Disconnecting");
        let up = ctx.clone();
        transport.submit(
            TransportRequest::Disconnect,
            Box::new(move |result| {
                transition(&nucleus, ConnectionState::Disconnected);
                up.send_event_up(Event::Disconnected { cause: None });
                if let Err(e) = &result {
                    warn!(error = %e, "Transport reported an error while disconnecting");
                }
                op.complete(result.map(|_| OpOutput::Empty));
            }),
        );
    }

    /// Disconnects and reconnects so the transport presents the current token.
    #[instrument(skip_all)]
    fn reauthorize(&self, ctx: &StageContext, nucleus: Arc<Nucleus>, op: Operation) {
        if !nucleus.connected() {
            debug!("Not connected; new credential will be used on next connect");
            return op.complete_ok();
        }
        if let Err(e) = nucleus.transition(ConnectionState::Reauthorizing) {
            return op.fail(e);
        }
        let Some(transport) = ctx.transport() else {
            return op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        };
        info!("Re-authorizing connection");
        let up = ctx.clone();
        let reconnect_transport = Arc::clone(&transport);
        transport.submit(
            TransportRequest::Disconnect,
            Box::new(move |result| {
                if let Err(e) = result {
                    debug!(error = %e, "Disconnect before re-authorization failed; connecting anyway");
                }
                let args = connect_args(&nucleus);
                reconnect_transport.submit(
                    TransportRequest::Connect(args),
                    Box::new(move |result| match result {
                        Ok(_) => match nucleus.transition(ConnectionState::Connected) {
                            Ok(_) => {
                                up.send_event_up(Event::Connected);
                                op.complete_ok();
                            }
                            Err(e) => {
                                warn!(error = %e, "Re-authorization completed after the connection was lost");
                                op.fail(PipelineError::ConnectionDropped(
                                    "connection lost while re-authorizing".into(),
                                ));
                            }
                        },
                        Err(e) => {
                            transition(&nucleus, ConnectionState::Disconnected);
                            up.send_event_up(Event::Disconnected {
                                cause: Some(e.clone()),
                            });
                            op.fail(e);
                        }
                    }),
                );
            }),
        );
    }

    fn submit_tracked(&self, ctx: &StageContext, op: Operation, request: TransportRequest) {
        let Some(transport) = ctx.transport() else {
            return op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        };
        let id = op.id();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, op);
        let pending = Arc::clone(&self.pending);
        transport.submit(
            request,
            Box::new(move |result| {
                let op = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                match op {
                    Some(op) => op.complete(to_output(result)),
                    None => debug!(id = %id, "Completion for an operation no longer in flight"),
                }
            }),
        );
    }
}

fn to_output(result: Result<TransportReply, PipelineError>) -> OpResult {
    result.map(|reply| match reply {
        TransportReply::Done => OpOutput::Empty,
        TransportReply::Http { status_code, body } => OpOutput::Http { status_code, body },
    })
}

impl Stage for TransportStage {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        let Some(nucleus) = ctx.nucleus() else {
            return op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        };
        let request = match op.kind() {
            OpKind::Connect => return self.connect(ctx, nucleus, op),
            OpKind::Disconnect => return self.disconnect(ctx, nucleus, op),
            OpKind::Reauthorize => return self.reauthorize(ctx, nucleus, op),
            OpKind::HttpRequest {
                method,
                path,
                query,
                headers,
                body,
            } => {
                let request = TransportRequest::Http {
                    hostname: nucleus.config().connect_hostname().to_string(),
                    method: method.clone(),
                    path: path.clone(),
                    query: query.clone(),
                    headers: headers.clone(),
                    body: body.clone(),
                };
                let Some(transport) = ctx.transport() else {
                    return op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
                };
                return transport.submit(request, Box::new(move |result| op.complete(to_output(result))));
            }
            OpKind::Publish { topic, payload } => TransportRequest::Publish {
                topic: topic.clone(),
                payload: payload.clone(),
            },
            OpKind::Subscribe { topic } => TransportRequest::Subscribe {
                topic: topic.clone(),
            },
            OpKind::Unsubscribe { topic } => TransportRequest::Unsubscribe {
                topic: topic.clone(),
            },
            other => {
                let name = other.name();
                error!(op = name, "Operation reached the transport untranslated");
                return op.fail(PipelineError::Pipeline(format!(
                    "{name} is not supported by the transport"
                )));
            }
        };
        if !nucleus.connected() {
            debug!(op = %op.name(), state = %nucleus.connection_state(), "Rejecting operation while not connected");
            return op.fail(PipelineError::NotConnected);
        }
        self.submit_tracked(ctx, op, request);
    }

    fn handle_event(&self, ctx: &StageContext, event: Event) {
        let cause = match event {
            Event::Disconnected { cause: Some(cause) } => cause,
            other => return ctx.send_event_up(other),
        };
        let Some(nucleus) = ctx.nucleus() else {
            return;
        };
        match nucleus.connection_state() {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                debug!(cause = %cause, "Connection loss during disconnect ignored");
                return;
            }
            state => warn!(state = %state, cause = %cause, "Connection lost"),
        }
        self.fail_all(PipelineError::ConnectionDropped(cause.to_string()));
        transition(&nucleus, ConnectionState::Disconnected);
        if cause.is_credential() {
            ctx.send_event_up(Event::CredentialRejected(cause.clone()));
        }
        ctx.send_event_up(Event::Disconnected { cause: Some(cause) });
    }

    fn shutdown(&self, _ctx: &StageContext) {
        self.fail_all(PipelineError::OperationCancelled("pipeline is shut down".into()));
    }
}
