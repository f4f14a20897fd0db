//! Requestor side: propose an association, run queued requests, release.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use dicom::object::InMemDicomObject;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::association::{AssociationEvent, InboundMessage, Role};
use crate::association_error::AssociationError;
use crate::command::{Command, CommandField, Status};
use crate::connection::Connection;
use crate::message::Message;
use crate::pdu::{
    APPLICATION_CONTEXT_NAME, AbortReason, AbortSource, AssociationAC, AssociationRQ,
    DEFAULT_MAX_PDU, PROTOCOL_VERSION, Pdu, PresentationContextProposed, RejectResult,
    RejectSource, RoleSelection, UserIdentity, UserIdentityType, UserVariableItem,
};
use crate::statistics::{Statistics, StatisticsSink};
use crate::uids::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME, transfer_syntax};

/// Presentation context ids are odd, so at most this many fit in one association.
const MAX_PRESENTATION_CONTEXTS: usize = 128;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// Largest P-DATA-TF body we accept. 0 means unlimited.
    pub max_pdu_length: u32,
    /// How long to wait for the connection and the association response.
    pub association_timeout: Duration,
    /// How long to wait for any PDU once established.
    pub idle_timeout: Duration,
    pub user_identity: Option<UserIdentity>,
    /// Proposed for every presentation context.
    pub transfer_syntaxes: Vec<String>,
    /// SOP classes for which we offer the SCP role, e.g. storage classes for C-GET.
    pub scp_role_classes: Vec<String>,
    pub statistics: Arc<dyn StatisticsSink>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            max_pdu_length: DEFAULT_MAX_PDU,
            association_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            user_identity: None,
            transfer_syntaxes: vec![
                transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ],
            scp_role_classes: Vec::new(),
            statistics: Arc::new(Statistics::default()),
        }
    }
}

impl ClientOptions {
    pub fn new(calling_ae_title: impl Into<String>, called_ae_title: impl Into<String>) -> Self {
        Self {
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            ..Default::default()
        }
    }

    pub fn with_username_passcode(
        mut self,
        username: &str,
        passcode: &str,
        positive_response_requested: bool,
    ) -> Self {
        self.user_identity = Some(UserIdentity {
            identity_type: UserIdentityType::UsernamePasscode,
            positive_response_requested,
            primary_field: username.as_bytes().to_vec(),
            secondary_field: passcode.as_bytes().to_vec(),
        });
        self
    }

    pub fn with_scp_role(mut self, sop_class_uid: impl Into<String>) -> Self {
        self.scp_role_classes.push(sop_class_uid.into());
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsSink>) -> Self {
        self.statistics = statistics;
        self
    }
}

/// What happened to the association, in order. [ClientEvent::Closed] always comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Accepted(AssociationAC),
    Rejected {
        result: RejectResult,
        source: RejectSource,
    },
    Released,
    Aborted {
        source: AbortSource,
        reason: AbortReason,
    },
    Closed,
    /// No presentation context was accepted for the request's SOP class, or it was invalid.
    RequestSkipped { sop_class_uid: Option<String> },
}

/// Answers requests the peer sends us while the association is up.
///
/// Hooks run synchronously on the association task. An error is answered with a
/// processing failure.
pub trait ClientHooks: Send + Sync {
    fn on_n_event_report(
        &self,
        request: &Command,
        _event_information: Option<InMemDicomObject>,
    ) -> anyhow::Result<Message> {
        success(request)
    }

    fn on_c_store(&self, request: &Command, _dataset: InMemDicomObject) -> anyhow::Result<Message> {
        success(request)
    }

    /// Any other request.
    fn on_request(
        &self,
        request: &Command,
        _dataset: Option<InMemDicomObject>,
    ) -> anyhow::Result<Message> {
        Message::response_to(request, Status::UNRECOGNIZED_OPERATION, None)
            .with_context(|| format!("{} has no response", request.command_field))
    }
}

fn success(request: &Command) -> anyhow::Result<Message> {
    Message::response_to(request, Status::SUCCESS, None)
        .with_context(|| format!("{} has no response", request.command_field))
}

#[derive(Debug, Default)]
pub struct DefaultClientHooks;

impl ClientHooks for DefaultClientHooks {}

/// Responses to one request, ending after the final one.
#[derive(Debug)]
pub struct RequestHandle {
    responses: UnboundedReceiver<Message>,
    cancel: UnboundedSender<()>,
}

impl RequestHandle {
    pub async fn next_response(&mut self) -> Option<Message> {
        self.responses.recv().await
    }

    /// Wait for every response. Empty when the request was never sent.
    pub async fn responses(mut self) -> Vec<Message> {
        let mut responses = Vec::new();
        while let Some(response) = self.responses.recv().await {
            responses.push(response);
        }
        responses
    }

    /// Ask the peer to stop with a C-CANCEL. Has no effect once the operation finished.
    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }
}

impl Stream for RequestHandle {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.responses.poll_recv(cx)
    }
}

struct QueuedRequest {
    message: Message,
    responses: UnboundedSender<Message>,
    cancel: UnboundedReceiver<()>,
}

/// A request on the wire, waiting for its final response.
struct PendingOperation {
    presentation_context_id: u8,
    responses: UnboundedSender<Message>,
    cancel: UnboundedReceiver<()>,
    cancel_sent: bool,
}

enum Flow {
    Continue,
    /// The association is over.
    Ended,
}

/// Runs requests against one SCP over one association.
///
/// Requests are sent one at a time in the order they were added. A request goes out
/// once the final response to the previous one has arrived.
pub struct Client {
    options: ClientOptions,
    requests: Vec<QueuedRequest>,
    events: Option<UnboundedSender<ClientEvent>>,
    hooks: Arc<dyn ClientHooks>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            requests: Vec::new(),
            events: None,
            hooks: Arc::new(DefaultClientHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ClientHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Queue a request. Its message ID is assigned when it is sent.
    pub fn add_request(&mut self, message: Message) -> RequestHandle {
        let (responses_tx, responses_rx) = unbounded_channel();
        let (cancel_tx, cancel_rx) = unbounded_channel();
        self.requests.push(QueuedRequest {
            message,
            responses: responses_tx,
            cancel: cancel_rx,
        });
        RequestHandle {
            responses: responses_rx,
            cancel: cancel_tx,
        }
    }

    /// Receive [ClientEvent]s. Only the last subscriber gets them.
    pub fn subscribe(&mut self) -> UnboundedReceiver<ClientEvent> {
        let (tx, rx) = unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Connect over TCP and run every queued request.
    ///
    /// Rejection and aborts by the peer are reported as events, not errors.
    pub async fn send<A: ToSocketAddrs>(self, address: A) -> Result<(), AssociationError> {
        let timeout = self.options.association_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.emit(ClientEvent::Closed);
                return Err(e.into());
            }
            Err(_) => {
                self.emit(ClientEvent::Closed);
                return Err(AssociationError::Timeout("TCP connection"));
            }
        };
        stream.set_nodelay(true)?;
        self.send_over(stream).await
    }

    /// Like [Client::send], over an already connected stream.
    pub async fn send_over<S: AsyncRead + AsyncWrite + Unpin>(
        mut self,
        stream: S,
    ) -> Result<(), AssociationError> {
        let result = self.run(stream).await;
        match &result {
            Err(AssociationError::Timeout(_)) => self.emit(ClientEvent::Aborted {
                source: AbortSource::ServiceProvider,
                reason: AbortReason::NotSpecified,
            }),
            Err(AssociationError::Protocol(violation)) => self.emit(ClientEvent::Aborted {
                source: AbortSource::ServiceProvider,
                reason: violation.reason,
            }),
            _ => {}
        }
        self.emit(ClientEvent::Closed);
        result
    }

    async fn run<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: S,
    ) -> Result<(), AssociationError> {
        let mut connection = Connection::new(
            stream,
            Role::Requestor,
            self.options.max_pdu_length,
            false,
            Arc::clone(&self.options.statistics),
        );
        let rq = self.association_rq();
        tracing::info!(
            calling_ae_title = %rq.calling_ae_title,
            called_ae_title = %rq.called_ae_title,
            presentation_contexts = rq.presentation_contexts.len(),
            "requesting association"
        );
        connection.send_pdu(&Pdu::AssociationRQ(rq)).await?;

        match connection
            .next_event(self.options.association_timeout, "association response")
            .await?
        {
            Some(AssociationEvent::Accepted(ac)) => {
                tracing::info!(
                    max_pdu_length = connection.association().max_pdu_length(),
                    "association accepted"
                );
                self.emit(ClientEvent::Accepted(ac));
            }
            Some(AssociationEvent::Rejected(rj)) => {
                tracing::info!("association rejected: {rj}");
                self.emit(ClientEvent::Rejected {
                    result: rj.result,
                    source: rj.source,
                });
                connection.close().await;
                return Ok(());
            }
            Some(AssociationEvent::Aborted { source, reason }) => {
                tracing::info!(?source, ?reason, "association aborted by peer");
                self.emit(ClientEvent::Aborted { source, reason });
                return Ok(());
            }
            _ => return Err(AssociationError::ConnectionClosed),
        }

        let mut next_message_id: u16 = 1;
        for request in std::mem::take(&mut self.requests) {
            let QueuedRequest {
                mut message,
                responses,
                cancel,
            } = request;
            let sop_class_uid = message.command.sop_class_uid().map(str::to_string);
            let context = sop_class_uid
                .as_deref()
                .and_then(|uid| connection.association().accepted_context_for(uid))
                .map(|pc| pc.id);
            let Some(presentation_context_id) = context else {
                tracing::warn!(
                    command = %message.command.command_field,
                    sop_class_uid = ?sop_class_uid,
                    "no accepted presentation context, skipping request"
                );
                self.emit(ClientEvent::RequestSkipped { sop_class_uid });
                continue;
            };
            message.command.message_id = Some(next_message_id);
            message.command.has_dataset = message.dataset.is_some();
            if let Err(e) = message.command.validate() {
                tracing::warn!("skipping invalid request: {e}");
                self.emit(ClientEvent::RequestSkipped { sop_class_uid });
                continue;
            }
            connection
                .send_message(presentation_context_id, &message)
                .await?;
            let mut pending = HashMap::from([(
                next_message_id,
                PendingOperation {
                    presentation_context_id,
                    responses,
                    cancel,
                    cancel_sent: false,
                },
            )]);
            next_message_id = next_message_id.checked_add(1).unwrap_or(1);
            if let Flow::Ended = self.await_responses(&mut connection, &mut pending).await? {
                return Ok(());
            }
        }

        tracing::debug!("requesting release");
        connection.send_pdu(&Pdu::ReleaseRQ).await?;
        loop {
            match connection
                .next_event(self.options.idle_timeout, "release response")
                .await?
            {
                Some(AssociationEvent::Released) => {
                    tracing::info!("association released");
                    self.emit(ClientEvent::Released);
                    break;
                }
                Some(AssociationEvent::Aborted { source, reason }) => {
                    self.emit(ClientEvent::Aborted { source, reason });
                    return Ok(());
                }
                Some(AssociationEvent::Message(inbound)) => {
                    tracing::warn!(
                        command = %inbound.command.command_field,
                        "ignoring message received after release request"
                    );
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
        connection.close().await;
        Ok(())
    }

    /// Deliver responses until no operation is outstanding.
    async fn await_responses<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        connection: &mut Connection<S>,
        pending: &mut HashMap<u16, PendingOperation>,
    ) -> Result<Flow, AssociationError> {
        while !pending.is_empty() {
            let Some(event) = connection.pop_event() else {
                let received = {
                    let cancellation = pending.iter_mut().find(|(_, op)| !op.cancel_sent);
                    match cancellation {
                        Some((&message_id, operation)) => {
                            tokio::select! {
                                Some(()) = operation.cancel.recv() => {
                                    operation.cancel_sent = true;
                                    let pc = operation.presentation_context_id;
                                    tracing::debug!(message_id, "cancelling");
                                    connection.send_message(pc, &Message::c_cancel(message_id)).await?;
                                    continue;
                                }
                                received = connection.receive(self.options.idle_timeout, "a response") => received,
                            }
                        }
                        None => {
                            connection
                                .receive(self.options.idle_timeout, "a response")
                                .await
                        }
                    }
                };
                if !connection.process(received).await? {
                    return Ok(Flow::Ended);
                }
                continue;
            };
            match event {
                AssociationEvent::Message(inbound) => {
                    self.on_message(connection, pending, inbound).await?;
                }
                AssociationEvent::ReleaseRequested => {
                    tracing::info!("peer released the association with operations outstanding");
                    connection.send_pdu(&Pdu::ReleaseRP).await?;
                    self.emit(ClientEvent::Released);
                    connection.close().await;
                    return Ok(Flow::Ended);
                }
                AssociationEvent::Aborted { source, reason } => {
                    tracing::info!(?source, ?reason, "association aborted by peer");
                    self.emit(ClientEvent::Aborted { source, reason });
                    return Ok(Flow::Ended);
                }
                _ => {}
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_message<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        connection: &mut Connection<S>,
        pending: &mut HashMap<u16, PendingOperation>,
        inbound: InboundMessage,
    ) -> Result<(), AssociationError> {
        let InboundMessage {
            presentation_context_id,
            command,
            dataset,
            ..
        } = inbound;
        let dataset = match dataset {
            Some(bytes) => match connection.read_dataset(presentation_context_id, &bytes) {
                Ok(dataset) => Some(dataset),
                Err(e) => {
                    tracing::warn!(command = %command.command_field, "could not read data set: {e:?}");
                    if !command.command_field.is_response() {
                        return connection
                            .refuse(
                                presentation_context_id,
                                &command,
                                Status::CANNOT_UNDERSTAND,
                                &e.to_string(),
                            )
                            .await;
                    }
                    None
                }
            },
            None => None,
        };

        if command.command_field.is_response() {
            let Some(message_id) = command.message_id_being_responded_to else {
                tracing::warn!(command = %command.command_field, "response without message ID, dropping");
                return Ok(());
            };
            let Some(operation) = pending.get(&message_id) else {
                tracing::warn!(message_id, "response to unknown message ID, dropping");
                return Ok(());
            };
            let status = command.status;
            tracing::debug!(message_id, status = ?status, "received response");
            let _ = operation.responses.send(Message { command, dataset });
            if status.is_none_or(Status::is_terminal) {
                pending.remove(&message_id);
            }
            return Ok(());
        }

        tracing::debug!(command = %command.command_field, "received request from peer");
        if let Err(e) = command.validate() {
            return connection
                .refuse(
                    presentation_context_id,
                    &command,
                    Status::CANNOT_UNDERSTAND,
                    &e.to_string(),
                )
                .await;
        }
        let result = match command.command_field {
            CommandField::NEventReportRq => self.hooks.on_n_event_report(&command, dataset),
            CommandField::CStoreRq => self
                .hooks
                .on_c_store(&command, dataset.unwrap_or_else(InMemDicomObject::new_empty)),
            CommandField::CCancelRq => return Ok(()),
            _ => self.hooks.on_request(&command, dataset),
        };
        let response = match result {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(command = %command.command_field, "{e:?}");
                Message::failure_to(&command, Status::PROCESSING_FAILURE, &e.to_string())
            }
        };
        if let Some(response) = response {
            connection
                .send_message(presentation_context_id, &response)
                .await?;
        }
        Ok(())
    }

    fn association_rq(&self) -> AssociationRQ {
        let mut abstract_syntaxes: Vec<&str> = Vec::new();
        let requested = self
            .requests
            .iter()
            .filter_map(|r| r.message.command.sop_class_uid());
        let scp_roles = self.options.scp_role_classes.iter().map(String::as_str);
        for uid in requested.chain(scp_roles) {
            if !abstract_syntaxes.contains(&uid) {
                abstract_syntaxes.push(uid);
            }
        }
        if abstract_syntaxes.len() > MAX_PRESENTATION_CONTEXTS {
            tracing::warn!(
                "{} abstract syntaxes requested, only the first {MAX_PRESENTATION_CONTEXTS} are proposed",
                abstract_syntaxes.len()
            );
        }
        let presentation_contexts = abstract_syntaxes
            .iter()
            .take(MAX_PRESENTATION_CONTEXTS)
            .zip((1..=u8::MAX).step_by(2))
            .map(|(uid, id)| PresentationContextProposed {
                id,
                abstract_syntax: uid.to_string(),
                transfer_syntaxes: self.options.transfer_syntaxes.clone(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.options.max_pdu_length),
            UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(self.options.scp_role_classes.iter().map(|uid| {
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: uid.clone(),
                scu_role: false,
                scp_role: true,
            })
        }));
        if let Some(identity) = &self.options.user_identity {
            user_variables.push(UserVariableItem::UserIdentityRq(identity.clone()));
        }

        AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: self.options.calling_ae_title.clone(),
            called_ae_title: self.options.called_ae_title.clone(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts,
            user_variables,
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids::{sop_class, storage_class};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_one_context_per_abstract_syntax() {
        let mut client = Client::new(
            ClientOptions::new("ME", "YOU").with_scp_role(storage_class::CT_IMAGE),
        );
        client.add_request(Message::c_echo());
        client.add_request(Message::c_find_study(InMemDicomObject::new_empty()));
        client.add_request(Message::c_echo());
        let rq = client.association_rq();
        let contexts: Vec<_> = rq
            .presentation_contexts
            .iter()
            .map(|pc| (pc.id, pc.abstract_syntax.as_str()))
            .collect();
        assert_eq!(
            contexts,
            vec![
                (1, sop_class::VERIFICATION),
                (3, sop_class::STUDY_ROOT_QUERY_RETRIEVE_FIND),
                (5, storage_class::CT_IMAGE),
            ]
        );
        assert!(rq.user_variables.contains(&UserVariableItem::RoleSelection(
            RoleSelection {
                sop_class_uid: storage_class::CT_IMAGE.to_string(),
                scu_role: false,
                scp_role: true,
            }
        )));
        assert!(rq.user_variables.contains(&UserVariableItem::MaxLength(DEFAULT_MAX_PDU)));
    }

    #[test]
    fn test_user_identity_is_proposed() {
        let client = Client::new(ClientOptions::default().with_username_passcode("u", "p", true));
        let rq = client.association_rq();
        assert!(rq.user_variables.iter().any(|item| matches!(
            item,
            UserVariableItem::UserIdentityRq(UserIdentity {
                identity_type: UserIdentityType::UsernamePasscode,
                positive_response_requested: true,
                ..
            })
        )));
    }
}
