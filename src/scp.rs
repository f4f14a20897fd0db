//! Acceptor side: negotiate an incoming association and dispatch its requests to an [Scp].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use dicom::object::InMemDicomObject;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::association::{AssociationEvent, InboundMessage, Role};
use crate::association_error::AssociationError;
use crate::command::{Command, CommandField, Status};
use crate::connection::Connection;
use crate::message::Message;
use crate::negotiation::AcceptorPolicy;
use crate::pdu::{
    AbortReason, AbortSource, AssociationAC, AssociationRJ, AssociationRQ, Pdu,
    PresentationContextResultReason,
};
use crate::statistics::{Statistics, StatisticsSink};

/// Application behaviour of a service class provider.
///
/// Every hook has a default: C-ECHO succeeds, association requests are judged by the
/// [AcceptorPolicy], and every other request is answered with "unrecognized operation".
/// Hooks run synchronously on the association's task. An `Err` is answered with a
/// processing failure carrying the error as its comment.
pub trait Scp: Send + Sync {
    fn on_association_requested(
        &self,
        rq: &AssociationRQ,
        policy: &AcceptorPolicy,
    ) -> Result<AssociationAC, AssociationRJ> {
        policy.evaluate(rq)
    }

    fn on_association_accepted(&self, _ac: &AssociationAC) {}

    fn on_association_rejected(&self, _rj: &AssociationRJ) {}

    fn on_association_released(&self) {}

    fn on_association_aborted(&self, _source: AbortSource, _reason: AbortReason) {}

    fn on_c_echo(&self, _ctx: &mut ScpContext, request: &Command) -> anyhow::Result<Message> {
        respond(request, Status::SUCCESS)
    }

    /// Pending responses with matches, then a final one.
    fn on_c_find(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _identifier: InMemDicomObject,
    ) -> anyhow::Result<Vec<Message>> {
        Ok(vec![unrecognized(request)?])
    }

    fn on_c_store(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _dataset: InMemDicomObject,
    ) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    fn on_c_move(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _identifier: InMemDicomObject,
    ) -> anyhow::Result<Vec<Message>> {
        Ok(vec![unrecognized(request)?])
    }

    /// C-STORE sub-operations go out through [ScpContext::send_request].
    fn on_c_get(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _identifier: InMemDicomObject,
    ) -> anyhow::Result<Vec<Message>> {
        Ok(vec![unrecognized(request)?])
    }

    fn on_n_event_report(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _event_information: Option<InMemDicomObject>,
    ) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    fn on_n_get(&self, _ctx: &mut ScpContext, request: &Command) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    fn on_n_set(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _modifications: InMemDicomObject,
    ) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    fn on_n_action(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _action_information: Option<InMemDicomObject>,
    ) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    fn on_n_create(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        _attributes: Option<InMemDicomObject>,
    ) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    fn on_n_delete(&self, _ctx: &mut ScpContext, request: &Command) -> anyhow::Result<Message> {
        unrecognized(request)
    }

    /// The peer sent C-CANCEL for one of its operations.
    fn on_cancel(&self, _ctx: &mut ScpContext, _message_id: u16) {}

    /// A response to a request sent with [ScpContext::send_request].
    fn on_response(&self, _ctx: &mut ScpContext, _response: &Message) {}
}

/// Response to `request` with no data set.
pub fn respond(request: &Command, status: Status) -> anyhow::Result<Message> {
    Message::response_to(request, status, None)
        .with_context(|| format!("{} has no response", request.command_field))
}

fn unrecognized(request: &Command) -> anyhow::Result<Message> {
    respond(request, Status::UNRECOGNIZED_OPERATION)
}

/// What a hook knows about its association, and its way to send requests to the peer.
#[derive(Debug)]
pub struct ScpContext {
    calling_ae_title: String,
    called_ae_title: String,
    outgoing: Vec<Message>,
}

impl ScpContext {
    fn new(rq: &AssociationRQ) -> Self {
        Self {
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            outgoing: Vec::new(),
        }
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// Queue a request to the peer, such as an N-EVENT-REPORT. It is sent as soon as the
    /// current hook returns, ahead of the hook's own responses. Its message ID is assigned then.
    pub fn send_request(&mut self, message: Message) {
        self.outgoing.push(message);
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outgoing)
    }

    #[cfg(test)]
    pub(crate) fn for_testing(calling_ae_title: &str, called_ae_title: &str) -> Self {
        Self {
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            outgoing: Vec::new(),
        }
    }
}

/// Transport-level behaviour of every association a server accepts.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Fail on P-DATA-TF PDUs longer than our maximum.
    pub strict: bool,
    /// How long to wait for the A-ASSOCIATE-RQ after connecting.
    pub association_timeout: Duration,
    /// How long an established association may stay silent.
    pub idle_timeout: Duration,
    pub statistics: Arc<dyn StatisticsSink>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            strict: false,
            association_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            statistics: Arc::new(Statistics::default()),
        }
    }
}

/// Handle one association from an SCU, start to finish.
///
/// Release and aborts by the peer end the association normally. Timeouts, protocol
/// violations and transport errors are returned, after an A-ABORT was attempted.
pub async fn handle_association<S, T>(
    stream: S,
    scp: &T,
    policy: &AcceptorPolicy,
    options: &ServerOptions,
) -> Result<(), AssociationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Scp + ?Sized,
{
    let mut connection = Connection::new(
        stream,
        Role::Acceptor,
        policy.max_pdu_length,
        options.strict,
        Arc::clone(&options.statistics),
    );
    let rq = match connection
        .next_event(options.association_timeout, "association request")
        .await?
    {
        Some(AssociationEvent::Requested(rq)) => rq,
        Some(AssociationEvent::Aborted { source, reason }) => {
            scp.on_association_aborted(source, reason);
            return Ok(());
        }
        _ => return Ok(()),
    };
    tracing::info!(
        calling_ae_title = %rq.calling_ae_title,
        called_ae_title = %rq.called_ae_title,
        "association requested"
    );
    match scp.on_association_requested(&rq, policy) {
        Ok(ac) => {
            connection
                .send_pdu(&Pdu::AssociationAC(ac.clone()))
                .await?;
            let accepted = ac
                .presentation_contexts
                .iter()
                .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                .count();
            tracing::info!(
                presentation_contexts = accepted,
                max_pdu_length = connection.association().max_pdu_length(),
                "association accepted"
            );
            scp.on_association_accepted(&ac);
        }
        Err(rj) => {
            connection.send_pdu(&Pdu::AssociationRJ(rj)).await?;
            tracing::info!("association rejected: {rj}");
            scp.on_association_rejected(&rj);
            connection.close().await;
            return Ok(());
        }
    }

    let mut dispatcher = Dispatcher {
        scp,
        ctx: ScpContext::new(&rq),
        next_message_id: 1,
        outstanding: HashSet::new(),
    };
    loop {
        let event = match connection
            .next_event(options.idle_timeout, "a request")
            .await
        {
            Ok(Some(event)) => event,
            Ok(None) => {
                scp.on_association_aborted(AbortSource::ServiceProvider, AbortReason::NotSpecified);
                return Ok(());
            }
            Err(e) => {
                let reason = match &e {
                    AssociationError::Protocol(violation) => violation.reason,
                    _ => AbortReason::NotSpecified,
                };
                scp.on_association_aborted(AbortSource::ServiceProvider, reason);
                return Err(e);
            }
        };
        match event {
            AssociationEvent::Message(inbound) => {
                dispatcher.dispatch(&mut connection, inbound).await?;
            }
            AssociationEvent::ReleaseRequested => {
                connection.send_pdu(&Pdu::ReleaseRP).await?;
                tracing::info!("association released");
                scp.on_association_released();
                connection.close().await;
                return Ok(());
            }
            AssociationEvent::Aborted { source, reason } => {
                tracing::info!(?source, ?reason, "association aborted by peer");
                scp.on_association_aborted(source, reason);
                return Ok(());
            }
            _ => {}
        }
    }
}

struct Dispatcher<'a, T: ?Sized> {
    scp: &'a T,
    ctx: ScpContext,
    next_message_id: u16,
    /// Message IDs of our own requests still waiting for a final response.
    outstanding: HashSet<u16>,
}

impl<T: Scp + ?Sized> Dispatcher<'_, T> {
    async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        connection: &mut Connection<S>,
        inbound: InboundMessage,
    ) -> Result<(), AssociationError> {
        let InboundMessage {
            presentation_context_id,
            command,
            dataset,
            ..
        } = inbound;
        tracing::debug!(
            command = %command.command_field,
            message_id = ?command.message_id.or(command.message_id_being_responded_to),
            presentation_context_id,
            "received message"
        );
        let dataset = match dataset {
            Some(bytes) => match connection.read_dataset(presentation_context_id, &bytes) {
                Ok(dataset) => Some(dataset),
                Err(e) => {
                    tracing::warn!(command = %command.command_field, "could not read data set: {e:?}");
                    return connection
                        .refuse(
                            presentation_context_id,
                            &command,
                            Status::CANNOT_UNDERSTAND,
                            &e.to_string(),
                        )
                        .await;
                }
            },
            None => None,
        };

        if command.command_field.is_response() {
            self.on_response(Message { command, dataset });
            return self.send_requests(connection).await;
        }
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

        let scp = self.scp;
        let ctx = &mut self.ctx;
        let result = match command.command_field {
            CommandField::CEchoRq => scp.on_c_echo(ctx, &command).map(|r| vec![r]),
            CommandField::CFindRq => scp.on_c_find(ctx, &command, or_empty(dataset)),
            CommandField::CStoreRq => scp
                .on_c_store(ctx, &command, or_empty(dataset))
                .map(|r| vec![r]),
            CommandField::CMoveRq => scp.on_c_move(ctx, &command, or_empty(dataset)),
            CommandField::CGetRq => scp.on_c_get(ctx, &command, or_empty(dataset)),
            CommandField::NEventReportRq => scp
                .on_n_event_report(ctx, &command, dataset)
                .map(|r| vec![r]),
            CommandField::NGetRq => scp.on_n_get(ctx, &command).map(|r| vec![r]),
            CommandField::NSetRq => scp
                .on_n_set(ctx, &command, or_empty(dataset))
                .map(|r| vec![r]),
            CommandField::NActionRq => scp.on_n_action(ctx, &command, dataset).map(|r| vec![r]),
            CommandField::NCreateRq => scp.on_n_create(ctx, &command, dataset).map(|r| vec![r]),
            CommandField::NDeleteRq => scp.on_n_delete(ctx, &command).map(|r| vec![r]),
            CommandField::CCancelRq => {
                if let Some(message_id) = command.message_id_being_responded_to {
                    scp.on_cancel(ctx, message_id);
                }
                return self.send_requests(connection).await;
            }
            _ => return Ok(()),
        };
        let responses = match result {
            Ok(responses) if !responses.is_empty() => responses,
            Ok(_) => failure(&command, "no response"),
            Err(e) => {
                tracing::warn!(command = %command.command_field, "{e:?}");
                failure(&command, &e.to_string())
            }
        };

        self.send_requests(connection).await?;
        let mut finished = false;
        let mut comment = "no final response".to_string();
        for response in responses {
            let response = match check_response(&command, &response) {
                Ok(()) => response,
                Err(problem) => {
                    tracing::error!(command = %command.command_field, "invalid response: {problem}");
                    comment = problem;
                    break;
                }
            };
            finished = response.status().is_some_and(Status::is_terminal);
            connection
                .send_message(presentation_context_id, &response)
                .await?;
            if finished {
                break;
            }
        }
        if !finished {
            tracing::warn!(command = %command.command_field, "{comment}, sending a failure");
            for fallback in failure(&command, &comment) {
                connection
                    .send_message(presentation_context_id, &fallback)
                    .await?;
            }
        }
        Ok(())
    }

    fn on_response(&mut self, response: Message) {
        let Some(message_id) = response.command.message_id_being_responded_to else {
            tracing::warn!(command = %response.command.command_field, "response without message ID, dropping");
            return;
        };
        if !self.outstanding.contains(&message_id) {
            tracing::warn!(message_id, "response to unknown message ID, dropping");
            return;
        }
        if response.status().is_none_or(Status::is_terminal) {
            self.outstanding.remove(&message_id);
        }
        self.scp.on_response(&mut self.ctx, &response);
    }

    /// Send what hooks queued with [ScpContext::send_request].
    async fn send_requests<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        connection: &mut Connection<S>,
    ) -> Result<(), AssociationError> {
        for mut request in self.ctx.take_outgoing() {
            let context = request
                .command
                .sop_class_uid()
                .and_then(|uid| connection.association().accepted_context_for(uid))
                .map(|pc| pc.id);
            let Some(presentation_context_id) = context else {
                tracing::warn!(
                    command = %request.command.command_field,
                    sop_class_uid = ?request.command.sop_class_uid(),
                    "no accepted presentation context, not sending request"
                );
                continue;
            };
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
            request.command.message_id = Some(message_id);
            if let Err(e) = request.command.validate() {
                tracing::warn!("not sending invalid request: {e}");
                continue;
            }
            connection
                .send_message(presentation_context_id, &request)
                .await?;
            self.outstanding.insert(message_id);
        }
        Ok(())
    }
}

fn or_empty(dataset: Option<InMemDicomObject>) -> InMemDicomObject {
    dataset.unwrap_or_else(InMemDicomObject::new_empty)
}

fn failure(request: &Command, comment: &str) -> Vec<Message> {
    Message::failure_to(request, Status::PROCESSING_FAILURE, comment)
        .into_iter()
        .collect()
}

/// A response must answer `request` and carry every element its kind requires.
fn check_response(request: &Command, response: &Message) -> Result<(), String> {
    if Some(response.command.command_field) != request.command_field.response() {
        return Err(format!(
            "{} is not a response to {}",
            response.command.command_field, request.command_field
        ));
    }
    if response.command.message_id_being_responded_to != request.message_id {
        return Err(format!(
            "responds to message {:?} instead of {:?}",
            response.command.message_id_being_responded_to, request.message_id
        ));
    }
    response.command.validate().map_err(|e| e.to_string())
}
