//! An [Association] driven over a [PduStream].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dicom::object::InMemDicomObject;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::association::{Association, AssociationEvent, AssociationState, Role};
use crate::association_error::AssociationError;
use crate::command::{Command, Status};
use crate::dataset::{decode_dataset, encode_dataset};
use crate::error::{CommandError, PduError};
use crate::message::Message;
use crate::pdu::{AbortReason, AbortSource, Pdu};
use crate::statistics::{StatisticsEvent, StatisticsSink};
use crate::transport::PduStream;

/// One side of an association and the transport it runs on.
#[derive(Debug)]
pub struct Connection<S> {
    stream: PduStream<S>,
    association: Association,
    events: VecDeque<AssociationEvent>,
    statistics: Arc<dyn StatisticsSink>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// `max_pdu_length` is the largest P-DATA-TF body we are willing to receive.
    /// When `strict`, longer ones are a fatal error.
    pub fn new(
        stream: S,
        role: Role,
        max_pdu_length: u32,
        strict: bool,
        statistics: Arc<dyn StatisticsSink>,
    ) -> Self {
        let mut stream = PduStream::new(stream, Arc::clone(&statistics));
        stream.set_max_pdu_length(max_pdu_length, strict);
        let mut association = Association::new(role, max_pdu_length);
        association.connected();
        Self {
            stream,
            association,
            events: VecDeque::new(),
            statistics,
        }
    }

    pub fn association(&self) -> &Association {
        &self.association
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Send a PDU. A PDU the association cannot send in its current state aborts it.
    pub async fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), AssociationError> {
        if let Err(violation) = self.association.on_send(pdu) {
            tracing::warn!("cannot send {}: {violation}, aborting association", pdu.short_description());
            self.abort(AbortSource::ServiceProvider, violation.reason)
                .await;
            return Err(violation.into());
        }
        tracing::trace!(pdu = %pdu.short_description(), "sending");
        self.stream.send(pdu).await
    }

    /// Encode, fragment and send a message on an accepted presentation context.
    pub async fn send_message(
        &mut self,
        presentation_context_id: u8,
        message: &Message,
    ) -> Result<(), AssociationError> {
        let transfer_syntax = self
            .association
            .presentation_context(presentation_context_id)
            .and_then(|pc| pc.transfer_syntax())
            .ok_or(AssociationError::UnknownPresentationContext(
                presentation_context_id,
            ))?
            .to_string();
        let mut command = message.command.clone();
        command.has_dataset = message.dataset.is_some();
        let command_bytes = command.encode()?;
        let dataset_bytes = message
            .dataset
            .as_ref()
            .map(|ds| encode_dataset(ds, &transfer_syntax))
            .transpose()?;
        let pdus = self.association.fragment_message(
            presentation_context_id,
            &command_bytes,
            dataset_bytes.as_deref(),
        )?;
        for pdu in &pdus {
            self.send_pdu(pdu).await?;
        }
        self.statistics.record_event(
            StatisticsEvent::MessageSent,
            command_bytes.len() + dataset_bytes.as_ref().map_or(0, Vec::len),
        );
        tracing::debug!(
            command = %command.command_field,
            message_id = ?command.message_id.or(command.message_id_being_responded_to),
            status = ?command.status,
            presentation_context_id,
            pdus = pdus.len(),
            "sent message"
        );
        Ok(())
    }

    /// Decode a received data set in the transfer syntax of its presentation context.
    pub fn read_dataset(
        &self,
        presentation_context_id: u8,
        bytes: &[u8],
    ) -> Result<InMemDicomObject, AssociationError> {
        let transfer_syntax = self
            .association
            .presentation_context(presentation_context_id)
            .and_then(|pc| pc.transfer_syntax())
            .ok_or(AssociationError::UnknownPresentationContext(
                presentation_context_id,
            ))?;
        Ok(decode_dataset(bytes, transfer_syntax)?)
    }

    /// Answer a request we cannot act on with a failure `status`.
    ///
    /// A request without a message ID cannot be answered, so the association is aborted.
    /// Nothing is sent for a C-CANCEL-RQ.
    pub async fn refuse(
        &mut self,
        presentation_context_id: u8,
        request: &Command,
        status: Status,
        comment: &str,
    ) -> Result<(), AssociationError> {
        tracing::warn!(command = %request.command_field, "refusing request: {comment}");
        if request.command_field.response().is_none() {
            return Ok(());
        }
        if request.message_id.is_none() {
            self.abort(
                AbortSource::ServiceProvider,
                AbortReason::InvalidPduParameterValue,
            )
            .await;
            return Err(CommandError::MissingTag(crate::command::tags::MESSAGE_ID).into());
        }
        match Message::failure_to(request, status, comment) {
            Some(response) => self.send_message(presentation_context_id, &response).await,
            None => Ok(()),
        }
    }

    /// An event left over from the last PDU, if any.
    pub fn pop_event(&mut self) -> Option<AssociationEvent> {
        self.events.pop_front()
    }

    /// Wait for the next event. `None` once the peer has closed the connection.
    ///
    /// A timeout, an undecodable PDU or a protocol violation aborts the association.
    pub async fn next_event(
        &mut self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<Option<AssociationEvent>, AssociationError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            let received = self.receive(timeout, waiting_for).await;
            if !self.process(received).await? {
                return Ok(None);
            }
        }
    }

    /// Read one PDU without acting on it. Cancel-safe.
    pub async fn receive(
        &mut self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<Option<Pdu>, AssociationError> {
        tokio::time::timeout(timeout, self.stream.receive())
            .await
            .unwrap_or(Err(AssociationError::Timeout(waiting_for)))
    }

    /// Feed the result of [Connection::receive] to the association, queueing its events.
    ///
    /// Returns `false` when the peer closed the connection.
    pub async fn process(
        &mut self,
        received: Result<Option<Pdu>, AssociationError>,
    ) -> Result<bool, AssociationError> {
        let pdu = match received {
            Ok(Some(pdu)) => pdu,
            Ok(None) => {
                if !matches!(
                    self.association.state(),
                    AssociationState::Closed | AssociationState::Aborted
                ) {
                    tracing::warn!("peer closed the connection without releasing the association");
                }
                let discarded = self.association.transport_closed();
                if discarded > 0 {
                    tracing::warn!("discarded {discarded} incomplete messages");
                    return Err(AssociationError::IncompleteMessages(discarded));
                }
                return Ok(false);
            }
            Err(AssociationError::Timeout(what)) => {
                tracing::warn!("timed out waiting for {what}, aborting association");
                self.abort(AbortSource::ServiceProvider, AbortReason::NotSpecified)
                    .await;
                return Err(AssociationError::Timeout(what));
            }
            Err(AssociationError::Pdu(e)) => {
                let reason = match e {
                    PduError::UnknownPduType(_) => AbortReason::UnrecognizedPdu,
                    _ => AbortReason::InvalidPduParameterValue,
                };
                tracing::warn!("{e}, aborting association");
                self.abort(AbortSource::ServiceProvider, reason).await;
                return Err(e.into());
            }
            Err(e) => {
                self.association.transport_closed();
                return Err(e);
            }
        };
        tracing::trace!(pdu = %pdu.short_description(), "received");
        match self.association.handle_pdu(pdu) {
            Ok(events) => {
                for event in &events {
                    if let AssociationEvent::Message(message) = event {
                        self.statistics
                            .record_event(StatisticsEvent::MessageReceived, message.byte_count);
                    }
                }
                self.events.extend(events);
                Ok(true)
            }
            Err(violation) => {
                tracing::warn!("{violation}, aborting association");
                self.write_abort(&violation.abort_pdu()).await;
                Err(violation.into())
            }
        }
    }

    /// Send an A-ABORT if the association is in a state to carry one, then close the transport.
    pub async fn abort(&mut self, source: AbortSource, reason: AbortReason) {
        let pdu = Pdu::AbortRQ { source, reason };
        if self.association.on_send(&pdu).is_ok() {
            self.write_abort(&pdu).await;
        } else {
            self.association.transport_closed();
            self.close().await;
        }
    }

    async fn write_abort(&mut self, pdu: &Pdu) {
        if let Err(e) = self.stream.send(pdu).await {
            tracing::debug!("could not send A-ABORT: {e}");
        }
        self.association.transport_closed();
        self.close().await;
    }

    /// Shut the transport down. Errors are only logged, the peer may already be gone.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("could not shut down transport: {e}");
        }
    }
}
