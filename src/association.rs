//! Protocol state of one association, independent of any I/O.
//!
//! The owner feeds every received PDU to [Association::handle_pdu] and reports every PDU it is
//! about to send to [Association::on_send]. The association validates each against its state,
//! records what negotiation settled, and reassembles P-DATA fragments into whole messages.

use std::collections::HashMap;

use crate::association_error::AssociationError;
use crate::command::Command;
use crate::pdu::{
    AbortReason, AbortSource, AssociationAC, AssociationRJ, AssociationRQ, DEFAULT_MAX_PDU,
    PDV_HEADER_SIZE, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserVariableItem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    Requesting,
    Accepting,
    Negotiating,
    Established,
    Releasing,
    Closed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the association request.
    Requestor,
    /// Accepts or rejects the association request.
    Acceptor,
}

/// A PDU that cannot be accepted in the current state, or whose contents break the protocol.
///
/// The association is aborted by the time this is returned. The owner should send
/// [ProtocolViolation::abort_pdu] and close the transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{description}")]
pub struct ProtocolViolation {
    pub reason: AbortReason,
    pub description: String,
}

impl ProtocolViolation {
    fn new(reason: AbortReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    fn unexpected(pdu: &Pdu, state: AssociationState) -> Self {
        Self::new(
            AbortReason::UnexpectedPdu,
            format!("unexpected {} in state {state:?}", pdu.short_description()),
        )
    }

    pub fn abort_pdu(&self) -> Pdu {
        Pdu::AbortRQ {
            source: AbortSource::ServiceProvider,
            reason: self.reason,
        }
    }
}

/// A proposed presentation context and, once negotiated, its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    /// Proposed transfer syntaxes, in the proposer's order.
    pub transfer_syntaxes: Vec<String>,
    result: Option<PresentationContextResultReason>,
    transfer_syntax: Option<String>,
}

impl PresentationContext {
    pub fn new(id: u8, abstract_syntax: impl Into<String>, transfer_syntaxes: Vec<String>) -> Self {
        Self {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
            result: None,
            transfer_syntax: None,
        }
    }

    /// `None` until negotiation has settled this context.
    pub fn result(&self) -> Option<PresentationContextResultReason> {
        self.result
    }

    pub fn is_accepted(&self) -> bool {
        self.result == Some(PresentationContextResultReason::Acceptance)
    }

    /// The transfer syntax agreed on, for accepted contexts only.
    pub fn transfer_syntax(&self) -> Option<&str> {
        self.transfer_syntax.as_deref()
    }

    fn set_result(
        &mut self,
        reason: PresentationContextResultReason,
        transfer_syntax: Option<String>,
    ) -> Result<(), ProtocolViolation> {
        if self.result.is_some() {
            return Err(ProtocolViolation::new(
                AbortReason::UnexpectedPduParameter,
                format!("presentation context {} was already negotiated", self.id),
            ));
        }
        if reason == PresentationContextResultReason::Acceptance {
            match transfer_syntax {
                Some(ts) if self.transfer_syntaxes.contains(&ts) => self.transfer_syntax = Some(ts),
                other => {
                    return Err(ProtocolViolation::new(
                        AbortReason::InvalidPduParameterValue,
                        format!(
                            "presentation context {} accepted with transfer syntax {other:?}, which was not proposed",
                            self.id
                        ),
                    ));
                }
            }
        }
        self.result = Some(reason);
        Ok(())
    }
}

impl From<&PresentationContextProposed> for PresentationContext {
    fn from(pc: &PresentationContextProposed) -> Self {
        PresentationContext::new(pc.id, pc.abstract_syntax.clone(), pc.transfer_syntaxes.clone())
    }
}

/// A complete command, with its data set when one was announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub presentation_context_id: u8,
    pub command: Command,
    pub dataset: Option<Vec<u8>>,
    /// Encoded size of the command and data set.
    pub byte_count: usize,
}

/// What a received PDU meant for the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEvent {
    Requested(AssociationRQ),
    Accepted(AssociationAC),
    Rejected(AssociationRJ),
    Message(InboundMessage),
    ReleaseRequested,
    Released,
    Aborted {
        source: AbortSource,
        reason: AbortReason,
    },
}

#[derive(Debug)]
pub struct Association {
    role: Role,
    state: AssociationState,
    calling_ae_title: String,
    called_ae_title: String,
    local_max_pdu_length: u32,
    peer_max_pdu_length: u32,
    presentation_contexts: Vec<PresentationContext>,
    user_identity: Option<UserIdentity>,
    user_identity_response: Option<Vec<u8>>,
    peer_implementation_class_uid: Option<String>,
    peer_implementation_version_name: Option<String>,
    role_selections: Vec<RoleSelection>,
    release_sent: bool,
    release_received: bool,
    assembler: PDataAssembler,
}

impl Association {
    /// `local_max_pdu_length` is the largest P-DATA-TF body we accept; 0 means unlimited.
    pub fn new(role: Role, local_max_pdu_length: u32) -> Self {
        Self {
            role,
            state: AssociationState::Idle,
            calling_ae_title: String::new(),
            called_ae_title: String::new(),
            local_max_pdu_length,
            peer_max_pdu_length: DEFAULT_MAX_PDU,
            presentation_contexts: Vec::new(),
            user_identity: None,
            user_identity_response: None,
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
            role_selections: Vec::new(),
            release_sent: false,
            release_received: false,
            assembler: PDataAssembler::default(),
        }
    }

    /// The transport connection is up.
    pub fn connected(&mut self) {
        if self.state == AssociationState::Idle {
            self.state = match self.role {
                Role::Requestor => AssociationState::Requesting,
                Role::Acceptor => AssociationState::Accepting,
            };
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        &self.presentation_contexts
    }

    pub fn presentation_context(&self, id: u8) -> Option<&PresentationContext> {
        self.presentation_contexts.iter().find(|pc| pc.id == id)
    }

    /// First accepted context for the abstract syntax.
    pub fn accepted_context_for(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax)
    }

    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_identity.as_ref()
    }

    pub fn user_identity_response(&self) -> Option<&[u8]> {
        self.user_identity_response.as_deref()
    }

    pub fn peer_implementation_class_uid(&self) -> Option<&str> {
        self.peer_implementation_class_uid.as_deref()
    }

    pub fn peer_implementation_version_name(&self) -> Option<&str> {
        self.peer_implementation_version_name.as_deref()
    }

    /// Roles agreed on in the associate-accept.
    pub fn role_selections(&self) -> &[RoleSelection] {
        &self.role_selections
    }

    /// Negotiated maximum P-DATA-TF body length: the smaller of both sides' limits. 0 means unlimited.
    pub fn max_pdu_length(&self) -> u32 {
        match (self.local_max_pdu_length, self.peer_max_pdu_length) {
            (0, peer) => peer,
            (local, 0) => local,
            (local, peer) => local.min(peer),
        }
    }

    /// Validate a PDU we are about to send, and apply its effect on the state.
    pub fn on_send(&mut self, pdu: &Pdu) -> Result<(), ProtocolViolation> {
        use AssociationState::*;
        match (pdu, self.role, self.state) {
            (Pdu::AssociationRQ(rq), Role::Requestor, Requesting) => {
                let mut ids = Vec::with_capacity(rq.presentation_contexts.len());
                for pc in &rq.presentation_contexts {
                    if pc.id % 2 == 0 || ids.contains(&pc.id) {
                        return Err(ProtocolViolation::new(
                            AbortReason::InvalidPduParameterValue,
                            format!("presentation context ids must be unique and odd, got {}", pc.id),
                        ));
                    }
                    ids.push(pc.id);
                }
                self.calling_ae_title = rq.calling_ae_title.clone();
                self.called_ae_title = rq.called_ae_title.clone();
                self.presentation_contexts =
                    rq.presentation_contexts.iter().map(Into::into).collect();
                self.user_identity = rq.user_variables.iter().find_map(|item| match item {
                    UserVariableItem::UserIdentityRq(identity) => Some(identity.clone()),
                    _ => None,
                });
                self.state = Negotiating;
            }
            (Pdu::AssociationAC(ac), Role::Acceptor, Negotiating) => {
                self.apply_accept(ac)?;
                self.state = Established;
            }
            (Pdu::AssociationRJ(_), Role::Acceptor, Negotiating) => {
                self.state = Closed;
            }
            (Pdu::PData { .. }, _, Established) => {}
            (Pdu::ReleaseRQ, _, Established) => {
                self.release_sent = true;
                self.state = Releasing;
            }
            (Pdu::ReleaseRP, _, Releasing) if self.release_received => {
                self.close();
            }
            (Pdu::AbortRQ { .. }, _, state) if !matches!(state, Idle | Closed | Aborted) => {
                self.assembler.discard();
                self.state = Aborted;
            }
            _ => return Err(ProtocolViolation::unexpected(pdu, self.state)),
        }
        Ok(())
    }

    /// Process a received PDU.
    ///
    /// On error the association is aborted and nothing the PDU carried is delivered.
    pub fn handle_pdu(&mut self, pdu: Pdu) -> Result<Vec<AssociationEvent>, ProtocolViolation> {
        match self.receive(pdu) {
            Ok(events) => Ok(events),
            Err(violation) => {
                self.assembler.discard();
                self.state = AssociationState::Aborted;
                Err(violation)
            }
        }
    }

    fn receive(&mut self, pdu: Pdu) -> Result<Vec<AssociationEvent>, ProtocolViolation> {
        use AssociationState::*;
        let event = match (pdu, self.role, self.state) {
            (Pdu::AbortRQ { source, reason }, _, state) => {
                if matches!(state, Idle | Closed | Aborted) {
                    return Ok(Vec::new());
                }
                let discarded = self.assembler.discard();
                if discarded > 0 {
                    tracing::warn!("discarding {discarded} incomplete messages after A-ABORT");
                }
                self.state = Aborted;
                AssociationEvent::Aborted { source, reason }
            }
            (Pdu::AssociationRQ(rq), Role::Acceptor, Accepting) => {
                self.calling_ae_title = rq.calling_ae_title.clone();
                self.called_ae_title = rq.called_ae_title.clone();
                self.presentation_contexts =
                    rq.presentation_contexts.iter().map(Into::into).collect();
                self.read_user_variables(&rq.user_variables);
                self.state = Negotiating;
                AssociationEvent::Requested(rq)
            }
            (Pdu::AssociationAC(ac), Role::Requestor, Negotiating) => {
                self.apply_accept(&ac)?;
                self.read_user_variables(&ac.user_variables);
                self.state = Established;
                AssociationEvent::Accepted(ac)
            }
            (Pdu::AssociationRJ(rj), Role::Requestor, Negotiating) => {
                self.state = Closed;
                AssociationEvent::Rejected(rj)
            }
            (Pdu::PData { data }, _, state)
                if state == Established || (state == Releasing && self.release_sent) =>
            {
                let mut events = Vec::new();
                for pdv in data {
                    if !self
                        .presentation_context(pdv.presentation_context_id)
                        .is_some_and(PresentationContext::is_accepted)
                    {
                        return Err(ProtocolViolation::new(
                            AbortReason::InvalidPduParameterValue,
                            format!(
                                "P-DATA-TF on presentation context {} which was not accepted",
                                pdv.presentation_context_id
                            ),
                        ));
                    }
                    if let Some(message) = self.assembler.push(pdv)? {
                        events.push(AssociationEvent::Message(message));
                    }
                }
                return Ok(events);
            }
            (Pdu::ReleaseRQ, _, Established) => {
                self.release_received = true;
                self.state = Releasing;
                AssociationEvent::ReleaseRequested
            }
            (Pdu::ReleaseRP, _, Releasing) if self.release_sent => {
                self.close();
                AssociationEvent::Released
            }
            (pdu, _, state) => return Err(ProtocolViolation::unexpected(&pdu, state)),
        };
        Ok(vec![event])
    }

    /// Split a message into P-DATA-TF PDUs no longer than the negotiated maximum.
    pub fn fragment_message(
        &self,
        presentation_context_id: u8,
        command: &[u8],
        dataset: Option<&[u8]>,
    ) -> Result<Vec<Pdu>, AssociationError> {
        if self.state != AssociationState::Established {
            return Err(AssociationError::CannotRespond(
                "messages may only be sent on an established association",
            ));
        }
        if !self
            .presentation_context(presentation_context_id)
            .is_some_and(PresentationContext::is_accepted)
        {
            return Err(AssociationError::UnknownPresentationContext(
                presentation_context_id,
            ));
        }
        let max_pdu_length = self.max_pdu_length();
        let mut values = fragment_pdvs(
            presentation_context_id,
            PDataValueType::Command,
            command,
            max_pdu_length,
        );
        if let Some(dataset) = dataset {
            values.extend(fragment_pdvs(
                presentation_context_id,
                PDataValueType::Data,
                dataset,
                max_pdu_length,
            ));
        }
        Ok(values
            .into_iter()
            .map(|pdv| Pdu::PData { data: vec![pdv] })
            .collect())
    }

    /// The transport is gone. Returns the number of incomplete messages discarded.
    pub fn transport_closed(&mut self) -> usize {
        if self.state != AssociationState::Closed {
            self.state = AssociationState::Aborted;
        }
        self.assembler.discard()
    }

    fn close(&mut self) {
        let discarded = self.assembler.discard();
        if discarded > 0 {
            tracing::warn!("discarding {discarded} incomplete messages after release");
        }
        self.state = AssociationState::Closed;
    }

    fn apply_accept(&mut self, ac: &AssociationAC) -> Result<(), ProtocolViolation> {
        for result in &ac.presentation_contexts {
            let pc = self
                .presentation_contexts
                .iter_mut()
                .find(|pc| pc.id == result.id && pc.result.is_none())
                .ok_or_else(|| {
                    ProtocolViolation::new(
                        AbortReason::InvalidPduParameterValue,
                        format!("result for presentation context {} which was not proposed", result.id),
                    )
                })?;
            pc.set_result(result.reason, result.transfer_syntax.clone())?;
        }
        for pc in self.presentation_contexts.iter_mut().filter(|pc| pc.result.is_none()) {
            pc.set_result(PresentationContextResultReason::NoReason, None)?;
        }
        self.role_selections = ac
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role.clone()),
                _ => None,
            })
            .collect();
        self.user_identity_response = ac.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityAc { server_response } => Some(server_response.clone()),
            _ => None,
        });
        Ok(())
    }

    /// Record what the peer told us about itself.
    fn read_user_variables(&mut self, items: &[UserVariableItem]) {
        for item in items {
            match item {
                UserVariableItem::MaxLength(length) => self.peer_max_pdu_length = *length,
                UserVariableItem::ImplementationClassUid(uid) => {
                    self.peer_implementation_class_uid = Some(uid.clone())
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    self.peer_implementation_version_name = Some(name.clone())
                }
                UserVariableItem::UserIdentityRq(identity) => {
                    self.user_identity = Some(identity.clone())
                }
                _ => {}
            }
        }
    }
}

/// Split one command or data set stream into PDVs carrying at most `max_pdu_length - 6` bytes.
///
/// Only the final PDV is marked last. An empty stream still yields one (empty, last) PDV.
pub fn fragment_pdvs(
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_pdu_length: u32,
) -> Vec<PDataValue> {
    let max_payload = if max_pdu_length == 0 {
        usize::MAX
    } else {
        (max_pdu_length as usize)
            .saturating_sub(PDV_HEADER_SIZE)
            .max(1)
    };
    if bytes.is_empty() {
        return vec![PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        }];
    }
    let count = bytes.len().div_ceil(max_payload);
    bytes
        .chunks(max_payload)
        .enumerate()
        .map(|(i, chunk)| PDataValue {
            presentation_context_id,
            value_type,
            is_last: i + 1 == count,
            data: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Default)]
struct PartialMessage {
    command_bytes: Vec<u8>,
    command_length: usize,
    /// Parsed once the command stream is complete, while the data set is still arriving.
    command: Option<Command>,
    dataset: Vec<u8>,
}

/// Per presentation context reassembly buffers.
#[derive(Debug, Default)]
struct PDataAssembler {
    partial: HashMap<u8, PartialMessage>,
}

impl PDataAssembler {
    fn push(&mut self, pdv: PDataValue) -> Result<Option<InboundMessage>, ProtocolViolation> {
        let id = pdv.presentation_context_id;
        let partial = self.partial.entry(id).or_default();
        match pdv.value_type {
            PDataValueType::Command => {
                if partial.command.is_some() {
                    return Err(ProtocolViolation::new(
                        AbortReason::UnexpectedPduParameter,
                        format!("command fragment on presentation context {id} while its data set is incomplete"),
                    ));
                }
                partial.command_bytes.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = Command::decode(&partial.command_bytes).map_err(|e| {
                    ProtocolViolation::new(
                        AbortReason::InvalidPduParameterValue,
                        format!("could not read command on presentation context {id}: {e}"),
                    )
                })?;
                let command_length = partial.command_bytes.len();
                if command.has_dataset {
                    partial.command_bytes = Vec::new();
                    partial.command_length = command_length;
                    partial.command = Some(command);
                    return Ok(None);
                }
                self.partial.remove(&id);
                Ok(Some(InboundMessage {
                    presentation_context_id: id,
                    command,
                    dataset: None,
                    byte_count: command_length,
                }))
            }
            PDataValueType::Data => {
                if partial.command.is_none() {
                    return Err(ProtocolViolation::new(
                        AbortReason::UnexpectedPduParameter,
                        format!("data set fragment on presentation context {id} before its command"),
                    ));
                }
                partial.dataset.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                match self.partial.remove(&id) {
                    Some(PartialMessage {
                        command: Some(command),
                        command_length,
                        dataset,
                        ..
                    }) => Ok(Some(InboundMessage {
                        presentation_context_id: id,
                        command,
                        byte_count: command_length + dataset.len(),
                        dataset: Some(dataset),
                    })),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Drop every incomplete message. Returns how many there were.
    fn discard(&mut self) -> usize {
        let count = self
            .partial
            .values()
            .filter(|p| p.command.is_some() || !p.command_bytes.is_empty())
            .count();
        self.partial.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandField;
    use crate::pdu::{APPLICATION_CONTEXT_NAME, PROTOCOL_VERSION, PresentationContextResult};
    use crate::uids::{sop_class, storage_class, transfer_syntax};
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn association_rq() -> AssociationRQ {
        AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: sop_class::VERIFICATION.to_string(),
                    transfer_syntaxes: vec![transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: storage_class::MR_IMAGE.to_string(),
                    transfer_syntaxes: vec![
                        transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                        transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    ],
                },
            ],
            user_variables: vec![UserVariableItem::MaxLength(1000)],
        }
    }

    fn association_ac() -> AssociationAC {
        AssociationAC {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: Some(transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: Some(transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string()),
                },
            ],
            user_variables: vec![UserVariableItem::MaxLength(512)],
        }
    }

    /// An acceptor that has accepted [association_rq].
    #[fixture]
    fn established() -> Association {
        let mut association = Association::new(Role::Acceptor, 0);
        association.connected();
        association
            .handle_pdu(Pdu::AssociationRQ(association_rq()))
            .unwrap();
        association
            .on_send(&Pdu::AssociationAC(association_ac()))
            .unwrap();
        association
    }

    fn store_command(has_dataset: bool) -> Vec<u8> {
        if !has_dataset {
            let mut echo = Command::new(CommandField::CEchoRq);
            echo.message_id = Some(1);
            echo.affected_sop_class_uid = Some(sop_class::VERIFICATION.to_string());
            return echo.encode().unwrap();
        }
        let mut command = Command::new(CommandField::CStoreRq);
        command.message_id = Some(1);
        command.affected_sop_class_uid = Some(storage_class::MR_IMAGE.to_string());
        command.affected_sop_instance_uid = Some("1.2.3.4.5".to_string());
        command.has_dataset = true;
        command.encode().unwrap()
    }

    fn split_at(bytes: &[u8], offsets: &[usize], value_type: PDataValueType) -> Vec<PDataValue> {
        let mut values = Vec::new();
        let mut start = 0;
        for &end in offsets.iter().chain(std::iter::once(&bytes.len())) {
            values.push(PDataValue {
                presentation_context_id: 3,
                value_type,
                is_last: end == bytes.len(),
                data: bytes[start..end].to_vec(),
            });
            start = end;
        }
        values
    }

    #[test]
    fn test_requestor_negotiation() {
        let mut association = Association::new(Role::Requestor, 0);
        association.connected();
        assert_eq!(association.state(), AssociationState::Requesting);
        association
            .on_send(&Pdu::AssociationRQ(association_rq()))
            .unwrap();
        assert_eq!(association.state(), AssociationState::Negotiating);

        let mut ac = association_ac();
        ac.presentation_contexts[1] = PresentationContextResult {
            id: 3,
            reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
            transfer_syntax: None,
        };
        let events = association.handle_pdu(Pdu::AssociationAC(ac.clone())).unwrap();
        assert_eq!(events, vec![AssociationEvent::Accepted(ac)]);
        assert!(association.is_established());
        assert_eq!(
            association.presentation_context(1).unwrap().transfer_syntax(),
            Some(transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(
            association.presentation_context(3).unwrap().result(),
            Some(PresentationContextResultReason::TransferSyntaxesNotSupported)
        );
        assert!(
            association
                .accepted_context_for(storage_class::MR_IMAGE)
                .is_none()
        );
        assert_eq!(association.max_pdu_length(), 512);
    }

    #[test]
    fn test_even_context_id_is_refused() {
        let mut association = Association::new(Role::Requestor, 0);
        association.connected();
        let mut rq = association_rq();
        rq.presentation_contexts[1].id = 2;
        assert!(association.on_send(&Pdu::AssociationRQ(rq)).is_err());
    }

    #[test]
    fn test_accepting_a_transfer_syntax_that_was_not_proposed() {
        let mut association = Association::new(Role::Requestor, 0);
        association.connected();
        association
            .on_send(&Pdu::AssociationRQ(association_rq()))
            .unwrap();
        let mut ac = association_ac();
        ac.presentation_contexts[0].transfer_syntax =
            Some(transfer_syntax::JPEG_BASELINE.to_string());
        let violation = association.handle_pdu(Pdu::AssociationAC(ac)).unwrap_err();
        assert_eq!(violation.reason, AbortReason::InvalidPduParameterValue);
        assert_eq!(association.state(), AssociationState::Aborted);
    }

    #[test]
    fn test_result_is_set_once() {
        let mut pc = PresentationContext::new(
            1,
            sop_class::VERIFICATION,
            vec![transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
        );
        pc.set_result(
            PresentationContextResultReason::Acceptance,
            Some(transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
        )
        .unwrap();
        assert!(
            pc.set_result(PresentationContextResultReason::UserRejection, None)
                .is_err()
        );
        assert!(pc.is_accepted());
    }

    #[test]
    fn test_data_before_negotiation_aborts_without_delivery() {
        let mut association = Association::new(Role::Acceptor, 0);
        association.connected();
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: store_command(false),
            }],
        };
        let violation = association.handle_pdu(pdu).unwrap_err();
        assert_eq!(
            violation.abort_pdu(),
            Pdu::AbortRQ {
                source: AbortSource::ServiceProvider,
                reason: AbortReason::UnexpectedPdu,
            }
        );
        assert_eq!(association.state(), AssociationState::Aborted);
    }

    #[rstest]
    fn test_data_on_unaccepted_context_is_a_violation(mut established: Association) {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 5,
                value_type: PDataValueType::Command,
                is_last: true,
                data: store_command(false),
            }],
        };
        assert!(established.handle_pdu(pdu).is_err());
    }

    #[rstest]
    #[case::single(&[])]
    #[case::two(&[33])]
    #[case::ten(&[1, 2, 3, 10, 40, 41, 60, 61, 99])]
    fn test_reassembly_is_byte_identical(mut established: Association, #[case] offsets: &[usize]) {
        let command = store_command(true);
        let dataset: Vec<u8> = (0..120u8).collect();
        let command_offsets: Vec<usize> = offsets.iter().copied().filter(|&o| o < command.len()).collect();

        let mut values = split_at(&command, &command_offsets, PDataValueType::Command);
        values.extend(split_at(&dataset, offsets, PDataValueType::Data));

        let mut events = Vec::new();
        for pdv in values {
            events.extend(established.handle_pdu(Pdu::PData { data: vec![pdv] }).unwrap());
        }
        assert_eq!(events.len(), 1, "exactly one complete message");
        let AssociationEvent::Message(message) = &events[0] else {
            panic!("expected a message, got {:?}", events[0]);
        };
        assert_eq!(message.presentation_context_id, 3);
        assert_eq!(message.command, Command::decode(&command).unwrap());
        assert_eq!(message.dataset.as_deref(), Some(dataset.as_slice()));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(10)]
    fn test_fragment_pdvs(#[case] n: usize) {
        let max_pdu_length = 106;
        let bytes: Vec<u8> = (0..(n * 100)).map(|i| i as u8).collect();
        let values = fragment_pdvs(7, PDataValueType::Data, &bytes, max_pdu_length);
        assert_eq!(values.len(), n);
        assert!(values.iter().all(|v| v.data.len() <= 100));
        assert_eq!(
            values.iter().filter(|v| v.is_last).count(),
            1,
            "only one fragment is last"
        );
        assert!(values.last().unwrap().is_last);
        let joined: Vec<u8> = values.into_iter().flat_map(|v| v.data).collect();
        assert_eq!(joined, bytes);
    }

    #[test]
    fn test_empty_stream_is_one_last_fragment() {
        let values = fragment_pdvs(1, PDataValueType::Command, &[], 0);
        assert_eq!(values.len(), 1);
        assert!(values[0].is_last);
    }

    #[rstest]
    fn test_fragment_message_respects_negotiated_length(established: Association) {
        // peer asked for 1000 bytes, we set no limit
        let dataset = vec![0u8; 2500];
        let pdus = established
            .fragment_message(3, &store_command(true), Some(&dataset))
            .unwrap();
        for pdu in &pdus {
            let Pdu::PData { data } = pdu else {
                panic!("expected P-DATA-TF");
            };
            assert!(data[0].data.len() <= 1000 - PDV_HEADER_SIZE);
        }
        let data_fragments = pdus
            .iter()
            .filter(|pdu| matches!(pdu, Pdu::PData { data } if data[0].value_type == PDataValueType::Data))
            .count();
        assert_eq!(data_fragments, 3);
    }

    #[rstest]
    fn test_release(mut established: Association) {
        let events = established.handle_pdu(Pdu::ReleaseRQ).unwrap();
        assert_eq!(events, vec![AssociationEvent::ReleaseRequested]);
        assert!(
            established
                .fragment_message(1, &store_command(false), None)
                .is_err(),
            "no new messages after a release request"
        );
        established.on_send(&Pdu::ReleaseRP).unwrap();
        assert_eq!(established.state(), AssociationState::Closed);
    }

    #[rstest]
    fn test_release_collision_is_refused(mut established: Association) {
        established.on_send(&Pdu::ReleaseRQ).unwrap();
        assert!(established.on_send(&Pdu::ReleaseRQ).is_err());
    }

    #[rstest]
    fn test_incomplete_message_is_discarded_on_abort(mut established: Association) {
        let command = store_command(true);
        let mut values = split_at(&command, &[], PDataValueType::Command);
        values.push(PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![1, 2, 3],
        });
        for pdv in values {
            assert_eq!(
                established.handle_pdu(Pdu::PData { data: vec![pdv] }).unwrap(),
                vec![]
            );
        }
        let events = established
            .handle_pdu(Pdu::AbortRQ {
                source: AbortSource::ServiceUser,
                reason: AbortReason::NotSpecified,
            })
            .unwrap();
        assert_eq!(
            events,
            vec![AssociationEvent::Aborted {
                source: AbortSource::ServiceUser,
                reason: AbortReason::NotSpecified,
            }]
        );
        assert_eq!(established.transport_closed(), 0);
    }

    #[rstest]
    fn test_data_without_command_is_a_violation(mut established: Association) {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 4],
            }],
        };
        let violation = established.handle_pdu(pdu).unwrap_err();
        assert_eq!(violation.reason, AbortReason::UnexpectedPduParameter);
    }
}
