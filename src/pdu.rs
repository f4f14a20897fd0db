//! Upper layer protocol data units (PDUs) and their binary codec.
//!
//! The codec is pure: [encode_pdu] turns a [Pdu] into bytes and [decode_pdu] reads one back,
//! reporting `Ok(None)` until the buffer holds the whole PDU. Unknown items and sub-items are
//! skipped using their own length.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::PduError;

pub const PROTOCOL_VERSION: u16 = 0x0001;
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";
pub const DEFAULT_MAX_PDU: u32 = 16_384;
/// Type, reserved byte and 4-byte length.
pub const PDU_HEADER_SIZE: usize = 6;
/// Item length, presentation context id and message control header.
pub const PDV_HEADER_SIZE: usize = 6;

const AE_TITLE_LENGTH: usize = 16;

mod pdu_type {
    pub const ASSOCIATE_RQ: u8 = 0x01;
    pub const ASSOCIATE_AC: u8 = 0x02;
    pub const ASSOCIATE_RJ: u8 = 0x03;
    pub const P_DATA_TF: u8 = 0x04;
    pub const RELEASE_RQ: u8 = 0x05;
    pub const RELEASE_RP: u8 = 0x06;
    pub const ABORT_RQ: u8 = 0x07;
}

mod item_type {
    pub const APPLICATION_CONTEXT: u8 = 0x10;
    pub const PRESENTATION_CONTEXT_RQ: u8 = 0x20;
    pub const PRESENTATION_CONTEXT_AC: u8 = 0x21;
    pub const ABSTRACT_SYNTAX: u8 = 0x30;
    pub const TRANSFER_SYNTAX: u8 = 0x40;
    pub const USER_INFORMATION: u8 = 0x50;
    pub const MAX_LENGTH: u8 = 0x51;
    pub const IMPLEMENTATION_CLASS_UID: u8 = 0x52;
    pub const ASYNC_OPERATIONS_WINDOW: u8 = 0x53;
    pub const ROLE_SELECTION: u8 = 0x54;
    pub const IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
    pub const SOP_CLASS_EXTENDED_NEGOTIATION: u8 = 0x56;
    pub const USER_IDENTITY_RQ: u8 = 0x58;
    pub const USER_IDENTITY_AC: u8 = 0x59;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociationRQ(AssociationRQ),
    AssociationAC(AssociationAC),
    AssociationRJ(AssociationRJ),
    PData { data: Vec<PDataValue> },
    ReleaseRQ,
    ReleaseRP,
    AbortRQ {
        source: AbortSource,
        reason: AbortReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationRJ {
    pub result: RejectResult,
    pub source: RejectSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    /// Only present when the context was accepted.
    pub transfer_syntax: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance,
    UserRejection,
    /// Provider rejection, no reason given.
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    pub fn code(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self, PduError> {
        Ok(match code {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            2 => Self::NoReason,
            3 => Self::AbstractSyntaxNotSupported,
            4 => Self::TransferSyntaxesNotSupported,
            other => {
                return Err(PduError::InvalidField {
                    field: "presentation context result",
                    value: other.into(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectResult {
    Permanent,
    Transient,
}

/// Who rejected the association, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectSource {
    ServiceUser(ServiceUserReason),
    ServiceProviderAcse(AcseReason),
    ServiceProviderPresentation(PresentationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl RejectResult {
    fn code(self) -> u8 {
        match self {
            Self::Permanent => 1,
            Self::Transient => 2,
        }
    }
}

impl RejectSource {
    /// Source and reason bytes, in wire order.
    fn codes(self) -> (u8, u8) {
        match self {
            Self::ServiceUser(reason) => (
                1,
                match reason {
                    ServiceUserReason::NoReasonGiven => 1,
                    ServiceUserReason::ApplicationContextNameNotSupported => 2,
                    ServiceUserReason::CallingAeTitleNotRecognized => 3,
                    ServiceUserReason::CalledAeTitleNotRecognized => 7,
                    ServiceUserReason::Reserved(code) => code,
                },
            ),
            Self::ServiceProviderAcse(reason) => (
                2,
                match reason {
                    AcseReason::NoReasonGiven => 1,
                    AcseReason::ProtocolVersionNotSupported => 2,
                    AcseReason::Reserved(code) => code,
                },
            ),
            Self::ServiceProviderPresentation(reason) => (
                3,
                match reason {
                    PresentationReason::TemporaryCongestion => 1,
                    PresentationReason::LocalLimitExceeded => 2,
                    PresentationReason::Reserved(code) => code,
                },
            ),
        }
    }

    fn from_codes(source: u8, reason: u8) -> Result<Self, PduError> {
        Ok(match source {
            1 => Self::ServiceUser(match reason {
                1 => ServiceUserReason::NoReasonGiven,
                2 => ServiceUserReason::ApplicationContextNameNotSupported,
                3 => ServiceUserReason::CallingAeTitleNotRecognized,
                7 => ServiceUserReason::CalledAeTitleNotRecognized,
                code => ServiceUserReason::Reserved(code),
            }),
            2 => Self::ServiceProviderAcse(match reason {
                1 => AcseReason::NoReasonGiven,
                2 => AcseReason::ProtocolVersionNotSupported,
                code => AcseReason::Reserved(code),
            }),
            3 => Self::ServiceProviderPresentation(match reason {
                1 => PresentationReason::TemporaryCongestion,
                2 => PresentationReason::LocalLimitExceeded,
                code => PresentationReason::Reserved(code),
            }),
            other => {
                return Err(PduError::InvalidField {
                    field: "A-ASSOCIATE-RJ source",
                    value: other.into(),
                });
            }
        })
    }
}

impl fmt::Display for AssociationRJ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} rejection by {:?}", self.result, self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    ServiceUser,
    Reserved,
    ServiceProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameterValue,
    Reserved(u8),
}

impl AbortSource {
    fn code(self) -> u8 {
        match self {
            Self::ServiceUser => 0,
            Self::Reserved => 1,
            Self::ServiceProvider => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self, PduError> {
        Ok(match code {
            0 => Self::ServiceUser,
            1 => Self::Reserved,
            2 => Self::ServiceProvider,
            other => {
                return Err(PduError::InvalidField {
                    field: "A-ABORT source",
                    value: other.into(),
                });
            }
        })
    }
}

impl AbortReason {
    fn code(self) -> u8 {
        match self {
            Self::NotSpecified => 0,
            Self::UnrecognizedPdu => 1,
            Self::UnexpectedPdu => 2,
            Self::UnrecognizedPduParameter => 4,
            Self::UnexpectedPduParameter => 5,
            Self::InvalidPduParameterValue => 6,
            Self::Reserved(code) => code,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NotSpecified,
            1 => Self::UnrecognizedPdu,
            2 => Self::UnexpectedPdu,
            4 => Self::UnrecognizedPduParameter,
            5 => Self::UnexpectedPduParameter,
            6 => Self::InvalidPduParameterValue,
            code => Self::Reserved(code),
        }
    }
}

/// Sub-items of the user information item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariableItem {
    /// Maximum length of a P-DATA-TF body the sender can receive. 0 means unlimited.
    MaxLength(u32),
    ImplementationClassUid(String),
    AsyncOperationsWindow { invoked: u16, performed: u16 },
    RoleSelection(RoleSelection),
    ImplementationVersionName(String),
    SopClassExtendedNegotiation { sop_class_uid: String, data: Vec<u8> },
    UserIdentityRq(UserIdentity),
    UserIdentityAc { server_response: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub identity_type: UserIdentityType,
    pub positive_response_requested: bool,
    pub primary_field: Vec<u8>,
    pub secondary_field: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIdentityType {
    Username,
    UsernamePasscode,
    Kerberos,
    Saml,
    Jwt,
    Other(u8),
}

impl UserIdentityType {
    fn code(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePasscode => 2,
            Self::Kerberos => 3,
            Self::Saml => 4,
            Self::Jwt => 5,
            Self::Other(code) => code,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Username,
            2 => Self::UsernamePasscode,
            3 => Self::Kerberos,
            4 => Self::Saml,
            5 => Self::Jwt,
            code => Self::Other(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}

/// One presentation data value item of a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl Pdu {
    /// One-line summary of the PDU, for logs.
    pub fn short_description(&self) -> String {
        match self {
            Pdu::AssociationRQ(rq) => format!(
                "A-ASSOCIATE-RQ {} -> {} ({} presentation contexts)",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => format!(
                "A-ASSOCIATE-AC ({} of {} presentation contexts accepted)",
                ac.presentation_contexts
                    .iter()
                    .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                    .count(),
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ(rj) => format!("A-ASSOCIATE-RJ ({rj})"),
            Pdu::PData { data } => {
                let values: Vec<String> = data
                    .iter()
                    .map(|pdv| {
                        format!(
                            "[pc {} {}{} {} bytes]",
                            pdv.presentation_context_id,
                            match pdv.value_type {
                                PDataValueType::Command => "command",
                                PDataValueType::Data => "data",
                            },
                            if pdv.is_last { " last" } else { "" },
                            pdv.data.len()
                        )
                    })
                    .collect();
                format!("P-DATA-TF {}", values.join(" "))
            }
            Pdu::ReleaseRQ => "A-RELEASE-RQ".to_string(),
            Pdu::ReleaseRP => "A-RELEASE-RP".to_string(),
            Pdu::AbortRQ { source, reason } => format!("A-ABORT ({source:?}, {reason:?})"),
        }
    }
}

/// Encode a PDU, header included.
pub fn encode_pdu(pdu: &Pdu) -> Result<Bytes, PduError> {
    let mut body = BytesMut::new();
    let pdu_type = match pdu {
        Pdu::AssociationRQ(rq) => {
            write_association_header(
                &mut body,
                rq.protocol_version,
                &rq.called_ae_title,
                &rq.calling_ae_title,
            )?;
            put_item(
                &mut body,
                item_type::APPLICATION_CONTEXT,
                rq.application_context_name.as_bytes(),
            )?;
            for pc in &rq.presentation_contexts {
                let mut pc_body = BytesMut::new();
                pc_body.put_u8(pc.id);
                pc_body.put_bytes(0, 3);
                put_item(
                    &mut pc_body,
                    item_type::ABSTRACT_SYNTAX,
                    pc.abstract_syntax.as_bytes(),
                )?;
                for ts in &pc.transfer_syntaxes {
                    put_item(&mut pc_body, item_type::TRANSFER_SYNTAX, ts.as_bytes())?;
                }
                put_item(&mut body, item_type::PRESENTATION_CONTEXT_RQ, &pc_body)?;
            }
            write_user_variables(&mut body, &rq.user_variables)?;
            pdu_type::ASSOCIATE_RQ
        }
        Pdu::AssociationAC(ac) => {
            write_association_header(
                &mut body,
                ac.protocol_version,
                &ac.called_ae_title,
                &ac.calling_ae_title,
            )?;
            put_item(
                &mut body,
                item_type::APPLICATION_CONTEXT,
                ac.application_context_name.as_bytes(),
            )?;
            for pc in &ac.presentation_contexts {
                let mut pc_body = BytesMut::new();
                pc_body.put_u8(pc.id);
                pc_body.put_u8(0);
                pc_body.put_u8(pc.reason.code());
                pc_body.put_u8(0);
                let ts = pc.transfer_syntax.as_deref().unwrap_or_default();
                put_item(&mut pc_body, item_type::TRANSFER_SYNTAX, ts.as_bytes())?;
                put_item(&mut body, item_type::PRESENTATION_CONTEXT_AC, &pc_body)?;
            }
            write_user_variables(&mut body, &ac.user_variables)?;
            pdu_type::ASSOCIATE_AC
        }
        Pdu::AssociationRJ(rj) => {
            let (source, reason) = rj.source.codes();
            body.put_u8(0);
            body.put_u8(rj.result.code());
            body.put_u8(source);
            body.put_u8(reason);
            pdu_type::ASSOCIATE_RJ
        }
        Pdu::PData { data } => {
            for pdv in data {
                let length = u32::try_from(pdv.data.len() + 2).map_err(|_| PduError::TooLarge {
                    length: u32::MAX,
                    maximum: u32::MAX,
                })?;
                body.put_u32(length);
                body.put_u8(pdv.presentation_context_id);
                let mut control = 0u8;
                if pdv.value_type == PDataValueType::Command {
                    control |= 0x01;
                }
                if pdv.is_last {
                    control |= 0x02;
                }
                body.put_u8(control);
                body.put_slice(&pdv.data);
            }
            pdu_type::P_DATA_TF
        }
        Pdu::ReleaseRQ => {
            body.put_bytes(0, 4);
            pdu_type::RELEASE_RQ
        }
        Pdu::ReleaseRP => {
            body.put_bytes(0, 4);
            pdu_type::RELEASE_RP
        }
        Pdu::AbortRQ { source, reason } => {
            body.put_bytes(0, 2);
            body.put_u8(source.code());
            body.put_u8(reason.code());
            pdu_type::ABORT_RQ
        }
    };

    let length = u32::try_from(body.len()).map_err(|_| PduError::TooLarge {
        length: u32::MAX,
        maximum: u32::MAX,
    })?;
    let mut out = BytesMut::with_capacity(PDU_HEADER_SIZE + body.len());
    out.put_u8(pdu_type);
    out.put_u8(0);
    out.put_u32(length);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Read the PDU type and declared body length, if enough bytes are buffered.
///
/// An unknown type byte is an error as soon as it is seen.
pub fn pdu_header(buf: &[u8]) -> Result<Option<(u8, u32)>, PduError> {
    let Some(&pdu_type) = buf.first() else {
        return Ok(None);
    };
    if !(pdu_type::ASSOCIATE_RQ..=pdu_type::ABORT_RQ).contains(&pdu_type) {
        return Err(PduError::UnknownPduType(pdu_type));
    }
    if buf.len() < PDU_HEADER_SIZE {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    Ok(Some((pdu_type, length)))
}

/// Decode one PDU from the front of `buf`.
///
/// Returns the PDU and the number of bytes it occupied, or `None` when the buffer does not yet
/// hold the complete PDU.
pub fn decode_pdu(buf: &[u8]) -> Result<Option<(Pdu, usize)>, PduError> {
    let Some((pdu_type, length)) = pdu_header(buf)? else {
        return Ok(None);
    };
    let total = PDU_HEADER_SIZE + length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let mut body = Reader::new(&buf[PDU_HEADER_SIZE..total]);
    let pdu = match pdu_type {
        pdu_type::ASSOCIATE_RQ => Pdu::AssociationRQ(read_association_rq(&mut body)?),
        pdu_type::ASSOCIATE_AC => Pdu::AssociationAC(read_association_ac(&mut body)?),
        pdu_type::ASSOCIATE_RJ => {
            body.skip(1, "A-ASSOCIATE-RJ")?;
            let result = match body.u8("A-ASSOCIATE-RJ result")? {
                1 => RejectResult::Permanent,
                2 => RejectResult::Transient,
                other => {
                    return Err(PduError::InvalidField {
                        field: "A-ASSOCIATE-RJ result",
                        value: other.into(),
                    });
                }
            };
            let source = body.u8("A-ASSOCIATE-RJ source")?;
            let reason = body.u8("A-ASSOCIATE-RJ reason")?;
            Pdu::AssociationRJ(AssociationRJ {
                result,
                source: RejectSource::from_codes(source, reason)?,
            })
        }
        pdu_type::P_DATA_TF => {
            let mut data = Vec::new();
            while !body.is_empty() {
                let length = body.u32("PDV item length")?;
                if length < 2 {
                    return Err(PduError::InvalidField {
                        field: "PDV item length",
                        value: length,
                    });
                }
                let item = body.take(length as usize, "PDV item")?;
                let control = item[1];
                data.push(PDataValue {
                    presentation_context_id: item[0],
                    value_type: if control & 0x01 != 0 {
                        PDataValueType::Command
                    } else {
                        PDataValueType::Data
                    },
                    is_last: control & 0x02 != 0,
                    data: item[2..].to_vec(),
                });
            }
            Pdu::PData { data }
        }
        pdu_type::RELEASE_RQ => Pdu::ReleaseRQ,
        pdu_type::RELEASE_RP => Pdu::ReleaseRP,
        _ => {
            body.skip(2, "A-ABORT")?;
            let source = AbortSource::from_code(body.u8("A-ABORT source")?)?;
            let reason = AbortReason::from_code(body.u8("A-ABORT reason")?);
            Pdu::AbortRQ { source, reason }
        }
    };
    Ok(Some((pdu, total)))
}

fn write_association_header(
    out: &mut BytesMut,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<(), PduError> {
    out.put_u16(protocol_version);
    out.put_u16(0);
    put_ae_title(out, called_ae_title)?;
    put_ae_title(out, calling_ae_title)?;
    out.put_bytes(0, 32);
    Ok(())
}

fn put_ae_title(out: &mut BytesMut, ae_title: &str) -> Result<(), PduError> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty() || trimmed.len() > AE_TITLE_LENGTH || !trimmed.is_ascii() {
        return Err(PduError::InvalidAeTitle(ae_title.to_string()));
    }
    out.put_slice(trimmed.as_bytes());
    out.put_bytes(b' ', AE_TITLE_LENGTH - trimmed.len());
    Ok(())
}

fn put_item(out: &mut BytesMut, item_type: u8, body: &[u8]) -> Result<(), PduError> {
    let length = u16::try_from(body.len()).map_err(|_| PduError::ItemTooLong {
        item_type,
        length: body.len(),
    })?;
    out.put_u8(item_type);
    out.put_u8(0);
    out.put_u16(length);
    out.put_slice(body);
    Ok(())
}

/// Put a string preceded by its own 2-byte length, as used inside some user information sub-items.
fn put_u16_prefixed(out: &mut BytesMut, item_type: u8, value: &[u8]) -> Result<(), PduError> {
    let length = u16::try_from(value.len()).map_err(|_| PduError::ItemTooLong {
        item_type,
        length: value.len(),
    })?;
    out.put_u16(length);
    out.put_slice(value);
    Ok(())
}

fn write_user_variables(out: &mut BytesMut, items: &[UserVariableItem]) -> Result<(), PduError> {
    let mut body = BytesMut::new();
    for item in items {
        let mut sub = BytesMut::new();
        let sub_type = match item {
            UserVariableItem::MaxLength(length) => {
                sub.put_u32(*length);
                item_type::MAX_LENGTH
            }
            UserVariableItem::ImplementationClassUid(uid) => {
                sub.put_slice(uid.as_bytes());
                item_type::IMPLEMENTATION_CLASS_UID
            }
            UserVariableItem::AsyncOperationsWindow { invoked, performed } => {
                sub.put_u16(*invoked);
                sub.put_u16(*performed);
                item_type::ASYNC_OPERATIONS_WINDOW
            }
            UserVariableItem::RoleSelection(role) => {
                put_u16_prefixed(
                    &mut sub,
                    item_type::ROLE_SELECTION,
                    role.sop_class_uid.as_bytes(),
                )?;
                sub.put_u8(role.scu_role.into());
                sub.put_u8(role.scp_role.into());
                item_type::ROLE_SELECTION
            }
            UserVariableItem::ImplementationVersionName(name) => {
                sub.put_slice(name.as_bytes());
                item_type::IMPLEMENTATION_VERSION_NAME
            }
            UserVariableItem::SopClassExtendedNegotiation {
                sop_class_uid,
                data,
            } => {
                put_u16_prefixed(
                    &mut sub,
                    item_type::SOP_CLASS_EXTENDED_NEGOTIATION,
                    sop_class_uid.as_bytes(),
                )?;
                sub.put_slice(data);
                item_type::SOP_CLASS_EXTENDED_NEGOTIATION
            }
            UserVariableItem::UserIdentityRq(identity) => {
                sub.put_u8(identity.identity_type.code());
                sub.put_u8(identity.positive_response_requested.into());
                put_u16_prefixed(&mut sub, item_type::USER_IDENTITY_RQ, &identity.primary_field)?;
                put_u16_prefixed(
                    &mut sub,
                    item_type::USER_IDENTITY_RQ,
                    &identity.secondary_field,
                )?;
                item_type::USER_IDENTITY_RQ
            }
            UserVariableItem::UserIdentityAc { server_response } => {
                put_u16_prefixed(&mut sub, item_type::USER_IDENTITY_AC, server_response)?;
                item_type::USER_IDENTITY_AC
            }
        };
        put_item(&mut body, sub_type, &sub)?;
    }
    put_item(out, item_type::USER_INFORMATION, &body)
}

fn read_association_header(r: &mut Reader<'_>) -> Result<(u16, String, String), PduError> {
    let protocol_version = r.u16("protocol version")?;
    r.skip(2, "A-ASSOCIATE header")?;
    let called = ae_title_from(r.take(AE_TITLE_LENGTH, "called AE title")?);
    let calling = ae_title_from(r.take(AE_TITLE_LENGTH, "calling AE title")?);
    r.skip(32, "A-ASSOCIATE header")?;
    Ok((protocol_version, called, calling))
}

fn read_association_rq(r: &mut Reader<'_>) -> Result<AssociationRQ, PduError> {
    let (protocol_version, called_ae_title, calling_ae_title) = read_association_header(r)?;
    let mut application_context_name = String::new();
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();
    while !r.is_empty() {
        let (kind, mut item) = r.item("A-ASSOCIATE-RQ item")?;
        match kind {
            item_type::APPLICATION_CONTEXT => application_context_name = uid_from(item.rest()),
            item_type::PRESENTATION_CONTEXT_RQ => {
                let id = item.u8("presentation context id")?;
                item.skip(3, "presentation context item")?;
                let mut abstract_syntax = String::new();
                let mut transfer_syntaxes = Vec::new();
                while !item.is_empty() {
                    let (sub_kind, mut sub) = item.item("presentation context sub-item")?;
                    match sub_kind {
                        item_type::ABSTRACT_SYNTAX => abstract_syntax = uid_from(sub.rest()),
                        item_type::TRANSFER_SYNTAX => transfer_syntaxes.push(uid_from(sub.rest())),
                        other => tracing::debug!("skipping presentation context sub-item 0x{other:02X}"),
                    }
                }
                presentation_contexts.push(PresentationContextProposed {
                    id,
                    abstract_syntax,
                    transfer_syntaxes,
                });
            }
            item_type::USER_INFORMATION => user_variables = read_user_variables(&mut item)?,
            other => tracing::debug!("skipping A-ASSOCIATE-RQ item 0x{other:02X}"),
        }
    }
    Ok(AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_ac(r: &mut Reader<'_>) -> Result<AssociationAC, PduError> {
    let (protocol_version, called_ae_title, calling_ae_title) = read_association_header(r)?;
    let mut application_context_name = String::new();
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();
    while !r.is_empty() {
        let (kind, mut item) = r.item("A-ASSOCIATE-AC item")?;
        match kind {
            item_type::APPLICATION_CONTEXT => application_context_name = uid_from(item.rest()),
            item_type::PRESENTATION_CONTEXT_AC => {
                let id = item.u8("presentation context id")?;
                item.skip(1, "presentation context item")?;
                let reason =
                    PresentationContextResultReason::from_code(item.u8("presentation context result")?)?;
                item.skip(1, "presentation context item")?;
                let mut transfer_syntax = None;
                while !item.is_empty() {
                    let (sub_kind, mut sub) = item.item("presentation context sub-item")?;
                    if sub_kind == item_type::TRANSFER_SYNTAX {
                        let uid = uid_from(sub.rest());
                        if reason == PresentationContextResultReason::Acceptance && !uid.is_empty() {
                            transfer_syntax = Some(uid);
                        }
                    }
                }
                presentation_contexts.push(PresentationContextResult {
                    id,
                    reason,
                    transfer_syntax,
                });
            }
            item_type::USER_INFORMATION => user_variables = read_user_variables(&mut item)?,
            other => tracing::debug!("skipping A-ASSOCIATE-AC item 0x{other:02X}"),
        }
    }
    Ok(AssociationAC {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        user_variables,
    })
}

fn read_user_variables(r: &mut Reader<'_>) -> Result<Vec<UserVariableItem>, PduError> {
    let mut items = Vec::new();
    while !r.is_empty() {
        let (kind, mut sub) = r.item("user information sub-item")?;
        let item = match kind {
            item_type::MAX_LENGTH => UserVariableItem::MaxLength(sub.u32("maximum length")?),
            item_type::IMPLEMENTATION_CLASS_UID => {
                UserVariableItem::ImplementationClassUid(uid_from(sub.rest()))
            }
            item_type::ASYNC_OPERATIONS_WINDOW => UserVariableItem::AsyncOperationsWindow {
                invoked: sub.u16("maximum operations invoked")?,
                performed: sub.u16("maximum operations performed")?,
            },
            item_type::ROLE_SELECTION => {
                let sop_class_uid = uid_from(sub.u16_prefixed("role selection SOP class UID")?);
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid,
                    scu_role: sub.u8("SCU role")? != 0,
                    scp_role: sub.u8("SCP role")? != 0,
                })
            }
            item_type::IMPLEMENTATION_VERSION_NAME => {
                UserVariableItem::ImplementationVersionName(uid_from(sub.rest()))
            }
            item_type::SOP_CLASS_EXTENDED_NEGOTIATION => {
                let sop_class_uid = uid_from(sub.u16_prefixed("extended negotiation SOP class UID")?);
                UserVariableItem::SopClassExtendedNegotiation {
                    sop_class_uid,
                    data: sub.rest().to_vec(),
                }
            }
            item_type::USER_IDENTITY_RQ => UserVariableItem::UserIdentityRq(UserIdentity {
                identity_type: UserIdentityType::from_code(sub.u8("user identity type")?),
                positive_response_requested: sub.u8("positive response requested")? != 0,
                primary_field: sub.u16_prefixed("user identity primary field")?.to_vec(),
                secondary_field: sub.u16_prefixed("user identity secondary field")?.to_vec(),
            }),
            item_type::USER_IDENTITY_AC => UserVariableItem::UserIdentityAc {
                server_response: sub.u16_prefixed("user identity server response")?.to_vec(),
            },
            other => {
                tracing::debug!("skipping user information sub-item 0x{other:02X}");
                continue;
            }
        };
        items.push(item);
    }
    Ok(items)
}

fn ae_title_from(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches([' ', '\0'])
        .to_string()
}

fn uid_from(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

/// Bounds-checked big-endian reader over a PDU body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], PduError> {
        if self.buf.len() < n {
            return Err(PduError::Truncated {
                what,
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), PduError> {
        self.take(n, what).map(|_| ())
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, PduError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, PduError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, PduError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u16_prefixed(&mut self, what: &'static str) -> Result<&'a [u8], PduError> {
        let length = self.u16(what)? as usize;
        self.take(length, what)
    }

    /// Read an item header (type, reserved byte, 2-byte length) and return its body.
    fn item(&mut self, what: &'static str) -> Result<(u8, Reader<'a>), PduError> {
        let kind = self.u8(what)?;
        self.skip(1, what)?;
        let length = self.u16(what)? as usize;
        Ok((kind, Reader::new(self.take(length, what)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn association_rq() -> AssociationRQ {
        AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "STORESCU".to_string(),
            called_ae_title: "OXIDIMSE".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: "1.2.840.10008.1.1".to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                    transfer_syntaxes: vec![
                        "1.2.840.10008.1.2.1".to_string(),
                        "1.2.840.10008.1.2".to_string(),
                    ],
                },
            ],
            user_variables: vec![
                UserVariableItem::MaxLength(DEFAULT_MAX_PDU),
                UserVariableItem::ImplementationClassUid("2.25.1234".to_string()),
                UserVariableItem::AsyncOperationsWindow {
                    invoked: 1,
                    performed: 1,
                },
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                    scu_role: false,
                    scp_role: true,
                }),
                UserVariableItem::ImplementationVersionName("OXIDIMSE".to_string()),
                UserVariableItem::SopClassExtendedNegotiation {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                    data: vec![1, 0, 1],
                },
                UserVariableItem::UserIdentityRq(UserIdentity {
                    identity_type: UserIdentityType::UsernamePasscode,
                    positive_response_requested: true,
                    primary_field: b"Username".to_vec(),
                    secondary_field: b"Password".to_vec(),
                }),
            ],
        }
    }

    fn round_trip(pdu: Pdu) {
        let bytes = encode_pdu(&pdu).unwrap();
        let (decoded, consumed) = decode_pdu(&bytes).unwrap().expect("complete PDU");
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, pdu);
    }

    #[rstest]
    fn test_association_rq_round_trip(association_rq: AssociationRQ) {
        round_trip(Pdu::AssociationRQ(association_rq));
    }

    #[rstest]
    fn test_association_rq_without_user_variables(mut association_rq: AssociationRQ) {
        association_rq.user_variables.clear();
        round_trip(Pdu::AssociationRQ(association_rq));
    }

    #[test]
    fn test_association_ac_round_trip() {
        round_trip(Pdu::AssociationAC(AssociationAC {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "STORESCU".to_string(),
            called_ae_title: "OXIDIMSE".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: Some("1.2.840.10008.1.2".to_string()),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: None,
                },
            ],
            user_variables: vec![
                UserVariableItem::MaxLength(0),
                UserVariableItem::UserIdentityAc {
                    server_response: vec![],
                },
            ],
        }));
    }

    #[rstest]
    #[case(RejectResult::Permanent, RejectSource::ServiceUser(ServiceUserReason::CallingAeTitleNotRecognized))]
    #[case(RejectResult::Permanent, RejectSource::ServiceUser(ServiceUserReason::CalledAeTitleNotRecognized))]
    #[case(RejectResult::Permanent, RejectSource::ServiceProviderAcse(AcseReason::ProtocolVersionNotSupported))]
    #[case(RejectResult::Transient, RejectSource::ServiceProviderPresentation(PresentationReason::TemporaryCongestion))]
    fn test_association_rj_round_trip(#[case] result: RejectResult, #[case] source: RejectSource) {
        round_trip(Pdu::AssociationRJ(AssociationRJ { result, source }));
    }

    #[rstest]
    #[case(Pdu::ReleaseRQ)]
    #[case(Pdu::ReleaseRP)]
    #[case(Pdu::AbortRQ { source: AbortSource::ServiceProvider, reason: AbortReason::UnexpectedPdu })]
    #[case(Pdu::PData { data: vec![
        PDataValue { presentation_context_id: 1, value_type: PDataValueType::Command, is_last: true, data: vec![1, 2, 3] },
        PDataValue { presentation_context_id: 1, value_type: PDataValueType::Data, is_last: false, data: vec![] },
    ] })]
    fn test_simple_pdu_round_trip(#[case] pdu: Pdu) {
        round_trip(pdu);
    }

    #[test]
    fn test_abort_wire_bytes() {
        let bytes = encode_pdu(&Pdu::AbortRQ {
            source: AbortSource::ServiceProvider,
            reason: AbortReason::UnexpectedPdu,
        })
        .unwrap();
        assert_eq!(bytes.as_ref(), &[0x07, 0, 0, 0, 0, 4, 0, 0, 2, 2]);
    }

    #[test]
    fn test_pdv_control_byte() {
        let bytes = encode_pdu(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 5,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xAB],
            }],
        })
        .unwrap();
        assert_eq!(bytes.as_ref(), &[0x04, 0, 0, 0, 0, 7, 0, 0, 0, 3, 5, 0x03, 0xAB]);
    }

    #[rstest]
    fn test_incomplete_pdu_is_not_an_error(association_rq: AssociationRQ) {
        let bytes = encode_pdu(&Pdu::AssociationRQ(association_rq)).unwrap();
        for cut in [0, 1, 5, 6, bytes.len() - 1] {
            assert_eq!(decode_pdu(&bytes[..cut]), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes_are_left_for_the_next_pdu() {
        let mut bytes = encode_pdu(&Pdu::ReleaseRQ).unwrap().to_vec();
        bytes.extend_from_slice(&encode_pdu(&Pdu::ReleaseRP).unwrap());
        let (pdu, consumed) = decode_pdu(&bytes).unwrap().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        assert_eq!(consumed, 10);
        let (pdu, _) = decode_pdu(&bytes[consumed..]).unwrap().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRP);
    }

    #[rstest]
    #[case(0x00)]
    #[case(0x08)]
    #[case(0xFF)]
    fn test_unknown_pdu_type_is_fatal(#[case] pdu_type: u8) {
        assert_eq!(
            decode_pdu(&[pdu_type]),
            Err(PduError::UnknownPduType(pdu_type))
        );
    }

    #[rstest]
    fn test_unknown_sub_items_are_skipped(association_rq: AssociationRQ) {
        let mut expected = association_rq.clone();
        expected.user_variables = vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)];
        let mut without_user_info = association_rq;
        without_user_info.user_variables = vec![];

        let bytes = encode_pdu(&Pdu::AssociationRQ(without_user_info)).unwrap();
        // replace the empty user information item with one holding an unknown sub-item
        let mut body = bytes[PDU_HEADER_SIZE..bytes.len() - 4].to_vec();
        body.extend_from_slice(&[0x50, 0, 0, 16]);
        body.extend_from_slice(&[0x5F, 0, 0, 4, 9, 9, 9, 9]);
        body.extend_from_slice(&[0x51, 0, 0, 4, 0, 0, 0x40, 0]);
        body.extend_from_slice(&[0x7E, 0, 0, 2, 1, 1]);
        let mut pdu = vec![0x01, 0];
        pdu.extend_from_slice(&(body.len() as u32).to_be_bytes());
        pdu.extend_from_slice(&body);

        let (decoded, _) = decode_pdu(&pdu).unwrap().unwrap();
        assert_eq!(decoded, Pdu::AssociationRQ(expected));
    }

    #[test]
    fn test_ae_title_is_padded_and_trimmed() {
        let rq = AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        };
        let bytes = encode_pdu(&Pdu::AssociationRQ(rq.clone())).unwrap();
        assert_eq!(&bytes[10..26], b"ANY-SCP         ");
        assert_eq!(&bytes[26..42], b"SCU             ");
        let (decoded, _) = decode_pdu(&bytes).unwrap().unwrap();
        assert_eq!(decoded, Pdu::AssociationRQ(rq));
    }

    #[rstest]
    #[case("")]
    #[case("THIS-TITLE-IS-TOO-LONG")]
    fn test_invalid_ae_title(#[case] title: &str) {
        let rq = AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: title.to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        };
        assert_eq!(
            encode_pdu(&Pdu::AssociationRQ(rq)),
            Err(PduError::InvalidAeTitle(title.to_string()))
        );
    }

    #[test]
    fn test_short_pdv_item_is_fatal() {
        let bytes = [0x04, 0, 0, 0, 0, 5, 0, 0, 0, 1, 1];
        assert!(matches!(
            decode_pdu(&bytes),
            Err(PduError::InvalidField { field: "PDV item length", value: 1 })
        ));
    }
}
