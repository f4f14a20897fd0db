//! DIMSE command sets.
//!
//! A command set is always written in implicit VR little endian, whatever transfer syntax was
//! negotiated for the data set that may follow it.

use std::fmt;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;

use crate::error::CommandError;

/// Elements of the command group (0000,xxxx).
pub mod tags {
    use dicom::core::Tag;

    pub const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
    pub const REQUESTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0003);
    pub const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
    pub const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
    pub const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
    pub const PRIORITY: Tag = Tag(0x0000, 0x0700);
    pub const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
    pub const STATUS: Tag = Tag(0x0000, 0x0900);
    pub const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
    pub const ERROR_ID: Tag = Tag(0x0000, 0x0903);
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
    pub const REQUESTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1001);
    pub const EVENT_TYPE_ID: Tag = Tag(0x0000, 0x1002);
    pub const ATTRIBUTE_IDENTIFIER_LIST: Tag = Tag(0x0000, 0x1005);
    pub const ACTION_TYPE_ID: Tag = Tag(0x0000, 0x1008);
    pub const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
    pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
    pub const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
    pub const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);
    pub const MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE: Tag = Tag(0x0000, 0x1030);
    pub const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);
}

/// Value of Command Data Set Type when no data set follows the command.
pub const DATA_SET_MISSING: u16 = 0x0101;
/// Any other value means a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            Self::CStoreRq => 0x0001,
            Self::CStoreRsp => 0x8001,
            Self::CGetRq => 0x0010,
            Self::CGetRsp => 0x8010,
            Self::CFindRq => 0x0020,
            Self::CFindRsp => 0x8020,
            Self::CMoveRq => 0x0021,
            Self::CMoveRsp => 0x8021,
            Self::CEchoRq => 0x0030,
            Self::CEchoRsp => 0x8030,
            Self::NEventReportRq => 0x0100,
            Self::NEventReportRsp => 0x8100,
            Self::NGetRq => 0x0110,
            Self::NGetRsp => 0x8110,
            Self::NSetRq => 0x0120,
            Self::NSetRsp => 0x8120,
            Self::NActionRq => 0x0130,
            Self::NActionRsp => 0x8130,
            Self::NCreateRq => 0x0140,
            Self::NCreateRsp => 0x8140,
            Self::NDeleteRq => 0x0150,
            Self::NDeleteRsp => 0x8150,
            Self::CCancelRq => 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => Self::CStoreRq,
            0x8001 => Self::CStoreRsp,
            0x0010 => Self::CGetRq,
            0x8010 => Self::CGetRsp,
            0x0020 => Self::CFindRq,
            0x8020 => Self::CFindRsp,
            0x0021 => Self::CMoveRq,
            0x8021 => Self::CMoveRsp,
            0x0030 => Self::CEchoRq,
            0x8030 => Self::CEchoRsp,
            0x0100 => Self::NEventReportRq,
            0x8100 => Self::NEventReportRsp,
            0x0110 => Self::NGetRq,
            0x8110 => Self::NGetRsp,
            0x0120 => Self::NSetRq,
            0x8120 => Self::NSetRsp,
            0x0130 => Self::NActionRq,
            0x8130 => Self::NActionRsp,
            0x0140 => Self::NCreateRq,
            0x8140 => Self::NCreateRsp,
            0x0150 => Self::NDeleteRq,
            0x8150 => Self::NDeleteRsp,
            0x0FFF => Self::CCancelRq,
            _ => return None,
        })
    }

    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// The response field answering this request. C-CANCEL and responses have none.
    pub fn response(self) -> Option<Self> {
        if self.is_response() || self == Self::CCancelRq {
            return None;
        }
        Self::from_code(self.code() | 0x8000)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CStoreRq => "C-STORE-RQ",
            Self::CStoreRsp => "C-STORE-RSP",
            Self::CGetRq => "C-GET-RQ",
            Self::CGetRsp => "C-GET-RSP",
            Self::CFindRq => "C-FIND-RQ",
            Self::CFindRsp => "C-FIND-RSP",
            Self::CMoveRq => "C-MOVE-RQ",
            Self::CMoveRsp => "C-MOVE-RSP",
            Self::CEchoRq => "C-ECHO-RQ",
            Self::CEchoRsp => "C-ECHO-RSP",
            Self::NEventReportRq => "N-EVENT-REPORT-RQ",
            Self::NEventReportRsp => "N-EVENT-REPORT-RSP",
            Self::NGetRq => "N-GET-RQ",
            Self::NGetRsp => "N-GET-RSP",
            Self::NSetRq => "N-SET-RQ",
            Self::NSetRsp => "N-SET-RSP",
            Self::NActionRq => "N-ACTION-RQ",
            Self::NActionRsp => "N-ACTION-RSP",
            Self::NCreateRq => "N-CREATE-RQ",
            Self::NCreateRsp => "N-CREATE-RSP",
            Self::NDeleteRq => "N-DELETE-RQ",
            Self::NDeleteRsp => "N-DELETE-RSP",
            Self::CCancelRq => "C-CANCEL-RQ",
        }
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    fn code(self) -> u16 {
        match self {
            Self::Medium => 0x0000,
            Self::High => 0x0001,
            Self::Low => 0x0002,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Self::High,
            0x0002 => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// DIMSE status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const PENDING: Status = Status(0xFF00);
    pub const PENDING_WITH_WARNINGS: Status = Status(0xFF01);
    pub const CANCEL: Status = Status(0xFE00);
    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    pub const NO_SUCH_OBJECT_INSTANCE: Status = Status(0x0112);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const OUT_OF_RESOURCES: Status = Status(0xA700);
    pub const CANNOT_UNDERSTAND: Status = Status(0xC000);

    pub fn kind(self) -> StatusKind {
        match self.0 {
            0x0000 => StatusKind::Success,
            0xFF00 | 0xFF01 => StatusKind::Pending,
            0xFE00 => StatusKind::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusKind::Warning,
            _ => StatusKind::Failure,
        }
    }

    /// Whether no further responses follow one carrying this status.
    pub fn is_terminal(self) -> bool {
        self.kind() != StatusKind::Pending
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({:?})", self.0, self.kind())
    }
}

/// Sub-operation counters of C-MOVE and C-GET responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// A DIMSE command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<Priority>,
    pub has_dataset: bool,
    pub status: Option<Status>,
    pub move_destination: Option<String>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub error_comment: Option<String>,
    pub error_id: Option<u16>,
    pub event_type_id: Option<u16>,
    pub action_type_id: Option<u16>,
    pub attribute_identifier_list: Vec<Tag>,
    pub sub_operations: Option<SubOperations>,
}

impl Command {
    pub fn new(command_field: CommandField) -> Self {
        Command {
            command_field,
            message_id: None,
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            requested_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_instance_uid: None,
            priority: None,
            has_dataset: false,
            status: None,
            move_destination: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            error_comment: None,
            error_id: None,
            event_type_id: None,
            action_type_id: None,
            attribute_identifier_list: Vec::new(),
            sub_operations: None,
        }
    }

    /// Start the response to this request, echoing its message ID and SOP identifiers.
    pub fn response(&self, status: Status) -> Option<Command> {
        let mut response = Command::new(self.command_field.response()?);
        response.message_id_being_responded_to = self.message_id;
        response.affected_sop_class_uid = self
            .affected_sop_class_uid
            .clone()
            .or_else(|| self.requested_sop_class_uid.clone());
        response.affected_sop_instance_uid = self
            .affected_sop_instance_uid
            .clone()
            .or_else(|| self.requested_sop_instance_uid.clone());
        if self.command_field == CommandField::NEventReportRq {
            response.event_type_id = self.event_type_id;
        }
        if self.command_field == CommandField::NActionRq {
            response.action_type_id = self.action_type_id;
        }
        response.status = Some(status);
        Some(response)
    }

    /// The SOP class this command concerns, used to pick a presentation context.
    pub fn sop_class_uid(&self) -> Option<&str> {
        self.affected_sop_class_uid
            .as_deref()
            .or(self.requested_sop_class_uid.as_deref())
    }

    /// Check the elements the command field requires.
    pub fn validate(&self) -> Result<(), CommandError> {
        use CommandField::*;
        let field = self.command_field.name();
        let require = |present: bool, tag: Tag| {
            if present {
                Ok(())
            } else {
                Err(CommandError::Incomplete { field, tag })
            }
        };

        if self.command_field == CCancelRq {
            return require(
                self.message_id_being_responded_to.is_some(),
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
            );
        }
        if self.command_field.is_response() {
            require(
                self.message_id_being_responded_to.is_some(),
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
            )?;
            return require(self.status.is_some(), tags::STATUS);
        }

        require(self.message_id.is_some(), tags::MESSAGE_ID)?;
        match self.command_field {
            CEchoRq | CFindRq | CGetRq | CMoveRq | CStoreRq | NCreateRq => require(
                self.affected_sop_class_uid.is_some(),
                tags::AFFECTED_SOP_CLASS_UID,
            )?,
            NEventReportRq => {
                require(
                    self.affected_sop_class_uid.is_some(),
                    tags::AFFECTED_SOP_CLASS_UID,
                )?;
                require(
                    self.affected_sop_instance_uid.is_some(),
                    tags::AFFECTED_SOP_INSTANCE_UID,
                )?;
                require(self.event_type_id.is_some(), tags::EVENT_TYPE_ID)?;
            }
            NGetRq | NSetRq | NActionRq | NDeleteRq => {
                require(
                    self.requested_sop_class_uid.is_some(),
                    tags::REQUESTED_SOP_CLASS_UID,
                )?;
                require(
                    self.requested_sop_instance_uid.is_some(),
                    tags::REQUESTED_SOP_INSTANCE_UID,
                )?;
            }
            _ => {}
        }
        match self.command_field {
            CStoreRq => require(
                self.affected_sop_instance_uid.is_some(),
                tags::AFFECTED_SOP_INSTANCE_UID,
            )?,
            CMoveRq => require(self.move_destination.is_some(), tags::MOVE_DESTINATION)?,
            NActionRq => require(self.action_type_id.is_some(), tags::ACTION_TYPE_ID)?,
            _ => {}
        }
        if matches!(self.command_field, CStoreRq | CFindRq | CGetRq | CMoveRq | NSetRq)
            && !self.has_dataset
        {
            return Err(CommandError::MissingDataSet(field));
        }
        Ok(())
    }

    /// Build the command set as a DICOM object. The group length is computed for us.
    pub fn to_object(&self) -> InMemDicomObject {
        let mut elements = vec![
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [self.command_field.code()]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(
                    U16,
                    [if self.has_dataset {
                        DATA_SET_PRESENT
                    } else {
                        DATA_SET_MISSING
                    }]
                ),
            ),
        ];
        let mut put_uid = |tag: Tag, value: &Option<String>| {
            if let Some(uid) = value {
                elements.push(DataElement::new(tag, VR::UI, dicom_value!(Str, uid.as_str())));
            }
        };
        put_uid(tags::AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        put_uid(tags::REQUESTED_SOP_CLASS_UID, &self.requested_sop_class_uid);
        put_uid(tags::AFFECTED_SOP_INSTANCE_UID, &self.affected_sop_instance_uid);
        put_uid(tags::REQUESTED_SOP_INSTANCE_UID, &self.requested_sop_instance_uid);

        let us_values = [
            (tags::MESSAGE_ID, self.message_id),
            (
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            (tags::PRIORITY, self.priority.map(Priority::code)),
            (tags::STATUS, self.status.map(|s| s.0)),
            (tags::ERROR_ID, self.error_id),
            (tags::EVENT_TYPE_ID, self.event_type_id),
            (tags::ACTION_TYPE_ID, self.action_type_id),
            (
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                self.move_originator_message_id,
            ),
            (
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                self.sub_operations.and_then(|s| s.remaining),
            ),
            (
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                self.sub_operations.map(|s| s.completed),
            ),
            (
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                self.sub_operations.map(|s| s.failed),
            ),
            (
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                self.sub_operations.map(|s| s.warning),
            ),
        ];
        for (tag, value) in us_values {
            if let Some(value) = value {
                elements.push(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
            }
        }

        if let Some(destination) = &self.move_destination {
            elements.push(DataElement::new(
                tags::MOVE_DESTINATION,
                VR::AE,
                dicom_value!(Str, destination.as_str()),
            ));
        }
        if let Some(originator) = &self.move_originator_ae_title {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, originator.as_str()),
            ));
        }
        if let Some(comment) = &self.error_comment {
            elements.push(DataElement::new(
                tags::ERROR_COMMENT,
                VR::LO,
                dicom_value!(Str, comment.as_str()),
            ));
        }
        if !self.attribute_identifier_list.is_empty() {
            elements.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(self.attribute_identifier_list.iter().copied().collect()),
            ));
        }
        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Read a command from its DICOM object form.
    pub fn from_object(obj: &InMemDicomObject) -> Result<Self, CommandError> {
        let code = required_u16(obj, tags::COMMAND_FIELD)?;
        let command_field =
            CommandField::from_code(code).ok_or(CommandError::UnknownCommandField(code))?;
        let sub_operations = match command_field {
            CommandField::CMoveRsp | CommandField::CGetRsp => Some(SubOperations {
                remaining: optional_u16(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?,
                completed: optional_u16(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?
                    .unwrap_or_default(),
                failed: optional_u16(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS)?
                    .unwrap_or_default(),
                warning: optional_u16(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS)?
                    .unwrap_or_default(),
            }),
            _ => None,
        };
        let attribute_identifier_list = match obj.get(tags::ATTRIBUTE_IDENTIFIER_LIST) {
            Some(element) => match element.value().primitive() {
                Some(PrimitiveValue::Tags(tags)) => tags.iter().copied().collect(),
                Some(PrimitiveValue::Empty) | None => Vec::new(),
                Some(_) => {
                    return Err(CommandError::CouldNotRetrieve(
                        tags::ATTRIBUTE_IDENTIFIER_LIST,
                    ));
                }
            },
            None => Vec::new(),
        };
        Ok(Command {
            command_field,
            message_id: optional_u16(obj, tags::MESSAGE_ID)?,
            message_id_being_responded_to: optional_u16(obj, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            affected_sop_class_uid: optional_str(obj, tags::AFFECTED_SOP_CLASS_UID)?,
            requested_sop_class_uid: optional_str(obj, tags::REQUESTED_SOP_CLASS_UID)?,
            affected_sop_instance_uid: optional_str(obj, tags::AFFECTED_SOP_INSTANCE_UID)?,
            requested_sop_instance_uid: optional_str(obj, tags::REQUESTED_SOP_INSTANCE_UID)?,
            priority: optional_u16(obj, tags::PRIORITY)?.map(Priority::from_code),
            has_dataset: optional_u16(obj, tags::COMMAND_DATA_SET_TYPE)?
                .is_some_and(|t| t != DATA_SET_MISSING),
            status: optional_u16(obj, tags::STATUS)?.map(Status),
            move_destination: optional_str(obj, tags::MOVE_DESTINATION)?,
            move_originator_ae_title: optional_str(
                obj,
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
            )?,
            move_originator_message_id: optional_u16(obj, tags::MOVE_ORIGINATOR_MESSAGE_ID)?,
            error_comment: optional_str(obj, tags::ERROR_COMMENT)?,
            error_id: optional_u16(obj, tags::ERROR_ID)?,
            event_type_id: optional_u16(obj, tags::EVENT_TYPE_ID)?,
            action_type_id: optional_u16(obj, tags::ACTION_TYPE_ID)?,
            attribute_identifier_list,
            sub_operations,
        })
    }

    /// Validate and write the command set in implicit VR little endian.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        self.validate()?;
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut out = Vec::new();
        self.to_object().write_dataset_with_ts(&mut out, &ts)?;
        Ok(out)
    }

    /// Parse a command set written in implicit VR little endian.
    ///
    /// Missing elements are not an error here. Call [Command::validate] before acting on it.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(bytes, &ts)?;
        Command::from_object(&obj)
    }
}

fn optional_u16(obj: &InMemDicomObject, tag: Tag) -> Result<Option<u16>, CommandError> {
    obj.get(tag)
        .map(|e: &InMemElement| e.to_int::<u16>().map_err(|_| CommandError::InvalidNumber(tag)))
        .transpose()
}

fn required_u16(obj: &InMemDicomObject, tag: Tag) -> Result<u16, CommandError> {
    optional_u16(obj, tag)?.ok_or(CommandError::MissingTag(tag))
}

fn optional_str(obj: &InMemDicomObject, tag: Tag) -> Result<Option<String>, CommandError> {
    obj.get(tag)
        .map(|e| {
            e.to_str()
                .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
                .map_err(|_| CommandError::CouldNotRetrieve(tag))
        })
        .transpose()
}
