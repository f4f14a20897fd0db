//! DIMSE messages: a command set with an optional data set, and builders for every request.

use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;

use crate::command::{Command, CommandField, Priority, Status};
use crate::error::DatasetError;
use crate::uids::sop_class;

/// A command, and the data set that follows it when there is one.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: Command,
    pub dataset: Option<InMemDicomObject>,
}

impl Message {
    /// Keeps the command's data set flag in step with `dataset`.
    pub fn new(mut command: Command, dataset: Option<InMemDicomObject>) -> Self {
        command.has_dataset = dataset.is_some();
        Self { command, dataset }
    }

    /// Response to `request` with the given status. `None` for C-CANCEL and for responses.
    pub fn response_to(
        request: &Command,
        status: Status,
        dataset: Option<InMemDicomObject>,
    ) -> Option<Self> {
        Some(Self::new(request.response(status)?, dataset))
    }

    pub fn status(&self) -> Option<Status> {
        self.command.status
    }

    pub fn is_response(&self) -> bool {
        self.command.command_field.is_response()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.command.priority = Some(priority);
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        self.command.error_comment = Some(comment.into());
        self
    }

    /// Failure response to `request`. The comment is cut to the 64 characters Error Comment holds.
    pub fn failure_to(request: &Command, status: Status, comment: &str) -> Option<Self> {
        let comment: String = comment.chars().take(64).collect();
        Some(Self::response_to(request, status, None)?.with_error_comment(comment))
    }

    pub fn c_echo() -> Self {
        let mut command = Command::new(CommandField::CEchoRq);
        command.affected_sop_class_uid = Some(sop_class::VERIFICATION.to_string());
        Self::new(command, None)
    }

    /// Study root C-FIND at STUDY level. Elements of `query` replace the default return keys.
    pub fn c_find_study(query: InMemDicomObject) -> Self {
        let mut identifier = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                dicom_value!(Str, "STUDY"),
            ),
            empty(tags::STUDY_INSTANCE_UID, VR::UI),
            empty(tags::STUDY_DATE, VR::DA),
            empty(tags::STUDY_TIME, VR::TM),
            empty(tags::ACCESSION_NUMBER, VR::SH),
            empty(tags::STUDY_DESCRIPTION, VR::LO),
            empty(tags::MODALITIES_IN_STUDY, VR::CS),
            empty(tags::REFERRING_PHYSICIAN_NAME, VR::PN),
            empty(tags::PATIENT_ID, VR::LO),
            empty(tags::PATIENT_NAME, VR::PN),
            empty(tags::PATIENT_BIRTH_DATE, VR::DA),
            empty(tags::PATIENT_SEX, VR::CS),
            empty(tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS),
            empty(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
        ]);
        overlay(&mut identifier, query);
        Self::find(sop_class::STUDY_ROOT_QUERY_RETRIEVE_FIND, identifier)
    }

    /// Modality worklist C-FIND. Elements of `query` replace the default return keys.
    pub fn c_find_worklist(query: InMemDicomObject) -> Self {
        let step = InMemDicomObject::from_element_iter([
            empty(tags::SCHEDULED_STATION_AE_TITLE, VR::AE),
            empty(tags::SCHEDULED_PROCEDURE_STEP_START_DATE, VR::DA),
            empty(tags::SCHEDULED_PROCEDURE_STEP_START_TIME, VR::TM),
            empty(tags::MODALITY, VR::CS),
            empty(tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME, VR::PN),
            empty(tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO),
            empty(tags::SCHEDULED_PROCEDURE_STEP_ID, VR::SH),
            empty(tags::SCHEDULED_STATION_NAME, VR::SH),
            empty(tags::SCHEDULED_PROCEDURE_STEP_LOCATION, VR::SH),
        ]);
        let mut identifier = InMemDicomObject::from_element_iter([
            empty(tags::ACCESSION_NUMBER, VR::SH),
            empty(tags::REFERRING_PHYSICIAN_NAME, VR::PN),
            empty(tags::PATIENT_NAME, VR::PN),
            empty(tags::PATIENT_ID, VR::LO),
            empty(tags::PATIENT_BIRTH_DATE, VR::DA),
            empty(tags::PATIENT_SEX, VR::CS),
            empty(tags::STUDY_INSTANCE_UID, VR::UI),
            empty(tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO),
            empty(tags::REQUESTED_PROCEDURE_ID, VR::SH),
            DataElement::new(
                tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![step]),
            ),
        ]);
        overlay(&mut identifier, query);
        Self::find(sop_class::MODALITY_WORKLIST_FIND, identifier)
    }

    /// C-FIND with the identifier used as is.
    pub fn find(sop_class_uid: &str, identifier: InMemDicomObject) -> Self {
        let mut command = Command::new(CommandField::CFindRq);
        command.affected_sop_class_uid = Some(sop_class_uid.to_string());
        command.priority = Some(Priority::Medium);
        Self::new(command, Some(identifier))
    }

    /// C-STORE of `dataset`, whose SOP Class UID and SOP Instance UID identify it.
    pub fn c_store(dataset: InMemDicomObject) -> Result<Self, DatasetError> {
        let uid = |tag: Tag| {
            dataset
                .get(tag)
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
                .filter(|s| !s.is_empty())
                .ok_or(DatasetError::MissingTag(tag))
        };
        let mut command = Command::new(CommandField::CStoreRq);
        command.affected_sop_class_uid = Some(uid(tags::SOP_CLASS_UID)?);
        command.affected_sop_instance_uid = Some(uid(tags::SOP_INSTANCE_UID)?);
        command.priority = Some(Priority::Medium);
        Ok(Self::new(command, Some(dataset)))
    }

    pub fn c_move(sop_class_uid: &str, destination: &str, identifier: InMemDicomObject) -> Self {
        let mut command = Command::new(CommandField::CMoveRq);
        command.affected_sop_class_uid = Some(sop_class_uid.to_string());
        command.move_destination = Some(destination.to_string());
        command.priority = Some(Priority::Medium);
        Self::new(command, Some(identifier))
    }

    pub fn c_get(sop_class_uid: &str, identifier: InMemDicomObject) -> Self {
        let mut command = Command::new(CommandField::CGetRq);
        command.affected_sop_class_uid = Some(sop_class_uid.to_string());
        command.priority = Some(Priority::Medium);
        Self::new(command, Some(identifier))
    }

    /// Cancel the operation started by the request with `message_id`.
    pub fn c_cancel(message_id: u16) -> Self {
        let mut command = Command::new(CommandField::CCancelRq);
        command.message_id_being_responded_to = Some(message_id);
        Self::new(command, None)
    }

    pub fn n_action(
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
        dataset: Option<InMemDicomObject>,
    ) -> Self {
        let mut command = Command::new(CommandField::NActionRq);
        command.requested_sop_class_uid = Some(sop_class_uid.to_string());
        command.requested_sop_instance_uid = Some(sop_instance_uid.to_string());
        command.action_type_id = Some(action_type_id);
        Self::new(command, dataset)
    }

    pub fn n_event_report(
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
        dataset: Option<InMemDicomObject>,
    ) -> Self {
        let mut command = Command::new(CommandField::NEventReportRq);
        command.affected_sop_class_uid = Some(sop_class_uid.to_string());
        command.affected_sop_instance_uid = Some(sop_instance_uid.to_string());
        command.event_type_id = Some(event_type_id);
        Self::new(command, dataset)
    }

    /// An empty `attributes` list asks for every attribute.
    pub fn n_get(sop_class_uid: &str, sop_instance_uid: &str, attributes: Vec<Tag>) -> Self {
        let mut command = Command::new(CommandField::NGetRq);
        command.requested_sop_class_uid = Some(sop_class_uid.to_string());
        command.requested_sop_instance_uid = Some(sop_instance_uid.to_string());
        command.attribute_identifier_list = attributes;
        Self::new(command, None)
    }

    pub fn n_set(
        sop_class_uid: &str,
        sop_instance_uid: &str,
        modifications: InMemDicomObject,
    ) -> Self {
        let mut command = Command::new(CommandField::NSetRq);
        command.requested_sop_class_uid = Some(sop_class_uid.to_string());
        command.requested_sop_instance_uid = Some(sop_instance_uid.to_string());
        Self::new(command, Some(modifications))
    }

    /// Without `sop_instance_uid` the peer assigns one and returns it in the response.
    pub fn n_create(
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        dataset: Option<InMemDicomObject>,
    ) -> Self {
        let mut command = Command::new(CommandField::NCreateRq);
        command.affected_sop_class_uid = Some(sop_class_uid.to_string());
        command.affected_sop_instance_uid = sop_instance_uid.map(str::to_string);
        Self::new(command, dataset)
    }

    pub fn n_delete(sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut command = Command::new(CommandField::NDeleteRq);
        command.requested_sop_class_uid = Some(sop_class_uid.to_string());
        command.requested_sop_instance_uid = Some(sop_instance_uid.to_string());
        Self::new(command, None)
    }
}

fn empty(tag: Tag, vr: VR) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::Empty)
}

fn overlay(identifier: &mut InMemDicomObject, query: InMemDicomObject) {
    for element in query {
        identifier.put(element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids::storage_class;
    use pretty_assertions::assert_eq;

    fn patient(id: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, id),
        )])
    }

    #[test]
    fn test_study_find_overlays_query() {
        let message = Message::c_find_study(patient("12345"));
        assert!(message.command.has_dataset);
        assert!(message.command.validate().is_ok());
        let identifier = message.dataset.unwrap();
        assert_eq!(
            identifier.get(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "12345"
        );
        assert_eq!(
            identifier
                .get(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "STUDY"
        );
        assert!(identifier.get(tags::STUDY_INSTANCE_UID).is_some());
    }

    #[test]
    fn test_worklist_find_has_procedure_step_sequence() {
        let message = Message::c_find_worklist(patient("54321"));
        assert_eq!(
            message.command.affected_sop_class_uid.as_deref(),
            Some(sop_class::MODALITY_WORKLIST_FIND)
        );
        let identifier = message.dataset.unwrap();
        let items = identifier
            .get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].get(tags::MODALITY).is_some());
    }

    #[test]
    fn test_store_takes_uids_from_data_set() {
        let dataset = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, storage_class::MR_IMAGE),
            ),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")),
        ]);
        let message = Message::c_store(dataset).unwrap();
        assert_eq!(
            message.command.affected_sop_class_uid.as_deref(),
            Some(storage_class::MR_IMAGE)
        );
        assert_eq!(
            message.command.affected_sop_instance_uid.as_deref(),
            Some("1.2.3.4")
        );
    }

    #[test]
    fn test_store_without_instance_uid() {
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_class::MR_IMAGE),
        )]);
        assert!(matches!(
            Message::c_store(dataset),
            Err(DatasetError::MissingTag(tags::SOP_INSTANCE_UID))
        ));
    }

    #[test]
    fn test_response_to_echo() {
        let mut request = Message::c_echo();
        request.command.message_id = Some(9);
        let response = Message::response_to(&request.command, Status::SUCCESS, None).unwrap();
        assert!(response.is_response());
        assert_eq!(response.command.message_id_being_responded_to, Some(9));
        assert_eq!(response.status(), Some(Status::SUCCESS));
        assert!(Message::response_to(&Message::c_cancel(9).command, Status::SUCCESS, None).is_none());
    }

    #[test]
    fn test_new_keeps_data_set_flag() {
        let message = Message::n_action(
            sop_class::STORAGE_COMMITMENT_PUSH_MODEL,
            sop_class::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            1,
            None,
        );
        assert!(!message.command.has_dataset);
        let message = Message::new(message.command, Some(patient("1")));
        assert!(message.command.has_dataset);
    }

    #[test]
    fn test_failure_comment_is_truncated() {
        let mut request = Message::c_echo();
        request.command.message_id = Some(2);
        let comment = "x".repeat(100);
        let response =
            Message::failure_to(&request.command, Status::PROCESSING_FAILURE, &comment).unwrap();
        assert_eq!(response.status(), Some(Status::PROCESSING_FAILURE));
        assert_eq!(response.command.error_comment.map(|c| c.len()), Some(64));
    }
}
