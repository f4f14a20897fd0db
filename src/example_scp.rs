//! A small SCP keeping its data sets in memory.
//!
//! It answers C-FIND by Patient ID, stores what it receives with C-STORE, reports storage
//! commitment results for N-ACTION, and describes a printer for N-GET.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

use crate::command::{Command, Status};
use crate::error::name_of;
use crate::message::Message;
use crate::pdu::{AbortReason, AbortSource, AssociationAC, AssociationRJ};
use crate::scp::{Scp, ScpContext, respond};
use crate::uids::sop_class;

/// Storage commitment event types.
const ALL_COMMITTED: u16 = 1;
const SOME_FAILED: u16 = 2;

#[derive(Debug, Default)]
pub struct ExampleScp {
    datasets: Mutex<Vec<InMemDicomObject>>,
}

impl ExampleScp {
    pub fn new(datasets: Vec<InMemDicomObject>) -> Self {
        Self {
            datasets: Mutex::new(datasets),
        }
    }

    /// Two patients, JOHN^DOE and JANE^DOE.
    pub fn with_sample_patients() -> Self {
        Self::new(vec![
            patient("12345", "JOHN^DOE"),
            patient("54321", "JANE^DOE"),
        ])
    }

    pub fn datasets(&self) -> Vec<InMemDicomObject> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InMemDicomObject>> {
        self.datasets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn patient(id: &str, name: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, id)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, name)),
    ])
}

fn string(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.get(tag)
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
}

impl Scp for ExampleScp {
    fn on_association_accepted(&self, ac: &AssociationAC) {
        tracing::debug!(calling_ae_title = %ac.calling_ae_title, "accepted");
    }

    fn on_association_rejected(&self, rj: &AssociationRJ) {
        tracing::debug!("rejected: {rj}");
    }

    fn on_association_aborted(&self, source: AbortSource, reason: AbortReason) {
        tracing::debug!(?source, ?reason, "aborted");
    }

    fn on_c_find(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        identifier: InMemDicomObject,
    ) -> anyhow::Result<Vec<Message>> {
        let patient_id = string(&identifier, tags::PATIENT_ID);
        let mut responses = self
            .lock()
            .iter()
            .filter(|ds| patient_id.is_none() || string(ds, tags::PATIENT_ID) == patient_id)
            .map(|ds| {
                Message::response_to(request, Status::PENDING, Some(ds.clone()))
                    .context("C-FIND has a response")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        tracing::info!(patient_id = ?patient_id, matches = responses.len(), "C-FIND");
        responses.push(respond(request, Status::SUCCESS)?);
        Ok(responses)
    }

    fn on_c_store(
        &self,
        _ctx: &mut ScpContext,
        request: &Command,
        dataset: InMemDicomObject,
    ) -> anyhow::Result<Message> {
        tracing::info!(
            sop_instance_uid = ?request.affected_sop_instance_uid,
            "C-STORE"
        );
        self.lock().push(dataset);
        respond(request, Status::SUCCESS)
    }

    /// Storage commitment: instances we hold are committed, the others fail with
    /// "no such object instance". The result goes back in an N-EVENT-REPORT.
    fn on_n_action(
        &self,
        ctx: &mut ScpContext,
        request: &Command,
        action_information: Option<InMemDicomObject>,
    ) -> anyhow::Result<Message> {
        if request.sop_class_uid() != Some(sop_class::STORAGE_COMMITMENT_PUSH_MODEL) {
            return respond(request, Status::SOP_CLASS_NOT_SUPPORTED);
        }
        let information = action_information.context("N-ACTION without action information")?;
        let transaction_uid =
            string(&information, tags::TRANSACTION_UID).context("missing Transaction UID")?;
        let referenced = information
            .get(tags::REFERENCED_SOP_SEQUENCE)
            .and_then(|e| e.items())
            .map(<[InMemDicomObject]>::to_vec)
            .unwrap_or_default();

        let held: Vec<String> = self
            .lock()
            .iter()
            .filter_map(|ds| string(ds, tags::SOP_INSTANCE_UID))
            .collect();
        let (committed, mut failed): (Vec<_>, Vec<_>) = referenced.into_iter().partition(|item| {
            string(item, tags::REFERENCED_SOP_INSTANCE_UID).is_some_and(|uid| held.contains(&uid))
        });
        for item in &mut failed {
            item.put(DataElement::new(
                tags::FAILURE_REASON,
                VR::US,
                PrimitiveValue::from(Status::NO_SUCH_OBJECT_INSTANCE.0),
            ));
        }
        tracing::info!(
            %transaction_uid,
            committed = committed.len(),
            failed = failed.len(),
            "storage commitment"
        );

        let event_type = if failed.is_empty() {
            ALL_COMMITTED
        } else {
            SOME_FAILED
        };
        let mut event_information = InMemDicomObject::from_element_iter([DataElement::new(
            tags::TRANSACTION_UID,
            VR::UI,
            dicom_value!(Str, transaction_uid),
        )]);
        if !committed.is_empty() {
            event_information.put(DataElement::new(
                tags::REFERENCED_SOP_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(committed),
            ));
        }
        if !failed.is_empty() {
            event_information.put(DataElement::new(
                tags::FAILED_SOP_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(failed),
            ));
        }
        ctx.send_request(Message::n_event_report(
            sop_class::STORAGE_COMMITMENT_PUSH_MODEL,
            sop_class::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            event_type,
            Some(event_information),
        ));
        respond(request, Status::SUCCESS)
    }

    /// The printer answers every requested attribute with its own name.
    fn on_n_get(&self, _ctx: &mut ScpContext, request: &Command) -> anyhow::Result<Message> {
        if request.sop_class_uid() != Some(sop_class::PRINTER) {
            return respond(request, Status::SOP_CLASS_NOT_SUPPORTED);
        }
        let attributes = InMemDicomObject::from_element_iter(
            request
                .attribute_identifier_list
                .iter()
                .map(|tag| DataElement::new(*tag, VR::LO, PrimitiveValue::from(name_of(tag)))),
        );
        Message::response_to(request, Status::SUCCESS, Some(attributes))
            .context("N-GET has a response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> ScpContext {
        ScpContext::for_testing("SCU", "OXIDIMSE")
    }

    #[test]
    fn test_find_by_patient_id() {
        let scp = ExampleScp::with_sample_patients();
        let mut find = Message::c_find_study(patient("54321", ""));
        find.command.message_id = Some(3);
        let responses = scp
            .on_c_find(&mut ctx(), &find.command, find.dataset.unwrap())
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].status(), Some(Status::PENDING));
        assert_eq!(
            string(responses[0].dataset.as_ref().unwrap(), tags::PATIENT_NAME).as_deref(),
            Some("JANE^DOE")
        );
        assert_eq!(responses[1].status(), Some(Status::SUCCESS));
        assert_eq!(responses[1].dataset, None);
    }

    #[test]
    fn test_storage_commitment_reports_failures() {
        let scp = ExampleScp::with_sample_patients();
        let reference = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::REFERENCED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, crate::uids::storage_class::MR_IMAGE),
            ),
            DataElement::new(
                tags::REFERENCED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4.5"),
            ),
        ]);
        let information = InMemDicomObject::from_element_iter([
            DataElement::new(tags::TRANSACTION_UID, VR::UI, dicom_value!(Str, "1.2.3")),
            DataElement::new(
                tags::REFERENCED_SOP_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![reference]),
            ),
        ]);
        let mut action = Message::n_action(
            sop_class::STORAGE_COMMITMENT_PUSH_MODEL,
            sop_class::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            1,
            Some(information),
        );
        action.command.message_id = Some(1);
        let mut ctx = ctx();
        let response = scp
            .on_n_action(&mut ctx, &action.command, action.dataset)
            .unwrap();
        assert_eq!(response.status(), Some(Status::SUCCESS));

        let outgoing = ctx.take_outgoing();
        assert_eq!(outgoing.len(), 1);
        let report = outgoing.into_iter().next().unwrap();
        assert_eq!(report.command.event_type_id, Some(SOME_FAILED));
        let info = report.dataset.unwrap();
        assert_eq!(string(&info, tags::TRANSACTION_UID).as_deref(), Some("1.2.3"));
        let failed = info.get(tags::FAILED_SOP_SEQUENCE).unwrap().items().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].get(tags::FAILURE_REASON).unwrap().to_int::<u16>().unwrap(),
            0x0112
        );
        assert!(info.get(tags::REFERENCED_SOP_SEQUENCE).is_none());
    }

    #[test]
    fn test_printer_attributes() {
        let scp = ExampleScp::default();
        let mut get = Message::n_get(
            sop_class::PRINTER,
            sop_class::PRINTER_INSTANCE,
            vec![tags::PRINTER_STATUS, tags::PRINTER_NAME, tags::MANUFACTURER],
        );
        get.command.message_id = Some(1);
        let response = scp.on_n_get(&mut ctx(), &get.command).unwrap();
        let attributes = response.dataset.unwrap();
        assert_eq!(
            string(&attributes, tags::PRINTER_STATUS).as_deref(),
            Some("PrinterStatus")
        );
        assert_eq!(
            string(&attributes, tags::MANUFACTURER).as_deref(),
            Some("Manufacturer")
        );
    }

    #[test]
    fn test_store_appends() {
        let scp = ExampleScp::with_sample_patients();
        let mut dataset = patient("1", "A");
        dataset.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, crate::uids::storage_class::CT_IMAGE),
        ));
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3"),
        ));
        let mut store = Message::c_store(dataset).unwrap();
        store.command.message_id = Some(1);
        let response = scp
            .on_c_store(&mut ctx(), &store.command, store.dataset.unwrap())
            .unwrap();
        assert_eq!(response.status(), Some(Status::SUCCESS));
        assert_eq!(scp.datasets().len(), 3);
    }
}
