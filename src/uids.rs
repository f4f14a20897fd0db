//! Well-known UIDs: SOP classes, storage classes, transfer syntaxes and our implementation identity.

/// Our implementation class UID, sent in every association request and accept.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137038125948464847900039011591283709926";
/// At most 16 characters.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("OXIDIMSE_", env!("CARGO_PKG_VERSION_MAJOR"), env!("CARGO_PKG_VERSION_MINOR"), env!("CARGO_PKG_VERSION_PATCH"));

pub mod sop_class {
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";
    pub const STORAGE_COMMITMENT_PUSH_MODEL: &str = "1.2.840.10008.1.20.1";
    /// Well-known SOP instance of the storage commitment push model.
    pub const STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE: &str = "1.2.840.10008.1.20.1.1";
    pub const PATIENT_ROOT_QUERY_RETRIEVE_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
    pub const PATIENT_ROOT_QUERY_RETRIEVE_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
    pub const PATIENT_ROOT_QUERY_RETRIEVE_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";
    pub const STUDY_ROOT_QUERY_RETRIEVE_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
    pub const STUDY_ROOT_QUERY_RETRIEVE_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
    pub const STUDY_ROOT_QUERY_RETRIEVE_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";
    pub const MODALITY_WORKLIST_FIND: &str = "1.2.840.10008.5.1.4.31";
    pub const MODALITY_PERFORMED_PROCEDURE_STEP: &str = "1.2.840.10008.3.1.2.3.3";
    pub const PRINTER: &str = "1.2.840.10008.5.1.1.16";
    /// Well-known SOP instance of the printer SOP class.
    pub const PRINTER_INSTANCE: &str = "1.2.840.10008.5.1.1.17";
}

pub mod storage_class {
    pub const COMPUTED_RADIOGRAPHY_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
    pub const DIGITAL_X_RAY_IMAGE_FOR_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
    pub const DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_FOR_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.2";
    pub const CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    pub const ENHANCED_CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2.1";
    pub const MR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    pub const ENHANCED_MR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4.1";
    pub const ULTRASOUND_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.6.1";
    pub const SECONDARY_CAPTURE_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
    pub const NUCLEAR_MEDICINE_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.20";
    pub const POSITRON_EMISSION_TOMOGRAPHY_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.128";
    pub const BASIC_TEXT_SR: &str = "1.2.840.10008.5.1.4.1.1.88.11";
    pub const ENHANCED_SR: &str = "1.2.840.10008.5.1.4.1.1.88.22";
    pub const COMPREHENSIVE_SR: &str = "1.2.840.10008.5.1.4.1.1.88.33";
    pub const ENCAPSULATED_PDF: &str = "1.2.840.10008.5.1.4.1.1.104.1";
    pub const RT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.481.1";
    pub const RT_DOSE: &str = "1.2.840.10008.5.1.4.1.1.481.2";
    pub const RT_STRUCTURE_SET: &str = "1.2.840.10008.5.1.4.1.1.481.3";
    pub const RT_PLAN: &str = "1.2.840.10008.5.1.4.1.1.481.5";
}

pub mod transfer_syntax {
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
    pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
    pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

pub const STORAGE_CLASSES: &[&str] = &[
    storage_class::COMPUTED_RADIOGRAPHY_IMAGE,
    storage_class::DIGITAL_X_RAY_IMAGE_FOR_PRESENTATION,
    storage_class::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_FOR_PRESENTATION,
    storage_class::CT_IMAGE,
    storage_class::ENHANCED_CT_IMAGE,
    storage_class::MR_IMAGE,
    storage_class::ENHANCED_MR_IMAGE,
    storage_class::ULTRASOUND_IMAGE,
    storage_class::SECONDARY_CAPTURE_IMAGE,
    storage_class::NUCLEAR_MEDICINE_IMAGE,
    storage_class::POSITRON_EMISSION_TOMOGRAPHY_IMAGE,
    storage_class::BASIC_TEXT_SR,
    storage_class::ENHANCED_SR,
    storage_class::COMPREHENSIVE_SR,
    storage_class::ENCAPSULATED_PDF,
    storage_class::RT_IMAGE,
    storage_class::RT_DOSE,
    storage_class::RT_STRUCTURE_SET,
    storage_class::RT_PLAN,
];

/// Service SOP classes accepted by default.
pub const SERVICE_CLASSES: &[&str] = &[
    sop_class::VERIFICATION,
    sop_class::STORAGE_COMMITMENT_PUSH_MODEL,
    sop_class::PATIENT_ROOT_QUERY_RETRIEVE_FIND,
    sop_class::PATIENT_ROOT_QUERY_RETRIEVE_MOVE,
    sop_class::PATIENT_ROOT_QUERY_RETRIEVE_GET,
    sop_class::STUDY_ROOT_QUERY_RETRIEVE_FIND,
    sop_class::STUDY_ROOT_QUERY_RETRIEVE_MOVE,
    sop_class::STUDY_ROOT_QUERY_RETRIEVE_GET,
    sop_class::MODALITY_WORKLIST_FIND,
    sop_class::MODALITY_PERFORMED_PROCEDURE_STEP,
    sop_class::PRINTER,
];

pub const UNCOMPRESSED_TRANSFER_SYNTAXES: &[&str] = &[
    transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN,
    transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN,
    transfer_syntax::EXPLICIT_VR_BIG_ENDIAN,
];

/// Every abstract syntax accepted by default: service classes, then storage classes.
pub fn abstract_syntaxes() -> impl Iterator<Item = &'static str> {
    SERVICE_CLASSES.iter().chain(STORAGE_CLASSES).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implementation_version_name_fits_in_sixteen_characters() {
        assert!(IMPLEMENTATION_VERSION_NAME.len() <= 16);
    }
}
