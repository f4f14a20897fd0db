//! Conversion of data sets to and from their encoded form in a negotiated transfer syntax.

use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;

use crate::error::DatasetError;

/// Whether we can read and write data sets in the given transfer syntax.
pub fn is_supported(transfer_syntax_uid: &str) -> bool {
    TransferSyntaxRegistry
        .get(transfer_syntax_uid.trim_end_matches('\0'))
        .is_some_and(|ts| !ts.is_unsupported())
}

pub fn encode_dataset(
    obj: &InMemDicomObject,
    transfer_syntax_uid: &str,
) -> Result<Vec<u8>, DatasetError> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid.trim_end_matches('\0'))
        .ok_or_else(|| DatasetError::UnknownTransferSyntax(transfer_syntax_uid.to_string()))?;
    let mut out = Vec::new();
    obj.write_dataset_with_ts(&mut out, ts)?;
    Ok(out)
}

pub fn decode_dataset(
    bytes: &[u8],
    transfer_syntax_uid: &str,
) -> Result<InMemDicomObject, DatasetError> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid.trim_end_matches('\0'))
        .ok_or_else(|| DatasetError::UnknownTransferSyntax(transfer_syntax_uid.to_string()))?;
    Ok(InMemDicomObject::read_dataset_with_ts(bytes, ts)?)
}
