use dicom::core::{DataDictionary, Tag};
use dicom::dictionary_std::StandardDataDictionary;

/// Error decoding or encoding an upper layer PDU.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PduError {
    #[error("unknown PDU type 0x{0:02X}")]
    UnknownPduType(u8),

    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid value {value} for {field}")]
    InvalidField { field: &'static str, value: u32 },

    #[error("invalid AE title \"{0}\": must be 1 to 16 ASCII characters")]
    InvalidAeTitle(String),

    #[error("item 0x{item_type:02X} is {length} bytes long, which does not fit its length field")]
    ItemTooLong { item_type: u8, length: usize },

    #[error("PDU of {length} bytes exceeds the maximum length of {maximum}")]
    TooLarge { length: u32, maximum: u32 },
}

/// Error reading, writing or validating a DIMSE command set.
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Failed to read DICOM command set")]
    Read(#[from] dicom::object::ReadError),

    #[error("Failed to write DICOM command set")]
    Write(#[from] dicom::object::WriteError),

    #[error("Missing {}", name_of(.0))]
    MissingTag(Tag),

    #[error("Value for {} is not a number", name_of(.0))]
    InvalidNumber(Tag),

    #[error("Could not retrieve {}", name_of(.0))]
    CouldNotRetrieve(Tag),

    #[error("unknown command field 0x{0:04X}")]
    UnknownCommandField(u16),

    #[error("{field} requires {}", name_of(.tag))]
    Incomplete { field: &'static str, tag: Tag },

    #[error("{0} requires a data set")]
    MissingDataSet(&'static str),
}

/// Error converting a data set to or from its encoded form.
#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("transfer syntax {0} is not known")]
    UnknownTransferSyntax(String),

    #[error("Failed to read DICOM data set")]
    Read(#[from] dicom::object::ReadError),

    #[error("Failed to write DICOM data set")]
    Write(#[from] dicom::object::WriteError),

    #[error("Missing {}", name_of(.0))]
    MissingTag(Tag),
}

/// Get the standard name of a tag.
pub(crate) fn name_of(tag: &Tag) -> &'static str {
    StandardDataDictionary
        .by_tag(*tag)
        .map(|e| e.alias)
        .unwrap_or("unknown attribute")
}
