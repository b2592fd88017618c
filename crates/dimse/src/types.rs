//! Common types for DIMSE operations

use std::collections::HashMap;

use bytes::Bytes;
use dicom_dictionary_std::uids;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a DICOM dataset carried by a request or response
#[derive(Debug, Clone)]
pub enum DatasetStream {
    /// Encoded DICOM bytes
    Memory {
        /// Raw DICOM bytes
        data: Bytes,
        /// Associated metadata
        metadata: DatasetMetadata,
    },
    /// DICOM object already parsed
    Object {
        /// Parsed DICOM object
        object: Box<InMemDicomObject>,
        /// Associated metadata
        metadata: DatasetMetadata,
    },
}

/// Metadata associated with a DICOM dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Unique identifier for this dataset
    pub id: Uuid,

    /// Transfer syntax UID
    pub transfer_syntax: Option<String>,

    /// SOP Class UID
    pub sop_class_uid: Option<String>,

    /// SOP Instance UID
    pub sop_instance_uid: Option<String>,

    /// Timestamp when dataset was received/created
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Size of the dataset in bytes
    pub size_bytes: Option<u64>,
}

/// DIMSE command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimseCommand {
    /// C-ECHO command
    Echo,
    /// C-FIND command
    Find,
    /// C-MOVE command
    Move,
    /// C-GET command
    Get,
    /// C-STORE command
    Store,
}

/// Query parameters for C-FIND and C-GET operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuery {
    /// Information model the query is expressed in
    pub root: QueryRoot,

    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Query parameters as DICOM keywords and values
    pub parameters: HashMap<String, String>,

    /// Maximum number of results to return (0 = unlimited)
    pub max_results: u32,
}

/// Query parameters for C-MOVE operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveQuery {
    /// Information model the query is expressed in
    pub root: QueryRoot,

    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Query parameters as DICOM keywords and values
    pub parameters: HashMap<String, String>,

    /// Destination AE Title for the move operation
    pub destination_aet: String,

    /// Priority of the move operation
    pub priority: MovePriority,
}

/// Query/retrieve information model roots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryRoot {
    /// Patient Root information model
    Patient,
    /// Study Root information model
    Study,
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Priority levels for C-MOVE operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePriority {
    /// Low priority
    Low,
    /// Medium priority (default)
    Medium,
    /// High priority
    High,
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

impl DimseStatus {
    /// Classify a raw status code as defined in PS3.7 Annex C
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    /// Raw status code
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => *code,
        }
    }

    /// Whether more responses will follow for the same request
    pub fn is_pending(&self) -> bool {
        matches!(self, DimseStatus::Pending)
    }
}

impl DimseCommand {
    /// Abstract syntax for commands whose SOP class is fixed by the query root
    pub fn abstract_syntax(&self, root: QueryRoot) -> Option<&'static str> {
        let uid = match (self, root) {
            (DimseCommand::Echo, _) => uids::VERIFICATION,
            (DimseCommand::Find, QueryRoot::Patient) => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            (DimseCommand::Find, QueryRoot::Study) => {
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            (DimseCommand::Move, QueryRoot::Patient) => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
            (DimseCommand::Move, QueryRoot::Study) => {
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
            (DimseCommand::Get, QueryRoot::Patient) => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
            }
            (DimseCommand::Get, QueryRoot::Study) => {
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
            }
            (DimseCommand::Store, _) => return None,
        };
        Some(uid)
    }
}

impl DatasetStream {
    /// Create a new in-memory dataset
    pub fn from_bytes(data: Bytes, sop_class_uid: impl Into<String>) -> Self {
        let mut metadata = DatasetMetadata::new();
        metadata.sop_class_uid = Some(sop_class_uid.into());
        metadata.size_bytes = Some(data.len() as u64);
        Self::Memory { data, metadata }
    }

    /// Create a new dataset from a parsed DICOM object
    pub fn from_object(object: InMemDicomObject) -> Self {
        let mut metadata = DatasetMetadata::new();

        // Extract metadata from DICOM object
        if let Ok(sop_class) = object.element_by_name("SOPClassUID") {
            if let Ok(value) = sop_class.to_str() {
                metadata.sop_class_uid = Some(trim_uid(&value));
            }
        }

        if let Ok(sop_instance) = object.element_by_name("SOPInstanceUID") {
            if let Ok(value) = sop_instance.to_str() {
                metadata.sop_instance_uid = Some(trim_uid(&value));
            }
        }

        Self::Object {
            object: Box::new(object),
            metadata,
        }
    }

    /// Get the metadata for this dataset
    pub fn metadata(&self) -> &DatasetMetadata {
        match self {
            Self::Memory { metadata, .. } => metadata,
            Self::Object { metadata, .. } => metadata,
        }
    }

    /// Get mutable metadata for this dataset
    pub fn metadata_mut(&mut self) -> &mut DatasetMetadata {
        match self {
            Self::Memory { metadata, .. } => metadata,
            Self::Object { metadata, .. } => metadata,
        }
    }

    /// SOP Class UID of the dataset, if known
    pub fn sop_class_uid(&self) -> Option<&str> {
        self.metadata().sop_class_uid.as_deref()
    }
}

// UI values are padded with a trailing NUL to an even length
fn trim_uid(value: &str) -> String {
    value.trim_end_matches(&['\0', ' '][..]).to_string()
}

impl DatasetMetadata {
    /// Create new metadata with a unique ID and current timestamp
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            transfer_syntax: None,
            sop_class_uid: None,
            sop_instance_uid: None,
            timestamp: chrono::Utc::now(),
            size_bytes: None,
        }
    }
}

impl Default for DatasetMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl FindQuery {
    /// Create a new patient-level query
    pub fn patient(patient_id: Option<String>) -> Self {
        let mut parameters = HashMap::new();
        if let Some(id) = patient_id {
            parameters.insert("PatientID".to_string(), id);
        }

        Self {
            root: QueryRoot::Patient,
            query_level: QueryLevel::Patient,
            parameters,
            max_results: 0,
        }
    }

    /// Create a new study-level query
    pub fn study(study_instance_uid: Option<String>) -> Self {
        let mut parameters = HashMap::new();
        if let Some(uid) = study_instance_uid {
            parameters.insert("StudyInstanceUID".to_string(), uid);
        }

        Self {
            root: QueryRoot::Study,
            query_level: QueryLevel::Study,
            parameters,
            max_results: 0,
        }
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(tag.into(), value.into());
        self
    }

    /// Set maximum number of results
    pub fn with_max_results(mut self, max: u32) -> Self {
        self.max_results = max;
        self
    }
}

impl MoveQuery {
    /// Create a new move query in the Study Root information model
    pub fn new(query_level: QueryLevel, destination_aet: impl Into<String>) -> Self {
        Self {
            root: QueryRoot::Study,
            query_level,
            parameters: HashMap::new(),
            destination_aet: destination_aet.into(),
            priority: MovePriority::Medium,
        }
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(tag.into(), value.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MovePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Switch to the Patient Root information model
    pub fn patient_root(mut self) -> Self {
        self.root = QueryRoot::Patient;
        self
    }
}

impl std::fmt::Display for DimseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseCommand::Echo => write!(f, "C-ECHO"),
            DimseCommand::Find => write!(f, "C-FIND"),
            DimseCommand::Move => write!(f, "C-MOVE"),
            DimseCommand::Get => write!(f, "C-GET"),
            DimseCommand::Store => write!(f, "C-STORE"),
        }
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(crate::error::DimseError::config(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}
