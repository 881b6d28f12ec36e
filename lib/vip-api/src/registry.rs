//! Service registry stored inside a namespace's ConfigMap

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// One service-to-VIP allocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Allocated virtual IP
    pub vip: String,

    /// Primary exposed port
    #[serde(default)]
    pub port: i32,

    /// Service UID, unique within the registry
    pub uid: String,

    /// Human-readable service name
    #[serde(rename = "serviceName", default)]
    pub service_name: String,
}

/// Ordered collection of [`ServiceRecord`], serialized as one document value
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistry {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub services: Vec<ServiceRecord>,
}

/// Why a registry could not be loaded from its stored text
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("registry document has no services entry")]
    Absent,

    #[error("malformed registry document: {0}")]
    Malformed(#[from] serde_json::Error),
}

// Older writers emit `{"services": null}` for an empty list.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ServiceRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ServiceRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Callers are responsible for uid uniqueness.
    pub fn add(&mut self, record: ServiceRecord) {
        self.services.push(record);
    }

    /// Find the record for a service uid
    pub fn find(&self, uid: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|svc| svc.uid == uid)
    }

    /// Find the record holding a VIP
    pub fn find_by_vip(&self, vip: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|svc| svc.vip == vip)
    }

    /// Insert a record, replacing any existing record with the same uid in place
    pub fn upsert(&mut self, record: ServiceRecord) {
        match self.services.iter_mut().find(|svc| svc.uid == record.uid) {
            Some(existing) => *existing = record,
            None => self.add(record),
        }
    }

    /// Return a copy of this registry without the record for `uid`
    ///
    /// A uid with no record yields an unchanged copy.
    pub fn remove_by_uid(&self, uid: &str) -> ServiceRegistry {
        ServiceRegistry {
            services: self
                .services
                .iter()
                .filter(|svc| svc.uid != uid)
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.iter()
    }

    /// Serialize to the text stored in the document
    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Load a registry from the stored text
    ///
    /// Absent and malformed text are both errors so callers can tell them
    /// apart from a valid empty registry; `unwrap_or_default()` recovers.
    pub fn from_document(text: Option<&str>) -> Result<Self, DecodeError> {
        match text {
            None => Err(DecodeError::Absent),
            Some(raw) if raw.trim().is_empty() => Err(DecodeError::Absent),
            Some(raw) => Ok(serde_json::from_str(raw)?),
        }
    }
}
