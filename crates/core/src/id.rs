//! Strongly-typed job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Opaque identifier of a backend-tracked job.
///
/// Issued by the backend on submission and never mutated afterwards. The
/// client treats the contents as opaque: it is only ever compared, hashed and
/// interpolated into status URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wrap a backend-issued id, rejecting empty or blank values.
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::invalid_id("JobHandle: empty id"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default status path for this job (`/jobs/{id}`).
    pub fn status_path(&self) -> String {
        format!("/jobs/{}", self.0)
    }
}

impl core::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobHandle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<JobHandle> for String {
    fn from(value: JobHandle) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_ids() {
        assert!(JobHandle::new("").is_err());
        assert!(JobHandle::new("   ").is_err());
        assert!("".parse::<JobHandle>().is_err());
    }

    #[test]
    fn status_path_interpolates_id() {
        let handle: JobHandle = "lec-42".parse().unwrap();
        assert_eq!(handle.status_path(), "/jobs/lec-42");
        assert_eq!(handle.to_string(), "lec-42");
    }

    #[test]
    fn serializes_transparently() {
        let handle = JobHandle::new("abc").unwrap();
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"abc\"");
    }
}
