//! Decoding of the job API's JSON bodies into domain types.

use chrono::{DateTime, Utc};
use serde_json::Value;

use jobwatch_core::{DomainError, JobHandle, JobState, JobStatus};

/// Decode a `GET /jobs/{id}` body.
///
/// `status` (or `state`) is required and must be one of the four known
/// states; `progress` defaults to 0 and must lie in 0..=100.
pub fn parse_status(body: &Value) -> Result<JobStatus, DomainError> {
    let object = body
        .as_object()
        .ok_or_else(|| DomainError::validation("status body is not an object"))?;

    let state: JobState = object
        .get("status")
        .or_else(|| object.get("state"))
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::validation("status body has no `status` field"))?
        .parse()?;

    let progress = match object.get("progress") {
        None | Some(Value::Null) => 0,
        Some(value) => parse_progress(value)?,
    };

    let mut status = JobStatus::new(state, progress);
    if let Some(message) = object.get("message").and_then(Value::as_str) {
        status = status.with_message(message);
    }
    if let Some(at) = object
        .get("updatedAt")
        .or_else(|| object.get("updated_at"))
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
    {
        status = status.with_updated_at(at);
    }
    Ok(status)
}

fn parse_progress(value: &Value) -> Result<u8, DomainError> {
    let raw = value
        .as_f64()
        .ok_or_else(|| DomainError::validation(format!("progress is not a number: {value}")))?;
    if !(0.0..=100.0).contains(&raw) {
        return Err(DomainError::validation(format!("progress out of range: {raw}")));
    }
    Ok(raw.round() as u8)
}

// Display-only field: an unparseable timestamp is dropped, not an error.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Extract the job id; the backend may send it as a string or a number.
pub fn parse_job_id(body: &Value) -> Result<JobHandle, DomainError> {
    match body.get("id") {
        Some(Value::String(id)) => JobHandle::new(id.as_str()),
        Some(Value::Number(id)) => JobHandle::new(id.to_string()),
        _ => Err(DomainError::invalid_id("response has no usable `id`")),
    }
}

/// Decode a `POST /jobs` body: `{ id, statusUrl? }`.
pub fn parse_submission(body: &Value) -> Result<(JobHandle, Option<String>), DomainError> {
    let handle = parse_job_id(body)?;
    let status_url = body
        .get("statusUrl")
        .or_else(|| body.get("status_url"))
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
        .map(str::to_string);
    Ok((handle, status_url))
}

/// Decode one entry of a job listing.
pub fn parse_job_record(body: &Value) -> Result<(JobHandle, JobStatus), DomainError> {
    Ok((parse_job_id(body)?, parse_status(body)?))
}

/// Decode a job listing: either a bare array or `{ "jobs": [...] }`.
///
/// Entries that fail to decode are skipped.
pub fn parse_job_list(body: &Value) -> Result<Vec<(JobHandle, JobStatus)>, DomainError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(object) => object
            .get("jobs")
            .and_then(Value::as_array)
            .ok_or_else(|| DomainError::validation("job listing has no `jobs` array"))?,
        _ => return Err(DomainError::validation("job listing is not a list")),
    };

    Ok(entries
        .iter()
        .filter_map(|entry| match parse_job_record(entry) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable job listing entry");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_a_full_status_body() {
        let status = parse_status(&json!({
            "id": "42",
            "status": "processing",
            "progress": 45,
            "message": "transcribing",
            "updatedAt": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(status.state, JobState::Processing);
        assert_eq!(status.progress, 45);
        assert_eq!(status.message.as_deref(), Some("transcribing"));
        assert!(status.updated_at.is_some());
    }

    #[test]
    fn missing_progress_defaults_to_zero_and_bad_timestamps_are_ignored() {
        let status = parse_status(&json!({"status": "pending", "updatedAt": "yesterday"})).unwrap();
        assert_eq!(status, JobStatus::pending());
    }

    #[test]
    fn rejects_unknown_states_and_bad_progress() {
        assert!(parse_status(&json!({"status": "queued"})).is_err());
        assert!(parse_status(&json!({"progress": 10})).is_err());
        assert!(parse_status(&json!({"status": "processing", "progress": 140})).is_err());
        assert!(parse_status(&json!({"status": "processing", "progress": "half"})).is_err());
        assert!(parse_status(&json!("processing")).is_err());
    }

    #[test]
    fn submission_accepts_numeric_ids() {
        let (handle, url) = parse_submission(&json!({"id": 17})).unwrap();
        assert_eq!(handle.as_str(), "17");
        assert_eq!(url, None);

        let (_, url) = parse_submission(&json!({"id": "a", "statusUrl": "/lectures/a/status"})).unwrap();
        assert_eq!(url.as_deref(), Some("/lectures/a/status"));

        assert!(parse_submission(&json!({"statusUrl": "/x"})).is_err());
    }

    #[test]
    fn listings_come_in_two_shapes() {
        let bare = json!([{"id": "1", "status": "pending"}, {"id": "2", "status": "bogus"}]);
        assert_eq!(parse_job_list(&bare).unwrap().len(), 1);

        let wrapped = json!({"jobs": [{"id": 3, "status": "completed"}]});
        let jobs = parse_job_list(&wrapped).unwrap();
        assert_eq!(jobs[0].0.as_str(), "3");
        assert_eq!(jobs[0].1.progress, 100);

        assert!(parse_job_list(&json!({"items": []})).is_err());
    }
}
