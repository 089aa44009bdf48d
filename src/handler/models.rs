//! Job records exchanged over the coordination API and kept in the job store

use std::fmt;
use std::str::FromStr;

use base64::prelude::*;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Separator between encoded command arguments. Never produced by base64.
pub const COMMAND_SEPARATOR: char = '.';

/// Job state reported when the work succeeded
pub const STATE_COMPLETED: &str = "Completed";

/// Job state reported when the work was attempted and failed
pub const STATE_FAILED: &str = "Failed";

/// Longest message kept on a job record
const MAX_MESSAGE_LEN: usize = 4096;

/// Whether a job has reached its terminal state.
///
/// Serialized as the nullable `deleted_at` timestamp on the wire and in the
/// store; once `Done` a job is never dispatched again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    #[default]
    Pending,
    Done { at: DateTime<Utc> },
}

impl Completion {
    pub fn is_done(&self) -> bool {
        matches!(self, Completion::Done { .. })
    }

    pub fn is_pending(&self) -> bool {
        !self.is_done()
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Completion::Pending => None,
            Completion::Done { at } => Some(*at),
        }
    }

    pub fn from_deleted_at(deleted_at: Option<DateTime<Utc>>) -> Self {
        match deleted_at {
            None => Completion::Pending,
            Some(at) => Completion::Done { at },
        }
    }
}

mod deleted_at {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Completion;

    pub fn serialize<S: Serializer>(value: &Completion, serializer: S) -> Result<S::Ok, S::Error> {
        value.deleted_at().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Completion, D::Error> {
        Option::<DateTime<Utc>>::deserialize(deserializer).map(Completion::from_deleted_at)
    }
}

/// Identity and lifecycle timestamps shared by every job kind
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Assigned by the job store on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Name of the resource the job belongs to
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(
        rename = "deleted_at",
        default,
        with = "deleted_at",
        skip_serializing_if = "Completion::is_pending"
    )]
    pub completion: Completion,
}

impl JobMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Archive file stem for this job, `{namespace}-{name}`
    pub fn archive_label(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.namespace, self.name)
        }
    }

    /// Reject names that cannot become an archive file name
    pub fn validate_archive_label(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("job name is required"));
        }
        for (field, value) in [("name", &self.name), ("namespace", &self.namespace)] {
            if value.contains(['/', '\\']) || value.starts_with('.') {
                return Err(Error::validation(format!(
                    "job {} '{}' cannot be used in an archive name",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// Common behaviour of backup and restore records
pub trait Job {
    fn meta(&self) -> &JobMeta;
    fn meta_mut(&mut self) -> &mut JobMeta;

    fn id(&self) -> Option<Uuid> {
        self.meta().id
    }

    /// The id, or a validation error for records that were never stored
    fn require_id(&self) -> Result<Uuid> {
        self.id()
            .ok_or_else(|| Error::validation("job record has no id"))
    }

    fn is_done(&self) -> bool {
        self.meta().completion.is_done()
    }
}

/// A backup job: run `command` in `pod`/`container` and archive its stdout
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupEnvelope {
    #[serde(flatten)]
    pub meta: JobMeta,

    /// Free-form phase name reported by the dispatcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default)]
    pub pod: String,

    #[serde(default)]
    pub container: String,

    /// Command argv; stored as a delimited, per-argument encoded string
    #[serde(default)]
    pub command: Vec<String>,

    /// Hint set while the dispatcher works on the job. Not a lock.
    #[serde(default)]
    pub is_running: bool,

    /// Secret holding upload credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,

    /// base64 encoded JSON snapshot of the Pachyderm resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_resource: Option<String>,

    /// Archive written for this backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Captured stderr or failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Job for BackupEnvelope {
    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut JobMeta {
        &mut self.meta
    }
}

impl BackupEnvelope {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            meta: JobMeta::new(name, namespace),
            pod: pod.into(),
            container: container.into(),
            command,
            ..Default::default()
        }
    }

    pub fn failed(&self) -> bool {
        self.state.as_deref() == Some(STATE_FAILED)
    }
}

/// Progress of a restore on the backup handler side
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePhase {
    /// Waiting for the dispatcher to resolve the backup contents
    #[default]
    Pending,
    /// Contents attached; waiting for the operator to prepare the destination
    Prepared,
    /// Operator requested the dump be loaded into the destination database
    Loading,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Pending => "Pending",
            RestorePhase::Prepared => "Prepared",
            RestorePhase::Loading => "Loading",
        }
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestorePhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(RestorePhase::Pending),
            "Prepared" => Ok(RestorePhase::Prepared),
            "Loading" => Ok(RestorePhase::Loading),
            other => Err(Error::decode(format!("unknown restore phase '{}'", other))),
        }
    }
}

/// A restore job: bring a backup into a (possibly different) destination
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreEnvelope {
    #[serde(flatten)]
    pub meta: JobMeta,

    #[serde(default)]
    pub phase: RestorePhase,

    /// Final outcome once done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default)]
    pub destination_name: String,

    #[serde(default)]
    pub destination_namespace: String,

    /// Archive location of the source backup
    #[serde(default)]
    pub backup_location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,

    /// base64 encoded JSON snapshot of the backed up Pachyderm resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_resource: Option<String>,

    /// base64 encoded database dump
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Pod the dump is loaded into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Load command; receives the dump on stdin
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub is_running: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Job for RestoreEnvelope {
    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut JobMeta {
        &mut self.meta
    }
}

impl RestoreEnvelope {
    pub fn failed(&self) -> bool {
        self.state.as_deref() == Some(STATE_FAILED)
    }

    /// True once the dispatcher attached the resource snapshot and dump
    pub fn has_contents(&self) -> bool {
        self.kubernetes_resource.is_some() && self.database.is_some()
    }
}

/// Batch response of the coordination API
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Current time truncated to what the store keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Encode each argument separately and join with [`COMMAND_SEPARATOR`].
///
/// An empty command has no encoded form at all, which keeps `[""]` and `[]`
/// distinct.
pub fn encode_command(args: &[String]) -> Option<String> {
    if args.is_empty() {
        return None;
    }
    let tokens: Vec<String> = args
        .iter()
        .map(|arg| BASE64_STANDARD.encode(arg.as_bytes()))
        .collect();
    Some(tokens.join(&COMMAND_SEPARATOR.to_string()))
}

/// Inverse of [`encode_command`]
pub fn decode_command(encoded: Option<&str>) -> Result<Vec<String>> {
    let Some(encoded) = encoded else {
        return Ok(Vec::new());
    };
    encoded
        .split(COMMAND_SEPARATOR)
        .map(|token| {
            let bytes = BASE64_STANDARD.decode(token)?;
            String::from_utf8(bytes)
                .map_err(|e| Error::decode(format!("command argument is not UTF-8: {}", e)))
        })
        .collect()
}

/// base64 encode an opaque payload (resource snapshot, database dump)
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Inverse of [`encode_payload`]
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>> {
    Ok(BASE64_STANDARD.decode(encoded.trim())?)
}

/// Clip captured output to something that fits a status message
pub fn summarize_output(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.len() <= MAX_MESSAGE_LEN {
        return Some(text.to_string());
    }
    let mut cut = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(format!("{}...", &text[..cut]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn archive_label_is_namespace_qualified() {
        assert_eq!(JobMeta::new("nightly", "ml").archive_label(), "ml-nightly");
        assert_eq!(JobMeta::new("nightly", "").archive_label(), "nightly");
    }

    #[test]
    fn unusable_archive_labels_are_rejected() {
        assert!(JobMeta::new("nightly", "ml").validate_archive_label().is_ok());
        let rejected = [
            ("", "ml"),
            ("  ", "ml"),
            ("a/b", "ml"),
            (".x", "ml"),
            ("ok", "a\\b"),
        ];
        for (name, namespace) in rejected {
            let err = JobMeta::new(name, namespace)
                .validate_archive_label()
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?}/{:?}", namespace, name);
        }
    }

    #[test]
    fn command_round_trips_through_separator() {
        let command = args(&["bash", "-c", "pg_dump a.b.c && echo ..."]);
        let encoded = encode_command(&command).unwrap();
        assert_eq!(encoded.matches(COMMAND_SEPARATOR).count(), 2);
        assert_eq!(decode_command(Some(&encoded)).unwrap(), command);
    }

    #[test]
    fn empty_command_and_empty_argument_stay_distinct() {
        assert_eq!(encode_command(&[]), None);
        assert!(decode_command(None).unwrap().is_empty());

        let single_empty = args(&[""]);
        let encoded = encode_command(&single_empty).unwrap();
        assert_eq!(decode_command(Some(&encoded)).unwrap(), single_empty);

        let trailing_empty = args(&["pg_dump", ""]);
        let encoded = encode_command(&trailing_empty).unwrap();
        assert_eq!(decode_command(Some(&encoded)).unwrap(), trailing_empty);
    }

    #[test]
    fn corrupt_command_is_a_decode_error() {
        let err = decode_command(Some("not base64!")).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn deleted_at_maps_to_completion() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let raw = serde_json::json!({
            "id": "6f1c0a58-93c5-4c38-8f62-0b7f1c0e6f7a",
            "name": "nightly",
            "namespace": "ml",
            "deleted_at": at,
            "pod": "postgres-0",
            "container": "postgres",
            "command": ["pg_dump", "pachyderm"]
        });

        let backup: BackupEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(backup.meta.completion, Completion::Done { at });
        assert!(backup.is_done());
        assert_eq!(backup.command, args(&["pg_dump", "pachyderm"]));
    }

    #[test]
    fn pending_job_omits_deleted_at() {
        let backup = BackupEnvelope::new("nightly", "ml", "postgres-0", "postgres", vec![]);
        let value = serde_json::to_value(&backup).unwrap();
        assert!(value.get("deleted_at").is_none());
        assert!(value.get("id").is_none());
        assert_eq!(value["name"], "nightly");
        assert!(!backup.is_done());
    }

    #[test]
    fn restore_phase_defaults_to_pending() {
        let restore: RestoreEnvelope = serde_json::from_value(serde_json::json!({
            "name": "restore-1",
            "backup_location": "/tmp/nightly-202403011230.sql.gz"
        }))
        .unwrap();
        assert_eq!(restore.phase, RestorePhase::Pending);
        assert!(!restore.has_contents());
        assert_eq!("Prepared".parse::<RestorePhase>().unwrap(), RestorePhase::Prepared);
    }

    #[test]
    fn long_output_is_clipped() {
        let output = "é".repeat(MAX_MESSAGE_LEN);
        let summary = summarize_output(output.as_bytes()).unwrap();
        assert!(summary.ends_with("..."));
        assert!(summary.len() <= MAX_MESSAGE_LEN + 3);
        assert_eq!(summarize_output(b"  \n"), None);
    }
}
