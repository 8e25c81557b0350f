use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The interval at which daycares re-register with the TA. A registration
/// that has not been refreshed within twice this interval is considered dead.
pub const REGISTRATION_INTERVAL_SECONDS: i64 = 10;

/// Maximum tolerated clock drift between a daycare and the TA.
pub const MAX_CLOCK_DRIFT_SECONDS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub version: String,
    pub grind_version_required: String,
    pub grind_version_recommended: String,
}

impl Version {
    pub fn current() -> Self {
        Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
            grind_version_required: env!("CARGO_PKG_VERSION").to_string(),
            grind_version_recommended: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// How a grading action's captured output is turned into a report card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportParser {
    /// No report card is produced; the action is not gradable.
    #[default]
    None,
    /// JUnit-style XML emitted by the test runner.
    Xunit,
    /// Captured stdout compared against expected outputs per scenario.
    Inout,
}

/// Resource ceilings and execution plan for one action of a problem type.
///
/// All limits have conservative defaults so a problem-type config file only
/// needs to override the ones that matter for that action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfig {
    /// Button label shown by clients.
    #[serde(default)]
    pub button: String,
    /// Status message shown while the action runs.
    #[serde(default)]
    pub message: String,
    /// Interactive actions forward client stdin into a single exec; staged
    /// actions run `commands` in order with stdin closed.
    #[serde(default)]
    pub interactive: bool,
    /// Cumulative user+system CPU seconds.
    #[serde(rename = "maxCPU", default = "default_max_cpu")]
    pub max_cpu: u64,
    /// Wall-clock seconds for the whole session.
    #[serde(default = "default_max_session")]
    pub max_session: u64,
    /// Wall-clock seconds for a single exec step.
    #[serde(default = "default_max_timeout")]
    pub max_timeout: u64,
    /// Open file descriptors.
    #[serde(rename = "maxFD", default = "default_max_fd")]
    pub max_fd: u64,
    /// Largest file the container may write, and also the session's
    /// aggregate stdout+stderr budget, in MiB.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Memory limit in MiB (swap is capped to the same value).
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,
    /// Processes/threads.
    #[serde(default = "default_max_threads")]
    pub max_threads: u64,
    /// Exec steps. Interactive actions use only the first entry.
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
    #[serde(default)]
    pub parser: ReportParser,
}

fn default_max_cpu() -> u64 {
    10
}
fn default_max_session() -> u64 {
    600
}
fn default_max_timeout() -> u64 {
    60
}
fn default_max_fd() -> u64 {
    100
}
fn default_max_file_size() -> u64 {
    10
}
fn default_max_memory() -> u64 {
    256
}
fn default_max_threads() -> u64 {
    100
}

/// A container image paired with the actions it supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemType {
    pub name: String,
    pub image: String,
    pub actions: BTreeMap<String, ActionConfig>,
}

/// One frame of a session's event stream, and one entry of a commit's
/// transcript. The `event` tag and payload field names are wire-frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum EventMessage {
    Exec {
        execcommand: Vec<String>,
        when: DateTime<Utc>,
    },
    Stdin {
        #[serde(with = "bytes_base64")]
        streamdata: Vec<u8>,
        when: DateTime<Utc>,
    },
    Stdout {
        #[serde(with = "bytes_base64")]
        streamdata: Vec<u8>,
        when: DateTime<Utc>,
    },
    Stderr {
        #[serde(with = "bytes_base64")]
        streamdata: Vec<u8>,
        when: DateTime<Utc>,
    },
    Stdinclosed {
        when: DateTime<Utc>,
    },
    Exit {
        exitstatus: String,
        when: DateTime<Utc>,
    },
    Error {
        error: String,
        when: DateTime<Utc>,
    },
    Shutdown {
        when: DateTime<Utc>,
    },
}

impl EventMessage {
    pub fn exec(execcommand: Vec<String>) -> Self {
        EventMessage::Exec {
            execcommand,
            when: Utc::now(),
        }
    }

    pub fn stdin(data: Vec<u8>) -> Self {
        EventMessage::Stdin {
            streamdata: data,
            when: Utc::now(),
        }
    }

    pub fn stdout(data: Vec<u8>) -> Self {
        EventMessage::Stdout {
            streamdata: data,
            when: Utc::now(),
        }
    }

    pub fn stderr(data: Vec<u8>) -> Self {
        EventMessage::Stderr {
            streamdata: data,
            when: Utc::now(),
        }
    }

    pub fn stdinclosed() -> Self {
        EventMessage::Stdinclosed { when: Utc::now() }
    }

    pub fn exit(exitstatus: impl Into<String>) -> Self {
        EventMessage::Exit {
            exitstatus: exitstatus.into(),
            when: Utc::now(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        EventMessage::Error {
            error: error.into(),
            when: Utc::now(),
        }
    }

    pub fn shutdown() -> Self {
        EventMessage::Shutdown { when: Utc::now() }
    }

    pub fn when(&self) -> DateTime<Utc> {
        match self {
            EventMessage::Exec { when, .. }
            | EventMessage::Stdin { when, .. }
            | EventMessage::Stdout { when, .. }
            | EventMessage::Stderr { when, .. }
            | EventMessage::Stdinclosed { when }
            | EventMessage::Exit { when, .. }
            | EventMessage::Error { when, .. }
            | EventMessage::Shutdown { when } => *when,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            EventMessage::Exec { .. } => "exec",
            EventMessage::Stdin { .. } => "stdin",
            EventMessage::Stdout { .. } => "stdout",
            EventMessage::Stderr { .. } => "stderr",
            EventMessage::Stdinclosed { .. } => "stdinclosed",
            EventMessage::Exit { .. } => "exit",
            EventMessage::Error { .. } => "error",
            EventMessage::Shutdown { .. } => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardResult {
    pub name: String,
    pub outcome: ResultOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The structured result of a grading run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub passed: bool,
    pub note: String,
    /// Wall-clock seconds the grading run took.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub results: Vec<ReportCardResult>,
}

/// A student's submission for one step of one problem, plus its execution
/// transcript and grade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    #[serde(default)]
    pub id: i64,
    pub assignment_id: i64,
    pub problem_id: i64,
    pub step: i64,
    pub action: String,
    #[serde(default, with = "filemap_base64")]
    pub files: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub transcript: Vec<EventMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_card: Option<ReportCard>,
    #[serde(default)]
    pub score: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("invalid file path {0:?}: paths must be relative with no . or .. components")]
    InvalidPath(String),
    #[error("score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),
    #[error("a passing report card requires a score of 1.0, found {0}")]
    PassedWithoutFullScore(f64),
}

impl Commit {
    /// Every file path must stay inside the sandbox scratch directory:
    /// relative, slash-separated, no empty, `.`, or `..` components.
    pub fn validate_file_paths(&self) -> Result<(), CommitError> {
        for name in self.files.keys() {
            if !valid_file_path(name) {
                return Err(CommitError::InvalidPath(name.clone()));
            }
        }
        Ok(())
    }

    pub fn validate_score(&self) -> Result<(), CommitError> {
        if !(0.0..=1.0).contains(&self.score) || !self.score.is_finite() {
            return Err(CommitError::ScoreOutOfRange(self.score));
        }
        if let Some(rc) = &self.report_card {
            if rc.passed && self.score != 1.0 {
                return Err(CommitError::PassedWithoutFullScore(self.score));
            }
        }
        Ok(())
    }
}

pub fn valid_file_path(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Round a raw pass ratio to the six decimal places the score field carries.
pub fn round_score(score: f64) -> f64 {
    (score * 1_000_000.0).round() / 1_000_000.0
}

/// A commit plus the signatures that authenticate it across hops.
///
/// `problem_type` routes the session to an image; it is not covered by the
/// canonical form, which binds the commit itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBundle {
    pub problem_type: String,
    pub commit: Commit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daycare_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_signature: Option<String>,
}

/// A daycare's periodic announcement of itself to the TA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaycareRegistration {
    pub hostname: String,
    pub problem_types: Vec<String>,
    pub capacity: u32,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

/// Serialize `Vec<u8>` as standard base64, the wire form for stream data.
pub mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serialize a filename → contents map with base64 contents.
pub mod filemap_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        files: &BTreeMap<String, Vec<u8>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = ser.serialize_map(Some(files.len()))?;
        for (name, contents) in files {
            map.serialize_entry(name, &STANDARD.encode(contents))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(de)?;
        raw.into_iter()
            .map(|(name, contents)| {
                STANDARD
                    .decode(contents)
                    .map(|bytes| (name, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
