//! Canonical serialization and HMAC signatures for commits and registrations.
//!
//! The canonical forms below are a compatibility hazard: the TA and every
//! daycare must produce byte-identical output for the same input, or
//! signatures stop verifying across hosts. Treat the pair ordering and field
//! formatting as frozen; the conformance tests pin the exact bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::SecondsFormat;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Commit, CommitBundle, DaycareRegistration, EventMessage};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("bundle is missing its {0}")]
    Missing(&'static str),
    #[error("signature mismatch: computed {computed} but found {found}")]
    Mismatch { computed: String, found: String },
}

/// HMAC-SHA-256 over `payload`, base64 encoded.
pub fn hmac_base64(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    STANDARD.encode(mac.finalize().into_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn encode_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let mut ser = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        ser.append_pair(key, value);
    }
    ser.finish().into_bytes()
}

/// One transcript event as a canonical value: the tag, the payload fields,
/// and the timestamp, joined with colons. Stream payloads are included as
/// lossy UTF-8; the value is never parsed back, only hashed.
fn event_value(event: &EventMessage) -> String {
    let when = event
        .when()
        .to_rfc3339_opts(SecondsFormat::Nanos, true);
    match event {
        EventMessage::Exec { execcommand, .. } => {
            format!("exec:{}:{}", execcommand.join(" "), when)
        }
        EventMessage::Stdin { streamdata, .. } => {
            format!("stdin:{}:{}", String::from_utf8_lossy(streamdata), when)
        }
        EventMessage::Stdout { streamdata, .. } => {
            format!("stdout:{}:{}", String::from_utf8_lossy(streamdata), when)
        }
        EventMessage::Stderr { streamdata, .. } => {
            format!("stderr:{}:{}", String::from_utf8_lossy(streamdata), when)
        }
        EventMessage::Stdinclosed { .. } => format!("stdinclosed:{when}"),
        EventMessage::Exit { exitstatus, .. } => format!("exit:{exitstatus}:{when}"),
        EventMessage::Error { error, .. } => format!("error:{error}:{when}"),
        EventMessage::Shutdown { .. } => format!("shutdown:{when}"),
    }
}

/// The canonical byte form of a commit.
///
/// Pair order is fixed: `assignmentID`, `problemID`, `step`, `action`, one
/// `file-<name>` pair per file in name order carrying the sha256 of its
/// contents, then — for the post-grading form only — one `event-<i>` pair
/// per transcript event and the `reportCard` summary, then `nonce`, then
/// (post-grading only) the chained `problemSignature`.
pub fn commit_canonical(
    commit: &Commit,
    nonce: &str,
    graded: bool,
    problem_signature: Option<&str>,
) -> Vec<u8> {
    let mut pairs = vec![
        ("assignmentID".to_string(), commit.assignment_id.to_string()),
        ("problemID".to_string(), commit.problem_id.to_string()),
        ("step".to_string(), commit.step.to_string()),
        ("action".to_string(), commit.action.clone()),
    ];
    for (name, contents) in &commit.files {
        pairs.push((format!("file-{name}"), sha256_hex(contents)));
    }
    if graded {
        for (i, event) in commit.transcript.iter().enumerate() {
            pairs.push((format!("event-{i}"), event_value(event)));
        }
        if let Some(card) = &commit.report_card {
            pairs.push((
                "reportCard".to_string(),
                format!("{}:{:.6}:{}", card.passed, commit.score, card.note),
            ));
        }
    }
    pairs.push(("nonce".to_string(), nonce.to_string()));
    if let Some(sig) = problem_signature {
        pairs.push(("problemSignature".to_string(), sig.to_string()));
    }
    encode_pairs(&pairs)
}

/// The TA's signature over the pre-grading commit. Transcript and report
/// card are excluded even if present, so verification is total.
pub fn sign_problem(secret: &[u8], commit: &Commit, nonce: &str) -> String {
    hmac_base64(secret, &commit_canonical(commit, nonce, false, None))
}

/// The daycare's signature over the graded commit, chained through the
/// problem signature it was handed.
pub fn sign_commit(secret: &[u8], commit: &Commit, nonce: &str, problem_signature: &str) -> String {
    hmac_base64(
        secret,
        &commit_canonical(commit, nonce, true, Some(problem_signature)),
    )
}

impl CommitBundle {
    /// Daycare-side handshake check: does the TA's signature cover this
    /// commit and nonce?
    pub fn verify_problem_signature(&self, secret: &[u8]) -> Result<(), SignatureError> {
        let nonce = self.nonce.as_deref().ok_or(SignatureError::Missing("nonce"))?;
        let found = self
            .problem_signature
            .as_deref()
            .ok_or(SignatureError::Missing("problemSignature"))?;
        let computed = sign_problem(secret, &self.commit, nonce);
        if computed != found {
            return Err(SignatureError::Mismatch {
                computed,
                found: found.to_string(),
            });
        }
        Ok(())
    }

    /// TA-side check of a graded bundle: the daycare's signature must cover
    /// the transcript, the report card, and the original problem signature.
    pub fn verify_commit_signature(&self, secret: &[u8]) -> Result<(), SignatureError> {
        let nonce = self.nonce.as_deref().ok_or(SignatureError::Missing("nonce"))?;
        let problem_signature = self
            .problem_signature
            .as_deref()
            .ok_or(SignatureError::Missing("problemSignature"))?;
        let found = self
            .commit_signature
            .as_deref()
            .ok_or(SignatureError::Missing("commitSignature"))?;
        let computed = sign_commit(secret, &self.commit, nonce, problem_signature);
        if computed != found {
            return Err(SignatureError::Mismatch {
                computed,
                found: found.to_string(),
            });
        }
        Ok(())
    }
}

impl DaycareRegistration {
    /// Registration signature: the canonical form is url-encoded pairs for
    /// hostname, each sorted problem type, capacity, the timestamp at
    /// seconds precision UTC, and version, with keys sorted
    /// lexicographically.
    pub fn compute_signature(&self, secret: &[u8]) -> String {
        let mut problem_types = self.problem_types.clone();
        problem_types.sort();

        let mut pairs = vec![("hostname".to_string(), self.hostname.clone())];
        for (n, problem_type) in problem_types.iter().enumerate() {
            pairs.push((format!("problemType-{n}"), problem_type.clone()));
        }
        pairs.push(("capacity".to_string(), self.capacity.to_string()));
        pairs.push((
            "time".to_string(),
            self.time.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
        pairs.push(("version".to_string(), self.version.clone()));
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        hmac_base64(secret, &encode_pairs(&pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReportCard, ReportCardResult, ResultOutcome};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    const SECRET: &[u8] = b"test daycare secret";

    fn make_commit() -> Commit {
        let when = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
        Commit {
            id: 0,
            assignment_id: 42,
            problem_id: 7,
            step: 1,
            action: "grade".to_string(),
            files: BTreeMap::from([("main.py".to_string(), b"hello\n".to_vec())]),
            transcript: vec![],
            report_card: None,
            score: 0.0,
            created_at: when,
            updated_at: when,
        }
    }

    fn grade_offline(commit: &mut Commit) {
        let when = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
        commit.transcript = vec![
            EventMessage::Exec {
                execcommand: vec!["echo".to_string(), "hi".to_string()],
                when,
            },
            EventMessage::Stdout {
                streamdata: b"hi\n".to_vec(),
                when,
            },
            EventMessage::Exit {
                exitstatus: "exit status 0".to_string(),
                when,
            },
        ];
        commit.report_card = Some(ReportCard {
            passed: true,
            note: "all tests passed".to_string(),
            duration: 0.25,
            results: vec![ReportCardResult {
                name: "test_add".to_string(),
                outcome: ResultOutcome::Passed,
                details: None,
            }],
        });
        commit.score = 1.0;
    }

    // sha256 of "hello\n"
    const HELLO_SHA: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn test_pregrading_canonical_form_is_frozen() {
        let commit = make_commit();
        let canonical = commit_canonical(&commit, "deadbeef", false, None);
        let expected = format!(
            "assignmentID=42&problemID=7&step=1&action=grade&file-main.py={HELLO_SHA}&nonce=deadbeef"
        );
        assert_eq!(String::from_utf8(canonical).unwrap(), expected);
    }

    #[test]
    fn test_postgrading_canonical_form_is_frozen() {
        let mut commit = make_commit();
        grade_offline(&mut commit);
        let canonical = commit_canonical(&commit, "deadbeef", true, Some("psig"));
        let expected = format!(
            "assignmentID=42&problemID=7&step=1&action=grade&file-main.py={HELLO_SHA}\
             &event-0=exec%3Aecho+hi%3A2017-01-01T00%3A00%3A00.000000000Z\
             &event-1=stdout%3Ahi%0A%3A2017-01-01T00%3A00%3A00.000000000Z\
             &event-2=exit%3Aexit+status+0%3A2017-01-01T00%3A00%3A00.000000000Z\
             &reportCard=true%3A1.000000%3Aall+tests+passed\
             &nonce=deadbeef&problemSignature=psig"
        );
        assert_eq!(String::from_utf8(canonical).unwrap(), expected);
    }

    #[test]
    fn test_pregrading_form_ignores_grading_output() {
        let commit = make_commit();
        let before = commit_canonical(&commit, "n", false, None);
        let mut graded = commit.clone();
        grade_offline(&mut graded);
        assert_eq!(before, commit_canonical(&graded, "n", false, None));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let commit = make_commit();
        let a = sign_problem(SECRET, &commit, "nonce-1");
        let b = sign_problem(SECRET, &commit, "nonce-1");
        assert_eq!(a, b);
        assert_ne!(a, sign_problem(SECRET, &commit, "nonce-2"));
        assert_ne!(a, sign_problem(b"other secret", &commit, "nonce-1"));
    }

    #[test]
    fn test_bundle_round_trip_verifies_at_both_hops() {
        // TA signs the incoming commit.
        let commit = make_commit();
        let nonce = "c29tZSByYW5kb20gbm9uY2U".to_string();
        let problem_signature = sign_problem(SECRET, &commit, &nonce);
        let mut bundle = CommitBundle {
            problem_type: "python3unittest".to_string(),
            commit,
            nonce: Some(nonce.clone()),
            problem_signature: Some(problem_signature.clone()),
            daycare_host: Some("day1.example.com".to_string()),
            commit_signature: None,
        };

        // Daycare verifies, grades, and signs the result.
        bundle.verify_problem_signature(SECRET).unwrap();
        grade_offline(&mut bundle.commit);
        bundle.commit_signature = Some(sign_commit(
            SECRET,
            &bundle.commit,
            &nonce,
            &problem_signature,
        ));

        // TA verifies the graded bundle.
        bundle.verify_commit_signature(SECRET).unwrap();
    }

    #[test]
    fn test_tampered_transcript_invalidates_commit_signature() {
        let mut commit = make_commit();
        grade_offline(&mut commit);
        let nonce = "n";
        let problem_signature = sign_problem(SECRET, &commit, nonce);
        let mut bundle = CommitBundle {
            problem_type: "python3unittest".to_string(),
            commit,
            nonce: Some(nonce.to_string()),
            problem_signature: Some(problem_signature.clone()),
            daycare_host: None,
            commit_signature: None,
        };
        bundle.commit_signature = Some(sign_commit(
            SECRET,
            &bundle.commit,
            nonce,
            &problem_signature,
        ));
        bundle.verify_commit_signature(SECRET).unwrap();

        // Flip one byte of stream data.
        if let EventMessage::Stdout { streamdata, .. } = &mut bundle.commit.transcript[1] {
            streamdata[0] ^= 1;
        } else {
            panic!("expected stdout event");
        }
        assert!(matches!(
            bundle.verify_commit_signature(SECRET),
            Err(SignatureError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_commit_signature_chains_problem_signature() {
        let mut commit = make_commit();
        grade_offline(&mut commit);
        let nonce = "n";
        let problem_signature = sign_problem(SECRET, &commit, nonce);
        let commit_signature = sign_commit(SECRET, &commit, nonce, &problem_signature);

        let mut bundle = CommitBundle {
            problem_type: "python3unittest".to_string(),
            commit,
            nonce: Some(nonce.to_string()),
            problem_signature: Some(problem_signature),
            daycare_host: None,
            commit_signature: Some(commit_signature),
        };
        bundle.verify_commit_signature(SECRET).unwrap();

        // Swapping in a different problem signature breaks the chain even
        // though the commit itself is untouched.
        bundle.problem_signature = Some("forged".to_string());
        assert!(bundle.verify_commit_signature(SECRET).is_err());
    }

    #[test]
    fn test_tampered_problem_signature_rejected_at_handshake() {
        let commit = make_commit();
        let nonce = "n";
        let mut sig = sign_problem(SECRET, &commit, nonce);
        // Flip one bit of the base64 signature.
        let last = sig.pop().unwrap();
        sig.push(if last == 'A' { 'B' } else { 'A' });
        let bundle = CommitBundle {
            problem_type: "python3unittest".to_string(),
            commit,
            nonce: Some(nonce.to_string()),
            problem_signature: Some(sig),
            daycare_host: None,
            commit_signature: None,
        };
        assert!(matches!(
            bundle.verify_problem_signature(SECRET),
            Err(SignatureError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_missing_fields_reported() {
        let bundle = CommitBundle {
            problem_type: "python3unittest".to_string(),
            commit: make_commit(),
            nonce: None,
            problem_signature: None,
            daycare_host: None,
            commit_signature: None,
        };
        assert!(matches!(
            bundle.verify_problem_signature(SECRET),
            Err(SignatureError::Missing("nonce"))
        ));
    }

    #[test]
    fn test_non_utf8_file_contents_sign_cleanly() {
        let mut commit = make_commit();
        commit
            .files
            .insert("blob.bin".to_string(), vec![0x00, 0xff, 0xfe, 0x80]);
        let a = sign_problem(SECRET, &commit, "n");
        let b = sign_problem(SECRET, &commit, "n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_registration_canonical_form_is_frozen() {
        let reg = DaycareRegistration {
            hostname: "day1.example.com".to_string(),
            // Deliberately unsorted; the canonical form sorts.
            problem_types: vec!["python3unittest".to_string(), "gounittest".to_string()],
            capacity: 3,
            time: Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            version: "2.0.0".to_string(),
            signature: String::new(),
        };
        let mut problem_types = reg.problem_types.clone();
        problem_types.sort();
        let mut pairs = vec![("hostname".to_string(), reg.hostname.clone())];
        for (n, pt) in problem_types.iter().enumerate() {
            pairs.push((format!("problemType-{n}"), pt.clone()));
        }
        pairs.push(("capacity".to_string(), "3".to_string()));
        pairs.push(("time".to_string(), "2017-01-01T00:00:00Z".to_string()));
        pairs.push(("version".to_string(), "2.0.0".to_string()));
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            String::from_utf8(encode_pairs(&pairs)).unwrap(),
            "capacity=3&hostname=day1.example.com&problemType-0=gounittest\
             &problemType-1=python3unittest&time=2017-01-01T00%3A00%3A00Z&version=2.0.0"
        );

        // Problem-type order on the wire must not change the signature.
        let mut reordered = reg.clone();
        reordered.problem_types.reverse();
        assert_eq!(
            reg.compute_signature(SECRET),
            reordered.compute_signature(SECRET)
        );
    }

    #[test]
    fn test_registration_signature_depends_on_every_field() {
        let reg = DaycareRegistration {
            hostname: "day1.example.com".to_string(),
            problem_types: vec!["gounittest".to_string()],
            capacity: 3,
            time: Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            version: "2.0.0".to_string(),
            signature: String::new(),
        };
        let base = reg.compute_signature(SECRET);

        let mut changed = reg.clone();
        changed.capacity = 4;
        assert_ne!(base, changed.compute_signature(SECRET));

        let mut changed = reg.clone();
        changed.hostname = "day2.example.com".to_string();
        assert_ne!(base, changed.compute_signature(SECRET));

        let mut changed = reg.clone();
        changed.time = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 1).unwrap();
        assert_ne!(base, changed.compute_signature(SECRET));
    }
}
