/// Report Card Grader - Deterministic Transcript Scoring
///
/// **Core Responsibility:**
/// Turn the captured output of a grading run into a structured report card
/// and a score.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about the session protocol
/// - Pure function: (captured output, commit files) → report card
/// - Always returns a well-formed card, even for garbage input
///
/// **Scoring Rules:**
/// - score = passed leaves / total leaves, rounded to six decimals
/// - passed requires every leaf to pass (so no error leaves either)
/// - unparseable output scores 0 with the parser diagnostic as the note
use codegrinder_common::types::round_score;
use codegrinder_common::{ReportCard, ReportCardResult, ReportParser, ResultOutcome};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Produce the report card and score for a finished grading run.
pub fn grade(
    parser: ReportParser,
    captured: &[u8],
    files: &BTreeMap<String, Vec<u8>>,
    duration: f64,
) -> (ReportCard, f64) {
    match parser {
        ReportParser::None => (
            ReportCard {
                passed: false,
                note: "non-gradable action".to_string(),
                duration,
                results: vec![],
            },
            0.0,
        ),
        ReportParser::Xunit => match parse_xunit(&String::from_utf8_lossy(captured)) {
            Ok(results) => card_from_results(results, duration),
            Err(diagnostic) => (
                ReportCard {
                    passed: false,
                    note: diagnostic,
                    duration,
                    results: vec![],
                },
                0.0,
            ),
        },
        ReportParser::Inout => {
            card_from_results(parse_inout(&String::from_utf8_lossy(captured), files), duration)
        }
    }
}

fn card_from_results(results: Vec<ReportCardResult>, duration: f64) -> (ReportCard, f64) {
    let total = results.len();
    let passed_count = results
        .iter()
        .filter(|r| r.outcome == ResultOutcome::Passed)
        .count();
    let passed = total > 0 && passed_count == total;
    let score = if total == 0 {
        0.0
    } else {
        round_score(passed_count as f64 / total as f64)
    };
    (
        ReportCard {
            passed,
            note: format!("passed {passed_count}/{total} tests"),
            duration,
            results,
        },
        score,
    )
}

/// Parse the JUnit-style XML a test runner emits: `<testsuite>` wrapping
/// `<testcase>` elements, outcomes carried by a `status` attribute or a
/// `<failure>`/`<error>`/`<skipped>` child.
fn parse_xunit(stdout: &str) -> Result<Vec<ReportCardResult>, String> {
    let Some(start) = stdout.find("<testsuite") else {
        return Err("no test results found in grader output".to_string());
    };
    let mut reader = Reader::from_str(&stdout[start..]);

    let mut results = Vec::new();
    let mut current: Option<ReportCardResult> = None;
    let mut in_child = false;
    let mut details = String::new();

    loop {
        match reader.read_event() {
            Err(err) => return Err(format!("malformed test results: {err}")),
            Ok(Event::Eof) => break,
            Ok(Event::Start(el)) => match el.name().as_ref() {
                b"testcase" => {
                    current = Some(testcase_from_attrs(&el)?);
                }
                tag @ (b"failure" | b"error" | b"skipped") => {
                    if let Some(case) = current.as_mut() {
                        case.outcome = child_outcome(tag);
                        in_child = true;
                        details.clear();
                        if let Some(message) = attr(&el, "message")? {
                            details.push_str(&message);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(el)) => match el.name().as_ref() {
                b"testcase" => results.push(testcase_from_attrs(&el)?),
                tag @ (b"failure" | b"error" | b"skipped") => {
                    if let Some(case) = current.as_mut() {
                        case.outcome = child_outcome(tag);
                        case.details = attr(&el, "message")?;
                    }
                }
                _ => {}
            },
            Ok(Event::Text(text)) if in_child => {
                let chunk = text
                    .unescape()
                    .map_err(|err| format!("malformed test results: {err}"))?;
                let chunk = chunk.trim();
                if !chunk.is_empty() {
                    if !details.is_empty() {
                        details.push('\n');
                    }
                    details.push_str(chunk);
                }
            }
            Ok(Event::End(el)) => match el.name().as_ref() {
                b"testcase" => {
                    if let Some(case) = current.take() {
                        results.push(case);
                    }
                }
                b"failure" | b"error" | b"skipped" => {
                    if let Some(case) = current.as_mut() {
                        if !details.is_empty() {
                            case.details = Some(details.clone());
                        }
                    }
                    in_child = false;
                }
                _ => {}
            },
            Ok(_) => {}
        }
    }
    Ok(results)
}

fn testcase_from_attrs(el: &BytesStart) -> Result<ReportCardResult, String> {
    let name = attr(el, "name")?.unwrap_or_else(|| "unnamed test".to_string());
    let outcome = match attr(el, "status")?.as_deref() {
        Some("error") => ResultOutcome::Error,
        Some("failed") | Some("failure") => ResultOutcome::Failed,
        Some("skipped") => ResultOutcome::Skipped,
        _ => ResultOutcome::Passed,
    };
    Ok(ReportCardResult {
        name,
        outcome,
        details: None,
    })
}

fn child_outcome(tag: &[u8]) -> ResultOutcome {
    match tag {
        b"error" => ResultOutcome::Error,
        b"skipped" => ResultOutcome::Skipped,
        _ => ResultOutcome::Failed,
    }
}

fn attr(el: &BytesStart, name: &str) -> Result<Option<String>, String> {
    el.try_get_attribute(name)
        .map_err(|err| format!("malformed test results: {err}"))?
        .map(|attribute| {
            attribute
                .unescape_value()
                .map(|value| value.into_owned())
                .map_err(|err| format!("malformed test results: {err}"))
        })
        .transpose()
}

/// Parse input/output grading runs. The runner echoes one header line
/// `# <input-file>` per scenario followed by the program's raw output; the
/// expected output is the commit file named after the input with its
/// extension replaced by `.expected`.
fn parse_inout(stdout: &str, files: &BTreeMap<String, Vec<u8>>) -> Vec<ReportCardResult> {
    let mut results = Vec::new();
    let mut scenario: Option<(String, String)> = None;

    for line in stdout.lines() {
        if let Some(header) = line.strip_prefix("# ") {
            if let Some((input, actual)) = scenario.take() {
                results.push(judge_scenario(&input, &actual, files));
            }
            scenario = Some((header.trim().to_string(), String::new()));
        } else if let Some((_, actual)) = scenario.as_mut() {
            actual.push_str(line);
            actual.push('\n');
        }
    }
    if let Some((input, actual)) = scenario.take() {
        results.push(judge_scenario(&input, &actual, files));
    }
    results
}

fn expected_name(input: &str) -> String {
    match input.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.expected"),
        None => format!("{input}.expected"),
    }
}

fn judge_scenario(
    input: &str,
    actual: &str,
    files: &BTreeMap<String, Vec<u8>>,
) -> ReportCardResult {
    let expected_file = expected_name(input);
    let Some(expected) = files.get(&expected_file) else {
        return ReportCardResult {
            name: input.to_string(),
            outcome: ResultOutcome::Error,
            details: Some(format!("missing expected output file {expected_file}")),
        };
    };
    let expected = String::from_utf8_lossy(expected);
    if expected.trim() == actual.trim() {
        ReportCardResult {
            name: input.to_string(),
            outcome: ResultOutcome::Passed,
            details: None,
        }
    } else {
        ReportCardResult {
            name: input.to_string(),
            outcome: ResultOutcome::Failed,
            details: Some(format!(
                "expected:\n{}\ngot:\n{}",
                expected.trim(),
                actual.trim()
            )),
        }
    }
}
