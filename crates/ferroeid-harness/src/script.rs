//! Hex APDU script runner.
//!
//! A script is a line-oriented text format:
//!
//! ```text
//! # comments and blank lines are skipped
//! reset
//! 00 A4 00 00 02 3F 00 => 9000
//! 00 20 00 01 08 31313131FFFFFFFF => 9000
//! ```
//!
//! Each command line is a hex APDU, optionally followed by `=>` and an
//! expected hex suffix that the drained response must end with (typically
//! the status word, sometimes trailing data plus the status word).

use thiserror::Error;

use crate::reader::Reader;

/// Script parsing/assertion failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// A line was not valid hex.
    #[error("line {line}: invalid hex")]
    BadHex {
        /// 1-based line number.
        line: usize,
    },
    /// A response did not match its expectation.
    #[error("line {line}: sent {sent}, got {got}, expected suffix {expected}")]
    Mismatch {
        /// 1-based line number.
        line: usize,
        /// Command hex.
        sent: String,
        /// Full response hex.
        got: String,
        /// Expected suffix hex.
        expected: String,
    },
}

/// One executed script step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// 1-based source line.
    pub line: usize,
    /// Command bytes sent (empty for `reset`).
    pub sent: Vec<u8>,
    /// Drained response bytes.
    pub response: Vec<u8>,
}

/// Runs `text` against `reader`, stopping at the first failed expectation.
pub fn run(reader: &mut Reader, text: &str) -> Result<Vec<Step>, ScriptError> {
    let mut steps = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = idx + 1;
        let content = raw_line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        if content.eq_ignore_ascii_case("reset") {
            reader.reset();
            steps.push(Step {
                line,
                sent: Vec::new(),
                response: Vec::new(),
            });
            continue;
        }
        let (cmd_part, expect_part) = match content.split_once("=>") {
            Some((c, e)) => (c, Some(e)),
            None => (content, None),
        };
        let cmd = decode_hex(cmd_part).ok_or(ScriptError::BadHex { line })?;
        let response = reader.transmit(&cmd);
        if let Some(exp) = expect_part {
            let expected = decode_hex(exp).ok_or(ScriptError::BadHex { line })?;
            if !response.ends_with(&expected) {
                return Err(ScriptError::Mismatch {
                    line,
                    sent: hex::encode(&cmd),
                    got: hex::encode(&response),
                    expected: hex::encode(&expected),
                });
            }
        }
        steps.push(Step {
            line,
            sent: cmd,
            response,
        });
    }
    Ok(steps)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferroeid_core::Protocol;

    #[test]
    fn runs_the_personalization_flow() {
        let mut reader = Reader::with_seed(Protocol::T1, 3);
        let script = "\
# personalize and check the PIN
00 DA 01 01 10 31313131FFFFFFFF 32323232FFFFFFFF => 9000
00 44 00 00 00 => 9000
00 20 00 01 08 31313131FFFFFFFF => 9000
00 20 00 01 08 40404040FFFFFFFF => 63c4
";
        let steps = run(&mut reader, script).unwrap();
        assert_eq!(steps.len(), 4);
    }

    #[test]
    fn reports_mismatches_with_context() {
        let mut reader = Reader::with_seed(Protocol::T1, 4);
        let err = run(&mut reader, "00 A4 00 00 02 AB CD => 9000").unwrap_err();
        match err {
            ScriptError::Mismatch { line, got, .. } => {
                assert_eq!(line, 1);
                assert_eq!(got, "6a82");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_hex() {
        let mut reader = Reader::with_seed(Protocol::T1, 5);
        assert_eq!(
            run(&mut reader, "00 A4 zz").unwrap_err(),
            ScriptError::BadHex { line: 1 }
        );
    }
}
