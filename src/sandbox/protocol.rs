//! Stdio protocol spoken with the agent inside the sandbox.
//!
//! One JSON object goes to stdin, then stdin is closed. The agent
//! prints whatever it likes; the result is the text between the two
//! markers below, either a JSON object or raw text.
use serde::{Deserialize, Serialize};

use super::{ExecutionResult, ExecutionStatus};

pub const OUTPUT_START_MARKER: &str = "---NANOGRIDBOT_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOGRIDBOT_OUTPUT_END---";

/// Request written to the sandbox's stdin.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInput<'a> {
    pub prompt: &'a str,
    pub session_id: Option<&'a str>,
    pub group_folder: &'a str,
    pub chat_jid: &'a str,
    pub is_main: bool,
}

/// Marked JSON result as printed by the agent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxOutput {
    status: ExecutionStatus,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    new_session_id: Option<String>,
}

/// Extracts the result from combined sandbox output.
///
/// Returns `None` when no start marker is present. A missing end
/// marker takes everything after the start marker.
pub fn parse_output(output: &str) -> Option<ExecutionResult> {
    let start = output.find(OUTPUT_START_MARKER)? + OUTPUT_START_MARKER.len();
    let rest = &output[start..];
    let body = match rest.find(OUTPUT_END_MARKER) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let body = body.trim();

    match serde_json::from_str::<SandboxOutput>(body) {
        Ok(parsed) => Some(ExecutionResult {
            status: parsed.status,
            result: parsed.result,
            error: parsed.error,
            new_session_id: parsed.new_session_id,
        }),
        Err(_) => Some(ExecutionResult::success(body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_wire_format() {
        let input = SandboxInput {
            prompt: "hello",
            session_id: None,
            group_folder: "main",
            chat_jid: "tg:1",
            is_main: true,
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "prompt": "hello",
                "sessionId": null,
                "groupFolder": "main",
                "chatJid": "tg:1",
                "isMain": true
            })
        );
    }

    #[test]
    fn test_parse_success_json() {
        let out = "---NANOGRIDBOT_OUTPUT_START---\n{\"status\":\"success\",\"result\":\"hi\"}\n---NANOGRIDBOT_OUTPUT_END---";
        let result = parse_output(out).unwrap();
        assert_eq!(result, ExecutionResult::success("hi"));
    }

    #[test]
    fn test_parse_no_markers() {
        assert!(parse_output("agent crashed before printing anything").is_none());
        assert!(parse_output("").is_none());
    }

    #[test]
    fn test_parse_with_surrounding_noise_and_session() {
        let out = "booting...\nlog line\n---NANOGRIDBOT_OUTPUT_START---\n\
                   {\"status\":\"success\",\"result\":\"done\",\"newSessionId\":\"sess-2\"}\n\
                   ---NANOGRIDBOT_OUTPUT_END---\ntrailing stderr\n";
        let result = parse_output(out).unwrap();
        assert!(result.is_success());
        assert_eq!(result.result.as_deref(), Some("done"));
        assert_eq!(result.new_session_id.as_deref(), Some("sess-2"));
    }

    #[test]
    fn test_parse_error_status() {
        let out = "---NANOGRIDBOT_OUTPUT_START---{\"status\":\"error\",\"error\":\"rate limited\"}---NANOGRIDBOT_OUTPUT_END---";
        let result = parse_output(out).unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.as_deref(), Some("rate limited"));
        assert!(result.result.is_none());
    }

    #[test]
    fn test_parse_raw_text_is_success() {
        let out = "---NANOGRIDBOT_OUTPUT_START---\nJust a plain answer.\n---NANOGRIDBOT_OUTPUT_END---";
        let result = parse_output(out).unwrap();
        assert_eq!(result, ExecutionResult::success("Just a plain answer."));
    }

    #[test]
    fn test_parse_missing_end_marker() {
        let out = "---NANOGRIDBOT_OUTPUT_START---\n{\"status\":\"success\",\"result\":\"cut\"}";
        let result = parse_output(out).unwrap();
        assert_eq!(result.result.as_deref(), Some("cut"));
    }
}
