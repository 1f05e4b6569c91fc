//! Trigger matching and prompt rendering for chat batches.
use regex::Regex;

use crate::model::Message;

/// Compiled trigger for one group.
#[derive(Debug, Clone)]
pub struct Trigger {
    pattern: Regex,
}

impl Trigger {
    /// Compiles a group pattern, case-insensitive.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = if pattern.starts_with("(?i)") {
            pattern.to_string()
        } else {
            format!("(?i){pattern}")
        };
        Ok(Self {
            pattern: Regex::new(&pattern)?,
        })
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.pattern.is_match(message.content.trim())
    }

    /// True if at least one message in the batch fires the trigger.
    pub fn any_match(&self, batch: &[Message]) -> bool {
        batch.iter().any(|m| self.matches(m))
    }
}

/// Renders messages as the transcript the agent reads.
pub fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::from("<messages>\n");
    for m in messages {
        out.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>\n",
            escape_xml(m.display_sender()),
            m.timestamp.to_rfc3339(),
            escape_xml(&m.content)
        ));
    }
    out.push_str("</messages>");
    out
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
