//! The structured answer contract.
//!
//! Every terminal state of a query is reported as a [`StructuredAnswer`]
//! with this exact wire shape:
//!
//! ```json
//! {
//!   "answer": "...",
//!   "refused": false,
//!   "refusal_reason": "not_in_docs | out_of_scope | unsafe | unknown",
//!   "answer_style": "bullets | sections | paragraph",
//!   "entities": ["..."],
//!   "citations": [{ "file_id": "...", "file_name": "...", "snippets": ["..."] }]
//! }
//! ```
//!
//! Model output is parsed strictly into [`ParsedAnswer::Valid`] or
//! [`ParsedAnswer::Malformed`]; a malformed reply is never partially used.

use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    NotInDocs,
    OutOfScope,
    Unsafe,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStyle {
    Bullets,
    Sections,
    #[default]
    Paragraph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Citation {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub snippets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredAnswer {
    pub answer: String,
    pub refused: bool,
    #[serde(default)]
    pub refusal_reason: RefusalReason,
    #[serde(default)]
    pub answer_style: AnswerStyle,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Reply used whenever no trustworthy answer can be produced.
pub const REFUSAL_TEXT: &str = "I'm sorry, I couldn't process that request.";

impl StructuredAnswer {
    /// A safe refusal with no citations.
    pub fn refused(reason: RefusalReason, answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            refused: true,
            refusal_reason: reason,
            answer_style: AnswerStyle::Paragraph,
            entities: Vec::new(),
            citations: Vec::new(),
        }
    }

    /// The default refusal for failures that have no better explanation.
    pub fn fallback() -> Self {
        Self::refused(RefusalReason::Unknown, REFUSAL_TEXT)
    }

    /// A plain, uncited conversational reply.
    pub fn casual(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            refused: false,
            refusal_reason: RefusalReason::Unknown,
            answer_style: AnswerStyle::Paragraph,
            entities: Vec::new(),
            citations: Vec::new(),
        }
    }

    /// True when the answer carries no usable content.
    pub fn is_degenerate(&self) -> bool {
        self.refused || self.answer.trim().is_empty() || self.citations.is_empty()
    }

    /// Number of markdown bullet lines in the answer text.
    pub fn bullet_count(&self) -> usize {
        self.answer
            .lines()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with("- ") || t.starts_with("* ")
            })
            .count()
    }
}

/// Result of strict parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAnswer {
    Valid(StructuredAnswer),
    Malformed { raw: String, error: String },
}

/// Parse a model reply. JSON may be wrapped in a code fence or prose.
pub fn parse_structured_answer(raw: &str) -> ParsedAnswer {
    let malformed = |error: String| ParsedAnswer::Malformed {
        raw: raw.to_string(),
        error,
    };

    let Some(json_text) = extract_json(raw) else {
        return malformed("no JSON object found".to_string());
    };
    match serde_json::from_str::<StructuredAnswer>(json_text) {
        Ok(answer) => match validate(&answer) {
            Ok(()) => ParsedAnswer::Valid(answer),
            Err(e) => malformed(e),
        },
        Err(e) => malformed(e.to_string()),
    }
}

fn validate(answer: &StructuredAnswer) -> Result<(), String> {
    if !answer.refused && answer.answer.trim().is_empty() {
        return Err("answer is empty but refused is false".to_string());
    }
    if let Some(c) = answer.citations.iter().find(|c| c.file_id.trim().is_empty()) {
        return Err(format!("citation '{}' has an empty file_id", c.file_name));
    }
    Ok(())
}

/// Locate the JSON object in a model reply.
///
/// Prefers the body of a fenced code block, then the outermost `{...}`.
pub fn extract_json(raw: &str) -> Option<&str> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// JSON schema handed to the model for synthesis.
pub fn answer_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "answer": { "type": "string" },
            "refused": { "type": "boolean" },
            "refusal_reason": {
                "type": "string",
                "enum": ["not_in_docs", "out_of_scope", "unsafe", "unknown"]
            },
            "answer_style": {
                "type": "string",
                "enum": ["bullets", "sections", "paragraph"]
            },
            "entities": { "type": "array", "items": { "type": "string" } },
            "citations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "file_id": { "type": "string" },
                        "file_name": { "type": "string" },
                        "snippets": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["file_id", "file_name", "snippets"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["answer", "refused", "refusal_reason", "answer_style", "entities", "citations"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "answer": "Employees accrue 1.5 days per month.",
        "refused": false,
        "refusal_reason": "unknown",
        "answer_style": "paragraph",
        "entities": ["PTO"],
        "citations": [{"file_id": "f1", "file_name": "Handbook.pdf", "snippets": ["1.5 days"]}]
    }"#;

    #[test]
    fn wire_shape_is_exact() {
        let answer = StructuredAnswer::refused(RefusalReason::NotInDocs, "nope");
        let v = serde_json::to_value(&answer).unwrap();
        assert_eq!(
            v,
            json!({
                "answer": "nope",
                "refused": true,
                "refusal_reason": "not_in_docs",
                "answer_style": "paragraph",
                "entities": [],
                "citations": []
            })
        );
    }

    #[test]
    fn parses_valid_reply() {
        match parse_structured_answer(VALID) {
            ParsedAnswer::Valid(a) => {
                assert_eq!(a.citations[0].file_id, "f1");
                assert!(!a.refused);
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[test]
    fn parses_fenced_reply() {
        let raw = format!("Here you go:\n```json\n{}\n```\nThanks", VALID);
        assert!(matches!(parse_structured_answer(&raw), ParsedAnswer::Valid(_)));
    }

    #[test]
    fn parses_reply_wrapped_in_prose() {
        let raw = format!("Sure! {} Hope that helps.", VALID);
        assert!(matches!(parse_structured_answer(&raw), ParsedAnswer::Valid(_)));
    }

    #[test]
    fn rejects_unknown_enum_values() {
        let raw = r#"{"answer":"x","refused":true,"refusal_reason":"because"}"#;
        assert!(matches!(
            parse_structured_answer(raw),
            ParsedAnswer::Malformed { .. }
        ));
        let raw = r#"{"answer":"x","refused":false,"answer_style":"haiku","citations":[{"file_id":"a","file_name":"b"}]}"#;
        assert!(matches!(
            parse_structured_answer(raw),
            ParsedAnswer::Malformed { .. }
        ));
    }

    #[test]
    fn rejects_missing_required_and_wrong_types() {
        assert!(matches!(
            parse_structured_answer(r#"{"refused": false}"#),
            ParsedAnswer::Malformed { .. }
        ));
        assert!(matches!(
            parse_structured_answer(r#"{"answer": "x", "refused": "no"}"#),
            ParsedAnswer::Malformed { .. }
        ));
        assert!(matches!(
            parse_structured_answer("not json at all"),
            ParsedAnswer::Malformed { .. }
        ));
    }

    #[test]
    fn rejects_empty_unrefused_answer() {
        let raw = r#"{"answer":"  ","refused":false}"#;
        assert!(matches!(
            parse_structured_answer(raw),
            ParsedAnswer::Malformed { .. }
        ));
    }

    #[test]
    fn optional_fields_take_defaults() {
        match parse_structured_answer(r#"{"answer":"I don't know","refused":true}"#) {
            ParsedAnswer::Valid(a) => {
                assert_eq!(a.refusal_reason, RefusalReason::Unknown);
                assert_eq!(a.answer_style, AnswerStyle::Paragraph);
                assert!(a.citations.is_empty());
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[test]
    fn counts_bullets() {
        let a = StructuredAnswer::casual("Docs:\n- one\n- two\n  * three\nend");
        assert_eq!(a.bullet_count(), 3);
    }
}
