//! Question router.
//!
//! A single schema-constrained model call picks one of two named options.
//! The reply is interpreted into an explicit [`Route`]; anything other than
//! exactly one recognised selection routes to [`Route::Knowledge`], so an
//! ambiguous classification never skips grounding.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::llm::{CompletionRequest, LanguageModel};

pub const CASUAL_OPTION: &str = "casual_chat";
pub const KNOWLEDGE_OPTION: &str = "knowledge_base_retrieval";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Casual,
    Knowledge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub route: Route,
    pub reason: String,
}

impl RouteDecision {
    fn knowledge(reason: impl Into<String>) -> Self {
        Self {
            route: Route::Knowledge,
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize)]
struct SelectorReply {
    #[serde(default)]
    selections: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

const ROUTER_SYSTEM: &str = "You route user messages for a document question-answering assistant. \
Choose casual_chat for greetings, thanks, small talk, or questions about the assistant itself. \
Choose knowledge_base_retrieval for anything that may be answered from the user's documents. \
Reply with JSON: {\"selections\": [<option>], \"reason\": <short string>}.";

/// JSON schema for the selector reply.
pub fn selector_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "selections": {
                "type": "array",
                "items": { "type": "string", "enum": [CASUAL_OPTION, KNOWLEDGE_OPTION] }
            },
            "reason": { "type": "string" }
        },
        "required": ["selections", "reason"],
        "additionalProperties": false
    })
}

/// Build the classification request for `question`.
pub fn routing_request(question: &str) -> CompletionRequest {
    CompletionRequest::new(ROUTER_SYSTEM, format!("Message: {}", question))
        .with_schema("route_selection", selector_schema())
}

/// Interpret a raw selector reply.
pub fn interpret_selection(raw: &str) -> RouteDecision {
    let reply: SelectorReply = match serde_json::from_str(raw.trim()) {
        Ok(r) => r,
        Err(e) => return RouteDecision::knowledge(format!("unparseable selection: {}", e)),
    };

    let mut selected: Vec<Route> = Vec::new();
    for s in &reply.selections {
        let route = match s.as_str() {
            CASUAL_OPTION => Route::Casual,
            KNOWLEDGE_OPTION => Route::Knowledge,
            other => return RouteDecision::knowledge(format!("unknown option '{}'", other)),
        };
        if !selected.contains(&route) {
            selected.push(route);
        }
    }

    match selected.as_slice() {
        [] => RouteDecision::knowledge("no option selected"),
        [route] => RouteDecision {
            route: *route,
            reason: reply.reason.unwrap_or_default(),
        },
        _ => RouteDecision::knowledge("multiple options selected"),
    }
}

/// Classify `question` with one model call. Model failures route to knowledge.
pub async fn classify(llm: &dyn LanguageModel, question: &str) -> RouteDecision {
    match llm.complete(&routing_request(question)).await {
        Ok(raw) => interpret_selection(&raw),
        Err(e) => RouteDecision::knowledge(format!("router call failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_casual_selection() {
        let d = interpret_selection(r#"{"selections":["casual_chat"],"reason":"greeting"}"#);
        assert_eq!(d.route, Route::Casual);
        assert_eq!(d.reason, "greeting");
    }

    #[test]
    fn single_knowledge_selection() {
        let d = interpret_selection(r#"{"selections":["knowledge_base_retrieval"],"reason":"x"}"#);
        assert_eq!(d.route, Route::Knowledge);
    }

    #[test]
    fn zero_selections_route_to_knowledge() {
        let d = interpret_selection(r#"{"selections":[],"reason":"unsure"}"#);
        assert_eq!(d.route, Route::Knowledge);
    }

    #[test]
    fn multiple_selections_route_to_knowledge() {
        let d = interpret_selection(
            r#"{"selections":["casual_chat","knowledge_base_retrieval"],"reason":"both"}"#,
        );
        assert_eq!(d.route, Route::Knowledge);
        assert_eq!(d.reason, "multiple options selected");
    }

    #[test]
    fn repeated_single_option_counts_once() {
        let d = interpret_selection(r#"{"selections":["casual_chat","casual_chat"]}"#);
        assert_eq!(d.route, Route::Casual);
    }

    #[test]
    fn garbage_routes_to_knowledge() {
        assert_eq!(interpret_selection("casual_chat").route, Route::Knowledge);
        assert_eq!(
            interpret_selection(r#"{"selections":["weather"]}"#).route,
            Route::Knowledge
        );
    }
}
