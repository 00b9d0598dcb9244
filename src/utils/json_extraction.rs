//! Cleanup of raw LLM responses before they are parsed or stored.
//!
//! Models frequently wrap structured output in Markdown code fences or return
//! a quoted string. [`clean_response`] strips those wrappers so the payload
//! can be parsed as JSON or stored verbatim as text.
//!
//! # Example
//!
//! ```
//! use stepforge::utils::json_extraction::clean_response;
//!
//! assert_eq!(clean_response("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
//! assert_eq!(clean_response("  plain answer \n"), "plain answer");
//! ```

/// Strips surrounding quotes, Markdown code fences and whitespace.
pub fn clean_response(input: &str) -> String {
    let mut text = input.trim();

    text = text.strip_prefix('"').unwrap_or(text);
    text = text.strip_suffix('"').unwrap_or(text);

    text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text = text.strip_suffix("```").unwrap_or(text);

    text.trim().to_string()
}
