//! Post-processing of raw streamed text: truncation detection and fence stripping.

use std::sync::OnceLock;

use regex::Regex;

use super::{Generation, ModelOptions};

fn outer_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[^\n`]*\r?\n(.*)```").expect("outer fence pattern is valid")
    })
}

fn leading_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*```[^\n`]*(\r?\n|$)").expect("leading fence pattern is valid"))
}

fn trailing_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\r?\n|^)```\s*$").expect("trailing fence pattern is valid"))
}

/// True when the output budget was used up exactly and the text spans several lines.
pub fn hit_predict_limit(text: &str, output_tokens: Option<u32>, options: &ModelOptions) -> bool {
    output_tokens == Some(options.num_predict) && text.contains('\n')
}

/// Drop the last (presumably cut-off) line when the budget was exhausted.
pub fn drop_incomplete_line(text: &str, output_tokens: Option<u32>, options: &ModelOptions) -> (String, bool) {
    if !hit_predict_limit(text, output_tokens, options) {
        return (text.to_string(), false);
    }
    match text.rfind('\n') {
        Some(i) => (text[..i].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Remove one pair of surrounding Markdown fences, or stray opening/closing fences.
pub fn strip_fences(text: &str) -> String {
    if let Some(inner) = outer_fence().captures(text).and_then(|c| c.get(1)) {
        return inner.as_str().to_string();
    }
    let without_open = leading_fence().replace(text, "");
    trailing_fence().replace(&without_open, "").into_owned()
}

/// Full normalization for generated code: truncation, fences, whitespace.
pub fn finalize(text: &str, output_tokens: Option<u32>, options: &ModelOptions) -> Generation {
    let (text, truncated) = drop_incomplete_line(text, output_tokens, options);
    if truncated {
        log::debug!(
            "normalize: output hit num_predict={}, dropped last line",
            options.num_predict
        );
    }
    Generation {
        text: strip_fences(&text).trim().to_string(),
        truncated,
    }
}
