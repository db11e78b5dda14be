//! Request text for the chat-completions client.

/// Response budget per chunk token.
const RESPONSE_TOKEN_SCALE: f64 = 2.5;
/// Floor for the response budget so that tiny chunks still get a usable answer.
const MIN_RESPONSE_TOKENS: usize = 256;

/// System prompt asking for one `term: explanation` line per gloss.
pub(crate) fn system_prompt(target_language: &str) -> String {
    format!(
        "You write glossary popups for a reader of a foreign-language book.\n\
         The user message contains numbered <fragment> elements taken from the book, in \
         reading order. Pick the words and idioms a learner is unlikely to know and explain \
         each one briefly in {target_language}.\n\
         Answer with one line per entry, in reading order, formatted exactly as \
         `term: explanation`. Copy every term exactly as it appears in the fragment. \
         Do not number the lines and do not add any other text."
    )
}

/// User message: optional rules followed by the escaped fragments.
pub(crate) fn user_message(segments: &[String], user_prompt: Option<&str>) -> String {
    let mut message = String::new();
    if let Some(rules) = user_prompt {
        message.push_str("<rules>");
        message.push_str(rules);
        message.push_str("</rules>\n\n");
    }
    message.push_str("<request>\n");
    for (index, segment) in segments.iter().enumerate() {
        message.push_str(&format!(
            "<fragment id=\"{}\">{}</fragment>\n",
            index + 1,
            escape(&collapse_spaces(segment))
        ));
    }
    message.push_str("</request>");
    message
}

/// Upper bound on generated tokens for a chunk of `tokens`.
pub(crate) fn response_budget(tokens: usize) -> usize {
    ((tokens as f64 * RESPONSE_TOKEN_SCALE).ceil() as usize).max(MIN_RESPONSE_TOKENS)
}

/// Normalize user-supplied rules.
///
/// Whitespace inside a line collapses to single spaces, one blank line between paragraphs is
/// kept, and longer blank runs become two blank lines. Rules without any text are dropped.
pub fn normalize_user_prompt(raw: &str) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0;

    for line in raw.lines() {
        let cleaned = collapse_spaces(line);
        if cleaned.is_empty() {
            blank_run += 1;
            continue;
        }
        if !lines.is_empty() {
            match blank_run {
                0 => {}
                1 => lines.push(String::new()),
                _ => {
                    lines.push(String::new());
                    lines.push(String::new());
                }
            }
        }
        blank_run = 0;
        lines.push(cleaned);
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Undo [`escape`] on text echoed back by the model.
pub(crate) fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
