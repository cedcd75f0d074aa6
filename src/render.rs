// Pure transform from raw message text to displayable segments. No state,
// no escaping; the display layer decides how each segment looks.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    // Plain text, already split into paragraphs on newlines.
    Text { paragraphs: Vec<String> },
    // A fenced code block. The body is carried verbatim so the display
    // layer can offer a copy affordance for it.
    Code { language: String, body: String },
}

/// Splits message content on triple-backtick fences. Odd-indexed parts are
/// code (first line = language label, remainder = body); even-indexed parts
/// are plain text. An unterminated fence still renders as code.
pub fn render_message_content(content: &str) -> Vec<Segment> {
    content
        .split("```")
        .enumerate()
        .map(|(index, part)| {
            if index % 2 == 1 {
                let (language, body) = match part.split_once('\n') {
                    Some((first_line, rest)) => (first_line.to_string(), rest.to_string()),
                    None => (part.to_string(), String::new()),
                };
                Segment::Code { language, body }
            } else {
                Segment::Text {
                    paragraphs: part.split('\n').map(String::from).collect(),
                }
            }
        })
        .collect()
}
