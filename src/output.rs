use std::sync::Arc;

/// One emitted token. Cheap to clone; slices of tokens are captured and
/// replayed by the solution-capturing combinators.
pub type Token = Arc<str>;

/// The token that renders as a line break.
pub const NEWLINE: &str = "\n";

/// Position in the output buffer observed before a speculative step.
pub type Watermark = usize;

/// Append-only token buffer with a watermark protocol.
///
/// Contract: a step that fails (returns `Ok(false)`) leaves the buffer at
/// the length observed on entry. Steps maintain this by truncating back to
/// their entry watermark whenever their continuation fails.
#[derive(Debug, Default)]
pub struct TextBuffer {
    tokens: Vec<Token>,
}

impl TextBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Current length, used as a watermark.
    pub fn mark(&self) -> Watermark {
        self.tokens.len()
    }

    /// True if nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Append a single token.
    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }

    /// Append a token from a string slice.
    pub fn push_str(&mut self, token: &str) {
        self.tokens.push(Arc::from(token));
    }

    /// Append a run of tokens.
    pub fn append_slice(&mut self, tokens: &[Token]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// Discard everything emitted after `mark`.
    pub fn truncate(&mut self, mark: Watermark) {
        self.tokens.truncate(mark);
    }

    /// The tokens produced since `mark`: the "difference" used to replay a
    /// chosen solution after the search has moved past it.
    pub fn difference(&self, mark: Watermark) -> Vec<Token> {
        self.tokens[mark.min(self.tokens.len())..].to_vec()
    }

    /// View of all tokens emitted so far.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Render the buffer to a string.
    ///
    /// Tokens are joined with single spaces. No space is inserted before
    /// closing punctuation, after an opening bracket, or around line
    /// breaks. Tokens otherwise pass through verbatim.
    pub fn format(&self) -> String {
        format_tokens(&self.tokens)
    }
}

fn suppresses_leading_space(token: &str) -> bool {
    matches!(token, "." | "," | ";" | ":" | "!" | "?" | ")" | "]" | NEWLINE)
}

fn suppresses_trailing_space(token: &str) -> bool {
    matches!(token, "(" | "[" | NEWLINE)
}

/// Join a token slice per the buffer's formatting rules.
pub fn format_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut last: Option<&str> = None;
    for token in tokens {
        if let Some(prev) = last {
            if !suppresses_trailing_space(prev) && !suppresses_leading_space(token) {
                out.push(' ');
            }
        }
        out.push_str(token);
        last = Some(token);
    }
    out
}
