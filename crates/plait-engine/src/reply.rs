/// Incremental parser for the generated reply format: prose interleaved
/// with per-file sections. A section is a heading line naming the path
/// followed by a fenced code block holding the file's new content:
///
/// ````text
/// ### src/lib.rs
///
/// ```rust
/// pub fn hello() {}
/// ```
/// ````
///
/// The parser is fed arbitrary chunk boundaries and only ever interprets
/// complete lines; a partial trailing line waits for the next chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// A file section's heading and opening fence have both been seen.
    FileStarted { path: String },
    /// More content lines for the currently open section.
    FileContent { path: String, text: String },
    /// The section's closing fence arrived; `content` is the full body.
    FileFinished { path: String, content: String },
}

#[derive(Debug, Default)]
pub struct ReplyParser {
    partial_line: String,
    /// Path announced by the most recent heading, waiting for its fence.
    pending_path: Option<String>,
    open: Option<OpenSection>,
}

#[derive(Debug)]
struct OpenSection {
    path: String,
    content: String,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<ReplyEvent> {
        self.partial_line.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=newline).collect();
            self.consume_line(line.trim_end_matches('\n'), &mut events);
        }
        events
    }

    /// Flush at end of stream. An unterminated section is closed with
    /// whatever content arrived; the builder treats it like any other.
    pub fn finish(&mut self) -> Vec<ReplyEvent> {
        let mut events = Vec::new();
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            self.consume_line(&line, &mut events);
        }
        if let Some(open) = self.open.take() {
            events.push(ReplyEvent::FileFinished {
                path: open.path,
                content: open.content,
            });
        }
        self.pending_path = None;
        events
    }

    pub fn open_path(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.path.as_str())
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<ReplyEvent>) {
        if let Some(mut open) = self.open.take() {
            if is_fence(line) {
                events.push(ReplyEvent::FileFinished {
                    path: open.path,
                    content: open.content,
                });
            } else {
                open.content.push_str(line);
                open.content.push('\n');
                events.push(ReplyEvent::FileContent {
                    path: open.path.clone(),
                    text: format!("{line}\n"),
                });
                self.open = Some(open);
            }
            return;
        }

        if let Some(path) = heading_path(line) {
            self.pending_path = Some(path);
            return;
        }
        if is_fence(line) {
            if let Some(path) = self.pending_path.take() {
                events.push(ReplyEvent::FileStarted { path: path.clone() });
                self.open = Some(OpenSection {
                    path,
                    content: String::new(),
                });
            }
            return;
        }
        // Prose between a heading and its fence detaches the heading.
        if !line.trim().is_empty() {
            self.pending_path = None;
        }
    }
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// A heading line names a file when its text looks like a path rather than
/// prose: no spaces, and at least one separator or extension dot.
fn heading_path(line: &str) -> Option<String> {
    let rest = line.strip_prefix("### ").or_else(|| line.strip_prefix("## "))?;
    let candidate = rest.trim();
    let looks_like_path =
        !candidate.is_empty() && !candidate.contains(' ') && (candidate.contains('/') || candidate.contains('.'));
    looks_like_path.then(|| candidate.to_string())
}
