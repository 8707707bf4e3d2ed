use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tree_sitter::{Language, Parser};

/// Budget for one syntax check, independent of the build retry backoff. A
/// checker that blows this budget yields `TimedOut`, which shares the retry
/// counter with genuine syntax errors but is tracked separately for
/// diagnostics.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid { detail: String },
    TimedOut,
}

/// Language-aware syntax check seam. The production implementation parses
/// with tree-sitter; tests substitute scripted results.
#[async_trait]
pub trait SyntaxValidator: Send + Sync {
    async fn validate(&self, path: &str, content: &str) -> ValidationOutcome;
}

pub struct TreeSitterValidator {
    timeout: Duration,
}

impl Default for TreeSitterValidator {
    fn default() -> Self {
        Self {
            timeout: VALIDATION_TIMEOUT,
        }
    }
}

impl TreeSitterValidator {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SyntaxValidator for TreeSitterValidator {
    async fn validate(&self, path: &str, content: &str) -> ValidationOutcome {
        let Some(language) = language_for_path(path) else {
            // No grammar for this file type; accept as-is.
            return ValidationOutcome::Valid;
        };
        let content = content.to_string();
        let parse = tokio::task::spawn_blocking(move || parse_outcome(language, &content));
        match tokio::time::timeout(self.timeout, parse).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => ValidationOutcome::Invalid {
                detail: format!("parser task failed: {join_err}"),
            },
            Err(_) => ValidationOutcome::TimedOut,
        }
    }
}

fn parse_outcome(language: Language, content: &str) -> ValidationOutcome {
    let mut parser = Parser::new();
    if let Err(err) = parser.set_language(&language) {
        return ValidationOutcome::Invalid {
            detail: format!("grammar rejected: {err}"),
        };
    }
    match parser.parse(content, None) {
        Some(tree) if !tree.root_node().has_error() => ValidationOutcome::Valid,
        Some(tree) => ValidationOutcome::Invalid {
            detail: first_error_detail(&tree, content),
        },
        None => ValidationOutcome::Invalid {
            detail: "parser produced no tree".to_string(),
        },
    }
}

fn first_error_detail(tree: &tree_sitter::Tree, content: &str) -> String {
    let mut cursor = tree.root_node().walk();
    let mut node = tree.root_node();
    // Descend toward the first error node for a usable position.
    'outer: loop {
        if node.is_error() || node.is_missing() {
            break;
        }
        for child in node.children(&mut cursor) {
            if child.has_error() {
                node = child;
                continue 'outer;
            }
        }
        break;
    }
    let pos = node.start_position();
    let line = content.lines().nth(pos.row).unwrap_or("");
    format!(
        "syntax error at line {}, column {}: {}",
        pos.row + 1,
        pos.column + 1,
        line.trim()
    )
}

fn language_for_path(path: &str) -> Option<Language> {
    let ext = Path::new(path).extension()?.to_str()?;
    match ext {
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "ts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "py" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        _ => None,
    }
}
