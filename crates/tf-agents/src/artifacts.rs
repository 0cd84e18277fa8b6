//! Artifact extraction from model responses.
//!
//! Every fenced code block becomes a named artifact
//! (`<phase>_<index>.<ext>`), the full response is kept as
//! `<phase>_summary`, and a short result summary is pulled out of the
//! role's summary heading.

use std::path::PathBuf;
use std::sync::Arc;

use tf_core::store::{StoreError, TaskStore};
use tf_core::types::{AgentRole, Task};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Minimum length of a paragraph accepted as a fallback summary.
pub const MIN_PARAGRAPH_CHARS: usize = 50;
/// Length of the raw-prefix summary used when nothing better is found.
pub const SUMMARY_PREFIX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub content: String,
}

/// Phase name used in artifact file names.
pub fn phase_name(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Designer => "design",
        AgentRole::Developer => "development",
        AgentRole::Tester => "testing",
        AgentRole::Reviewer => "review",
        AgentRole::Controller | AgentRole::Generalist => "task",
    }
}

/// Heading whose body is the result summary for `role`.
pub fn summary_heading(role: AgentRole) -> Option<&'static str> {
    match role {
        AgentRole::Designer => Some("Architecture Overview"),
        AgentRole::Developer => Some("Implementation Summary"),
        AgentRole::Tester => Some("Test Summary"),
        AgentRole::Reviewer => Some("Review Summary"),
        AgentRole::Controller | AgentRole::Generalist => None,
    }
}

pub fn extension_for(language: Option<&str>) -> &'static str {
    let Some(lang) = language else {
        return "txt";
    };
    match lang.to_ascii_lowercase().as_str() {
        "python" | "py" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "tsx" => "tsx",
        "jsx" => "jsx",
        "rust" | "rs" => "rs",
        "go" | "golang" => "go",
        "java" => "java",
        "kotlin" | "kt" => "kt",
        "c" => "c",
        "cpp" | "c++" | "cxx" => "cpp",
        "csharp" | "c#" | "cs" => "cs",
        "ruby" | "rb" => "rb",
        "php" => "php",
        "swift" => "swift",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        "sql" => "sql",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        "markdown" | "md" => "md",
        "bash" | "sh" | "shell" | "zsh" => "sh",
        "dockerfile" | "docker" => "dockerfile",
        _ => "txt",
    }
}

/// All fenced (```) code blocks, in order. An unterminated trailing block
/// is still returned.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(Option<String>, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.take() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    let lang = info
                        .split_whitespace()
                        .next()
                        .filter(|l| !l.is_empty())
                        .map(str::to_string);
                    current = Some((lang, Vec::new()));
                }
            }
            Some((lang, mut lines)) => {
                if trimmed.starts_with("```") {
                    blocks.push(CodeBlock {
                        language: lang,
                        content: lines.join("\n"),
                    });
                } else {
                    lines.push(line);
                    current = Some((lang, lines));
                }
            }
        }
    }
    if let Some((lang, lines)) = current {
        if !lines.is_empty() {
            blocks.push(CodeBlock {
                language: lang,
                content: lines.join("\n"),
            });
        }
    }
    blocks
}

/// Named artifacts for a response: one per code block plus the summary.
pub fn extract_artifacts(phase: &str, response: &str) -> Vec<Artifact> {
    let mut artifacts: Vec<Artifact> = extract_code_blocks(response)
        .into_iter()
        .enumerate()
        .map(|(i, block)| Artifact {
            name: format!(
                "{}_{}.{}",
                phase,
                i + 1,
                extension_for(block.language.as_deref())
            ),
            content: block.content,
        })
        .collect();
    artifacts.push(Artifact {
        name: format!("{phase}_summary"),
        content: response.to_string(),
    });
    artifacts
}

fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let text = trimmed.trim_start_matches('#');
    if text.len() == trimmed.len() {
        return None;
    }
    Some(text.trim().trim_end_matches(':').trim())
}

fn section_under(response: &str, heading: &str) -> Option<String> {
    let mut lines = response.lines();
    lines.find(|l| heading_text(l).is_some_and(|h| h.eq_ignore_ascii_case(heading)))?;
    let body: Vec<&str> = lines.take_while(|l| heading_text(l).is_none()).collect();
    let body = body.join("\n").trim().to_string();
    (!body.is_empty()).then_some(body)
}

/// Short result summary: the role's heading section, else the first long
/// enough prose paragraph, else a raw prefix.
pub fn summarize(role: AgentRole, response: &str) -> String {
    if let Some(section) = summary_heading(role).and_then(|h| section_under(response, h)) {
        return section;
    }

    let paragraph = response
        .split("\n\n")
        .map(str::trim)
        .find(|p| {
            p.chars().count() >= MIN_PARAGRAPH_CHARS && !p.starts_with('#') && !p.starts_with("```")
        });
    if let Some(p) = paragraph {
        return p.to_string();
    }

    response.trim().chars().take(SUMMARY_PREFIX_CHARS).collect()
}

// ---------------------------------------------------------------------------
// ArtifactSink
// ---------------------------------------------------------------------------

/// Persists artifacts as context entries on the task and, when a
/// workspace is configured, as files under
/// `<workspace>/<project_id or task_id>/`.
pub struct ArtifactSink {
    store: Arc<dyn TaskStore>,
    workspace: Option<PathBuf>,
}

impl ArtifactSink {
    pub fn new(store: Arc<dyn TaskStore>, workspace: Option<PathBuf>) -> Self {
        Self { store, workspace }
    }

    pub async fn save(&self, task: &Task, artifacts: &[Artifact]) -> Result<Vec<PathBuf>> {
        for artifact in artifacts {
            self.store
                .set_context(task.id, &artifact.name, &artifact.content)
                .await?;
        }

        let Some(root) = &self.workspace else {
            return Ok(Vec::new());
        };
        let dir = root.join(task.project_id.unwrap_or(task.id).to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: dir.clone(),
                source,
            })?;

        let mut written = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let path = dir.join(&artifact.name);
            tokio::fs::write(&path, &artifact.content)
                .await
                .map_err(|source| ArtifactError::Io {
                    path: path.clone(),
                    source,
                })?;
            debug!(task_id = %task.id, path = %path.display(), "artifact written");
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESIGN: &str = "\
Intro line.

## Architecture Overview
Architecture: microservices behind a gateway.

## Data Model
```sql
CREATE TABLE users (id INTEGER);
```

```python
print('hi')
```
";

    #[test]
    fn code_blocks_in_order() {
        let blocks = extract_code_blocks(DESIGN);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language.as_deref(), Some("sql"));
        assert_eq!(blocks[0].content, "CREATE TABLE users (id INTEGER);");
        assert_eq!(blocks[1].language.as_deref(), Some("python"));
    }

    #[test]
    fn unlabelled_and_unterminated_blocks() {
        let blocks = extract_code_blocks("```\nplain\n```\n```rust\nfn main() {}\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, None);
        assert_eq!(blocks[1].content, "fn main() {}");
    }

    #[test]
    fn artifact_names() {
        let artifacts = extract_artifacts("design", DESIGN);
        let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["design_1.sql", "design_2.py", "design_summary"]);
        assert_eq!(artifacts[2].content, DESIGN);
    }

    #[test]
    fn extensions() {
        assert_eq!(extension_for(Some("TypeScript")), "ts");
        assert_eq!(extension_for(Some("bash")), "sh");
        assert_eq!(extension_for(Some("brainfuck")), "txt");
        assert_eq!(extension_for(None), "txt");
    }

    #[test]
    fn summary_prefers_heading() {
        assert_eq!(
            summarize(AgentRole::Designer, DESIGN),
            "Architecture: microservices behind a gateway."
        );
    }

    #[test]
    fn summary_falls_back_to_paragraph_then_prefix() {
        let prose = "short\n\nThis paragraph is comfortably longer than fifty characters in total.";
        assert_eq!(
            summarize(AgentRole::Tester, prose),
            "This paragraph is comfortably longer than fifty characters in total."
        );

        let long = "y".repeat(800);
        let text = format!("# Title\n\n```\n{long}\n```");
        assert_eq!(summarize(AgentRole::Reviewer, &text).chars().count(), 500);
    }

    #[test]
    fn heading_with_colon_matches() {
        let text = "### Test Summary:\nAll 12 tests pass.\n### Issues Found\nnone";
        assert_eq!(summarize(AgentRole::Tester, text), "All 12 tests pass.");
    }
}
