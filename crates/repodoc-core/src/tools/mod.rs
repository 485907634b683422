//! Tool registry: the closed capability set offered to the model.
//!
//! Tools are the actions a model can invoke during a documentation run.
//! The catalog is fixed at compile time ([`ToolName`]); a name outside it is
//! rejected with [`ToolError::UnknownTool`] and never resolved dynamically.
//! A final-answer call that reaches dispatch failed to decode and is
//! reported as [`ToolError::InvalidArguments`].
//! Every file access is confined to the run's [`Snapshot`].

pub mod fs;
pub mod sandbox;
pub mod sections;

use serde::Deserialize;

use crate::llm::types::{FINAL_ANSWER_TOOL, FinalAnswer, ToolCall, ToolDefinition};

pub use fs::SearchHit;
pub use sandbox::Snapshot;
pub use sections::{DocumentSection, DocumentSections, SectionWrite};

/// Errors from tool execution.
///
/// All of them are reported back to the model as an observation. Capacity
/// errors ([`is_capacity`](Self::is_capacity)) additionally end the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{path} is {size} bytes, over the {max} byte limit; content truncated")]
    TooLarge {
        path: String,
        size: usize,
        max: usize,
        /// The readable prefix followed by a truncation marker.
        partial: String,
    },

    #[error("path escapes the repository root: {0}")]
    PathEscape(String),

    #[error("section limit of {max} reached")]
    SectionLimit { max: usize },

    #[error("section {title:?} is {size} bytes, over the {max} byte limit")]
    SectionTooLarge {
        title: String,
        size: usize,
        max: usize,
    },

    #[error("I/O error: {0}")]
    Io(String),

    /// A failure reproduced from a recorded run, with the exact observation
    /// the model saw then.
    #[error("{observation}")]
    Recorded { kind: String, observation: String },
}

impl ToolError {
    /// Resource exhaustion that must abort the run.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::SectionLimit { .. } | Self::SectionTooLarge { .. })
    }

    /// Whether the failure counts toward the consecutive-failure cap. A
    /// truncated read still returns usable content.
    pub fn counts_as_failure(&self) -> bool {
        match self {
            Self::TooLarge { .. } => false,
            Self::Recorded { kind, .. } => kind != "too_large",
            _ => true,
        }
    }

    /// Short machine-readable name used in ledger records.
    pub fn kind(&self) -> &str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::NotFound(_) => "not_found",
            Self::TooLarge { .. } => "too_large",
            Self::PathEscape(_) => "path_escape",
            Self::SectionLimit { .. } => "section_limit",
            Self::SectionTooLarge { .. } => "section_too_large",
            Self::Io(_) => "io",
            Self::Recorded { kind, .. } => kind,
        }
    }

    /// Text fed back to the model for this failure.
    pub fn observation(&self) -> String {
        match self {
            Self::TooLarge { partial, .. } => format!("Error: {self}\n\n{partial}"),
            Self::Recorded { observation, .. } => observation.clone(),
            _ => format!("Error: {self}"),
        }
    }
}

/// The closed tool catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolName {
    ListFiles,
    ReadFile,
    SearchCode,
    WriteSection,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        Self::ListFiles,
        Self::ReadFile,
        Self::SearchCode,
        Self::WriteSection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListFiles => "list_files",
            Self::ReadFile => "read_file",
            Self::SearchCode => "search_code",
            Self::WriteSection => "write_section",
        }
    }

    /// Look a model-supplied name up in the catalog.
    pub fn parse(name: &str) -> Result<Self, ToolError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Definition sent to the model.
    pub fn definition(self) -> ToolDefinition {
        let (description, parameters) = match self {
            Self::ListFiles => (
                "List files under a directory of the repository, recursively, as paths \
                 relative to the repository root.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Directory relative to the repository root (default \".\")"
                        }
                    }
                }),
            ),
            Self::ReadFile => (
                "Read the contents of a file. Large files are truncated.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "File path relative to the repository root"
                        }
                    },
                    "required": ["path"]
                }),
            ),
            Self::SearchCode => (
                "Search the repository for a literal string. Returns file:line: snippet \
                 lines, files with the most matches first.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Literal text to search for"
                        },
                        "scope": {
                            "type": "string",
                            "description": "Optional directory to scope the search"
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Self::WriteSection => (
                "Write one section of the documentation in Markdown. Writing a title that \
                 already exists replaces that section.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "content": {"type": "string", "description": "Markdown body"}
                    },
                    "required": ["title", "content"]
                }),
            ),
        };
        ToolDefinition {
            name: self.as_str().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits applied to tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLimits {
    pub max_read_bytes: usize,
    pub max_search_results: usize,
    pub max_list_entries: usize,
    pub exclude_dirs: Vec<String>,
}

impl From<&repodoc_config::ToolsConfig> for ToolLimits {
    fn from(config: &repodoc_config::ToolsConfig) -> Self {
        Self {
            max_read_bytes: config.max_read_bytes,
            max_search_results: config.max_search_results,
            max_list_entries: config.max_list_entries,
            exclude_dirs: config.exclude_dirs.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ListFilesArgs {
    #[serde(default = "current_dir")]
    path: String,
}

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[derive(Deserialize)]
struct SearchCodeArgs {
    query: String,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct WriteSectionArgs {
    title: String,
    content: String,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: ToolName, raw: &serde_json::Value) -> Result<T, ToolError> {
    let value = match raw {
        serde_json::Value::Null => serde_json::json!({}),
        serde_json::Value::String(s) => {
            serde_json::from_str(s).map_err(|e| ToolError::InvalidArguments {
                tool: tool.to_string(),
                message: format!("arguments are not valid JSON: {e}"),
            })?
        }
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

fn final_answer_error(raw: &serde_json::Value) -> ToolError {
    let message = match serde_json::from_value::<FinalAnswer>(raw.clone()) {
        Err(e) => e.to_string(),
        Ok(_) => "final answer must be the only signal in its reply".to_string(),
    };
    ToolError::InvalidArguments {
        tool: FINAL_ANSWER_TOOL.to_string(),
        message,
    }
}

/// The tool catalog bound to one run's snapshot.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    snapshot: Snapshot,
    limits: ToolLimits,
}

impl ToolRegistry {
    pub fn new(snapshot: Snapshot, limits: ToolLimits) -> Self {
        Self { snapshot, limits }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// All tool names, in catalog order.
    pub fn names(&self) -> Vec<&'static str> {
        ToolName::ALL.iter().map(|t| t.as_str()).collect()
    }

    /// All tool definitions (for sending to the model), in catalog order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ToolName::ALL.iter().map(|t| t.definition()).collect()
    }

    /// Validate and execute one tool call, returning the observation text.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        sections: &mut DocumentSections,
    ) -> Result<String, ToolError> {
        // Well-formed final answers never reach dispatch.
        if call.name == FINAL_ANSWER_TOOL {
            return Err(final_answer_error(&call.arguments));
        }
        let tool = ToolName::parse(&call.name)?;
        match tool {
            ToolName::ListFiles => {
                let args: ListFilesArgs = parse_args(tool, &call.arguments)?;
                let files = self
                    .blocking(move |snap, limits| fs::list_files(snap, limits, &args.path))
                    .await?;
                Ok(self.format_listing(files))
            }
            ToolName::ReadFile => {
                let args: ReadFileArgs = parse_args(tool, &call.arguments)?;
                self.blocking(move |snap, limits| fs::read_file(snap, limits, &args.path))
                    .await
            }
            ToolName::SearchCode => {
                let args: SearchCodeArgs = parse_args(tool, &call.arguments)?;
                let query = args.query.clone();
                let hits = self
                    .blocking(move |snap, limits| {
                        fs::search_code(snap, limits, &args.query, args.scope.as_deref())
                    })
                    .await?;
                Ok(format_hits(&query, &hits))
            }
            ToolName::WriteSection => {
                let args: WriteSectionArgs = parse_args(tool, &call.arguments)?;
                let outcome = sections.write(&args.title, &args.content)?;
                Ok(match outcome {
                    SectionWrite::Appended { order } => {
                        format!("Section {:?} written (#{}).", args.title.trim(), order + 1)
                    }
                    SectionWrite::Replaced { order } => format!(
                        "Section {:?} already existed (#{}); its content was replaced.",
                        args.title.trim(),
                        order + 1
                    ),
                })
            }
        }
    }

    /// Run a filesystem tool on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, ToolError>
    where
        T: Send + 'static,
        F: FnOnce(&Snapshot, &ToolLimits) -> Result<T, ToolError> + Send + 'static,
    {
        let snapshot = self.snapshot.clone();
        let limits = self.limits.clone();
        tokio::task::spawn_blocking(move || op(&snapshot, &limits))
            .await
            .map_err(|e| ToolError::Io(format!("tool task failed: {e}")))?
    }

    fn format_listing(&self, files: Vec<String>) -> String {
        if files.is_empty() {
            return "(no files)".to_string();
        }
        let total = files.len();
        let cap = self.limits.max_list_entries;
        let mut out = files.into_iter().take(cap).collect::<Vec<_>>().join("\n");
        if total > cap {
            out.push_str(&format!("\n... {} more entries not shown", total - cap));
        }
        out
    }
}

fn format_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No matches for {query:?}.");
    }
    hits.iter()
        .map(|h| format!("{}:{}: {}", h.file, h.line, h.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}
