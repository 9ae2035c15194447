use thiserror::Error;

/// Longest model-output excerpt carried by a [`ResponseFormatError`].
pub const RESPONSE_PREVIEW_CHARS: usize = 200;

/// A language-model response that none of the JSON extraction strategies
/// could turn into the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model response is not usable JSON ({reason}): {preview}")]
pub struct ResponseFormatError {
    pub reason: String,
    pub preview: String,
}

impl ResponseFormatError {
    pub fn new(reason: impl Into<String>, text: &str) -> Self {
        Self {
            reason: reason.into(),
            preview: truncate_preview(text, RESPONSE_PREVIEW_CHARS),
        }
    }
}

pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Failure raised by a generation capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("transient capability failure: {0}")]
    Transient(String),
    #[error("capability I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("capability failed: {0}")]
    Failed(String),
}

impl CapabilityError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            CapabilityError::Transient(_) => true,
            CapabilityError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            CapabilityError::Failed(_) => false,
        }
    }
}

/// Structural failure of a single graph pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassError {
    #[error("pass exceeded {visits} node visits without reaching the end node")]
    StepLimit { visits: usize },
    #[error("pass task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Brief,
    Config,
    Model,
    Capability,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Brief => "BRIEF",
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Model => "MODEL",
            ErrorCategory::Capability => "CAPABILITY",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Brief => {
                "Pass a .json brief with a non-empty \"task\" field. Run museloop brief <path> to validate it."
            }
            ErrorCategory::Config => {
                "Check --config/--profile and the field names in the profiles file."
            }
            ErrorCategory::Model => {
                "Configure a language-model backend (for example --replay responses.json)."
            }
            ErrorCategory::Capability => {
                "Run museloop capabilities to list what is available and check --capability values."
            }
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("brief") {
        return ErrorCategory::Brief;
    }

    if msg.contains("language-model") || msg.contains("replay") || msg.contains("model response")
    {
        return ErrorCategory::Model;
    }

    if msg.contains("profile")
        || msg.contains("config")
        || msg.contains("invalid value")
        || msg.contains("unknown argument")
    {
        return ErrorCategory::Config;
    }

    if msg.contains("capability") {
        return ErrorCategory::Capability;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}
