//! Classification of engine console output.
//!
//! The engine is chatty and writes most diagnostics to stderr, so stream
//! choice says nothing about severity. Each line is matched against an
//! ordered table of substring rules; the first match wins. Lines that
//! match nothing and carry meaningful content are treated as fatal
//! during startup.

use std::sync::LazyLock;

use serde::Serialize;

/// How a single line of engine output should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    /// Benign diagnostic worth logging.
    Informational,
    /// Known chatter (progress bars, model loading). Not logged.
    Suppressible,
    /// Unrecognized error output.
    Fatal,
}

/// A `(pattern, classification)` pair. Matching is by substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierRule {
    pub pattern: String,
    pub class: LineClass,
}

impl ClassifierRule {
    pub fn new(pattern: impl Into<String>, class: LineClass) -> Self {
        Self {
            pattern: pattern.into(),
            class,
        }
    }
}

/// Lines whose trimmed length is at or below this are noise.
pub const DEFAULT_MIN_MEANINGFUL_LEN: usize = 5;

/// Marker printed by the engine when its Python requirements are stale.
pub const DEPENDENCY_UPDATE_MARKER: &str = "pip install -r requirements.txt";

const SUPPRESSIBLE_PATTERNS: &[&str] = &[
    "FETCH ComfyRegistry Data",
    "FETCH DATA from",
    "Using pytorch attention in VAE",
    "VAE load device",
    "Requested to load",
    "loaded completely",
    "loaded partially",
    "UserWarning",
    "Using scaled fp8",
    "CLIP/text encoder model load",
    "clip missing",
    "model weight dtype",
    "model_type FLUX",
    "Torch was not compiled with flash attention",
    "got prompt",
    "Token indices sequence length",
    "Prompt executed in",
    "[DONE]",
    "All startup tasks have been completed",
    "it/s",
    "|",
    "%",
];

const INFORMATIONAL_PATTERNS: &[&str] = &[
    // Version banners and environment info.
    "ComfyUI startup time",
    "Platform:",
    "Python version",
    "ComfyUI Path:",
    "User directory:",
    "ComfyUI version",
    "pytorch version:",
    "Total VRAM",
    "Set vram state",
    "Device: cuda",
    "Using pytorch attention",
    "Checkpoint files will always be loaded safely",
    "Released on",
    // Server lifecycle.
    "Prompt Server",
    "Starting server",
    "To see the GUI",
    "Loading:",
    "cache updated",
    "network_mode",
    "ComfyUI-Manager",
    // Custom-node import reports.
    "Prestartup times",
    "Import times",
    "Cannot import",
    "IMPORT FAILED",
    "seconds:",
    "custom_nodes",
    "websocket_image_save.py",
    "comfyui-embedded-docs package not found",
    "WARNING",
    // Known false positives.
    "frontend version",
    "Unable to parse pyproject.toml",
    "Context impl",
    "No target revision found",
];

static DEFAULT_RULES: LazyLock<Vec<ClassifierRule>> = LazyLock::new(|| {
    SUPPRESSIBLE_PATTERNS
        .iter()
        .map(|p| ClassifierRule::new(*p, LineClass::Suppressible))
        .chain(
            INFORMATIONAL_PATTERNS
                .iter()
                .map(|p| ClassifierRule::new(*p, LineClass::Informational)),
        )
        .collect()
});

/// Data-driven line classifier.
///
/// Extend with [`OutputClassifier::with_rule`]; added rules are checked
/// before the built-in table.
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    rules: Vec<ClassifierRule>,
    min_meaningful_len: usize,
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
            min_meaningful_len: DEFAULT_MIN_MEANINGFUL_LEN,
        }
    }
}

impl OutputClassifier {
    /// A classifier with no rules. Every meaningful line is fatal.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            min_meaningful_len: DEFAULT_MIN_MEANINGFUL_LEN,
        }
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, class: LineClass) -> Self {
        self.rules.insert(0, ClassifierRule::new(pattern, class));
        self
    }

    pub fn with_min_meaningful_len(mut self, len: usize) -> Self {
        self.min_meaningful_len = len;
        self
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, line: &str) -> LineClass {
        if let Some(rule) = self.rules.iter().find(|r| line.contains(r.pattern.as_str())) {
            return rule.class;
        }
        if line.trim().len() <= self.min_meaningful_len {
            return LineClass::Suppressible;
        }
        LineClass::Fatal
    }

    /// True when the line asks the operator to reinstall requirements.
    ///
    /// Checked independently of [`classify`](Self::classify) so the
    /// supervisor can surface it as its own failure cause.
    pub fn requires_dependency_update(&self, line: &str) -> bool {
        line.contains(DEPENDENCY_UPDATE_MARKER)
    }
}

/// Per-class line counts accumulated over a process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounters {
    pub informational: u64,
    pub suppressible: u64,
    pub fatal: u64,
}

impl ClassCounters {
    pub fn record(&mut self, class: LineClass) {
        match class {
            LineClass::Informational => self.informational += 1,
            LineClass::Suppressible => self.suppressible += 1,
            LineClass::Fatal => self.fatal += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.informational + self.suppressible + self.fatal
    }
}
