use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::LazyLock;

use crate::error::AnalysisError;

/// Default per-category cap when a definition omits one
pub const DEFAULT_CATEGORY_CAP: usize = 25;

/// Built-in categories as `(name, pattern, priority, max_matches)`.
/// Lower priority values are tried first.
const DEFAULT_CATEGORIES: &[(&str, &str, i32, usize)] = &[
    (
        "accelerator_error",
        r"CUDA error|CUDA exception|cudaError\w*|CUBLAS_STATUS_\w+|CUDNN_STATUS_\w+|NCCL (?:error|WARN)|device-side assert|HIP error|ROCm error",
        10,
        25,
    ),
    (
        "out_of_memory",
        r"OutOfMemoryError|[Oo]ut of memory|\bOOM\b|MemoryError|Killed process \d+|std::bad_alloc",
        20,
        25,
    ),
    (
        "timeout",
        r"(?i)\btimed out\b|TimeoutError|exceeded the maximum execution time|deadline exceeded|the operation was canceled",
        30,
        25,
    ),
    (
        "compile_error",
        r"undefined reference to|fatal error:|: error: |error\[E\d{4}\]|error: command .* failed|linker command failed|ld returned \d+ exit status|[Bb]uild failed|[Cc]ompilation failed|ninja: build stopped",
        40,
        50,
    ),
    (
        "test_failure",
        r"FAILED.*test_|^\s*FAIL[:\s]|--- FAIL:|AssertionError|[Aa]ssertion failed|Test failed|\d+ failed",
        50,
        50,
    ),
    (
        "exception",
        r"(?i)exception:|Traceback \(most recent call last\)|panicked at|Segmentation fault|core dumped",
        60,
        25,
    ),
    ("error", r"(?i)\berror:|##\[error\]", 90, 50),
    ("warning", r"(?i)\bwarning:|##\[warning\]", 100, 10),
];

static DEFAULTS: LazyLock<CategorySet> = LazyLock::new(|| {
    CategorySet::compile(&default_categories()).expect("built-in category patterns are valid")
});

fn default_max_matches() -> usize {
    DEFAULT_CATEGORY_CAP
}

/// A named classification rule, as loaded from configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCategory {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
}

impl MatchCategory {
    pub fn new(name: &str, pattern: &str, priority: i32, max_matches: usize) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            priority,
            max_matches,
        }
    }
}

/// The built-in category definitions
pub fn default_categories() -> Vec<MatchCategory> {
    DEFAULT_CATEGORIES
        .iter()
        .map(|(name, pattern, priority, cap)| MatchCategory::new(name, pattern, *priority, *cap))
        .collect()
}

/// Compiled form of a [`MatchCategory`]
#[derive(Clone)]
pub struct CompiledCategory {
    name: String,
    regex: Regex,
    priority: i32,
    max_matches: usize,
}

impl CompiledCategory {
    pub fn new(def: &MatchCategory) -> Result<Self, regex::Error> {
        Ok(Self {
            name: def.name.clone(),
            regex: Regex::new(&def.pattern)?,
            priority: def.priority,
            max_matches: def.max_matches,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_matches(&self) -> usize {
        self.max_matches
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Byte range of the first match (for excerpts)
    pub fn find(&self, text: &str) -> Option<Range<usize>> {
        self.regex.find(text).map(|m| m.range())
    }
}

impl std::fmt::Debug for CompiledCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCategory")
            .field("name", &self.name)
            .field("pattern", &self.regex.as_str())
            .field("priority", &self.priority)
            .field("max_matches", &self.max_matches)
            .finish()
    }
}

/// Ordered category list; the first matching category claims a line
#[derive(Clone, Debug)]
pub struct CategorySet {
    categories: Vec<CompiledCategory>,
}

impl CategorySet {
    /// Compile definitions, ordering them by priority (stable for ties)
    pub fn compile(defs: &[MatchCategory]) -> Result<Self, AnalysisError> {
        let mut categories = defs
            .iter()
            .map(CompiledCategory::new)
            .collect::<Result<Vec<_>, _>>()?;
        categories.sort_by_key(|c| c.priority);
        Ok(Self { categories })
    }

    /// The built-in set
    pub fn defaults() -> Self {
        DEFAULTS.clone()
    }

    /// A set holding one category
    pub fn single(name: &str, pattern: &str, max_matches: usize) -> Result<Self, AnalysisError> {
        Self::compile(&[MatchCategory::new(name, pattern, 0, max_matches)])
    }

    /// Restrict to the named categories, keeping priority order
    pub fn select(&self, names: &[String]) -> Result<Self, AnalysisError> {
        if let Some(unknown) = names.iter().find(|n| self.get_by_name(n).is_none()) {
            return Err(AnalysisError::UnknownCategory(unknown.clone()));
        }
        Ok(Self {
            categories: self
                .categories
                .iter()
                .filter(|c| names.iter().any(|n| n == c.name()))
                .cloned()
                .collect(),
        })
    }

    /// Index of the first category matching `text`
    pub fn classify(&self, text: &str) -> Option<usize> {
        self.categories.iter().position(|c| c.is_match(text))
    }

    pub fn get(&self, index: usize) -> Option<&CompiledCategory> {
        self.categories.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&CompiledCategory> {
        self.categories.iter().find(|c| c.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}
