//! Prompt classification.
//!
//! Turns a [`PaneSnapshot`] into a [`PromptClassification`] by evaluating an
//! explicit, ranked rule list.
//!
//! # Tiers
//!
//! ```text
//! Trust > Selection(n) > YesNo > TypingInProgress > Idle > (Unknown)
//! ```
//!
//! The first tier with any matching rule decides the category. Inside a tier
//! the rule with the highest specificity (literal characters matched) wins;
//! equal specificity falls back to registration order. Trust is checked first
//! because a trust dialog is also a numbered selection and must never be
//! answered as a generic one.
//!
//! Matching runs on normalized text: ANSI escapes removed, box-drawing glyphs
//! replaced with spaces, whitespace runs collapsed, blank lines dropped.
//! Literal rules share one case-insensitive Aho-Corasick automaton; regex and
//! structural rules (option lists, the input box) run individually.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::collector::{PaneSnapshot, strip_ansi};
use crate::error::ConfigError;

// =============================================================================
// Categories
// =============================================================================

/// Classified type of an interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptCategory {
    Trust,
    /// Option list with `n` options.
    Selection(u8),
    YesNo,
    TypingInProgress,
    Idle,
    Unknown,
}

impl PromptCategory {
    /// Rule tier this category belongs to, `None` for `Unknown`.
    #[must_use]
    pub const fn tier(self) -> Option<PromptTier> {
        match self {
            Self::Trust => Some(PromptTier::Trust),
            Self::Selection(_) => Some(PromptTier::Selection),
            Self::YesNo => Some(PromptTier::YesNo),
            Self::TypingInProgress => Some(PromptTier::TypingInProgress),
            Self::Idle => Some(PromptTier::Idle),
            Self::Unknown => None,
        }
    }

    /// Categories the monitor may answer automatically.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::Trust | Self::Selection(_) | Self::YesNo)
    }

    /// Stable string key, e.g. `selection_3`.
    #[must_use]
    pub fn key(self) -> String {
        match self {
            Self::Selection(n) => format!("selection_{n}"),
            other => other.tier().map_or("unknown", PromptTier::as_str).to_string(),
        }
    }
}

impl fmt::Display for PromptCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Evaluation tier, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTier {
    Trust,
    Selection,
    YesNo,
    TypingInProgress,
    Idle,
}

impl PromptTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trust => "trust",
            Self::Selection => "selection",
            Self::YesNo => "yes_no",
            Self::TypingInProgress => "typing_in_progress",
            Self::Idle => "idle",
        }
    }
}

/// Result of classifying a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptClassification {
    pub category: PromptCategory,
    /// Full normalized line(s) containing the match; empty for `Unknown`.
    pub matched_text: String,
    /// Classification confidence in `[0, 1]`.
    pub confidence: f64,
    /// Identifier of the winning rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl PromptClassification {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            category: PromptCategory::Unknown,
            matched_text: String::new(),
            confidence: 0.0,
            rule_id: None,
        }
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// One normalized line of pane text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLine {
    pub text: String,
    /// The raw line carried box-drawing decoration.
    pub boxed: bool,
}

const fn is_box_drawing(c: char) -> bool {
    matches!(c, '\u{2500}'..='\u{257F}' | '\u{2580}'..='\u{259F}')
}

/// Normalize raw pane text for matching.
#[must_use]
pub fn normalize(raw: &str) -> Vec<NormalizedLine> {
    let cleaned = strip_ansi(raw);
    cleaned
        .lines()
        .filter_map(|line| {
            let boxed = line.chars().any(is_box_drawing);
            let text = line
                .chars()
                .map(|c| if is_box_drawing(c) { ' ' } else { c })
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            (!text.is_empty()).then_some(NormalizedLine { text, boxed })
        })
        .collect()
}

/// Normalized lines plus the joined haystack and per-line byte offsets.
struct Haystack {
    lines: Vec<NormalizedLine>,
    text: String,
    starts: Vec<usize>,
}

impl Haystack {
    fn new(raw: &str) -> Self {
        let lines = normalize(raw);
        let mut text = String::new();
        let mut starts = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            starts.push(text.len());
            text.push_str(&line.text);
        }
        Self {
            lines,
            text,
            starts,
        }
    }

    fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
    }

    /// Whole line(s) covering the byte span.
    fn lines_covering(&self, start: usize, end: usize) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let first = self.line_of(start);
        let last = self.line_of(end.saturating_sub(1).max(start));
        self.lines[first..=last]
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Layout of an option list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionStyle {
    /// `[1] Yes [2] No`, anywhere on a line
    Bracketed,
    /// `❯ 1. Yes` / `2) No`, one option per line
    Numbered,
    /// `a) Yes` / `b. No`, one option per line
    Lettered,
}

enum Matcher {
    /// Index into the shared Aho-Corasick automaton
    Literal { literal: String, slot: usize },
    Pattern(Regex),
    Options(OptionStyle),
    InputBox { typed: bool },
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal { literal, .. } => write!(f, "Literal({literal:?})"),
            Self::Pattern(re) => write!(f, "Pattern({:?})", re.as_str()),
            Self::Options(style) => write!(f, "Options({style:?})"),
            Self::InputBox { typed } => write!(f, "InputBox(typed={typed})"),
        }
    }
}

/// A compiled detection rule.
#[derive(Debug)]
pub struct PromptRule {
    pub id: String,
    pub tier: PromptTier,
    /// Fixed category for non-selection tiers; selection rules derive `n`.
    category: PromptCategory,
    matcher: Matcher,
    /// Literal characters matched; `None` means derived per match.
    specificity: Option<usize>,
    confidence: f64,
}

/// User-definable rule, loaded from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub tier: PromptTier,
    pub pattern: String,
    /// Treat `pattern` as a regular expression instead of a literal.
    #[serde(default)]
    pub regex: bool,
    /// Option count for selection rules.
    #[serde(default)]
    pub options: Option<u8>,
    /// Override the computed specificity.
    #[serde(default)]
    pub specificity: Option<usize>,
}

/// Count the characters in a regex that match themselves.
///
/// Escaped classes (`\d`, `\s`, ...) and anchors add nothing, escaped
/// punctuation counts as one literal, bracket expressions and repetition
/// counts are skipped entirely.
#[must_use]
pub fn literal_len(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;
    let mut in_repeat = false;
    while let Some(c) = chars.next() {
        if in_class {
            match c {
                '\\' => {
                    chars.next();
                }
                ']' => in_class = false,
                _ => {}
            }
            continue;
        }
        if in_repeat {
            if c == '}' {
                in_repeat = false;
            }
            continue;
        }
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    if !next.is_ascii_alphanumeric() {
                        count += 1;
                    }
                }
            }
            '[' => in_class = true,
            '{' => in_repeat = true,
            '(' => {
                if chars.peek() == Some(&'?') {
                    chars.next();
                    // skip group flags such as `?:` or `?i)`
                    while let Some(&f) = chars.peek() {
                        chars.next();
                        if f == ':' || f == ')' {
                            break;
                        }
                    }
                }
            }
            '.' | '^' | '$' | '*' | '+' | '?' | ')' | '|' => {}
            _ => count += 1,
        }
    }
    count
}

struct BuiltinLiteral {
    id: &'static str,
    tier: PromptTier,
    literal: &'static str,
    confidence: f64,
}

const BUILTIN_LITERALS: &[BuiltinLiteral] = &[
    BuiltinLiteral {
        id: "trust.files_in_folder",
        tier: PromptTier::Trust,
        literal: "do you trust the files in this folder",
        confidence: 0.98,
    },
    BuiltinLiteral {
        id: "trust.authors",
        tier: PromptTier::Trust,
        literal: "do you trust the authors of",
        confidence: 0.95,
    },
    BuiltinLiteral {
        id: "trust.this_folder",
        tier: PromptTier::Trust,
        literal: "trust this folder",
        confidence: 0.9,
    },
    BuiltinLiteral {
        id: "yes_no.paren_long",
        tier: PromptTier::YesNo,
        literal: "(yes/no)",
        confidence: 0.95,
    },
    BuiltinLiteral {
        id: "yes_no.bracket_long",
        tier: PromptTier::YesNo,
        literal: "[yes/no]",
        confidence: 0.95,
    },
    BuiltinLiteral {
        id: "yes_no.paren_short",
        tier: PromptTier::YesNo,
        literal: "(y/n)",
        confidence: 0.95,
    },
    BuiltinLiteral {
        id: "yes_no.bracket_short",
        tier: PromptTier::YesNo,
        literal: "[y/n]",
        confidence: 0.95,
    },
    BuiltinLiteral {
        id: "yes_no.paren_true_false",
        tier: PromptTier::YesNo,
        literal: "(true/false)",
        confidence: 0.9,
    },
    BuiltinLiteral {
        id: "yes_no.bracket_true_false",
        tier: PromptTier::YesNo,
        literal: "[true/false]",
        confidence: 0.9,
    },
    BuiltinLiteral {
        id: "selection.binary",
        tier: PromptTier::Selection,
        literal: "[1/2]",
        confidence: 0.8,
    },
    BuiltinLiteral {
        id: "idle.welcome",
        tier: PromptTier::Idle,
        literal: "welcome to claude code",
        confidence: 0.7,
    },
    BuiltinLiteral {
        id: "idle.shortcuts_hint",
        tier: PromptTier::Idle,
        literal: "? for shortcuts",
        confidence: 0.7,
    },
];

static BRACKETED_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,2})\]\s*\S").expect("bracketed option regex"));
static NUMBERED_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:[❯>›→]\s*)?(\d{1,2})[.)]\s+\S").expect("numbered option regex")
});
static LETTERED_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:[❯>›→]\s*)?([a-z])[.)]\s+\S").expect("lettered option regex")
});
static CURSOR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[❯>›→]").expect("cursor marker regex"));
static INPUT_BOX_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[>❯]\s?(.*)$").expect("input box regex"));

/// Lines above an unmarked numbered list searched for its question.
const QUESTION_LOOKBACK: usize = 5;

// =============================================================================
// Detector
// =============================================================================

/// Detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Snapshots with fewer non-whitespace characters classify as `Unknown`
    /// without evaluating rules.
    pub min_content_chars: usize,
    /// Extra rules appended after the built-ins.
    pub rules: Vec<RuleSpec>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_content_chars: 10,
            rules: Vec::new(),
        }
    }
}

struct Hit {
    rule_index: usize,
    category: PromptCategory,
    specificity: usize,
    start: usize,
    end: usize,
}

/// Ranked, tiered prompt classifier.
pub struct PromptDetector {
    rules: Vec<PromptRule>,
    literals: Option<AhoCorasick>,
    /// Automaton slot → rule index
    literal_rules: Vec<usize>,
    min_content_chars: usize,
}

impl fmt::Debug for PromptDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptDetector")
            .field("rules", &self.rules.len())
            .field("min_content_chars", &self.min_content_chars)
            .finish()
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PromptDetector {
    /// Detector with built-in rules only.
    #[must_use]
    pub fn builtin() -> Self {
        Self::assemble(builtin_rules(), DetectorConfig::default().min_content_chars)
    }

    /// Detector with built-in rules plus the configured extras.
    pub fn from_config(config: &DetectorConfig) -> Result<Self, ConfigError> {
        let mut rules = builtin_rules();
        for spec in &config.rules {
            if rules.iter().any(|r| r.id == spec.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate prompt rule id '{}'",
                    spec.id
                )));
            }
            rules.push(compile_spec(spec)?);
        }
        Ok(Self::assemble(rules, config.min_content_chars))
    }

    fn assemble(mut rules: Vec<PromptRule>, min_content_chars: usize) -> Self {
        let mut patterns = Vec::new();
        let mut literal_rules = Vec::new();
        for (index, rule) in rules.iter_mut().enumerate() {
            if let Matcher::Literal { literal, slot } = &mut rule.matcher {
                *slot = patterns.len();
                patterns.push(literal.to_lowercase());
                literal_rules.push(index);
            }
        }
        let literals = if patterns.is_empty() {
            None
        } else {
            AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::Standard)
                .build(&patterns)
                .ok()
        };
        Self {
            rules,
            literals,
            literal_rules,
            min_content_chars,
        }
    }

    /// Rules in registration order.
    #[must_use]
    pub fn rules(&self) -> &[PromptRule] {
        &self.rules
    }

    /// Classify a snapshot. Never fails.
    #[must_use]
    pub fn classify(&self, snapshot: &PaneSnapshot) -> PromptClassification {
        if snapshot.content_chars() < self.min_content_chars {
            trace!(target = %snapshot.target, "Snapshot below minimum content length");
            return PromptClassification::unknown();
        }
        self.classify_text(&snapshot.text())
    }

    /// Classify raw pane text. Never fails.
    #[must_use]
    pub fn classify_text(&self, raw: &str) -> PromptClassification {
        let hay = Haystack::new(raw);
        if hay.text.is_empty() {
            return PromptClassification::unknown();
        }

        let mut hits = self.literal_hits(&hay);
        for (index, rule) in self.rules.iter().enumerate() {
            let hit = match &rule.matcher {
                Matcher::Literal { .. } => None,
                Matcher::Pattern(re) => re.find(&hay.text).map(|m| Hit {
                    rule_index: index,
                    category: rule.category,
                    specificity: rule.specificity.unwrap_or_else(|| literal_len(re.as_str())),
                    start: m.start(),
                    end: m.end(),
                }),
                Matcher::Options(style) => detect_options(&hay, *style).map(|opts| Hit {
                    rule_index: index,
                    category: PromptCategory::Selection(opts.count),
                    specificity: rule.specificity.unwrap_or(opts.marker_chars),
                    start: opts.start,
                    end: opts.end,
                }),
                Matcher::InputBox { typed } => {
                    detect_input_box(&hay, *typed).map(|(start, end, chars)| Hit {
                        rule_index: index,
                        category: rule.category,
                        specificity: rule.specificity.unwrap_or(chars),
                        start,
                        end,
                    })
                }
            };
            hits.extend(hit);
        }

        let best = hits.into_iter().min_by_key(|hit| {
            (
                self.rules[hit.rule_index].tier,
                Reverse(hit.specificity),
                hit.rule_index,
            )
        });

        match best {
            Some(hit) => {
                let rule = &self.rules[hit.rule_index];
                let matched_text = hay.lines_covering(hit.start, hit.end);
                debug!(
                    rule_id = %rule.id,
                    category = %hit.category,
                    specificity = hit.specificity,
                    matched_len = matched_text.len(),
                    "Prompt classified"
                );
                PromptClassification {
                    category: hit.category,
                    matched_text,
                    confidence: rule.confidence,
                    rule_id: Some(rule.id.clone()),
                }
            }
            None => PromptClassification::unknown(),
        }
    }

    fn literal_hits(&self, hay: &Haystack) -> Vec<Hit> {
        let Some(automaton) = self.literals.as_ref() else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut hits = Vec::new();
        for m in automaton.find_overlapping_iter(&hay.text) {
            let Some(&rule_index) = self.literal_rules.get(m.pattern().as_usize()) else {
                continue;
            };
            if !seen.insert(rule_index) {
                continue;
            }
            let rule = &self.rules[rule_index];
            hits.push(Hit {
                rule_index,
                category: rule.category,
                specificity: rule.specificity.unwrap_or(m.end() - m.start()),
                start: m.start(),
                end: m.end(),
            });
        }
        hits
    }
}

fn literal_rule(id: &str, tier: PromptTier, literal: &str, confidence: f64) -> PromptRule {
    PromptRule {
        id: id.to_string(),
        tier,
        category: category_for_tier(tier, None),
        matcher: Matcher::Literal {
            literal: literal.to_string(),
            slot: 0,
        },
        specificity: Some(literal.chars().count()),
        confidence,
    }
}

fn category_for_tier(tier: PromptTier, options: Option<u8>) -> PromptCategory {
    match tier {
        PromptTier::Trust => PromptCategory::Trust,
        PromptTier::Selection => PromptCategory::Selection(options.unwrap_or(2)),
        PromptTier::YesNo => PromptCategory::YesNo,
        PromptTier::TypingInProgress => PromptCategory::TypingInProgress,
        PromptTier::Idle => PromptCategory::Idle,
    }
}

fn builtin_rules() -> Vec<PromptRule> {
    let mut rules: Vec<PromptRule> = BUILTIN_LITERALS
        .iter()
        .map(|b| literal_rule(b.id, b.tier, b.literal, b.confidence))
        .collect();

    rules.push(PromptRule {
        id: "yes_no.spaced".to_string(),
        tier: PromptTier::YesNo,
        category: PromptCategory::YesNo,
        matcher: Matcher::Pattern(
            Regex::new(r"(?i)[(\[]\s*y(?:es)?\s*/\s*no?\s*[)\]]").expect("yes/no regex"),
        ),
        specificity: None,
        confidence: 0.85,
    });
    // bare confirmation question; any explicit marker in the tier outranks it
    rules.push(PromptRule {
        id: "yes_no.confirm_question".to_string(),
        tier: PromptTier::YesNo,
        category: PromptCategory::YesNo,
        matcher: Matcher::Pattern(
            Regex::new(r"(?im)\b(?:continue|proceed)\?$").expect("confirmation regex"),
        ),
        specificity: Some(1),
        confidence: 0.6,
    });

    for (id, style, confidence) in [
        ("selection.bracketed", OptionStyle::Bracketed, 0.9),
        ("selection.numbered", OptionStyle::Numbered, 0.85),
        ("selection.lettered", OptionStyle::Lettered, 0.75),
    ] {
        rules.push(PromptRule {
            id: id.to_string(),
            tier: PromptTier::Selection,
            category: PromptCategory::Selection(2),
            matcher: Matcher::Options(style),
            specificity: None,
            confidence,
        });
    }

    rules.push(PromptRule {
        id: "typing.input_box".to_string(),
        tier: PromptTier::TypingInProgress,
        category: PromptCategory::TypingInProgress,
        matcher: Matcher::InputBox { typed: true },
        specificity: None,
        confidence: 0.9,
    });
    rules.push(PromptRule {
        id: "idle.empty_input_box".to_string(),
        tier: PromptTier::Idle,
        category: PromptCategory::Idle,
        matcher: Matcher::InputBox { typed: false },
        specificity: None,
        confidence: 0.8,
    });

    rules
}

fn compile_spec(spec: &RuleSpec) -> Result<PromptRule, ConfigError> {
    if spec.id.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "prompt rule id cannot be empty".to_string(),
        ));
    }
    if spec.pattern.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "prompt rule '{}' has an empty pattern",
            spec.id
        )));
    }
    if spec.tier == PromptTier::Selection && spec.options.is_none_or(|n| n < 2) {
        return Err(ConfigError::ValidationError(format!(
            "selection rule '{}' needs options >= 2",
            spec.id
        )));
    }

    let category = category_for_tier(spec.tier, spec.options);
    let (matcher, specificity) = if spec.regex {
        let re = Regex::new(&spec.pattern).map_err(|e| {
            ConfigError::ValidationError(format!("prompt rule '{}' has invalid regex: {e}", spec.id))
        })?;
        let specificity = spec.specificity.unwrap_or_else(|| literal_len(&spec.pattern));
        (Matcher::Pattern(re), specificity)
    } else {
        let specificity = spec
            .specificity
            .unwrap_or_else(|| spec.pattern.chars().count());
        (
            Matcher::Literal {
                literal: spec.pattern.clone(),
                slot: 0,
            },
            specificity,
        )
    };

    Ok(PromptRule {
        id: spec.id.clone(),
        tier: spec.tier,
        category,
        matcher,
        specificity: Some(specificity),
        confidence: 0.8,
    })
}

// -----------------------------------------------------------------------------
// Structural matchers
// -----------------------------------------------------------------------------

struct OptionList {
    count: u8,
    marker_chars: usize,
    start: usize,
    end: usize,
}

struct OptionMark {
    ordinal: u8,
    start: usize,
    end: usize,
    marker_len: usize,
    line: usize,
}

/// Find the last contiguous `1..=n` option run (n >= 2) in the haystack.
fn detect_options(hay: &Haystack, style: OptionStyle) -> Option<OptionList> {
    let re: &Regex = match style {
        OptionStyle::Bracketed => &BRACKETED_OPTION,
        OptionStyle::Numbered => &NUMBERED_OPTION,
        OptionStyle::Lettered => &LETTERED_OPTION,
    };

    let marks: Vec<OptionMark> = re
        .captures_iter(&hay.text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let label = caps.get(1)?;
            let ordinal = match style {
                OptionStyle::Lettered => {
                    let c = label.as_str().chars().next()?;
                    (c as u32).checked_sub('a' as u32).map(|d| d as u8 + 1)?
                }
                _ => label.as_str().parse::<u8>().ok()?,
            };
            Some(OptionMark {
                ordinal,
                start: whole.start(),
                end: whole.end(),
                marker_len: label.as_str().len() + 1,
                line: hay.line_of(whole.start()),
            })
        })
        .collect();

    let mut best: Option<&[OptionMark]> = None;
    let mut run_start = None;
    for (i, mark) in marks.iter().enumerate() {
        match run_start {
            Some(s) if i > s && mark.ordinal as usize == marks[i - 1].ordinal as usize + 1 => {}
            _ if mark.ordinal == 1 => run_start = Some(i),
            _ => {
                run_start = None;
                continue;
            }
        }
        if let Some(s) = run_start {
            if i > s {
                best = Some(&marks[s..=i]);
            }
        }
    }

    let run = best?;
    let first = run.first()?;
    let last = run.last()?;

    // Unmarked line lists are ordinary output unless a question sits above.
    if style != OptionStyle::Bracketed {
        let marked = run
            .iter()
            .any(|m| CURSOR_MARKER.is_match(&hay.lines[m.line].text));
        let asked = (first.line.saturating_sub(QUESTION_LOOKBACK)..=first.line)
            .any(|l| hay.lines[l].text.trim_end().ends_with('?'));
        if !marked && !asked {
            return None;
        }
    }

    Some(OptionList {
        count: run.len().min(u8::MAX as usize) as u8,
        marker_chars: run.iter().map(|m| m.marker_len).sum(),
        start: first.start,
        end: last.end,
    })
}

/// Locate the assistant's input box line, returning its span and the number
/// of typed characters when it matches the wanted state.
fn detect_input_box(hay: &Haystack, typed: bool) -> Option<(usize, usize, usize)> {
    let (index, line) = hay
        .lines
        .iter()
        .enumerate()
        .rev()
        .find(|(_, l)| l.boxed && INPUT_BOX_LINE.is_match(&l.text))?;
    let caps = INPUT_BOX_LINE.captures(&line.text)?;
    let content = caps.get(1).map_or("", |m| m.as_str().trim());
    let has_text = !content.is_empty();
    if has_text != typed {
        return None;
    }
    let start = hay.starts[index];
    Some((start, start + line.text.len(), content.chars().count().max(1)))
}
