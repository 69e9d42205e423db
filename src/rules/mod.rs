//! Declarative rules engine
//!
//! Rules pair a condition list with an action list and are evaluated, in
//! priority order, against a context built from a triggering event plus
//! ambient facts (hour of day, day of week, queue size, bandwidth usage).
//! A matching rule executes all of its actions; rules never short-circuit
//! one another.
//!
//! Actions do not mutate queue items directly: each action posts a
//! [`RuleCommand`] on a channel the downloader drains, which keeps the
//! event dispatcher from re-entering the scheduler.

use crate::error::{Error, Result};
use crate::events::{Event, EventSubscriber, EventType, Subscription};
use crate::types::{ItemId, Priority};
use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use utoipa::ToSchema;

/// Context fact a condition reads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    /// Full URL of the download
    Url,
    /// Host part of the URL
    Domain,
    /// Media title
    Title,
    /// Uploader/channel name
    Uploader,
    /// Media duration in seconds
    DurationSeconds,
    /// File size in bytes
    FileSize,
    /// View count
    ViewCount,
    /// Upload date string
    UploadDate,
    /// Current hour of day (0-23, local time)
    HourOfDay,
    /// Current day of week (0 = Monday, 6 = Sunday)
    DayOfWeek,
    /// Number of items currently tracked by the queue
    QueueSize,
    /// Allocated bandwidth in bytes per second
    BandwidthUsage,
}

/// Comparison operator for conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equal (case-insensitive for text unless `case_sensitive`)
    Equals,
    /// Not equal
    NotEquals,
    /// Text contains
    Contains,
    /// Text does not contain
    NotContains,
    /// Regex match
    Matches,
    /// Regex non-match
    NotMatches,
    /// Numeric greater-than
    GreaterThan,
    /// Numeric less-than
    LessThan,
    /// Numeric greater-or-equal
    GreaterEqual,
    /// Numeric less-or-equal
    LessEqual,
    /// Numeric within `[min, max]` (inclusive)
    InRange,
}

/// A single condition in a rule
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RuleCondition {
    /// Context fact to read
    pub field: ConditionField,

    /// Comparison operator
    pub operator: Operator,

    /// Right-hand value; type must suit the operator (text, number, or
    /// two-element array for in_range)
    #[schema(value_type = Object)]
    pub value: Value,

    /// Case-sensitive text comparison (default: false)
    #[serde(default)]
    pub case_sensitive: bool,
}

impl RuleCondition {
    /// Evaluate against a context; missing facts and type mismatches are
    /// simply false, never errors.
    pub fn evaluate(&self, context: &RuleContext) -> bool {
        let Some(actual) = context.get(self.field) else {
            return false;
        };

        match self.operator {
            Operator::Equals => self.text_eq(&actual),
            Operator::NotEquals => !self.text_eq(&actual),
            Operator::Contains => self.text_contains(&actual),
            Operator::NotContains => !self.text_contains(&actual),
            Operator::Matches => self.regex_match(&actual),
            Operator::NotMatches => !self.regex_match(&actual),
            Operator::GreaterThan => self.numeric(&actual, |a, b| a > b),
            Operator::LessThan => self.numeric(&actual, |a, b| a < b),
            Operator::GreaterEqual => self.numeric(&actual, |a, b| a >= b),
            Operator::LessEqual => self.numeric(&actual, |a, b| a <= b),
            Operator::InRange => self.in_range(&actual),
        }
    }

    fn normalize(&self, value: &Value) -> String {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if self.case_sensitive {
            text
        } else {
            text.to_lowercase()
        }
    }

    fn text_eq(&self, actual: &Value) -> bool {
        self.normalize(actual) == self.normalize(&self.value)
    }

    fn text_contains(&self, actual: &Value) -> bool {
        self.normalize(actual).contains(&self.normalize(&self.value))
    }

    fn regex_match(&self, actual: &Value) -> bool {
        let Some(pattern) = self.value.as_str() else {
            return false;
        };
        let Ok(re) = RegexBuilder::new(pattern)
            .case_insensitive(!self.case_sensitive)
            .build()
        else {
            return false;
        };
        let text = match actual {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        re.is_match(&text)
    }

    fn numeric(&self, actual: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
        match (as_number(actual), as_number(&self.value)) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        }
    }

    fn in_range(&self, actual: &Value) -> bool {
        let Some(range) = self.value.as_array() else {
            return false;
        };
        if range.len() != 2 {
            return false;
        }
        match (as_number(actual), as_number(&range[0]), as_number(&range[1])) {
            (Some(a), Some(lo), Some(hi)) => lo <= a && a <= hi,
            _ => false,
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Notification severity for the notify action
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NotifySeverity {
    /// Informational
    #[default]
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// Action executed when a rule matches
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    /// Change the item's priority
    SetPriority {
        /// New priority
        priority: Priority,
    },
    /// Apply a named settings profile
    SetProfile {
        /// Profile name
        profile: String,
    },
    /// Override the quality/format selector
    SetQuality {
        /// Selector string (e.g. "best[height<=1080]")
        quality: String,
    },
    /// Override the output directory
    SetOutputPath {
        /// New output path
        path: PathBuf,
    },
    /// Reserve a specific bandwidth budget
    RateLimit {
        /// Bytes per second
        bytes_per_second: u64,
    },
    /// Hold the item for N minutes before admission
    Delay {
        /// Delay in minutes
        minutes: u32,
    },
    /// Block the download
    Block {
        /// Reason recorded on the item
        #[serde(default = "default_block_reason")]
        reason: String,
    },
    /// Emit a notification
    Notify {
        /// Message text
        message: String,
        /// Severity level
        #[serde(default)]
        severity: NotifySeverity,
    },
    /// Organize output by a path pattern (e.g. "{uploader}/{title}")
    AutoOrganize {
        /// Organization pattern
        pattern: String,
    },
    /// Extract audio after download
    ExtractAudio {
        /// Audio format
        #[serde(default = "default_audio_format")]
        format: String,
    },
}

fn default_block_reason() -> String {
    "Blocked by rule".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

/// Command posted to the downloader when a rule action fires
#[derive(Clone, Debug, PartialEq)]
pub enum RuleCommand {
    /// Change item priority
    SetPriority {
        /// Target item
        item_id: ItemId,
        /// New priority
        priority: Priority,
    },
    /// Apply a settings profile to the item
    SetProfile {
        /// Target item
        item_id: ItemId,
        /// Profile name
        profile: String,
    },
    /// Override the quality selector
    SetQuality {
        /// Target item
        item_id: ItemId,
        /// Selector string
        quality: String,
    },
    /// Override the output directory
    SetOutputPath {
        /// Target item
        item_id: ItemId,
        /// New path
        path: PathBuf,
    },
    /// Reserve a bandwidth budget for the item
    RateLimit {
        /// Target item
        item_id: ItemId,
        /// Bytes per second
        bytes_per_second: u64,
    },
    /// Park the item on the retry clock without consuming a retry
    Delay {
        /// Target item
        item_id: ItemId,
        /// Minutes to wait
        minutes: u32,
    },
    /// Cancel the item, recording the rule's reason
    Block {
        /// Target item
        item_id: ItemId,
        /// Reason text
        reason: String,
    },
    /// Organize the item's output by pattern
    AutoOrganize {
        /// Target item
        item_id: ItemId,
        /// Pattern
        pattern: String,
    },
    /// Enable audio extraction on the item
    ExtractAudio {
        /// Target item
        item_id: ItemId,
        /// Audio format
        format: String,
    },
    /// Notification (no target item)
    Notify {
        /// Message text
        message: String,
        /// Severity
        severity: NotifySeverity,
    },
}

/// AND/OR combinator for a rule's condition list
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum Combinator {
    /// All conditions must hold
    #[default]
    #[serde(rename = "AND")]
    And,
    /// Any condition suffices
    #[serde(rename = "OR")]
    Or,
}

/// A complete rule
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Rule {
    /// Unique rule id
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: String,

    /// Disabled rules never trigger
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Evaluation priority; higher evaluates first
    #[serde(default)]
    pub priority: i32,

    /// Condition combinator
    #[serde(default)]
    pub combinator: Combinator,

    /// Conditions
    pub conditions: Vec<RuleCondition>,

    /// Actions executed in order on match
    pub actions: Vec<RuleAction>,

    /// When the rule was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Last time this rule matched
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,

    /// How many times this rule has matched
    #[serde(default)]
    pub trigger_count: u64,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Whether the rule matches the context
    ///
    /// Disabled rules and rules without conditions never match.
    pub fn matches(&self, context: &RuleContext) -> bool {
        if !self.enabled || self.conditions.is_empty() {
            return false;
        }
        match self.combinator {
            Combinator::And => self.conditions.iter().all(|c| c.evaluate(context)),
            Combinator::Or => self.conditions.iter().any(|c| c.evaluate(context)),
        }
    }
}

/// Evaluation context: event payload facts plus ambient facts
#[derive(Clone, Debug)]
pub struct RuleContext {
    values: serde_json::Map<String, Value>,
    hour_of_day: u32,
    day_of_week: u32,
}

impl RuleContext {
    /// Build a context from an event's data and metadata
    ///
    /// Metadata entries (queue size, bandwidth usage stamped by the
    /// scheduler) are merged under the data payload; ambient time facts are
    /// taken from the local clock.
    pub fn from_event(event: &Event) -> Self {
        let now = chrono::Local::now();
        let mut values = event.data.clone();
        for (key, value) in &event.metadata {
            values.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Self {
            values,
            hour_of_day: now.hour(),
            day_of_week: now.weekday().num_days_from_monday(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(values: serde_json::Map<String, Value>, hour: u32, day: u32) -> Self {
        Self {
            values,
            hour_of_day: hour,
            day_of_week: day,
        }
    }

    /// The item this context concerns, if any
    pub fn item_id(&self) -> Option<ItemId> {
        self.values
            .get("item_id")
            .and_then(Value::as_str)
            .map(ItemId::from)
    }

    fn get(&self, field: ConditionField) -> Option<Value> {
        match field {
            ConditionField::Url => self.values.get("url").cloned(),
            ConditionField::Domain => self
                .values
                .get("url")
                .and_then(Value::as_str)
                .and_then(extract_domain)
                .map(Value::String),
            ConditionField::Title => self.values.get("title").cloned(),
            ConditionField::Uploader => self.values.get("uploader").cloned(),
            ConditionField::DurationSeconds => self.values.get("duration_seconds").cloned(),
            ConditionField::FileSize => self.values.get("file_size").cloned(),
            ConditionField::ViewCount => self.values.get("view_count").cloned(),
            ConditionField::UploadDate => self.values.get("upload_date").cloned(),
            ConditionField::HourOfDay => Some(Value::from(self.hour_of_day)),
            ConditionField::DayOfWeek => Some(Value::from(self.day_of_week)),
            ConditionField::QueueSize => self.values.get("queue_size").cloned(),
            ConditionField::BandwidthUsage => self.values.get("bandwidth_usage").cloned(),
        }
    }
}

fn extract_domain(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// Rules engine statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct RulesStats {
    /// Total rule matches
    pub rules_triggered: u64,
    /// Total actions executed
    pub actions_executed: u64,
    /// Registered rules
    pub total_rules: usize,
    /// Enabled rules
    pub enabled_rules: usize,
}

/// The rules engine
///
/// Subscribed to a small set of event types; on each event it evaluates all
/// enabled rules in priority order and posts [`RuleCommand`]s for matching
/// rules' actions.
pub struct RulesEngine {
    rules: tokio::sync::RwLock<Vec<Rule>>,
    command_tx: mpsc::UnboundedSender<RuleCommand>,
    rules_triggered: AtomicU64,
    actions_executed: AtomicU64,
}

impl RulesEngine {
    /// Create an engine that posts commands on the given channel
    pub fn new(command_tx: mpsc::UnboundedSender<RuleCommand>) -> Self {
        Self {
            rules: tokio::sync::RwLock::new(Vec::new()),
            command_tx,
            rules_triggered: AtomicU64::new(0),
            actions_executed: AtomicU64::new(0),
        }
    }

    /// Event types the engine wants from the bus
    pub fn subscription() -> Subscription {
        Subscription::Types(vec![
            EventType::DownloadQueued,
            EventType::DownloadStarted,
            EventType::DownloadProgress,
            EventType::DownloadCompleted,
            EventType::QueueStatusChanged,
        ])
    }

    /// Evaluate all rules against an event, returning matched rule ids
    pub async fn evaluate(&self, event: &Event) -> Vec<String> {
        let context = RuleContext::from_event(event);
        let mut matched = Vec::new();

        let mut rules = self.rules.write().await;
        // Highest priority first; stable within equal priorities
        let mut order: Vec<usize> = (0..rules.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(rules[i].priority));

        for index in order {
            let rule = &mut rules[index];
            if !rule.matches(&context) {
                continue;
            }

            tracing::info!(
                rule_id = %rule.id,
                rule_name = %rule.name,
                event_type = %event.event_type,
                "Rule triggered"
            );

            for action in rule.actions.clone() {
                self.execute_action(&action, &context);
                self.actions_executed.fetch_add(1, Ordering::Relaxed);
            }

            rule.last_triggered = Some(Utc::now());
            rule.trigger_count += 1;
            self.rules_triggered.fetch_add(1, Ordering::Relaxed);
            matched.push(rule.id.clone());
        }

        matched
    }

    fn execute_action(&self, action: &RuleAction, context: &RuleContext) {
        let command = match action {
            RuleAction::Notify { message, severity } => Some(RuleCommand::Notify {
                message: message.clone(),
                severity: *severity,
            }),
            item_action => {
                let Some(item_id) = context.item_id() else {
                    tracing::debug!("Skipping item-targeted action without item_id in context");
                    return;
                };
                match item_action {
                    RuleAction::SetPriority { priority } => Some(RuleCommand::SetPriority {
                        item_id,
                        priority: *priority,
                    }),
                    RuleAction::SetProfile { profile } => Some(RuleCommand::SetProfile {
                        item_id,
                        profile: profile.clone(),
                    }),
                    RuleAction::SetQuality { quality } => Some(RuleCommand::SetQuality {
                        item_id,
                        quality: quality.clone(),
                    }),
                    RuleAction::SetOutputPath { path } => Some(RuleCommand::SetOutputPath {
                        item_id,
                        path: path.clone(),
                    }),
                    RuleAction::RateLimit { bytes_per_second } => Some(RuleCommand::RateLimit {
                        item_id,
                        bytes_per_second: *bytes_per_second,
                    }),
                    RuleAction::Delay { minutes } => Some(RuleCommand::Delay {
                        item_id,
                        minutes: *minutes,
                    }),
                    RuleAction::Block { reason } => Some(RuleCommand::Block {
                        item_id,
                        reason: reason.clone(),
                    }),
                    RuleAction::AutoOrganize { pattern } => Some(RuleCommand::AutoOrganize {
                        item_id,
                        pattern: pattern.clone(),
                    }),
                    RuleAction::ExtractAudio { format } => Some(RuleCommand::ExtractAudio {
                        item_id,
                        format: format.clone(),
                    }),
                    RuleAction::Notify { .. } => None,
                }
            }
        };

        if let Some(command) = command {
            // Receiver dropped means the downloader is gone; nothing to do
            self.command_tx.send(command).ok();
        }
    }

    /// Add a rule; duplicate ids are rejected
    pub async fn add_rule(&self, rule: Rule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(Error::Rule(format!("rule id '{}' already exists", rule.id)));
        }
        tracing::info!(rule_id = %rule.id, rule_name = %rule.name, "Added rule");
        rules.push(rule);
        Ok(())
    }

    /// Remove a rule by id; returns true if one was removed
    pub async fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() < before
    }

    /// Replace an existing rule (matched by the replacement's id)
    pub async fn update_rule(&self, rule: Rule) -> bool {
        let mut rules = self.rules.write().await;
        if let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
            true
        } else {
            false
        }
    }

    /// Fetch a rule by id
    pub async fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// All rules, in insertion order
    pub async fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    /// Enable or disable a rule; returns false when the id is unknown
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Engine statistics
    pub async fn statistics(&self) -> RulesStats {
        let rules = self.rules.read().await;
        RulesStats {
            rules_triggered: self.rules_triggered.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
        }
    }

    /// Load rules from a JSON document
    ///
    /// A missing file is not an error (no rules to load). Individual rules
    /// that fail validation (unknown field, operator, or action) are logged
    /// and skipped; loading continues.
    pub async fn load_from_file(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Rules file not found, starting empty");
            return Ok(0);
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let documents: Vec<Value> = serde_json::from_str(&raw)?;

        let mut loaded = Vec::new();
        for document in documents {
            match serde_json::from_value::<Rule>(document.clone()) {
                Ok(rule) => loaded.push(rule),
                Err(e) => {
                    let id = document
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("<unknown>");
                    tracing::warn!(rule_id = id, error = %e, "Rejecting invalid rule at load");
                }
            }
        }

        let count = loaded.len();
        *self.rules.write().await = loaded;
        tracing::info!(count, path = %path.display(), "Loaded rules");
        Ok(count)
    }

    /// Save all rules as a JSON document
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let rules = self.rules.read().await;
        let json = serde_json::to_string_pretty(&*rules)?;
        tokio::fs::write(path, json).await?;
        tracing::info!(count = rules.len(), path = %path.display(), "Saved rules");
        Ok(())
    }

    /// The built-in default rule set
    pub fn default_rules() -> Vec<Rule> {
        let rule = |id: &str, name: &str, description: &str, conditions, actions| Rule {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            enabled: true,
            priority: 0,
            combinator: Combinator::And,
            conditions,
            actions,
            created_at: Utc::now(),
            last_triggered: None,
            trigger_count: 0,
        };

        vec![
            rule(
                "short_video_priority",
                "High Priority for Short Videos",
                "Set high priority for videos under 5 minutes",
                vec![RuleCondition {
                    field: ConditionField::DurationSeconds,
                    operator: Operator::LessThan,
                    value: Value::from(300),
                    case_sensitive: false,
                }],
                vec![RuleAction::SetPriority {
                    priority: Priority::High,
                }],
            ),
            rule(
                "music_audio_extract",
                "Extract Audio from Music Channels",
                "Automatically extract audio from known music channels",
                vec![RuleCondition {
                    field: ConditionField::Uploader,
                    operator: Operator::Matches,
                    value: Value::from(".*music.*|.*audio.*|.*sound.*"),
                    case_sensitive: false,
                }],
                vec![RuleAction::ExtractAudio {
                    format: "mp3".to_string(),
                }],
            ),
            rule(
                "peak_hours_rate_limit",
                "Rate Limit During Peak Hours",
                "Apply rate limiting during peak internet hours (6-10 PM)",
                vec![RuleCondition {
                    field: ConditionField::HourOfDay,
                    operator: Operator::InRange,
                    value: serde_json::json!([18, 22]),
                    case_sensitive: false,
                }],
                vec![RuleAction::RateLimit {
                    bytes_per_second: 512 * 1024,
                }],
            ),
            rule(
                "organize_by_uploader",
                "Organize Downloads by Uploader",
                "Automatically organize downloads into uploader folders",
                vec![RuleCondition {
                    field: ConditionField::Uploader,
                    operator: Operator::NotEquals,
                    value: Value::from(""),
                    case_sensitive: false,
                }],
                vec![RuleAction::AutoOrganize {
                    pattern: "{uploader}/{title}".to_string(),
                }],
            ),
            rule(
                "block_large_files_full_queue",
                "Block Large Files When Queue Full",
                "Block downloads over 1GB when queue has more than 10 items",
                vec![
                    RuleCondition {
                        field: ConditionField::FileSize,
                        operator: Operator::GreaterThan,
                        value: Value::from(1_073_741_824_u64),
                        case_sensitive: false,
                    },
                    RuleCondition {
                        field: ConditionField::QueueSize,
                        operator: Operator::GreaterThan,
                        value: Value::from(10),
                        case_sensitive: false,
                    },
                ],
                vec![
                    RuleAction::Block {
                        reason: "File too large and queue is full".to_string(),
                    },
                    RuleAction::Notify {
                        message: "Large file blocked due to full queue".to_string(),
                        severity: NotifySeverity::Warning,
                    },
                ],
            ),
        ]
    }
}

#[async_trait::async_trait]
impl EventSubscriber for RulesEngine {
    fn name(&self) -> &str {
        "rules_engine"
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        self.evaluate(event).await;
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
