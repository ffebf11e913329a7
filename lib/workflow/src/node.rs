//! Workflow node types and configurations.
//!
//! Every node has an author-assigned id, a display name, a canvas position
//! and a configuration whose variant determines the node kind:
//!
//! - `trigger`: the entry point, filtering which events start a run
//! - `condition`: evaluates a field comparison and branches true/false
//! - `action`: a side effect (message, agent assignment, contact update, webhook)
//! - `delay`: suspends the run for a fixed duration
//! - `ai_response`: generates text with the organization's LLM backend

use crate::condition::Condition;
use crate::error::ConfigError;
use crate::trigger::TriggerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Upper bound on a single delay node.
pub const MAX_DELAY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Upper bound on attempts for a retried side effect.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// A unique identifier for a node within a workflow.
///
/// Node ids are chosen by the author (or the editor) and only need to be
/// unique within one definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from an author-chosen string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random node ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("node_{}", Ulid::new()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The kind of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point that starts a run.
    Trigger,
    /// True/false branch.
    Condition,
    /// Side effect against an external service.
    Action,
    /// Timed suspension.
    Delay,
    /// LLM text generation.
    AiResponse,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trigger => "trigger",
            Self::Condition => "condition",
            Self::Action => "action",
            Self::Delay => "delay",
            Self::AiResponse => "ai_response",
        };
        f.write_str(name)
    }
}

/// Canvas coordinates of a node in the visual editor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal offset.
    pub x: f64,
    /// Vertical offset.
    pub y: f64,
}

/// What happens when a side effect fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Fail the run on the first error.
    AbortRun,
    /// Record the error in the context and continue along the outgoing edge.
    SkipNode,
    /// Retry with backoff, then fail the run once attempts are exhausted.
    #[default]
    RetryThenAbort,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

/// Exponential backoff for retried side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait after the first failure.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Growth factor applied per further failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Cap on a single wait.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Returns the wait before the next attempt after `failed_attempts`
    /// failures (1-based).
    #[must_use]
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Checks the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns an error for zero or excessive attempts, or a shrinking multiplier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(ConfigError::new(
                "retry.max_attempts",
                format!("must be between 1 and {MAX_RETRY_ATTEMPTS}"),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::new("retry.multiplier", "must be at least 1.0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::new(
                "retry.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Messaging channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// WhatsApp conversation.
    Whatsapp,
    /// Email.
    Email,
    /// SMS text message.
    Sms,
}

/// How an agent is picked for assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// The agent named by `agent_id`.
    #[default]
    Specific,
    /// Next agent in rotation.
    RoundRobin,
    /// Agent with the fewest open conversations.
    LeastBusy,
}

/// HTTP methods available to webhook actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

/// Send a templated message to the contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageConfig {
    /// Channel to deliver through.
    pub channel: Channel,
    /// Message template with `{{path}}` placeholders.
    pub template: String,
    /// Recipient template; defaults to the triggering contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Assign the conversation to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignAgentConfig {
    /// Agent for the `specific` strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Selection strategy.
    #[serde(default)]
    pub strategy: AssignmentStrategy,
}

/// Write a field on the contact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateContactFieldConfig {
    /// Contact field name.
    pub field: String,
    /// New value. String leaves are rendered as templates.
    pub value: JsonValue,
}

/// Call an external HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallWebhookConfig {
    /// Target URL template.
    pub url: String,
    /// HTTP method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// JSON body. String leaves are rendered as templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

/// The side effect an action node performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    SendMessage(SendMessageConfig),
    AssignAgent(AssignAgentConfig),
    UpdateContactField(UpdateContactFieldConfig),
    CallWebhook(CallWebhookConfig),
}

/// Side-effect categories, used to normalize failure messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    AssignAgent,
    UpdateContactField,
    CallWebhook,
    GenerateAiResponse,
}

impl ActionKind {
    /// Short human phrase naming the operation.
    #[must_use]
    pub fn operation(self) -> &'static str {
        match self {
            Self::SendMessage => "message delivery",
            Self::AssignAgent => "agent assignment",
            Self::UpdateContactField => "contact update",
            Self::CallWebhook => "webhook call",
            Self::GenerateAiResponse => "AI response generation",
        }
    }

    /// Normalized failure message after `attempts` attempts.
    #[must_use]
    pub fn failure_message(self, attempts: u32) -> String {
        let noun = if attempts == 1 { "attempt" } else { "attempts" };
        format!("{} failed after {attempts} {noun}", self.operation())
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

impl ActionSpec {
    /// Returns the action kind.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SendMessage(_) => ActionKind::SendMessage,
            Self::AssignAgent(_) => ActionKind::AssignAgent,
            Self::UpdateContactField(_) => ActionKind::UpdateContactField,
            Self::CallWebhook(_) => ActionKind::CallWebhook,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::SendMessage(config) => {
                if config.template.trim().is_empty() {
                    return Err(ConfigError::new("template", "must not be empty"));
                }
            }
            Self::AssignAgent(config) => {
                let missing_agent = config
                    .agent_id
                    .as_deref()
                    .is_none_or(|id| id.trim().is_empty());
                if config.strategy == AssignmentStrategy::Specific && missing_agent {
                    return Err(ConfigError::new(
                        "agent_id",
                        "required for the specific strategy",
                    ));
                }
            }
            Self::UpdateContactField(config) => {
                if config.field.trim().is_empty() {
                    return Err(ConfigError::new("field", "must not be empty"));
                }
            }
            Self::CallWebhook(config) => {
                let url = config.url.trim();
                // A fully templated URL is checked after rendering.
                if !(url.starts_with("http://")
                    || url.starts_with("https://")
                    || url.starts_with("{{"))
                {
                    return Err(ConfigError::new("url", "must be an http(s) URL"));
                }
            }
        }
        Ok(())
    }
}

/// Configuration for action nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// The side effect.
    pub action: ActionSpec,
    /// Failure handling.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Retry schedule for `retry-then-abort`.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-call timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ActionConfig {
    /// Creates an action config with default failure handling.
    #[must_use]
    pub fn new(action: ActionSpec) -> Self {
        Self {
            action,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Units for delay nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

/// Configuration for delay nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// How many units to wait.
    pub amount: u64,
    /// The unit of `amount`.
    pub unit: DelayUnit,
}

impl DelayConfig {
    /// Creates a delay config.
    #[must_use]
    pub fn new(amount: u64, unit: DelayUnit) -> Self {
        Self { amount, unit }
    }

    /// Returns the delay as a duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        let seconds_per_unit = match self.unit {
            DelayUnit::Seconds => 1,
            DelayUnit::Minutes => 60,
            DelayUnit::Hours => 60 * 60,
            DelayUnit::Days => 24 * 60 * 60,
        };
        Duration::from_secs(self.amount.saturating_mul(seconds_per_unit))
    }
}

fn default_output_key() -> String {
    "text".to_string()
}

/// Configuration for AI response nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponseConfig {
    /// Prompt template with `{{path}}` placeholders.
    pub prompt: String,
    /// Optional system prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Context key the generated text is stored under.
    #[serde(default = "default_output_key")]
    pub output_key: String,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Generation length cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Failure handling.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Retry schedule for `retry-then-abort`.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-call timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl AiResponseConfig {
    /// Creates an AI response config with default output key and retries.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            output_key: default_output_key(),
            temperature: None,
            max_tokens: None,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the output key.
    #[must_use]
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Configuration for a node, varying by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    Condition(Condition),
    Action(ActionConfig),
    Delay(DelayConfig),
    AiResponse(AiResponseConfig),
}

impl NodeConfig {
    /// Returns the kind of this node configuration.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Trigger(_) => NodeKind::Trigger,
            Self::Condition(_) => NodeKind::Condition,
            Self::Action(_) => NodeKind::Action,
            Self::Delay(_) => NodeKind::Delay,
            Self::AiResponse(_) => NodeKind::AiResponse,
        }
    }

    /// Checks the configuration against its kind-specific schema.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Trigger(config) => config.validate(),
            Self::Condition(condition) => condition.validate(),
            Self::Action(config) => {
                config.action.validate()?;
                config.retry.validate()?;
                validate_timeout(config.timeout_secs)
            }
            Self::Delay(config) => {
                if config.amount == 0 {
                    return Err(ConfigError::new("amount", "must be greater than zero"));
                }
                if config.duration() > MAX_DELAY {
                    return Err(ConfigError::new("amount", "exceeds the 90 day maximum"));
                }
                Ok(())
            }
            Self::AiResponse(config) => {
                if config.prompt.trim().is_empty() {
                    return Err(ConfigError::new("prompt", "must not be empty"));
                }
                let key = config.output_key.trim();
                if key.is_empty() || key.contains('.') {
                    return Err(ConfigError::new(
                        "output_key",
                        "must be a non-empty name without dots",
                    ));
                }
                config.retry.validate()?;
                validate_timeout(config.timeout_secs)
            }
        }
    }
}

fn validate_timeout(timeout_secs: Option<u64>) -> Result<(), ConfigError> {
    match timeout_secs {
        Some(0) => Err(ConfigError::new("timeout_secs", "must be greater than zero")),
        _ => Ok(()),
    }
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// Human-readable name for this node.
    pub name: String,
    /// Node configuration (determines kind and behavior).
    pub config: NodeConfig,
    /// Editor canvas position.
    #[serde(default)]
    pub position: Position,
}

impl Node {
    /// Creates a new node with a generated ID.
    #[must_use]
    pub fn new(name: impl Into<String>, config: NodeConfig) -> Self {
        Self::with_id(NodeId::generate(), name, config)
    }

    /// Creates a new node with a specific ID.
    #[must_use]
    pub fn with_id(id: impl Into<NodeId>, name: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config,
            position: Position::default(),
        }
    }

    /// Sets the canvas position.
    #[must_use]
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Returns the kind of this node.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}
