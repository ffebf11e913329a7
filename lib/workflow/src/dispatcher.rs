//! Side-effect dispatch.
//!
//! The dispatcher turns action and AI nodes into calls on adapter traits
//! supplied by the embedding application. Every call:
//! - carries an idempotency key derived from `(execution, node)`
//! - is bounded by a per-call timeout
//! - is skipped when the key already completed, returning the recorded output
//!
//! Adapters report raw errors; they are logged here and classified as
//! retryable or not. The messages stored on a failed run are produced by
//! the interpreter and never include raw provider text.

use crate::context::ExecutionContext;
use crate::error::StoreError;
use crate::node::{
    ActionKind, ActionSpec, AiResponseConfig, AssignAgentConfig, AssignmentStrategy,
    CallWebhookConfig, Channel, HttpMethod, NodeId, SendMessageConfig, UpdateContactFieldConfig,
};
use crate::store::IdempotencyStore;
use crate::template::{render, render_value};
use async_trait::async_trait;
use autoflow_ai::{LlmBackend, LlmError, LlmProvider, LlmRequest, LlmResponse, PromptTemplate};
use autoflow_core::{ExecutionId, OrganizationId};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Builds the idempotency key for a node within an execution.
#[must_use]
pub fn idempotency_key(execution_id: ExecutionId, node_id: &NodeId) -> String {
    format!("{execution_id}:{node_id}")
}

/// Per-call metadata handed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Organization the run belongs to.
    pub organization_id: OrganizationId,
    /// The run making the call.
    pub execution_id: ExecutionId,
    /// The node making the call.
    pub node_id: NodeId,
    /// Stable across retries and replays of the same node.
    pub idempotency_key: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Upper bound on the call.
    pub timeout: Duration,
}

impl CallContext {
    /// Creates call metadata, deriving the idempotency key.
    #[must_use]
    pub fn new(
        organization_id: OrganizationId,
        execution_id: ExecutionId,
        node_id: NodeId,
        attempt: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            organization_id,
            execution_id,
            idempotency_key: idempotency_key(execution_id, &node_id),
            node_id,
            attempt,
            timeout,
        }
    }
}

/// Error reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    /// Raw description, for logs only.
    pub message: String,
    /// Whether another attempt could succeed.
    pub retryable: bool,
}

impl AdapterError {
    /// A failure worth retrying (network, 5xx, rate limit).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will repeat on retry (bad request, unknown contact).
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AdapterError {}

impl From<LlmError> for AdapterError {
    fn from(error: LlmError) -> Self {
        Self {
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}

/// A rendered outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Delivery channel.
    pub channel: Channel,
    /// Explicit recipient; `None` means the triggering contact.
    pub to: Option<String>,
    /// Rendered message text.
    pub body: String,
    /// Contact record from the triggering event, if any.
    pub contact: Option<JsonValue>,
}

/// An agent assignment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    /// Agent for the `specific` strategy.
    pub agent_id: Option<String>,
    /// Selection strategy.
    pub strategy: AssignmentStrategy,
    /// Contact record from the triggering event, if any.
    pub contact: Option<JsonValue>,
    /// Conversation record from the triggering event, if any.
    pub conversation: Option<JsonValue>,
}

/// A contact field write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactFieldUpdate {
    /// Contact id from the triggering event, if any.
    pub contact_id: Option<String>,
    /// Field name.
    pub field: String,
    /// Rendered value.
    pub value: JsonValue,
}

/// A rendered outbound HTTP call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    pub body: Option<JsonValue>,
}

/// Delivers messages to contacts.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends a message and returns delivery details.
    async fn send(&self, message: &OutboundMessage, call: &CallContext)
    -> Result<JsonValue, AdapterError>;
}

/// Assigns conversations to agents.
#[async_trait]
pub trait AgentAssigner: Send + Sync {
    /// Performs the assignment and returns the chosen agent.
    async fn assign(
        &self,
        request: &AgentAssignment,
        call: &CallContext,
    ) -> Result<JsonValue, AdapterError>;
}

/// Writes contact fields.
#[async_trait]
pub trait ContactUpdater: Send + Sync {
    /// Applies the update and returns the stored value.
    async fn update_field(
        &self,
        update: &ContactFieldUpdate,
        call: &CallContext,
    ) -> Result<JsonValue, AdapterError>;
}

/// Calls external HTTP endpoints.
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    /// Performs the call and returns the response summary.
    async fn call(&self, request: &WebhookRequest, call: &CallContext)
    -> Result<JsonValue, AdapterError>;
}

/// Adapter that rejects every call; stands in for capabilities the
/// embedding application does not provide.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl Unconfigured {
    fn reject(capability: &str) -> AdapterError {
        AdapterError::permanent(format!("no {capability} adapter configured"))
    }
}

#[async_trait]
impl MessageSender for Unconfigured {
    async fn send(&self, _: &OutboundMessage, _: &CallContext) -> Result<JsonValue, AdapterError> {
        Err(Self::reject("messaging"))
    }
}

#[async_trait]
impl AgentAssigner for Unconfigured {
    async fn assign(&self, _: &AgentAssignment, _: &CallContext) -> Result<JsonValue, AdapterError> {
        Err(Self::reject("agent assignment"))
    }
}

#[async_trait]
impl ContactUpdater for Unconfigured {
    async fn update_field(
        &self,
        _: &ContactFieldUpdate,
        _: &CallContext,
    ) -> Result<JsonValue, AdapterError> {
        Err(Self::reject("contact"))
    }
}

#[async_trait]
impl WebhookCaller for Unconfigured {
    async fn call(&self, _: &WebhookRequest, _: &CallContext) -> Result<JsonValue, AdapterError> {
        Err(Self::reject("webhook"))
    }
}

#[async_trait]
impl LlmBackend for Unconfigured {
    async fn generate(&self, _: &LlmRequest) -> Result<LlmResponse, LlmError> {
        Err(LlmError::InvalidConfig {
            reason: "no LLM backend configured".to_string(),
        })
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Local
    }

    fn model(&self) -> &str {
        "unconfigured"
    }
}

/// The set of adapters the dispatcher calls.
#[derive(Clone)]
pub struct Adapters {
    pub messages: Arc<dyn MessageSender>,
    pub agents: Arc<dyn AgentAssigner>,
    pub contacts: Arc<dyn ContactUpdater>,
    pub webhooks: Arc<dyn WebhookCaller>,
    pub llm: Arc<dyn LlmBackend>,
}

impl Adapters {
    /// Adapters that reject every call.
    #[must_use]
    pub fn unconfigured() -> Self {
        Self {
            messages: Arc::new(Unconfigured),
            agents: Arc::new(Unconfigured),
            contacts: Arc::new(Unconfigured),
            webhooks: Arc::new(Unconfigured),
            llm: Arc::new(Unconfigured),
        }
    }

    /// Sets the message sender.
    #[must_use]
    pub fn with_messages(mut self, messages: Arc<dyn MessageSender>) -> Self {
        self.messages = messages;
        self
    }

    /// Sets the agent assigner.
    #[must_use]
    pub fn with_agents(mut self, agents: Arc<dyn AgentAssigner>) -> Self {
        self.agents = agents;
        self
    }

    /// Sets the contact updater.
    #[must_use]
    pub fn with_contacts(mut self, contacts: Arc<dyn ContactUpdater>) -> Self {
        self.contacts = contacts;
        self
    }

    /// Sets the webhook caller.
    #[must_use]
    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookCaller>) -> Self {
        self.webhooks = webhooks;
        self
    }

    /// Sets the LLM backend.
    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmBackend>) -> Self {
        self.llm = llm;
        self
    }
}

impl Default for Adapters {
    fn default() -> Self {
        Self::unconfigured()
    }
}

/// Errors from dispatching a side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The adapter reported an error.
    Failed {
        kind: ActionKind,
        message: String,
        retryable: bool,
    },
    /// The call did not finish within its timeout.
    TimedOut { kind: ActionKind, after: Duration },
    /// The node configuration is unusable after rendering.
    InvalidConfig { kind: ActionKind, reason: String },
    /// The idempotency store failed.
    Store(StoreError),
}

impl DispatchError {
    /// Returns true if another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::TimedOut { .. } | Self::Store(_) => true,
            Self::InvalidConfig { .. } => false,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { kind, message, .. } => write!(f, "{kind} failed: {message}"),
            Self::TimedOut { kind, after } => {
                write!(f, "{kind} timed out after {}ms", after.as_millis())
            }
            Self::InvalidConfig { kind, reason } => {
                write!(f, "{kind} configuration invalid: {reason}")
            }
            Self::Store(error) => write!(f, "idempotency store: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<StoreError> for DispatchError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Routes side effects to adapters with idempotency and timeouts.
#[derive(Clone)]
pub struct ActionDispatcher {
    adapters: Adapters,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl ActionDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(adapters: Adapters, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            adapters,
            idempotency,
        }
    }

    /// Performs an action node's side effect.
    ///
    /// # Errors
    ///
    /// Returns the adapter failure, a timeout, or a configuration problem.
    pub async fn dispatch(
        &self,
        action: &ActionSpec,
        context: &ExecutionContext,
        call: &CallContext,
    ) -> Result<JsonValue, DispatchError> {
        match action {
            ActionSpec::SendMessage(config) => self.send_message(config, context, call).await,
            ActionSpec::AssignAgent(config) => self.assign_agent(config, context, call).await,
            ActionSpec::UpdateContactField(config) => {
                self.update_contact_field(config, context, call).await
            }
            ActionSpec::CallWebhook(config) => self.call_webhook(config, context, call).await,
        }
    }

    /// Renders and sends a message.
    ///
    /// # Errors
    ///
    /// Returns the adapter failure or a timeout.
    pub async fn send_message(
        &self,
        config: &SendMessageConfig,
        context: &ExecutionContext,
        call: &CallContext,
    ) -> Result<JsonValue, DispatchError> {
        let message = OutboundMessage {
            channel: config.channel,
            to: config
                .to
                .as_deref()
                .map(|to| render(to, context))
                .filter(|to| !to.trim().is_empty()),
            body: render(&config.template, context),
            contact: context.get("contact").cloned(),
        };
        self.invoke(
            ActionKind::SendMessage,
            call,
            self.adapters.messages.send(&message, call),
        )
        .await
    }

    /// Assigns the conversation to an agent.
    ///
    /// # Errors
    ///
    /// Returns the adapter failure or a timeout.
    pub async fn assign_agent(
        &self,
        config: &AssignAgentConfig,
        context: &ExecutionContext,
        call: &CallContext,
    ) -> Result<JsonValue, DispatchError> {
        let request = AgentAssignment {
            agent_id: config.agent_id.as_deref().map(|id| render(id, context)),
            strategy: config.strategy,
            contact: context.get("contact").cloned(),
            conversation: context.get("conversation").cloned(),
        };
        self.invoke(
            ActionKind::AssignAgent,
            call,
            self.adapters.agents.assign(&request, call),
        )
        .await
    }

    /// Writes a contact field.
    ///
    /// # Errors
    ///
    /// Returns the adapter failure or a timeout.
    pub async fn update_contact_field(
        &self,
        config: &UpdateContactFieldConfig,
        context: &ExecutionContext,
        call: &CallContext,
    ) -> Result<JsonValue, DispatchError> {
        let update = ContactFieldUpdate {
            contact_id: context
                .get("contact.id")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            field: config.field.clone(),
            value: render_value(&config.value, context),
        };
        self.invoke(
            ActionKind::UpdateContactField,
            call,
            self.adapters.contacts.update_field(&update, call),
        )
        .await
    }

    /// Calls a webhook.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the rendered URL is not http(s), otherwise
    /// the adapter failure or a timeout.
    pub async fn call_webhook(
        &self,
        config: &CallWebhookConfig,
        context: &ExecutionContext,
        call: &CallContext,
    ) -> Result<JsonValue, DispatchError> {
        let url = render(&config.url, context);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(DispatchError::InvalidConfig {
                kind: ActionKind::CallWebhook,
                reason: "rendered url is not an http(s) URL".to_string(),
            });
        }
        let request = WebhookRequest {
            url,
            method: config.method,
            headers: config
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), render(value, context)))
                .collect(),
            body: config.body.as_ref().map(|body| render_value(body, context)),
        };
        self.invoke(
            ActionKind::CallWebhook,
            call,
            self.adapters.webhooks.call(&request, call),
        )
        .await
    }

    /// Generates text with the LLM backend.
    ///
    /// The output is `{"text", "model", "usage"}`.
    ///
    /// # Errors
    ///
    /// Returns the backend failure or a timeout.
    pub async fn generate_ai_response(
        &self,
        config: &AiResponseConfig,
        context: &ExecutionContext,
        call: &CallContext,
    ) -> Result<JsonValue, DispatchError> {
        let mut template = PromptTemplate::new(call.node_id.as_str(), &config.prompt);
        if let Some(system) = &config.system {
            template = template.with_system_prompt(system);
        }
        let variables = context.variables_for(&template.placeholders());

        let mut request = LlmRequest::new(template.render(&variables))
            .with_idempotency_key(&call.idempotency_key)
            .with_timeout(call.timeout);
        if let Some(system) = template.render_system_prompt(&variables) {
            request = request.with_system(system);
        }
        if let Some(temperature) = config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let llm = Arc::clone(&self.adapters.llm);
        let generation = async move {
            let response = llm.generate(&request).await.map_err(AdapterError::from)?;
            Ok::<_, AdapterError>(json!({
                "text": response.content,
                "model": response.model,
                "usage": {
                    "input_tokens": response.usage.input_tokens,
                    "output_tokens": response.usage.output_tokens,
                },
            }))
        };
        self.invoke(ActionKind::GenerateAiResponse, call, generation).await
    }

    #[instrument(
        skip_all,
        fields(
            kind = %kind,
            execution_id = %call.execution_id,
            node_id = %call.node_id,
            attempt = call.attempt,
        )
    )]
    async fn invoke<F>(
        &self,
        kind: ActionKind,
        call: &CallContext,
        operation: F,
    ) -> Result<JsonValue, DispatchError>
    where
        F: Future<Output = Result<JsonValue, AdapterError>> + Send,
    {
        if let Some(output) = self.idempotency.completed(&call.idempotency_key).await? {
            info!(key = %call.idempotency_key, "side effect already completed, replaying output");
            return Ok(output);
        }

        debug!(timeout_ms = call.timeout.as_millis() as u64, "dispatching side effect");
        match tokio::time::timeout(call.timeout, operation).await {
            Ok(Ok(output)) => {
                self.idempotency.record(&call.idempotency_key, &output).await?;
                info!("side effect completed");
                Ok(output)
            }
            Ok(Err(error)) => {
                warn!(error = %error.message, retryable = error.retryable, "side effect failed");
                Err(DispatchError::Failed {
                    kind,
                    message: error.message,
                    retryable: error.retryable,
                })
            }
            Err(_) => {
                warn!("side effect timed out");
                Err(DispatchError::TimedOut {
                    kind,
                    after: call.timeout,
                })
            }
        }
    }
}
