//! Single-step node interpreter.
//!
//! [`StepInterpreter::step`] executes exactly one node of a running
//! execution and moves it to its next state. The caller checkpoints after
//! every step. Checks happen in a fixed order before the node runs:
//!
//! 1. a pending cancellation ends the run as `Cancelled`
//! 2. a full visited path ends the run as `Failed` (`CycleDetected`)
//! 3. a passed deadline ends the run as `TimedOut`
//! 4. a walk with no current node ends the run as `Completed`

use crate::clock::Clock;
use crate::definition::WorkflowDefinition;
use crate::dispatcher::{ActionDispatcher, CallContext, DispatchError};
use crate::edge::EdgeLabel;
use crate::execution::{ErrorKind, Execution, ExecutionStatus, RetryState, WaitReason};
use crate::node::{
    ActionConfig, ActionKind, AiResponseConfig, FailurePolicy, Node, NodeConfig, NodeId,
    RetryPolicy,
};
use chrono::Duration as ChronoDuration;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Context key for a condition node's outcome.
pub const RESULT_KEY: &str = "result";
/// Context key for an action node's output.
pub const OUTPUT_KEY: &str = "output";
/// Context key set when a failed node was skipped.
pub const SKIPPED_KEY: &str = "skipped";
/// Context key holding the normalized error of a skipped node.
pub const ERROR_KEY: &str = "error";

/// A side-effecting node, borrowed from the definition.
#[derive(Clone, Copy)]
enum SideEffect<'a> {
    Action(&'a ActionConfig),
    Ai(&'a AiResponseConfig),
}

impl SideEffect<'_> {
    fn kind(&self) -> ActionKind {
        match self {
            Self::Action(config) => config.action.kind(),
            Self::Ai(_) => ActionKind::GenerateAiResponse,
        }
    }

    fn failure_policy(&self) -> FailurePolicy {
        match self {
            Self::Action(config) => config.failure_policy,
            Self::Ai(config) => config.failure_policy,
        }
    }

    fn retry(&self) -> &RetryPolicy {
        match self {
            Self::Action(config) => &config.retry,
            Self::Ai(config) => &config.retry,
        }
    }

    fn timeout_secs(&self) -> Option<u64> {
        match self {
            Self::Action(config) => config.timeout_secs,
            Self::Ai(config) => config.timeout_secs,
        }
    }
}

/// Executes one node at a time against a pinned definition.
pub struct StepInterpreter<'a> {
    definition: &'a WorkflowDefinition,
    dispatcher: &'a ActionDispatcher,
    clock: &'a dyn Clock,
    call_timeout: Duration,
}

impl<'a> StepInterpreter<'a> {
    /// Creates an interpreter.
    ///
    /// `call_timeout` bounds side-effect calls whose node does not set its own.
    #[must_use]
    pub fn new(
        definition: &'a WorkflowDefinition,
        dispatcher: &'a ActionDispatcher,
        clock: &'a dyn Clock,
        call_timeout: Duration,
    ) -> Self {
        Self {
            definition,
            dispatcher,
            clock,
            call_timeout,
        }
    }

    /// Executes the current node and returns the resulting status.
    ///
    /// Executions that are not `Running` are returned unchanged.
    #[instrument(
        skip_all,
        fields(
            execution_id = %execution.id,
            node_id = execution.current_node.as_ref().map(NodeId::as_str),
        )
    )]
    pub async fn step(&self, execution: &mut Execution) -> ExecutionStatus {
        if execution.status != ExecutionStatus::Running {
            return execution.status;
        }
        let now = self.clock.now();

        if execution.cancel_requested {
            info!("cancellation observed");
            execution.cancel(now);
            return execution.status;
        }
        if let Some(node_id) = &execution.current_node
            && execution.path.is_full()
        {
            warn!(visited = execution.path.len(), "path bound reached");
            let message = format!(
                "run visited more nodes than the workflow contains ({}); stopped before {node_id}",
                execution.path.capacity()
            );
            execution.fail(ErrorKind::CycleDetected, message, now);
            return execution.status;
        }
        if now > execution.deadline {
            warn!("run deadline passed");
            execution.time_out(now);
            return execution.status;
        }
        let Some(node_id) = execution.current_node.clone() else {
            execution.complete(now);
            return execution.status;
        };

        let Some(node) = self.definition.graph.get_node(&node_id) else {
            let message = format!(
                "node {node_id} does not exist in workflow version {}",
                self.definition.version
            );
            execution.fail(ErrorKind::Config, message, now);
            return execution.status;
        };
        if let Err(error) = node.config.validate() {
            execution.fail(ErrorKind::Config, format!("node {node_id} {error}"), now);
            return execution.status;
        }

        debug!(kind = %node.kind(), "executing node");
        match &node.config {
            NodeConfig::Trigger(_) => {
                execution.fail(
                    ErrorKind::Config,
                    format!("trigger node {node_id} cannot be re-entered"),
                    now,
                );
            }
            NodeConfig::Condition(condition) => {
                let outcome = condition.evaluate(&execution.context);
                debug!(outcome, "condition evaluated");
                if self.record(execution, node, RESULT_KEY, JsonValue::Bool(outcome)) {
                    self.advance(execution, node, Some(EdgeLabel::from_outcome(outcome)));
                }
            }
            NodeConfig::Delay(delay) => {
                let resume_at = now + to_chrono(delay.duration());
                self.advance(execution, node, None);
                if execution.status == ExecutionStatus::Running {
                    execution.wait_until(
                        resume_at,
                        WaitReason::Delay {
                            node_id: node.id.clone(),
                        },
                    );
                    info!(%resume_at, "waiting on delay");
                }
            }
            NodeConfig::Action(config) => {
                self.run_side_effect(execution, node, SideEffect::Action(config))
                    .await;
            }
            NodeConfig::AiResponse(config) => {
                self.run_side_effect(execution, node, SideEffect::Ai(config))
                    .await;
            }
        }
        execution.status
    }

    async fn run_side_effect(&self, execution: &mut Execution, node: &Node, effect: SideEffect<'_>) {
        let attempt = execution
            .retry
            .as_ref()
            .filter(|retry| retry.node_id == node.id)
            .map_or(0, |retry| retry.failed_attempts)
            + 1;
        let timeout = effect
            .timeout_secs()
            .map_or(self.call_timeout, Duration::from_secs);
        let call = CallContext::new(
            execution.organization_id,
            execution.id,
            node.id.clone(),
            attempt,
            timeout,
        );

        let result = match effect {
            SideEffect::Action(config) => {
                self.dispatcher
                    .dispatch(&config.action, &execution.context, &call)
                    .await
            }
            SideEffect::Ai(config) => {
                self.dispatcher
                    .generate_ai_response(config, &execution.context, &call)
                    .await
            }
        };

        match result {
            Ok(output) => {
                execution.retry = None;
                let recorded = match effect {
                    SideEffect::Action(_) => self.record(execution, node, OUTPUT_KEY, output),
                    SideEffect::Ai(config) => {
                        let text = output.get("text").cloned().unwrap_or(JsonValue::Null);
                        self.record(execution, node, &config.output_key, text)
                    }
                };
                if recorded {
                    self.advance(execution, node, None);
                }
            }
            Err(error) => self.handle_failure(execution, node, effect, attempt, &error),
        }
    }

    fn handle_failure(
        &self,
        execution: &mut Execution,
        node: &Node,
        effect: SideEffect<'_>,
        attempt: u32,
        error: &DispatchError,
    ) {
        let now = self.clock.now();
        let kind = effect.kind();

        if let DispatchError::InvalidConfig { .. } = error {
            execution.fail(
                ErrorKind::Config,
                format!("node {} has an unusable {kind} configuration", node.id),
                now,
            );
            return;
        }

        match effect.failure_policy() {
            FailurePolicy::AbortRun => {
                execution.fail(ErrorKind::ActionFailed, kind.failure_message(attempt), now);
            }
            FailurePolicy::SkipNode => {
                execution.retry = None;
                let message = JsonValue::String(kind.failure_message(attempt));
                if self.record(execution, node, SKIPPED_KEY, JsonValue::Bool(true))
                    && self.record(execution, node, ERROR_KEY, message)
                {
                    info!("failed node skipped");
                    self.advance(execution, node, None);
                }
            }
            FailurePolicy::RetryThenAbort => {
                let retry = effect.retry();
                if error.is_retryable() && attempt < retry.max_attempts {
                    let backoff = retry.backoff_for(attempt);
                    let resume_at = now + to_chrono(backoff);
                    execution.retry = Some(RetryState {
                        node_id: node.id.clone(),
                        failed_attempts: attempt,
                    });
                    execution.wait_until(
                        resume_at,
                        WaitReason::RetryBackoff {
                            node_id: node.id.clone(),
                            attempt,
                        },
                    );
                    info!(attempt, backoff_ms = backoff.as_millis() as u64, "retry scheduled");
                } else {
                    execution.fail(ErrorKind::ActionFailed, kind.failure_message(attempt), now);
                }
            }
        }
    }

    /// Writes a node output, failing the run on a type conflict.
    fn record(&self, execution: &mut Execution, node: &Node, key: &str, value: JsonValue) -> bool {
        match execution.context.set(&node.id, key, value) {
            Ok(()) => true,
            Err(error) => {
                execution.fail(ErrorKind::Config, error.to_string(), self.clock.now());
                false
            }
        }
    }

    /// Appends the node to the path and moves to its successor.
    fn advance(&self, execution: &mut Execution, node: &Node, branch: Option<EdgeLabel>) {
        let now = self.clock.now();
        if execution.path.push(node.id.clone()).is_err() {
            execution.fail(
                ErrorKind::CycleDetected,
                format!("run visited more nodes than the workflow contains at {}", node.id),
                now,
            );
            return;
        }
        execution.current_node = self.definition.graph.next_node(&node.id, branch).cloned();
        if execution.current_node.is_none() && execution.status == ExecutionStatus::Running {
            // Delay nodes without a successor still wait out their duration.
            if !matches!(node.config, NodeConfig::Delay(_)) {
                execution.complete(now);
            }
        }
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(90))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::condition::{Condition, ConditionOperator};
    use crate::dispatcher::{AdapterError, Adapters, MessageSender, OutboundMessage};
    use crate::edge::Edge;
    use crate::graph::WorkflowGraph;
    use crate::memory::InMemoryIdempotencyStore;
    use crate::node::{ActionSpec, Channel, DelayConfig, DelayUnit, SendMessageConfig};
    use crate::trigger::{Event, EventType, TriggerConfig};
    use async_trait::async_trait;
    use autoflow_core::OrganizationId;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySender {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakySender {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageSender for FlakySender {
        async fn send(
            &self,
            message: &OutboundMessage,
            _call: &CallContext,
        ) -> Result<JsonValue, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AdapterError::transient("gateway said 503 (raw provider text)"));
            }
            Ok(json!({ "delivered": message.body }))
        }
    }

    fn send_node(id: &str, policy: FailurePolicy) -> Node {
        Node::with_id(
            id,
            "Reply",
            NodeConfig::Action(
                ActionConfig::new(ActionSpec::SendMessage(SendMessageConfig {
                    channel: Channel::Whatsapp,
                    template: "Hi {{contact.name}}".to_string(),
                    to: None,
                }))
                .with_failure_policy(policy),
            ),
        )
    }

    fn trigger() -> Node {
        Node::with_id(
            "start",
            "Start",
            NodeConfig::Trigger(TriggerConfig::new(EventType::MessageReceived)),
        )
    }

    fn definition(graph: WorkflowGraph) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(OrganizationId::new(), "Test").with_graph(graph);
        definition.version = 1;
        definition
    }

    fn start(definition: &WorkflowDefinition, clock: &ManualClock, text: &str) -> Execution {
        let event = Event::new(
            definition.organization_id,
            EventType::MessageReceived,
            json!({ "message": { "text": text }, "contact": { "name": "Ana" } }),
        );
        let now = clock.now();
        Execution::start(definition, &event, now, now + ChronoDuration::minutes(5)).expect("start")
    }

    fn dispatcher(sender: Arc<FlakySender>) -> ActionDispatcher {
        ActionDispatcher::new(
            Adapters::unconfigured().with_messages(sender),
            Arc::new(InMemoryIdempotencyStore::new()),
        )
    }

    async fn run(interpreter: &StepInterpreter<'_>, execution: &mut Execution) -> ExecutionStatus {
        loop {
            let status = interpreter.step(execution).await;
            if status != ExecutionStatus::Running {
                return status;
            }
        }
    }

    fn branching() -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger());
        graph.add_node(Node::with_id(
            "check",
            "Asks for help?",
            NodeConfig::Condition(Condition::new(
                "message.text",
                ConditionOperator::Contains,
                "help",
            )),
        ));
        graph.add_node(send_node("send", FailurePolicy::RetryThenAbort));
        graph.add_edge("start", "check", Edge::unlabeled()).expect("edge");
        graph
            .add_edge("check", "send", Edge::branch(EdgeLabel::True))
            .expect("edge");
        graph.add_node(Node::with_id(
            "idle",
            "Idle",
            NodeConfig::Delay(DelayConfig::new(1, DelayUnit::Minutes)),
        ));
        graph
            .add_edge("check", "idle", Edge::branch(EdgeLabel::False))
            .expect("edge");
        definition(graph)
    }

    #[tokio::test]
    async fn condition_true_branch_sends_and_completes() {
        let definition = branching();
        let clock = ManualClock::default();
        let sender = FlakySender::failing(0);
        let dispatcher = dispatcher(sender.clone());
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "I need help");

        let status = run(&interpreter, &mut execution).await;

        assert_eq!(status, ExecutionStatus::Completed);
        let path: Vec<&str> = execution.path.as_slice().iter().map(NodeId::as_str).collect();
        assert_eq!(path, vec!["start", "check", "send"]);
        assert_eq!(execution.context.get("check.result"), Some(&json!(true)));
        assert_eq!(
            execution.context.get("send.output.delivered"),
            Some(&json!("Hi Ana"))
        );
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn condition_false_branch_waits_on_delay() {
        let definition = branching();
        let clock = ManualClock::default();
        let dispatcher = dispatcher(FlakySender::failing(0));
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "thanks");

        let status = run(&interpreter, &mut execution).await;

        assert_eq!(status, ExecutionStatus::Waiting);
        assert_eq!(execution.context.get("check.result"), Some(&json!(false)));
        assert_eq!(execution.resume_at, Some(clock.now() + ChronoDuration::minutes(1)));

        clock.advance(ChronoDuration::minutes(1));
        execution.resume();
        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn retries_back_off_then_abort_with_normalized_message() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger());
        graph.add_node(send_node("send", FailurePolicy::RetryThenAbort));
        graph.add_edge("start", "send", Edge::unlabeled()).expect("edge");
        let definition = definition(graph);
        let clock = ManualClock::default();
        let sender = FlakySender::failing(10);
        let dispatcher = dispatcher(sender.clone());
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "hi");

        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Waiting);
        assert_eq!(execution.resume_at, Some(clock.now() + ChronoDuration::seconds(1)));
        assert_eq!(
            execution.wait_reason,
            Some(WaitReason::RetryBackoff {
                node_id: NodeId::new("send"),
                attempt: 1
            })
        );

        clock.advance(ChronoDuration::seconds(1));
        execution.resume();
        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Waiting);
        assert_eq!(execution.resume_at, Some(clock.now() + ChronoDuration::seconds(2)));

        clock.advance(ChronoDuration::seconds(2));
        execution.resume();
        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Failed);

        let error = execution.error.expect("failure recorded");
        assert_eq!(error.kind, ErrorKind::ActionFailed);
        assert_eq!(error.message, "message delivery failed after 3 attempts");
        assert!(!error.message.contains("503"));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn skip_node_records_error_and_continues() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger());
        graph.add_node(send_node("send", FailurePolicy::SkipNode));
        graph.add_edge("start", "send", Edge::unlabeled()).expect("edge");
        let definition = definition(graph);
        let clock = ManualClock::default();
        let dispatcher = dispatcher(FlakySender::failing(1));
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "hi");

        assert_eq!(run(&interpreter, &mut execution).await, ExecutionStatus::Completed);
        assert_eq!(execution.context.get("send.skipped"), Some(&json!(true)));
        assert_eq!(
            execution.context.get("send.error"),
            Some(&json!("message delivery failed after 1 attempt"))
        );
    }

    #[tokio::test]
    async fn abort_run_fails_immediately() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger());
        graph.add_node(send_node("send", FailurePolicy::AbortRun));
        graph.add_edge("start", "send", Edge::unlabeled()).expect("edge");
        let definition = definition(graph);
        let clock = ManualClock::default();
        let sender = FlakySender::failing(1);
        let dispatcher = dispatcher(sender.clone());
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "hi");

        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Failed);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_checked_first() {
        let definition = branching();
        let clock = ManualClock::default();
        let dispatcher = dispatcher(FlakySender::failing(0));
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "help");
        execution.cancel_requested = true;
        clock.advance(ChronoDuration::hours(1));

        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Cancelled);
        assert_eq!(execution.path.len(), 1);
    }

    #[tokio::test]
    async fn deadline_times_out_the_run() {
        let definition = branching();
        let clock = ManualClock::default();
        let dispatcher = dispatcher(FlakySender::failing(0));
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "help");
        clock.advance(ChronoDuration::minutes(6));

        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::TimedOut);
        assert_eq!(execution.error.map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn trailing_delay_past_deadline_times_out() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger());
        graph.add_node(Node::with_id(
            "wait",
            "Wait",
            NodeConfig::Delay(DelayConfig::new(10, DelayUnit::Minutes)),
        ));
        graph.add_edge("start", "wait", Edge::unlabeled()).expect("edge");
        let definition = definition(graph);
        let clock = ManualClock::default();
        let dispatcher = dispatcher(FlakySender::failing(0));
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "hi");

        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::Waiting);
        assert_eq!(execution.current_node, None);

        clock.advance(ChronoDuration::minutes(10));
        execution.resume();
        assert_eq!(interpreter.step(&mut execution).await, ExecutionStatus::TimedOut);
        assert_eq!(execution.error.map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn looping_definition_hits_path_bound() {
        // Validation would reject this graph; the interpreter must still stop.
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger());
        graph.add_node(Node::with_id(
            "check",
            "Always true",
            NodeConfig::Condition(Condition::is_empty("missing")),
        ));
        graph.add_edge("start", "check", Edge::unlabeled()).expect("edge");
        graph
            .add_edge("check", "check", Edge::branch(EdgeLabel::True))
            .expect("edge");
        let definition = definition(graph);
        let clock = ManualClock::default();
        let dispatcher = dispatcher(FlakySender::failing(0));
        let interpreter = StepInterpreter::new(&definition, &dispatcher, &clock, Duration::from_secs(5));
        let mut execution = start(&definition, &clock, "hi");

        assert_eq!(run(&interpreter, &mut execution).await, ExecutionStatus::Failed);
        assert_eq!(
            execution.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::CycleDetected)
        );
        assert!(execution.path.len() <= definition.graph.node_count());
    }
}
