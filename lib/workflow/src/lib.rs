//! Workflow execution engine for autoflow.
//!
//! This crate provides everything needed to run one workflow step at a time:
//!
//! - **Graph Model**: directed graphs using petgraph with typed nodes and branch-labeled edges
//! - **Conditions**: field comparisons evaluated against the execution context
//! - **Triggers**: matching inbound events to enabled definitions
//! - **Execution**: the checkpointed run record and its state machine
//! - **Interpreter**: executes one node and decides the next
//! - **Dispatcher**: typed side-effect adapters with idempotency keys and timeouts
//! - **Stores**: definition, execution and idempotency persistence seams

pub mod clock;
pub mod condition;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod graph;
pub mod interpreter;
pub mod memory;
pub mod nats;
pub mod node;
pub mod store;
pub mod template;
pub mod trigger;
pub mod webhook;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{Condition, ConditionOperator};
pub use context::ExecutionContext;
pub use definition::{WorkflowDefinition, WorkflowMetadata, WorkflowSummary};
pub use dispatcher::{ActionDispatcher, AdapterError, Adapters, CallContext, DispatchError};
pub use edge::{Edge, EdgeLabel};
pub use error::{ConfigError, ContextError, GraphError, StoreError, ValidationError};
pub use execution::{ErrorKind, Execution, ExecutionStatus, ExecutionView};
pub use graph::{GraphLimits, WorkflowGraph};
pub use interpreter::StepInterpreter;
pub use memory::{InMemoryDefinitionStore, InMemoryExecutionStore, InMemoryIdempotencyStore};
pub use nats::{NatsConfig, NatsExecutionStore};
pub use node::{FailurePolicy, Node, NodeConfig, NodeId, NodeKind, RetryPolicy};
pub use store::{DefinitionStore, ExecutionStore, IdempotencyStore};
pub use trigger::{Event, EventType, TriggerConfig, TriggerMatcher};
pub use webhook::HttpWebhookCaller;
