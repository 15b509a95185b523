//! Stratus core: the template deployment engine of a local cloud emulator.
//!
//! The engine takes a declarative template (a tree of named resources with
//! inter-references) and drives it to a target state by invoking service
//! APIs in dependency order:
//!
//! - [`template`] models parsed templates and live resource records;
//! - [`intrinsics`] evaluates the embedded expression language (`Ref`,
//!   `Fn::GetAtt`, `Fn::Sub`, conditions, dynamic references, ...);
//! - [`provider`] defines the per-resource-type capability interface and
//!   the registry providers register into at startup;
//! - [`invoker`] materializes call parameters and dispatches deploy
//!   descriptors against [`services`] clients;
//! - [`planner`] diffs template snapshots into ordered resource changes;
//! - [`deployer`] runs the fixed-point deployment loop and the stack
//!   status machine, on a background worker per stack.
//!
//! Service clients, the persistent stack store, and the API front end live
//! outside this crate and are consumed through the narrow interfaces in
//! [`services`].

pub mod deployer;
pub mod environment;
pub mod error;
pub mod intrinsics;
pub mod invoker;
pub mod planner;
pub mod provider;
pub mod services;
pub mod stack;
pub mod status;
pub mod template;
pub mod utils;

pub use deployer::{DeploymentHandle, MAX_DELETE_CYCLES, MAX_DEPLOY_ITERATIONS, TemplateDeployer};
pub use environment::Environment;
pub use error::{EngineError, EngineResult};
pub use intrinsics::{EvalContext, evaluate_condition, resolve_refs_recursively};
pub use planner::{ChangeAction, ResourceChange};
pub use provider::{
    ActionDescriptor, DeployCall, DeploySpec, DeployTemplates, InvocationContext, ParameterSpec,
    PropertySelector, ResourceAction, ResourceProvider, ResourceRegistry, TypeCoercion,
};
pub use services::{
    ExportsMap, ParamIssue, ParamValidationReport, ServiceClient, ServiceClientRegistry,
    ServiceError,
};
pub use stack::{ChangeSet, Stack, StackOutput, StackParameter};
pub use status::{
    ChangeSetStatus, ExecutionStatus, ResourceStatus, StackAction, StackStatus,
};
pub use template::{PARAMETER_TYPE, Resource, Template};
