//! fusegrid-dispatch: the code every deployed group runs in front of its
//! member tasks.
//!
//! A group receives invocations on one entry point. Members are called in
//! process, including calls one member makes to another. A task that is
//! not a member is looked up against the control plane and forwarded to
//! its current group, at most once per invocation.

pub mod dispatcher;
pub mod error;
pub mod http;
pub mod local;

pub use dispatcher::{
    Dispatcher, Forwarder, HandlerRegistry, Invocation, ResolvedTask, TaskContext, TaskHandler,
    TaskResolver,
};
pub use error::{DispatchError, DispatchResult};
pub use http::{HttpForwarder, HttpResolver, entry_router};
pub use local::{EchoHandler, LocalRuntime};
