pub mod builder;
pub mod composite;
pub mod context;
pub mod error;
pub mod events;
pub mod lock;
pub mod manager;
pub mod result;
pub mod scheduler;
pub mod subtask;
pub mod types;


pub use builder::*;
pub use composite::{CompositeTask, ProgressSink, Resumption, RunTicket, TaskCompletionCallback};
pub use context::*;
pub use error::*;
pub use events::{EventAggregator, ListenerId, TaskTable};
pub use lock::*;
pub use manager::*;
pub use result::*;
pub use scheduler::Scheduler;
pub use subtask::*;
pub use types::*;
