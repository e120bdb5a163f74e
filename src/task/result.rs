//! Typed result containers for sub-tasks and composite tasks.
//!
//! Payloads are a closed tagged union; typed access goes through
//! [`FromPayload`] so callers never downcast at runtime.

use crate::task::types::{SubTaskId, TaskStatus};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Data produced by a sub-task and handed to later sub-tasks or callers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    List(Vec<Payload>),
}

impl Payload {
    /// Extract a typed value, `None` if the variant does not match
    pub fn get<T: FromPayload>(&self) -> Option<T> {
        T::from_payload(self)
    }

    pub fn is<T: FromPayload>(&self) -> bool {
        T::matches(self)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
            Payload::Json(_) => "json",
            Payload::List(_) => "list",
        }
    }
}

/// Conversion from a [`Payload`] variant into a concrete Rust type
pub trait FromPayload: Sized {
    fn from_payload(payload: &Payload) -> Option<Self>;

    fn matches(payload: &Payload) -> bool {
        Self::from_payload(payload).is_some()
    }
}

macro_rules! payload_variant {
    ($ty:ty, $variant:ident) => {
        impl FromPayload for $ty {
            fn from_payload(payload: &Payload) -> Option<Self> {
                match payload {
                    Payload::$variant(value) => Some(value.clone()),
                    _ => None,
                }
            }

            fn matches(payload: &Payload) -> bool {
                matches!(payload, Payload::$variant(_))
            }
        }

        impl From<$ty> for Payload {
            fn from(value: $ty) -> Self {
                Payload::$variant(value)
            }
        }
    };
}

payload_variant!(bool, Bool);
payload_variant!(i64, Int);
payload_variant!(f64, Float);
payload_variant!(String, Text);
payload_variant!(Vec<u8>, Bytes);
payload_variant!(serde_json::Value, Json);
payload_variant!(Vec<Payload>, List);

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

/// Outcome of one sub-task invocation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SubTaskResult {
    pub success: bool,
    pub data: Option<Payload>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

impl SubTaskResult {
    /// Successful result without data
    pub fn success() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            execution_time: Duration::ZERO,
        }
    }

    /// Successful result carrying a payload
    pub fn with_data(data: impl Into<Payload>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::success()
        }
    }

    /// Logical failure reported by the sub-task itself
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time: Duration::ZERO,
        }
    }

    pub fn data_as<T: FromPayload>(&self) -> Option<T> {
        self.data.as_ref().and_then(T::from_payload)
    }

    pub fn has_data_of<T: FromPayload>(&self) -> bool {
        self.data.as_ref().is_some_and(T::matches)
    }
}

/// Outcome of a composite task run, including every sub-task result collected
/// before the run stopped
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskResult {
    pub success: bool,
    pub status: TaskStatus,
    pub data: HashMap<String, Payload>,
    pub error: Option<String>,
    pub sub_task_results: IndexMap<SubTaskId, SubTaskResult>,
}

impl TaskResult {
    pub fn completed(sub_task_results: IndexMap<SubTaskId, SubTaskResult>) -> Self {
        Self {
            success: true,
            status: TaskStatus::Completed,
            data: HashMap::new(),
            error: None,
            sub_task_results,
        }
    }

    pub fn failed(
        error: Option<String>,
        sub_task_results: IndexMap<SubTaskId, SubTaskResult>,
    ) -> Self {
        Self {
            success: false,
            status: TaskStatus::Failed,
            data: HashMap::new(),
            error,
            sub_task_results,
        }
    }

    pub fn cancelled(sub_task_results: IndexMap<SubTaskId, SubTaskResult>) -> Self {
        Self {
            success: false,
            status: TaskStatus::Cancelled,
            data: HashMap::new(),
            error: Some("task cancelled".to_string()),
            sub_task_results,
        }
    }

    pub fn data_as<T: FromPayload>(&self, key: &str) -> Option<T> {
        self.data.get(key).and_then(T::from_payload)
    }

    pub fn sub_task_data_as<T: FromPayload>(&self, sub_task_id: &str) -> Option<T> {
        self.sub_task_results
            .get(sub_task_id)
            .and_then(|r| r.data_as::<T>())
    }

    pub fn successful_sub_tasks(&self) -> usize {
        self.sub_task_results.values().filter(|r| r.success).count()
    }

    pub fn failed_sub_tasks(&self) -> usize {
        self.sub_task_results.values().filter(|r| !r.success).count()
    }
}
