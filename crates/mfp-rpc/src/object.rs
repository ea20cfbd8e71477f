//! Server-side view of an RPC-exposed object.
//!
//! A type becomes reachable from other processes by implementing `RpcObject`
//! (method dispatch by name) and registering a constructor with the host.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure of a single method body.
///
/// `NotFound` becomes a `NO_METHOD` response, `Failed` a `METHOD_FAILED`
/// response carrying the text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    #[error("no method {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl MethodError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        MethodError::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for MethodError {
    fn from(err: serde_json::Error) -> Self {
        MethodError::Failed(format!("argument error: {}", err))
    }
}

/// Positional and keyword arguments of a call or constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Positional argument `index`, deserialized as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| MethodError::Failed(format!("missing argument {}", index)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Keyword argument `name`, if given.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, MethodError> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }
}

/// An object whose methods can be invoked by name from another process.
#[async_trait::async_trait]
pub trait RpcObject: Send + Sync + 'static {
    /// Run `method`. Unknown names must return `MethodError::NotFound`.
    async fn call_method(&self, method: &str, args: CallArgs) -> Result<Value, MethodError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_accessors() {
        let args = CallArgs::new()
            .with_arg("freq")
            .with_arg(440.0)
            .with_kwarg("smooth", true);

        assert_eq!(args.arg::<String>(0).unwrap(), "freq");
        assert_eq!(args.arg::<f64>(1).unwrap(), 440.0);
        assert_eq!(args.kwarg::<bool>("smooth").unwrap(), Some(true));
        assert_eq!(args.kwarg::<bool>("other").unwrap(), None);
    }

    #[test]
    fn test_missing_and_mistyped_args() {
        let args = CallArgs::from(vec![json!("x")]);
        assert!(matches!(args.arg::<String>(1), Err(MethodError::Failed(_))));
        assert!(matches!(args.arg::<u32>(0), Err(MethodError::Failed(_))));
    }

    #[test]
    fn test_wire_shape_defaults() {
        let args: CallArgs = serde_json::from_value(json!({})).unwrap();
        assert!(args.is_empty());
        let json = serde_json::to_value(CallArgs::new().with_arg(1)).unwrap();
        assert_eq!(json, json!({"args": [1], "kwargs": {}}));
    }
}
