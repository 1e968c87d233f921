//! Declared interfaces on either end of a channel.
//!
//! [`LocalInterface`] holds the methods this side serves. [`RemoteInterface`]
//! declares what the peer is expected to serve and how to decode its results.
//! Both are declared up front; the handshake only checks the peer against
//! the declaration and never invents methods from advertised names.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// Validates or transforms a raw JSON value before it is used.
pub type Decoder = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, Value>> + Send + Sync>;

/// Build the payload of an `exception` reply from a message.
pub(crate) fn error_value(message: impl Into<String>) -> Value {
    json!({ "message": message.into() })
}

/// Methods served by this side of a channel.
#[derive(Clone, Default)]
pub struct LocalInterface {
    handlers: BTreeMap<String, Handler>,
    decoders: BTreeMap<String, Decoder>,
}

impl LocalInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed method.
    ///
    /// The raw argument is deserialized into `A` (a missing argument arrives
    /// as `null`, so `()` and `Option<_>` work for argument-less methods).
    /// An `Err(E)` is sent back as an exception carrying `E`'s message.
    pub fn method<A, R, E, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |raw: Value| {
            let f = Arc::clone(&f);
            let method = method.clone();
            async move {
                let argument: A = serde_json::from_value(raw).map_err(|e| {
                    error_value(format!("invalid argument for `{}`: {}", method, e))
                })?;
                let output = f(argument).await.map_err(|e| error_value(e.to_string()))?;
                serde_json::to_value(output).map_err(|e| {
                    error_value(format!("failed to encode result of `{}`: {}", method, e))
                })
            }
            .boxed()
        });
        self.with_handler(name, handler)
    }

    /// Register a method working directly on JSON values.
    ///
    /// `Err(value)` is sent back verbatim as the exception payload.
    pub fn raw_method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |raw: Value| f(raw).boxed());
        self.with_handler(name.into(), handler)
    }

    /// Register an argument decoder that runs before `name`'s handler.
    pub fn decoder<D>(mut self, name: impl Into<String>, decoder: D) -> Self
    where
        D: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.decoders.insert(name.into(), Arc::new(decoder));
        self
    }

    fn with_handler(mut self, name: String, handler: Handler) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    /// Names advertised to the peer during the handshake.
    pub fn method_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run `method` against `argument`.
    ///
    /// Unknown methods and argument decode failures resolve to an error
    /// payload rather than failing the caller.
    pub(crate) fn invoke(
        &self,
        method: &str,
        argument: Value,
    ) -> BoxFuture<'static, std::result::Result<Value, Value>> {
        let Some(handler) = self.handlers.get(method).cloned() else {
            let error = error_value(Error::MethodNotFound(method.to_string()).to_string());
            return futures::future::ready(Err(error)).boxed();
        };

        let argument = match self.decoders.get(method) {
            Some(decoder) => match decoder(argument) {
                Ok(argument) => argument,
                Err(e) => {
                    let error = error_value(format!("invalid argument for `{}`: {}", method, e));
                    return futures::future::ready(Err(error)).boxed();
                }
            },
            None => argument,
        };

        handler(argument)
    }
}

impl fmt::Debug for LocalInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalInterface")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Declaration of the methods the peer is expected to serve.
#[derive(Clone, Default)]
pub struct RemoteInterface {
    expected: BTreeSet<String>,
    decoders: BTreeMap<String, Decoder>,
}

impl RemoteInterface {
    /// Declare the expected method names.
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: methods.into_iter().map(Into::into).collect(),
            decoders: BTreeMap::new(),
        }
    }

    /// Register a result decoder for `name`, declaring the method if needed.
    pub fn decoder<D>(mut self, name: impl Into<String>, decoder: D) -> Self
    where
        D: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let name = name.into();
        self.expected.insert(name.clone());
        self.decoders.insert(name, Arc::new(decoder));
        self
    }

    pub fn expected(&self) -> impl Iterator<Item = &str> {
        self.expected.iter().map(String::as_str)
    }

    /// Check a peer's advertised methods against the declaration.
    ///
    /// The advertised set must be a subset of the declared one.
    pub(crate) fn accept(&self, advertised: &[String]) -> Result<BTreeSet<String>> {
        let unexpected: Vec<String> = advertised
            .iter()
            .filter(|name| !self.expected.contains(*name))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(Error::Handshake { unexpected });
        }
        Ok(advertised.iter().cloned().collect())
    }

    /// Apply the registered result decoder for `method`, if any.
    pub(crate) fn decode_result(&self, method: &str, value: Value) -> Result<Value> {
        match self.decoders.get(method) {
            Some(decoder) => decoder(value)
                .map_err(|e| Error::Decode(format!("result of `{}`: {}", method, e))),
            None => Ok(value),
        }
    }
}

impl fmt::Debug for RemoteInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInterface")
            .field("expected", &self.expected)
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
