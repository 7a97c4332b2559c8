//! In-process service registry.
//!
//! A [`Service`] maps method names to handlers. Registration is explicit and
//! typed: each handler takes one argument value and produces one reply value
//! or an error, and registration wraps it into a uniform descriptor that
//! decodes its specific argument type and encodes its specific reply type.
//! A service is built once and immutable afterwards.

use std::collections::HashMap;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use muxrpc_core::{MuxError, Result};

type MethodHandler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A named set of callable methods.
///
/// # Example
///
/// ```
/// use muxrpc_server::Service;
///
/// let arith = Service::new("Arith")
///     .method("sum", |(a, b): (i64, i64)| async move { Ok(a + b) })
///     .method("mul", |(a, b): (i64, i64)| async move { Ok(a * b) });
///
/// assert_eq!(arith.name(), "Arith");
/// assert!(arith.has_method("sum"));
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Service {
    /// Creates an empty service named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Registers a typed method handler.
    ///
    /// `f` takes exactly one argument value and returns a reply or an error.
    /// The wrapper decodes the wire body into `A` before invoking `f` and
    /// encodes the reply back into a wire body; a body that does not decode
    /// as `A` fails only that one request.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        let handler: MethodHandler = Box::new(move |args: Value| {
            let parsed: std::result::Result<A, _> = serde_json::from_value(args);
            match parsed {
                Ok(args) => {
                    let fut = f(args);
                    async move {
                        let reply = fut.await?;
                        Ok(serde_json::to_value(reply)?)
                    }
                    .boxed()
                }
                Err(e) => future::ready(Err(MuxError::Serialization(e))).boxed(),
            }
        });
        self.methods.insert(name.into(), handler);
        self
    }

    /// The service name, the part before the dot in `"Service.method"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `method` is registered on this service.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, unordered.
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Invokes `method` with a decoded wire body.
    ///
    /// The returned future owns everything it needs, so callers can race it
    /// against a deadline and drop it.
    pub fn invoke(&self, method: &str, args: Value) -> BoxFuture<'static, Result<Value>> {
        match self.methods.get(method) {
            Some(handler) => handler(args),
            None => {
                let qualified = format!("{}.{}", self.name, method);
                future::ready(Err(MuxError::MethodNotFound(qualified))).boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arith() -> Service {
        Service::new("Arith")
            .method("sum", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .method("div", |(a, b): (i64, i64)| async move {
                if b == 0 {
                    Err(MuxError::Remote("division by zero".to_string()))
                } else {
                    Ok(a / b)
                }
            })
    }

    #[tokio::test]
    async fn test_invoke_sum() {
        let service = arith();
        let reply = service.invoke("sum", json!([2, 3])).await.unwrap();
        assert_eq!(reply, json!(5));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let service = arith();
        let err = service.invoke("div", json!([1, 0])).await.unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let service = arith();
        let err = service.invoke("pow", json!([2, 3])).await.unwrap_err();
        assert!(matches!(err, MuxError::MethodNotFound(_)));
        assert!(err.to_string().contains("Arith.pow"));
    }

    #[tokio::test]
    async fn test_argument_decode_failure_is_scoped() {
        let service = arith();
        let err = service.invoke("sum", json!("not a pair")).await.unwrap_err();
        assert!(matches!(err, MuxError::Serialization(_)));

        // The service keeps working afterwards.
        let reply = service.invoke("sum", json!([4, 6])).await.unwrap();
        assert_eq!(reply, json!(10));
    }

    #[tokio::test]
    async fn test_struct_arguments() {
        #[derive(serde::Deserialize)]
        struct Args {
            num1: i64,
            num2: i64,
        }

        let service = Service::new("Arith")
            .method("sum", |args: Args| async move { Ok(args.num1 + args.num2) });

        let reply = service
            .invoke("sum", json!({"num1": 7, "num2": 8}))
            .await
            .unwrap();
        assert_eq!(reply, json!(15));
    }
}
