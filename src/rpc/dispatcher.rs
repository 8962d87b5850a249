//! Request dispatch.
//!
//! Resolves the method, converts the wire parameters, obtains the receiver and
//! runs the method body. Every failure along the way becomes an error
//! response; nothing here closes a connection.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::error::DispatchError;
use super::params::convert;
use super::protocol::{Request, Response};
use super::receiver::ReceiverManager;
use super::registry::MethodRegistry;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
    receivers: Arc<ReceiverManager>,
}

impl Dispatcher {
    pub fn new(registry: Arc<MethodRegistry>, receivers: Arc<ReceiverManager>) -> Self {
        Self {
            registry,
            receivers,
        }
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Handle one request and build its response envelope.
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id;
        let method = request.method.clone();

        match self.execute(request).await {
            Ok(result) => {
                debug!(id, method = %method, "Request succeeded");
                Response::success(id, result)
            }
            Err(e) => {
                debug!(id, method = %method, error = %e, "Request failed");
                Response::error(id, e.to_string())
            }
        }
    }

    /// Resolve, convert and invoke. The method body runs on its own task so a
    /// panic surfaces as an error instead of unwinding through the connection.
    pub async fn execute(&self, request: Request) -> Result<Value, DispatchError> {
        let descriptor = self
            .registry
            .resolve(&request.method)
            .ok_or_else(|| DispatchError::MethodNotFound(request.method.clone()))?;

        if let Some(deprecation) = descriptor.deprecation() {
            warn!(
                method = %descriptor.name(),
                replaced_by = %deprecation.replaced_by,
                "Deprecated method called"
            );
        }

        let args = convert(descriptor.params(), request.params)?;
        let receiver = self.receivers.get_or_create(descriptor.receiver()).await?;

        let invocation = descriptor.invoke(receiver, args);
        match tokio::spawn(invocation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DispatchError::Invocation(format!("{:#}", e))),
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                warn!(method = %descriptor.qualified_name(), panic = %message, "Method panicked");
                Err(DispatchError::Invocation(message))
            }
            Err(_) => Err(DispatchError::Cancelled(descriptor.qualified_name())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::events::EventQueue;
    use crate::rpc::params::{Args, ParamSpec, ParamType};
    use crate::rpc::receiver::{Receiver, ReceiverType, SessionContext};
    use crate::rpc::registry::MethodSpec;
    use serde_json::json;

    struct Calculator;

    impl Receiver for Calculator {}

    fn calculator() -> ReceiverType {
        ReceiverType::builder("Calculator", |_| Ok(Calculator))
            .method(MethodSpec::new("ping"), |_c: Arc<Calculator>, _args: Args| async {
                anyhow::Ok("pong")
            })
            .method(
                MethodSpec::new("add")
                    .param(ParamSpec::new("a", ParamType::Int))
                    .param(ParamSpec::new("b", ParamType::Int)),
                |_c: Arc<Calculator>, args: Args| async move {
                    anyhow::Ok(args.int(0)? + args.int(1)?)
                },
            )
            .method(
                MethodSpec::new("divide")
                    .param(ParamSpec::new("a", ParamType::Int))
                    .param(ParamSpec::new("b", ParamType::Int)),
                |_c: Arc<Calculator>, args: Args| async move {
                    let b = args.int(1)?;
                    anyhow::ensure!(b != 0, "division by zero");
                    anyhow::Ok(args.int(0)? / b)
                },
            )
            .method(MethodSpec::new("explode"), |_c: Arc<Calculator>, _args: Args| async {
                if true {
                    panic!("boom");
                }
                anyhow::Ok(())
            })
            .method(MethodSpec::new("nothing"), |_c: Arc<Calculator>, _args: Args| async {
                anyhow::Ok(())
            })
            .build()
    }

    fn dispatcher(types: Vec<ReceiverType>) -> Dispatcher {
        let registry = MethodRegistry::from_types(&types).unwrap();
        let receivers =
            ReceiverManager::new(&types, SessionContext::new(EventQueue::new(8))).unwrap();
        Dispatcher::new(Arc::new(registry), Arc::new(receivers))
    }

    #[tokio::test]
    async fn ping() {
        let d = dispatcher(vec![calculator()]);
        let resp = d.dispatch(Request::new(1, "ping", vec![])).await;
        assert_eq!(resp, Response::success(1, json!("pong")));
    }

    #[tokio::test]
    async fn add() {
        let d = dispatcher(vec![calculator()]);
        let resp = d.dispatch(Request::new(2, "add", vec![json!(2), json!(3)])).await;
        assert_eq!(resp, Response::success(2, json!(5)));
    }

    #[tokio::test]
    async fn unknown_method() {
        let d = dispatcher(vec![calculator()]);
        let resp = d.dispatch(Request::new(3, "doesNotExist", vec![])).await;
        assert_eq!(resp.id, 3);
        assert_eq!(resp.result, Value::Null);
        assert_eq!(resp.error.as_deref(), Some("Unknown RPC: doesNotExist"));
    }

    #[tokio::test]
    async fn conversion_errors_become_responses() {
        let d = dispatcher(vec![calculator()]);

        let resp = d.dispatch(Request::new(4, "add", vec![json!(2)])).await;
        assert!(resp.error.unwrap().contains("Argument 2 (b) is not present"));

        let resp = d
            .dispatch(Request::new(5, "add", vec![json!(1), json!(2), json!(3)]))
            .await;
        assert!(resp.error.unwrap().starts_with("Too many parameters"));

        let resp = d
            .dispatch(Request::new(6, "add", vec![json!(1.5), json!(2)]))
            .await;
        assert!(resp.error.unwrap().contains("should be of type Integer"));
    }

    #[tokio::test]
    async fn invocation_error_carries_message() {
        let d = dispatcher(vec![calculator()]);
        let resp = d
            .dispatch(Request::new(7, "divide", vec![json!(1), json!(0)]))
            .await;
        assert_eq!(resp.error.as_deref(), Some("division by zero"));
    }

    #[tokio::test]
    async fn panic_becomes_error_response() {
        let d = dispatcher(vec![calculator()]);
        let resp = d.dispatch(Request::new(8, "explode", vec![])).await;
        assert_eq!(resp.error.as_deref(), Some("boom"));

        // The dispatcher is still usable afterwards.
        let resp = d.dispatch(Request::new(9, "ping", vec![])).await;
        assert_eq!(resp.result, json!("pong"));
    }

    #[tokio::test]
    async fn void_result_is_null() {
        let d = dispatcher(vec![calculator()]);
        let resp = d.dispatch(Request::new(10, "nothing", vec![])).await;
        assert_eq!(resp, Response::success(10, Value::Null));
    }

    #[tokio::test]
    async fn construction_failure_is_reported() {
        struct Broken;
        impl Receiver for Broken {}

        let broken = ReceiverType::builder("Broken", |_| -> anyhow::Result<Broken> {
            anyhow::bail!("no sensor")
        })
        .method(MethodSpec::new("read"), |_b: Arc<Broken>, _args: Args| async {
            anyhow::Ok(0)
        })
        .build();

        let d = dispatcher(vec![broken]);
        let resp = d.dispatch(Request::new(11, "read", vec![])).await;
        let error = resp.error.unwrap();
        assert!(error.starts_with("Failed to construct receiver Broken"));
        assert!(error.contains("no sensor"));
    }
}
