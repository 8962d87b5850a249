//! Basic request/response methods.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use serde_json::Value;

use crate::rpc::{Args, MethodSpec, ParamSpec, ParamType, Receiver, ReceiverType};

pub const NAME: &str = "SystemFacade";

pub struct SystemFacade;

impl Receiver for SystemFacade {}

impl SystemFacade {
    async fn ping(self: Arc<Self>, _args: Args) -> anyhow::Result<&'static str> {
        Ok("pong")
    }

    async fn add(self: Arc<Self>, args: Args) -> anyhow::Result<i64> {
        let (a, b) = (args.int(0)?, args.int(1)?);
        a.checked_add(b)
            .with_context(|| format!("{} + {} overflows a 64-bit integer", a, b))
    }

    async fn echo(self: Arc<Self>, args: Args) -> anyhow::Result<Value> {
        Ok(args.value(0))
    }

    async fn sleep(self: Arc<Self>, args: Args) -> anyhow::Result<()> {
        let millis = args.int(0)?;
        ensure!(millis >= 0, "millis must not be negative, got {}", millis);
        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
        Ok(())
    }
}

pub fn receiver_type() -> ReceiverType {
    ReceiverType::builder(NAME, |_| Ok(SystemFacade))
        .method(
            MethodSpec::new("ping")
                .describe("Checks that the bridge is alive.")
                .returns(ParamType::String, "The string \"pong\"."),
            SystemFacade::ping,
        )
        .method(
            MethodSpec::new("add")
                .describe("Adds two integers.")
                .param(ParamSpec::new("a", ParamType::Int))
                .param(ParamSpec::new("b", ParamType::Int))
                .returns(ParamType::Int, "The sum."),
            SystemFacade::add,
        )
        .method(
            MethodSpec::new("echo")
                .describe("Returns its argument unchanged.")
                .param(ParamSpec::new("value", ParamType::Any).describe("any JSON value"))
                .returns(ParamType::Any, ""),
            SystemFacade::echo,
        )
        .method(
            MethodSpec::new("sleep")
                .describe("Blocks the calling connection for the given time.")
                .param(ParamSpec::new("millis", ParamType::Int).describe("milliseconds")),
            SystemFacade::sleep,
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Arg;
    use serde_json::json;

    #[tokio::test]
    async fn add_rejects_overflow() {
        let facade = Arc::new(SystemFacade);
        let err = facade
            .add(Args::new(vec![Arg::Int(i64::MAX), Arg::Int(1)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[tokio::test]
    async fn echo_returns_argument() {
        let facade = Arc::new(SystemFacade);
        let value = facade.echo(Args::new(vec![Arg::Any(json!({"a": [1, 2]}))])).await.unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn negative_sleep_is_an_error() {
        let facade = Arc::new(SystemFacade);
        assert!(
            facade
                .sleep(Args::new(vec![Arg::Int(-1)]))
                .await
                .is_err()
        );
    }

    #[test]
    fn registers_all_methods() {
        let names: Vec<_> = receiver_type()
            .methods()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["ping", "add", "echo", "sleep"]);
    }
}
