//! RPC access to the session event queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;

use crate::rpc::{
    Args, Event, EventQueue, MethodSpec, ParamSpec, ParamType, Receiver, ReceiverType,
};

pub const NAME: &str = "EventFacade";

pub struct EventFacade {
    queue: EventQueue,
}

impl Receiver for EventFacade {}

impl EventFacade {
    pub fn new(queue: EventQueue) -> Self {
        Self { queue }
    }

    async fn event_post(self: Arc<Self>, args: Args) -> anyhow::Result<()> {
        let event = Event::new(args.str(0)?, args.value(1));
        if args.bool(2)? {
            self.queue.push(event);
        } else {
            self.queue.dispatch(event);
        }
        Ok(())
    }

    async fn event_poll(self: Arc<Self>, args: Args) -> anyhow::Result<Vec<Event>> {
        let n = args.int(0)?;
        ensure!(n >= 0, "number_of_events must not be negative, got {}", n);
        Ok(self.queue.poll(n as usize))
    }

    async fn event_wait(self: Arc<Self>, args: Args) -> anyhow::Result<Option<Event>> {
        let timeout = timeout_arg(&args, 0)?;
        Ok(self.queue.wait_any(timeout).await)
    }

    async fn event_wait_for(self: Arc<Self>, args: Args) -> anyhow::Result<Option<Event>> {
        let timeout = timeout_arg(&args, 1)?;
        Ok(self.queue.wait_for(args.str(0)?, timeout).await)
    }

    async fn event_clear_buffer(self: Arc<Self>, _args: Args) -> anyhow::Result<()> {
        self.queue.clear();
        Ok(())
    }

    async fn post_event(self: Arc<Self>, args: Args) -> anyhow::Result<()> {
        self.queue.post(args.str(0)?, args.value(1));
        Ok(())
    }

    async fn receive_event(self: Arc<Self>, _args: Args) -> anyhow::Result<Option<Event>> {
        Ok(self.queue.poll(1).pop())
    }
}

fn timeout_arg(args: &Args, index: usize) -> anyhow::Result<Option<Duration>> {
    match args.opt_int(index)? {
        Some(ms) => {
            ensure!(ms >= 0, "timeout must not be negative, got {}", ms);
            Ok(Some(Duration::from_millis(ms as u64)))
        }
        None => Ok(None),
    }
}

pub fn receiver_type() -> ReceiverType {
    ReceiverType::builder(NAME, |ctx| Ok(EventFacade::new(ctx.events().clone())))
        .method(
            MethodSpec::new("eventPost")
                .describe("Post an event to the event queue.")
                .param(ParamSpec::new("name", ParamType::String).describe("Name of event"))
                .param(
                    ParamSpec::new("data", ParamType::Any)
                        .describe("Data contained in event.")
                        .optional(),
                )
                .param(
                    ParamSpec::new("enqueue", ParamType::Bool)
                        .describe("Set to false to only notify waiting callers.")
                        .default_value("true"),
                ),
            EventFacade::event_post,
        )
        .method(
            MethodSpec::new("eventPoll")
                .describe("Returns and removes the oldest n events from the event buffer.")
                .param(ParamSpec::new("number_of_events", ParamType::Int).default_value("1"))
                .returns(
                    ParamType::list_of(ParamType::Map),
                    "A List of Maps of event properties.",
                ),
            EventFacade::event_poll,
        )
        .method(
            MethodSpec::new("eventWait")
                .describe(
                    "Blocks until an event occurs. \
                     The returned event is removed from the buffer.",
                )
                .param(
                    ParamSpec::new("timeout", ParamType::Int)
                        .describe("the maximum time to wait (in ms)")
                        .optional(),
                )
                .returns(ParamType::Map, "Map of event properties, or null on timeout."),
            EventFacade::event_wait,
        )
        .method(
            MethodSpec::new("eventWaitFor")
                .describe(
                    "Blocks until an event with the supplied name occurs. \
                     The returned event is not removed from the buffer.",
                )
                .param(ParamSpec::new("eventName", ParamType::String))
                .param(
                    ParamSpec::new("timeout", ParamType::Int)
                        .describe("the maximum time to wait (in ms)")
                        .optional(),
                )
                .returns(ParamType::Map, "Map of event properties, or null on timeout."),
            EventFacade::event_wait_for,
        )
        .method(
            MethodSpec::new("eventClearBuffer")
                .describe("Clears all events from the event buffer."),
            EventFacade::event_clear_buffer,
        )
        .method(
            MethodSpec::new("postEvent")
                .describe("Post an event to the event queue.")
                .param(ParamSpec::new("name", ParamType::String))
                .param(ParamSpec::new("data", ParamType::Any).optional())
                .deprecated("eventPost", "r4"),
            EventFacade::post_event,
        )
        .method(
            MethodSpec::new("waitForEvent")
                .describe("Blocks until an event with the supplied name occurs.")
                .param(ParamSpec::new("eventName", ParamType::String))
                .param(
                    ParamSpec::new("timeout", ParamType::Int)
                        .describe("the maximum time to wait (in ms)")
                        .optional(),
                )
                .returns(ParamType::Map, "Map of event properties, or null on timeout.")
                .deprecated("eventWaitFor", "r4"),
            EventFacade::event_wait_for,
        )
        .method(
            MethodSpec::new("receiveEvent")
                .describe("Returns and removes the oldest event from the event buffer.")
                .returns(ParamType::Map, "Map of event properties.")
                .deprecated("eventPoll", "r4"),
            EventFacade::receive_event,
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Arg, MethodRegistry};
    use serde_json::{Value, json};

    fn facade() -> Arc<EventFacade> {
        Arc::new(EventFacade::new(EventQueue::new(16)))
    }

    fn post_args(name: &str, data: Value, enqueue: bool) -> Args {
        Args::new(vec![Arg::Str(name.into()), Arg::Any(data), Arg::Bool(enqueue)])
    }

    #[tokio::test]
    async fn post_then_poll() {
        let f = facade();
        f.clone().event_post(post_args("a", json!(1), true)).await.unwrap();
        f.clone().event_post(post_args("b", json!(2), true)).await.unwrap();

        let polled = f.clone().event_poll(Args::new(vec![Arg::Int(5)])).await.unwrap();
        let names: Vec<_> = polled.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(polled[1].data, json!(2));
    }

    #[tokio::test]
    async fn post_without_enqueue_skips_buffer() {
        let f = facade();
        f.clone().event_post(post_args("a", Value::Null, false)).await.unwrap();
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_with_null() {
        let f = facade();
        let event = f.event_wait(Args::new(vec![Arg::Int(10)])).await.unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn negative_arguments_are_rejected() {
        let f = facade();
        assert!(f.clone().event_wait(Args::new(vec![Arg::Int(-5)])).await.is_err());
        assert!(f.event_poll(Args::new(vec![Arg::Int(-1)])).await.is_err());
    }

    #[tokio::test]
    async fn wait_returns_event_posted_without_enqueue() {
        let f = facade();
        let poster = f.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            poster.event_post(post_args("flash", json!("on"), false)).await.unwrap();
        });

        let event = f.clone().event_wait(Args::new(vec![Arg::Int(2000)])).await.unwrap();
        assert_eq!(event.unwrap().data, json!("on"));
        assert!(f.queue.is_empty());
    }

    #[test]
    fn legacy_aliases_are_registered_as_deprecated() {
        let registry = MethodRegistry::from_types(&[receiver_type()]).unwrap();
        for (legacy, replacement) in [
            ("postEvent", "eventPost"),
            ("receiveEvent", "eventPoll"),
            ("waitForEvent", "eventWaitFor"),
        ] {
            let method = registry.resolve(legacy).unwrap();
            assert_eq!(method.deprecation().unwrap().replaced_by, replacement);
        }
    }

    #[tokio::test]
    async fn receive_event_pops_one() {
        let f = facade();
        f.queue.post("x", Value::Null);
        f.queue.post("y", Value::Null);
        let event = f.clone().receive_event(Args::new(vec![])).await.unwrap().unwrap();
        assert_eq!(event.name, "x");
        assert_eq!(f.queue.len(), 1);
    }
}
