//! Named periodic timers that post events into the session queue.
//!
//! Each timer is a background task. It posts an event named after the timer
//! with `{"tick": n}` data every period until stopped or the session ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::ensure;
use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::rpc::{Args, EventQueue, MethodSpec, ParamSpec, ParamType, Receiver, ReceiverType};

pub const NAME: &str = "TimerFacade";

pub struct TimerFacade {
    queue: EventQueue,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[async_trait]
impl Receiver for TimerFacade {
    async fn shutdown(&self) -> anyhow::Result<()> {
        let timers: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (name, handle) in timers {
            handle.abort();
            debug!(timer = %name, "Timer stopped at shutdown");
        }
        Ok(())
    }
}

impl TimerFacade {
    pub fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a timer. Returns false if one with this name is already running.
    pub fn start(&self, name: &str, period: Duration) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers.get(name).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let queue = self.queue.clone();
        let event_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                tick += 1;
                queue.post(event_name.clone(), json!({ "tick": tick }));
            }
        });
        timers.insert(name.to_string(), handle);
        true
    }

    /// Stop a timer. Returns false if no such timer was running.
    pub fn stop(&self, name: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    async fn timer_start(self: Arc<Self>, args: Args) -> anyhow::Result<bool> {
        let period = args.int(1)?;
        ensure!(period > 0, "period_ms must be positive, got {}", period);
        Ok(self.start(args.str(0)?, Duration::from_millis(period as u64)))
    }

    async fn timer_stop(self: Arc<Self>, args: Args) -> anyhow::Result<bool> {
        Ok(self.stop(args.str(0)?))
    }

    async fn timer_list(self: Arc<Self>, _args: Args) -> anyhow::Result<Vec<String>> {
        Ok(self.names())
    }
}

pub fn receiver_type() -> ReceiverType {
    ReceiverType::builder(NAME, |ctx| Ok(TimerFacade::new(ctx.events().clone())))
        .method(
            MethodSpec::new("timerStart")
                .describe("Starts a named periodic timer.")
                .param(ParamSpec::new("name", ParamType::String))
                .param(
                    ParamSpec::new("period_ms", ParamType::Int)
                        .describe("milliseconds between events")
                        .default_value("1000"),
                )
                .returns(ParamType::Bool, "False if the timer was already running.")
                .starts_event("<name>"),
            TimerFacade::timer_start,
        )
        .method(
            MethodSpec::new("timerStop")
                .describe("Stops a named timer.")
                .param(ParamSpec::new("name", ParamType::String))
                .returns(ParamType::Bool, "False if no such timer was running."),
            TimerFacade::timer_stop,
        )
        .method(
            MethodSpec::new("timerList")
                .describe("Lists running timers.")
                .returns(ParamType::list_of(ParamType::String), "Timer names, sorted."),
            TimerFacade::timer_list,
        )
        .build()
}
