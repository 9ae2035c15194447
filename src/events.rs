//! Progress events emitted by the iteration controller.
//!
//! Emission is best-effort: [`Emitter`] swallows sink errors and panics after
//! logging them, so a broken sink never stops a run.
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

pub const BRIEF_LOADED: &str = "brief_loaded";
pub const CAPABILITIES_DISCOVERED: &str = "capabilities_discovered";
pub const ITERATION_START: &str = "iteration_start";
pub const ITERATION_COMPLETE: &str = "iteration_complete";
pub const ITERATION_TIMEOUT: &str = "iteration_timeout";
pub const INVALID_GRAPH_RESULT: &str = "invalid_graph_result";
pub const HUMAN_APPROVAL_REQUESTED: &str = "human_approval_requested";
pub const LOOP_COMPLETE: &str = "loop_complete";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, data: &Value) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &str, _data: &Value) -> Result<()> {
        Ok(())
    }
}

type Callback = dyn Fn(&str, &Value) + Send + Sync;

/// Forwards events to a closure.
pub struct CallbackSink {
    callback: Box<Callback>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl EventSink for CallbackSink {
    fn emit(&self, event: &str, data: &Value) -> Result<()> {
        (self.callback)(event, data);
        Ok(())
    }
}

/// Delivers every event to each inner sink; one failing sink does not starve
/// the others.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &str, data: &Value) -> Result<()> {
        for sink in &self.sinks {
            deliver(sink.as_ref(), event, data);
        }
        Ok(())
    }
}

/// Human-readable progress lines on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn render(event: &str, data: &Value) -> Option<String> {
        let num = |key: &str| data.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let int = |key: &str| data.get(key).and_then(Value::as_u64).unwrap_or(0);
        let line = match event {
            BRIEF_LOADED => format!(
                "Brief loaded: {}",
                data.get("task").and_then(Value::as_str).unwrap_or_default()
            ),
            CAPABILITIES_DISCOVERED => format!(
                "Capabilities: {}",
                data.get("capabilities")
                    .and_then(Value::as_array)
                    .map(|names| names
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", "))
                    .unwrap_or_default()
            ),
            ITERATION_START => format!(
                "Iteration {}/{} started",
                int("iteration"),
                int("max_iterations")
            ),
            ITERATION_COMPLETE => format!(
                "Iteration {} complete: score {:.2} ({}), {} asset(s), best {:.2}",
                int("iteration"),
                num("score"),
                if data.get("passed").and_then(Value::as_bool).unwrap_or(false) {
                    "pass"
                } else {
                    "revise"
                },
                int("assets"),
                num("best_score")
            ),
            ITERATION_TIMEOUT => format!(
                "Iteration {} timed out after {}s",
                int("iteration"),
                int("timeout_secs")
            ),
            INVALID_GRAPH_RESULT => format!(
                "Iteration {} produced no usable result: {}",
                int("iteration"),
                data.get("error").and_then(Value::as_str).unwrap_or_default()
            ),
            HUMAN_APPROVAL_REQUESTED => format!(
                "Iteration {} awaiting human approval (score {:.2})",
                int("iteration"),
                num("score")
            ),
            LOOP_COMPLETE => format!(
                "Done after {} iteration(s): best score {:.2} at iteration {}, {} asset(s)",
                int("iterations"),
                num("best_score"),
                int("best_iteration"),
                int("total_assets")
            ),
            _ => return None,
        };
        Some(line)
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: &str, data: &Value) -> Result<()> {
        if let Some(line) = Self::render(event, data) {
            println!("{line}");
        }
        Ok(())
    }
}

fn deliver(sink: &dyn EventSink, event: &str, data: &Value) {
    match catch_unwind(AssertUnwindSafe(|| sink.emit(event, data))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(event, error = %err, "event sink failed"),
        Err(_) => tracing::warn!(event, "event sink panicked"),
    }
}

/// Best-effort handle the pipeline emits through.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn emit(&self, event: &str, data: Value) {
        tracing::debug!(event, "progress event");
        deliver(self.sink.as_ref(), event, &data);
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::disabled()
    }
}
