/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::Subscriber;
use tracing_core::event::Event;
use tracing_core::metadata::Metadata;
use tracing_core::span::{Attributes, Current, Id, Record};
use tracing_core::{Interest, Level, LevelFilter};
use tracing_serde::AsSerde;

/// A subscriber that keeps every span and event of the current thread as
/// JSON, for tests that check what was recorded.
///
/// Install it with `tracing::subscriber::with_default`.
#[derive(Debug, Clone)]
pub struct TracingSubscriber {}

thread_local!(
    static SPAN_METADATA: RefCell<HashMap<u64, &'static Metadata<'static>>> =
        RefCell::new(HashMap::new());
    static SPANS: RefCell<HashMap<u64, Value>> = RefCell::new(HashMap::new());
    static EVENTS: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
    static LEVEL_FILTER: RefCell<LevelFilter> = const { RefCell::new(LevelFilter::OFF) };
    static NEXT_ID: RefCell<u64> = const { RefCell::new(1) };
    static SPAN_STACK: RefCell<Vec<Id>> = const { RefCell::new(Vec::new()) };
);

impl TracingSubscriber {
    /// Capture spans and events at `trace_level` and above on this thread
    pub fn new(trace_level: Level) -> Self {
        LEVEL_FILTER.with(|level_filter| *level_filter.borrow_mut() = trace_level.into());
        Self {}
    }

    /// The attributes of every captured span called `name`, including the
    /// values recorded on it later
    pub fn spans_named(&self, name: &str) -> Vec<Value> {
        SPANS.with(|spans| {
            spans
                .borrow()
                .values()
                .filter(|span| span["attributes"]["metadata"]["name"] == name)
                .map(|span| span["attributes"].clone())
                .collect()
        })
    }

    pub fn get_events(&self) -> Vec<Value> {
        EVENTS.with(|events| events.borrow().clone())
    }

    pub fn clear(&self) {
        SPANS.with(|spans| spans.borrow_mut().clear());
        EVENTS.with(|events| events.borrow_mut().clear());
        SPAN_STACK.with(|span_stack| span_stack.borrow_mut().clear());
        SPAN_METADATA.with(|span_metadata| span_metadata.borrow_mut().clear());
        NEXT_ID.with(|next_id| *next_id.borrow_mut() = 1);
    }
}

impl Subscriber for TracingSubscriber {
    fn register_callsite(&self, _metadata: &'static Metadata<'static>) -> Interest {
        // the filter is per thread, so ask `enabled` every time
        Interest::sometimes()
    }

    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        LEVEL_FILTER.with(|level_filter| metadata.level() <= &*level_filter.borrow())
    }

    fn new_span(&self, span_attributes: &Attributes<'_>) -> Id {
        let span_id = NEXT_ID.with(|next_id| {
            let id = *next_id.borrow();
            *next_id.borrow_mut() += 1;
            id
        });
        let json = json!({
            "id": span_id,
            "attributes": span_attributes.as_serde(),
        });
        SPANS.with(|spans| {
            spans.borrow_mut().insert(span_id, json);
        });
        SPAN_METADATA.with(|span_metadata| {
            span_metadata
                .borrow_mut()
                .insert(span_id, span_attributes.metadata());
        });
        Id::from_u64(span_id)
    }

    fn record(&self, id: &Id, values: &Record<'_>) {
        let span_id = id.into_u64();
        let mut recorded = json!(values.as_serde());
        SPANS.with(|spans| {
            let mut spans = spans.borrow_mut();
            let attributes = spans
                .get_mut(&span_id)
                .and_then(|span| span.get_mut("attributes"))
                .and_then(Value::as_object_mut)
                .unwrap_or_else(|| panic!("Failed to get span with ID {}", span_id));
            if let Some(recorded) = recorded.as_object_mut() {
                attributes.append(recorded);
            }
        });
    }

    fn event(&self, event: &Event<'_>) {
        let json = json!({
            "event": event.as_serde(),
        });
        EVENTS.with(|events| {
            events.borrow_mut().push(json);
        });
    }

    fn current_span(&self) -> Current {
        SPAN_STACK.with(|span_stack| {
            let stack = span_stack.borrow();
            let Some(id) = stack.last() else {
                return Current::none();
            };
            SPAN_METADATA.with(|span_metadata| match span_metadata.borrow().get(&id.into_u64()) {
                Some(metadata) => Current::new(id.clone(), *metadata),
                None => Current::none(),
            })
        })
    }

    fn enter(&self, span: &Id) {
        SPAN_STACK.with(|span_stack| span_stack.borrow_mut().push(span.clone()));
    }

    fn exit(&self, span: &Id) {
        SPAN_STACK.with(|span_stack| {
            let popped = span_stack.borrow_mut().pop();
            assert_eq!(popped, Some(span.clone()));
        });
    }

    // We are not interested in this method for testing
    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}
}
