//! Console rendering of inbound envelopes and the client-side half of tool
//! calls.
//!
//! The controller owns the handler, so the handler holds no controller
//! handle of its own: replies go through an outbox drained by a task in
//! `main`. The handler never waits on a reply being written, and inbound
//! envelopes keep flowing while a completion is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voxagent_core::{
    protocol::{AgentStatus, FunctionCall, OutputItem},
    Envelope, EnvelopeHandler,
};

/// Reply to a backend function call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub call_id: String,
    pub output: String,
}

pub type Outbox = mpsc::UnboundedSender<Reply>;

/// What the client knows about one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub name: String,
    pub last_status: String,
    /// A final (non progress) completion was sent for this call.
    pub completed: bool,
    pub updates: usize,
}

/// Every `call_id` seen this run, keyed by id.
#[derive(Default)]
pub struct CallLedger {
    calls: Mutex<HashMap<String, CallRecord>>,
}

impl CallLedger {
    fn open(&self, call: &FunctionCall) {
        self.calls.lock().insert(
            call.call_id.clone(),
            CallRecord {
                name: call.name.clone(),
                last_status: "requested".into(),
                completed: false,
                updates: 0,
            },
        );
    }

    fn update(&self, agent: &AgentStatus) {
        let mut calls = self.calls.lock();
        let record = calls
            .entry(agent.call_id.clone())
            .or_insert_with(|| CallRecord {
                name: agent.name.clone(),
                last_status: String::new(),
                completed: false,
                updates: 0,
            });
        record.last_status = agent.status.clone();
        record.updates += 1;
    }

    fn complete(&self, call_id: &str) {
        if let Some(record) = self.calls.lock().get_mut(call_id) {
            record.completed = true;
        }
    }

    /// Every call seen so far, ordered by `call_id`.
    pub fn records(&self) -> Vec<(String, CallRecord)> {
        let mut records: Vec<_> = self
            .calls
            .lock()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    /// Calls still waiting on a final completion.
    pub fn pending(&self) -> usize {
        self.calls.lock().values().filter(|r| !r.completed).count()
    }
}

pub fn in_progress_reply(call: &FunctionCall) -> String {
    format!(
        "The {} call is in progress. Continue the conversation until it completes.",
        call.name
    )
}

pub fn failure_reply(agent: &AgentStatus) -> String {
    format!(
        "The {} has failed. Let the user know there may be issues with this agent \
         and offer to help in any other way available.",
        agent.name
    )
}

pub fn image_reply(description: &str, size: &str, quality: &str, user: &str) -> String {
    format!(
        "Generated image as described by {description}. It is {size} and {quality}. \
         It has been saved and is currently being displayed to {user}."
    )
}

pub struct AppHandler {
    outbox: Outbox,
    ledger: Arc<CallLedger>,
    /// Display name used in replies about generated media.
    user: String,
}

impl AppHandler {
    pub fn new(outbox: Outbox, ledger: Arc<CallLedger>, user: impl Into<String>) -> Self {
        Self {
            outbox,
            ledger,
            user: user.into(),
        }
    }

    fn reply(&self, call_id: &str, output: String) {
        let reply = Reply {
            call_id: call_id.to_string(),
            output,
        };
        if self.outbox.send(reply).is_err() {
            warn!(call_id, "reply dropped: outbox closed");
        }
    }

    fn on_function(&self, call: &FunctionCall) {
        println!("[function] {} ({})", call.name, call.call_id);
        self.ledger.open(call);
        self.reply(&call.call_id, in_progress_reply(call));
    }

    fn on_agent(&self, agent: &AgentStatus) {
        println!("[agent] {}: {}", agent.name, agent.status);
        if let Some(information) = agent.information.as_deref().filter(|i| !i.is_empty()) {
            println!("        {information}");
        }
        self.ledger.update(agent);

        if agent.is_failed() {
            info!(call_id = %agent.call_id, name = %agent.name, "agent failed");
            self.ledger.complete(&agent.call_id);
            self.reply(&agent.call_id, failure_reply(agent));
            return;
        }
        if !agent.output {
            return;
        }
        let Some(content) = &agent.content else {
            return;
        };
        let items = content.output_items();
        if items.is_empty() {
            debug!(call_id = %agent.call_id, "agent output carries no text or image items");
            return;
        }
        self.ledger.complete(&agent.call_id);
        for item in items {
            let output = match item {
                OutputItem::Text(text) => text.to_string(),
                OutputItem::Image {
                    description,
                    size,
                    quality,
                } => {
                    println!("        [image] {description} ({size}, {quality})");
                    image_reply(&description, &size, &quality, &self.user)
                }
            };
            self.reply(&agent.call_id, output);
        }
    }
}

#[async_trait]
impl EnvelopeHandler for AppHandler {
    async fn handle(&self, envelope: Envelope) {
        match &envelope {
            Envelope::Message(message) => {
                if !message.content.is_empty() {
                    println!("[{:?}] {}", message.role, message.content);
                }
            }
            Envelope::Function(call) => self.on_function(call),
            Envelope::Agent(agent) => self.on_agent(agent),
            Envelope::Console(console) => {
                println!("[console] {}", serde_json::Value::Object(console.payload.clone()));
            }
            Envelope::Error(error) => {
                println!("[error] {} {}", error.message, error.error);
            }
            other => debug!(kind = %other.kind(), id = other.id(), "envelope ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn handler() -> (AppHandler, mpsc::UnboundedReceiver<Reply>, Arc<CallLedger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(CallLedger::default());
        (AppHandler::new(tx, Arc::clone(&ledger), "Ada"), rx, ledger)
    }

    fn record(ledger: &CallLedger, call_id: &str) -> CallRecord {
        ledger
            .records()
            .into_iter()
            .find(|(id, _)| id == call_id)
            .map(|(_, record)| record)
            .expect("call tracked")
    }

    fn decode(value: serde_json::Value) -> Envelope {
        Envelope::decode(&value.to_string()).unwrap()
    }

    #[tokio::test]
    async fn function_call_gets_an_in_progress_reply() {
        let (handler, mut rx, ledger) = handler();
        handler
            .handle(decode(json!({
                "type": "function", "id": "f1", "call_id": "call-1",
                "name": "research", "arguments": {"query": "rust"}
            })))
            .await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.call_id, "call-1");
        assert!(reply.output.contains("in progress"));
        let record = record(&ledger, "call-1");
        assert_eq!(record.name, "research");
        assert!(!record.completed);
        assert_eq!(ledger.pending(), 1);
    }

    #[tokio::test]
    async fn failed_agent_gets_a_failure_reply() {
        let (handler, mut rx, ledger) = handler();
        handler
            .handle(decode(json!({
                "type": "agent", "id": "a1", "call_id": "call-2",
                "name": "Writer Agent", "status": "Run Failed"
            })))
            .await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.call_id, "call-2");
        assert!(reply.output.starts_with("The Writer Agent has failed"));
        assert!(record(&ledger, "call-2").completed);
    }

    #[tokio::test]
    async fn agent_output_text_items_are_sent_back() {
        let (handler, mut rx, ledger) = handler();
        handler
            .handle(decode(json!({
                "type": "function", "id": "f1", "call_id": "call-3",
                "name": "research", "arguments": {}
            })))
            .await;
        let _progress = rx.try_recv().unwrap();

        handler
            .handle(decode(json!({
                "type": "agent", "id": "a2", "call_id": "call-3", "name": "Research",
                "status": "completed", "output": true,
                "content": {"type": "text", "content": [
                    {"type": "text", "value": "first"},
                    {"type": "image", "image_url": "x.png"},
                    {"type": "text", "value": "second"}
                ]}
            })))
            .await;

        let outputs: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.output)
            .collect();
        assert_eq!(outputs, ["first", "second"]);
        let record = record(&ledger, "call-3");
        assert!(record.completed);
        assert_eq!(record.last_status, "completed");
        assert_eq!(ledger.pending(), 0);
    }

    #[tokio::test]
    async fn image_output_is_described_back_to_the_agent() {
        let (handler, mut rx, ledger) = handler();
        handler
            .handle(decode(json!({
                "type": "agent", "id": "a3", "call_id": "call-5", "name": "Designer",
                "status": "completed", "output": true,
                "content": {"type": "image", "content": [{
                    "type": "image", "image_url": "images/fox.png",
                    "description": "a red fox in snow", "size": "1024x1024", "quality": "hd"
                }]}
            })))
            .await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.call_id, "call-5");
        assert_eq!(
            reply.output,
            "Generated image as described by a red fox in snow. It is 1024x1024 and hd. \
             It has been saved and is currently being displayed to Ada."
        );
        assert!(rx.try_recv().is_err());
        assert!(record(&ledger, "call-5").completed);
        assert_eq!(ledger.pending(), 0);
    }

    #[tokio::test]
    async fn progress_updates_only_touch_the_ledger() {
        let (handler, mut rx, ledger) = handler();
        for status in ["step 1", "step 2"] {
            handler
                .handle(decode(json!({
                    "type": "agent", "id": "a", "call_id": "call-4",
                    "name": "Research", "status": status, "output": null,
                    "information": null
                })))
                .await;
        }
        handler
            .handle(decode(json!({
                "type": "message", "id": "m", "role": "assistant", "content": "ok"
            })))
            .await;

        assert!(rx.try_recv().is_err());
        let record = record(&ledger, "call-4");
        assert_eq!(record.updates, 2);
        assert_eq!(record.last_status, "step 2");
        assert_eq!(ledger.records().len(), 1);
    }
}
