//! Streaming relay: one agent's events onto one client channel.
//!
//! A relay subscribes to the stream, completed and failed events of the
//! shared [`EventBus`], keeps those tagged with its agent id, and writes
//! frames through a single [`FrameWriter`]. It ends on the first of
//!
//! - a completed or failed event for its agent,
//! - the execution call resolving (an error, or success with no terminal event),
//! - the client going away.
//!
//! Filtering is by agent id only. Two concurrent streams against the same
//! agent see each other's events, and the first terminal event ends both.

use std::{fmt::Display, future::Future, sync::Arc};

use agent_jobs_core::{AgentEvent, AgentEventPayload, EventBus, EventKind, SubscriptionSet};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::RelayFrame;

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A completed frame was sent.
    Completed,
    /// A failed event was forwarded as an error frame.
    Failed,
    /// The execution call itself returned an error.
    Rejected,
    /// The client closed the channel first.
    Disconnected,
}

/// Sole writer to a client channel. Refuses writes once closed.
pub struct FrameWriter {
    tx: Option<mpsc::UnboundedSender<RelayFrame>>,
}

impl FrameWriter {
    /// Writer plus the receiving end handed to the transport.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Write a frame. Returns `false` if the channel is closed.
    pub fn send(&mut self, frame: RelayFrame) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.send(frame).is_ok() {
            true
        } else {
            self.tx = None;
            false
        }
    }

    /// Release the channel; the receiver sees end of stream.
    pub fn close(&mut self) {
        self.tx = None;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::UnboundedSender::is_closed)
    }

    /// Resolves once the receiving side is dropped or the writer is closed.
    async fn receiver_gone(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }
}

/// Relay for one agent and one client channel.
pub struct StreamRelay {
    agent_id: String,
    subscriptions: SubscriptionSet,
    writer: FrameWriter,
    accumulated: String,
}

impl StreamRelay {
    /// Subscribe to the bus and send the `connected` frame.
    ///
    /// Call before starting the execution so no event is missed.
    #[must_use]
    pub fn attach(agent_id: impl Into<String>, bus: &Arc<EventBus>, mut writer: FrameWriter) -> Self {
        let agent_id = agent_id.into();
        let subscriptions = bus.subscribe_all(&EventKind::ALL);
        writer.send(RelayFrame::connected(agent_id.clone()));
        tracing::debug!(agent_id = %agent_id, subscriptions = ?subscriptions.ids(), "relay attached");
        Self {
            agent_id,
            subscriptions,
            writer,
            accumulated: String::new(),
        }
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Forward events until the relay ends.
    ///
    /// `execution` is the engine call started after [`StreamRelay::attach`].
    pub async fn run<F, E>(mut self, execution: F) -> RelayOutcome
    where
        F: Future<Output = Result<Value, E>>,
        E: Display,
    {
        tokio::pin!(execution);

        loop {
            tokio::select! {
                biased;

                () = self.writer.receiver_gone() => {
                    tracing::debug!(agent_id = %self.agent_id, "client disconnected");
                    self.teardown();
                    return RelayOutcome::Disconnected;
                }

                event = self.subscriptions.recv() => {
                    let Some(event) = event else {
                        return self.finish(RelayFrame::error("event source closed"), RelayOutcome::Rejected);
                    };
                    if let Some(outcome) = self.handle_event(event) {
                        return outcome;
                    }
                }

                result = &mut execution => {
                    // Events published before the call returned are already queued.
                    while let Some(event) = self.subscriptions.try_recv() {
                        if let Some(outcome) = self.handle_event(event) {
                            return outcome;
                        }
                    }
                    return match result {
                        Ok(value) => self.finish(RelayFrame::completed(value), RelayOutcome::Completed),
                        Err(e) => self.finish(RelayFrame::error(e.to_string()), RelayOutcome::Rejected),
                    };
                }
            }
        }
    }

    fn handle_event(&mut self, event: AgentEvent) -> Option<RelayOutcome> {
        if event.agent_id != self.agent_id {
            return None;
        }
        match event.payload {
            AgentEventPayload::Stream { content } => {
                self.accumulated.push_str(&content);
                let frame = RelayFrame::stream(content, self.accumulated.clone());
                if self.writer.send(frame) {
                    None
                } else {
                    self.teardown();
                    Some(RelayOutcome::Disconnected)
                }
            }
            AgentEventPayload::Completed { result } => {
                Some(self.finish(RelayFrame::completed(result), RelayOutcome::Completed))
            }
            AgentEventPayload::Failed { error } => {
                Some(self.finish(RelayFrame::error(error), RelayOutcome::Failed))
            }
        }
    }

    /// Send the terminal frame and the sentinel, then tear down.
    fn finish(&mut self, frame: RelayFrame, outcome: RelayOutcome) -> RelayOutcome {
        let delivered = self.writer.send(frame) && self.writer.send(RelayFrame::Done);
        self.teardown();
        if delivered {
            tracing::debug!(agent_id = %self.agent_id, ?outcome, "relay finished");
            outcome
        } else {
            RelayOutcome::Disconnected
        }
    }

    /// Close the writer and drop all subscriptions. Safe to repeat.
    fn teardown(&mut self) {
        self.writer.close();
        self.subscriptions.release();
    }
}
