//! Synchronous in-process event bus.
//!
//! Publishing an event stamps it with the next sequence number, records it in
//! the timeline and delivers it to every subscribed agent in registration
//! order. Events an agent returns are dispatched depth-first, each one fully,
//! before the next subscriber sees the original event.

use thiserror::Error;
use tracing::{debug, trace};

use crate::agents::{Agent, AgentContext, AgentError, WILDCARD};
use crate::domain::{Event, EventKind};

/// Default bound on nested dispatch
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Agent '{agent}' failed handling {event_type} (seq {seq}): {source}")]
    Agent {
        agent: String,
        event_type: &'static str,
        seq: u64,
        #[source]
        source: AgentError,
    },

    #[error("Event cascade exceeded depth {limit} at {event_type}")]
    CascadeTooDeep { limit: usize, event_type: &'static str },

    #[error("No registered agent named '{0}'")]
    UnknownAgent(String),

    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("Invalid subscription pattern '{0}'")]
    InvalidPattern(String),
}

struct Subscription {
    pattern: String,
    agent: usize,
}

impl Subscription {
    fn matches(&self, event_type: &str) -> bool {
        self.pattern == WILDCARD || self.pattern == event_type
    }
}

pub struct EventBus {
    agents: Vec<Box<dyn Agent>>,
    subscriptions: Vec<Subscription>,
    history: Vec<Event>,
    next_seq: u64,
    max_cascade_depth: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_CASCADE_DEPTH)
    }

    pub fn with_max_depth(max_cascade_depth: usize) -> Self {
        Self {
            agents: Vec::new(),
            subscriptions: Vec::new(),
            history: Vec::new(),
            next_seq: 1,
            max_cascade_depth,
        }
    }

    /// Add an agent and subscribe it to its declared patterns
    pub fn register(&mut self, agent: Box<dyn Agent>) -> Result<(), DispatchError> {
        let name = agent.name().to_string();
        if self.agents.iter().any(|a| a.name() == name) {
            return Err(DispatchError::DuplicateAgent(name));
        }

        let patterns = agent.subscriptions();
        self.agents.push(agent);
        for pattern in patterns {
            self.subscribe(&pattern, &name)?;
        }
        debug!(agent = %name, "Registered agent");
        Ok(())
    }

    /// Subscribe a registered agent to an exact event type or `*`
    pub fn subscribe(&mut self, pattern: &str, agent: &str) -> Result<(), DispatchError> {
        if pattern.is_empty() || (pattern != WILDCARD && pattern.contains('*')) {
            return Err(DispatchError::InvalidPattern(pattern.to_string()));
        }
        let index = self
            .agents
            .iter()
            .position(|a| a.name() == agent)
            .ok_or_else(|| DispatchError::UnknownAgent(agent.to_string()))?;

        self.subscriptions.push(Subscription {
            pattern: pattern.to_string(),
            agent: index,
        });
        Ok(())
    }

    /// Publish an event on behalf of `source` and dispatch the full cascade
    pub fn publish(
        &mut self,
        source: &str,
        kind: EventKind,
        ctx: &AgentContext<'_>,
    ) -> Result<(), DispatchError> {
        self.dispatch(source.to_string(), kind, ctx, 0)
    }

    fn dispatch(
        &mut self,
        source: String,
        kind: EventKind,
        ctx: &AgentContext<'_>,
        depth: usize,
    ) -> Result<(), DispatchError> {
        if depth > self.max_cascade_depth {
            return Err(DispatchError::CascadeTooDeep {
                limit: self.max_cascade_depth,
                event_type: kind.event_type(),
            });
        }

        let event = Event {
            seq: self.next_seq,
            timestamp: ctx.now,
            source_agent: source,
            kind,
        };
        self.next_seq += 1;
        trace!(seq = event.seq, event_type = event.event_type(), source = %event.source_agent, "Publish");
        self.history.push(event.clone());

        // Each agent receives an event once, at its earliest matching subscription
        let mut targets: Vec<usize> = Vec::new();
        for subscription in &self.subscriptions {
            if subscription.matches(event.event_type()) && !targets.contains(&subscription.agent) {
                targets.push(subscription.agent);
            }
        }

        for index in targets {
            let agent = &mut self.agents[index];
            let outbound = agent
                .handle(&event, ctx)
                .map_err(|source| DispatchError::Agent {
                    agent: agent.name().to_string(),
                    event_type: event.event_type(),
                    seq: event.seq,
                    source,
                })?;
            if outbound.is_empty() {
                continue;
            }

            let name = agent.name().to_string();
            for next in outbound {
                self.dispatch(name.clone(), next, ctx, depth + 1)?;
            }
        }

        Ok(())
    }

    /// Every event published so far, in order
    pub fn history(&self) -> &[Event] {
        &self.history
    }

    pub fn into_history(self) -> Vec<Event> {
        self.history
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }
}
