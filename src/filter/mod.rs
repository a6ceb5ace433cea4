//! Content filters between the client and the router
//!
//! A filter sees every statement before it is routed and every completed
//! reply before it reaches the client. Filters run inside the session so a
//! short-circuit reply keeps its place in statement order.

mod masking;

pub use masking::{MaskingError, MaskingFilter, MaskingRule};

use crate::classifier::QueryClassification;
use crate::protocol::Packet;

/// What a filter wants done with a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Continue,
    /// Answer the client with these packets instead of routing
    Respond(Vec<Packet>),
}

pub trait Filter: Send {
    fn route_query(&mut self, _packet: &Packet, _classification: &QueryClassification) -> FilterVerdict {
        FilterVerdict::Continue
    }

    /// Rewrite a complete reply in place
    fn client_reply(&mut self, _reply: &mut [Packet]) {}
}

/// Filters of one session, applied in order
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The first filter that responds stops the chain
    pub fn route_query(&mut self, packet: &Packet, classification: &QueryClassification) -> FilterVerdict {
        for filter in &mut self.filters {
            if let verdict @ FilterVerdict::Respond(_) = filter.route_query(packet, classification) {
                return verdict;
            }
        }
        FilterVerdict::Continue
    }

    /// Replies pass the filters in reverse order
    pub fn client_reply(&mut self, reply: &mut [Packet]) {
        for filter in self.filters.iter_mut().rev() {
            filter.client_reply(reply);
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain").field("filters", &self.filters.len()).finish()
    }
}
