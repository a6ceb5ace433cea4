//! Slave selection criteria
//!
//! Every criterion reduces a candidate to one number; the smallest wins and
//! ties go to the candidate listed first.

use std::sync::Arc;

use crate::config::SelectCriteria;
use crate::health::Server;

/// Anything that can be ranked by the server it talks to
pub trait Rankable {
    fn server(&self) -> &Server;

    fn metric(&self, criteria: SelectCriteria) -> u64 {
        let server = self.server();
        match criteria {
            SelectCriteria::LeastGlobalConnections => server.global_connections() as u64,
            SelectCriteria::LeastRouterConnections => server.router_connections() as u64,
            // Unknown lag ranks behind any known lag
            SelectCriteria::LeastBehindMaster => server.replication_lag().unwrap_or(u64::MAX),
            SelectCriteria::LeastCurrentOperations => server.current_operations() as u64,
        }
    }
}

impl Rankable for Server {
    fn server(&self) -> &Server {
        self
    }
}

impl Rankable for Arc<Server> {
    fn server(&self) -> &Server {
        self
    }
}

impl<T: Rankable + ?Sized> Rankable for &T {
    fn server(&self) -> &Server {
        (**self).server()
    }
}

/// Index of the best candidate, earliest on ties
pub fn select_best<T: Rankable>(criteria: SelectCriteria, candidates: &[T]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let metric = candidate.metric(criteria);
        if best.map_or(true, |(_, current)| metric < current) {
            best = Some((index, metric));
        }
    }
    best.map(|(index, _)| index)
}

/// Candidate indexes from best to worst, stable on ties
pub fn rank<T: Rankable>(criteria: SelectCriteria, candidates: &[T]) -> Vec<usize> {
    let mut order: Vec<(usize, u64)> = candidates
        .iter()
        .enumerate()
        .map(|(index, c)| (index, c.metric(criteria)))
        .collect();
    order.sort_by_key(|(_, metric)| *metric);
    order.into_iter().map(|(index, _)| index).collect()
}
