//! Per-agent solve statistics shared by all cluster workers.
//!
//! Workers only ever append; each append takes the lock for a single push.

use crate::avoidance::Regime;
use crate::error::SolveError;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolveStatus {
    Solved,
    Infeasible,
    NumericalFailure,
}

impl From<&SolveError> for SolveStatus {
    fn from(err: &SolveError) -> Self {
        match err {
            SolveError::Infeasible => SolveStatus::Infeasible,
            SolveError::NumericalFailure(_) => SolveStatus::NumericalFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolveRecord {
    pub cycle: u64,
    pub agent_id: usize,
    pub status: SolveStatus,
    /// Objective value, absent when the solve failed.
    pub cost: Option<f64>,
    pub solve_time_ms: f64,
    pub regime: Regime,
    pub neighbors: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatsSummary {
    pub solves: usize,
    pub failures: usize,
    pub mean_solve_time_ms: f64,
    pub std_solve_time_ms: f64,
    pub max_solve_time_ms: f64,
}

#[derive(Debug, Default)]
pub struct StatsSink {
    records: Mutex<Vec<SolveRecord>>,
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: SolveRecord) {
        self.records.lock().push(record);
    }

    /// Snapshot of everything recorded so far, in arrival order.
    pub fn records(&self) -> Vec<SolveRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn summary(&self) -> StatsSummary {
        let records = self.records.lock();
        if records.is_empty() {
            return StatsSummary::default();
        }

        let count = records.len() as f64;
        let mean = records.iter().map(|r| r.solve_time_ms).sum::<f64>() / count;
        let variance = records
            .iter()
            .map(|r| (r.solve_time_ms - mean).powi(2))
            .sum::<f64>()
            / count;

        StatsSummary {
            solves: records.len(),
            failures: records
                .iter()
                .filter(|r| r.status != SolveStatus::Solved)
                .count(),
            mean_solve_time_ms: mean,
            std_solve_time_ms: variance.sqrt(),
            max_solve_time_ms: records
                .iter()
                .map(|r| r.solve_time_ms)
                .fold(0.0, f64::max),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let records = self.records.lock();
        serde_json::to_string_pretty(&*records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(agent_id: usize, status: SolveStatus, solve_time_ms: f64) -> SolveRecord {
        SolveRecord {
            cycle: 0,
            agent_id,
            status,
            cost: (status == SolveStatus::Solved).then_some(1.0),
            solve_time_ms,
            regime: Regime::Free,
            neighbors: 0,
        }
    }

    #[test]
    fn test_empty_summary() {
        let sink = StatsSink::new();
        assert!(sink.is_empty());
        assert_eq!(sink.summary(), StatsSummary::default());
    }

    #[test]
    fn test_summary_statistics() {
        let sink = StatsSink::new();
        sink.record(record(0, SolveStatus::Solved, 1.0));
        sink.record(record(1, SolveStatus::Infeasible, 3.0));
        sink.record(record(2, SolveStatus::NumericalFailure, 2.0));

        let summary = sink.summary();
        assert_eq!(summary.solves, 3);
        assert_eq!(summary.failures, 2);
        assert_relative_eq!(summary.mean_solve_time_ms, 2.0);
        assert_relative_eq!(summary.std_solve_time_ms, (2.0f64 / 3.0).sqrt());
        assert_relative_eq!(summary.max_solve_time_ms, 3.0);
    }

    #[test]
    fn test_status_from_error() {
        assert_eq!(SolveStatus::from(&SolveError::Infeasible), SolveStatus::Infeasible);
        assert_eq!(
            SolveStatus::from(&SolveError::NumericalFailure("nan".into())),
            SolveStatus::NumericalFailure
        );
    }

    #[test]
    fn test_concurrent_appends() {
        let sink = StatsSink::new();
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let sink = &sink;
                scope.spawn(move || {
                    for i in 0..25 {
                        sink.record(record(worker * 25 + i, SolveStatus::Solved, 0.5));
                    }
                });
            }
        });
        let mut ids: Vec<usize> = sink.records().iter().map(|r| r.agent_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_to_json() {
        let sink = StatsSink::new();
        sink.record(record(7, SolveStatus::Infeasible, 0.25));
        let json = sink.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["agent_id"], 7);
        assert_eq!(parsed[0]["status"], "Infeasible");
        assert!(parsed[0]["cost"].is_null());
        assert_eq!(parsed[0]["regime"], "Free");

        sink.clear();
        assert!(sink.is_empty());
    }
}
