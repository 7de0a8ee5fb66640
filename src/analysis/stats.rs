use serde::{Deserialize, Serialize};

use crate::report::{success_rate, TestStatus};
use crate::storage::ExecutionRecord;

/// Split-half delta (percentage points) beyond which a test counts as moving.
pub const TREND_THRESHOLD_PCT: f64 = 5.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pass_rate: f64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// Nearest-rank percentile of an ascending slice: index `ceil(pct/100 * n) - 1`.
/// Integer arithmetic avoids float rounding at exact ranks. Empty input gives 0.
pub fn percentile_nearest_rank(sorted: &[u64], pct: u32) -> u64 {
    let n = sorted.len() as u64;
    if n == 0 {
        return 0;
    }
    let rank = (pct as u64 * n).div_ceil(100).max(1);
    sorted[(rank - 1).min(n - 1) as usize]
}

pub fn pass_rate<'a, I>(statuses: I) -> f64
where
    I: IntoIterator<Item = &'a TestStatus>,
{
    let (mut passed, mut total) = (0u64, 0u64);
    for s in statuses {
        total += 1;
        if *s == TestStatus::Passed {
            passed += 1;
        }
    }
    success_rate(passed, total)
}

pub fn summarize(records: &[ExecutionRecord]) -> Summary {
    if records.is_empty() {
        return Summary::default();
    }

    let mut summary = Summary {
        total: records.len() as u64,
        ..Default::default()
    };
    for r in records {
        match r.status {
            TestStatus::Passed => summary.passed += 1,
            TestStatus::Failed | TestStatus::Error => summary.failed += 1,
            TestStatus::Skipped => summary.skipped += 1,
        }
    }
    summary.pass_rate = success_rate(summary.passed, summary.total);

    let mut durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
    durations.sort_unstable();
    summary.avg_duration_ms = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
    summary.p95_duration_ms = percentile_nearest_rank(&durations, 95);
    summary
}

/// Classify a chronologically ordered run history by comparing the pass rate
/// of its later half to its earlier half. The earlier half takes the extra
/// element of an odd-length history.
pub fn classify_trend(chronological: &[TestStatus]) -> Trend {
    if chronological.len() < 2 {
        return Trend::Stable;
    }
    let split = chronological.len().div_ceil(2);
    let (first, second) = chronological.split_at(split);
    let delta = pass_rate(second) - pass_rate(first);

    if delta > TREND_THRESHOLD_PCT {
        Trend::Improving
    } else if delta < -TREND_THRESHOLD_PCT {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn history(first: (usize, usize), second: (usize, usize)) -> Vec<TestStatus> {
        // (passed, failed) for each half, equal-sized halves
        let mut v = Vec::new();
        for (passed, failed) in [first, second] {
            v.extend(std::iter::repeat(TestStatus::Passed).take(passed));
            v.extend(std::iter::repeat(TestStatus::Failed).take(failed));
        }
        v
    }

    fn record(status: TestStatus, duration_ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            report_id: "RPT".into(),
            suite_type: "smoke".into(),
            environment: "qa".into(),
            test_name: "t".into(),
            test_type: "api".into(),
            status,
            duration_ms,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_p95_nearest_rank_over_100_samples() {
        let samples: Vec<u64> = (1..=100).map(|i| i * 10).collect();
        assert_eq!(percentile_nearest_rank(&samples, 95), 950);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile_nearest_rank(&[], 95), 0);
        assert_eq!(percentile_nearest_rank(&[7], 95), 7);
        assert_eq!(percentile_nearest_rank(&[1, 2, 3], 0), 1);
        assert_eq!(percentile_nearest_rank(&[1, 2, 3], 100), 3);
    }

    #[test]
    fn test_trend_classification() {
        // 40% -> 90%
        assert_eq!(classify_trend(&history((4, 6), (9, 1))), Trend::Improving);
        // 90% -> 40%
        assert_eq!(classify_trend(&history((9, 1), (4, 6))), Trend::Declining);
        // 70% -> 72%
        assert_eq!(classify_trend(&history((35, 15), (36, 14))), Trend::Stable);
    }

    #[test]
    fn test_trend_short_history_is_stable() {
        assert_eq!(classify_trend(&[]), Trend::Stable);
        assert_eq!(classify_trend(&[TestStatus::Failed]), Trend::Stable);
    }

    #[test]
    fn test_trend_odd_length_split() {
        // first half [F, F], second half [P]: 0% -> 100%
        let h = [TestStatus::Failed, TestStatus::Failed, TestStatus::Passed];
        assert_eq!(classify_trend(&h), Trend::Improving);
        // first half [P, F] (50%), second half [P] (100%)
        let h = [TestStatus::Passed, TestStatus::Failed, TestStatus::Passed];
        assert_eq!(classify_trend(&h), Trend::Improving);
        // first half [P, P] (100%), second half [F] (0%)
        let h = [TestStatus::Passed, TestStatus::Passed, TestStatus::Failed];
        assert_eq!(classify_trend(&h), Trend::Declining);
    }

    #[test]
    fn test_summary_counts_and_rates() {
        let records = vec![
            record(TestStatus::Passed, 10),
            record(TestStatus::Passed, 30),
            record(TestStatus::Failed, 20),
            record(TestStatus::Error, 40),
            record(TestStatus::Skipped, 0),
        ];
        let s = summarize(&records);
        assert_eq!(s.total, 5);
        assert_eq!(s.passed, 2);
        assert_eq!(s.failed, 2);
        assert_eq!(s.skipped, 1);
        assert!((s.pass_rate - 40.0).abs() < 1e-9);
        assert!((s.avg_duration_ms - 20.0).abs() < 1e-9);
        assert_eq!(s.p95_duration_ms, 40);
    }

    #[test]
    fn test_summary_empty_is_zero() {
        assert_eq!(summarize(&[]), Summary::default());
    }
}
