//! Turning run samples into a pass/fail verdict.
//!
//! Every function here is pure: the same samples and indicator always give
//! the same verdict and the same first-failure message.

pub mod results;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::execution::store::RunSamples;
use crate::execution::{ExecutionCase, ExecutionStatus, ScriptType};

pub use self::results::{AssertionSummary, ResultStore, TestCaseResult, TestResult};

/// Response-time percentile an indicator is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Percentile {
    P50,
    P75,
    P90,
    P95,
    P99,
    P999,
    #[default]
    #[serde(other)]
    Max,
}

impl Percentile {
    /// The matching field of a sample summary.
    pub fn of(&self, summary: &SampleSummary) -> f64 {
        match self {
            Percentile::P50 => summary.p50,
            Percentile::P75 => summary.p75,
            Percentile::P90 => summary.p90,
            Percentile::P95 => summary.p95,
            Percentile::P99 => summary.p99,
            Percentile::P999 => summary.p999,
            Percentile::Max => summary.max,
        }
    }
}

impl fmt::Display for Percentile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Percentile::P50 => "P50",
            Percentile::P75 => "P75",
            Percentile::P90 => "P90",
            Percentile::P95 => "P95",
            Percentile::P99 => "P99",
            Percentile::P999 => "P999",
            Percentile::Max => "MAX",
        };
        f.write_str(name)
    }
}

/// Thresholds a run is judged against. Unset thresholds are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Indicator {
    pub art_percentile: Percentile,
    /// Upper bound for the chosen response-time percentile.
    pub art_threshold_ms: Option<f64>,
    pub min_tps: Option<f64>,
    /// Fraction of failed samples, 0.0 ..= 1.0.
    pub max_error_rate: Option<f64>,
    /// Mean usage ceilings in percent, checked per node for stability runs.
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub network_usage: Option<f64>,
}

impl Indicator {
    pub fn has_usage_thresholds(&self) -> bool {
        self.cpu_usage.is_some()
            || self.memory_usage.is_some()
            || self.disk_usage.is_some()
            || self.network_usage.is_some()
    }
}

/// Aggregated samples of a run. Latencies in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleSummary {
    pub samples: u64,
    pub tps: f64,
    pub error_rate: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub max: f64,
}

impl SampleSummary {
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Mean resource usage one node reported, in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub node_id: i64,
    #[serde(default)]
    pub cpu_mean: Option<f64>,
    #[serde(default)]
    pub memory_mean: Option<f64>,
    #[serde(default)]
    pub disk_mean: Option<f64>,
    #[serde(default)]
    pub network_mean: Option<f64>,
}

/// One per-case sample of a functional run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseSample {
    pub case_name: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMetric {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UsageMetric::Cpu => "CPU",
            UsageMetric::Memory => "memory",
            UsageMetric::Disk => "disk",
            UsageMetric::Network => "network",
        };
        f.write_str(name)
    }
}

/// Outcome of judging one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub reason: Option<String>,
    pub usage_failed_node_id: Option<i64>,
    pub failed_metric: Option<UsageMetric>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            usage_failed_node_id: None,
            failed_metric: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            usage_failed_node_id: None,
            failed_metric: None,
        }
    }
}

/// Outcome of judging one case. `passed` is `None` for disabled cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseVerdict {
    pub case_id: i64,
    pub case_name: String,
    pub passed: Option<bool>,
    pub reason: Option<String>,
}

/// Everything the judge looks at.
#[derive(Debug, Clone, Copy)]
pub struct JudgeInput<'a> {
    pub script_type: ScriptType,
    pub status: ExecutionStatus,
    pub failure_message: Option<&'a str>,
    pub indicator: Option<&'a Indicator>,
    pub samples: &'a RunSamples,
    /// Nodes the execution ran on; each owes a usage row in stability runs.
    pub node_ids: &'a [i64],
}

pub fn judge(input: &JudgeInput<'_>) -> Verdict {
    if input.status != ExecutionStatus::Completed {
        return Verdict::fail(unfinished_reason(input.status, input.failure_message));
    }

    match input.script_type {
        ScriptType::Performance => judge_performance(input.indicator, input.samples),
        ScriptType::Stability => {
            judge_stability(input.indicator, input.samples, input.node_ids)
        }
        ScriptType::Functional => judge_functional(&input.samples.cases, input.failure_message),
        ScriptType::Customized => judge_customized(input.samples),
    }
}

fn unfinished_reason(status: ExecutionStatus, failure_message: Option<&str>) -> String {
    match failure_message {
        Some(msg) if !msg.is_empty() => msg.to_string(),
        _ => format!("execution ended with status {}", status),
    }
}

pub fn judge_performance(indicator: Option<&Indicator>, samples: &RunSamples) -> Verdict {
    let (indicator, summary) = match required_inputs(indicator, samples) {
        Ok(inputs) => inputs,
        Err(verdict) => return verdict,
    };
    match throughput_failure(indicator, summary) {
        Some(reason) => Verdict::fail(reason),
        None => Verdict::pass(),
    }
}

pub fn judge_stability(
    indicator: Option<&Indicator>,
    samples: &RunSamples,
    node_ids: &[i64],
) -> Verdict {
    let (indicator, summary) = match required_inputs(indicator, samples) {
        Ok(inputs) => inputs,
        Err(verdict) => return verdict,
    };
    if let Some(reason) = throughput_failure(indicator, summary) {
        return Verdict::fail(reason);
    }
    if !indicator.has_usage_thresholds() {
        return Verdict::pass();
    }
    if samples.usage.is_empty() {
        return Verdict::fail("node metrics missing");
    }

    if let Some(node_id) = node_ids
        .iter()
        .find(|id| !samples.usage.iter().any(|u| u.node_id == **id))
    {
        return Verdict {
            usage_failed_node_id: Some(*node_id),
            ..Verdict::fail(format!(
                "node metrics missing: node {} reported no usage",
                node_id
            ))
        };
    }

    for usage in &samples.usage {
        let Some((metric, mean, limit)) = usage_breach(indicator, usage) else {
            continue;
        };
        let reason = match mean {
            Some(mean) => format!(
                "node {} {} mean usage {}% exceeded threshold {}%",
                usage.node_id, metric, mean, limit
            ),
            None => format!(
                "node metrics missing: node {} reported no {} usage",
                usage.node_id, metric
            ),
        };
        return Verdict {
            passed: false,
            reason: Some(reason),
            usage_failed_node_id: Some(usage.node_id),
            failed_metric: Some(metric),
        };
    }
    Verdict::pass()
}

pub fn judge_functional(cases: &[CaseSample], failure_message: Option<&str>) -> Verdict {
    if cases.is_empty() {
        return Verdict::fail(match failure_message {
            Some(msg) if !msg.is_empty() => msg.to_string(),
            _ => "sample content missing".to_string(),
        });
    }
    match cases.iter().find(|c| c.success != Some(true)) {
        Some(failed) => Verdict::fail(case_failure_message(failed)),
        None => Verdict::pass(),
    }
}

pub fn judge_customized(samples: &RunSamples) -> Verdict {
    if samples.summary.is_some() {
        Verdict::pass()
    } else {
        Verdict::fail("sample summary missing")
    }
}

/// Judge each case of an API-sourced functional execution on its own.
pub fn judge_cases(
    status: ExecutionStatus,
    failure_message: Option<&str>,
    cases: &[ExecutionCase],
    samples: &[CaseSample],
) -> Vec<CaseVerdict> {
    cases
        .iter()
        .map(|case| {
            let (passed, reason) = if !case.enabled {
                (None, None)
            } else if status != ExecutionStatus::Completed {
                (Some(false), Some(unfinished_reason(status, failure_message)))
            } else {
                judge_case(&case.case_name, samples)
            };
            CaseVerdict {
                case_id: case.case_id,
                case_name: case.case_name.clone(),
                passed,
                reason,
            }
        })
        .collect()
}

fn judge_case(case_name: &str, samples: &[CaseSample]) -> (Option<bool>, Option<String>) {
    let mut matching = samples.iter().filter(|s| s.case_name == case_name).peekable();
    if matching.peek().is_none() {
        return (
            Some(false),
            Some(format!("content missing for case '{}'", case_name)),
        );
    }
    match matching.find(|s| s.success != Some(true)) {
        Some(failed) => (Some(false), Some(case_failure_message(failed))),
        None => (Some(true), None),
    }
}

fn case_failure_message(sample: &CaseSample) -> String {
    match &sample.message {
        Some(msg) if !msg.is_empty() => msg.clone(),
        _ if sample.success.is_none() => format!("case '{}' has no result", sample.case_name),
        _ => format!("case '{}' failed", sample.case_name),
    }
}

fn required_inputs<'a>(
    indicator: Option<&'a Indicator>,
    samples: &'a RunSamples,
) -> Result<(&'a Indicator, &'a SampleSummary), Verdict> {
    let indicator = indicator.ok_or_else(|| Verdict::fail("indicator missing"))?;
    match &samples.summary {
        Some(summary) if !summary.is_empty() => Ok((indicator, summary)),
        _ => Err(Verdict::fail("sample summary missing")),
    }
}

/// Response time, then throughput, then error rate. All three are evaluated;
/// the first failing message wins.
fn throughput_failure(indicator: &Indicator, summary: &SampleSummary) -> Option<String> {
    let art = indicator.art_threshold_ms.and_then(|limit| {
        let value = indicator.art_percentile.of(summary);
        (value > limit).then(|| {
            format!(
                "response time {} {}ms exceeds threshold {}ms",
                indicator.art_percentile, value, limit
            )
        })
    });
    let tps = indicator.min_tps.and_then(|min| {
        (summary.tps < min).then(|| format!("throughput {} TPS below minimum {} TPS", summary.tps, min))
    });
    let errors = indicator.max_error_rate.and_then(|max| {
        (summary.error_rate > max)
            .then(|| format!("error rate {} exceeds maximum {}", summary.error_rate, max))
    });

    [art, tps, errors].into_iter().flatten().next()
}

/// First configured metric that is over its limit or absent. An absent
/// metric comes back with `None` as the mean.
fn usage_breach(
    indicator: &Indicator,
    usage: &UsageSummary,
) -> Option<(UsageMetric, Option<f64>, f64)> {
    let checks = [
        (UsageMetric::Cpu, usage.cpu_mean, indicator.cpu_usage),
        (UsageMetric::Memory, usage.memory_mean, indicator.memory_usage),
        (UsageMetric::Disk, usage.disk_mean, indicator.disk_usage),
        (UsageMetric::Network, usage.network_mean, indicator.network_usage),
    ];
    checks.into_iter().find_map(|(metric, mean, limit)| match (mean, limit) {
        (Some(mean), Some(limit)) if mean > limit => Some((metric, Some(mean), limit)),
        (None, Some(limit)) => Some((metric, None, limit)),
        _ => None,
    })
}
