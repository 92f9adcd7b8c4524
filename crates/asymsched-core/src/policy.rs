//! Scheduling-policy representation.
//!
//! A [`Policy`] is built once from CLI tokens — either through the canonical
//! `base`/`criteria`/`metric`/`target`/`similarity` options or through the
//! legacy underscore-grammar policy names — and is immutable afterwards.
//! Both entry points converge on the same canonical value; the engine has a
//! single dispatch.

use std::fmt;
use std::io::{Error, ErrorKind, Result};

/// Normalisation reference for the fairness metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// Each task's fair share of fast and slow time.
    FairShare,
    /// A hypothetical slow-core-only run.
    SlowCore,
    /// A hypothetical fast-core-only run.
    FastCore,
}

impl Base {
    fn as_str(self) -> &'static str {
        match self {
            Base::FairShare => "fair_share",
            Base::SlowCore => "slow_core",
            Base::FastCore => "fast_core",
        }
    }
}

/// The optimisation target; chooses which policy routine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criteria {
    Unaware,
    Manual,
    MaxPerf,
    MaxFair,
    MinF,
    Uniformity,
    MinFUniformity,
}

impl Criteria {
    fn as_str(self) -> &'static str {
        match self {
            Criteria::Unaware => "unaware",
            Criteria::Manual => "manual",
            Criteria::MaxPerf => "max_perf",
            Criteria::MaxFair => "max_fair",
            Criteria::MinF => "minF",
            Criteria::Uniformity => "uniformity",
            Criteria::MinFUniformity => "minF_uniformity",
        }
    }
}

/// Which quantity the target value constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Fairness,
    Throughput,
}

/// An immutable scheduling policy.
///
/// `throughput`, `min_f` and `uniformity` are normalised targets in `[0, 1]`
/// (at most one of `throughput` and the fairness targets is nonzero);
/// `similarity` is a speedup-difference threshold for the grouping post-pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub name: String,
    pub base: Base,
    pub criteria: Criteria,
    pub throughput: f64,
    pub min_f: f64,
    pub uniformity: f64,
    pub similarity: f64,
}

impl Policy {
    /// Whether the policy consumes speedup estimates at all.
    pub fn speedup_aware(&self) -> bool {
        !matches!(self.criteria, Criteria::Unaware | Criteria::Manual)
    }

    /// Whether the policy distinguishes fast from slow cores.
    pub fn asymmetry_aware(&self) -> bool {
        self.criteria != Criteria::Unaware
    }

    /// The default policy: max-fair on the fair-share base.
    pub fn max_fair() -> Self {
        Self {
            name: "max-fair".to_string(),
            base: Base::FairShare,
            criteria: Criteria::MaxFair,
            throughput: 0.0,
            min_f: 1.0,
            uniformity: 1.0,
            similarity: 0.0,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Render the canonical descriptive name for a finalised policy.
fn canonical_name(policy: &Policy) -> String {
    let mut name = match policy.criteria {
        Criteria::Unaware | Criteria::Manual | Criteria::MaxPerf => {
            policy.criteria.as_str().to_string()
        }
        Criteria::MaxFair => format!(
            "{} base: {}",
            policy.criteria.as_str(),
            policy.base.as_str()
        ),
        Criteria::MinF | Criteria::Uniformity => {
            let (metric, value) = if policy.throughput != 0.0 {
                ("throughput", policy.throughput)
            } else if policy.min_f != 0.0 {
                ("minF", policy.min_f)
            } else {
                ("uniformity", policy.uniformity)
            };
            format!(
                "{} base: {} {metric}_target: {value:.3}",
                policy.criteria.as_str(),
                policy.base.as_str()
            )
        }
        Criteria::MinFUniformity => format!(
            "{} base: {} minF_target: {:.3} uniformity_target: {:.3}",
            policy.criteria.as_str(),
            policy.base.as_str(),
            policy.min_f,
            policy.uniformity
        ),
    };
    if policy.similarity > 0.0 {
        name.push_str(&format!(" similarity: {:.3}", policy.similarity));
    }
    name
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Accumulates CLI policy options and emits a validated [`Policy`].
///
/// A `--policy NAME` option (the legacy path) takes precedence: once given,
/// the canonical options are ignored with a warning.
#[derive(Default)]
pub struct PolicyBuilder {
    legacy: Option<Policy>,
    base: Option<Base>,
    criteria: Option<Criteria>,
    metric: Option<Metric>,
    target1: Option<f64>,
    target2: Option<f64>,
    similarity: Option<f64>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Legacy `--policy NAME` entry point.
    pub fn policy_name(&mut self, name: &str) -> Result<()> {
        self.legacy = Some(parse_legacy_name(name)?);
        Ok(())
    }

    fn warn_if_legacy(&self, opt: &str) -> bool {
        if self.legacy.is_some() {
            log::warn!("policy already given; --{opt} will be ignored");
            true
        } else {
            false
        }
    }

    pub fn base(&mut self, value: &str) -> Result<()> {
        if self.warn_if_legacy("base") {
            return Ok(());
        }
        self.base = Some(match value {
            "fair_share" | "fair" => Base::FairShare,
            "slow_core" | "slow" => Base::SlowCore,
            "fast_core" | "fast" => Base::FastCore,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown base: {value}"),
                ));
            }
        });
        Ok(())
    }

    pub fn criteria(&mut self, value: &str) -> Result<()> {
        if self.warn_if_legacy("criteria") {
            return Ok(());
        }
        self.criteria = Some(match value {
            "unaware" | "Unaware" => Criteria::Unaware,
            "manual" | "Manual" => Criteria::Manual,
            "max_perf" | "max-perf" => Criteria::MaxPerf,
            "max_fair" | "max-fair" => Criteria::MaxFair,
            "minFairness" | "minfairness" | "minF" => Criteria::MinF,
            "uniformity" | "Uniformity" | "uni" | "Uni" => Criteria::Uniformity,
            "minFairness_uniformity"
            | "minFairness_Uniformity"
            | "minfairness_uniformity"
            | "minfairness_Uniformity"
            | "minF_uniformity"
            | "minF_Uniformity"
            | "minF_uni"
            | "minF_Uni" => Criteria::MinFUniformity,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown criteria: {value}"),
                ));
            }
        });
        Ok(())
    }

    pub fn metric(&mut self, value: &str) -> Result<()> {
        if self.warn_if_legacy("metric") {
            return Ok(());
        }
        self.metric = Some(match value {
            "fairness" | "Fairness" | "f" | "F" => Metric::Fairness,
            "throughput" | "Throughput" | "t" | "T" => Metric::Throughput,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown metric: {value}"),
                ));
            }
        });
        Ok(())
    }

    /// Target value(s) in per cent: `"90"` or, for minF∧uniformity, `"70_80"`.
    pub fn target(&mut self, value: &str) -> Result<()> {
        if self.warn_if_legacy("target") {
            return Ok(());
        }
        let mut parts = value.splitn(2, '_');
        let first = parts.next().unwrap_or_default();
        self.target1 = Some(parse_percent(first)?);
        if let Some(second) = parts.next() {
            self.target2 = Some(parse_percent(second)?);
        }
        Ok(())
    }

    pub fn similarity(&mut self, value: f64) -> Result<()> {
        if self.warn_if_legacy("similarity") {
            return Ok(());
        }
        self.similarity = Some(value);
        Ok(())
    }

    /// Finalise and validate.
    pub fn build(self) -> Result<Policy> {
        if let Some(policy) = self.legacy {
            return Ok(policy);
        }

        let base = self.base.unwrap_or(Base::FairShare);
        let criteria = self.criteria.unwrap_or(Criteria::MaxFair);
        let metric = self.metric.unwrap_or(Metric::Fairness);

        if criteria == Criteria::MinFUniformity && metric == Metric::Throughput {
            return Err(invalid(
                "throughput metric is not supported with minF_uniformity criteria",
            ));
        }
        let targeted = matches!(
            criteria,
            Criteria::MinF | Criteria::Uniformity | Criteria::MinFUniformity
        );
        if targeted && self.target1.is_none() {
            return Err(invalid(
                "a target must be given for criteria minF, uniformity, or minF_uniformity",
            ));
        }
        if matches!(
            criteria,
            Criteria::Unaware | Criteria::Manual | Criteria::MaxFair
        ) && self.similarity.is_some()
        {
            return Err(invalid(
                "similarity is meaningless with criteria unaware, manual, and max_fair",
            ));
        }
        if self.target1.is_some_and(|t| t < 0.0) || self.target2.is_some_and(|t| t < 0.0) {
            return Err(invalid("targets must be larger than or equal to 0"));
        }
        if self.similarity.is_some_and(|s| s < 0.0) {
            return Err(invalid("similarity must be larger than or equal to 0"));
        }

        let target1 = self.target1.unwrap_or(0.0);
        let (throughput, min_f, mut uniformity) = match (criteria, metric) {
            (Criteria::MinF, Metric::Fairness) => (0.0, target1, 0.0),
            (Criteria::MinF, Metric::Throughput) => (target1, 0.0, 0.0),
            (Criteria::Uniformity, Metric::Fairness) => (0.0, 0.0, target1),
            (Criteria::Uniformity, Metric::Throughput) => (target1, 0.0, 0.0),
            (Criteria::MinFUniformity, _) => {
                let target2 = self.target2.ok_or_else(|| {
                    invalid("a second target must be given when criteria is minF_uniformity")
                })?;
                (0.0, target1, target2)
            }
            (Criteria::MaxPerf, _) => (1.0, 0.0, 0.0),
            (Criteria::MaxFair, _) => (0.0, 1.0, 1.0),
            _ => (0.0, 0.0, 0.0), // unaware or manual
        };

        if uniformity > 1.0 {
            log::warn!("uniformity target > 1.0 is meaningless; clamping to 1.0");
            uniformity = 1.0;
        }

        let mut policy = Policy {
            name: String::new(),
            base,
            criteria,
            throughput,
            min_f,
            uniformity,
            similarity: self.similarity.unwrap_or(0.0),
        };
        policy.name = canonical_name(&policy);
        Ok(policy)
    }
}

fn invalid(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

/// Parse a per-cent target token into a fraction.
fn parse_percent(token: &str) -> Result<f64> {
    let value: f64 = token
        .parse()
        .map_err(|_| invalid(&format!("bad target value: {token}")))?;
    Ok(value / 100.0)
}

// ---------------------------------------------------------------------------
// Legacy policy names
// ---------------------------------------------------------------------------

/// Predefined legacy policy names.
pub const PREDEFINED_POLICIES: &[&str] = &[
    "unaware",
    "manual",
    "max_throughput",
    "max-perf",
    "complete_fair",
    "max-fair",
];

/// Parse a legacy policy name into the canonical representation.
///
/// Either a predefined name, or an underscore grammar of keyword/value
/// pairs: `minF_90`, `sim_0.1_uni_80`, `minF_70_uniformity_90`. Values above
/// 1 are per cent.
pub fn parse_legacy_name(name: &str) -> Result<Policy> {
    match name {
        "unaware" => {
            return Ok(Policy {
                name: name.to_string(),
                base: Base::FairShare,
                criteria: Criteria::Unaware,
                throughput: 0.0,
                min_f: 0.0,
                uniformity: 0.0,
                similarity: 0.0,
            });
        }
        "manual" => {
            return Ok(Policy {
                name: name.to_string(),
                base: Base::FairShare,
                criteria: Criteria::Manual,
                throughput: 0.0,
                min_f: 0.0,
                uniformity: 0.0,
                similarity: 0.0,
            });
        }
        "max_throughput" | "max-perf" => {
            return Ok(Policy {
                name: name.to_string(),
                base: Base::FairShare,
                criteria: Criteria::MaxPerf,
                throughput: 1.0,
                min_f: 0.0,
                uniformity: 0.0,
                similarity: 0.0,
            });
        }
        "complete_fair" | "max-fair" => {
            let mut policy = Policy::max_fair();
            policy.name = name.to_string();
            return Ok(policy);
        }
        _ => {}
    }

    #[derive(PartialEq)]
    enum Last {
        None,
        Similarity,
        MinF,
        Uniformity,
        Number,
    }

    let mut similarity = 0.0f64;
    let mut min_f = 0.0f64;
    let mut uniformity = 0.0f64;
    let mut last = Last::None;
    let mut num_tokens = 0usize;

    // Consecutive or trailing underscores carry no token, as with strtok.
    for tok in name.split('_').filter(|t| !t.is_empty()) {
        num_tokens += 1;
        match tok {
            "Similarity" | "similarity" | "sim" | "Sim" => last = Last::Similarity,
            "QoS" | "MinF" | "minF" | "minf" | "min" => last = Last::MinF,
            "Uniformity" | "uniformity" | "Uni" | "uni" => last = Last::Uniformity,
            _ => {
                let value: f64 = tok
                    .parse()
                    .map_err(|_| invalid(&format!("wrong sched policy name: {name}")))?;
                match last {
                    Last::Similarity => similarity = value,
                    Last::MinF => min_f = value,
                    Last::Uniformity => uniformity = value,
                    _ => return Err(invalid(&format!("wrong sched policy name: {name}"))),
                }
                last = Last::Number;
            }
        }
    }

    if num_tokens == 0 || num_tokens % 2 > 0 {
        return Err(invalid(&format!("wrong sched policy name: {name}")));
    }

    // Percentage shorthand.
    if min_f > 1.0 {
        min_f /= 100.0;
    }
    if uniformity > 1.0 {
        uniformity /= 100.0;
    }

    // Pick the criterion the target combination implies.
    let criteria = if min_f == 1.0 || uniformity == 1.0 {
        Criteria::MaxFair
    } else if min_f == 0.0 && uniformity == 0.0 {
        Criteria::MaxPerf
    } else if min_f > 0.0 && uniformity > 0.0 {
        Criteria::MinFUniformity
    } else if min_f > 0.0 {
        Criteria::MinF
    } else {
        Criteria::Uniformity
    };

    Ok(Policy {
        name: name.to_string(),
        base: Base::FairShare,
        criteria,
        throughput: 0.0,
        min_f,
        uniformity,
        similarity,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
