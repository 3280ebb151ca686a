//! Strategy specification DSL
//!
//! Parses the comma-separated triplet grammar from §6 — `pm2,sm2,pk2` means
//! "parallel-split M by 2, sequential-split M by 2, parallel-split K by
//! 2" — into a `Vec<Step>`, and renders one back to the same textual form.
//! Round-trippable: used for the `--strategy` CLI flag and for debug dumps.
//!
//! Grounded in this codebase's own small hand-rolled flag parsers
//! (`parse_flag`/`parse_bool`/`parse_u64` in `bin/prover.rs`) rather than
//! pulling in a parser-combinator crate for a five-character grammar.

#![forbid(unsafe_code)]

use thiserror::Error;

use crate::strategy::{Axis, Step, StepKind};

/// Errors parsing a strategy specification string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DslError {
    #[error("triplet {0:?} must be exactly 3 characters (kind, axis, divisor digits)")]
    BadTriplet(String),
    #[error("unknown step kind {0:?} (expected 'p' or 's')")]
    UnknownKind(char),
    #[error("unknown axis {0:?} (expected 'm', 'n' or 'k')")]
    UnknownAxis(char),
    #[error("bad divisor in triplet {0:?}: must be an integer >= 2")]
    BadDivisor(String),
}

/// Parse a comma-separated list of triplets, e.g. `"pm2,sm2,pk2"`.
pub fn parse(spec: &str) -> Result<Vec<Step>, DslError> {
    spec.split(',').map(parse_triplet).collect()
}

fn parse_triplet(triplet: &str) -> Result<Step, DslError> {
    let triplet = triplet.trim();
    let mut chars = triplet.chars();
    let kind_ch = chars.next().ok_or_else(|| DslError::BadTriplet(triplet.to_string()))?;
    let axis_ch = chars.next().ok_or_else(|| DslError::BadTriplet(triplet.to_string()))?;
    let digits: String = chars.collect();
    if digits.is_empty() {
        return Err(DslError::BadTriplet(triplet.to_string()));
    }

    let kind = match kind_ch {
        'p' => StepKind::Parallel,
        's' => StepKind::Sequential,
        other => return Err(DslError::UnknownKind(other)),
    };
    let axis = match axis_ch {
        'm' => Axis::M,
        'n' => Axis::N,
        'k' => Axis::K,
        other => return Err(DslError::UnknownAxis(other)),
    };
    let divisor: usize = digits.parse().map_err(|_| DslError::BadDivisor(triplet.to_string()))?;
    if divisor < 2 {
        return Err(DslError::BadDivisor(triplet.to_string()));
    }

    Ok(Step { kind, axis, divisor })
}

/// Render a step list back to the textual form `parse` accepts, e.g.
/// `[Step::parallel(Axis::M, 2)]` renders as `"pm2"`.
pub fn render(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|step| {
            let kind_ch = match step.kind {
                StepKind::Parallel => 'p',
                StepKind::Sequential => 's',
            };
            let axis_ch = match step.axis {
                Axis::M => 'm',
                Axis::N => 'n',
                Axis::K => 'k',
            };
            format!("{kind_ch}{axis_ch}{}", step.divisor)
        })
        .collect::<Vec<_>>()
        .join(",")
}
