// SPDX-License-Identifier: Apache-2.0

//! Startup validation of input definitions.
//!
//! A present id, including an explicit empty string, must be unique among
//! definitions of the same type. Definitions without an id never collide;
//! each gets an id generated from its type and paths.

use std::collections::{HashMap, HashSet};
use std::fmt;

use glob::Pattern;
use thiserror::Error;
use tracing::warn;

use crate::receivers::file::config::{FILESTREAM_INPUT_TYPE, InputDefinition};

/// One thing wrong with the configured inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Problem {
    #[error("{input_type} input ID '{id}' is duplicated across {occurrences} inputs")]
    DuplicateId {
        input_type: String,
        id: String,
        occurrences: usize,
    },

    #[error("input #{position} ({input_type}): {reason}")]
    Invalid {
        /// Zero-based position in the `inputs` list
        position: usize,
        input_type: String,
        reason: String,
    },
}

/// Every problem found, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub problems: Vec<Problem>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} inputs validation error: ", FILESTREAM_INPUT_TYPE)?;
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    /// Ids reported as duplicated, in order of first appearance.
    pub fn duplicated_ids(&self) -> Vec<&str> {
        self.problems
            .iter()
            .filter_map(|p| match p {
                Problem::DuplicateId { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// An accepted, enabled definition and the id its registry entries use.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub id: String,
    pub definition: InputDefinition,
}

/// Check id uniqueness per input type. Disabled definitions count too: they
/// own registry entries from earlier runs.
pub fn validate_input_ids(definitions: &[InputDefinition]) -> Result<(), ValidationError> {
    let problems = duplicate_ids(definitions);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { problems })
    }
}

/// Full startup validation: per-definition checks, id uniqueness, then id
/// resolution for every enabled definition.
pub fn validate(definitions: &[InputDefinition]) -> Result<Vec<ResolvedInput>, ValidationError> {
    let mut problems = Vec::new();

    for (position, def) in definitions.iter().enumerate() {
        let invalid = |reason: String| Problem::Invalid {
            position,
            input_type: def.input_type.clone(),
            reason,
        };

        if let Err(reason) = def.validate() {
            problems.push(invalid(reason));
            continue;
        }
        if !def.enabled {
            continue;
        }

        for pattern in def.paths.iter().chain(&def.prospector.scanner.exclude_files) {
            if let Err(e) = Pattern::new(pattern) {
                problems.push(invalid(format!("invalid glob pattern '{}': {}", pattern, e)));
            }
        }

        if def.clean_inactive_too_short() {
            warn!(
                position,
                "clean_inactive ({}) is not greater than ignore_older + check_interval, \
                 state may be removed while the file is still eligible for ingestion",
                humantime::format_duration(def.clean_inactive)
            );
        }
    }

    problems.extend(duplicate_ids(definitions));
    if !problems.is_empty() {
        return Err(ValidationError { problems });
    }

    Ok(resolve_ids(definitions))
}

fn duplicate_ids(definitions: &[InputDefinition]) -> Vec<Problem> {
    // (type, id) -> count, kept in order of first appearance
    let mut order: Vec<(&str, &str)> = Vec::new();
    let mut counts: HashMap<(&str, &str), usize> = HashMap::new();

    for def in definitions {
        let Some(id) = def.id.as_deref() else {
            continue;
        };
        let slot = (def.input_type.as_str(), id);
        let count = counts.entry(slot).or_insert(0);
        if *count == 0 {
            order.push(slot);
        }
        *count += 1;
    }

    order
        .into_iter()
        .filter_map(|slot| {
            let occurrences = counts[&slot];
            (occurrences > 1).then(|| Problem::DuplicateId {
                input_type: slot.0.to_string(),
                id: slot.1.to_string(),
                occurrences,
            })
        })
        .collect()
}

/// Generated ids are `<type>::<paths joined by ','>`, suffixed with `#<n>`
/// when that is already taken.
fn resolve_ids(definitions: &[InputDefinition]) -> Vec<ResolvedInput> {
    let mut taken: HashSet<(String, String)> = definitions
        .iter()
        .filter_map(|d| d.id.clone().map(|id| (d.input_type.clone(), id)))
        .collect();

    let mut resolved = Vec::new();
    for def in definitions {
        let id = match &def.id {
            Some(id) => id.clone(),
            None => {
                let base = format!("{}::{}", def.input_type, def.paths.join(","));
                let mut candidate = base.clone();
                let mut n = 1;
                while taken.contains(&(def.input_type.clone(), candidate.clone())) {
                    n += 1;
                    candidate = format!("{}#{}", base, n);
                }
                taken.insert((def.input_type.clone(), candidate.clone()));
                candidate
            }
        };

        if def.enabled {
            resolved.push(ResolvedInput {
                id,
                definition: def.clone(),
            });
        }
    }
    resolved
}
