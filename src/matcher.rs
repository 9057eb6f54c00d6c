use crate::rules::{Predicate, RuleDef, RuleError};

use regex::Regex;
use serde_yaml::Value;
use std::collections::HashMap;

/// Result of checking one rule against one modulemd document.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Miss,
    Matched { tags: Vec<String> },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Evaluates an ordered rule set against modulemd documents.
///
/// All regular expressions referenced by the rules are compiled once at
/// construction time, so a bad pattern is a startup failure instead of a
/// per-event surprise. Evaluation itself keeps no state on the engine or the
/// rules; the capture bookkeeping lives in a per-call accumulator.
pub struct RuleEngine {
    rules: Vec<RuleDef>,
    patterns: HashMap<String, Regex>,
}

impl RuleEngine {
    pub fn new(rules: Vec<RuleDef>) -> Result<Self, RuleError> {
        let mut patterns = HashMap::new();
        for rule in &rules {
            if let Some(tree) = rule.rule() {
                for (_, predicate) in tree {
                    compile_patterns(predicate, &mut patterns)?;
                }
            }
        }
        Ok(RuleEngine { rules, patterns })
    }

    pub fn rules(&self) -> &[RuleDef] {
        &self.rules
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Evaluate every rule in definition order and collect the destination
    /// tags of all matches into one flat list. Rules are independent; a
    /// build can pick up tags from several of them, duplicates included.
    pub fn evaluate(&self, modulemd: &Value) -> Vec<String> {
        let mut tags = Vec::new();
        for rule in &self.rules {
            match self.match_rule(rule, modulemd) {
                MatchOutcome::Matched { tags: resolved } => {
                    log::info!("Rule '{}' matched, destination tag(s): {:?}", rule.id(), resolved);
                    tags.extend(resolved);
                }
                MatchOutcome::Miss => {
                    log::debug!("Rule '{}' did not match", rule.id());
                }
            }
        }
        tags
    }

    /// Check a single rule against a modulemd document.
    pub fn match_rule(&self, rule: &RuleDef, modulemd: &Value) -> MatchOutcome {
        let tree = match rule.rule() {
            Some(tree) => tree,
            None => {
                log::info!(
                    "Rule '{}' has no match criteria, build will be tagged to {:?}",
                    rule.id(),
                    rule.destinations().to_vec()
                );
                return MatchOutcome::Matched {
                    tags: rule.destinations().to_vec(),
                };
            }
        };

        let data = lookup(modulemd, "data");
        // Pairs of (pattern, matched value) for every regex with named
        // capture groups that hit, in check order. Fresh per call.
        let mut captures: Vec<(String, String)> = Vec::new();

        // Every top-level property is checked even after a miss; the rule
        // matches only if all of them held.
        let mut property_matches = Vec::with_capacity(tree.len());
        for (property, expected) in tree {
            log::debug!("Rule '{}': checking property '{}'", rule.id(), property);
            let matched = match (property.as_str(), expected) {
                // scratch and development default to false when the
                // modulemd does not carry them.
                ("scratch" | "development", Predicate::Bool(expected_flag)) => {
                    let actual = data
                        .and_then(|d| lookup(d, property))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if *expected_flag == actual {
                        true
                    } else {
                        log::debug!(
                            "{} is not matched. Expected: {}. Value in modulemd: {}",
                            property,
                            expected_flag,
                            actual
                        );
                        false
                    }
                }
                _ => match data.and_then(|d| lookup(d, property)) {
                    None => {
                        log::info!(
                            "'{}' is not matched. Modulemd does not have '{}'",
                            property,
                            property
                        );
                        false
                    }
                    Some(value) => {
                        let matched = self.check_predicate(expected, value, &mut captures);
                        if !matched {
                            log::info!("'{}' is not matched", property);
                        }
                        matched
                    }
                },
            };
            property_matches.push(matched);
        }

        if property_matches.iter().all(|matched| *matched) {
            MatchOutcome::Matched {
                tags: self.resolve_destinations(rule, &captures),
            }
        } else {
            MatchOutcome::Miss
        }
    }

    fn check_predicate(
        &self,
        expected: &Predicate,
        value: &Value,
        captures: &mut Vec<(String, String)>,
    ) -> bool {
        match expected {
            // Booleans are only legal on the top-level flag properties;
            // the rule loader rejects them anywhere else.
            Predicate::Bool(_) => false,
            Predicate::Regex(pattern) => self.check_value(pattern, value, captures),
            Predicate::AnyOf(patterns) => patterns
                .iter()
                .any(|pattern| self.check_value(pattern, value, captures)),
            Predicate::All(entries) => {
                let mapping = match value {
                    Value::Mapping(_) => value,
                    // modulemd v2 wraps the dependencies mappings in a
                    // one-element list; descend into the first element.
                    Value::Sequence(items) => match items.first() {
                        Some(first @ Value::Mapping(_)) => first,
                        _ => return false,
                    },
                    _ => return false,
                };
                for (key, sub_expected) in entries {
                    let sub_value = match lookup(mapping, key) {
                        Some(sub_value) => sub_value,
                        None => {
                            log::warn!("'{}' is not found in module", key);
                            return false;
                        }
                    };
                    log::debug!("Checking '{}'", key);
                    if !self.check_predicate(sub_expected, sub_value, captures) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Unanchored regex search over the document value, which may be a
    /// single scalar or a list of scalars. The first matching candidate
    /// wins; if the pattern carries named capture groups the (pattern,
    /// value) pair is recorded for destination resolution.
    fn check_value(
        &self,
        pattern: &str,
        value: &Value,
        captures: &mut Vec<(String, String)>,
    ) -> bool {
        let candidates: Vec<String> = match value {
            Value::Sequence(items) => items.iter().filter_map(scalar_to_string).collect(),
            other => scalar_to_string(other).into_iter().collect(),
        };
        let regex = match self.patterns.get(pattern) {
            Some(regex) => regex,
            None => {
                log::error!("Pattern '{}' was not compiled at engine construction", pattern);
                return false;
            }
        };
        log::debug!("Checking regex '{}' against {:?}", pattern, candidates);
        for candidate in candidates {
            if regex.is_match(&candidate) {
                if regex.capture_names().flatten().next().is_some() {
                    captures.push((pattern.to_string(), candidate));
                }
                return true;
            }
        }
        false
    }

    /// Resolve the rule's destination templates. When any named-group regex
    /// matched, only the last recorded pair drives the substitution; earlier
    /// named-group matches are silently discarded. That last-write-wins
    /// behavior is long-standing and pinned by a test below.
    fn resolve_destinations(&self, rule: &RuleDef, captures: &[(String, String)]) -> Vec<String> {
        let templates = rule.destinations().to_vec();
        let (pattern, value) = match captures.last() {
            Some(last) => last,
            None => return templates,
        };
        let regex = match self.patterns.get(pattern) {
            Some(regex) => regex,
            None => return templates,
        };
        templates
            .iter()
            .map(|template| regex.replace_all(value, template.as_str()).into_owned())
            .collect()
    }
}

fn compile_patterns(
    predicate: &Predicate,
    patterns: &mut HashMap<String, Regex>,
) -> Result<(), RuleError> {
    match predicate {
        Predicate::Bool(_) => {}
        Predicate::Regex(pattern) => compile_one(pattern, patterns)?,
        Predicate::AnyOf(alternatives) => {
            for pattern in alternatives {
                compile_one(pattern, patterns)?;
            }
        }
        Predicate::All(entries) => {
            for (_, sub) in entries {
                compile_patterns(sub, patterns)?;
            }
        }
    }
    Ok(())
}

fn compile_one(pattern: &str, patterns: &mut HashMap<String, Regex>) -> Result<(), RuleError> {
    if !patterns.contains_key(pattern) {
        let regex = Regex::new(pattern).map_err(|source| RuleError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        patterns.insert(pattern.to_string(), regex);
    }
    Ok(())
}

fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Mapping(mapping) => mapping
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v),
        _ => None,
    }
}

/// Modulemd scalars are compared through their string rendering; `version`
/// for example is numeric in the YAML.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
