use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Errors raised while loading rule definitions. All of these are fatal to
/// the load: a bad rule aborts the whole file rather than being skipped.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule definition does not have property '{0}'")]
    MissingField(&'static str),
    #[error("rule '{rule_id}': bad predicate under '{key}': {detail}")]
    InvalidShape {
        rule_id: String,
        key: String,
        detail: String,
    },
    #[error("invalid regex pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rule file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("rule file {0} must contain a list of rule definitions")]
    NotAList(String),
}

/// One node of a rule's match criteria.
///
/// The shape is fixed at load time so matching never has to inspect raw YAML:
/// booleans are only legal for the `scratch`/`development` flags, everything
/// else is a regular expression, a list of alternative expressions, or a
/// nested mapping checked key by key.
#[derive(Debug, Clone)]
pub enum Predicate {
    Bool(bool),
    Regex(String),
    AnyOf(Vec<String>),
    All(Vec<(String, Predicate)>),
}

/// Destination tag template(s) of a rule. Templates may reference named
/// capture groups from the rule's regexes with `$name` / `${name}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Destinations {
    One(String),
    Many(Vec<String>),
}

impl Destinations {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Destinations::One(tag) => vec![tag.clone()],
            Destinations::Many(tags) => tags.clone(),
        }
    }
}

/// A single named tagging rule, constructed from one mapping of the rule
/// file. `rule == None` means the rule matches every build unconditionally.
#[derive(Debug, Clone)]
pub struct RuleDef {
    id: String,
    rule_type: String,
    description: Option<String>,
    rule: Option<Vec<(String, Predicate)>>,
    destinations: Destinations,
}

fn lookup<'a>(data: &'a Mapping, key: &str) -> Option<&'a Value> {
    data.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

impl RuleDef {
    pub fn new(data: &Mapping) -> Result<Self, RuleError> {
        let id = lookup(data, "id")
            .and_then(Value::as_str)
            .ok_or(RuleError::MissingField("id"))?
            .to_string();
        let rule_type = lookup(data, "type")
            .and_then(Value::as_str)
            .ok_or(RuleError::MissingField("type"))?
            .to_string();
        let destinations = match lookup(data, "destinations") {
            None | Some(Value::Null) => return Err(RuleError::MissingField("destinations")),
            Some(value) => parse_destinations(&id, value)?,
        };
        let description = lookup(data, "description")
            .and_then(Value::as_str)
            .map(str::to_string);

        // An empty `rule:` section parses as YAML null; both that and a
        // missing key mean "no match criteria".
        let rule = match lookup(data, "rule") {
            None | Some(Value::Null) => None,
            Some(Value::Mapping(criteria)) => Some(parse_rule_tree(&id, criteria)?),
            Some(other) => {
                return Err(RuleError::InvalidShape {
                    rule_id: id,
                    key: "rule".to_string(),
                    detail: format!("expected a mapping, got {}", value_kind(other)),
                })
            }
        };

        Ok(RuleDef {
            id,
            rule_type,
            description,
            rule,
            destinations,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rule_type(&self) -> &str {
        &self.rule_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn rule(&self) -> Option<&[(String, Predicate)]> {
        self.rule.as_deref()
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn parse_destinations(rule_id: &str, value: &Value) -> Result<Destinations, RuleError> {
    match value {
        Value::String(tag) => Ok(Destinations::One(tag.clone())),
        Value::Sequence(items) => {
            let mut tags = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(tag) => tags.push(tag.to_string()),
                    None => {
                        return Err(RuleError::InvalidShape {
                            rule_id: rule_id.to_string(),
                            key: "destinations".to_string(),
                            detail: format!("expected a string, got {}", value_kind(item)),
                        })
                    }
                }
            }
            Ok(Destinations::Many(tags))
        }
        other => Err(RuleError::InvalidShape {
            rule_id: rule_id.to_string(),
            key: "destinations".to_string(),
            detail: format!("expected a string or list of strings, got {}", value_kind(other)),
        }),
    }
}

/// The top level of the criteria tree. `scratch` and `development` take a
/// literal boolean here; any other boolean is a rule-file mistake.
fn parse_rule_tree(rule_id: &str, criteria: &Mapping) -> Result<Vec<(String, Predicate)>, RuleError> {
    let mut tree = Vec::with_capacity(criteria.len());
    for (key, value) in criteria {
        let key = key.as_str().ok_or_else(|| RuleError::InvalidShape {
            rule_id: rule_id.to_string(),
            key: "rule".to_string(),
            detail: format!("property names must be strings, got {}", value_kind(key)),
        })?;
        let predicate = if matches!(key, "scratch" | "development") {
            match value {
                Value::Bool(flag) => Predicate::Bool(*flag),
                other => {
                    return Err(RuleError::InvalidShape {
                        rule_id: rule_id.to_string(),
                        key: key.to_string(),
                        detail: format!("expected a boolean, got {}", value_kind(other)),
                    })
                }
            }
        } else {
            parse_predicate(rule_id, key, value)?
        };
        tree.push((key.to_string(), predicate));
    }
    Ok(tree)
}

fn parse_predicate(rule_id: &str, key: &str, value: &Value) -> Result<Predicate, RuleError> {
    let invalid = |detail: String| RuleError::InvalidShape {
        rule_id: rule_id.to_string(),
        key: key.to_string(),
        detail,
    };
    match value {
        Value::String(pattern) => Ok(Predicate::Regex(pattern.clone())),
        Value::Sequence(items) => {
            let mut patterns = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(pattern) => patterns.push(pattern.to_string()),
                    None => {
                        return Err(invalid(format!(
                            "list alternatives must be regex strings, got {}",
                            value_kind(item)
                        )))
                    }
                }
            }
            Ok(Predicate::AnyOf(patterns))
        }
        Value::Mapping(nested) => {
            let mut entries = Vec::with_capacity(nested.len());
            for (sub_key, sub_value) in nested {
                let sub_key = sub_key.as_str().ok_or_else(|| {
                    invalid(format!(
                        "property names must be strings, got {}",
                        value_kind(sub_key)
                    ))
                })?;
                entries.push((
                    sub_key.to_string(),
                    parse_predicate(rule_id, sub_key, sub_value)?,
                ));
            }
            Ok(Predicate::All(entries))
        }
        other => Err(invalid(format!(
            "expected a regex, list or mapping, got {}",
            value_kind(other)
        ))),
    }
}

/// Load an ordered list of rule definitions from a YAML file. The file must
/// hold a sequence of rule mappings; the first bad rule aborts the load.
pub fn load_rules(path: &str) -> Result<Vec<RuleDef>, RuleError> {
    let content = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
        path: path.to_string(),
        source,
    })?;
    parse_rules_from(&content, path)
}

pub fn parse_rules(content: &str) -> Result<Vec<RuleDef>, RuleError> {
    parse_rules_from(content, "<inline>")
}

fn parse_rules_from(content: &str, origin: &str) -> Result<Vec<RuleDef>, RuleError> {
    let doc: Value = serde_yaml::from_str(content).map_err(|source| RuleError::Yaml {
        path: origin.to_string(),
        source,
    })?;
    let items = match doc {
        Value::Sequence(items) => items,
        _ => return Err(RuleError::NotAList(origin.to_string())),
    };
    let mut rules = Vec::with_capacity(items.len());
    for item in &items {
        match item {
            Value::Mapping(data) => rules.push(RuleDef::new(data)?),
            other => {
                return Err(RuleError::InvalidShape {
                    rule_id: "<unknown>".to_string(),
                    key: "rule definition".to_string(),
                    detail: format!("expected a mapping, got {}", value_kind(other)),
                })
            }
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_from_yaml(yaml: &str) -> Result<RuleDef, RuleError> {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        RuleDef::new(value.as_mapping().unwrap())
    }

    #[test]
    fn test_missing_required_fields() {
        for (yaml, field) in [
            ("type: module\ndestinations: foo", "id"),
            ("id: r1\ndestinations: foo", "type"),
            ("id: r1\ntype: module", "destinations"),
        ] {
            match rule_from_yaml(yaml) {
                Err(RuleError::MissingField(name)) => assert_eq!(name, field),
                other => panic!("expected MissingField({field}), got {other:?}"),
            }
        }
    }

    #[test]
    fn test_minimal_rule_without_criteria() {
        let rule = rule_from_yaml(
            r#"
id: catch-all
type: module
description: tag everything
destinations: modular-updates-candidate
"#,
        )
        .unwrap();
        assert_eq!(rule.id(), "catch-all");
        assert_eq!(rule.rule_type(), "module");
        assert_eq!(rule.description(), Some("tag everything"));
        assert!(rule.rule().is_none());
        assert_eq!(
            rule.destinations(),
            &Destinations::One("modular-updates-candidate".to_string())
        );
    }

    #[test]
    fn test_empty_rule_section_means_no_criteria() {
        let rule = rule_from_yaml(
            r#"
id: catch-all
type: module
rule:
destinations: modular-updates-candidate
"#,
        )
        .unwrap();
        assert!(rule.rule().is_none());
    }

    #[test]
    fn test_criteria_tree_shapes() {
        let rule = rule_from_yaml(
            r#"
id: platform-rule
type: module
rule:
  scratch: false
  name: [ruby, nodejs]
  dependencies:
    buildrequires:
      platform: 'f\d+'
destinations: modular-updates-candidate
"#,
        )
        .unwrap();
        let tree = rule.rule().unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0].0, "scratch");
        assert!(matches!(tree[0].1, Predicate::Bool(false)));
        assert_eq!(tree[1].0, "name");
        match &tree[1].1 {
            Predicate::AnyOf(patterns) => assert_eq!(patterns, &["ruby", "nodejs"]),
            other => panic!("expected AnyOf, got {other:?}"),
        }
        match &tree[2].1 {
            Predicate::All(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, "buildrequires");
                match &entries[0].1 {
                    Predicate::All(inner) => {
                        assert_eq!(inner[0].0, "platform");
                        assert!(matches!(&inner[0].1, Predicate::Regex(p) if p == r"f\d+"));
                    }
                    other => panic!("expected nested All, got {other:?}"),
                }
            }
            other => panic!("expected All, got {other:?}"),
        }
    }

    #[test]
    fn test_boolean_outside_flag_keys_is_rejected() {
        let err = rule_from_yaml(
            r#"
id: bad
type: module
rule:
  name: true
destinations: foo
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::InvalidShape { .. }));
    }

    #[test]
    fn test_non_boolean_scratch_is_rejected() {
        let err = rule_from_yaml(
            r#"
id: bad
type: module
rule:
  scratch: maybe
destinations: foo
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::InvalidShape { .. }));
    }

    #[test]
    fn test_nested_list_is_rejected() {
        let err = rule_from_yaml(
            r#"
id: bad
type: module
rule:
  name: [[a, b]]
destinations: foo
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::InvalidShape { .. }));
    }

    #[test]
    fn test_destinations_list() {
        let rule = rule_from_yaml(
            r#"
id: multi
type: module
destinations:
  - tag-a
  - tag-b
"#,
        )
        .unwrap();
        assert_eq!(
            rule.destinations().to_vec(),
            vec!["tag-a".to_string(), "tag-b".to_string()]
        );
    }

    #[test]
    fn test_parse_rules_keeps_file_order() {
        let rules = parse_rules(
            r#"
- id: first
  type: module
  destinations: tag-1
- id: second
  type: module
  destinations: tag-2
"#,
        )
        .unwrap();
        let ids: Vec<&str> = rules.iter().map(RuleDef::id).collect();
        assert_eq!(ids, ["first", "second"]);
    }

    #[test]
    fn test_parse_rules_rejects_non_list_document() {
        assert!(matches!(
            parse_rules("id: not-a-list"),
            Err(RuleError::NotAList(_))
        ));
    }

    #[test]
    fn test_parse_rules_aborts_on_first_bad_rule() {
        let err = parse_rules(
            r#"
- id: good
  type: module
  destinations: tag-1
- id: bad
  type: module
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::MissingField("destinations")));
    }
}
