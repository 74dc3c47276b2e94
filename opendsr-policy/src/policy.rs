use opendsr_graph::DataCategory;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::MaskingStrategy;

/// What a rule does with the data its targets select.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    Access,
    Erasure,
}

/// Names one data category a rule applies to. Matching is by
/// dotted-segment prefix: a target `user.provided.identifiable.contact`
/// selects every field categorized underneath it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTarget {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub data_category: DataCategory,
}

impl RuleTarget {
    pub fn new(key: impl Into<String>, data_category: impl Into<DataCategory>) -> Self {
        RuleTarget {
            key: key.into(),
            name: None,
            data_category: data_category.into(),
        }
    }
}

/// One rule of a [`Policy`]: an action, an optional masking strategy
/// (erasure only) and the categories it targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub action_type: ActionType,
    #[serde(default)]
    pub masking_strategy: Option<MaskingStrategy>,
    #[serde(default)]
    pub targets: Vec<RuleTarget>,
}

impl Rule {
    pub fn new(key: impl Into<String>, action_type: ActionType) -> Self {
        Rule {
            key: key.into(),
            name: None,
            action_type,
            masking_strategy: None,
            targets: Vec::new(),
        }
    }

    pub fn with_masking_strategy(mut self, strategy: MaskingStrategy) -> Self {
        self.masking_strategy = Some(strategy);
        self
    }

    pub fn with_target(mut self, target: RuleTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// True if any target of this rule selects one of `categories`.
    pub fn applies_to(&self, categories: &[DataCategory]) -> bool {
        self.matching_target(categories).is_some()
    }

    /// The first target selecting one of `categories`.
    pub fn matching_target(&self, categories: &[DataCategory]) -> Option<&RuleTarget> {
        self.targets.iter().find(|target| {
            categories
                .iter()
                .any(|category| target.data_category.is_prefix_of(category))
        })
    }

    /// Remove a target by key. Idempotent: removing an absent target
    /// returns `false` and changes nothing.
    pub fn remove_target(&mut self, key: &str) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t.key != key);
        self.targets.len() != before
    }
}

/// A set of rules executed on behalf of a privacy request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(key: impl Into<String>) -> Self {
        Policy {
            key: key.into(),
            name: None,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules_for(&self, action: ActionType) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.action_type == action)
    }

    /// The first erasure rule selecting any of the given field
    /// categories, if one exists.
    pub fn erasure_rule_for(&self, categories: &[DataCategory]) -> Option<&Rule> {
        self.rules_for(ActionType::Erasure)
            .find(|rule| rule.applies_to(categories))
    }

    /// Every category targeted by access rules; the requested set the
    /// result filter projects onto.
    pub fn access_target_categories(&self) -> Vec<DataCategory> {
        self.rules_for(ActionType::Access)
            .flat_map(|rule| rule.targets.iter().map(|t| t.data_category.clone()))
            .collect()
    }
}

/// An erasure policy with one null-rewrite rule targeting each given
/// category. The shape most tests and simple deployments use.
pub fn erasure_policy<I, C>(categories: I) -> Policy
where
    I: IntoIterator<Item = C>,
    C: Into<DataCategory>,
{
    let mut rule = Rule::new("erasure_rule", ActionType::Erasure)
        .with_masking_strategy(MaskingStrategy::NullRewrite);
    for (i, category) in categories.into_iter().enumerate() {
        rule = rule.with_target(RuleTarget::new(format!("target_{i}"), category));
    }
    Policy::new("erasure_policy").with_rule(rule)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn erasure_rule_matches_by_segment_prefix() {
        let policy = erasure_policy(["user.provided.identifiable.contact"]);
        let field_categories = vec![DataCategory::from(
            "user.provided.identifiable.contact.email",
        )];
        assert!(policy.erasure_rule_for(&field_categories).is_some());

        let unrelated = vec![DataCategory::from("system.operations")];
        assert!(policy.erasure_rule_for(&unrelated).is_none());
    }

    #[test]
    fn access_rules_do_not_mask() {
        let policy = Policy::new("p").with_rule(
            Rule::new("access", ActionType::Access)
                .with_target(RuleTarget::new("t", "user.provided")),
        );
        assert!(policy
            .erasure_rule_for(&[DataCategory::from("user.provided.identifiable")])
            .is_none());
        assert_eq!(
            policy.access_target_categories(),
            vec![DataCategory::from("user.provided")]
        );
    }

    #[test]
    fn target_removal_is_idempotent() {
        let mut rule = Rule::new("r", ActionType::Access)
            .with_target(RuleTarget::new("t1", "user.provided"));
        assert!(rule.remove_target("t1"));
        assert!(!rule.remove_target("t1"));
        assert!(rule.targets.is_empty());
    }
}
