//! The rules stage's pure, deterministic rule set (§4.5 step 3): ECONOMIC,
//! NON_ECONOMIC, and WORKFLOW groups evaluated in priority order, each rule
//! a `predicate` over the opaque payload plus a list of actions mutating
//! only the blotter. The engine itself never interprets the CDM schema —
//! that knowledge lives entirely in the `predicate`/`actions` closures a
//! deployment supplies.

use serde_json::Value;

use crate::domain::SwapBlotter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleGroup {
    Economic,
    NonEconomic,
    Workflow,
}

/// A mutation a matched rule applies to the blotter. Actions never touch
/// `payload` directly — they record warnings or stamp metadata, keeping the
/// opaque CDM body untouched by anything this crate does.
#[derive(Debug, Clone)]
pub enum RuleAction {
    AddWarning(String),
    SetEnrichmentSource(String),
}

pub struct Rule {
    pub id: String,
    pub group: RuleGroup,
    pub priority: i32,
    pub predicate: fn(&Value) -> bool,
    pub actions: Vec<RuleAction>,
}

/// An ordered collection of rules plus the version stamped into
/// `ProcessingMetadata.ruleset_version` so a reprocessed trade can be traced
/// back to the rule set that produced it.
pub struct RuleSet {
    pub version: String,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            rules: Vec::new(),
        }
    }

    /// Evaluate every rule whose predicate matches `blotter.payload`, in
    /// `(group, priority)` order, applying each match's actions to
    /// `blotter`. Returns the ids of the rules that matched, for
    /// `ProcessingMetadata.applied_rule_ids`.
    pub fn evaluate(&self, blotter: &mut SwapBlotter) -> Vec<String> {
        let mut ordered: Vec<&Rule> = self.rules.iter().collect();
        ordered.sort_by_key(|r| (r.group, r.priority));

        let mut applied = Vec::new();
        for rule in ordered {
            if !(rule.predicate)(&blotter.payload) {
                continue;
            }
            for action in &rule.actions {
                match action {
                    RuleAction::AddWarning(msg) => blotter.metadata.warnings.push(msg.clone()),
                    RuleAction::SetEnrichmentSource(src) => {
                        blotter.metadata.enrichment_source = Some(src.clone())
                    }
                }
            }
            applied.push(rule.id.clone());
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade_request::{Source, TradeRequest};

    fn blotter() -> SwapBlotter {
        let req = TradeRequest::new(
            "T1".into(),
            "A_B_C".into(),
            None,
            None,
            None,
            Source::Api,
            serde_json::json!({"notional": 10_000_000}),
            None,
        )
        .unwrap();
        SwapBlotter::from_request(&req)
    }

    #[test]
    fn matching_rule_applies_actions_in_priority_order() {
        let mut set = RuleSet::empty("v1");
        set.rules.push(Rule {
            id: "large-notional-flag".into(),
            group: RuleGroup::Economic,
            priority: 10,
            predicate: |v| v.get("notional").and_then(Value::as_i64).unwrap_or(0) > 5_000_000,
            actions: vec![RuleAction::AddWarning("large notional".into())],
        });
        set.rules.push(Rule {
            id: "default-source".into(),
            group: RuleGroup::NonEconomic,
            priority: 0,
            predicate: |_| true,
            actions: vec![RuleAction::SetEnrichmentSource("rules-engine".into())],
        });

        let mut b = blotter();
        let applied = set.evaluate(&mut b);
        assert_eq!(applied, vec!["large-notional-flag", "default-source"]);
        assert_eq!(b.metadata.warnings, vec!["large notional"]);
        assert_eq!(b.metadata.enrichment_source.as_deref(), Some("rules-engine"));
    }

    #[test]
    fn non_matching_rule_is_skipped() {
        let mut set = RuleSet::empty("v1");
        set.rules.push(Rule {
            id: "never".into(),
            group: RuleGroup::Workflow,
            priority: 0,
            predicate: |_| false,
            actions: vec![RuleAction::AddWarning("should not appear".into())],
        });
        let mut b = blotter();
        assert!(set.evaluate(&mut b).is_empty());
        assert!(b.metadata.warnings.is_empty());
    }
}
