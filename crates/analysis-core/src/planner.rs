//! The [`DagPlanner`] trait and [`PlannedCard`] builder (§4.6).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::job::RequestOptions;
use crate::source::Source;

/// One card emitted by a planner, before it becomes a [`crate::card::Card`]
/// row. Builder idiom modeled on the teacher's
/// `JobSpec::new(...).with_priority(...)` chain (`core.rs`).
#[derive(Debug, Clone)]
pub struct PlannedCard {
    pub card_type: String,
    pub priority: i32,
    pub concurrency_group: String,
    pub deadline_ms: Option<u64>,
    pub deps: BTreeSet<String>,
    pub internal: bool,
    /// When true, this card is only ever enqueued to the background
    /// refresh pool, never scheduled inline (§4.6 rule iii, the `full`
    /// resource card after a fast `preview`).
    pub background_only: bool,
}

impl PlannedCard {
    pub fn new(card_type: impl Into<String>) -> Self {
        PlannedCard {
            card_type: card_type.into(),
            priority: 0,
            concurrency_group: "default".to_string(),
            deadline_ms: None,
            deps: BTreeSet::new(),
            internal: false,
            background_only: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrency_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = group.into();
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn background_only(mut self) -> Self {
        self.background_only = true;
        self
    }
}

/// Checked *after* planning, per §4.6: "the planner never plans a cycle;
/// acyclicity is a postcondition checked explicitly." Returns the card_type
/// of a card found to participate in a cycle, if any.
pub fn find_cycle(cards: &[PlannedCard]) -> Option<String> {
    let by_type: HashMap<&str, &PlannedCard> =
        cards.iter().map(|c| (c.card_type.as_str(), c)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        node: &'a str,
        by_type: &HashMap<&'a str, &'a PlannedCard>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node.to_string()),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(card) = by_type.get(node) {
            for dep in &card.deps {
                if let Some(cycle_at) = visit(dep.as_str(), by_type, marks) {
                    return Some(cycle_at);
                }
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    for card in cards {
        if let Some(cycle_at) = visit(card.card_type.as_str(), &by_type, &mut marks) {
            return Some(cycle_at);
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("planner for source {0} not registered")]
    SourceNotSupported(String),
    #[error("planned dependency graph for card '{0}' is cyclic")]
    Cyclic(String),
    #[error("requested card type '{0}' is not declared for this source")]
    UnknownCardType(String),
}

/// Given `(source, requested_cards, options)`, emits the card list with
/// dependencies, priorities, concurrency groups, and deadlines (§4.6).
pub trait DagPlanner: Send + Sync {
    fn source(&self) -> Source;

    /// Full declared vocabulary of card types for this source, used to
    /// reject unknown requested cards up front.
    fn known_card_types(&self) -> &[&'static str];

    /// Plans cards for a request. `requested_cards` empty means "all
    /// business cards"; `options.preview` restricts to the fast subset.
    fn plan(
        &self,
        requested_cards: &HashSet<String>,
        options: &RequestOptions,
        input: &Value,
    ) -> Result<Vec<PlannedCard>, PlanError>;
}

/// Verifies a planner's output against the universal postconditions in
/// §4.6: acyclicity, and that every requested card type was actually
/// declared.
pub fn validate_plan(
    planner: &dyn DagPlanner,
    cards: &[PlannedCard],
    requested_cards: &HashSet<String>,
) -> Result<(), PlanError> {
    if let Some(cycle_at) = find_cycle(cards) {
        return Err(PlanError::Cyclic(cycle_at));
    }
    let known = planner.known_card_types();
    for requested in requested_cards {
        if !known.contains(&requested.as_str()) {
            return Err(PlanError::UnknownCardType(requested.clone()));
        }
    }
    Ok(())
}

/// Lookup table keyed by source, matching [`crate::handler::HandlerRegistry`]'s
/// table-lookup idiom. One [`DagPlanner`] per source; concrete registrations
/// (what card types a given source actually declares) are supplied by
/// whoever wires up the engine for that source.
#[derive(Default, Clone)]
pub struct PlannerRegistry {
    planners: HashMap<String, Arc<dyn DagPlanner>>,
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, planner: Arc<dyn DagPlanner>) {
        self.planners.insert(planner.source().tag().to_string(), planner);
    }

    pub fn get(&self, source: &Source) -> Option<Arc<dyn DagPlanner>> {
        self.planners.get(source.tag()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_plan_passes() {
        let cards = vec![
            PlannedCard::new("profile").internal(),
            PlannedCard::new("papers").with_deps(["profile".to_string()]),
            PlannedCard::new("summary").with_deps(["profile".to_string(), "papers".to_string()]),
        ];
        assert!(find_cycle(&cards).is_none());
    }

    #[test]
    fn cyclic_plan_is_detected() {
        let cards = vec![
            PlannedCard::new("a").with_deps(["b".to_string()]),
            PlannedCard::new("b").with_deps(["a".to_string()]),
        ];
        assert!(find_cycle(&cards).is_some());
    }

    #[test]
    fn builder_chains_like_teachers_jobspec() {
        let card = PlannedCard::new("summary")
            .with_priority(5)
            .with_concurrency_group("llm")
            .with_deadline_ms(8_000)
            .with_deps(["profile".to_string()]);
        assert_eq!(card.priority, 5);
        assert_eq!(card.concurrency_group, "llm");
        assert_eq!(card.deadline_ms, Some(8_000));
        assert!(card.deps.contains("profile"));
    }
}
