//! Generic table-driven state machine engine.
//!
//! A machine is a static list of legal `(from, to, actors)` edges. Attempting a
//! transition is a pure lookup:
//!
//! - no edge between `from` and `to` → [`TransitionError::NoSuchEdge`]
//! - an edge exists but the actor kind is not listed → [`TransitionError::WrongActor`]
//!
//! The two outcomes stay distinct so callers can tell an impossible
//! request from an unauthorized one. Invalid targets are never clamped.

use core::fmt::Debug;
use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use taxguard_core::{ActorKind, EntityKind};

use crate::error::TransitionError;

/// A lifecycle status value with a stable wire name.
pub trait Status: Copy + Eq + core::hash::Hash + Debug + 'static {
    fn as_str(&self) -> &'static str;

    fn parse(s: &str) -> Option<Self>;
}

/// A single legal edge of a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge<S: 'static> {
    pub from: S,
    pub to: S,
    pub actors: &'static [ActorKind],
}

impl<S: Status> Edge<S> {
    pub fn permits(&self, actor: ActorKind) -> bool {
        self.actors.contains(&actor)
    }
}

/// A validated status change, ready to be committed by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedTransition<S> {
    pub entity: EntityKind,
    pub from: S,
    pub to: S,
    pub actor: ActorKind,
}

/// A lifecycle state machine backed by an explicit transition table.
pub trait StateMachine {
    type State: Status;

    const ENTITY: EntityKind;

    /// Every state the entity can be in.
    fn states() -> &'static [Self::State];

    /// The state newly created rows start in.
    fn initial() -> Self::State;

    /// States allowed to have no outgoing edges.
    fn is_terminal(state: Self::State) -> bool;

    /// The exhaustive list of legal edges.
    fn edges() -> &'static [Edge<Self::State>];

    fn edge(from: Self::State, to: Self::State) -> Option<&'static Edge<Self::State>> {
        Self::edges().iter().find(|e| e.from == from && e.to == to)
    }

    /// Check whether `actor` may move an entity from `from` to `to`.
    fn attempt(
        from: Self::State,
        to: Self::State,
        actor: ActorKind,
    ) -> Result<PlannedTransition<Self::State>, TransitionError> {
        let Some(edge) = Self::edge(from, to) else {
            return Err(TransitionError::NoSuchEdge {
                entity: Self::ENTITY,
                from: from.as_str(),
                to: to.as_str(),
            });
        };

        if !edge.permits(actor) {
            return Err(TransitionError::WrongActor {
                entity: Self::ENTITY,
                from: from.as_str(),
                to: to.as_str(),
                actor,
            });
        }

        Ok(PlannedTransition {
            entity: Self::ENTITY,
            from,
            to,
            actor,
        })
    }

    /// Targets reachable from `from` by `actor` in one step.
    fn targets_for(from: Self::State, actor: ActorKind) -> Vec<Self::State> {
        Self::edges()
            .iter()
            .filter(|e| e.from == from && e.permits(actor))
            .map(|e| e.to)
            .collect()
    }
}

/// A structural defect in a transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableDefect {
    /// A non-terminal state with zero outgoing edges.
    DeadEnd { entity: EntityKind, state: &'static str },
    /// A terminal state that nevertheless has outgoing edges.
    EdgeFromTerminal {
        entity: EntityKind,
        from: &'static str,
        to: &'static str,
    },
    DuplicateEdge {
        entity: EntityKind,
        from: &'static str,
        to: &'static str,
    },
    /// An edge nobody may trigger.
    EmptyActorSet {
        entity: EntityKind,
        from: &'static str,
        to: &'static str,
    },
    Unreachable { entity: EntityKind, state: &'static str },
}

impl core::fmt::Display for TableDefect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TableDefect::DeadEnd { entity, state } => {
                write!(f, "{entity}: non-terminal state '{state}' has no outgoing edges")
            }
            TableDefect::EdgeFromTerminal { entity, from, to } => {
                write!(f, "{entity}: terminal state '{from}' has an edge to '{to}'")
            }
            TableDefect::DuplicateEdge { entity, from, to } => {
                write!(f, "{entity}: edge '{from}' -> '{to}' is listed more than once")
            }
            TableDefect::EmptyActorSet { entity, from, to } => {
                write!(f, "{entity}: edge '{from}' -> '{to}' has no permitted actor")
            }
            TableDefect::Unreachable { entity, state } => {
                write!(f, "{entity}: state '{state}' is unreachable from the initial state")
            }
        }
    }
}

/// Check a machine's table for internal consistency.
pub fn check_consistency<M: StateMachine>() -> Vec<TableDefect> {
    let entity = M::ENTITY;
    let edges = M::edges();
    let mut defects = Vec::new();

    let mut seen = HashSet::new();
    for edge in edges {
        if !seen.insert((edge.from, edge.to)) {
            defects.push(TableDefect::DuplicateEdge {
                entity,
                from: edge.from.as_str(),
                to: edge.to.as_str(),
            });
        }
        if edge.actors.is_empty() {
            defects.push(TableDefect::EmptyActorSet {
                entity,
                from: edge.from.as_str(),
                to: edge.to.as_str(),
            });
        }
        if M::is_terminal(edge.from) {
            defects.push(TableDefect::EdgeFromTerminal {
                entity,
                from: edge.from.as_str(),
                to: edge.to.as_str(),
            });
        }
    }

    for &state in M::states() {
        if !M::is_terminal(state) && !edges.iter().any(|e| e.from == state) {
            defects.push(TableDefect::DeadEnd {
                entity,
                state: state.as_str(),
            });
        }
    }

    // Breadth-first walk from the initial state.
    let mut reached = HashSet::from([M::initial()]);
    let mut queue = VecDeque::from([M::initial()]);
    while let Some(state) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.from == state) {
            if reached.insert(edge.to) {
                queue.push_back(edge.to);
            }
        }
    }
    for &state in M::states() {
        if !reached.contains(&state) {
            defects.push(TableDefect::Unreachable {
                entity,
                state: state.as_str(),
            });
        }
    }

    defects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Toy {
        A,
        B,
        C,
    }

    impl Status for Toy {
        fn as_str(&self) -> &'static str {
            match self {
                Toy::A => "a",
                Toy::B => "b",
                Toy::C => "c",
            }
        }

        fn parse(s: &str) -> Option<Self> {
            [Toy::A, Toy::B, Toy::C].into_iter().find(|t| t.as_str() == s)
        }
    }

    struct Broken;

    // B is a dead end, C is terminal yet has an edge and is unreachable.
    static BROKEN_EDGES: &[Edge<Toy>] = &[
        Edge { from: Toy::A, to: Toy::B, actors: &[ActorKind::Staff] },
        Edge { from: Toy::A, to: Toy::B, actors: &[ActorKind::Staff] },
        Edge { from: Toy::C, to: Toy::A, actors: &[] },
    ];

    impl StateMachine for Broken {
        type State = Toy;
        const ENTITY: EntityKind = EntityKind::Document;

        fn states() -> &'static [Toy] {
            &[Toy::A, Toy::B, Toy::C]
        }

        fn initial() -> Toy {
            Toy::A
        }

        fn is_terminal(state: Toy) -> bool {
            state == Toy::C
        }

        fn edges() -> &'static [Edge<Toy>] {
            BROKEN_EDGES
        }
    }

    #[test]
    fn consistency_check_reports_every_defect_kind() {
        let defects = check_consistency::<Broken>();
        let entity = EntityKind::Document;

        assert!(defects.contains(&TableDefect::DuplicateEdge { entity, from: "a", to: "b" }));
        assert!(defects.contains(&TableDefect::EmptyActorSet { entity, from: "c", to: "a" }));
        assert!(defects.contains(&TableDefect::EdgeFromTerminal { entity, from: "c", to: "a" }));
        assert!(defects.contains(&TableDefect::DeadEnd { entity, state: "b" }));
        assert!(defects.contains(&TableDefect::Unreachable { entity, state: "c" }));
    }

    #[test]
    fn missing_edge_and_wrong_actor_are_distinct() {
        assert!(matches!(
            Broken::attempt(Toy::B, Toy::A, ActorKind::Staff),
            Err(TransitionError::NoSuchEdge { .. })
        ));
        assert!(matches!(
            Broken::attempt(Toy::A, Toy::B, ActorKind::EndUser),
            Err(TransitionError::WrongActor { actor: ActorKind::EndUser, .. })
        ));
        assert!(Broken::attempt(Toy::A, Toy::B, ActorKind::Staff).is_ok());
    }
}
