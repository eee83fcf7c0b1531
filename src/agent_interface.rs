//! Module defining traits that need to be implemented to plug a decision-making agent in

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;

use crate::game_state::{GameState, GameUpdate};
use crate::protocol::Move;

/// What the agent should implement
pub trait Agent {
    /// Choose the moves to play after the state changed.
    ///
    /// Moves whose `end` is `-1` are discarded.
    fn on_update(&mut self, state: &GameState) -> Vec<Move>;
}

/// What will be given to the session controller to allow it to create agents
pub trait AgentFactory {
    /// Agent type created for each round.
    type Agent: Agent;

    /// Returns a fresh agent for a round, seeded with its first snapshot
    fn new_agent(&self, player_index: usize, first: &GameState) -> Self::Agent;
}

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(1);

/// Per-round owner of an agent and of the state it plays on.
///
/// One adapter is created on the first update of a round and dropped when the round ends, so
/// nothing an agent accumulates can leak into the next round.
#[derive(Debug)]
pub struct AgentAdapter<A> {
    id: u64,
    state: GameState,
    agent: A,
    move_count: u64,
}

impl<A: Agent> AgentAdapter<A> {
    /// Build the state from the first update of the round and create the agent.
    ///
    /// # Errors
    /// Returned when the first update is malformed.
    pub fn new<F: AgentFactory<Agent = A>>(
        factory: &F,
        player_index: usize,
        first: &GameUpdate,
    ) -> anyhow::Result<(AgentAdapter<A>, Vec<Move>)> {
        let state = GameState::new(player_index, first).context("invalid first update")?;
        let agent = factory.new_agent(player_index, &state);
        let mut adapter = AgentAdapter {
            id: NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed),
            state,
            agent,
            move_count: 0,
        };
        let moves = adapter.decide();
        Ok((adapter, moves))
    }

    /// Apply an update and ask the agent for moves.
    ///
    /// # Errors
    /// Returned when the update is malformed; the agent is not consulted.
    pub fn update(&mut self, update: &GameUpdate) -> anyhow::Result<Vec<Move>> {
        self.state.update(update)?;
        Ok(self.decide())
    }

    fn decide(&mut self) -> Vec<Move> {
        let moves = self
            .agent
            .on_update(&self.state)
            .into_iter()
            .filter(|m| m.end != -1)
            .collect::<Vec<_>>();
        self.move_count += moves.len() as u64;
        moves
    }

    /// Unique id of this adapter instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Derived game state.
    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Moves emitted since the adapter was created.
    pub fn move_count(&self) -> u64 {
        self.move_count
    }

    /// The wrapped agent.
    pub fn agent(&self) -> &A {
        &self.agent
    }
}

#[cfg(test)]
mod interface_tests {
    use super::*;

    struct CountingAgent {
        calls: u32,
    }

    impl Agent for CountingAgent {
        fn on_update(&mut self, _state: &GameState) -> Vec<Move> {
            self.calls += 1;
            vec![
                Move {
                    start: 0,
                    end: 1,
                    is50: false,
                },
                Move {
                    start: 0,
                    end: -1,
                    is50: false,
                },
            ]
        }
    }

    struct CountingFactory;

    impl AgentFactory for CountingFactory {
        type Agent = CountingAgent;

        fn new_agent(&self, _player_index: usize, _first: &GameState) -> CountingAgent {
            CountingAgent { calls: 0 }
        }
    }

    fn first_update() -> GameUpdate {
        GameUpdate {
            turn: 1,
            map_diff: vec![0, 6, 2, 1, 3, 0, 0, -1],
            cities_diff: vec![],
            generals: vec![0],
            scores: vec![],
        }
    }

    #[test]
    fn adapter_counts_only_real_moves() {
        let (mut adapter, moves) = AgentAdapter::new(&CountingFactory, 0, &first_update()).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(adapter.move_count(), 1);
        let moves = adapter
            .update(&GameUpdate {
                turn: 2,
                map_diff: vec![6],
                ..GameUpdate::default()
            })
            .unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(adapter.move_count(), 2);
        assert_eq!(adapter.agent().calls, 2);
        assert_eq!(adapter.state().turn(), 2);
    }

    #[test]
    fn adapters_have_distinct_ids() {
        let (a, _) = AgentAdapter::new(&CountingFactory, 0, &first_update()).unwrap();
        let (b, _) = AgentAdapter::new(&CountingFactory, 0, &first_update()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn malformed_update_does_not_reach_agent() {
        let (mut adapter, _) = AgentAdapter::new(&CountingFactory, 0, &first_update()).unwrap();
        assert!(adapter
            .update(&GameUpdate {
                turn: 2,
                map_diff: vec![99],
                ..GameUpdate::default()
            })
            .is_err());
        assert_eq!(adapter.agent().calls, 1);
    }
}
