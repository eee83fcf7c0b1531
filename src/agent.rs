//! Stub agent shipped with the binary.

use crate::agent_interface::{Agent, AgentFactory};
use crate::game_state::GameState;
use crate::protocol::Move;

/// Pushes its largest army onto the weakest adjacent tile it does not own.
///
/// Waits while earlier moves are still queued on the server.
#[derive(Debug, Default)]
pub struct FrontierAgent {
    queued_moves: u32,
}

impl Agent for FrontierAgent {
    fn on_update(&mut self, state: &GameState) -> Vec<Move> {
        self.queued_moves = self.queued_moves.saturating_sub(1);
        if self.queued_moves > 0 {
            return vec![];
        }

        let Some((&start, &army)) = state.own_tiles().iter().max_by_key(|(_, &army)| army) else {
            return vec![];
        };
        if army < 2 {
            return vec![];
        }

        let target = state
            .neighbours(start)
            .into_iter()
            .filter(|&tile| state.is_passable(tile) && !state.own_tiles().contains_key(&tile))
            .min_by_key(|&tile| state.armies()[tile]);

        match target {
            Some(end) => {
                self.queued_moves += 1;
                vec![Move {
                    start,
                    end: end as i64,
                    is50: false,
                }]
            }
            None => vec![],
        }
    }
}

/// Creates a [`FrontierAgent`] per round.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrontierAgentFactory;

impl AgentFactory for FrontierAgentFactory {
    type Agent = FrontierAgent;

    fn new_agent(&self, _player_index: usize, _first: &GameState) -> FrontierAgent {
        FrontierAgent::default()
    }
}
