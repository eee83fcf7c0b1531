//! Game state derived from the server's incremental updates.
//!
//! Each `game_update` carries `map_diff` and `cities_diff`, encoded against the previous
//! snapshot as alternating runs: "keep the next `n` values", then "replace the next `n` values
//! with the `n` values that follow". The map itself is `[width, height, armies..., terrain...]`.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terrain value of an empty visible tile.
pub const TILE_EMPTY: i64 = -1;
/// Terrain value of a visible mountain.
pub const TILE_MOUNTAIN: i64 = -2;
/// Terrain value of a tile hidden by fog.
pub const TILE_FOG: i64 = -3;
/// Terrain value of an obstacle (mountain or city) hidden by fog.
pub const TILE_FOG_OBSTACLE: i64 = -4;

/// Score line of one player.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    /// Total army.
    #[serde(default)]
    pub total: i64,
    /// Owned tiles.
    #[serde(default)]
    pub tiles: i64,
    /// Player index.
    #[serde(default)]
    pub i: usize,
    /// Eliminated.
    #[serde(default)]
    pub dead: bool,
}

/// Typed view of a `game_update` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GameUpdate {
    /// Server turn counter.
    pub turn: u64,
    /// Patch of the map array.
    #[serde(default)]
    pub map_diff: Vec<i64>,
    /// Patch of the city list.
    #[serde(default)]
    pub cities_diff: Vec<i64>,
    /// Known general positions, `-1` when unknown.
    #[serde(default)]
    pub generals: Vec<i64>,
    /// Scores of all players.
    #[serde(default)]
    pub scores: Vec<Score>,
}

impl GameUpdate {
    /// Decode a raw payload.
    pub fn from_value(value: &Value) -> anyhow::Result<GameUpdate> {
        GameUpdate::deserialize(value).context("invalid game_update payload")
    }
}

/// Apply a diff to `old`.
pub fn patch(old: &[i64], diff: &[i64]) -> anyhow::Result<Vec<i64>> {
    let mut out = Vec::with_capacity(old.len());
    let mut i = 0;
    while i < diff.len() {
        let keep = run_length(diff[i])?;
        if keep > 0 {
            let from = out.len();
            let kept = old
                .get(from..from + keep)
                .with_context(|| format!("diff keeps {keep} values past the end at {from}"))?;
            out.extend_from_slice(kept);
        }
        i += 1;
        if i < diff.len() {
            let replace = run_length(diff[i])?;
            if replace > 0 {
                let values = diff
                    .get(i + 1..i + 1 + replace)
                    .with_context(|| format!("diff replaces {replace} values past its end"))?;
                out.extend_from_slice(values);
                i += replace;
            }
        }
        i += 1;
    }
    Ok(out)
}

fn run_length(value: i64) -> anyhow::Result<usize> {
    usize::try_from(value).with_context(|| format!("negative run length {value}"))
}

/// Board as known by one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    player_index: usize,
    width: usize,
    height: usize,
    turn: u64,
    map: Vec<i64>,
    cities: Vec<i64>,
    generals: Vec<i64>,
    scores: Vec<Score>,
    discovered_tiles: Vec<bool>,
    own_tiles: BTreeMap<usize, i64>,
    enemy_tiles: BTreeMap<usize, i64>,
}

impl GameState {
    /// Build the state from the first update of a round.
    pub fn new(player_index: usize, first: &GameUpdate) -> anyhow::Result<GameState> {
        let mut state = GameState {
            player_index,
            width: 0,
            height: 0,
            turn: 0,
            map: vec![],
            cities: vec![],
            generals: vec![],
            scores: vec![],
            discovered_tiles: vec![],
            own_tiles: BTreeMap::new(),
            enemy_tiles: BTreeMap::new(),
        };
        state.update(first)?;
        Ok(state)
    }

    /// Apply a later update.
    ///
    /// The state is left untouched when the update is malformed.
    pub fn update(&mut self, update: &GameUpdate) -> anyhow::Result<()> {
        let map = patch(&self.map, &update.map_diff).context("invalid map_diff")?;
        let cities = patch(&self.cities, &update.cities_diff).context("invalid cities_diff")?;
        if map.len() < 2 {
            bail!("map has no dimensions");
        }
        let width = run_length(map[0]).context("invalid width")?;
        let height = run_length(map[1]).context("invalid height")?;
        let expected = width
            .checked_mul(height)
            .and_then(|size| size.checked_mul(2))
            .and_then(|cells| cells.checked_add(2))
            .with_context(|| format!("map of {width}x{height} is too large"))?;
        if map.len() != expected {
            bail!(
                "map of {}x{} should hold {} values, got {}",
                width,
                height,
                expected,
                map.len()
            );
        }
        let size = width * height;
        if self.discovered_tiles.len() != size {
            self.discovered_tiles = vec![false; size];
        }

        self.width = width;
        self.height = height;
        self.turn = update.turn;
        self.map = map;
        self.cities = cities;
        self.generals = update.generals.clone();
        self.scores = update.scores.clone();
        self.refresh_tiles();
        Ok(())
    }

    fn refresh_tiles(&mut self) {
        let size = self.size();
        self.own_tiles.clear();
        self.enemy_tiles.clear();
        for index in 0..size {
            let army = self.map[2 + index];
            let terrain = self.map[2 + size + index];
            if terrain != TILE_FOG && terrain != TILE_FOG_OBSTACLE {
                self.discovered_tiles[index] = true;
            }
            if terrain >= 0 {
                if terrain as usize == self.player_index {
                    self.own_tiles.insert(index, army);
                } else {
                    self.enemy_tiles.insert(index, army);
                }
            }
        }
    }

    /// Index of this player.
    pub fn player_index(&self) -> usize {
        self.player_index
    }

    /// Board width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Board height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of tiles.
    pub fn size(&self) -> usize {
        self.width * self.height
    }

    /// Last turn received.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Army count per tile.
    pub fn armies(&self) -> &[i64] {
        &self.map[2..2 + self.size()]
    }

    /// Terrain per tile.
    pub fn terrain(&self) -> &[i64] {
        &self.map[2 + self.size()..]
    }

    /// Known city tiles.
    pub fn cities(&self) -> &[i64] {
        &self.cities
    }

    /// Known general tiles, `-1` when unknown.
    pub fn generals(&self) -> &[i64] {
        &self.generals
    }

    /// Scores of the last update.
    pub fn scores(&self) -> &[Score] {
        &self.scores
    }

    /// Tiles seen at least once this round.
    pub fn discovered_tiles(&self) -> &[bool] {
        &self.discovered_tiles
    }

    /// Tile of this player's general.
    pub fn own_general(&self) -> i64 {
        self.generals.get(self.player_index).copied().unwrap_or(-1)
    }

    /// First known enemy general, `-1` if none is known.
    pub fn enemy_general(&self) -> i64 {
        self.generals
            .iter()
            .enumerate()
            .find(|(i, &tile)| *i != self.player_index && tile >= 0)
            .map(|(_, &tile)| tile)
            .unwrap_or(-1)
    }

    /// Owned tiles and their army.
    pub fn own_tiles(&self) -> &BTreeMap<usize, i64> {
        &self.own_tiles
    }

    /// Visible enemy tiles and their army.
    pub fn enemy_tiles(&self) -> &BTreeMap<usize, i64> {
        &self.enemy_tiles
    }

    /// Largest army standing on an owned tile.
    pub fn max_army_on_tile(&self) -> i64 {
        self.own_tiles.values().copied().max().unwrap_or(0).max(0)
    }

    /// Orthogonal neighbours of `index`.
    pub fn neighbours(&self, index: usize) -> Vec<usize> {
        let (row, col) = (index / self.width, index % self.width);
        let mut out = Vec::with_capacity(4);
        if row > 0 {
            out.push(index - self.width);
        }
        if row + 1 < self.height {
            out.push(index + self.width);
        }
        if col > 0 {
            out.push(index - 1);
        }
        if col + 1 < self.width {
            out.push(index + 1);
        }
        out
    }

    /// A tile an army can move onto.
    pub fn is_passable(&self, index: usize) -> bool {
        let terrain = self.terrain()[index];
        terrain != TILE_MOUNTAIN && terrain != TILE_FOG_OBSTACLE
    }
}

/// Entries of a tile map as `[[index, army], ...]`.
pub fn tile_entries(tiles: &BTreeMap<usize, i64>) -> Vec<(usize, i64)> {
    tiles.iter().map(|(&index, &army)| (index, army)).collect()
}
