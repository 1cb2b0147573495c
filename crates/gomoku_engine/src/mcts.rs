//! MCTS - PUCT tree search with pluggable leaf evaluation
//!
//! Values are always expressed from the point of view of the player to move at
//! the node they belong to; a parent sees a child's value negated.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Gamma};

use crate::board::{Action, Board};
use crate::models::Model;

pub const PUCT_C_BASE: f32 = 19652.0;
pub const PUCT_C_INIT: f32 = 1.25;
pub const ROOT_DIRICHLET_ALPHA: f32 = 0.3;
pub const ROOT_EXPLORATION_FRACTION: f32 = 0.25;
pub const SAMPLING_MOVES: usize = 8;

#[derive(Copy, Clone, Debug)]
pub struct SearchParams {
    pub iterations: usize,
    pub c_base: f32,
    pub c_init: f32,
    pub dirichlet_alpha: f32,
    pub exploration_fraction: f32,
    /// Adds root noise and samples early moves by visit count.
    pub selfplay: bool,
    /// Number of opening plies that are sampled rather than played greedily.
    pub temperature_moves: usize,
}

impl SearchParams {
    pub fn default_selfplay(iterations: usize) -> SearchParams {
        SearchParams {
            iterations,
            c_base: PUCT_C_BASE,
            c_init: PUCT_C_INIT,
            dirichlet_alpha: ROOT_DIRICHLET_ALPHA,
            exploration_fraction: ROOT_EXPLORATION_FRACTION,
            selfplay: true,
            temperature_moves: SAMPLING_MOVES,
        }
    }

    pub fn default_eval(iterations: usize) -> SearchParams {
        SearchParams {
            selfplay: false,
            temperature_moves: 0,
            ..Self::default_selfplay(iterations)
        }
    }
}

/// Scores a non-terminal position.
pub trait Evaluator {
    /// Returns priors aligned with `board.legal_actions()` and the value of the
    /// position for the player to move. Any randomness draws from `rng`.
    fn evaluate(&self, board: &Board, rng: &mut dyn RngCore) -> Result<(Vec<f32>, f32)>;
}

/// Uniform priors, value from a single random playout.
#[derive(Clone, Copy, Debug, Default)]
pub struct RolloutEvaluator;

impl Evaluator for RolloutEvaluator {
    fn evaluate(&self, board: &Board, rng: &mut dyn RngCore) -> Result<(Vec<f32>, f32)> {
        let n = board.legal_actions().len();
        let priors = vec![1.0 / n as f32; n];

        let mover = board.turn();
        let mut playout = board.clone();
        while let Some(action) = playout.random_legal_action(rng) {
            playout.make_action(action)?;
        }
        let value = playout.outcome().map_or(0.0, |o| o.reward_for(mover));
        Ok((priors, value))
    }
}

/// Policy/value network evaluation on a single position.
pub struct ModelEvaluator {
    pub model: Model,
    pub device: Device,
}

impl ModelEvaluator {
    pub fn new(model: Model, device: Device) -> Self {
        Self { model, device }
    }
}

impl Evaluator for ModelEvaluator {
    fn evaluate(&self, board: &Board, _rng: &mut dyn RngCore) -> Result<(Vec<f32>, f32)> {
        if board.size() != self.model.size() {
            bail!(
                "model expects a {}x{} board, got {}x{}",
                self.model.size(),
                self.model.size(),
                board.size(),
                board.size()
            );
        }
        let repr = board.to_repr();
        let len = repr.len();
        let input = Tensor::from_vec(repr, (1, len), &self.device)?;
        let out = self
            .model
            .forward(&input)?
            .to_dtype(DType::F32)?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        let (logits, value) = out.split_at(len - 1);

        // softmax restricted to the legal squares
        let legal: Vec<f32> = board
            .legal_actions()
            .iter()
            .map(|a| logits[a.0])
            .collect();
        let max = legal.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = legal.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        let priors = exp.into_iter().map(|e| e / total).collect();

        Ok((priors, value[0]))
    }
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub action: Action,
    /// Visit distribution over every square of the board (zeros on occupied ones).
    pub policy: Vec<f32>,
    /// Mean value at the root for the player to move.
    pub root_value: f32,
    pub iterations: usize,
}

pub fn search<E, R>(
    board: &Board,
    evaluator: &E,
    params: &SearchParams,
    rng: &mut R,
) -> Result<SearchResult>
where
    E: Evaluator + ?Sized,
    R: Rng + ?Sized,
{
    if board.is_game_over() {
        bail!("cannot search a finished game");
    }

    let mut root = Node::default();
    let iterations = params.iterations.max(1);
    for _ in 0..iterations {
        let mut scratch = board.clone();
        root.simulate(&mut scratch, evaluator, params, rng, true)?;
    }

    let mut policy = vec![0.0; board.num_squares()];
    for edge in &root.children {
        policy[edge.action.0] = edge.node.visits as f32;
    }
    let total: f32 = policy.iter().sum();
    policy.iter_mut().for_each(|p| *p /= total);

    let sample = params.selfplay && board.num_stones_placed() < params.temperature_moves;
    let chosen = if sample {
        root.sample_child_by_visits(rng)
    } else {
        root.max_child_by_visits()
    };
    let Some(chosen) = chosen else {
        bail!("root has no children after {iterations} iterations");
    };

    Ok(SearchResult {
        action: chosen.action,
        policy,
        root_value: root.expected_value(),
        iterations,
    })
}

#[derive(Default)]
struct Node {
    visits: u32,
    value_sum: f32,
    children: Vec<Edge>,
}

struct Edge {
    action: Action,
    prior: f32,
    node: Node,
}

impl Node {
    fn expected_value(&self) -> f32 {
        if self.visits == 0 {
            0.0
        } else {
            self.value_sum / self.visits as f32
        }
    }

    fn max_child_by_visits(&self) -> Option<&Edge> {
        self.children.iter().max_by_key(|e| e.node.visits)
    }

    fn sample_child_by_visits<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Edge> {
        let total: u32 = self.children.iter().map(|e| e.node.visits).sum();
        if total == 0 {
            return self.max_child_by_visits();
        }
        let mut i = rng.gen_range(0..total);
        for edge in &self.children {
            if i < edge.node.visits {
                return Some(edge);
            }
            i -= edge.node.visits;
        }
        None
    }

    fn select(&mut self, params: &SearchParams) -> Option<&mut Edge> {
        let parent_visits = self.visits as f32;
        let c = ((1.0 + parent_visits + params.c_base) / params.c_base).ln() + params.c_init;
        self.children
            .iter_mut()
            .map(|e| {
                let n = e.node.visits as f32;
                let q = -e.node.expected_value();
                let u = c * e.prior * parent_visits.sqrt() / (1.0 + n);
                let score = q + u;
                (e, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(e, _)| e)
    }

    fn expand<R: Rng + ?Sized>(
        &mut self,
        board: &Board,
        mut priors: Vec<f32>,
        params: &SearchParams,
        rng: &mut R,
        add_noise: bool,
    ) -> Result<()> {
        if add_noise && priors.len() > 1 {
            let gamma = Gamma::new(params.dirichlet_alpha, 1.0)?;
            let noise: Vec<f32> = priors.iter().map(|_| gamma.sample(rng)).collect();
            let total: f32 = noise.iter().sum::<f32>().max(f32::MIN_POSITIVE);
            let f = params.exploration_fraction;
            for (p, x) in priors.iter_mut().zip(noise) {
                *p = *p * (1.0 - f) + (x / total) * f;
            }
        }

        self.children = board
            .legal_actions()
            .iter()
            .zip(priors)
            .map(|(&action, prior)| Edge {
                action,
                prior,
                node: Node::default(),
            })
            .collect();
        Ok(())
    }

    /// Runs one selection/expansion/backup pass and returns the value for the
    /// player to move on `board`.
    fn simulate<E, R>(
        &mut self,
        board: &mut Board,
        evaluator: &E,
        params: &SearchParams,
        rng: &mut R,
        is_root: bool,
    ) -> Result<f32>
    where
        E: Evaluator + ?Sized,
        R: Rng + ?Sized,
    {
        let value = if let Some(outcome) = board.outcome() {
            outcome.reward_for(board.turn())
        } else if self.children.is_empty() {
            let mut leaf_rng = &mut *rng;
            let (priors, value) = evaluator.evaluate(board, &mut leaf_rng)?;
            self.expand(board, priors, params, rng, is_root && params.selfplay)?;
            value
        } else {
            let Some(edge) = self.select(params) else {
                bail!("expanded node without children");
            };
            board.make_action(edge.action)?;
            -edge.node.simulate(board, evaluator, params, rng, false)?
        };

        self.visits += 1;
        self.value_sum += value;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn board_after(size: usize, win: usize, moves: &[&str]) -> Board {
        let mut board = Board::new(size, win).unwrap();
        for m in moves {
            let a = board.parse_action(m).unwrap();
            board.make_action(a).unwrap();
        }
        board
    }

    #[test]
    fn finds_immediate_win() -> Result<()> {
        // X: a1 b1, O: a2 b2; X to move wins with c1.
        let board = board_after(3, 3, &["a1", "a2", "b1", "b2"]);
        let mut rng = StdRng::seed_from_u64(7);
        let res = search(
            &board,
            &RolloutEvaluator,
            &SearchParams::default_eval(300),
            &mut rng,
        )?;
        assert_eq!(board.action_to_string(res.action), "c1");
        assert!(res.root_value > 0.5, "root value {}", res.root_value);
        Ok(())
    }

    #[test]
    fn policy_is_a_distribution_over_empty_squares() -> Result<()> {
        let board = board_after(5, 4, &["c3"]);
        let mut rng = StdRng::seed_from_u64(1);
        let res = search(
            &board,
            &RolloutEvaluator,
            &SearchParams::default_selfplay(64),
            &mut rng,
        )?;
        assert_eq!(res.policy.len(), 25);
        let sum: f32 = res.policy.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let c3 = board.parse_action("c3")?;
        assert_eq!(res.policy[c3.0], 0.0);
        assert!(board.legal_actions().contains(&res.action));
        assert_eq!(res.iterations, 64);
        Ok(())
    }

    #[test]
    fn same_seed_gives_the_same_search() -> Result<()> {
        let board = board_after(5, 4, &["c3", "b2"]);
        let params = SearchParams::default_selfplay(40);
        let a = search(&board, &RolloutEvaluator, &params, &mut StdRng::seed_from_u64(9))?;
        let b = search(&board, &RolloutEvaluator, &params, &mut StdRng::seed_from_u64(9))?;
        assert_eq!(a.action, b.action);
        assert_eq!(a.policy, b.policy);
        assert_eq!(a.root_value, b.root_value);
        Ok(())
    }

    #[test]
    fn finished_game_cannot_be_searched() {
        let board = board_after(3, 3, &["a1", "a2", "b1", "b2", "c1"]);
        let mut rng = StdRng::seed_from_u64(0);
        let res = search(
            &board,
            &RolloutEvaluator,
            &SearchParams::default_eval(10),
            &mut rng,
        );
        assert!(res.is_err());
    }
}
