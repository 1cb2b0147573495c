//! Gomoku Engine
//!
//! Game rules, tree search and the policy/value networks used to predict moves.
//! The training pipeline lives in `gomoku_train`; this crate has no I/O beyond
//! loading weights.

pub mod board;
pub mod device_utils;
pub mod layers;
pub mod mcts;
pub mod models;

pub use board::{Action, Board, BoardError, Outcome, Player};
pub use mcts::{search, Evaluator, ModelEvaluator, RolloutEvaluator, SearchParams, SearchResult};
pub use models::{Model, ModelKind, ModelSpec};
