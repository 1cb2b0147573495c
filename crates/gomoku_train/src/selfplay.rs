//! Self-play - MCTS games written as training records

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Args;
use gomoku_engine::mcts::{search, Evaluator, ModelEvaluator, RolloutEvaluator, SearchParams};
use gomoku_engine::{Board, Model, Player};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::info;

use crate::data::GameRecord;

#[derive(Args, Debug, Clone)]
pub struct SelfPlayArgs {
    /// Number of games to play
    #[arg(long, default_value_t = 100)]
    pub games: usize,

    #[arg(long, default_value_t = 8)]
    pub size: usize,

    #[arg(long, default_value_t = 5)]
    pub win_length: usize,

    /// MCTS iterations per move
    #[arg(long, default_value_t = 200)]
    pub iterations: usize,

    /// Directory the game files are written to (the data module's `data_dir`)
    #[arg(long, default_value = "games")]
    pub output: PathBuf,

    /// Export directory (`model.json` + weights); random rollouts when absent
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Seeds game `i` with `seed + i`
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Plays one game and labels every position with the final result for its mover.
pub fn play_game<E, R>(
    size: usize,
    win_length: usize,
    evaluator: &E,
    params: &SearchParams,
    rng: &mut R,
) -> Result<Vec<GameRecord>>
where
    E: Evaluator + ?Sized,
    R: rand::Rng + ?Sized,
{
    let mut board = Board::new(size, win_length)?;
    let mut positions: Vec<(Vec<f32>, Vec<f32>, Player)> = Vec::new();
    while !board.is_game_over() {
        let result = search(&board, evaluator, params, rng)?;
        positions.push((board.to_repr(), result.policy, board.turn()));
        board.make_action(result.action)?;
    }

    let outcome = board
        .outcome()
        .context("finished game has no outcome")?;
    Ok(positions
        .into_iter()
        .map(|(state, policy, mover)| GameRecord {
            state,
            policy,
            value: outcome.reward_for(mover),
        })
        .collect())
}

fn write_game(path: &Path, records: &[GameRecord]) -> Result<()> {
    let file =
        std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer(std::io::BufWriter::new(file), records)?;
    Ok(())
}

/// Generates `args.games` games in parallel; returns the number of positions written.
pub fn generate(args: &SelfPlayArgs) -> Result<usize> {
    // validates size and win length before any thread starts
    Board::new(args.size, args.win_length)?;
    std::fs::create_dir_all(&args.output)?;

    let evaluator: Box<dyn Evaluator + Sync> = match &args.model {
        Some(dir) => {
            let (model, _varmap) = Model::load_exported(dir, &Device::Cpu)?;
            if model.size() != args.size {
                anyhow::bail!(
                    "model at {} plays {}x{}, asked for {}x{}",
                    dir.display(),
                    model.size(),
                    model.size(),
                    args.size,
                    args.size
                );
            }
            Box::new(ModelEvaluator::new(model, Device::Cpu))
        }
        None => Box::new(RolloutEvaluator),
    };
    let params = SearchParams::default_selfplay(args.iterations);
    info!(
        "🎲 Self-play: {} games on {}x{} (win {}), {} iterations/move, {}",
        args.games,
        args.size,
        args.size,
        args.win_length,
        args.iterations,
        if args.model.is_some() { "model" } else { "rollouts" }
    );

    let pb = ProgressBar::new(args.games as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} games")?,
    );

    let positions = (0..args.games)
        .into_par_iter()
        .map(|i| -> Result<usize> {
            let mut rng = match args.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(i as u64)),
                None => StdRng::from_entropy(),
            };
            let records =
                play_game(args.size, args.win_length, evaluator.as_ref(), &params, &mut rng)?;
            write_game(&args.output.join(format!("game_{i:05}.json")), &records)?;
            pb.inc(1);
            Ok(records.len())
        })
        .sum::<Result<usize>>()?;
    pb.finish_and_clear();

    info!(
        "✅ Wrote {} positions from {} games to {}",
        positions,
        args.games,
        args.output.display()
    );
    Ok(positions)
}

pub fn run(args: SelfPlayArgs) -> Result<()> {
    generate(&args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::records::read_game_file;

    #[test]
    fn records_alternate_movers_and_match_the_result() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let params = SearchParams::default_selfplay(8);
        let records = play_game(3, 3, &RolloutEvaluator, &params, &mut rng)?;

        assert!(records.len() >= 5 && records.len() <= 9);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.state.len(), 10);
            assert_eq!(r.policy.len(), 9);
            assert!((r.policy.iter().sum::<f32>() - 1.0).abs() < 1e-4);
            let to_move = if i % 2 == 0 { 1.0 } else { -1.0 };
            assert_eq!(r.state[9], to_move);
        }
        // consecutive positions belong to opposite players
        for pair in records.windows(2) {
            assert_eq!(pair[0].value, -pair[1].value);
        }
        Ok(())
    }

    #[test]
    fn generate_writes_one_file_per_game() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let args = SelfPlayArgs {
            games: 3,
            size: 4,
            win_length: 3,
            iterations: 4,
            output: dir.path().join("games"),
            model: None,
            seed: Some(1),
        };
        let positions = generate(&args)?;

        let files = crate::data::records::game_files(&args.output)?;
        assert_eq!(files.len(), 3);
        let total: usize = files
            .iter()
            .map(|f| read_game_file(f).map(|r| r.len()))
            .sum::<Result<usize>>()?;
        assert_eq!(total, positions);
        Ok(())
    }

    #[test]
    fn same_seed_writes_identical_games() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let args = |out: &str| SelfPlayArgs {
            games: 2,
            size: 5,
            win_length: 4,
            iterations: 30,
            output: dir.path().join(out),
            model: None,
            seed: Some(42),
        };
        generate(&args("a"))?;
        generate(&args("b"))?;
        for name in ["game_00000.json", "game_00001.json"] {
            let a = std::fs::read(dir.path().join("a").join(name))?;
            let b = std::fs::read(dir.path().join("b").join(name))?;
            assert_eq!(a, b, "{name} differs between runs");
        }
        Ok(())
    }

    #[test]
    fn bad_board_is_rejected_up_front() {
        let args = SelfPlayArgs {
            games: 1,
            size: 3,
            win_length: 4,
            iterations: 1,
            output: PathBuf::from("unused"),
            model: None,
            seed: None,
        };
        assert!(generate(&args).is_err());
    }
}
