//! Game commands - interactive play, random-game benchmark and statistics

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use candle_core::Device;
use clap::Args;
use gomoku_engine::mcts::{search, Evaluator, ModelEvaluator, RolloutEvaluator, SearchParams};
use gomoku_engine::{Board, Model, Outcome, Player};
use rand::Rng;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct PlayArgs {
    #[arg(long, default_value_t = 8)]
    pub size: usize,

    #[arg(long, default_value_t = 5)]
    pub win_length: usize,

    /// MCTS iterations per engine move
    #[arg(long, default_value_t = 800)]
    pub iterations: usize,

    /// Export directory of a trained model; random rollouts when absent
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Let the engine play black
    #[arg(long, action)]
    pub engine_first: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RandomGamesArgs {
    #[arg(long, default_value_t = 10_000)]
    pub games: usize,

    #[arg(long, default_value_t = 15)]
    pub size: usize,

    #[arg(long, default_value_t = 5)]
    pub win_length: usize,
}

fn play_random<R: Rng + ?Sized>(board: &mut Board, rng: &mut R) -> Result<()> {
    while let Some(action) = board.random_legal_action(rng) {
        board.make_action(action)?;
    }
    Ok(())
}

/// Outcome counts over a batch of uniformly random games.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RandomStats {
    pub games: usize,
    pub black_wins: usize,
    pub white_wins: usize,
    pub draws: usize,
    pub stones_placed: usize,
}

impl RandomStats {
    fn percent(&self, n: usize) -> f64 {
        n as f64 / self.games.max(1) as f64 * 100.0
    }

    pub fn mean_stones(&self) -> f64 {
        self.stones_placed as f64 / self.games.max(1) as f64
    }
}

pub fn random_stats<R: Rng + ?Sized>(args: &RandomGamesArgs, rng: &mut R) -> Result<RandomStats> {
    let mut board = Board::new(args.size, args.win_length)?;
    let mut stats = RandomStats {
        games: args.games,
        ..RandomStats::default()
    };
    for _ in 0..args.games {
        board.reset();
        play_random(&mut board, rng)?;
        match board.outcome() {
            Some(Outcome::Winner(Player::Black)) => stats.black_wins += 1,
            Some(Outcome::Winner(Player::White)) => stats.white_wins += 1,
            Some(Outcome::Draw) => stats.draws += 1,
            None => bail!("random game ended without an outcome"),
        }
        stats.stones_placed += board.num_stones_placed();
    }
    Ok(stats)
}

/// Plays `args.games` random games and returns games per second.
pub fn benchmark(args: &RandomGamesArgs) -> Result<f64> {
    let mut board = Board::new(args.size, args.win_length)?;
    let mut rng = rand::thread_rng();
    let now = Instant::now();
    for _ in 0..args.games {
        board.reset();
        play_random(&mut board, &mut rng)?;
    }
    let rate = args.games as f64 / now.elapsed().as_secs_f64().max(f64::EPSILON);
    info!(
        "⏱ {} random games on {}x{}: {:.0} games/s",
        args.games, args.size, args.size, rate
    );
    Ok(rate)
}

pub fn stats(args: &RandomGamesArgs) -> Result<RandomStats> {
    let s = random_stats(args, &mut rand::thread_rng())?;
    info!("📊 {} random games on {}x{} (win {})", s.games, args.size, args.size, args.win_length);
    info!("   Black wins: {:.1}%", s.percent(s.black_wins));
    info!("   White wins: {:.1}%", s.percent(s.white_wins));
    info!("   Draws: {:.1}%", s.percent(s.draws));
    info!("   Stones placed: {:.1}", s.mean_stones());
    Ok(s)
}

/// Reads moves from `input` until one is legal; `None` on end of input.
fn read_move<B: BufRead>(board: &Board, input: &mut B) -> Result<Option<gomoku_engine::Action>> {
    let mut line = String::new();
    loop {
        print!("\nYour move: ");
        io::stdout().flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        match board.parse_action(&line) {
            Ok(action) if board.legal_actions().contains(&action) => return Ok(Some(action)),
            _ => println!("{} is not a valid move.", line.trim()),
        }
    }
}

pub fn play(args: PlayArgs) -> Result<()> {
    let mut board = Board::new(args.size, args.win_length)?;
    let evaluator: Box<dyn Evaluator> = match &args.model {
        Some(dir) => {
            let (model, _varmap) = Model::load_exported(dir, &Device::Cpu)?;
            Box::new(ModelEvaluator::new(model, Device::Cpu))
        }
        None => Box::new(RolloutEvaluator),
    };
    let params = SearchParams::default_eval(args.iterations);
    let engine = if args.engine_first {
        Player::Black
    } else {
        Player::White
    };
    let mut rng = rand::thread_rng();
    let stdin = io::stdin();
    let mut input = stdin.lock();

    println!("{board}");
    while !board.is_game_over() {
        if board.turn() == engine {
            let result = search(&board, evaluator.as_ref(), &params, &mut rng)?;
            println!(
                "\nEngine plays {} (value {:+.2})",
                board.action_to_string(result.action),
                result.root_value
            );
            board.make_action(result.action)?;
        } else {
            match read_move(&board, &mut input)? {
                Some(action) => board.make_action(action)?,
                None => {
                    println!();
                    return Ok(());
                }
            }
        }
        println!("{board}");
    }

    match board.outcome() {
        Some(Outcome::Winner(p)) if p == engine => println!("Engine wins."),
        Some(Outcome::Winner(_)) => println!("You win!"),
        _ => println!("Draw."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn stats_account_for_every_game() -> Result<()> {
        let args = RandomGamesArgs {
            games: 200,
            size: 3,
            win_length: 3,
        };
        let s = random_stats(&args, &mut StdRng::seed_from_u64(3))?;
        assert_eq!(s.black_wins + s.white_wins + s.draws, 200);
        assert!(s.mean_stones() >= 5.0 && s.mean_stones() <= 9.0);
        // black moves first and wins more often at random on 3x3
        assert!(s.black_wins > s.white_wins);
        Ok(())
    }

    #[test]
    fn one_in_a_row_is_always_a_black_win() -> Result<()> {
        let args = RandomGamesArgs {
            games: 10,
            size: 4,
            win_length: 1,
        };
        let s = random_stats(&args, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(s.black_wins, 10);
        assert_eq!(s.stones_placed, 10);
        Ok(())
    }

    #[test]
    fn read_move_skips_bad_input() -> Result<()> {
        let mut board = Board::new(3, 3)?;
        board.make_action(board.parse_action("a1")?)?;
        let mut input = io::Cursor::new("zz\na1\nb2\n");
        assert_eq!(read_move(&board, &mut input)?, board.parse_action("b2").ok());

        let mut empty = io::Cursor::new("");
        assert_eq!(read_move(&board, &mut empty)?, None);
        Ok(())
    }

    #[test]
    fn benchmark_reports_a_positive_rate() -> Result<()> {
        let args = RandomGamesArgs {
            games: 5,
            size: 5,
            win_length: 4,
        };
        assert!(benchmark(&args)? > 0.0);
        Ok(())
    }
}
