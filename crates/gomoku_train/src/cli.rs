use crate::game::{PlayArgs, RandomGamesArgs};
use crate::selfplay::SelfPlayArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Gomoku move-prediction toolchain", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train the policy/value network from a run config
    Train(TrainArgs),

    /// Print the resolved run config
    Config(TrainArgs),

    /// Generate training games with MCTS self-play
    Selfplay(SelfPlayArgs),

    /// Play against the engine on the terminal
    Play(PlayArgs),

    /// Random games per second
    Benchmark(RandomGamesArgs),

    /// Win/draw rates of random play
    Stats(RandomGamesArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_takes_trailing_overrides() {
        let cli = Cli::try_parse_from([
            "gomoku",
            "train",
            "--config",
            "conf/other.yaml",
            "trainer.max_epochs=3",
            "~lit_model.scheduler_config",
            "+callbacks.lr._target_=LearningRateMonitor",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.config, std::path::PathBuf::from("conf/other.yaml"));
        assert_eq!(
            args.overrides,
            [
                "trainer.max_epochs=3",
                "~lit_model.scheduler_config",
                "+callbacks.lr._target_=LearningRateMonitor"
            ]
        );
    }

    #[test]
    fn config_defaults_to_the_shipped_file() {
        let cli = Cli::try_parse_from(["gomoku", "config"]).unwrap();
        let Commands::Config(args) = cli.command else {
            panic!("expected config");
        };
        assert_eq!(args.config, std::path::PathBuf::from(crate::config::DEFAULT_CONFIG_PATH));
        assert!(args.overrides.is_empty());
    }

    #[test]
    fn selfplay_flags() {
        let cli = Cli::try_parse_from([
            "gomoku", "selfplay", "--games", "4", "--size", "8", "--output", "out",
        ])
        .unwrap();
        let Commands::Selfplay(args) = cli.command else {
            panic!("expected selfplay");
        };
        assert_eq!(args.games, 4);
        assert_eq!(args.win_length, 5);
        assert!(args.model.is_none());
    }
}
