pub mod callbacks;
pub mod cli;
pub mod config;
pub mod data;
pub mod game;
pub mod lit_model;
pub mod logger;
pub mod optim;
pub mod registry;
pub mod selfplay;
pub mod train;
