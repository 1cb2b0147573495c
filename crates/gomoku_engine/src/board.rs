//! Board - Gomoku rules on a square board of configurable size

use std::fmt;

use indexmap::IndexSet;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Largest supported edge length (columns are labelled `a..=z`).
pub const MAX_BOARD_SIZE: usize = 26;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BoardError {
    #[error("board size must be between 1 and {MAX_BOARD_SIZE}, got {0}")]
    InvalidSize(usize),

    #[error("win length must be between 1 and the board size {size}, got {win_length}")]
    InvalidWinLength { size: usize, win_length: usize },

    #[error("the game is already over")]
    GameOver,

    #[error("square {0} is outside the board")]
    OutOfRange(usize),

    #[error("square {0} is already occupied")]
    Occupied(String),

    #[error("cannot parse '{0}' as a square")]
    Parse(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Player {
    Black,
    White,
}

impl Player {
    pub fn opposite(self) -> Player {
        match self {
            Player::Black => Player::White,
            Player::White => Player::Black,
        }
    }

    /// +1 for black, -1 for white; the sign used in the network input.
    pub fn sign(self) -> f32 {
        match self {
            Player::Black => 1.0,
            Player::White => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Winner(Player),
    Draw,
}

impl Outcome {
    /// Reward in [-1, 1] from `player`'s point of view.
    pub fn reward_for(self, player: Player) -> f32 {
        match self {
            Outcome::Winner(winner) if winner == player => 1.0,
            Outcome::Winner(_) => -1.0,
            Outcome::Draw => 0.0,
        }
    }
}

/// A square, indexed as `row * size + col`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action(pub usize);

#[derive(Clone, Debug)]
pub struct Board {
    size: usize,
    win_length: usize,
    turn: Player,
    black_stones: Vec<bool>,
    white_stones: Vec<bool>,
    legal: IndexSet<Action>,
    outcome: Option<Outcome>,
    num_stones_placed: usize,
}

const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

impl Board {
    pub fn new(size: usize, win_length: usize) -> Result<Self, BoardError> {
        if size == 0 || size > MAX_BOARD_SIZE {
            return Err(BoardError::InvalidSize(size));
        }
        if win_length == 0 || win_length > size {
            return Err(BoardError::InvalidWinLength { size, win_length });
        }

        Ok(Self {
            size,
            win_length,
            turn: Player::Black,
            black_stones: vec![false; size * size],
            white_stones: vec![false; size * size],
            legal: (0..size * size).map(Action).collect(),
            outcome: None,
            num_stones_placed: 0,
        })
    }

    pub fn reset(&mut self) {
        self.turn = Player::Black;
        self.black_stones.iter_mut().for_each(|s| *s = false);
        self.white_stones.iter_mut().for_each(|s| *s = false);
        self.legal = (0..self.num_squares()).map(Action).collect();
        self.outcome = None;
        self.num_stones_placed = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn win_length(&self) -> usize {
        self.win_length
    }

    pub fn num_squares(&self) -> usize {
        self.size * self.size
    }

    pub fn turn(&self) -> Player {
        self.turn
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn num_stones_placed(&self) -> usize {
        self.num_stones_placed
    }

    pub fn is_game_over(&self) -> bool {
        self.outcome.is_some()
    }

    /// Empty squares while the game is running; empty once it has ended.
    pub fn legal_actions(&self) -> &IndexSet<Action> {
        &self.legal
    }

    pub fn random_legal_action<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Action> {
        if self.legal.is_empty() {
            return None;
        }
        self.legal.get_index(rng.gen_range(0..self.legal.len())).copied()
    }

    /// `None` for an empty cell or an index off the board.
    pub fn stone_at(&self, index: usize) -> Option<Player> {
        if *self.black_stones.get(index)? {
            Some(Player::Black)
        } else if *self.white_stones.get(index)? {
            Some(Player::White)
        } else {
            None
        }
    }

    pub fn make_action(&mut self, action: Action) -> Result<(), BoardError> {
        if self.is_game_over() {
            return Err(BoardError::GameOver);
        }
        let index = action.0;
        if index >= self.num_squares() {
            return Err(BoardError::OutOfRange(index));
        }
        if !self.legal.swap_remove(&action) {
            return Err(BoardError::Occupied(self.action_to_string(action)));
        }

        match self.turn {
            Player::Black => self.black_stones[index] = true,
            Player::White => self.white_stones[index] = true,
        }
        self.num_stones_placed += 1;

        if self.completes_line(index) {
            self.outcome = Some(Outcome::Winner(self.turn));
            self.legal.clear();
        } else if self.legal.is_empty() {
            self.outcome = Some(Outcome::Draw);
        }
        // The turn passes even on the final move, so terminal positions are
        // always seen from the side that would move next.
        self.turn = self.turn.opposite();

        Ok(())
    }

    fn completes_line(&self, index: usize) -> bool {
        let stones = match self.turn {
            Player::Black => &self.black_stones,
            Player::White => &self.white_stones,
        };
        let size = self.size as isize;
        let row = (index / self.size) as isize;
        let col = (index % self.size) as isize;

        let run = |dr: isize, dc: isize| {
            let mut count = 0;
            let (mut r, mut c) = (row + dr, col + dc);
            while r >= 0 && r < size && c >= 0 && c < size && stones[(r * size + c) as usize] {
                count += 1;
                r += dr;
                c += dc;
            }
            count
        };

        DIRECTIONS
            .iter()
            .any(|&(dr, dc)| 1 + run(dr, dc) + run(-dr, -dc) >= self.win_length)
    }

    /// Parses squares such as `b3`: column letter, then 1-based row.
    pub fn parse_action(&self, s: &str) -> Result<Action, BoardError> {
        let s = s.trim();
        let mut chars = s.chars();
        let col = chars
            .next()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| (c.to_ascii_lowercase() as u8 - b'a') as usize)
            .ok_or_else(|| BoardError::Parse(s.to_string()))?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BoardError::Parse(s.to_string()));
        }
        let row: usize = digits
            .parse()
            .map_err(|_| BoardError::Parse(s.to_string()))?;

        if col >= self.size || row == 0 || row > self.size {
            return Err(BoardError::Parse(s.to_string()));
        }
        Ok(Action((row - 1) * self.size + col))
    }

    pub fn action_to_string(&self, action: Action) -> String {
        let row = action.0 / self.size;
        let col = action.0 % self.size;
        format!("{}{}", (b'a' + col as u8) as char, row + 1)
    }

    /// Network input: one value per square (+1 black, -1 white, 0 empty)
    /// followed by the side to move.
    pub fn to_repr(&self) -> Vec<f32> {
        let mut repr: Vec<f32> = (0..self.num_squares())
            .map(|i| self.stone_at(i).map_or(0.0, Player::sign))
            .collect();
        repr.push(self.turn.sign());
        repr
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in (0..self.size).rev() {
            write!(f, "{:>2} ", row + 1)?;
            for col in 0..self.size {
                let glyph = match self.stone_at(row * self.size + col) {
                    Some(Player::Black) => 'X',
                    Some(Player::White) => 'O',
                    None => '.',
                };
                write!(f, "{glyph} ")?;
            }
            writeln!(f)?;
        }
        write!(f, "   ")?;
        let labels: Vec<String> = (0..self.size)
            .map(|c| ((b'a' + c as u8) as char).to_string())
            .collect();
        write!(f, "{}", labels.join(" "))
    }
}
