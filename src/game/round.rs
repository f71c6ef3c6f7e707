use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::network::PlayerId;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid choice {0}, expected 1, 2 or 3")]
pub struct InvalidChoice(pub u8);

/// One of the three choice categories. Precedence is cyclic:
/// rock beats scissors, paper beats rock, scissors beats paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Choice {
    Rock = 1,
    Paper = 2,
    Scissors = 3,
}

impl Choice {
    pub const ALL: [Choice; 3] = [Choice::Rock, Choice::Paper, Choice::Scissors];

    /// Whether `self` wins against `other`
    pub fn beats(self, other: Choice) -> bool {
        matches!(
            (self, other),
            (Choice::Rock, Choice::Scissors) | (Choice::Paper, Choice::Rock) | (Choice::Scissors, Choice::Paper)
        )
    }

    /// Number used on the wire
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Choice {
    type Error = InvalidChoice;

    fn try_from(value: u8) -> Result<Self, InvalidChoice> {
        match value {
            1 => Ok(Choice::Rock),
            2 => Ok(Choice::Paper),
            3 => Ok(Choice::Scissors),
            _ => Err(InvalidChoice(value)),
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Rock => write!(f, "Rock"),
            Choice::Paper => write!(f, "Paper"),
            Choice::Scissors => write!(f, "Scissors"),
        }
    }
}

/// Outcome of a round for a single player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Win,
    Lose,
    Draw,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Win => write!(f, "Win"),
            Verdict::Lose => write!(f, "Lose"),
            Verdict::Draw => write!(f, "Draw"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub player_id: PlayerId,
    pub choice: Choice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    pub player_id: PlayerId,
    pub verdict: Verdict,
}

/// Compute every player's verdict from one move per player.
///
/// One or three distinct choices is a draw for everybody. With exactly two,
/// the players holding the choice that beats the other win.
pub fn resolve_moves(moves: &[Move]) -> Vec<RoundOutcome> {
    let mut present: Vec<Choice> = moves.iter().map(|m| m.choice).collect();
    present.sort();
    present.dedup();

    let winner = match present.as_slice() {
        [first, second] => Some(if first.beats(*second) { *first } else { *second }),
        _ => None,
    };

    moves
        .iter()
        .map(|m| RoundOutcome {
            player_id: m.player_id,
            verdict: match winner {
                None => Verdict::Draw,
                Some(choice) if choice == m.choice => Verdict::Win,
                Some(_) => Verdict::Lose,
            },
        })
        .collect()
}

/// Moves recorded for the current round, keyed by player id
#[derive(Debug, Default)]
pub struct RoundResolver {
    moves: BTreeMap<PlayerId, Choice>,
}

impl RoundResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a move, replacing the player's earlier move in this round
    pub fn record(&mut self, mv: Move) {
        self.moves.insert(mv.player_id, mv.choice);
    }

    /// Drop a player's move, if any
    pub fn withdraw(&mut self, player_id: PlayerId) -> bool {
        self.moves.remove(&player_id).is_some()
    }

    pub fn reset(&mut self) {
        self.moves.clear();
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn has_move(&self, player_id: PlayerId) -> bool {
        self.moves.contains_key(&player_id)
    }

    /// True once exactly `players` moves are recorded
    pub fn is_complete(&self, players: usize) -> bool {
        players > 0 && self.moves.len() == players
    }

    /// Compute outcomes for the recorded moves and clear them for the next round
    pub fn resolve(&mut self) -> Vec<RoundOutcome> {
        let moves: Vec<Move> = std::mem::take(&mut self.moves)
            .into_iter()
            .map(|(player_id, choice)| Move { player_id, choice })
            .collect();
        resolve_moves(&moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moves(choices: &[Choice]) -> Vec<Move> {
        choices
            .iter()
            .enumerate()
            .map(|(i, &choice)| Move { player_id: i as PlayerId, choice })
            .collect()
    }

    fn verdicts(outcomes: &[RoundOutcome]) -> Vec<Verdict> {
        outcomes.iter().map(|o| o.verdict).collect()
    }

    #[test]
    fn test_precedence_is_cyclic() {
        assert!(Choice::Rock.beats(Choice::Scissors));
        assert!(Choice::Paper.beats(Choice::Rock));
        assert!(Choice::Scissors.beats(Choice::Paper));
        for choice in Choice::ALL {
            assert!(!choice.beats(choice));
        }
    }

    #[test]
    fn test_choice_numbers() {
        assert_eq!(Choice::try_from(1), Ok(Choice::Rock));
        assert_eq!(Choice::try_from(3), Ok(Choice::Scissors));
        assert_eq!(Choice::try_from(0), Err(InvalidChoice(0)));
        assert_eq!(Choice::try_from(4), Err(InvalidChoice(4)));
        assert_eq!(Choice::Paper.number(), 2);
    }

    #[test]
    fn test_two_rocks_beat_scissors() {
        let outcomes = resolve_moves(&moves(&[Choice::Rock, Choice::Rock, Choice::Scissors]));
        assert_eq!(verdicts(&outcomes), vec![Verdict::Win, Verdict::Win, Verdict::Lose]);
    }

    #[test]
    fn test_paper_beats_rock_regardless_of_order() {
        let outcomes = resolve_moves(&moves(&[Choice::Rock, Choice::Paper]));
        assert_eq!(verdicts(&outcomes), vec![Verdict::Lose, Verdict::Win]);

        let outcomes = resolve_moves(&moves(&[Choice::Paper, Choice::Scissors, Choice::Paper]));
        assert_eq!(verdicts(&outcomes), vec![Verdict::Lose, Verdict::Win, Verdict::Lose]);
    }

    #[test]
    fn test_all_three_categories_draw() {
        let outcomes = resolve_moves(&moves(&[Choice::Rock, Choice::Paper, Choice::Scissors]));
        assert_eq!(verdicts(&outcomes), vec![Verdict::Draw; 3]);
    }

    #[test]
    fn test_single_category_draws() {
        let outcomes = resolve_moves(&moves(&[Choice::Rock, Choice::Rock]));
        assert_eq!(verdicts(&outcomes), vec![Verdict::Draw; 2]);
    }

    #[test]
    fn test_resolver_overwrites_and_clears() {
        let mut resolver = RoundResolver::new();
        resolver.record(Move { player_id: 0, choice: Choice::Rock });
        resolver.record(Move { player_id: 1, choice: Choice::Rock });
        assert!(!resolver.is_complete(3));

        resolver.record(Move { player_id: 1, choice: Choice::Paper });
        assert_eq!(resolver.len(), 2);
        assert!(resolver.is_complete(2));

        let outcomes = resolver.resolve();
        assert_eq!(
            outcomes,
            vec![
                RoundOutcome { player_id: 0, verdict: Verdict::Lose },
                RoundOutcome { player_id: 1, verdict: Verdict::Win },
            ]
        );
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_withdraw_removes_move() {
        let mut resolver = RoundResolver::new();
        resolver.record(Move { player_id: 4, choice: Choice::Scissors });
        assert!(resolver.has_move(4));
        assert!(resolver.withdraw(4));
        assert!(!resolver.withdraw(4));
        assert!(!resolver.is_complete(0));
    }
}
