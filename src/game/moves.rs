//! Move Generation
//!
//! Enumerates every legal way to play a roll. A player must use as many
//! dice as possible; when only one of two different dice can be played,
//! the higher one must be used if it can be.

use std::collections::BTreeSet;

use super::types::{Board, Color, Move};

/// Destination of a checker on `from` moved by `die`, possibly off the board.
fn destination(from: u8, die: u8, color: Color) -> i32 {
    let (from, die) = (from as i32, die as i32);
    match color {
        Color::White if from == color.bar() as i32 => 25 - die,
        Color::White => from - die,
        Color::Black if from == color.bar() as i32 => die,
        Color::Black => from + die,
    }
}

/// Legal destination for one checker and one die, ignoring sequence rules.
fn single_move_target(board: &Board, color: Color, from: u8, die: u8) -> Option<u8> {
    if board.checker_count(from, color) == 0 {
        return None;
    }
    let dest = destination(from, die, color);

    let bearing_off = match color {
        Color::White => dest <= 0,
        Color::Black => dest >= 25,
    };

    if bearing_off {
        if !board.can_bear_off(color) {
            return None;
        }
        let exact = match color {
            Color::White => dest == 0,
            Color::Black => dest == 25,
        };
        if exact {
            return Some(color.off());
        }
        // Over-bearing only from the rearmost occupied point.
        let behind = match color {
            Color::White => (from as usize + 1..=6).any(|i| board.points[i] > 0),
            Color::Black => (19..from as usize).any(|i| board.points[i] < 0),
        };
        return if behind { None } else { Some(color.off()) };
    }

    if !(1..=24).contains(&dest) {
        return None;
    }
    let dest = dest as u8;
    if board.is_blocked(dest, color) {
        return None;
    }
    Some(dest)
}

/// Points to scan for movable checkers, in the color's direction of travel.
fn source_points(color: Color) -> Box<dyn Iterator<Item = u8>> {
    match color {
        Color::White => Box::new((1..=24u8).rev()),
        Color::Black => Box::new(1..=24u8),
    }
}

fn explore(
    board: &Board,
    color: Color,
    remaining: &[u8],
    current: &mut Vec<Move>,
    out: &mut Vec<Vec<Move>>,
) {
    if remaining.is_empty() {
        out.push(current.clone());
        return;
    }

    let mut any_move = false;
    let mut tried = BTreeSet::new();
    let on_bar = board.bar_count(color) > 0;

    for (idx, &die) in remaining.iter().enumerate() {
        if !tried.insert(die) {
            continue;
        }

        let sources: Vec<u8> = if on_bar {
            vec![color.bar()]
        } else {
            source_points(color)
                .filter(|&p| board.checker_count(p, color) > 0)
                .collect()
        };

        for from in sources {
            if let Some(to) = single_move_target(board, color, from, die) {
                any_move = true;
                let next = board.with_move(color, from, to);
                let mut rest = remaining.to_vec();
                rest.remove(idx);
                current.push(Move::new(from, to, die));
                explore(&next, color, &rest, current, out);
                current.pop();
            }
        }
    }

    if !any_move {
        out.push(current.clone());
    }
}

/// Every complete, rule-conforming way to play `dice` from `board`.
///
/// Returns a single empty sequence when nothing can be played.
pub fn generate_all_sequences(board: &Board, color: Color, dice: &[u8]) -> Vec<Vec<Move>> {
    let mut all = Vec::new();
    explore(board, color, dice, &mut Vec::new(), &mut all);

    let max_used = all.iter().map(Vec::len).max().unwrap_or(0);
    let mut best: Vec<Vec<Move>> = all.into_iter().filter(|s| s.len() == max_used).collect();

    if max_used == 1 && dice.len() == 2 && dice[0] != dice[1] {
        let higher = dice[0].max(dice[1]);
        if best.iter().any(|s| s[0].die == higher) {
            best.retain(|s| s[0].die == higher);
        }
    }

    let mut seen = BTreeSet::new();
    best.retain(|s| seen.insert(s.clone()));
    best
}

/// Distinct first moves of every legal sequence.
///
/// This is the set a client may choose from for its next checker.
pub fn legal_first_moves(board: &Board, color: Color, dice: &[u8]) -> Vec<Move> {
    if dice.is_empty() {
        return Vec::new();
    }
    let mut seen = BTreeSet::new();
    generate_all_sequences(board, color, dice)
        .into_iter()
        .filter_map(|s| s.first().copied())
        .filter(|m| seen.insert(*m))
        .collect()
}

/// Human-readable notation, e.g. `13/7`, `bar/22`, `6/off`.
pub fn format_move(mv: &Move, color: Color) -> String {
    let from = if mv.from == color.bar() {
        "bar".to_string()
    } else {
        mv.from.to_string()
    };
    let to = if mv.to == color.off() {
        "off".to_string()
    } else {
        mv.to.to_string()
    };
    format!("{}/{}", from, to)
}
