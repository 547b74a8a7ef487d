use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::debug;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::connection::ConnId;

/// Words a race text is sampled from.
pub const VOCABULARY: [&str; 10] = ["the", "be", "to", "of", "and", "a", "in", "that", "have", "I"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    WaitingForReady,
    Active,
    Ending,
    Closed,
}

/// Result of a `wordComplete` submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOutcome {
    /// Wrong state, unknown racer or word mismatch. Nothing changed.
    Ignored,
    Progress { percentage: u8 },
    Finished { percentage: u8, rank: usize },
}

/// One race inside a room.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    words: Vec<String>,
    /// Words confirmed so far per racer; the remaining queue is `words[done..]`.
    done: HashMap<ConnId, usize>,
    leaderboard: Vec<ConnId>,
    started_at: u64,
}

impl Session {
    fn new(id: u64, words: Vec<String>, racers: &[ConnId]) -> Self {
        Self {
            id,
            words,
            done: racers.iter().map(|id| (*id, 0)).collect(),
            leaderboard: vec![],
            started_at: unix_millis(),
        }
    }

    pub fn text(&self) -> String {
        self.words.join(" ")
    }

    pub fn total(&self) -> usize {
        self.words.len()
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    #[cfg(test)]
    pub fn remaining(&self, id: ConnId) -> Option<&[String]> {
        self.done.get(&id).map(|done| &self.words[*done..])
    }

    /// `(position, id)` in finish order, positions starting at 1.
    pub fn leaderboard(&self) -> impl Iterator<Item = (usize, ConnId)> + '_ {
        self.leaderboard
            .iter()
            .enumerate()
            .map(|(i, id)| (i + 1, *id))
    }

    pub fn is_racer(&self, id: ConnId) -> bool {
        self.done.contains_key(&id)
    }

    fn has_finished(&self, id: ConnId) -> bool {
        self.done.get(&id) == Some(&self.words.len())
    }
}

/// Per-room game state machine.
#[derive(Debug)]
pub struct Game {
    phase: Phase,
    session: Option<Session>,
    sessions_started: u64,
    countdown: Option<JoinHandle<()>>,
}

impl Default for Game {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            session: None,
            sessions_started: 0,
            countdown: None,
        }
    }
}

impl Drop for Game {
    fn drop(&mut self) {
        self.cancel_countdown();
    }
}

impl Game {
    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    pub fn on_join(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::WaitingForReady;
        }
    }

    /// Replaces any previous session with a fresh race for `racers`.
    /// Refused while a session is active.
    pub fn start(&mut self, racers: &[ConnId], words: Vec<String>) -> Option<&Session> {
        if self.is_active() {
            return None;
        }
        self.cancel_countdown();
        self.sessions_started += 1;
        self.session = Some(Session::new(self.sessions_started, words, racers));
        self.phase = Phase::Active;
        self.session.as_ref()
    }

    pub fn word_complete(&mut self, id: ConnId, word: &str) -> WordOutcome {
        if !self.is_active() {
            debug!("word from {id} outside an active race");
            return WordOutcome::Ignored;
        }
        let Some(session) = self.session.as_mut() else {
            return WordOutcome::Ignored;
        };
        let total = session.words.len();
        let Some(done) = session.done.get_mut(&id) else {
            debug!("word from {id} who is not racing");
            return WordOutcome::Ignored;
        };
        if session.words.get(*done).map(String::as_str) != Some(word) {
            debug!("word mismatch from {id}");
            return WordOutcome::Ignored;
        }

        *done += 1;
        let percentage = percentage(*done, total);
        if *done < total {
            return WordOutcome::Progress { percentage };
        }
        session.leaderboard.push(id);
        WordOutcome::Finished {
            percentage,
            rank: session.leaderboard.len(),
        }
    }

    /// True when the race is active, someone finished, and none of `members`
    /// still has words left. Latecomers are not racers and do not count.
    pub fn everyone_finished(&self, members: &[ConnId]) -> bool {
        let Some(session) = self.session.as_ref().filter(|_| self.is_active()) else {
            return false;
        };
        !session.leaderboard.is_empty()
            && members
                .iter()
                .filter(|id| session.is_racer(**id))
                .all(|id| session.has_finished(*id))
    }

    pub fn has_countdown(&self) -> bool {
        self.countdown.is_some()
    }

    pub fn arm_countdown(&mut self, handle: JoinHandle<()>) {
        self.cancel_countdown();
        self.countdown = Some(handle);
    }

    fn cancel_countdown(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }

    /// `Active -> Ending -> Closed`. Returns false if the session already
    /// ended, so the caller broadcasts `endGame` at most once per session.
    pub fn end(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.phase = Phase::Ending;
        self.cancel_countdown();
        self.phase = Phase::Closed;
        true
    }

    /// Timer path: ends the race only if it is still the session that armed it.
    pub fn countdown_elapsed(&mut self, session_id: u64) -> bool {
        let current = self.session.as_ref().map(|s| s.id);
        if current != Some(session_id) {
            return false;
        }
        // The firing task is the one in `countdown`; don't abort it.
        self.countdown = None;
        self.end()
    }
}

/// `round(100 * done / total)`, halves rounding up.
pub fn percentage(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((200 * done + total) / (2 * total)).min(100) as u8
}

/// Fixed-size sample, with replacement, from [`VOCABULARY`].
pub fn generate_text(len: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| VOCABULARY[rng.gen_range(0..VOCABULARY.len())].to_string())
        .collect()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(u64::MAX as u128) as u64
}
