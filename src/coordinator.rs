//! Session coordinator.
//!
//! All room membership, readiness and race state sits behind one
//! [`parking_lot::Mutex`]. Every inbound event, every disconnect and every
//! countdown expiry takes that lock, applies its change and fans out the
//! resulting messages before releasing it. Nothing awaits while holding it.

use std::{collections::HashMap, sync::Arc};

use log::{debug, info};
use parking_lot::Mutex;

use crate::{
    broadcast,
    config::GameConfig,
    connection::{ConnId, Connection, Identity},
    game::{self, Game, WordOutcome},
    outbox::{self, Inbox},
    protocol::{ClientMessage, ServerMessage},
    ready,
    registry::Registry,
};

#[derive(Default)]
struct Lobby {
    registry: Registry,
    games: HashMap<String, Game>,
    /// Rooms that lost members to eviction during the current event.
    unsettled: Vec<String>,
}

struct Inner {
    config: GameConfig,
    lobby: Mutex<Lobby>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: GameConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                lobby: Default::default(),
            }),
        }
    }

    /// Registers a new player and hands back the queue its writer drains.
    pub fn connect(&self, identity: Identity) -> (ConnId, Inbox) {
        let (outbox, inbox) = outbox::channel(self.inner.config.queue_capacity);
        let connection = Connection::new(identity, outbox);
        let id = connection.id();
        let mut lobby = self.inner.lobby.lock();
        lobby.registry.attach(connection);
        debug!("{} connections open", lobby.registry.len());
        (id, inbox)
    }

    /// Tears a player down. Safe to call more than once.
    pub fn disconnect(&self, id: ConnId) {
        let mut lobby = self.inner.lobby.lock();
        let Some(departed) = lobby.registry.unregister(id) else {
            return;
        };
        info!("{} ({id}) disconnected", departed.identity.username);
        if let Some(room) = departed.room {
            self.members_left(&mut lobby, &room);
        }
        self.settle(&mut lobby);
    }

    pub fn handle(&self, id: ConnId, message: ClientMessage) {
        let mut lobby = self.inner.lobby.lock();
        let lobby = &mut *lobby;
        match message {
            ClientMessage::Join { room } => self.join(lobby, id, &room),
            ClientMessage::Ready => self.ready(lobby, id),
            ClientMessage::StartGame => {
                if let Some(room) = lobby.registry.room_of(id).map(str::to_string) {
                    info!("{id} forced a start in {room}");
                    self.start_race(lobby, &room);
                }
            }
            ClientMessage::WordComplete { word } => self.word_complete(lobby, id, &word),
            ClientMessage::RoomStatus => {
                if let Some(room) = lobby.registry.room_of(id).map(str::to_string) {
                    self.room_status(lobby, &room);
                }
            }
        }
        self.settle(lobby);
    }

    fn join(&self, lobby: &mut Lobby, id: ConnId, room: &str) {
        let Some(connection) = lobby.registry.get_mut(id) else {
            return;
        };
        if connection.room.as_deref() != Some(room) {
            connection.ready = false;
        }
        let username = connection.identity.username.clone();

        if let Some(previous) = lobby.registry.register(id, room) {
            self.members_left(lobby, &previous);
        }
        info!("{username} ({id}) joined room {room}");
        lobby.games.entry(room.to_string()).or_default().on_join();

        self.broadcast(lobby, room, &ServerMessage::joined(&username));
        self.room_status(lobby, room);
    }

    fn ready(&self, lobby: &mut Lobby, id: ConnId) {
        let Some(room) = ready::mark_ready(&mut lobby.registry, id) else {
            debug!("ready from {id} before joining a room");
            return;
        };
        self.room_status(lobby, &room);
        self.start_if_ready(lobby, &room);
    }

    fn start_if_ready(&self, lobby: &mut Lobby, room: &str) {
        let active = lobby.games.get(room).is_some_and(Game::is_active);
        if !active && ready::all_ready(&lobby.registry, room) {
            self.start_race(lobby, room);
        }
    }

    fn start_race(&self, lobby: &mut Lobby, room: &str) {
        let racers = lobby.registry.members(room);
        if racers.is_empty() {
            return;
        }
        let game = lobby.games.entry(room.to_string()).or_default();
        let words = game::generate_text(self.inner.config.race_words);
        let Some(session) = game.start(&racers, words) else {
            debug!("room {room} already racing");
            return;
        };
        info!(
            "race {} started in {room}: {} players, {} words",
            session.id,
            racers.len(),
            session.total()
        );
        let message = ServerMessage::StartGame {
            text: session.text(),
            start_time: session.started_at(),
        };
        ready::reset(&mut lobby.registry, room);
        self.broadcast(lobby, room, &message);
    }

    fn word_complete(&self, lobby: &mut Lobby, id: ConnId, word: &str) {
        let Some(room) = lobby.registry.room_of(id).map(str::to_string) else {
            return;
        };
        let Some(game) = lobby.games.get_mut(&room) else {
            return;
        };
        match game.word_complete(id, word) {
            WordOutcome::Ignored => {}
            WordOutcome::Progress { percentage } => {
                let message = ServerMessage::UserProgress {
                    userid: id,
                    percentage,
                };
                self.broadcast(lobby, &room, &message);
            }
            WordOutcome::Finished { percentage, rank } => {
                info!("{id} finished {room} in position {rank}");
                let message = ServerMessage::UserProgress {
                    userid: id,
                    percentage,
                };
                self.broadcast(lobby, &room, &message);
                self.broadcast(lobby, &room, &ServerMessage::rank(id, rank));
                self.check_finish(lobby, &room, true);
            }
        }
    }

    /// Ends the race once every remaining racer is done; otherwise starts the
    /// countdown if asked to and none is running.
    fn check_finish(&self, lobby: &mut Lobby, room: &str, arm: bool) {
        let members = lobby.registry.members(room);
        let Some(game) = lobby.games.get_mut(room) else {
            return;
        };
        if game.everyone_finished(&members) {
            if game.end() {
                info!("everyone finished in {room}: {:?}", standings(game));
                self.broadcast(lobby, room, &ServerMessage::EndGame);
            }
        } else if arm && game.is_active() && !game.has_countdown() {
            if let Some(session) = game.session() {
                let handle = self.spawn_countdown(room, session.id);
                game.arm_countdown(handle);
            }
        }
    }

    fn spawn_countdown(&self, room: &str, session_id: u64) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        let room = room.to_string();
        let delay = self.inner.config.finish_countdown;
        debug!("countdown of {delay:?} armed for {room}");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.countdown_elapsed(&room, session_id);
        })
    }

    fn countdown_elapsed(&self, room: &str, session_id: u64) {
        let mut lobby = self.inner.lobby.lock();
        let lobby = &mut *lobby;
        let Some(game) = lobby.games.get_mut(room) else {
            return;
        };
        if game.countdown_elapsed(session_id) {
            info!("countdown ran out in {room}: {:?}", standings(game));
            self.broadcast(lobby, room, &ServerMessage::EndGame);
        }
        self.settle(lobby);
    }

    fn room_status(&self, lobby: &mut Lobby, room: &str) {
        let players = ready::snapshot(&lobby.registry, room);
        self.broadcast(lobby, room, &ServerMessage::RoomStatus { players });
    }

    /// Fans out. Rooms that lost members are settled by [`Self::settle`] once
    /// the current event has sent everything it owes.
    fn broadcast(&self, lobby: &mut Lobby, room: &str, message: &ServerMessage) {
        let evicted = broadcast::to_room(&mut lobby.registry, room, message);
        if !evicted.is_empty() && !lobby.unsettled.iter().any(|r| r == room) {
            lobby.unsettled.push(room.to_string());
        }
    }

    fn settle(&self, lobby: &mut Lobby) {
        while let Some(room) = lobby.unsettled.pop() {
            self.members_left(lobby, &room);
        }
    }

    fn members_left(&self, lobby: &mut Lobby, room: &str) {
        if lobby.registry.member_count(room) == 0 {
            if lobby.games.remove(room).is_some() {
                debug!("room {room} is empty");
            }
            return;
        }
        self.room_status(lobby, room);
        self.check_finish(lobby, room, false);
        self.start_if_ready(lobby, room);
    }

    #[cfg(test)]
    fn with_lobby<R>(&self, f: impl FnOnce(&mut Registry, &mut HashMap<String, Game>) -> R) -> R {
        let mut lobby = self.inner.lobby.lock();
        let Lobby {
            registry, games, ..
        } = &mut *lobby;
        f(registry, games)
    }
}

fn standings(game: &Game) -> Vec<(usize, ConnId)> {
    game.session()
        .map(|session| session.leaderboard().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::game::Phase;

    fn coordinator(race_words: usize) -> Coordinator {
        Coordinator::new(GameConfig {
            race_words,
            finish_countdown: Duration::from_secs(20),
            queue_capacity: 64,
        })
    }

    fn drain(inbox: &mut Inbox) -> Vec<Value> {
        let mut messages = vec![];
        while let Some(message) = inbox.try_recv() {
            messages.push(serde_json::from_str(message.to_str().unwrap()).unwrap());
        }
        messages
    }

    fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
        messages.iter().filter(|m| m["type"] == kind).collect()
    }

    fn player(c: &Coordinator, name: &str, room: &str) -> (ConnId, Inbox) {
        let (id, inbox) = c.connect(Identity::new(name));
        c.handle(id, ClientMessage::Join { room: room.into() });
        (id, inbox)
    }

    fn race_words(c: &Coordinator, room: &str) -> Vec<String> {
        c.with_lobby(|_, games| {
            games[room]
                .session()
                .unwrap()
                .text()
                .split(' ')
                .map(str::to_string)
                .collect()
        })
    }

    fn word(word: &str) -> ClientMessage {
        ClientMessage::WordComplete { word: word.into() }
    }

    #[test]
    fn join_announces_and_reports_status() {
        let c = coordinator(3);
        let (a, mut ra) = player(&c, "ann", "r1");
        let messages = drain(&mut ra);
        assert_eq!(messages[0]["type"], "join");
        assert_eq!(messages[0]["username"], "ann");
        assert_eq!(messages[1]["type"], "roomStatus");
        assert_eq!(messages[1]["players"][a.to_string()], false);

        let (b, _rb) = player(&c, "bob", "r1");
        let messages = drain(&mut ra);
        assert_eq!(of_type(&messages, "join")[0]["username"], "bob");
        let status = of_type(&messages, "roomStatus")[0];
        assert_eq!(status["players"][b.to_string()], false);

        c.with_lobby(|_, games| assert_eq!(games["r1"].phase(), Phase::WaitingForReady));
    }

    #[test]
    fn partial_readiness_never_starts() {
        let c = coordinator(3);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        let (cc, _rc) = player(&c, "c", "r1");
        drain(&mut ra);

        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);

        let messages = drain(&mut ra);
        assert!(of_type(&messages, "startGame").is_empty());
        let status = of_type(&messages, "roomStatus").pop().unwrap();
        assert_eq!(status["players"][a.to_string()], true);
        assert_eq!(status["players"][b.to_string()], true);
        assert_eq!(status["players"][cc.to_string()], false);
        c.with_lobby(|_, games| assert!(!games["r1"].is_active()));
    }

    #[test]
    fn ready_before_join_is_ignored() {
        let c = coordinator(3);
        let (a, mut ra) = c.connect(Identity::new("a"));
        c.handle(a, ClientMessage::Ready);
        c.handle(a, ClientMessage::RoomStatus);
        c.handle(a, word("the"));
        assert!(drain(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn two_player_race_scenario() {
        let c = coordinator(4);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, mut rb) = player(&c, "b", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);

        let messages = drain(&mut ra);
        let start = of_type(&messages, "startGame");
        assert_eq!(start.len(), 1);
        let text = start[0]["text"].as_str().unwrap().to_string();
        assert!(!text.is_empty());
        assert!(start[0]["startTime"].as_u64().is_some());
        assert_eq!(of_type(&drain(&mut rb), "startGame").len(), 1);

        // Readiness is cleared once the race is on.
        c.with_lobby(|registry, _| {
            assert!(ready::snapshot(registry, "r1").values().all(|r| !r))
        });

        let words = race_words(&c, "r1");
        assert_eq!(words.join(" "), text);
        let total = words.len();

        c.handle(a, word(&words[0]));
        let progress = drain(&mut ra);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["type"], "userProgress");
        assert_eq!(progress[0]["userid"], a.to_string());
        assert_eq!(progress[0]["percentage"], game::percentage(1, total));

        // A wrong word is dropped without a trace.
        c.handle(a, word("definitely-not-a-word"));
        assert!(drain(&mut ra).is_empty());
        c.handle(a, word(&words[1]));
        let progress = drain(&mut ra);
        assert_eq!(progress[0]["percentage"], game::percentage(2, total));
    }

    #[tokio::test]
    async fn ready_during_a_race_does_not_restart_it() {
        let c = coordinator(2);
        let (a, mut ra) = player(&c, "a", "r1");
        c.handle(a, ClientMessage::Ready);
        assert_eq!(of_type(&drain(&mut ra), "startGame").len(), 1);
        let first = c.with_lobby(|_, games| games["r1"].session().unwrap().id);

        c.handle(a, ClientMessage::Ready);
        c.handle(a, ClientMessage::StartGame);
        assert!(of_type(&drain(&mut ra), "startGame").is_empty());
        assert_eq!(
            c.with_lobby(|_, games| games["r1"].session().unwrap().id),
            first
        );
    }

    #[tokio::test]
    async fn all_finishing_ends_once_with_dense_ranks() {
        let c = coordinator(2);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);
        let words = race_words(&c, "r1");
        drain(&mut ra);

        for w in &words {
            c.handle(b, word(w));
        }
        let messages = drain(&mut ra);
        let ranks = of_type(&messages, "playerRank");
        assert_eq!(ranks.len(), 1);
        assert_eq!(ranks[0]["playerrank"][b.to_string()], 1);
        assert!(of_type(&messages, "endGame").is_empty());
        c.with_lobby(|_, games| assert!(games["r1"].has_countdown()));

        for w in &words {
            c.handle(a, word(w));
        }
        let messages = drain(&mut ra);
        assert_eq!(
            of_type(&messages, "playerRank")[0]["playerrank"][a.to_string()],
            2
        );
        assert_eq!(of_type(&messages, "endGame").len(), 1);
        c.with_lobby(|_, games| {
            assert_eq!(games["r1"].phase(), Phase::Closed);
            assert!(!games["r1"].has_countdown());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_force_ends_the_race() {
        let c = coordinator(1);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);
        let words = race_words(&c, "r1");
        drain(&mut ra);

        c.handle(a, word(&words[0]));
        assert!(of_type(&drain(&mut ra), "endGame").is_empty());

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(of_type(&drain(&mut ra), "endGame").is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(of_type(&drain(&mut ra), "endGame").len(), 1);
        c.with_lobby(|_, games| assert_eq!(games["r1"].phase(), Phase::Closed));

        // The straggler finishing late changes nothing.
        c.handle(b, word(&words[0]));
        assert!(drain(&mut ra).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_after_everyone_finished_stays_silent() {
        let c = coordinator(1);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);
        let words = race_words(&c, "r1");

        c.handle(a, word(&words[0]));
        c.handle(b, word(&words[0]));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(of_type(&drain(&mut ra), "endGame").len(), 1);
    }

    #[tokio::test]
    async fn straggler_leaving_ends_the_race() {
        let c = coordinator(1);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);
        let words = race_words(&c, "r1");
        c.handle(a, word(&words[0]));
        drain(&mut ra);

        c.disconnect(b);
        c.disconnect(b);
        let messages = drain(&mut ra);
        let status = of_type(&messages, "roomStatus");
        assert_eq!(status.len(), 1);
        assert!(status[0]["players"].get(b.to_string()).is_none());
        assert_eq!(of_type(&messages, "endGame").len(), 1);
    }

    #[tokio::test]
    async fn latecomer_watches_but_does_not_race() {
        let c = coordinator(1);
        let (a, mut ra) = player(&c, "a", "r1");
        c.handle(a, ClientMessage::Ready);
        let words = race_words(&c, "r1");

        let (late, mut rl) = player(&c, "late", "r1");
        drain(&mut ra);
        drain(&mut rl);

        c.handle(late, word(&words[0]));
        assert!(drain(&mut rl).is_empty());

        c.handle(a, word(&words[0]));
        let messages = drain(&mut rl);
        assert_eq!(of_type(&messages, "userProgress").len(), 1);
        assert_eq!(of_type(&messages, "endGame").len(), 1);
    }

    #[test]
    fn slow_member_is_evicted_and_room_is_told() {
        let c = Coordinator::new(GameConfig {
            queue_capacity: 2,
            ..GameConfig::default()
        });
        let (a, mut ra) = player(&c, "a", "r1");
        drain(&mut ra);
        // b never drains: join + status fill its queue of two.
        let (b, _rb) = player(&c, "b", "r1");
        drain(&mut ra);

        c.handle(a, ClientMessage::RoomStatus);
        let messages = drain(&mut ra);
        let last = of_type(&messages, "roomStatus").pop().unwrap();
        assert!(last["players"].get(b.to_string()).is_none());
        c.with_lobby(|registry, _| {
            assert!(registry.get(b).is_none());
            assert_eq!(registry.members("r1"), vec![a]);
        });
    }

    #[tokio::test]
    async fn rank_goes_out_before_the_end_when_a_slow_member_is_evicted() {
        let c = Coordinator::new(GameConfig {
            race_words: 1,
            queue_capacity: 5,
            ..GameConfig::default()
        });
        let (a, mut ra) = player(&c, "a", "r1");
        // b never reads: join, three statuses and startGame fill its queue.
        let (b, _rb) = player(&c, "b", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);
        let words = race_words(&c, "r1");
        drain(&mut ra);

        c.handle(a, word(&words[0]));
        let kinds: Vec<String> = drain(&mut ra)
            .iter()
            .map(|m| m["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            ["userProgress", "playerRank", "endGame", "roomStatus"],
            "rank must precede the end"
        );
        c.with_lobby(|registry, _| assert!(registry.get(b).is_none()));
    }

    #[test]
    fn leaving_can_complete_the_ready_gate() {
        let c = coordinator(3);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        let (cc, _rc) = player(&c, "c", "r1");
        c.handle(a, ClientMessage::Ready);
        c.handle(b, ClientMessage::Ready);
        drain(&mut ra);

        c.disconnect(cc);
        let messages = drain(&mut ra);
        assert_eq!(of_type(&messages, "startGame").len(), 1);
        c.with_lobby(|registry, games| {
            assert!(games["r1"].is_active());
            assert!(!ready::all_ready(registry, "r1"));
            let racers = games["r1"].session().unwrap();
            assert!(racers.is_racer(a) && racers.is_racer(b));
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_events_keep_one_race_dense_ranks_and_one_end() {
        const PLAYERS: usize = 8;
        let c = Coordinator::new(GameConfig {
            race_words: 5,
            queue_capacity: 1024,
            ..GameConfig::default()
        });
        let mut players = vec![];
        for i in 0..PLAYERS {
            players.push(player(&c, &format!("p{i}"), "r1"));
        }
        let ids: Vec<ConnId> = players.iter().map(|(id, _)| *id).collect();

        let readies: Vec<_> = ids
            .iter()
            .map(|id| {
                let (c, id) = (c.clone(), *id);
                tokio::spawn(async move { c.handle(id, ClientMessage::Ready) })
            })
            .collect();
        for task in readies {
            task.await.unwrap();
        }
        let words = race_words(&c, "r1");

        let racers: Vec<_> = ids
            .iter()
            .map(|id| {
                let (c, id, words) = (c.clone(), *id, words.clone());
                tokio::spawn(async move {
                    for w in &words {
                        // Interleave with wrong submissions from the same player.
                        c.handle(id, word("not-in-the-vocabulary"));
                        c.handle(id, word(w));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in racers {
            task.await.unwrap();
        }

        let (_, inbox) = &mut players[0];
        let messages = drain(inbox);
        assert_eq!(of_type(&messages, "startGame").len(), 1);
        assert_eq!(of_type(&messages, "endGame").len(), 1);
        assert_eq!(
            of_type(&messages, "userProgress").len(),
            PLAYERS * words.len()
        );

        let mut ranks: Vec<u64> = of_type(&messages, "playerRank")
            .iter()
            .flat_map(|m| m["playerrank"].as_object().unwrap().values())
            .map(|v| v.as_u64().unwrap())
            .collect();
        ranks.sort_unstable();
        assert_eq!(ranks, (1..=PLAYERS as u64).collect::<Vec<_>>());

        let end = messages.iter().position(|m| m["type"] == "endGame").unwrap();
        assert_eq!(end, messages.len() - 1);
        c.with_lobby(|_, games| {
            assert_eq!(games["r1"].phase(), Phase::Closed);
            assert!(!games["r1"].has_countdown());
        });
    }

    #[test]
    fn switching_rooms_updates_both() {
        let c = coordinator(3);
        let (a, mut ra) = player(&c, "a", "r1");
        let (b, _rb) = player(&c, "b", "r1");
        c.handle(b, ClientMessage::Ready);
        drain(&mut ra);

        c.handle(b, ClientMessage::Join { room: "r2".into() });
        let status = of_type(&drain(&mut ra), "roomStatus").pop().unwrap().clone();
        assert!(status["players"].get(b.to_string()).is_none());
        assert_eq!(status["players"][a.to_string()], false);
        c.with_lobby(|registry, games| {
            assert_eq!(registry.room_of(b), Some("r2"));
            assert!(!registry.get(b).unwrap().ready);
            assert!(games.contains_key("r2"));
        });
    }

    #[test]
    fn empty_room_is_forgotten() {
        let c = coordinator(3);
        let (a, _ra) = player(&c, "a", "r1");
        c.disconnect(a);
        c.with_lobby(|registry, games| {
            assert_eq!(registry.member_count("r1"), 0);
            assert!(!games.contains_key("r1"));
        });
    }
}
