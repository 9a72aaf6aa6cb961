#![allow(dead_code)]

//! A multi-peer harness: an in-process router standing in for the network, with partition
//! control, per-peer apply-stream collectors, and continuous safety checking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::unbounded;

use raftlog::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use raftlog::{Config, MemoryPersister, Node, Transport};

pub const ELECTION_MIN: Duration = Duration::from_millis(150);
pub const ELECTION_MAX: Duration = Duration::from_millis(300);
pub const HEARTBEAT: Duration = Duration::from_millis(20);

/// How long we give the group to elect before declaring the scenario failed.
pub const ELECTION_PATIENCE: Duration = Duration::from_secs(3);

/// How long we give a started command to land on every expected peer.
pub const COMMIT_PATIENCE: Duration = Duration::from_secs(5);

pub fn config() -> Config {
    Config {
        election_timeout_min: ELECTION_MIN,
        election_timeout_max: ELECTION_MAX,
        heartbeat_interval: HEARTBEAT,
    }
}

//
// Router
//

/// Delivers RPCs between live peers, dropping anything crossing a cut.
pub struct Router {
    nodes: Mutex<Vec<Option<Node>>>,
    cuts: Mutex<BTreeSet<(usize, usize)>>,
}

impl Router {
    fn new(size: usize) -> Self {
        Self {
            nodes: Mutex::new(vec![None; size]),
            cuts: Mutex::new(BTreeSet::new()),
        }
    }

    fn register(&self, id: usize, node: Node) {
        self.nodes.lock().unwrap()[id] = Some(node);
    }

    fn deregister(&self, id: usize) {
        self.nodes.lock().unwrap()[id] = None;
    }

    fn route(&self, from: usize, to: usize) -> Option<Node> {
        if self.cuts.lock().unwrap().contains(&(from, to)) {
            return None;
        }
        let node = self.nodes.lock().unwrap()[to].clone()?;
        if node.killed() {
            return None;
        }
        Some(node)
    }

    fn cut(&self, from: usize, to: usize) {
        self.cuts.lock().unwrap().insert((from, to));
    }

    fn heal_all(&self) {
        self.cuts.lock().unwrap().clear();
    }
}

/// One peer's view of the router.
struct Lane {
    router: Arc<Router>,
    from: usize,
}

impl Transport for Lane {
    fn request_vote(&self, to: usize, request: &VoteRequest) -> Option<VoteResponse> {
        let node = self.router.route(self.from, to)?;
        Some(node.request_vote(request.clone()))
    }

    fn append_entries(&self, to: usize, request: &AppendRequest) -> Option<AppendResponse> {
        let node = self.router.route(self.from, to)?;
        Some(node.append_entries(request.clone()))
    }
}

//
// Cluster
//

pub struct Cluster {
    pub size: usize,
    router: Arc<Router>,
    nodes: Vec<Node>,
    persisters: Vec<MemoryPersister>,
    applied: Vec<Arc<Mutex<Vec<(u64, Bytes)>>>>,
    leaders_by_term: Mutex<BTreeMap<u64, usize>>,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Self::with_persisters((0..size).map(|_| MemoryPersister::new()).collect())
    }

    /// Builds a group on top of existing persisters, restoring whatever state they hold.
    pub fn with_persisters(persisters: Vec<MemoryPersister>) -> Self {
        init_logger();
        let size = persisters.len();
        let router = Arc::new(Router::new(size));
        let mut nodes = Vec::with_capacity(size);
        let mut applied = Vec::with_capacity(size);

        for (id, persister) in persisters.iter().enumerate() {
            let (node, stream) = boot_node(&router, size, id, persister);
            nodes.push(node);
            applied.push(stream);
        }

        Self {
            size,
            router,
            nodes,
            persisters,
            applied,
            leaders_by_term: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    //
    // partitions
    //

    /// Severs every link between `id` and the rest of the group, both directions.
    pub fn isolate(&self, id: usize) {
        for other in 0..self.size {
            if other != id {
                self.router.cut(id, other);
                self.router.cut(other, id);
            }
        }
    }

    pub fn drop_between(&self, a: usize, b: usize) {
        self.router.cut(a, b);
        self.router.cut(b, a);
    }

    pub fn heal(&self) {
        self.router.heal_all();
    }

    //
    // elections
    //

    /// Polls until exactly one peer of `group` claims leadership, continuously checking
    /// election safety over every claim observed on the way. Panics if no leader settles
    /// within the patience window.
    pub fn wait_for_leader_among(&self, group: &[usize]) -> usize {
        let deadline = Instant::now() + ELECTION_PATIENCE;
        loop {
            let mut leaders = Vec::new();
            for &id in group {
                let (term, is_leader) = self.nodes[id].get_state();
                if is_leader {
                    self.check_election_safety(term.0, id);
                    leaders.push((term.0, id));
                }
            }
            if leaders.len() == 1 {
                return leaders[0].1;
            }
            // two claimants can coexist briefly across terms; keep polling until one yields
            assert!(
                Instant::now() < deadline,
                "no single leader among {:?} in time, saw {:?}",
                group,
                leaders
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn wait_for_leader(&self) -> usize {
        let everyone: Vec<usize> = (0..self.size).collect();
        self.wait_for_leader_among(&everyone)
    }

    /// Polls until every peer of `group` reports the same term and a single leader.
    pub fn wait_for_agreement_among(&self, group: &[usize]) -> (u64, usize) {
        let deadline = Instant::now() + ELECTION_PATIENCE;
        loop {
            let states: Vec<(u64, bool)> = group
                .iter()
                .map(|&id| {
                    let (term, is_leader) = self.nodes[id].get_state();
                    if is_leader {
                        self.check_election_safety(term.0, id);
                    }
                    (term.0, is_leader)
                })
                .collect();
            let leaders = states.iter().filter(|(_, is_leader)| *is_leader).count();
            let one_term = states.windows(2).all(|pair| pair[0].0 == pair[1].0);
            if leaders == 1 && one_term {
                let winner = group
                    .iter()
                    .zip(&states)
                    .find(|(_, (_, is_leader))| *is_leader)
                    .map(|(&id, _)| id)
                    .unwrap();
                return (states[0].0, winner);
            }
            assert!(
                Instant::now() < deadline,
                "group {:?} never settled on one leader and term: {:?}",
                group,
                states
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn check_election_safety(&self, term: u64, leader: usize) {
        let mut leaders = self.leaders_by_term.lock().unwrap();
        let recorded = leaders.entry(term).or_insert(leader);
        assert_eq!(
            *recorded, leader,
            "two leaders at term {}: {} and {}",
            term, *recorded, leader
        );
    }

    //
    // replication
    //

    /// Starts `command` on whichever member of `group` leads and waits until every member
    /// has applied it at the index the leader returned. Returns that index.
    pub fn commit_one_among(&self, group: &[usize], command: &str) -> u64 {
        let deadline = Instant::now() + COMMIT_PATIENCE;
        loop {
            let leader = self.wait_for_leader_among(group);
            let (index, _, is_leader) = self.nodes[leader]
                .start(Bytes::copy_from_slice(command.as_bytes()));
            if is_leader {
                for &id in group {
                    self.wait_applied(id, index.0, command);
                }
                return index.0;
            }
            assert!(
                Instant::now() < deadline,
                "no member of {:?} would accept {:?}",
                group,
                command
            );
        }
    }

    pub fn commit_one(&self, command: &str) -> u64 {
        let everyone: Vec<usize> = (0..self.size).collect();
        self.commit_one_among(&everyone, command)
    }

    /// Waits until peer `id` has applied `command` at `index`, then verifies its whole
    /// stream so far is dense, in order and duplicate-free.
    pub fn wait_applied(&self, id: usize, index: u64, command: &str) {
        let deadline = Instant::now() + COMMIT_PATIENCE;
        loop {
            {
                let stream = self.applied[id].lock().unwrap();
                if stream.len() >= index as usize {
                    let (applied_index, applied_command) = &stream[index as usize - 1];
                    assert_eq!(*applied_index, index, "peer {} applied out of order", id);
                    assert_eq!(
                        applied_command, command,
                        "peer {} applied the wrong command at index {}",
                        id, index
                    );
                    verify_stream(id, &stream);
                    return;
                }
            }
            assert!(
                Instant::now() < deadline,
                "peer {} never applied {:?} at index {}",
                id,
                command,
                index
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// A snapshot of everything peer `id` has applied so far.
    pub fn applied_on(&self, id: usize) -> Vec<(u64, Bytes)> {
        self.applied[id].lock().unwrap().clone()
    }

    /// State-machine safety: no two peers ever applied different commands at one index.
    pub fn assert_streams_agree(&self) {
        for a in 0..self.size {
            let stream_a = self.applied_on(a);
            verify_stream(a, &stream_a);
            for b in a + 1..self.size {
                let stream_b = self.applied_on(b);
                let common = stream_a.len().min(stream_b.len());
                assert_eq!(
                    &stream_a[..common],
                    &stream_b[..common],
                    "peers {} and {} disagree on applied commands",
                    a,
                    b
                );
            }
        }
    }

    //
    // crash / restart
    //

    /// Kills every peer, keeping the persisters. The group can be rebuilt over them with
    /// [`Cluster::with_persisters`].
    pub fn crash_all(mut self) -> Vec<MemoryPersister> {
        for node in &self.nodes {
            node.kill();
        }
        for id in 0..self.size {
            self.router.deregister(id);
        }
        std::mem::take(&mut self.persisters)
    }

    /// Kills one peer and brings it straight back up from its own persister.
    pub fn restart(&mut self, id: usize) {
        self.nodes[id].kill();
        self.router.deregister(id);
        let (node, stream) = boot_node(&self.router, self.size, id, &self.persisters[id]);
        self.nodes[id] = node;
        self.applied[id] = stream;
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.kill();
        }
    }
}

fn boot_node(
    router: &Arc<Router>,
    size: usize,
    id: usize,
    persister: &MemoryPersister,
) -> (Node, Arc<Mutex<Vec<(u64, Bytes)>>>) {
    let (apply_tx, apply_rx) = unbounded();
    let lane = Lane {
        router: router.clone(),
        from: id,
    };
    let node = Node::with_config(
        config(),
        Arc::new(lane),
        size,
        id,
        Box::new(persister.clone()),
        apply_tx,
    )
    .expect("restoring a peer from its persister");
    router.register(id, node.clone());

    let stream = Arc::new(Mutex::new(Vec::new()));
    {
        let stream = stream.clone();
        let _ = thread::spawn(move || {
            for msg in apply_rx {
                if msg.command_valid {
                    stream
                        .lock()
                        .unwrap()
                        .push((msg.command_index.0, msg.command));
                }
            }
        });
    }
    (node, stream)
}

fn verify_stream(id: usize, stream: &[(u64, Bytes)]) {
    for (position, (index, _)) in stream.iter().enumerate() {
        assert_eq!(
            *index,
            position as u64 + 1,
            "peer {} applied indices with a gap or duplicate",
            id
        );
    }
}

//
// TestLogger
//

struct TestLogger;

static LOGGER: TestLogger = TestLogger;

pub fn init_logger() {
    let _ignore = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{:>5} {}", record.level(), record.args());
    }

    fn flush(&self) {}
}
