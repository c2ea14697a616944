//! # Kademlia Routing Table and Peer Discovery
//!
//! The routing table keeps 256 buckets indexed by the bit length of the XOR
//! distance between the local node ID and a peer's ID. Bucket `i` holds peers
//! whose distance has its highest set bit at position `i` (bit length `i + 1`).
//!
//! Each bucket is ordered least-recently-seen first and holds at most `k`
//! records. When a bucket is full the least-recently-seen entry is pinged:
//! a live incumbent is kept and the newcomer dropped, a dead incumbent is
//! evicted and the newcomer takes its place.
//!
//! ## Actor Architecture
//!
//! - [`Discovery`]: cheap-to-clone handle used by the supervisor and node
//! - [`DiscoveryActor`]: owns the [`RoutingTable`] and processes commands
//!   sequentially; liveness pings run in its own `JoinSet` so the table is
//!   never held across network I/O
//!
//! ## Lookups
//!
//! [`Discovery::lookup`] is the iterative node lookup used both to join the
//! overlay (target = own ID, seeds = bootstrap address) and to refresh stale
//! buckets. Each round queries up to α unqueried candidates in parallel.

use std::collections::{BinaryHeap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::identity::{distance_bit_length, distance_cmp, NodeId, PeerRecord, ID_BITS};
use crate::protocols::DiscoveryRpc;
use crate::shutdown::wait_for_shutdown;

/// Default bucket capacity.
pub const DEFAULT_K: usize = 20;

/// Default lookup parallelism.
pub const DEFAULT_ALPHA: usize = 3;

/// Command channel capacity for the discovery actor.
const DISCOVERY_COMMAND_CHANNEL_SIZE: usize = 256;

/// Tunables for the routing table and lookups.
#[derive(Clone, Debug)]
pub struct DiscoveryParams {
    pub k: usize,
    pub alpha: usize,
    /// Bound on the liveness check of a full bucket's oldest entry.
    pub ping_timeout: Duration,
    /// Bound on a single find-node or introduction query.
    pub query_timeout: Duration,
    /// Bound on a whole iterative lookup.
    pub lookup_timeout: Duration,
    pub max_rounds: usize,
    pub refresh_interval: Duration,
    /// Buckets untouched for this long get a random lookup.
    pub stale_threshold: Duration,
}

impl Default for DiscoveryParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            ping_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(3),
            lookup_timeout: Duration::from_secs(10),
            max_rounds: 20,
            refresh_interval: Duration::from_secs(15 * 60),
            stale_threshold: Duration::from_secs(30 * 60),
        }
    }
}

/// Result of offering a record to the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended to a bucket with room.
    Inserted,
    /// Already known; moved to most-recently-seen.
    Refreshed,
    /// The bucket's oldest entry failed its ping and was replaced.
    Evicted { evicted: PeerRecord },
    /// The bucket was full and its oldest entry is alive.
    Dropped,
    /// The record is the local node.
    Rejected,
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    records: Vec<PeerRecord>,
    last_refresh: Instant,
}

impl Default for RoutingBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        candidate: Box<PeerRecord>,
        oldest: Box<PeerRecord>,
    },
}

#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: PeerRecord,
    candidate: PeerRecord,
}

#[derive(Debug)]
enum TableUpdate {
    Done(InsertOutcome),
    Pending(PendingBucketUpdate),
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn touch(&mut self, record: PeerRecord, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.records.iter().position(|r| r.node_id() == record.node_id()) {
            let mut existing = self.records.remove(pos);
            existing.touch(record.addr());
            self.records.push(existing);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.records.len() < k {
            self.records.push(record);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.records.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                oldest: Box::new(oldest.clone()),
                candidate: Box::new(record),
            },
            // k == 0: nothing can ever be stored
            None => BucketTouchOutcome::Full {
                oldest: Box::new(record.clone()),
                candidate: Box::new(record),
            },
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.records.iter().position(|r| &r.node_id() == id) {
            let mut existing = self.records.remove(pos);
            let addr = existing.addr();
            existing.touch(addr);
            self.records.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let pos = self.records.iter().position(|r| &r.node_id() == id)?;
        Some(self.records.remove(pos))
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.records.iter().any(|r| &r.node_id() == id)
    }
}

/// Bucket for `other`, or `None` when it is the local ID.
fn bucket_index(self_id: &NodeId, other: &NodeId) -> Option<usize> {
    let bits = distance_bit_length(&self_id.xor_distance(other));
    bits.checked_sub(1)
}

/// Random ID whose distance from `self_id` falls in `bucket_idx`.
fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let leading = ID_BITS - 1 - bucket_idx.min(ID_BITS - 1);
    let byte_idx = leading / 8;
    let bit_pos = leading % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }

    NodeId::from_bytes(target)
}

/// Closer first; equal distances put the most recently seen first.
fn rank_cmp(target: &NodeId, a: &PeerRecord, b: &PeerRecord) -> std::cmp::Ordering {
    let da = a.node_id().xor_distance(target);
    let db = b.node_id().xor_distance(target);
    distance_cmp(&da, &db).then_with(|| b.last_seen().cmp(&a.last_seen()))
}

fn sort_by_distance(records: &mut [PeerRecord], target: &NodeId) {
    records.sort_by(|a, b| rank_cmp(target, a, b));
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(RoutingBucket::new());
        }
        Self {
            self_id,
            k,
            buckets,
        }
    }

    fn update(&mut self, record: PeerRecord) -> TableUpdate {
        let Some(idx) = bucket_index(&self.self_id, &record.node_id()) else {
            return TableUpdate::Done(InsertOutcome::Rejected);
        };
        match self.buckets[idx].touch(record, self.k) {
            BucketTouchOutcome::Inserted => TableUpdate::Done(InsertOutcome::Inserted),
            BucketTouchOutcome::Refreshed => TableUpdate::Done(InsertOutcome::Refreshed),
            BucketTouchOutcome::Full { candidate, oldest } => {
                if self.k == 0 {
                    return TableUpdate::Done(InsertOutcome::Dropped);
                }
                TableUpdate::Pending(PendingBucketUpdate {
                    bucket_index: idx,
                    oldest: *oldest,
                    candidate: *candidate,
                })
            }
        }
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) -> InsertOutcome {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.node_id());
            return InsertOutcome::Dropped;
        }

        let evicted = bucket.remove(&pending.oldest.node_id());
        if bucket.contains(&pending.candidate.node_id()) {
            return InsertOutcome::Refreshed;
        }
        if bucket.records.len() >= k {
            return InsertOutcome::Dropped;
        }
        bucket.records.push(pending.candidate);
        bucket.mark_refreshed();
        match evicted {
            Some(evicted) => InsertOutcome::Evicted { evicted },
            None => InsertOutcome::Inserted,
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        match bucket_index(&self.self_id, id) {
            Some(idx) => self.buckets[idx].remove(id).is_some(),
            None => false,
        }
    }

    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }

        struct Ranked<'a> {
            target: &'a NodeId,
            record: PeerRecord,
        }

        impl PartialEq for Ranked<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == std::cmp::Ordering::Equal
            }
        }

        impl Eq for Ranked<'_> {}

        impl Ord for Ranked<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                rank_cmp(self.target, &self.record, &other.record)
            }
        }

        impl PartialOrd for Ranked<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Ranked<'_>> = BinaryHeap::with_capacity(count + 1);

        for bucket in &self.buckets {
            for record in &bucket.records {
                let candidate = Ranked { target, record: record.clone() };
                if heap.len() < count {
                    heap.push(candidate);
                } else if let Some(worst) = heap.peek()
                    && candidate < *worst
                {
                    heap.push(candidate);
                    heap.pop();
                }
            }
        }

        let mut result: Vec<_> = heap.into_iter().map(|ranked| ranked.record).collect();
        sort_by_distance(&mut result, target);
        result
    }

    pub fn get(&self, id: &NodeId) -> Option<PeerRecord> {
        let idx = bucket_index(&self.self_id, id)?;
        self.buckets[idx]
            .records
            .iter()
            .find(|r| r.node_id() == *id)
            .cloned()
    }

    pub fn all_known(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.records.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.records.len()).sum()
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.records.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }
}

/// Summary of a completed iterative lookup.
#[derive(Clone, Debug)]
pub struct LookupReport {
    /// Up to `k` records that answered a find-node query, closest first.
    pub closest: Vec<PeerRecord>,
    pub rounds: usize,
    /// Peers that answered a find-node query.
    pub responded: usize,
}

enum Command {
    Insert(PeerRecord, Option<oneshot::Sender<InsertOutcome>>),
    Remove(NodeId),
    Closest(NodeId, usize, oneshot::Sender<Vec<PeerRecord>>),
    Get(NodeId, oneshot::Sender<Option<PeerRecord>>),
    AllKnown(oneshot::Sender<Vec<PeerRecord>>),
    Len(oneshot::Sender<usize>),
    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
}

type PingOutcome = (PendingBucketUpdate, bool, Option<oneshot::Sender<InsertOutcome>>);

pub struct Discovery<N: DiscoveryRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
    network: Arc<N>,
    params: DiscoveryParams,
    shutdown: watch::Receiver<bool>,
}

impl<N: DiscoveryRpc> Clone for Discovery<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            network: self.network.clone(),
            params: self.params.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub struct DiscoveryActor<N: DiscoveryRpc> {
    routing: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
    network: Arc<N>,
    ping_timeout: Duration,
    pings: JoinSet<PingOutcome>,
    shutdown: watch::Receiver<bool>,
}

impl<N: DiscoveryRpc> Discovery<N> {
    /// Create the handle and its actor. The caller spawns [`DiscoveryActor::run`].
    pub fn new(
        id: NodeId,
        network: Arc<N>,
        params: DiscoveryParams,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, DiscoveryActor<N>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(DISCOVERY_COMMAND_CHANNEL_SIZE);

        let actor = DiscoveryActor {
            routing: RoutingTable::new(id, params.k),
            cmd_rx,
            network: network.clone(),
            ping_timeout: params.ping_timeout,
            pings: JoinSet::new(),
            shutdown: shutdown.clone(),
        };

        let handle = Self {
            cmd_tx,
            id,
            network,
            params,
            shutdown,
        };
        (handle, actor)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Offer a record to the table and wait for the outcome, including the
    /// liveness check when its bucket is full.
    pub async fn insert(&self, record: PeerRecord) -> InsertOutcome {
        self.request(|tx| Command::Insert(record, Some(tx)))
            .await
            .unwrap_or(InsertOutcome::Rejected)
    }

    /// Offer a record without waiting for the outcome.
    pub async fn observe(&self, record: PeerRecord) {
        let _ = self.cmd_tx.send(Command::Insert(record, None)).await;
    }

    pub async fn remove(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::Remove(id)).await;
    }

    pub async fn closest_to(&self, target: NodeId, count: usize) -> Vec<PeerRecord> {
        self.request(|tx| Command::Closest(target, count, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn get(&self, id: NodeId) -> Option<PeerRecord> {
        self.request(|tx| Command::Get(id, tx)).await.flatten()
    }

    pub async fn all_known(&self) -> Vec<PeerRecord> {
        self.request(Command::AllKnown).await.unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.request(Command::Len).await.unwrap_or_default()
    }

    /// Answer a remote find-node query.
    pub async fn handle_find_node(&self, target: NodeId) -> Vec<PeerRecord> {
        self.closest_to(target, self.params.k).await
    }

    /// Join the overlay through `seeds`, looking up our own ID.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<LookupReport> {
        self.lookup(self.id, seeds).await
    }

    /// Iterative node lookup for `target`.
    ///
    /// Seeds are reached first and added to the shortlist. Fails only when
    /// seeds were given and none of them could be reached.
    pub async fn lookup(&self, target: NodeId, seeds: &[SocketAddr]) -> Result<LookupReport> {
        let started = Instant::now();
        let mut shutdown = self.shutdown.clone();
        let k = self.params.k.max(1);
        let alpha = self.params.alpha.max(1);

        let mut shortlist = self.closest_to(target, k).await;
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|r| r.node_id()).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responders: HashSet<NodeId> = HashSet::new();
        let mut responded = 0usize;
        let mut rounds = 0usize;

        if !seeds.is_empty() {
            let introduced = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    return Err(anyhow!("lookup cancelled by shutdown"));
                }
                introduced = self.introduce_seeds(seeds) => introduced,
            };
            if introduced.is_empty() {
                return Err(anyhow!("no bootstrap peer reachable at {:?}", seeds));
            }
            for record in introduced {
                if record.node_id() != self.id && seen.insert(record.node_id()) {
                    shortlist.push(record);
                }
            }
            sort_by_distance(&mut shortlist, &target);
        }

        let mut best_distance = shortlist
            .first()
            .map(|r| r.node_id().xor_distance(&target))
            .unwrap_or([0xff; 32]);

        loop {
            if rounds >= self.params.max_rounds {
                warn!(
                    target = ?hex::encode(&target.as_bytes()[..8]),
                    rounds,
                    "iterative lookup exceeded max rounds"
                );
                break;
            }

            if started.elapsed() > self.params.lookup_timeout {
                debug!(
                    target = ?hex::encode(&target.as_bytes()[..8]),
                    elapsed_ms = started.elapsed().as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let candidates: Vec<PeerRecord> = shortlist
                .iter()
                .filter(|r| !queried.contains(&r.node_id()) && r.node_id() != self.id)
                .take(alpha)
                .cloned()
                .collect();

            if candidates.is_empty() {
                break;
            }
            rounds += 1;

            for r in &candidates {
                queried.insert(r.node_id());
            }

            let results = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!(rounds, "iterative lookup cancelled by shutdown");
                    break;
                }
                results = self.query_round(candidates, target) => results,
            };

            for (record, result) in results {
                match result {
                    Ok(nodes) => {
                        responded += 1;
                        responders.insert(record.node_id());
                        self.observe(record).await;
                        for n in nodes {
                            if n.node_id() == self.id {
                                continue;
                            }
                            if seen.insert(n.node_id()) {
                                self.observe(n.clone()).await;
                                shortlist.push(n);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %record.node_id(), error = %e, "find_node query failed");
                        shortlist.retain(|r| r.node_id() != record.node_id());
                    }
                }
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let mut any_closer = false;
            if let Some(first) = shortlist.first() {
                let new_best = first.node_id().xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    any_closer = true;
                }
            }

            if !any_closer {
                break;
            }
        }

        shortlist.retain(|r| responders.contains(&r.node_id()));

        debug!(
            target = ?hex::encode(&target.as_bytes()[..8]),
            found = shortlist.len(),
            queried = queried.len(),
            rounds,
            "iterative lookup completed"
        );

        Ok(LookupReport {
            closest: shortlist,
            rounds,
            responded,
        })
    }

    async fn introduce_seeds(&self, seeds: &[SocketAddr]) -> Vec<PeerRecord> {
        let mut join_set = JoinSet::new();
        for addr in seeds.iter().copied() {
            let net = self.network.clone();
            let timeout = self.params.query_timeout;
            join_set.spawn(async move {
                let result = match tokio::time::timeout(timeout, net.introduce(addr)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("introduction timed out")),
                };
                (addr, result)
            });
        }

        let mut introduced = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(record))) => {
                    if record.node_id() == self.id {
                        debug!(addr = %record.addr(), "bootstrap address points at this node, skipping");
                        continue;
                    }
                    self.observe(record.clone()).await;
                    introduced.push(record);
                }
                Ok((addr, Err(e))) => {
                    debug!(addr = %addr, error = %e, "bootstrap peer unreachable");
                }
                Err(e) => {
                    debug!(error = %e, "introduction task failed");
                }
            }
        }
        introduced
    }

    async fn query_round(
        &self,
        candidates: Vec<PeerRecord>,
        target: NodeId,
    ) -> Vec<(PeerRecord, Result<Vec<PeerRecord>>)> {
        let mut join_set = JoinSet::new();
        let candidates_len = candidates.len();
        for (idx, record) in candidates.into_iter().enumerate() {
            let net = self.network.clone();
            let timeout = self.params.query_timeout;
            join_set.spawn(async move {
                let result = match tokio::time::timeout(timeout, net.find_node(&record, target)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("query timeout")),
                };
                (idx, record, result)
            });
        }

        let mut results: Vec<Option<(PeerRecord, Result<Vec<PeerRecord>>)>> =
            Vec::with_capacity(candidates_len);
        results.resize_with(candidates_len, || None);
        while let Some(joined) = join_set.join_next().await {
            if let Ok((idx, record, result)) = joined {
                results[idx] = Some((record, result));
            }
        }
        results.into_iter().flatten().collect()
    }

    /// Periodically run random lookups inside buckets that saw no traffic.
    /// Returns when the shutdown signal fires.
    pub async fn run_bucket_refresh(self) {
        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.params.refresh_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            let stale_buckets = match self
                .request(|tx| Command::StaleBuckets(self.params.stale_threshold, tx))
                .await
            {
                Some(buckets) => buckets,
                None => break,
            };

            if stale_buckets.is_empty() {
                continue;
            }

            debug!(count = stale_buckets.len(), "refreshing stale routing buckets");

            for bucket_idx in stale_buckets {
                let target = random_id_for_bucket(&self.id, bucket_idx);
                if let Err(e) = self.lookup(target, &[]).await {
                    debug!(bucket = bucket_idx, error = ?e, "bucket refresh lookup failed");
                }
                let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

impl<N: DiscoveryRpc> DiscoveryActor<N> {
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(joined) = self.pings.join_next(), if !self.pings.is_empty() => {
                    if let Ok((pending, alive, reply)) = joined {
                        let oldest = pending.oldest.node_id();
                        let outcome = self.routing.apply_ping_result(pending, alive);
                        trace!(oldest = %oldest, alive, outcome = ?outcome, "applied bucket ping result");
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    }
                }
            }
        }
        self.pings.shutdown().await;
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert(record, reply) => self.handle_insert(record, reply),
            Command::Remove(id) => {
                self.routing.remove(&id);
            }
            Command::Closest(target, count, reply) => {
                let _ = reply.send(self.routing.closest(&target, count));
            }
            Command::Get(id, reply) => {
                let _ = reply.send(self.routing.get(&id));
            }
            Command::AllKnown(reply) => {
                let _ = reply.send(self.routing.all_known());
            }
            Command::Len(reply) => {
                let _ = reply.send(self.routing.len());
            }
            Command::StaleBuckets(threshold, reply) => {
                let _ = reply.send(self.routing.stale_bucket_indices(threshold));
            }
            Command::MarkBucketRefreshed(idx) => {
                self.routing.mark_bucket_refreshed(idx);
            }
        }
    }

    fn handle_insert(&mut self, record: PeerRecord, reply: Option<oneshot::Sender<InsertOutcome>>) {
        match self.routing.update(record) {
            TableUpdate::Done(outcome) => {
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            TableUpdate::Pending(pending) => {
                let network = self.network.clone();
                let timeout = self.ping_timeout;
                trace!(
                    oldest = %pending.oldest.node_id(),
                    candidate = %pending.candidate.node_id(),
                    "bucket full, pinging oldest entry"
                );
                self.pings.spawn(async move {
                    let alive = matches!(
                        tokio::time::timeout(timeout, network.ping(&pending.oldest)).await,
                        Ok(Ok(()))
                    );
                    (pending, alive, reply)
                });
            }
        }
    }
}
