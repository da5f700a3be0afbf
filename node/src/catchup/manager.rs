// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use node_data::ledger::{to_str, Block, Hash, IndexEntry};
use node_data::message::{payload, Message};
use node_data::peer::PeerId;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::conf::{Params, DEFAULT_IDX_REPLY_TIMEOUT};
use crate::database::{self, Ledger};
use crate::directory::PeerDirectory;
use crate::{state, Network};

/// Errors that abort a catch-up run and escalate to the node supervisor.
///
/// Transient peer failures and protocol violations never surface here; they
/// are logged and absorbed by quorum and the redundant request fan-out.
#[derive(Debug, thiserror::Error)]
pub enum CatchupError {
    #[error("store failure: {0}")]
    Store(anyhow::Error),

    #[error("failed to apply block {height}: {reason}")]
    StoreApply { height: u64, reason: anyhow::Error },

    #[error("catch-up invariant broken: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Discovering,
    Fetching,
    Done,
}

/// Drives the two-phase catch-up protocol: block index discovery against a
/// quorum of masternodes, then a fetch of every missing block body with the
/// commit stream kept in strictly increasing height order.
pub struct CatchupManager<
    N: Network,
    DB: database::DB,
    S: state::StateDriver,
> {
    key: PeerId,
    store_full_blocks: bool,
    idx_reply_timeout: Duration,

    phase: Phase,

    /// Last committed block, refreshed from the state driver on start and
    /// after every commit.
    curr_height: u64,
    curr_hash: Hash,

    /// Masternodes that answered the current discovery round. Never
    /// contains this node's own key.
    idx_reply_peers: HashSet<PeerId>,

    /// Ordered, contiguous index entries still to commit; the head is
    /// always `curr_height + 1`.
    pending: VecDeque<IndexEntry>,

    /// Last entry of `pending`, i.e. the current frontier.
    target: Option<IndexEntry>,

    /// Next height the request pump has not fanned out yet.
    next_to_request: Option<u64>,

    /// Height the ordered commit stream expects next.
    awaited: Option<u64>,

    /// Block bodies received ahead of `awaited`.
    buffered: BTreeMap<u64, Block>,

    /// When the current discovery round expires and gets re-issued.
    deadline: Option<Instant>,

    network: Arc<RwLock<N>>,
    db: Arc<RwLock<DB>>,
    state: Arc<RwLock<S>>,
    directory: Arc<RwLock<PeerDirectory>>,
}

impl<N: Network, DB: database::DB, S: state::StateDriver>
    CatchupManager<N, DB, S>
{
    pub fn new(
        key: PeerId,
        conf: &Params,
        network: Arc<RwLock<N>>,
        db: Arc<RwLock<DB>>,
        state: Arc<RwLock<S>>,
        directory: Arc<RwLock<PeerDirectory>>,
    ) -> Self {
        Self {
            key,
            store_full_blocks: conf.store_full_blocks,
            idx_reply_timeout: conf
                .idx_reply_timeout
                .unwrap_or(DEFAULT_IDX_REPLY_TIMEOUT),
            phase: Phase::Idle,
            curr_height: 0,
            curr_hash: Hash::default(),
            idx_reply_peers: HashSet::new(),
            pending: VecDeque::new(),
            target: None,
            next_to_request: None,
            awaited: None,
            buffered: BTreeMap::new(),
            deadline: None,
            network,
            db,
            state,
            directory,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Starts a catch-up run: snapshots the committed tip, broadcasts a
    /// block index request to all masternodes and arms the discovery
    /// deadline.
    pub async fn start(&mut self, force: bool) -> Result<(), CatchupError> {
        if !force && !matches!(self.phase, Phase::Idle | Phase::Done) {
            warn!(event = "catchup already running", phase = ?self.phase);
            return Ok(());
        }

        // a fresh run starts clean; a forced re-broadcast mid-run keeps the
        // pending index and its target
        if matches!(self.phase, Phase::Idle | Phase::Done) {
            self.pending.clear();
            self.target = None;
            self.next_to_request = None;
            self.awaited = None;
            self.buffered.clear();
        }

        let (height, hash) = self
            .state
            .read()
            .await
            .latest()
            .map_err(CatchupError::Store)?;
        self.curr_height = height;
        self.curr_hash = hash;
        self.idx_reply_peers.clear();

        let msg = Message::from(payload::BlockIndexRequest::new(hash));
        if let Err(err) = self.network.read().await.broadcast(&msg).await {
            warn!(event = "unable to broadcast index request", ?err);
        }

        self.deadline = Some(Instant::now() + self.idx_reply_timeout);
        self.phase = Phase::Discovering;

        counter!("catchup_run_count").increment(1);
        info!(
            event = "catchup started",
            height,
            hash = to_str(&hash),
            force
        );

        Ok(())
    }

    /// Cooperative timer body, invoked every check interval: cancels the
    /// discovery deadline once quorum is observed, re-issues the round when
    /// it expires without quorum.
    pub async fn on_tick(&mut self) -> Result<(), CatchupError> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };

        if self.quorum_reached().await {
            debug!(
                event = "index reply quorum reached",
                replies = self.idx_reply_peers.len()
            );
            self.deadline = None;
            return self.try_finish().await;
        }

        if Instant::now() >= deadline {
            let unresponsive: Vec<_> = {
                let directory = self.directory.read().await;
                directory
                    .masternodes()
                    .filter(|m| !self.idx_reply_peers.contains(*m))
                    .copied()
                    .collect()
            };
            warn!(
                event = "discovery timed out",
                timeout = ?self.idx_reply_timeout,
                replies = self.idx_reply_peers.len(),
                unresponsive = ?unresponsive
            );
            counter!("catchup_retry_count").increment(1);
            self.start(true).await?;
        }

        Ok(())
    }

    /// Assimilates a block index reply.
    ///
    /// Duplicate replies from the same peer are absorbed by the reply set;
    /// a later, fatter reply only contributes the tail that grows the
    /// frontier.
    pub async fn on_index_reply(
        &mut self,
        sender: PeerId,
        reply: payload::BlockIndexReply,
    ) -> Result<(), CatchupError> {
        if matches!(self.phase, Phase::Idle | Phase::Done) {
            debug!(event = "index reply outside of a run", sender = %sender);
            return Ok(());
        }

        if sender == self.key {
            warn!(event = "index reply from self");
            return Ok(());
        }

        if !self.directory.read().await.is_masternode(&sender) {
            warn!(event = "index reply from non-masternode", sender = %sender);
            return Ok(());
        }

        if let Err(reason) = validate_indices(&reply.indices) {
            warn!(
                event = "malformed index reply",
                sender = %sender,
                reason
            );
            return Ok(());
        }

        self.idx_reply_peers.insert(sender);

        if reply.indices.is_empty() {
            debug!(
                event = "empty index reply",
                sender = %sender,
                replies = self.idx_reply_peers.len()
            );
            return self.try_finish().await;
        }

        if self.pending.is_empty() {
            let mut indices = reply.indices;

            // a reply answering an older broadcast may lead with heights
            // this run has already committed
            let stale = indices
                .iter()
                .take_while(|e| e.height <= self.curr_height)
                .count();
            if stale > 0 {
                debug!(event = "stale index entries trimmed", count = stale);
                indices.drain(..stale);
            }

            if indices.is_empty() {
                return self.try_finish().await;
            }

            if indices[0].height != self.curr_height + 1 {
                warn!(
                    event = "misaligned index reply",
                    sender = %sender,
                    head = indices[0].height,
                    local = self.curr_height
                );
                return Ok(());
            }

            self.target = indices.last().cloned();
            self.next_to_request = Some(indices[0].height);
            self.pending = indices.into();
            self.phase = Phase::Fetching;

            info!(
                event = "fetch started",
                from = self.curr_height + 1,
                to = self.target.as_ref().map(|t| t.height).unwrap_or_default()
            );
        } else {
            let Some(curr_target) = self.target.as_ref().map(|t| t.height)
            else {
                return Err(self.fatal("pending index without a target"));
            };

            let new_target =
                reply.indices.last().map(|e| e.height).unwrap_or_default();
            if new_target > curr_target {
                let growth: Vec<_> = reply
                    .indices
                    .into_iter()
                    .filter(|e| e.height > curr_target)
                    .collect();

                match growth.first() {
                    Some(first) if first.height == curr_target + 1 => {}
                    _ => {
                        return Err(self.fatal(format!(
                            "spliced index tail does not start at {}",
                            curr_target + 1
                        )))
                    }
                }

                info!(
                    event = "frontier extended",
                    from = curr_target,
                    to = new_target,
                    sender = %sender
                );
                self.pending.extend(growth);
                self.target = self.pending.back().cloned();
                self.phase = Phase::Fetching;
            }
        }

        self.request_missing().await
    }

    /// Handles a fetched block body: commits it when it is the awaited
    /// height, buffers it when it arrived ahead of order, drops it when it
    /// is already committed.
    pub async fn on_data_reply(
        &mut self,
        blk: Block,
    ) -> Result<(), CatchupError> {
        let height = blk.height();

        if height <= self.curr_height {
            debug!(
                event = "dropping block reply",
                height,
                hash = to_str(blk.hash())
            );
            return Ok(());
        }

        let Some(awaited) = self.awaited else {
            debug!(event = "unsolicited block reply", height);
            return Ok(());
        };

        if height > awaited {
            let frontier =
                self.target.as_ref().map(|t| t.height).unwrap_or(awaited);
            if height > frontier {
                warn!(event = "block reply beyond frontier", height, frontier);
            } else {
                self.buffered.entry(height).or_insert(blk);
            }
            return Ok(());
        }

        if self.commit(blk).await? {
            // drain buffered successors; each commit advances `awaited`
            while let Some(next) = self.awaited {
                let Some(buffered) = self.buffered.remove(&next) else {
                    break;
                };
                if !self.commit(buffered).await? {
                    break;
                }
            }
        }

        self.try_finish().await
    }

    /// Consumes a new-block announcement arriving mid-run: the frontier is
    /// extended in place and the body requested from the announced owners;
    /// the ordered commit path absorbs the reply like any other.
    pub async fn on_new_block(
        &mut self,
        notice: payload::NewBlockNotification,
    ) -> Result<(), CatchupError> {
        if matches!(self.phase, Phase::Idle | Phase::Done) {
            warn!(
                event = "unexpected block notification",
                height = notice.height,
                phase = ?self.phase
            );
            return Ok(());
        }

        let height = notice.height;
        if height <= self.curr_height {
            debug!(event = "stale block notification", height);
            return Ok(());
        }

        let frontier = self
            .target
            .as_ref()
            .map(|t| t.height)
            .unwrap_or(self.curr_height);

        if height <= frontier {
            debug!(event = "notification within frontier", height, frontier);
            return Ok(());
        }

        if height == frontier + 1 {
            let entry = IndexEntry {
                height,
                hash: notice.hash,
                owners: notice.owners,
            };

            if self.pending.is_empty() {
                self.next_to_request = Some(height);
            }
            self.pending.push_back(entry.clone());
            self.target = Some(entry);
            self.phase = Phase::Fetching;

            info!(event = "frontier extended", by = "notification", to = height);
            return self.request_missing().await;
        }

        warn!(event = "frontier gap in notification", height, frontier);
        self.request_block(height, &notice.owners).await;

        Ok(())
    }

    /// Serves a block index request (masternodes only): replies with the
    /// index delta between the requester's tip hash and the local tip.
    pub async fn on_index_request(
        &mut self,
        requester: PeerId,
        req: payload::BlockIndexRequest,
    ) -> Result<(), CatchupError> {
        if !self.store_full_blocks {
            warn!(
                event = "index request on a non-storing node",
                requester = %requester
            );
            return Ok(());
        }

        if requester == self.key {
            debug!(event = "index request from self");
            return Ok(());
        }

        if !self.is_known_requester(&requester).await {
            warn!(event = "index request from unknown peer", requester = %requester);
            return Ok(());
        }

        let delta = self.db.read().await.view(
            |t| -> anyhow::Result<Option<Vec<IndexEntry>>> {
                let (tip, _) = t.latest()?;
                let Some(requester_height) =
                    t.height_by_hash(&req.block_hash)?
                else {
                    return Ok(None);
                };

                let missing = tip.saturating_sub(requester_height);
                let indices = if missing == 0 {
                    vec![]
                } else {
                    t.last_n_index(missing)?
                };

                Ok(Some(indices))
            },
        );

        match delta {
            Ok(Some(indices)) => {
                debug!(
                    event = "sending index reply",
                    requester = %requester,
                    entries = indices.len()
                );

                let msg =
                    Message::from(payload::BlockIndexReply::new(indices));
                if let Err(err) = self
                    .network
                    .read()
                    .await
                    .send_to_peer(msg, &requester)
                    .await
                {
                    warn!(event = "unable to send index reply", ?err);
                }
            }
            Ok(None) => warn!(
                event = "index request with unknown hash",
                requester = %requester,
                hash = to_str(&req.block_hash)
            ),
            Err(err) => warn!(event = "index lookup failed", ?err),
        }

        Ok(())
    }

    /// Serves a block data request (masternodes only) with the full body.
    pub async fn on_data_request(
        &mut self,
        requester: PeerId,
        req: payload::BlockDataRequest,
    ) -> Result<(), CatchupError> {
        if !self.store_full_blocks {
            warn!(
                event = "block data request on a non-storing node",
                requester = %requester
            );
            return Ok(());
        }

        if requester == self.key {
            debug!(event = "block data request from self");
            return Ok(());
        }

        if !self.is_known_requester(&requester).await {
            warn!(
                event = "block data request from unknown peer",
                requester = %requester
            );
            return Ok(());
        }

        match self.db.read().await.view(|t| t.block_by_height(req.height)) {
            Ok(Some(blk)) => {
                debug!(
                    event = "sending block data",
                    requester = %requester,
                    height = req.height
                );

                if let Err(err) = self
                    .network
                    .read()
                    .await
                    .send_to_peer(Message::from(blk), &requester)
                    .await
                {
                    warn!(event = "unable to send block data", ?err);
                }
            }
            Ok(None) => warn!(
                event = "block data request for unknown height",
                requester = %requester,
                height = req.height
            ),
            Err(err) => warn!(event = "block lookup failed", ?err),
        }

        Ok(())
    }

    /// The request pump: fans a data request out to every owner of each
    /// height between `next_to_request` and the frontier.
    ///
    /// Requesting from all owners is deliberate redundancy; duplicates are
    /// absorbed by the committed-height guard on the reply path.
    async fn request_missing(&mut self) -> Result<(), CatchupError> {
        let Some(target) = self.target.as_ref().map(|t| t.height) else {
            return Ok(());
        };

        while let Some(next) = self.next_to_request {
            if next > target {
                break;
            }

            let Some(head) = self.pending.front().map(|e| e.height) else {
                return Err(self.fatal("request pump outran the pending index"));
            };

            let owners = match self.pending.get((next - head) as usize) {
                Some(entry) => entry.owners.clone(),
                None => {
                    return Err(self
                        .fatal(format!("no pending entry for height {next}")))
                }
            };

            self.request_block(next, &owners).await;

            if self.awaited.is_none() {
                self.awaited = Some(head);
            }
            self.next_to_request = Some(next + 1);
        }

        Ok(())
    }

    async fn request_block(&self, height: u64, owners: &[PeerId]) {
        for owner in owners {
            if owner == &self.key {
                debug!(event = "skipping self as block owner", height);
                continue;
            }

            debug!(event = "requesting block", height, owner = %owner);

            let msg = Message::from(payload::BlockDataRequest::new(height));
            if let Err(err) =
                self.network.read().await.send_to_peer(msg, owner).await
            {
                warn!(event = "unable to request block", height, ?err);
            }
        }
    }

    /// Applies one block: durable ledger write on storing nodes, state fold
    /// everywhere, then pops the pending head and refreshes the tip.
    ///
    /// Returns `false` when the body does not match the index entry for its
    /// height; the redundant fan-out re-delivers such heights.
    async fn commit(&mut self, blk: Block) -> Result<bool, CatchupError> {
        let height = blk.height();

        let Some(entry) = self.pending.front().cloned() else {
            return Err(self
                .fatal(format!("commit of {height} with empty pending index")));
        };

        if entry.height != height {
            return Err(self.fatal(format!(
                "commit of {height} while the pending head is {}",
                entry.height
            )));
        }

        if &entry.hash != blk.hash() {
            warn!(
                event = "block body does not match index",
                height,
                expected = to_str(&entry.hash),
                received = to_str(blk.hash())
            );
            return Ok(false);
        }

        if self.store_full_blocks {
            self.db
                .read()
                .await
                .update(|t| t.store_block(&blk, &entry.owners))
                .map_err(|reason| CatchupError::StoreApply { height, reason })?;
        }

        self.state
            .read()
            .await
            .apply(&blk)
            .map_err(|reason| CatchupError::StoreApply { height, reason })?;

        self.pending.pop_front();

        let (h, hash) = self
            .state
            .read()
            .await
            .latest()
            .map_err(CatchupError::Store)?;
        self.curr_height = h;
        self.curr_hash = hash;
        self.awaited = (!self.pending.is_empty()).then_some(h + 1);

        counter!("catchup_accepted_block_count").increment(1);
        info!(event = "block accepted", height, hash = to_str(&hash));

        Ok(true)
    }

    /// Closes the run once the pending index is drained and the reply
    /// quorum is in: verifies the tip sits on the target, destroys the
    /// buffers and cancels the timer.
    async fn try_finish(&mut self) -> Result<(), CatchupError> {
        if !self.pending.is_empty() || !self.quorum_reached().await {
            return Ok(());
        }

        if let Some(target) = &self.target {
            if self.curr_height != target.height
                || self.curr_hash != target.hash
            {
                return Err(self.fatal(format!(
                    "finished run is not at its target: local ({}, {}), target ({}, {})",
                    self.curr_height,
                    to_str(&self.curr_hash),
                    target.height,
                    to_str(&target.hash)
                )));
            }
        }

        if !self.buffered.is_empty() {
            warn!(
                event = "discarding buffered blocks",
                count = self.buffered.len()
            );
            self.buffered.clear();
        }

        self.deadline = None;
        self.target = None;
        self.next_to_request = None;
        self.awaited = None;
        self.phase = Phase::Done;

        info!(
            event = "catchup finished",
            height = self.curr_height,
            hash = to_str(&self.curr_hash)
        );

        Ok(())
    }

    /// Quorum is two thirds of the masternode set, minus one so that this
    /// node never counts itself.
    async fn quorum_reached(&self) -> bool {
        let masternodes = self.directory.read().await.masternode_count();
        let quorum = (2 * masternodes).div_ceil(3).saturating_sub(1);
        self.idx_reply_peers.len() >= quorum
    }

    async fn is_known_requester(&self, requester: &PeerId) -> bool {
        let directory = self.directory.read().await;
        directory.is_masternode(requester) || directory.is_delegate(requester)
    }

    fn fatal(&self, reason: impl Into<String>) -> CatchupError {
        let reason = reason.into();
        error!(
            event = "catchup invariant broken",
            reason,
            state = self.dump()
        );
        CatchupError::Invariant(reason)
    }

    fn dump(&self) -> String {
        format!(
            "phase: {:?}, local: ({}, {}), pending: {}, target: {:?}, \
             next_to_request: {:?}, awaited: {:?}, buffered: {:?}, replies: {}",
            self.phase,
            self.curr_height,
            to_str(&self.curr_hash),
            self.pending.len(),
            self.target.as_ref().map(|t| t.height),
            self.next_to_request,
            self.awaited,
            self.buffered.keys().collect::<Vec<_>>(),
            self.idx_reply_peers.len(),
        )
    }
}

fn validate_indices(indices: &[IndexEntry]) -> Result<(), &'static str> {
    if indices.iter().any(|e| e.owners.is_empty()) {
        return Err("entry without owners");
    }

    if indices
        .windows(2)
        .any(|pair| pair[1].height != pair[0].height + 1)
    {
        return Err("entries are not contiguous ascending");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use node_data::message::{AsyncQueue, Payload};

    use super::*;
    use crate::database::mem::MemDB;
    use crate::database::DB as _;
    use crate::state::StateDriver;

    struct TestNetwork {
        key: PeerId,
        sent_broadcasts: Mutex<Vec<Message>>,
        sent_unicasts: Mutex<Vec<(PeerId, Message)>>,
    }

    impl TestNetwork {
        fn new(key: PeerId) -> Self {
            Self {
                key,
                sent_broadcasts: Mutex::new(vec![]),
                sent_unicasts: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Network for TestNetwork {
        async fn broadcast(&self, msg: &Message) -> anyhow::Result<()> {
            self.sent_broadcasts.lock().unwrap().push(msg.clone());
            Ok(())
        }

        async fn send_to_peer(
            &self,
            msg: Message,
            recv_key: &PeerId,
        ) -> anyhow::Result<()> {
            self.sent_unicasts.lock().unwrap().push((*recv_key, msg));
            Ok(())
        }

        async fn add_route(
            &mut self,
            _msg_type: u8,
            _queue: AsyncQueue<Message>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn public_key(&self) -> &PeerId {
            &self.key
        }
    }

    /// Records every fold so the tests can assert the strictly increasing
    /// commit order.
    #[derive(Default)]
    struct TestState {
        tip: Mutex<(u64, Hash)>,
        applied: Mutex<Vec<u64>>,
    }

    impl StateDriver for TestState {
        fn apply(&self, blk: &Block) -> anyhow::Result<()> {
            self.applied.lock().unwrap().push(blk.height());
            *self.tip.lock().unwrap() = (blk.height(), *blk.hash());
            Ok(())
        }

        fn latest(&self) -> anyhow::Result<(u64, Hash)> {
            Ok(*self.tip.lock().unwrap())
        }
    }

    struct Harness {
        mgr: CatchupManager<TestNetwork, MemDB, TestState>,
        network: Arc<RwLock<TestNetwork>>,
        db: Arc<RwLock<MemDB>>,
        state: Arc<RwLock<TestState>>,
        peers: Vec<PeerId>,
    }

    const SELF_KEY: PeerId = PeerId::new([0xAA; 32]);
    const DELEGATE: PeerId = PeerId::new([0xDD; 32]);
    const STRANGER: PeerId = PeerId::new([0xEE; 32]);

    fn key(n: u8) -> PeerId {
        PeerId::new([n; 32])
    }

    fn hash(n: u8) -> Hash {
        [n; 32]
    }

    fn blk(height: u64, hash: Hash) -> Block {
        Block::new(height, hash, vec![height as u8])
    }

    fn entry(height: u64, hash: Hash, owners: &[PeerId]) -> IndexEntry {
        IndexEntry {
            height,
            hash,
            owners: owners.to_vec(),
        }
    }

    fn reply(indices: Vec<IndexEntry>) -> payload::BlockIndexReply {
        payload::BlockIndexReply::new(indices)
    }

    fn harness(masternodes: u8, store_full_blocks: bool) -> Harness {
        let peers: Vec<_> = (1..=masternodes).map(key).collect();
        let directory = Arc::new(RwLock::new(PeerDirectory::new(
            peers.clone(),
            [DELEGATE],
        )));

        let network = Arc::new(RwLock::new(TestNetwork::new(SELF_KEY)));
        let db = Arc::new(RwLock::new(MemDB::new()));
        let state = Arc::new(RwLock::new(TestState::default()));

        let conf = Params {
            store_full_blocks,
            ..Default::default()
        };
        let mgr = CatchupManager::new(
            SELF_KEY,
            &conf,
            network.clone(),
            db.clone(),
            state.clone(),
            directory,
        );

        Harness {
            mgr,
            network,
            db,
            state,
            peers,
        }
    }

    impl Harness {
        async fn broadcasts(&self) -> usize {
            self.network
                .read()
                .await
                .sent_broadcasts
                .lock()
                .unwrap()
                .len()
        }

        async fn unicasts(&self) -> Vec<(PeerId, Message)> {
            self.network
                .read()
                .await
                .sent_unicasts
                .lock()
                .unwrap()
                .clone()
        }

        /// Peers a data request for `height` was sent to, in send order.
        async fn data_requests(&self, height: u64) -> Vec<PeerId> {
            self.unicasts()
                .await
                .into_iter()
                .filter_map(|(to, msg)| match msg.payload {
                    Payload::BlockDataRequest(req)
                        if req.height == height =>
                    {
                        Some(to)
                    }
                    _ => None,
                })
                .collect()
        }

        async fn index_replies_to(
            &self,
            peer: &PeerId,
        ) -> Vec<payload::BlockIndexReply> {
            self.unicasts()
                .await
                .into_iter()
                .filter_map(|(to, msg)| match msg.payload {
                    Payload::BlockIndexReply(r) if to == *peer => Some(r),
                    _ => None,
                })
                .collect()
        }

        async fn applied(&self) -> Vec<u64> {
            self.state.read().await.applied.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn finishes_without_fetch_when_already_at_tip() {
        let mut h = harness(4, false);

        h.mgr.start(false).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Discovering);
        assert_eq!(h.broadcasts().await, 1);

        // quorum for 4 masternodes is 2
        h.mgr.on_index_reply(h.peers[0], reply(vec![])).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Discovering);

        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert_eq!(h.mgr.curr_height, 0);
        assert!(h.unicasts().await.is_empty());

        // a reply landing after the run is over must not reopen it
        let late = reply(vec![entry(1, hash(0xA1), &h.peers[..1])]);
        h.mgr.on_index_reply(h.peers[2], late).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert!(h.unicasts().await.is_empty());
    }

    #[tokio::test]
    async fn fans_requests_out_to_every_owner_and_commits_in_order() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let (h_a, h_b) = (hash(0xA1), hash(0xB2));

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(h.peers[0], reply(vec![entry(1, h_a, &owners)]))
            .await
            .unwrap();
        h.mgr
            .on_index_reply(
                h.peers[1],
                reply(vec![entry(1, h_a, &owners), entry(2, h_b, &owners)]),
            )
            .await
            .unwrap();

        assert_eq!(h.mgr.phase(), Phase::Fetching);
        assert_eq!(h.data_requests(1).await, owners.to_vec());
        assert_eq!(h.data_requests(2).await, owners.to_vec());

        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        h.mgr.on_data_reply(blk(2, h_b)).await.unwrap();

        assert_eq!(h.mgr.phase(), Phase::Done);
        assert_eq!(h.applied().await, vec![1, 2]);
        assert_eq!(h.state.read().await.latest().unwrap(), (2, h_b));
    }

    #[tokio::test]
    async fn buffers_out_of_order_bodies_until_the_gap_closes() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let (h_a, h_b) = (hash(0xA1), hash(0xB2));

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(
                h.peers[0],
                reply(vec![entry(1, h_a, &owners), entry(2, h_b, &owners)]),
            )
            .await
            .unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();

        // height 2 first: buffered, nothing applied yet
        h.mgr.on_data_reply(blk(2, h_b)).await.unwrap();
        assert!(h.applied().await.is_empty());

        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        assert_eq!(h.applied().await, vec![1, 2]);
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert!(h.mgr.buffered.is_empty());
    }

    #[tokio::test]
    async fn duplicate_bodies_are_applied_exactly_once() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let (h_a, h_b) = (hash(0xA1), hash(0xB2));

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(
                h.peers[0],
                reply(vec![entry(1, h_a, &owners), entry(2, h_b, &owners)]),
            )
            .await
            .unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();

        // both owners deliver height 1; the second copy is dropped
        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        h.mgr.on_data_reply(blk(2, h_b)).await.unwrap();

        assert_eq!(h.applied().await, vec![1, 2]);
        assert_eq!(h.mgr.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn notification_extends_the_frontier_mid_fetch() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let (h_a, h_b, h_c) = (hash(0xA1), hash(0xB2), hash(0xC3));

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(
                h.peers[0],
                reply(vec![entry(1, h_a, &owners), entry(2, h_b, &owners)]),
            )
            .await
            .unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();

        h.mgr
            .on_new_block(payload::NewBlockNotification {
                height: 3,
                hash: h_c,
                owners: vec![h.peers[0]],
            })
            .await
            .unwrap();
        assert_eq!(h.data_requests(3).await, vec![h.peers[0]]);

        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        h.mgr.on_data_reply(blk(2, h_b)).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Fetching);

        h.mgr.on_data_reply(blk(3, h_c)).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert_eq!(h.applied().await, vec![1, 2, 3]);
        assert_eq!(h.state.read().await.latest().unwrap(), (3, h_c));
    }

    #[tokio::test]
    async fn a_new_run_does_not_inherit_the_previous_target() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let (h_a, h_b) = (hash(0xA1), hash(0xB2));

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(h.peers[0], reply(vec![entry(1, h_a, &owners)]))
            .await
            .unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();
        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert!(h.mgr.target.is_none());

        // consensus advances the shared state between runs
        h.state.read().await.apply(&blk(2, h_b)).unwrap();

        // an all-empty quorum on the new run must finish at the new tip
        h.mgr.start(false).await.unwrap();
        h.mgr.on_index_reply(h.peers[0], reply(vec![])).await.unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert_eq!(h.mgr.curr_height, 2);
        assert_eq!(h.mgr.curr_hash, h_b);
    }

    #[tokio::test]
    async fn discovery_timeout_rebroadcasts_and_the_retry_completes() {
        let mut h = harness(4, false);

        h.mgr.start(false).await.unwrap();
        h.mgr.on_index_reply(h.peers[0], reply(vec![])).await.unwrap();

        // expire the round: one reply is below the quorum of 2
        h.mgr.deadline = Some(Instant::now());
        h.mgr.on_tick().await.unwrap();
        assert_eq!(h.broadcasts().await, 2);
        assert!(h.mgr.idx_reply_peers.is_empty());

        h.mgr.on_index_reply(h.peers[0], reply(vec![])).await.unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn repeated_replies_from_one_peer_count_once() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let indices =
            vec![entry(1, hash(0xA1), &owners), entry(2, hash(0xB2), &owners)];

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(h.peers[0], reply(indices.clone()))
            .await
            .unwrap();
        let sent = h.unicasts().await.len();

        h.mgr.on_index_reply(h.peers[0], reply(indices)).await.unwrap();

        assert_eq!(h.mgr.idx_reply_peers.len(), 1);
        assert_eq!(h.mgr.pending.len(), 2);
        assert_eq!(h.unicasts().await.len(), sent);
        assert_eq!(h.mgr.phase(), Phase::Fetching);
    }

    #[tokio::test]
    async fn run_completes_only_after_quorum() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let (h_a, h_b) = (hash(0xA1), hash(0xB2));
        let indices = vec![entry(1, h_a, &owners), entry(2, h_b, &owners)];

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(h.peers[0], reply(indices.clone()))
            .await
            .unwrap();

        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        h.mgr.on_data_reply(blk(2, h_b)).await.unwrap();

        // all blocks are in but only one of two required replies landed
        assert_eq!(h.mgr.phase(), Phase::Fetching);

        // a second peer answers the original broadcast late; its entries
        // are all committed by now and must be trimmed away
        h.mgr.on_index_reply(h.peers[1], reply(indices)).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
        assert_eq!(h.applied().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn malformed_replies_are_dropped_and_not_counted() {
        let mut h = harness(4, false);
        let owners = [h.peers[0]];

        h.mgr.start(false).await.unwrap();

        // gap between entries
        h.mgr
            .on_index_reply(
                h.peers[0],
                reply(vec![
                    entry(1, hash(0xA1), &owners),
                    entry(3, hash(0xC3), &owners),
                ]),
            )
            .await
            .unwrap();
        // entry without owners
        h.mgr
            .on_index_reply(h.peers[1], reply(vec![entry(1, hash(0xA1), &[])]))
            .await
            .unwrap();
        // head not anchored at local tip + 1
        h.mgr
            .on_index_reply(
                h.peers[2],
                reply(vec![entry(5, hash(0xE5), &owners)]),
            )
            .await
            .unwrap();

        assert_eq!(h.mgr.phase(), Phase::Discovering);
        assert!(h.mgr.pending.is_empty());
        assert!(h.unicasts().await.is_empty());
        // the anchored-head check happens after the sender is counted
        assert_eq!(h.mgr.idx_reply_peers.len(), 1);
    }

    #[tokio::test]
    async fn replies_from_outside_the_masternode_set_are_ignored() {
        let mut h = harness(4, false);

        h.mgr.start(false).await.unwrap();
        h.mgr.on_index_reply(DELEGATE, reply(vec![])).await.unwrap();
        h.mgr.on_index_reply(STRANGER, reply(vec![])).await.unwrap();
        assert!(h.mgr.idx_reply_peers.is_empty());

        h.mgr.on_index_reply(h.peers[0], reply(vec![])).await.unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();
        assert_eq!(h.mgr.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn misaligned_splice_is_fatal() {
        let mut h = harness(4, false);
        let owners = [h.peers[0]];

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(
                h.peers[0],
                reply(vec![
                    entry(1, hash(0xA1), &owners),
                    entry(2, hash(0xB2), &owners),
                ]),
            )
            .await
            .unwrap();

        // a tail claiming growth but not anchored at target + 1
        let res = h
            .mgr
            .on_index_reply(
                h.peers[1],
                reply(vec![
                    entry(4, hash(0xD4), &owners),
                    entry(5, hash(0xE5), &owners),
                ]),
            )
            .await;

        assert!(matches!(res, Err(CatchupError::Invariant(_))));
    }

    #[tokio::test]
    async fn mismatching_body_is_dropped_and_the_height_stays_awaited() {
        let mut h = harness(4, false);
        let owners = [h.peers[0], h.peers[1]];
        let h_a = hash(0xA1);

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(h.peers[0], reply(vec![entry(1, h_a, &owners)]))
            .await
            .unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();

        h.mgr.on_data_reply(blk(1, hash(0xFF))).await.unwrap();
        assert!(h.applied().await.is_empty());
        assert_eq!(h.mgr.phase(), Phase::Fetching);

        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();
        assert_eq!(h.applied().await, vec![1]);
        assert_eq!(h.mgr.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn masternode_stores_fetched_blocks_durably() {
        let mut h = harness(4, true);
        let owners = [h.peers[0], h.peers[1]];
        let h_a = hash(0xA1);

        h.mgr.start(false).await.unwrap();
        h.mgr
            .on_index_reply(h.peers[0], reply(vec![entry(1, h_a, &owners)]))
            .await
            .unwrap();
        h.mgr.on_index_reply(h.peers[1], reply(vec![])).await.unwrap();
        h.mgr.on_data_reply(blk(1, h_a)).await.unwrap();

        assert_eq!(h.mgr.phase(), Phase::Done);
        let stored = h.db.read().await.view(|t| t.block_by_height(1)).unwrap();
        assert_eq!(stored, Some(blk(1, h_a)));
    }

    #[tokio::test]
    async fn index_service_replies_with_the_delta_to_the_local_tip() {
        let mut h = harness(2, true);
        let owner = h.peers[0];

        let hashes: Vec<_> = (1..=4).map(|n| hash(n as u8)).collect();
        for height in 1..=4u64 {
            let b = blk(height, hashes[height as usize - 1]);
            h.db.read()
                .await
                .update(|t| t.store_block(&b, &[owner]))
                .unwrap();
        }

        // requester sits at height 2: expects entries for 3 and 4
        h.mgr
            .on_index_request(
                h.peers[0],
                payload::BlockIndexRequest::new(hashes[1]),
            )
            .await
            .unwrap();

        let replies = h.index_replies_to(&h.peers[0]).await;
        assert_eq!(replies.len(), 1);
        let heights: Vec<_> =
            replies[0].indices.iter().map(|e| e.height).collect();
        assert_eq!(heights, vec![3, 4]);

        // requester already at tip: empty delta
        h.mgr
            .on_index_request(
                h.peers[1],
                payload::BlockIndexRequest::new(hashes[3]),
            )
            .await
            .unwrap();

        let replies = h.index_replies_to(&h.peers[1]).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].indices.is_empty());
    }

    #[tokio::test]
    async fn index_service_produces_no_self_or_stranger_traffic() {
        let mut h = harness(2, true);

        h.mgr
            .on_index_request(
                SELF_KEY,
                payload::BlockIndexRequest::new(Hash::default()),
            )
            .await
            .unwrap();
        h.mgr
            .on_index_request(
                STRANGER,
                payload::BlockIndexRequest::new(Hash::default()),
            )
            .await
            .unwrap();

        assert!(h.unicasts().await.is_empty());
    }

    #[tokio::test]
    async fn data_service_serves_stored_blocks_only() {
        let mut h = harness(2, true);
        let h_c = hash(0xC3);

        let b = blk(3, h_c);
        h.db.read()
            .await
            .update(|t| t.store_block(&b, &[h.peers[0]]))
            .unwrap();

        h.mgr
            .on_data_request(h.peers[0], payload::BlockDataRequest::new(3))
            .await
            .unwrap();
        h.mgr
            .on_data_request(h.peers[0], payload::BlockDataRequest::new(9))
            .await
            .unwrap();

        let sent = h.unicasts().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, h.peers[0]);
        assert_eq!(sent[0].1.payload, Payload::BlockData(b));
    }
}
