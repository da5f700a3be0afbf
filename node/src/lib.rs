// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod catchup;
pub mod database;
pub mod directory;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use node_data::message::{AsyncQueue, Message};
use node_data::peer::PeerId;
use tokio::sync::RwLock;

/// The messaging fabric: one publish socket for broadcasts filtered by a
/// well-known topic, and one router socket for addressed unicasts framed by
/// peer key.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Publishes a message to all masternodes.
    async fn broadcast(&self, msg: &Message) -> anyhow::Result<()>;

    /// Sends a message to a single peer, addressed by its key.
    async fn send_to_peer(
        &self,
        msg: Message,
        recv_key: &PeerId,
    ) -> anyhow::Result<()>;

    /// Routes inbound messages of the given topic into `queue`.
    async fn add_route(
        &mut self,
        msg_type: u8,
        queue: AsyncQueue<Message>,
    ) -> anyhow::Result<()>;

    /// This node's verifying key on the overlay.
    fn public_key(&self) -> &PeerId;
}

#[async_trait]
pub trait LongLivedService<N: Network, DB: database::DB, S: state::StateDriver>:
    Send + Sync
{
    async fn execute(
        &mut self,
        network: Arc<RwLock<N>>,
        database: Arc<RwLock<DB>>,
        state: Arc<RwLock<S>>,
    ) -> anyhow::Result<usize>;

    async fn add_routes(
        &self,
        topics: &[u8],
        queue: AsyncQueue<Message>,
        network: &Arc<RwLock<N>>,
    ) -> anyhow::Result<()> {
        let mut guard = network.write().await;
        for topic in topics {
            guard.add_route(*topic, queue.clone()).await?;
        }
        Ok(())
    }

    /// Returns service name.
    fn name(&self) -> &'static str;
}
