// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod conf;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;
use conf::{Params, DEFAULT_CHECK_INTERVAL};
use manager::CatchupManager;
use node_data::message::{AsyncQueue, Message, Payload, Topics};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::directory::PeerDirectory;
use crate::{database, state, LongLivedService, Network};

const TOPICS: &[u8] = &[
    Topics::BlockIndexRequest as u8,
    Topics::BlockIndexReply as u8,
    Topics::BlockDataRequest as u8,
    Topics::BlockData as u8,
    Topics::NewBlockNotification as u8,
];

/// Catch-up service: reconstructs local state up to the network tip before
/// the node may take part in consensus.
///
/// Wraps a [`CatchupManager`] in the routed-queue service loop; a
/// cooperative interval tick drives the discovery timeout.
pub struct CatchupSrv {
    inbound: AsyncQueue<Message>,
    conf: Params,
    directory: Arc<RwLock<PeerDirectory>>,
}

impl CatchupSrv {
    pub fn new(conf: Params, directory: Arc<RwLock<PeerDirectory>>) -> Self {
        info!("CatchupSrv::new with conf {}", conf);
        Self {
            inbound: AsyncQueue::bounded(
                conf.max_queue_size,
                "catchup_inbound",
            ),
            conf,
            directory,
        }
    }
}

#[async_trait]
impl<N: Network, DB: database::DB, S: state::StateDriver>
    LongLivedService<N, DB, S> for CatchupSrv
{
    async fn execute(
        &mut self,
        network: Arc<RwLock<N>>,
        db: Arc<RwLock<DB>>,
        state: Arc<RwLock<S>>,
    ) -> anyhow::Result<usize> {
        LongLivedService::<N, DB, S>::add_routes(
            self,
            TOPICS,
            self.inbound.clone(),
            &network,
        )
        .await?;

        let key = *network.read().await.public_key();
        let mut manager = CatchupManager::new(
            key,
            &self.conf,
            network.clone(),
            db,
            state,
            self.directory.clone(),
        );

        manager.start(false).await?;

        let check_interval =
            self.conf.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL);

        // Catch-up service loop
        let mut timeout_check = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                biased;
                _ = timeout_check.tick() => {
                    manager.on_tick().await?;
                },
                msg = self.inbound.recv() => {
                    if let Ok(msg) = msg {
                        Self::dispatch(&mut manager, msg).await?;
                    }
                }
            }
        }
    }

    /// Returns service name.
    fn name(&self) -> &'static str {
        "catchup"
    }
}

impl CatchupSrv {
    async fn dispatch<N: Network, DB: database::DB, S: state::StateDriver>(
        manager: &mut CatchupManager<N, DB, S>,
        msg: Message,
    ) -> anyhow::Result<()> {
        match msg.payload {
            Payload::BlockIndexRequest(req) => {
                let Some(meta) = msg.metadata else {
                    warn!(event = "index request without sender");
                    return Ok(());
                };
                manager.on_index_request(meta.src_key, req).await?;
            }
            Payload::BlockIndexReply(reply) => {
                let Some(meta) = msg.metadata else {
                    warn!(event = "index reply without sender");
                    return Ok(());
                };
                manager.on_index_reply(meta.src_key, reply).await?;
            }
            Payload::BlockDataRequest(req) => {
                let Some(meta) = msg.metadata else {
                    warn!(event = "block data request without sender");
                    return Ok(());
                };
                manager.on_data_request(meta.src_key, req).await?;
            }
            Payload::BlockData(blk) => {
                manager.on_data_reply(blk).await?;
            }
            Payload::NewBlockNotification(notice) => {
                manager.on_new_block(notice).await?;
            }
            _ => error!("invalid inbound message payload"),
        }

        Ok(())
    }
}
