// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::io::{self, Read, Write};

use tracing::{error, warn};

use crate::ledger::Block;
use crate::peer::PeerId;
use crate::Serializable;

/// Topic byte of a wire message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Topics {
    BlockIndexRequest = 16,
    BlockIndexReply = 17,
    BlockDataRequest = 18,
    BlockData = 19,
    NewBlockNotification = 20,

    #[default]
    Unknown = 255,
}

impl From<Topics> for u8 {
    fn from(t: Topics) -> Self {
        t as u8
    }
}

impl From<u8> for Topics {
    fn from(v: u8) -> Self {
        match v {
            16 => Topics::BlockIndexRequest,
            17 => Topics::BlockIndexReply,
            18 => Topics::BlockDataRequest,
            19 => Topics::BlockData,
            20 => Topics::NewBlockNotification,
            _ => Topics::Unknown,
        }
    }
}

pub mod payload {
    use super::*;
    use crate::ledger::{Hash, IndexEntry};

    /// Broadcast to all masternodes; carries the requester's tip hash.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct BlockIndexRequest {
        pub block_hash: Hash,
    }

    impl BlockIndexRequest {
        pub fn new(block_hash: Hash) -> Self {
            Self { block_hash }
        }
    }

    impl Serializable for BlockIndexRequest {
        fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
            w.write_all(&self.block_hash)
        }

        fn read<R: Read>(r: &mut R) -> io::Result<Self> {
            let mut block_hash = Hash::default();
            r.read_exact(&mut block_hash)?;
            Ok(Self { block_hash })
        }
    }

    /// Unicast answer to a [`BlockIndexRequest`]: the index delta between
    /// the requester's tip and the responder's tip, ascending by height.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct BlockIndexReply {
        pub indices: Vec<IndexEntry>,
    }

    impl BlockIndexReply {
        pub fn new(indices: Vec<IndexEntry>) -> Self {
            Self { indices }
        }
    }

    impl Serializable for BlockIndexReply {
        fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
            let count: u32 = self
                .indices
                .len()
                .try_into()
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            w.write_all(&count.to_le_bytes())?;
            for entry in &self.indices {
                entry.write(w)?;
            }
            Ok(())
        }

        fn read<R: Read>(r: &mut R) -> io::Result<Self> {
            let mut count_buf = [0u8; 4];
            r.read_exact(&mut count_buf)?;

            let count = u32::from_le_bytes(count_buf);
            let mut indices = Vec::with_capacity(count as usize);
            for _ in 0..count {
                indices.push(IndexEntry::read(r)?);
            }

            Ok(Self { indices })
        }
    }

    /// Unicast to one owner of a missing block.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BlockDataRequest {
        pub height: u64,
    }

    impl BlockDataRequest {
        pub fn new(height: u64) -> Self {
            Self { height }
        }
    }

    impl Serializable for BlockDataRequest {
        fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
            w.write_all(&self.height.to_le_bytes())
        }

        fn read<R: Read>(r: &mut R) -> io::Result<Self> {
            let height = Self::read_u64_le(r)?;
            Ok(Self { height })
        }
    }

    /// Broadcast announcement of a freshly committed block.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct NewBlockNotification {
        pub height: u64,
        pub hash: Hash,
        pub owners: Vec<PeerId>,
    }

    impl Serializable for NewBlockNotification {
        fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
            w.write_all(&self.height.to_le_bytes())?;
            w.write_all(&self.hash)?;

            let count: u32 = self
                .owners
                .len()
                .try_into()
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            w.write_all(&count.to_le_bytes())?;
            for owner in &self.owners {
                owner.write(w)?;
            }
            Ok(())
        }

        fn read<R: Read>(r: &mut R) -> io::Result<Self> {
            let height = Self::read_u64_le(r)?;

            let mut hash = Hash::default();
            r.read_exact(&mut hash)?;

            let mut count_buf = [0u8; 4];
            r.read_exact(&mut count_buf)?;

            let count = u32::from_le_bytes(count_buf);
            let mut owners = Vec::with_capacity(count as usize);
            for _ in 0..count {
                owners.push(PeerId::read(r)?);
            }

            Ok(Self {
                height,
                hash,
                owners,
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    BlockIndexRequest(payload::BlockIndexRequest),
    BlockIndexReply(payload::BlockIndexReply),
    BlockDataRequest(payload::BlockDataRequest),
    BlockData(Block),
    NewBlockNotification(payload::NewBlockNotification),

    #[default]
    Empty,
}

/// Transport-level details attached by the endpoint that delivered the
/// message; the router socket frames by sender key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub src_key: PeerId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic: Topics,
    pub payload: Payload,
    pub metadata: Option<Metadata>,
}

impl Message {
    pub fn with_metadata(mut self, src_key: PeerId) -> Self {
        self.metadata = Some(Metadata { src_key });
        self
    }
}

impl From<payload::BlockIndexRequest> for Message {
    fn from(p: payload::BlockIndexRequest) -> Self {
        Self {
            topic: Topics::BlockIndexRequest,
            payload: Payload::BlockIndexRequest(p),
            metadata: None,
        }
    }
}

impl From<payload::BlockIndexReply> for Message {
    fn from(p: payload::BlockIndexReply) -> Self {
        Self {
            topic: Topics::BlockIndexReply,
            payload: Payload::BlockIndexReply(p),
            metadata: None,
        }
    }
}

impl From<payload::BlockDataRequest> for Message {
    fn from(p: payload::BlockDataRequest) -> Self {
        Self {
            topic: Topics::BlockDataRequest,
            payload: Payload::BlockDataRequest(p),
            metadata: None,
        }
    }
}

impl From<Block> for Message {
    fn from(b: Block) -> Self {
        Self {
            topic: Topics::BlockData,
            payload: Payload::BlockData(b),
            metadata: None,
        }
    }
}

impl From<payload::NewBlockNotification> for Message {
    fn from(p: payload::NewBlockNotification) -> Self {
        Self {
            topic: Topics::NewBlockNotification,
            payload: Payload::NewBlockNotification(p),
            metadata: None,
        }
    }
}

impl Serializable for Message {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&[self.topic.into()])?;
        match &self.payload {
            Payload::BlockIndexRequest(p) => p.write(w),
            Payload::BlockIndexReply(p) => p.write(w),
            Payload::BlockDataRequest(p) => p.write(w),
            Payload::BlockData(b) => b.write(w),
            Payload::NewBlockNotification(p) => p.write(w),
            Payload::Empty => Ok(()),
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut topic_buf = [0u8; 1];
        r.read_exact(&mut topic_buf)?;

        let topic = Topics::from(topic_buf[0]);
        let payload = match topic {
            Topics::BlockIndexRequest => Payload::BlockIndexRequest(
                payload::BlockIndexRequest::read(r)?,
            ),
            Topics::BlockIndexReply => {
                Payload::BlockIndexReply(payload::BlockIndexReply::read(r)?)
            }
            Topics::BlockDataRequest => {
                Payload::BlockDataRequest(payload::BlockDataRequest::read(r)?)
            }
            Topics::BlockData => Payload::BlockData(Block::read(r)?),
            Topics::NewBlockNotification => Payload::NewBlockNotification(
                payload::NewBlockNotification::read(r)?,
            ),
            Topics::Unknown => {
                return Err(io::Error::from(io::ErrorKind::InvalidData))
            }
        };

        Ok(Self {
            topic,
            payload,
            metadata: None,
        })
    }
}

/// A bounded, labelled, clonable channel shared between a service and the
/// routes registered for it.
#[derive(Clone)]
pub struct AsyncQueue<M: Clone> {
    receiver: async_channel::Receiver<M>,
    sender: async_channel::Sender<M>,
    label: &'static str,
}

impl<M: Clone> AsyncQueue<M> {
    pub fn bounded(cap: usize, label: &'static str) -> Self {
        let (sender, receiver) = async_channel::bounded(cap);
        Self {
            receiver,
            sender,
            label,
        }
    }

    pub async fn send(&self, msg: M) -> anyhow::Result<()> {
        self.sender.send(msg).await.map_err(|_| {
            anyhow::anyhow!("queue {} failed to send: disconnected", self.label)
        })
    }

    pub fn try_send(&self, msg: M) {
        if let Err(e) = self.sender.try_send(msg) {
            match e {
                async_channel::TrySendError::Full(_) => {
                    warn!("queue {} is full", self.label)
                }
                async_channel::TrySendError::Closed(_) => {
                    error!("queue {} is closed", self.label)
                }
            }
        }
    }

    pub async fn recv(&self) -> Result<M, async_channel::RecvError> {
        self.receiver.recv().await
    }
}
