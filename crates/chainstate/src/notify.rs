//! Chain event delivery to network and wallet listeners.

use std::sync::Arc;

use beand_consensus::Hash256;
use beand_primitives::Block;

/// Receives chain transitions. Every method defaults to a no-op.
///
/// Events arrive in the order the transitions happened: a reorganization reports its
/// disconnects tip first, then its connects in forward order, then the new tip.
pub trait ChainListener: Send + Sync {
    fn on_new_best_tip(&self, _hash: &Hash256) {}
    fn on_new_transaction(&self, _txid: &Hash256) {}
    fn on_block_connected(&self, _block: &Block) {}
    fn on_block_disconnected(&self, _block: &Block) {}
}

#[derive(Clone, Debug)]
pub enum ChainEvent {
    BlockDisconnected(Arc<Block>),
    BlockConnected(Arc<Block>),
    NewBestTip(Hash256),
    NewTransaction(Hash256),
}

pub(crate) fn dispatch(listeners: &[Arc<dyn ChainListener>], events: &[ChainEvent]) {
    for event in events {
        for listener in listeners {
            match event {
                ChainEvent::BlockDisconnected(block) => listener.on_block_disconnected(block),
                ChainEvent::BlockConnected(block) => listener.on_block_connected(block),
                ChainEvent::NewBestTip(hash) => listener.on_new_best_tip(hash),
                ChainEvent::NewTransaction(txid) => listener.on_new_transaction(txid),
            }
        }
    }
}
