use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use hydrascan_common::{network::Network, time::TimestampSeconds};

use crate::rpc::RpcClient;

const CACHE_CAPACITY: usize = 8_192;

// Shared block-number -> timestamp cache backed by
// eth_getBlockByNumber without transaction bodies
// Used by discovery (first-seen stamping) and by the deployment
// resolver, which both hit the same recent blocks
pub struct BlockTimestamps {
    network: Network,
    rpc: Arc<RpcClient>,
    cache: Mutex<LruCache<u64, TimestampSeconds>>,
}

impl BlockTimestamps {
    pub fn new(network: Network, rpc: Arc<RpcClient>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero");
        Self {
            network,
            rpc,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, block: u64) -> Option<TimestampSeconds> {
        if let Some(cached) = self
            .cache
            .lock()
            .expect("block timestamp cache poisoned")
            .get(&block)
            .copied()
        {
            return Some(cached);
        }

        match self.rpc.get_block_by_number(block, false).await {
            Ok(Some(header)) => {
                let timestamp = header.timestamp()?;
                self.cache
                    .lock()
                    .expect("block timestamp cache poisoned")
                    .put(block, timestamp);
                Some(timestamp)
            }
            Ok(None) => None,
            Err(error) => {
                warn!("{}: cannot fetch block {}: {}", self.network, block, error);
                None
            }
        }
    }
}
