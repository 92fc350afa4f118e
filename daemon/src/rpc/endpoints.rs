use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;

use hydrascan_common::{config::ENDPOINT_STATE_TTL_SECS, network::Network};

// Failure severity attached to an endpoint after a classified error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMark {
    Slow,
    TempFailed,
    // A temporary failure that also demotes the endpoint to the slow
    // group once it becomes selectable again
    TempFailedSlow,
    PermanentFailed,
}

#[derive(Debug, Clone, Default)]
struct EndpointStatus {
    slow_until: Option<Instant>,
    temp_failed_until: Option<Instant>,
    permanent: bool,
}

impl EndpointStatus {
    fn is_slow(&self, now: Instant) -> bool {
        self.slow_until.is_some_and(|until| until > now)
    }

    fn is_temp_failed(&self, now: Instant) -> bool {
        self.temp_failed_until.is_some_and(|until| until > now)
    }
}

// Process-wide endpoint health map, shared by every scanner
// Entries are created lazily and expire on read; permanent failures
// survive until every endpoint of the network is exhausted
pub struct EndpointRegistry {
    ttl: Duration,
    states: DashMap<(Network, String), EndpointStatus>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(ENDPOINT_STATE_TTL_SECS))
    }
}

impl EndpointRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            states: DashMap::new(),
        }
    }

    pub fn mark(&self, network: Network, url: &str, mark: EndpointMark) {
        self.mark_at(network, url, mark, Instant::now());
    }

    fn mark_at(&self, network: Network, url: &str, mark: EndpointMark, now: Instant) {
        let mut entry = self
            .states
            .entry((network, url.to_string()))
            .or_default();
        match mark {
            EndpointMark::Slow => entry.slow_until = Some(now + self.ttl),
            EndpointMark::TempFailed => entry.temp_failed_until = Some(now + self.ttl),
            EndpointMark::TempFailedSlow => {
                entry.slow_until = Some(now + self.ttl);
                entry.temp_failed_until = Some(now + self.ttl);
            }
            EndpointMark::PermanentFailed => {
                entry.permanent = true;
                warn!("{}: endpoint {} permanently failed", network, url);
            }
        }
    }

    // Rotation order for the next attempt: healthy-fast endpoints
    // shuffled first, then the slow group, skipping failed ones
    // An empty result resets temporary state; a still-empty result
    // resets permanent state as last resort
    pub fn selection(&self, network: Network, urls: &[String]) -> Vec<String> {
        self.selection_at(network, urls, Instant::now())
    }

    fn selection_at(&self, network: Network, urls: &[String], now: Instant) -> Vec<String> {
        let picked = self.try_selection(network, urls, now, false);
        if !picked.is_empty() {
            return picked;
        }

        debug!("{}: every endpoint is failed, resetting temporary state", network);
        self.reset_temporary(network);
        let picked = self.try_selection(network, urls, now, false);
        if !picked.is_empty() {
            return picked;
        }

        warn!(
            "{}: every endpoint is permanently failed, resetting as last resort",
            network
        );
        self.reset_permanent(network);
        self.try_selection(network, urls, now, true)
    }

    fn try_selection(
        &self,
        network: Network,
        urls: &[String],
        now: Instant,
        include_all: bool,
    ) -> Vec<String> {
        let mut fast = Vec::new();
        let mut slow = Vec::new();

        for url in urls {
            let status = self
                .states
                .get(&(network, url.clone()))
                .map(|s| s.value().clone())
                .unwrap_or_default();
            if !include_all && (status.permanent || status.is_temp_failed(now)) {
                continue;
            }
            if status.is_slow(now) {
                slow.push(url.clone());
            } else {
                fast.push(url.clone());
            }
        }

        let mut rng = rand::thread_rng();
        fast.shuffle(&mut rng);
        slow.shuffle(&mut rng);
        fast.extend(slow);
        fast
    }

    fn reset_temporary(&self, network: Network) {
        for mut entry in self.states.iter_mut() {
            if entry.key().0 == network {
                entry.value_mut().temp_failed_until = None;
                entry.value_mut().slow_until = None;
            }
        }
    }

    fn reset_permanent(&self, network: Network) {
        for mut entry in self.states.iter_mut() {
            if entry.key().0 == network {
                entry.value_mut().permanent = false;
            }
        }
    }

    // Scanner-level watchdog support: demote the endpoint a stuck
    // request is pinned to and let the rotation advance past it
    pub fn force_switch(&self, network: Network, url: &str) {
        debug!("{}: forced switch away from {}", network, url);
        self.mark(network, url, EndpointMark::TempFailedSlow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_permanent_exclusion() {
        let registry = EndpointRegistry::new(Duration::from_secs(300));
        let list = urls(&["a", "b", "c"]);
        registry.mark(Network::Ethereum, "a", EndpointMark::PermanentFailed);

        for _ in 0..10 {
            let picked = registry.selection(Network::Ethereum, &list);
            assert_eq!(picked.len(), 2);
            assert!(!picked.contains(&"a".to_string()));
        }
    }

    #[test]
    fn test_slow_endpoints_sort_last() {
        let registry = EndpointRegistry::new(Duration::from_secs(300));
        let list = urls(&["a", "b", "c"]);
        registry.mark(Network::Ethereum, "a", EndpointMark::Slow);

        let picked = registry.selection(Network::Ethereum, &list);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked.last().unwrap(), "a");
    }

    #[test]
    fn test_temp_failure_expires() {
        let registry = EndpointRegistry::new(Duration::from_millis(1));
        let list = urls(&["a"]);
        let start = Instant::now();
        registry.mark_at(Network::Base, "a", EndpointMark::TempFailed, start);

        // the mark has expired by now, the endpoint is selectable again
        let later = start + Duration::from_secs(1);
        let picked = registry.selection_at(Network::Base, &list, later);
        assert_eq!(picked, vec!["a".to_string()]);
    }

    #[test]
    fn test_exhaustion_resets_temporary_then_permanent() {
        let registry = EndpointRegistry::new(Duration::from_secs(300));
        let list = urls(&["a", "b"]);
        registry.mark(Network::Polygon, "a", EndpointMark::TempFailed);
        registry.mark(Network::Polygon, "b", EndpointMark::TempFailed);

        // temporary reset is enough here
        let picked = registry.selection(Network::Polygon, &list);
        assert_eq!(picked.len(), 2);

        registry.mark(Network::Polygon, "a", EndpointMark::PermanentFailed);
        registry.mark(Network::Polygon, "b", EndpointMark::PermanentFailed);

        // last resort: permanent state is cleared rather than starving
        let picked = registry.selection(Network::Polygon, &list);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_networks_are_isolated() {
        let registry = EndpointRegistry::new(Duration::from_secs(300));
        registry.mark(Network::Ethereum, "a", EndpointMark::PermanentFailed);

        let picked = registry.selection(Network::Binance, &urls(&["a"]));
        assert_eq!(picked.len(), 1);
    }
}
