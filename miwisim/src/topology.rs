//! Radio reachability between simulated devices.

use hashbrown::HashMap;
use miwi::{Duration, LongAddress};

/// Properties of the radio path between two devices.
#[derive(Debug, Clone)]
pub struct Link {
    /// Link quality indicator reported with every frame.
    pub link_quality: u8,
    /// Signal level reported with every frame.
    pub signal_level: u8,
    /// Frame loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Air time plus processing delay.
    pub delay: Duration,
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            link_quality: 0xC8,
            signal_level: 0x50,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quality(mut self, link_quality: u8, signal_level: u8) -> Self {
        self.link_quality = link_quality;
        self.signal_level = signal_level;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Symmetric reachability map.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(LongAddress, LongAddress), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every device hears every other device.
    pub fn fully_connected(nodes: &[LongAddress]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each device hears only its neighbours in the list.
    pub fn chain(nodes: &[LongAddress]) -> Self {
        let mut topo = Self::new();
        for pair in nodes.windows(2) {
            topo.add_link(pair[0], pair[1], Link::default());
        }
        topo
    }

    /// The first device hears everyone; the others hear only the first.
    pub fn star(nodes: &[LongAddress]) -> Self {
        let mut topo = Self::new();
        let Some((&hub, spokes)) = nodes.split_first() else {
            return topo;
        };
        for &spoke in spokes {
            topo.add_link(hub, spoke, Link::default());
        }
        topo
    }

    pub fn add_link(&mut self, a: LongAddress, b: LongAddress, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: LongAddress, b: LongAddress) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: LongAddress, b: LongAddress) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// Link exists and is up.
    pub fn is_connected(&self, a: LongAddress, b: LongAddress) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Devices reachable from `node` over active links, in address order.
    pub fn neighbors(&self, node: LongAddress) -> Vec<LongAddress> {
        let mut result: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        result.sort();
        result
    }

    /// Take down every link between different groups.
    pub fn partition(&mut self, groups: &[Vec<LongAddress>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Bring every link back up.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_delay(&mut self, delay: Duration) {
        for link in self.links.values_mut() {
            link.delay = delay;
        }
    }

    fn canonical_pair(a: LongAddress, b: LongAddress) -> (LongAddress, LongAddress) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}
