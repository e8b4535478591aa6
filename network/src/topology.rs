use crate::{Address, Error, Node};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Bandwidth of a 1 Gbit/s link in bits per microsecond.
pub const DEFAULT_BANDWIDTH: f64 = 1000.0;

/// Nodes of the simulated network and the bandwidth of the links between them.
///
/// A topology is wired before the simulation starts and is read-only afterwards (see
/// [crate::Environment::install]).
#[derive(Default)]
pub struct Topology {
    nodes: BTreeMap<Address, Arc<dyn Node>>,
    links: HashMap<(Address, Address), f64>,
}

impl Topology {
    /// Add a node, keyed by its address.
    pub fn add<N: Node>(&mut self, node: Arc<N>) -> Result<(), Error> {
        let address = node.address().clone();
        if self.nodes.contains_key(&address) {
            return Err(Error::DuplicateNode(address));
        }
        self.nodes.insert(address, node);
        Ok(())
    }

    /// Connect `a` and `b` in both directions with `bandwidth` bits per microsecond.
    ///
    /// Reconnecting a pair replaces its bandwidth.
    pub fn connect(
        &mut self,
        a: impl Into<Address>,
        b: impl Into<Address>,
        bandwidth: f64,
    ) -> Result<(), Error> {
        if !(bandwidth > 0.0 && bandwidth.is_finite()) {
            return Err(Error::InvalidBandwidth(bandwidth));
        }
        let (a, b) = (a.into(), b.into());
        self.links.insert((a.clone(), b.clone()), bandwidth);
        self.links.insert((b, a), bandwidth);
        Ok(())
    }

    /// Connect `a` to every address in `others` with the same bandwidth.
    pub fn multi_connect<A, I>(
        &mut self,
        a: impl Into<Address>,
        bandwidth: f64,
        others: I,
    ) -> Result<(), Error>
    where
        A: Into<Address>,
        I: IntoIterator<Item = A>,
    {
        let a = a.into();
        for b in others {
            self.connect(a.clone(), b, bandwidth)?;
        }
        Ok(())
    }

    /// Bandwidth of the link from `a` to `b` in bits per microsecond.
    pub fn bandwidth(&self, a: &Address, b: &Address) -> Result<f64, Error> {
        self.links
            .get(&(a.clone(), b.clone()))
            .copied()
            .ok_or_else(|| Error::UnknownLink(a.clone(), b.clone()))
    }

    /// Node at `address`.
    pub fn node(&self, address: &Address) -> Result<&Arc<dyn Node>, Error> {
        self.nodes
            .get(address)
            .ok_or_else(|| Error::UnknownNode(address.clone()))
    }

    /// All nodes, ordered by address.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<dyn Node>> {
        self.nodes.values()
    }
}
