use crate::{Address, Error};
use std::collections::{BTreeMap, BTreeSet};

/// A multicast route, stored as the ordered next hops of each address.
///
/// Paths are built by appending address sequences (one per branch). Every append is checked
/// so that the route stays a forest: no address may be reached by two distinct routes from
/// any other address, and no address may reach itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Path {
    hops: BTreeMap<Address, Vec<Address>>,
}

impl Path {
    /// Create a path from a single branch.
    pub fn new<A, I>(addresses: I) -> Result<Self, Error>
    where
        A: Into<Address>,
        I: IntoIterator<Item = A>,
    {
        let mut path = Self::default();
        path.append(addresses)?;
        Ok(path)
    }

    /// Append a branch to the path.
    ///
    /// If the branch would break the tree shape, the path is left unchanged.
    pub fn append<A, I>(&mut self, addresses: I) -> Result<(), Error>
    where
        A: Into<Address>,
        I: IntoIterator<Item = A>,
    {
        let mut candidate = self.hops.clone();
        let mut previous: Option<Address> = None;
        for address in addresses {
            let address = address.into();
            if let Some(previous) = previous {
                let next = candidate.entry(previous).or_default();
                if !next.contains(&address) {
                    next.push(address.clone());
                }
            }
            previous = Some(address);
        }
        validate(&candidate)?;
        self.hops = candidate;
        Ok(())
    }

    /// Next hops after `address`, in insertion order.
    pub fn next_hops(&self, address: &Address) -> &[Address] {
        self.hops.get(address).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if `address` has no next hop.
    pub fn is_terminal(&self, address: &Address) -> bool {
        self.next_hops(address).is_empty()
    }

    /// Addresses that are never a next hop.
    pub fn sources(&self) -> Vec<&Address> {
        let targets: BTreeSet<&Address> = self.hops.values().flatten().collect();
        self.hops.keys().filter(|a| !targets.contains(a)).collect()
    }

    /// Addresses that are a next hop but have none of their own.
    pub fn terminals(&self) -> Vec<&Address> {
        let terminals: BTreeSet<&Address> = self
            .hops
            .values()
            .flatten()
            .filter(|a| self.is_terminal(a))
            .collect();
        terminals.into_iter().collect()
    }
}

/// Walk from every address and reject any address seen twice.
fn validate(hops: &BTreeMap<Address, Vec<Address>>) -> Result<(), Error> {
    for start in hops.keys() {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(address) = stack.pop() {
            for next in hops.get(address).into_iter().flatten() {
                if next == start {
                    return Err(Error::PathCycle(next.clone()));
                }
                if !seen.insert(next) {
                    return Err(Error::PathMultipleRoutes(next.clone()));
                }
                stack.push(next);
            }
        }
    }
    Ok(())
}
