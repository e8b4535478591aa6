use crate::Error;

/// Highest frame priority.
pub const MAX_PRIORITY: u8 = 7;

/// Recommended priority to traffic class mapping, indexed by class count minus one.
const REGENERATION: [[u8; 8]; 8] = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 1, 1, 1, 1],
    [0, 0, 0, 0, 1, 1, 2, 2],
    [0, 0, 1, 1, 2, 2, 3, 3],
    [0, 0, 1, 1, 2, 2, 3, 4],
    [1, 0, 2, 2, 3, 3, 4, 5],
    [1, 0, 2, 3, 4, 4, 5, 6],
    [1, 0, 2, 3, 4, 5, 6, 7],
];

/// Maps frame priorities to the traffic classes available at an egress port.
///
/// Each map owns its own copy of the table, so overriding an entry never affects another
/// switch or run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriorityMap {
    classes: u8,
    table: [u8; 8],
}

impl PriorityMap {
    /// Create the recommended map for `classes` traffic classes (1 through 8).
    pub fn new(classes: u8) -> Result<Self, Error> {
        if !(1..=8).contains(&classes) {
            return Err(Error::InvalidClassCount(classes));
        }
        Ok(Self {
            classes,
            table: REGENERATION[classes as usize - 1],
        })
    }

    /// Number of traffic classes.
    pub fn classes(&self) -> u8 {
        self.classes
    }

    /// Traffic class for `priority`.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is greater than [MAX_PRIORITY].
    pub fn traffic_class(&self, priority: u8) -> u8 {
        self.table[priority as usize]
    }

    /// Override the traffic class of a single priority.
    pub fn set(&mut self, priority: u8, traffic_class: u8) -> Result<(), Error> {
        if priority > MAX_PRIORITY {
            return Err(Error::InvalidPriority(priority));
        }
        if traffic_class >= self.classes {
            return Err(Error::InvalidTrafficClass {
                class: traffic_class,
                classes: self.classes,
            });
        }
        self.table[priority as usize] = traffic_class;
        Ok(())
    }
}
