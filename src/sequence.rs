use std::fmt::{Display, Formatter};

/// The alternating bit of the stop-and-wait protocol: a sender flips it for every acknowledged
///  packet, and a receiver flips its expectation for every accepted packet.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceBit(bool);

impl Display for SequenceBit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl SequenceBit {
    pub const ZERO: SequenceBit = SequenceBit(false);
    pub const ONE: SequenceBit = SequenceBit(true);

    /// Returns `None` for anything other than 0 or 1
    pub fn from_wire(value: u8) -> Option<SequenceBit> {
        match value {
            0 => Some(Self::ZERO),
            1 => Some(Self::ONE),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> u8 {
        self.0 as u8
    }

    #[must_use]
    pub fn flipped(&self) -> SequenceBit {
        SequenceBit(!self.0)
    }

    pub fn flip(&mut self) {
        self.0 = !self.0;
    }
}
