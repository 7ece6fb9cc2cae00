//! Newtype identifiers threaded through the detection, keystore, and
//! site-agent crates (spec §3). Kept distinct so a slot index can never be
//! passed where a key id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(SlotId);
id_newtype!(BinId);
id_newtype!(KeyId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_by_wrapped_value() {
        assert!(SlotId(1) < SlotId(2));
        assert!(KeyId(10) > KeyId(9));
    }

    #[test]
    fn distinct_id_types_do_not_mix() {
        let slot = SlotId::new(5);
        let bin = BinId::new(5);
        assert_eq!(slot.get(), bin.get());
        // different types, so this would not compile: let _: SlotId = bin;
    }
}
