use serde::{Deserialize, Serialize};

/// A Lustre file identifier triple, as carried on the wire inside every
/// `hsm_action_item` (`hai_fid` and `hai_dfid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fid {
    #[serde(rename = "f_seq")]
    pub seq: u64,
    #[serde(rename = "f_oid")]
    pub oid: u32,
    #[serde(rename = "f_ver")]
    pub ver: u32,
}

impl Fid {
    pub const fn new(seq: u64, oid: u32, ver: u32) -> Self {
        Self { seq, oid, ver }
    }
}

impl std::fmt::Display for Fid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}]", self.seq, self.oid, self.ver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let fid = Fid::new(0x4200000000, 1, 0);
        let json = serde_json::to_string(&fid).unwrap();
        let back: Fid = serde_json::from_str(&json).unwrap();
        assert_eq!(fid, back);
    }

    #[test]
    fn orders_by_seq_then_oid_then_ver() {
        let a = Fid::new(1, 0, 0);
        let b = Fid::new(1, 1, 0);
        assert!(a < b);
    }
}
