use std::fmt;

use serde::Serialize;

/// Which side of the hardware boundary a stage runs on. Work handed across
/// the boundary has to be synchronized first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDomain {
    Hardware,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Input,
    Decode,
    Vpp,
    /// Pre-encode analysis filter.
    Enc,
    Encode,
    CheckPts,
    Trim,
    Compute,
    Audio,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::Input,
        StageKind::Decode,
        StageKind::Vpp,
        StageKind::Enc,
        StageKind::Encode,
        StageKind::CheckPts,
        StageKind::Trim,
        StageKind::Compute,
        StageKind::Audio,
    ];

    /// Name used in logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Decode => "MFXDEC",
            Self::Vpp => "MFXVPP",
            Self::Enc => "MFXENC",
            Self::Encode => "MFXENCODE",
            Self::CheckPts => "CHECKPTS",
            Self::Trim => "TRIM",
            Self::Compute => "OPENCL",
            Self::Audio => "AUDIO",
        }
    }

    /// When two stages could share one pool, the higher priority sizes it.
    pub fn alloc_priority(self) -> u8 {
        match self {
            Self::Encode => 4,
            Self::Enc => 3,
            Self::Decode => 2,
            Self::Vpp => 1,
            _ => 0,
        }
    }

    pub fn domain(self) -> ExecutionDomain {
        match self {
            Self::Decode | Self::Vpp | Self::Enc | Self::Encode => ExecutionDomain::Hardware,
            _ => ExecutionDomain::Software,
        }
    }

    pub fn requires_sync(self, next: StageKind) -> bool {
        self.domain() != next.domain()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_only_across_domains() {
        assert!(!StageKind::Decode.requires_sync(StageKind::Vpp));
        assert!(!StageKind::Vpp.requires_sync(StageKind::Encode));
        assert!(StageKind::Decode.requires_sync(StageKind::CheckPts));
        assert!(StageKind::CheckPts.requires_sync(StageKind::Encode));
        assert!(!StageKind::Trim.requires_sync(StageKind::Audio));
    }

    #[test]
    fn priorities_favour_encoder() {
        let mut kinds = StageKind::ALL.to_vec();
        kinds.sort_by_key(|k| std::cmp::Reverse(k.alloc_priority()));
        assert_eq!(kinds[0], StageKind::Encode);
        assert_eq!(kinds[1], StageKind::Enc);
        assert_eq!(kinds[2], StageKind::Decode);
        assert_eq!(kinds[3], StageKind::Vpp);
        assert_eq!(StageKind::CheckPts.alloc_priority(), 0);
    }
}
