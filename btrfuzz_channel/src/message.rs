//! Control messages between controller and runner.
use iota::iota;

pub const PROTOCOL_VERSION: u32 = 1;

pub const READY_MAGIC: u64 = 0xB7F5_F022_D0C0_FFEE;
pub const REQ_MAGIC: u64 = 0xB7F5_BADC_0FFE_E60A;
pub const REPLY_MAGIC: u32 = 0xB7F5_D0E5;

/// Capability and request flags.
pub type ChannelFlags = u64;

iota! {
    pub const FLAG_SHM_IMAGE: ChannelFlags = 1 << (iota);   // image travels through the image region
    , FLAG_SHM_COVER                                        // coverage record lives in the cover region
}

/// Runner -> controller, once after start.
#[repr(C)]
#[derive(Default, Debug)]
pub struct ReadyMsg {
    pub magic: u64,
    pub version: u32,
    pub map_size: u32,
    pub flags: u64,
}

/// Controller -> runner, "go".
#[repr(C)]
#[derive(Default, Debug)]
pub struct ExecReq {
    pub magic: u64,
    pub flags: u64,
    pub image_size: u64,
}

/// Runner -> controller, "done". `cover_size` bytes of coverage follow unless the record
/// is shared.
#[repr(C)]
#[derive(Default, Debug)]
pub struct ExecReply {
    pub magic: u32,
    pub status: u32,
    pub cover_size: u32,
    pub pad: u32,
}

/// Status word of [`ExecReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Normal,
    FilesystemError,
    /// Mount or loop device state was not fully released.
    ResidualState,
    /// kmsg reported BUG or UBSAN without taking the kernel down.
    KernelBug,
    DecodeError,
    Internal,
}

impl RunStatus {
    pub fn to_u32(self) -> u32 {
        match self {
            RunStatus::Normal => 0,
            RunStatus::FilesystemError => 1,
            RunStatus::ResidualState => 2,
            RunStatus::KernelBug => 3,
            RunStatus::DecodeError => 4,
            RunStatus::Internal => 5,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        let s = match v {
            0 => RunStatus::Normal,
            1 => RunStatus::FilesystemError,
            2 => RunStatus::ResidualState,
            3 => RunStatus::KernelBug,
            4 => RunStatus::DecodeError,
            5 => RunStatus::Internal,
            _ => return None,
        };
        Some(s)
    }

    /// Severity used to merge findings of one iteration, higher wins.
    pub fn severity(self) -> u8 {
        match self {
            RunStatus::Normal => 0,
            RunStatus::FilesystemError => 1,
            RunStatus::ResidualState => 2,
            RunStatus::DecodeError | RunStatus::Internal => 3,
            RunStatus::KernelBug => 4,
        }
    }

    /// The more severe of `self` and `other`.
    pub fn escalate(self, other: RunStatus) -> RunStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word() {
        for v in 0..6 {
            assert_eq!(RunStatus::from_u32(v).unwrap().to_u32(), v);
        }
        assert_eq!(RunStatus::from_u32(6), None);
    }

    #[test]
    fn escalation_order() {
        use RunStatus::*;
        assert_eq!(Normal.escalate(FilesystemError), FilesystemError);
        assert_eq!(KernelBug.escalate(ResidualState), KernelBug);
        assert_eq!(FilesystemError.escalate(ResidualState), ResidualState);
        assert_eq!(ResidualState.escalate(Normal), ResidualState);
        // a kernel report outranks any runner-side failure
        assert_eq!(Internal.escalate(KernelBug), KernelBug);
        assert_eq!(KernelBug.escalate(Internal), KernelBug);
        assert_eq!(DecodeError.escalate(KernelBug), KernelBug);
        assert_eq!(ResidualState.escalate(Internal), Internal);
    }

    #[test]
    fn message_layout() {
        assert_eq!(std::mem::size_of::<ReadyMsg>(), 24);
        assert_eq!(std::mem::size_of::<ExecReq>(), 24);
        assert_eq!(std::mem::size_of::<ExecReply>(), 16);
    }
}
