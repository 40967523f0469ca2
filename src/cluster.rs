use std::sync::atomic::{AtomicBool, Ordering};

/// Cluster write signal. Workers only claim jobs while writes are allowed,
/// e.g. while this node holds write quorum.
pub trait WriteGuard: Send + Sync {
    fn is_write_allowed(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysWritable;

impl WriteGuard for AlwaysWritable {
    fn is_write_allowed(&self) -> bool {
        true
    }
}

/// Write signal toggled by whoever tracks cluster membership
#[derive(Debug)]
pub struct FlagWriteGuard {
    allowed: AtomicBool,
}

impl FlagWriteGuard {
    pub fn new(allowed: bool) -> Self {
        Self {
            allowed: AtomicBool::new(allowed),
        }
    }

    pub fn set_write_allowed(&self, allowed: bool) {
        let previous = self.allowed.swap(allowed, Ordering::SeqCst);
        if previous != allowed {
            log::info!("Cluster writes {}", if allowed { "allowed" } else { "blocked" });
        }
    }
}

impl WriteGuard for FlagWriteGuard {
    fn is_write_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}
