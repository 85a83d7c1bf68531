//! Archive delegate hooks
//!
//! Callers can observe and veto archive operations through a delegate. All
//! hooks run synchronously on the calling thread; the `should_*` hooks may
//! veto, the others are notifications. A delegate must not re-enter the
//! archive's mutation API from inside a save.

/// Observation and veto hooks for archive operations
///
/// Every method has a no-op default, so implementors override only what they
/// care about.
pub trait ArchiveDelegate {
    /// Called before a save begins; returning false aborts it
    fn should_save(&self) -> bool {
        true
    }

    /// Called immediately before the save pipeline runs
    fn will_save(&self) {}

    /// Called after a successful save
    fn did_save(&self) {}

    /// Called before a file is added; returning false rejects the add
    fn should_add_file(&self, _path: &str) -> bool {
        true
    }

    /// Called immediately before an add is recorded
    fn will_add_file(&self, _path: &str) {}

    /// Called after an add is recorded
    fn did_add_file(&self, _path: &str) {}

    /// Called before a file is deleted; returning false rejects the delete
    fn should_delete_file(&self, _path: &str) -> bool {
        true
    }

    /// Called immediately before a delete is recorded
    fn will_delete_file(&self, _path: &str) {}

    /// Called after a delete is recorded
    fn did_delete_file(&self, _path: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Vetoer;

    impl ArchiveDelegate for Vetoer {
        fn should_add_file(&self, path: &str) -> bool {
            !path.ends_with(".exe")
        }
    }

    #[test]
    fn test_defaults_allow_everything() {
        struct Silent;
        impl ArchiveDelegate for Silent {}

        let delegate = Silent;
        assert!(delegate.should_save());
        assert!(delegate.should_add_file("anything"));
        assert!(delegate.should_delete_file("anything"));
    }

    #[test]
    fn test_selective_veto() {
        let delegate = Vetoer;
        assert!(delegate.should_add_file("readme.txt"));
        assert!(!delegate.should_add_file("setup.exe"));
    }
}
