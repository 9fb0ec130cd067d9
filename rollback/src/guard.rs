//! Flag the cluster for a rebuild when a run fails while it may still be split.

use crate::{topology::State, Error, RESPIN_FILE_NAME};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{error, warn};

/// Writes the respin marker into the cluster's state directory.
pub struct Guard {
    marker: PathBuf,
}

impl Guard {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            marker: state_dir.join(RESPIN_FILE_NAME),
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Pass `result` through, marking the cluster for a rebuild if it failed while `state`
    /// is anything but [State::Joined].
    ///
    /// A failure to write the marker is logged but never replaces the original error.
    pub fn check<T>(&self, state: State, result: Result<T, Error>) -> Result<T, Error> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if state != State::Joined {
            warn!(path = ?self.marker, error = %err, "cluster left split, marking for respin");
            if let Err(write_err) = fs::write(&self.marker, err.to_string()) {
                error!(path = ?self.marker, error = ?write_err, "failed to write respin marker");
            }
        }
        Err(err)
    }

    pub fn needs_respin(&self) -> bool {
        self.marker.exists()
    }

    /// Fail with [Error::NeedsRespin] while the cluster is marked for a rebuild.
    ///
    /// A split cluster must never be backed up or split again, or its split topology would be
    /// taken for the original one.
    pub fn require_clear(&self) -> Result<(), Error> {
        if self.needs_respin() {
            return Err(Error::NeedsRespin(self.marker.clone()));
        }
        Ok(())
    }

    /// Remove the marker, once the cluster was rebuilt.
    pub fn clear(&self) -> Result<(), Error> {
        if self.marker.exists() {
            fs::remove_file(&self.marker)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Violation;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_marker_only_written_while_split() {
        let state = tempfile::tempdir().unwrap();
        let guard = Guard::new(state.path());

        // Success never marks
        assert_eq!(guard.check(State::Split, Ok(7)).unwrap(), 7);
        assert!(!guard.needs_respin());

        // Failure while joined doesn't either
        let result: Result<(), Error> = Err(Violation::NoSurvivor.into());
        assert!(guard.check(State::Joined, result).is_err());
        assert!(!guard.needs_respin());

        // Failure while split does
        let result: Result<(), Error> = Err(Error::NoNewBlock("pool1".into()));
        let err = guard.check(State::Split, result).unwrap_err();
        assert!(matches!(err, Error::NoNewBlock(_)));
        assert!(guard.needs_respin());
        let contents = fs::read_to_string(guard.marker()).unwrap();
        assert!(contents.contains("pool1"));

        guard.clear().unwrap();
        assert!(!guard.needs_respin());
        guard.clear().unwrap();

        // Healed but unconfirmed still counts as split
        let result: Result<(), Error> = Err(Violation::NoSurvivor.into());
        assert!(guard.check(State::Healed, result).is_err());
        assert!(guard.needs_respin());
    }

    #[test_traced]
    fn test_marked_cluster_is_not_clear() {
        let state = tempfile::tempdir().unwrap();
        let guard = Guard::new(state.path());
        guard.require_clear().unwrap();

        let result: Result<(), Error> = Err(Error::NoNewBlock("pool4".into()));
        assert!(guard.check(State::Split, result).is_err());
        match guard.require_clear() {
            Err(Error::NeedsRespin(path)) => assert_eq!(path, guard.marker()),
            other => panic!("unexpected result: {other:?}"),
        }

        guard.clear().unwrap();
        guard.require_clear().unwrap();
    }

    #[test_traced]
    fn test_unwritable_marker_keeps_original_error() {
        let state = tempfile::tempdir().unwrap();
        let guard = Guard::new(&state.path().join("missing"));
        let result: Result<(), Error> = Err(Error::MixedTopology);
        let err = guard.check(State::Split, result).unwrap_err();
        assert!(matches!(err, Error::MixedTopology));
        assert!(!guard.needs_respin());
    }
}
