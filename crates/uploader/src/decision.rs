//! Upload decision rules.
//!
//! [`decide`] is pure: it sees the cached [`FileStatus`] and one live
//! [`Observation`] of the file, and nothing else. Rules are checked in a fixed
//! order and the first that applies wins:
//!
//! | # | condition                                   | outcome                          |
//! |---|---------------------------------------------|----------------------------------|
//! | 1 | file missing                                | Skip(NotFound)                   |
//! | 2 | ignored                                     | Skip(Ignored)                    |
//! | 3 | freeze deadline set, no freeze-time mtime   | Skip(FrozenBeforeCreation)       |
//! | 4 | never uploaded                              | Upload(NeverUploaded)            |
//! | 5 | mtime <= last upload                        | Skip(UpToDate)                   |
//! | 6 | frozen, freeze-time mtime > last upload     | Upload(CatchUpToFrozenVersion)   |
//! | 6 | frozen otherwise                            | Skip(Frozen)                     |
//! | 7 | otherwise                                   | Upload(Changed)                  |

use crate::cache::FileStatus;
use crate::paths::{modified_millis, EpochMillis};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// What the filesystem says about a file right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Missing,
    Present { modified: EpochMillis },
}

impl Observation {
    /// Stat `path`. Not-found is an observation, other I/O errors are not.
    pub fn of_path(path: &Path) -> io::Result<Self> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Observation::Present {
                modified: modified_millis(&metadata)?,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Observation::Missing),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Upload(UploadReason),
    Skip(SkipReason),
}

impl Decision {
    pub fn is_upload(&self) -> bool {
        matches!(self, Decision::Upload(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReason {
    NeverUploaded,
    /// One-time upload bringing the remote copy up to the freeze snapshot.
    CatchUpToFrozenVersion,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Ignored,
    /// Matched a freeze pattern but did not exist when frozen. Permanent.
    FrozenBeforeCreation,
    UpToDate,
    Frozen,
}

impl fmt::Display for UploadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadReason::NeverUploaded => "it has not been uploaded",
            UploadReason::CatchUpToFrozenVersion => {
                "the last uploaded version does not match the frozen version"
            }
            UploadReason::Changed => "it has changed since the last upload",
        })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NotFound => "it does not exist",
            SkipReason::Ignored => "it is ignored",
            SkipReason::FrozenBeforeCreation => "it was frozen before creation",
            SkipReason::UpToDate => "it is already up to date",
            SkipReason::Frozen => "it is frozen",
        })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Upload(reason) => write!(f, "upload because {}", reason),
            Decision::Skip(reason) => write!(f, "skip because {}", reason),
        }
    }
}

/// Decide whether a file should be uploaded.
pub fn decide(status: &FileStatus, observation: Observation) -> Decision {
    let modified = match observation {
        Observation::Missing => return Decision::Skip(SkipReason::NotFound),
        Observation::Present { modified } => modified,
    };

    if status.ignored {
        return Decision::Skip(SkipReason::Ignored);
    }

    if status.freeze_deadline.is_some() && status.frozen_at.is_none() {
        return Decision::Skip(SkipReason::FrozenBeforeCreation);
    }

    let last_uploaded = match status.last_uploaded {
        Some(last_uploaded) => last_uploaded,
        None => return Decision::Upload(UploadReason::NeverUploaded),
    };

    // Equal counts as current: the uploaded copy carried this mtime.
    if modified <= last_uploaded {
        return Decision::Skip(SkipReason::UpToDate);
    }

    if status.freeze_deadline.is_some() {
        return match status.frozen_at {
            Some(frozen_at) if frozen_at > last_uploaded => {
                Decision::Upload(UploadReason::CatchUpToFrozenVersion)
            }
            _ => Decision::Skip(SkipReason::Frozen),
        };
    }

    Decision::Upload(UploadReason::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(modified: EpochMillis) -> Observation {
        Observation::Present { modified }
    }

    fn uploaded_at(last: EpochMillis) -> FileStatus {
        FileStatus {
            last_uploaded: Some(last),
            ..FileStatus::default()
        }
    }

    #[test]
    fn test_missing_file_skipped_before_anything_else() {
        let status = FileStatus {
            ignored: true,
            ..FileStatus::default()
        };
        assert_eq!(
            decide(&status, Observation::Missing),
            Decision::Skip(SkipReason::NotFound)
        );
    }

    #[test]
    fn test_fresh_file_uploaded() {
        assert_eq!(
            decide(&FileStatus::default(), present(10)),
            Decision::Upload(UploadReason::NeverUploaded)
        );
    }

    #[test]
    fn test_ignored_file_skipped_regardless_of_mtime() {
        let mut status = uploaded_at(10);
        status.ignored = true;
        for mtime in [5, 10, 11, 1_000_000] {
            assert_eq!(decide(&status, present(mtime)), Decision::Skip(SkipReason::Ignored));
        }
        status.last_uploaded = None;
        assert_eq!(decide(&status, present(1)), Decision::Skip(SkipReason::Ignored));
    }

    #[test]
    fn test_frozen_before_creation_is_permanent() {
        let status = FileStatus {
            freeze_deadline: Some(50),
            ..FileStatus::default()
        };
        for mtime in [60, 70, 80, 10_000] {
            assert_eq!(
                decide(&status, present(mtime)),
                Decision::Skip(SkipReason::FrozenBeforeCreation)
            );
        }

        let uploaded = FileStatus {
            last_uploaded: Some(1),
            ..status
        };
        assert_eq!(
            decide(&uploaded, present(99)),
            Decision::Skip(SkipReason::FrozenBeforeCreation)
        );
    }

    #[test]
    fn test_frozen_file_never_uploaded_is_uploaded() {
        let status = FileStatus {
            freeze_deadline: Some(60),
            frozen_at: Some(50),
            ..FileStatus::default()
        };
        assert_eq!(
            decide(&status, present(50)),
            Decision::Upload(UploadReason::NeverUploaded)
        );
    }

    #[test]
    fn test_up_to_date_boundary() {
        let status = uploaded_at(50);
        assert_eq!(decide(&status, present(50)), Decision::Skip(SkipReason::UpToDate));
        assert_eq!(decide(&status, present(49)), Decision::Skip(SkipReason::UpToDate));
        assert_eq!(
            decide(&status, present(51)),
            Decision::Upload(UploadReason::Changed)
        );
    }

    #[test]
    fn test_catch_up_then_frozen() {
        let mut status = FileStatus {
            freeze_deadline: Some(100),
            frozen_at: Some(70),
            last_uploaded: Some(60),
            ..FileStatus::default()
        };
        assert_eq!(
            decide(&status, present(80)),
            Decision::Upload(UploadReason::CatchUpToFrozenVersion)
        );

        status.last_uploaded = Some(70);
        assert_eq!(decide(&status, present(80)), Decision::Skip(SkipReason::Frozen));
    }

    #[test]
    fn test_frozen_up_to_date_wins_over_frozen() {
        let status = FileStatus {
            freeze_deadline: Some(100),
            frozen_at: Some(70),
            last_uploaded: Some(80),
            ..FileStatus::default()
        };
        assert_eq!(decide(&status, present(80)), Decision::Skip(SkipReason::UpToDate));
        assert_eq!(decide(&status, present(90)), Decision::Skip(SkipReason::Frozen));
    }

    #[test]
    fn test_observation_of_missing_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let observation = Observation::of_path(&temp.path().join("nope")).unwrap();
        assert_eq!(observation, Observation::Missing);
    }

    #[test]
    fn test_decision_display() {
        let decision = Decision::Skip(SkipReason::FrozenBeforeCreation);
        assert_eq!(decision.to_string(), "skip because it was frozen before creation");
        assert!(Decision::Upload(UploadReason::Changed).is_upload());
    }
}
