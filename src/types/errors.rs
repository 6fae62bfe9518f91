use std::fmt;

/// Possible errors returned by methods on a classifier or on the types
/// feeding into one. Lookup itself is total: a missing match is `None`,
/// never an error.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ClassifierError {
    /// The mask of a match pins bits that fall outside every registered
    /// field. The match cannot be constructed; there is nothing to retry.
    InvalidMatch,
    /// Insert was called with a rule that is already installed in a
    /// classifier. This is a caller contract violation: a rule must be
    /// removed before it can be inserted again.
    AlreadyInstalled,
    /// Remove was called with a rule that is not installed in this
    /// classifier.
    NotInstalled,
    /// An allocation failed while growing the classifier. The classifier
    /// has been rolled back to its pre-insert state. With the default
    /// global allocator this variant is unreachable, since allocation
    /// failure aborts the process.
    OutOfMemory,
    /// The prefix-field configuration was rejected: either the classifier
    /// is not empty, more than `CLS_MAX_TRIES` fields were given, or a
    /// field is not usable as a big-endian prefix.
    ConfigInvalid,
}

impl std::error::Error for ClassifierError {}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ClassifierError::InvalidMatch => {
                write!(
                    f,
                    "Error: The match mask pins bits outside all \
                    registered fields."
                )
            }
            ClassifierError::AlreadyInstalled => {
                write!(
                    f,
                    "Error: The rule is already installed in a classifier."
                )
            }
            ClassifierError::NotInstalled => {
                write!(
                    f,
                    "Error: The rule is not installed in this classifier."
                )
            }
            ClassifierError::OutOfMemory => {
                write!(f, "Error: Allocation failed; insert rolled back.")
            }
            ClassifierError::ConfigInvalid => {
                write!(
                    f,
                    "Error: The prefix-field configuration is invalid for \
                    this classifier."
                )
            }
        }
    }
}
