use std::error::Error;
use std::fmt;

/// Fatal fault in the shape of a tree or in the bookkeeping between the global tree and the
/// partition trees, e.g. a multifurcation where a strictly bifurcating node is needed.
pub struct StructuralError {
    pub(crate) context: String,
    pub(crate) message: String,
}

impl StructuralError {
    pub(crate) fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Operation during which the fault was detected.
    pub fn context(&self) -> &str {
        &self.context
    }
}

impl fmt::Debug for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Structural error in {}: {}", self.context, self.message)
    }
}

impl Error for StructuralError {}

/// Raised before a search starts when the partial likelihood buffers would not fit in memory.
pub struct ConfigurationError {
    pub(crate) required: usize,
    pub(crate) available: usize,
}

impl ConfigurationError {
    pub fn required(&self) -> usize {
        self.required
    }

    pub fn available(&self) -> usize {
        self.available
    }
}

impl fmt::Debug for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "required {} bytes, available {} bytes", self.required, self.available)
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Memory required for partial likelihoods ({} bytes) exceeds available memory ({} bytes)",
            self.required, self.available
        )
    }
}

impl Error for ConfigurationError {}
