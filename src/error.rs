pub type FxrtResult<T> = Result<T, FxrtError>;

#[derive(thiserror::Error, Debug)]
pub enum FxrtError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FxrtError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            FxrtError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(FxrtError::device("x").to_string().contains("device error:"));
        assert!(FxrtError::sync("x").to_string().contains("sync error:"));
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = FxrtError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
