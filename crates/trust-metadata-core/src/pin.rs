//! Operator trust pinning (trust on first use).

use std::collections::BTreeSet;

use crate::crypto::KeyId;
use crate::error::{Result, TrustError};
use crate::metadata::RootMetadata;
use crate::verify::{Envelope, Verified};

/// Initial root plus optional hints the operator obtained out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPin {
    root: Vec<u8>,
    pinned_key_ids: Option<BTreeSet<KeyId>>,
    min_threshold: Option<u32>,
}

impl TrustPin {
    pub fn new(root: impl Into<Vec<u8>>) -> Self {
        TrustPin {
            root: root.into(),
            pinned_key_ids: None,
            min_threshold: None,
        }
    }

    /// Requires the root threshold to be met by these keys alone.
    pub fn with_pinned_keys(mut self, key_ids: impl IntoIterator<Item = KeyId>) -> Self {
        self.pinned_key_ids = Some(key_ids.into_iter().collect());
        self
    }

    /// Refuses roots whose own threshold is lower than `threshold`.
    pub fn with_min_threshold(mut self, threshold: u32) -> Self {
        self.min_threshold = Some(threshold);
        self
    }

    pub fn root_bytes(&self) -> &[u8] {
        &self.root
    }

    /// Checks the pinned root against itself and the operator hints.
    ///
    /// Expiry is not checked here: an old pinned root is still a valid
    /// starting point for walking forward to a current one.
    pub fn verify(&self) -> Result<Verified<RootMetadata>> {
        let envelope = Envelope::parse(&self.root)?;
        let root: RootMetadata = envelope.decode()?;
        root.validate()?;
        let role = root.root_role()?;
        let valid = envelope.check_threshold(&role)?;

        if let Some(min) = self.min_threshold {
            if role.threshold() < min {
                return Err(TrustError::PinMismatch(format!(
                    "root threshold {} is below the pinned minimum {min}",
                    role.threshold()
                )));
            }
        }
        if let Some(pinned) = &self.pinned_key_ids {
            let from_pinned = valid.intersection(pinned).count();
            if from_pinned < role.threshold() as usize {
                return Err(TrustError::PinMismatch(format!(
                    "{from_pinned} valid signature(s) from pinned keys, root threshold is {}",
                    role.threshold()
                )));
            }
        }
        Ok(Verified::new(root, self.root.clone()))
    }
}
