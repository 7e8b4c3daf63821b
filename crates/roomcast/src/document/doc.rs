use serde::{Deserialize, Serialize};
use tracing::debug;

use super::operation::{apply_edit, transform, Operation};
use crate::protocol::RejectReason;
use crate::{HubError, HubResult};

/// Content and version of a document at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: u64,
}

/// Authoritative state of a collaborative document
///
/// The version grows by exactly one per applied operation and the content is
/// always what replaying the log from an empty document produces. Only the
/// hub's control loop holds a `DocumentState`, so nothing here is shared.
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    content: String,
    version: u64,
    log: Vec<Operation>,
    /// Character length after each logged operation, indexed like `log`
    lengths: Vec<usize>,
}

impl DocumentState {
    /// Create an empty document at version 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a document by applying `log` in order to an empty document
    pub fn replay(log: impl IntoIterator<Item = Operation>) -> HubResult<Self> {
        let mut doc = Self::new();
        for op in log {
            doc.apply(op)?;
        }
        Ok(doc)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Length of the current content in characters
    pub fn len(&self) -> usize {
        self.length_at(self.version).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every applied operation, oldest first
    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            content: self.content.clone(),
            version: self.version,
        }
    }

    /// Character length of the document as it was at `version`
    pub fn length_at(&self, version: u64) -> Option<usize> {
        match version {
            0 => Some(0),
            v if v <= self.version => self.lengths.get(v as usize - 1).copied(),
            _ => None,
        }
    }

    /// Operations applied after `base_version`, in log order
    pub fn applied_since(&self, base_version: u64) -> &[Operation] {
        let start = (base_version as usize).min(self.log.len());
        &self.log[start..]
    }

    /// Rewrite `op` so it applies to the current version.
    ///
    /// The operation is checked against the document as its author saw it,
    /// then transformed against everything applied since its base version.
    pub fn rebase(&self, op: Operation) -> Result<Operation, RejectReason> {
        let base_len = self
            .length_at(op.base_version)
            .ok_or(RejectReason::UnknownVersion {
                base_version: op.base_version,
                current_version: self.version,
            })?;

        if !op.edit.fits(base_len) {
            return Err(RejectReason::OutOfRange {
                position: op.edit.position(),
                document_length: base_len,
            });
        }

        let concurrent = self.applied_since(op.base_version);
        if !concurrent.is_empty() {
            debug!(
                "Transforming operation from {} against {} concurrent operations",
                op.author,
                concurrent.len()
            );
        }

        Ok(concurrent
            .iter()
            .fold(op, |pending, applied| transform(&pending, applied).0))
    }

    /// Apply an operation that targets the current version.
    ///
    /// Returns the new version. The document is left untouched on error.
    pub fn apply(&mut self, mut op: Operation) -> HubResult<u64> {
        let len = self.len();
        let content = apply_edit(&self.content, &op.edit).ok_or_else(|| {
            HubError::InvalidOperation(format!(
                "{:?} does not fit a document of length {}",
                op.edit, len
            ))
        })?;

        self.lengths.push(op.edit.resulting_len(len));
        self.content = content;
        self.version += 1;
        op.base_version = self.version - 1;
        self.log.push(op);

        Ok(self.version)
    }

    /// Build a document whose recorded length disagrees with its content
    #[cfg(test)]
    pub(crate) fn corrupted(content: &str, recorded_len: usize) -> Self {
        Self {
            content: content.to_string(),
            version: 1,
            log: vec![Operation::new(
                super::Edit::Insert {
                    position: 0,
                    content: content.to_string(),
                },
                crate::session::SessionId::from("corrupt"),
                0,
            )],
            lengths: vec![recorded_len],
        }
    }
}
