//! Edit operations and the operational transform.
//!
//! Positions and lengths count characters, not bytes.

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// The edit carried by an [`Operation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    /// Insert `content` before the character at `position`
    Insert { position: usize, content: String },
    /// Remove `length` characters starting at `position`
    Delete { position: usize, length: usize },
}

impl Edit {
    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// True if applying the edit leaves any document unchanged
    pub fn is_noop(&self) -> bool {
        match self {
            Edit::Insert { content, .. } => content.is_empty(),
            Edit::Delete { length, .. } => *length == 0,
        }
    }

    /// Check the edit against a document of `len` characters
    pub fn fits(&self, len: usize) -> bool {
        match self {
            Edit::Insert { position, .. } => *position <= len,
            Edit::Delete { position, length } => position
                .checked_add(*length)
                .map_or(false, |end| end <= len),
        }
    }

    /// Document length after applying the edit to a document of `len` characters
    pub fn resulting_len(&self, len: usize) -> usize {
        match self {
            Edit::Insert { content, .. } => len + content.chars().count(),
            Edit::Delete { length, .. } => len.saturating_sub(*length),
        }
    }
}

/// An edit authored by a session against a known document version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(flatten)]
    pub edit: Edit,
    pub author: SessionId,
    /// Document version the author observed when creating the edit
    pub base_version: u64,
}

impl Operation {
    pub fn new(edit: Edit, author: SessionId, base_version: u64) -> Self {
        Self {
            edit,
            author,
            base_version,
        }
    }

    fn with_edit(&self, edit: Edit) -> Self {
        Self {
            edit,
            author: self.author.clone(),
            base_version: self.base_version,
        }
    }
}

/// Transform two concurrent operations authored against the same base.
///
/// Returns `(a', b')` where `a'` is `a` rewritten to apply after `b` and `b'`
/// is `b` rewritten to apply after `a`, so that
/// `apply(apply(doc, a), b') == apply(apply(doc, b), a')`.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let (a_edit, b_edit) = match (&a.edit, &b.edit) {
        (
            Edit::Insert {
                position: pa,
                content: ca,
            },
            Edit::Insert {
                position: pb,
                content: cb,
            },
        ) => {
            let a_first = pa < pb || (pa == pb && (&a.author, ca) < (&b.author, cb));
            if a_first {
                (
                    a.edit.clone(),
                    Edit::Insert {
                        position: pb + ca.chars().count(),
                        content: cb.clone(),
                    },
                )
            } else {
                (
                    Edit::Insert {
                        position: pa + cb.chars().count(),
                        content: ca.clone(),
                    },
                    b.edit.clone(),
                )
            }
        }
        (Edit::Insert { position, content }, Edit::Delete { position: s, length }) => {
            insert_against_delete(*position, content, *s, *length)
        }
        (Edit::Delete { position: s, length }, Edit::Insert { position, content }) => {
            let (insert, delete) = insert_against_delete(*position, content, *s, *length);
            (delete, insert)
        }
        (
            Edit::Delete {
                position: pa,
                length: la,
            },
            Edit::Delete {
                position: pb,
                length: lb,
            },
        ) => (
            delete_after_delete(*pa, *la, *pb, *lb),
            delete_after_delete(*pb, *lb, *pa, *la),
        ),
    };

    (a.with_edit(a_edit), b.with_edit(b_edit))
}

/// Returns `(insert', delete')` for an insert at `p` concurrent with a delete of `[s, s + l)`.
///
/// An insert landing strictly inside the deleted range is swallowed: the
/// delete grows to cover the inserted text and the insert becomes a no-op.
fn insert_against_delete(p: usize, content: &str, s: usize, l: usize) -> (Edit, Edit) {
    let n = content.chars().count();
    if p <= s {
        (
            Edit::Insert {
                position: p,
                content: content.to_string(),
            },
            Edit::Delete {
                position: s + n,
                length: l,
            },
        )
    } else if p >= s + l {
        (
            Edit::Insert {
                position: p - l,
                content: content.to_string(),
            },
            Edit::Delete {
                position: s,
                length: l,
            },
        )
    } else {
        (
            Edit::Insert {
                position: s,
                content: String::new(),
            },
            Edit::Delete {
                position: s,
                length: l + n,
            },
        )
    }
}

/// Rewrite the delete `[a, a + la)` to apply after `[b, b + lb)` was removed.
fn delete_after_delete(a: usize, la: usize, b: usize, lb: usize) -> Edit {
    if a + la <= b {
        Edit::Delete {
            position: a,
            length: la,
        }
    } else if a >= b + lb {
        Edit::Delete {
            position: a - lb,
            length: la,
        }
    } else {
        let overlap = (a + la).min(b + lb) - a.max(b);
        Edit::Delete {
            position: a.min(b),
            length: la - overlap,
        }
    }
}

/// Apply an edit to `content`, returning `None` if it does not fit.
pub(crate) fn apply_edit(content: &str, edit: &Edit) -> Option<String> {
    let len = content.chars().count();
    if !edit.fits(len) {
        return None;
    }

    match edit {
        Edit::Insert {
            position,
            content: text,
        } => {
            let at = byte_offset(content, *position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            Some(out)
        }
        Edit::Delete { position, length } => {
            let start = byte_offset(content, *position);
            let end = byte_offset(content, position + length);
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Some(out)
        }
    }
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(offset, _)| offset)
        .unwrap_or(s.len())
}
