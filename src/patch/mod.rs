//! JSON Patch (RFC 6902) construction helpers.
//!
//! Paths are built from raw segments and escaped per RFC 6901, so label keys
//! such as `app.kubernetes.io/name` are safe to use directly.

use std::borrow::Cow;
use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while building patch operations
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("invalid JSON pointer {path:?}: {reason}")]
    InvalidPointer { path: String, reason: String },

    #[error("failed to serialize patch value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Escape one pointer segment: `~` becomes `~0`, then `/` becomes `~1`.
pub fn escape(segment: &str) -> Cow<'_, str> {
    if segment.contains(['~', '/']) {
        Cow::Owned(segment.replace('~', "~0").replace('/', "~1"))
    } else {
        Cow::Borrowed(segment)
    }
}

/// Build a pointer from unescaped segments.
pub fn pointer<I, S>(segments: I) -> Result<PointerBuf, PatchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(&escape(segment.as_ref()));
    }
    PointerBuf::parse(&path).map_err(|e| PatchError::InvalidPointer {
        reason: e.to_string(),
        path,
    })
}

pub fn add<T: Serialize + ?Sized>(path: PointerBuf, value: &T) -> Result<PatchOperation, PatchError> {
    Ok(PatchOperation::Add(AddOperation {
        path,
        value: serde_json::to_value(value)?,
    }))
}

pub fn replace<T: Serialize + ?Sized>(
    path: PointerBuf,
    value: &T,
) -> Result<PatchOperation, PatchError> {
    Ok(PatchOperation::Replace(ReplaceOperation {
        path,
        value: serde_json::to_value(value)?,
    }))
}

/// Append `items` to the list at `base`.
///
/// When the list is absent or empty a single `add` creates it with all items,
/// since appending with `-` to a missing list is rejected by the API server.
/// Otherwise every item gets its own `add` on `<base>/-`.
pub fn append<T: Serialize>(
    base: &[&str],
    existing_len: usize,
    items: &[T],
    ops: &mut Vec<PatchOperation>,
) -> Result<(), PatchError> {
    if items.is_empty() {
        return Ok(());
    }
    if existing_len == 0 {
        ops.push(add(pointer(base)?, items)?);
        return Ok(());
    }
    for item in items {
        ops.push(add(pointer(base.iter().copied().chain(["-"]))?, item)?);
    }
    Ok(())
}

/// Merge `desired` into the string map at `base`.
///
/// An absent or empty map is created with one `add`. Otherwise new keys get
/// an `add`, keys holding a different value get a `replace`, and keys that
/// already hold the desired value are left alone.
pub fn merge_map(
    base: &[&str],
    existing: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), PatchError> {
    if desired.is_empty() {
        return Ok(());
    }
    let existing = match existing {
        Some(existing) if !existing.is_empty() => existing,
        _ => {
            ops.push(add(pointer(base)?, desired)?);
            return Ok(());
        }
    };
    for (key, value) in desired {
        let path = pointer(base.iter().copied().chain([key.as_str()]))?;
        match existing.get(key) {
            None => ops.push(add(path, value)?),
            Some(current) if current != value => ops.push(replace(path, value)?),
            Some(_) => {}
        }
    }
    Ok(())
}
