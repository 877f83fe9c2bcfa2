//! Objects and sub-entries.

use crate::abort::AbortCode;
use crate::value::{DataType, Value};

/// Access mode of a sub-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Constant,
    ReadOnly,
    WriteOnly,
    ReadWrite,
    ConstWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite | Access::ConstWrite)
    }
}

/// The kind of object an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Variable,
    Array,
    Record,
}

/// Context passed to a [`SubEntry`]'s download hook. The hook owns the
/// about-to-be-stored value: it may mutate `value` in place before
/// returning `Ok`, and that is what ends up stored (see DESIGN.md for the
/// Open Question this resolves).
pub struct DownloadContext<'a> {
    pub index: u16,
    pub sub_index: u8,
    pub value: &'a mut Value,
}

/// Context passed to a [`SubEntry`]'s upload hook, invoked just before a
/// remote read is served.
pub struct UploadContext<'a> {
    pub index: u16,
    pub sub_index: u8,
    pub value: &'a Value,
}

pub type DownloadHook = Box<dyn FnMut(DownloadContext) -> Result<(), AbortCode> + Send>;
pub type UploadHook = Box<dyn FnMut(UploadContext) -> Result<(), AbortCode> + Send>;

/// A single sub-index entry on an [`Object`].
pub struct SubEntry {
    pub sub_index: u8,
    pub data_type: DataType,
    pub access: Access,
    pub pdo_mappable: bool,
    value: Value,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub default: Option<Value>,
    pub download_hook: Option<DownloadHook>,
    pub upload_hook: Option<UploadHook>,
}

impl SubEntry {
    pub fn new(sub_index: u8, access: Access, value: Value) -> Self {
        let data_type = value.data_type();
        SubEntry {
            sub_index,
            data_type,
            access,
            pdo_mappable: false,
            value,
            min: None,
            max: None,
            default: None,
            download_hook: None,
            upload_hook: None,
        }
    }

    pub fn pdo_mappable(mut self, yes: bool) -> Self {
        self.pdo_mappable = yes;
        self
    }

    pub fn with_limits(mut self, min: Value, max: Value) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_download_hook(mut self, hook: DownloadHook) -> Self {
        self.download_hook = Some(hook);
        self
    }

    pub fn with_upload_hook(mut self, hook: UploadHook) -> Self {
        self.upload_hook = Some(hook);
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Clamp `candidate` into `[min, max]` when both limits are set.
    fn clamp(&self, candidate: Value) -> Value {
        if let (Some(min), Some(max)) = (&self.min, &self.max) {
            if matches!(candidate.compare(min), Some(std::cmp::Ordering::Less)) {
                return min.clone();
            }
            if matches!(candidate.compare(max), Some(std::cmp::Ordering::Greater)) {
                return max.clone();
            }
        }
        candidate
    }

    /// Type/access/range-check `candidate`, run the download hook if any,
    /// and store the result. Returns the abort code for any failure.
    pub fn set(&mut self, index: u16, candidate: Value) -> Result<(), AbortCode> {
        if !self.access.writable() {
            return Err(AbortCode::NoWrite);
        }
        if candidate.data_type() != self.data_type {
            return Err(AbortCode::TypeLen);
        }
        let mut clamped = self.clamp(candidate);
        if let Some(hook) = self.download_hook.as_mut() {
            hook(DownloadContext {
                index,
                sub_index: self.sub_index,
                value: &mut clamped,
            })?;
        }
        self.value = clamped;
        Ok(())
    }

    /// Run the upload hook (if any) then return the current value.
    pub fn get(&mut self, index: u16) -> Result<Value, AbortCode> {
        if !self.access.readable() {
            return Err(AbortCode::NoRead);
        }
        if let Some(hook) = self.upload_hook.as_mut() {
            hook(UploadContext {
                index,
                sub_index: self.sub_index,
                value: &self.value,
            })?;
        }
        Ok(self.value.clone())
    }
}

/// An object dictionary entry at a given 16-bit index.
pub struct Object {
    pub index: u16,
    pub kind: ObjectKind,
    pub name: String,
    subs: std::collections::BTreeMap<u8, SubEntry>,
}

impl Object {
    pub fn new(index: u16, kind: ObjectKind, name: impl Into<String>) -> Self {
        Object {
            index,
            kind,
            name: name.into(),
            subs: std::collections::BTreeMap::new(),
        }
    }

    pub fn insert_sub(&mut self, entry: SubEntry) -> Result<(), crate::CanOpenError> {
        let sub_index = entry.sub_index;
        if self.subs.contains_key(&sub_index) {
            return Err(crate::CanOpenError::DuplicateSubIndex {
                index: self.index,
                sub_index,
            });
        }
        self.subs.insert(sub_index, entry);
        Ok(())
    }

    pub fn remove_sub(&mut self, sub_index: u8) -> Option<SubEntry> {
        self.subs.remove(&sub_index)
    }

    pub fn sub(&self, sub_index: u8) -> Option<&SubEntry> {
        self.subs.get(&sub_index)
    }

    pub fn sub_mut(&mut self, sub_index: u8) -> Option<&mut SubEntry> {
        self.subs.get_mut(&sub_index)
    }

    pub fn subs(&self) -> impl Iterator<Item = &SubEntry> {
        self.subs.values()
    }

    /// The highest valid sub-index, read from sub-index 0 for array/record
    /// objects (the "number of entries" convention).
    pub fn highest_sub_index(&self) -> u8 {
        match self.kind {
            ObjectKind::Variable => 0,
            ObjectKind::Array | ObjectKind::Record => match self.subs.get(&0).map(|s| s.value()) {
                Some(Value::Unsigned8(n)) => *n,
                _ => self.subs.keys().copied().max().unwrap_or(0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping_applies_when_both_limits_set() {
        let mut sub = SubEntry::new(0, Access::ReadWrite, Value::Unsigned8(15))
            .with_limits(Value::Unsigned8(10), Value::Unsigned8(20));
        sub.set(0x2000, Value::Unsigned8(25)).unwrap();
        assert_eq!(*sub.value(), Value::Unsigned8(20));
    }

    #[test]
    fn write_to_read_only_is_rejected() {
        let mut sub = SubEntry::new(0, Access::ReadOnly, Value::Unsigned8(1));
        let err = sub.set(0x1018, Value::Unsigned8(2)).unwrap_err();
        assert_eq!(err, AbortCode::NoWrite);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut sub = SubEntry::new(0, Access::ReadWrite, Value::Unsigned8(1));
        let err = sub.set(0x2000, Value::Unsigned16(2)).unwrap_err();
        assert_eq!(err, AbortCode::TypeLen);
    }
}
