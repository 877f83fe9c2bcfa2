//! The object dictionary.

mod object;

pub use object::{Access, DownloadContext, DownloadHook, Object, ObjectKind, SubEntry, UploadContext, UploadHook};

use std::collections::BTreeMap;

use crate::abort::AbortCode;
use crate::error::CanOpenError;
use crate::value::Value;

/// A callback invoked whenever a remote or local write lands on a
/// PDO-mapped sub-entry, so the PDO engine can decide to transmit an
/// event-driven TPDO ("TPDO event indication").
pub type TpdoEventFn = Box<dyn FnMut(u16, u8) + Send>;

/// The ordered index → object map plus node metadata.
pub struct Dictionary {
    pub node_id: u8,
    pub baud: u32,
    pub profile: u32,
    pub lss: bool,
    /// Bitmask of type codes accepted in PDOs as padding ("dummy" entries).
    pub dummy_type_mask: u32,
    objects: BTreeMap<u16, Object>,
    tpdo_event: Option<TpdoEventFn>,
}

impl Dictionary {
    pub fn new(node_id: u8, baud: u32, profile: u32) -> Result<Self, CanOpenError> {
        let unconfigured_local = 255;
        if node_id != unconfigured_local && (node_id == 0 || node_id > 127) {
            return Err(CanOpenError::InvalidNodeId { node_id });
        }
        Ok(Dictionary {
            node_id,
            baud,
            profile,
            lss: false,
            dummy_type_mask: 0,
            objects: BTreeMap::new(),
            tpdo_event: None,
        })
    }

    pub fn set_tpdo_event(&mut self, cb: TpdoEventFn) {
        self.tpdo_event = Some(cb);
    }

    fn notify_tpdo_event(&mut self, index: u16, sub_index: u8) {
        if let Some(cb) = self.tpdo_event.as_mut() {
            cb(index, sub_index);
        }
    }

    pub fn insert_object(&mut self, object: Object) -> Result<(), CanOpenError> {
        if self.objects.contains_key(&object.index) {
            return Err(CanOpenError::DuplicateIndex { index: object.index });
        }
        self.objects.insert(object.index, object);
        Ok(())
    }

    pub fn remove_object(&mut self, index: u16) -> Option<Object> {
        self.objects.remove(&index)
    }

    pub fn find_object(&self, index: u16) -> Option<&Object> {
        self.objects.get(&index)
    }

    pub fn find_object_mut(&mut self, index: u16) -> Option<&mut Object> {
        self.objects.get_mut(&index)
    }

    pub fn find_sub(&self, index: u16, sub_index: u8) -> Option<&SubEntry> {
        self.objects.get(&index)?.sub(sub_index)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn insert_sub(&mut self, index: u16, entry: SubEntry) -> Result<(), CanOpenError> {
        let object = self
            .objects
            .get_mut(&index)
            .ok_or(CanOpenError::ObjectDoesNotExist { index })?;
        object.insert_sub(entry)
    }

    pub fn remove_sub(&mut self, index: u16, sub_index: u8) -> Option<SubEntry> {
        self.objects.get_mut(&index)?.remove_sub(sub_index)
    }

    /// Get the value at (index, sub_index), running the upload hook and
    /// reporting an abort code on any failure.
    pub fn get(&mut self, index: u16, sub_index: u8) -> Result<Value, AbortCode> {
        let object = self.objects.get_mut(&index).ok_or(AbortCode::NoObj)?;
        let sub = object.sub_mut(sub_index).ok_or(AbortCode::NoSub)?;
        sub.get(index)
    }

    /// Set the value at (index, sub_index): type check, access check,
    /// range clamp, download hook, in that order.
    pub fn set(&mut self, index: u16, sub_index: u8, value: Value) -> Result<(), AbortCode> {
        let object = self.objects.get_mut(&index).ok_or(AbortCode::NoObj)?;
        let sub = object.sub_mut(sub_index).ok_or(AbortCode::NoSub)?;
        sub.set(index, value)?;
        self.notify_tpdo_event(index, sub_index);
        Ok(())
    }

    /// Read the raw little-endian serialization at (index, sub_index),
    /// used to bridge remote SDO uploads into the dictionary.
    pub fn read_raw(&mut self, index: u16, sub_index: u8) -> Result<Vec<u8>, AbortCode> {
        Ok(self.get(index, sub_index)?.to_bytes())
    }

    /// Write raw bytes at (index, sub_index), parsing them per the
    /// sub-entry's declared type, used to bridge remote SDO downloads.
    pub fn write_raw(&mut self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), AbortCode> {
        let data_type = {
            let object = self.objects.get(&index).ok_or(AbortCode::NoObj)?;
            let sub = object.sub(sub_index).ok_or(AbortCode::NoSub)?;
            sub.data_type
        };
        if let Some(size) = data_type.fixed_size() {
            if data.len() < size {
                return Err(AbortCode::TypeLenLow);
            }
            if data.len() > size {
                return Err(AbortCode::TypeLenHigh);
            }
        }
        let (value, _) = Value::parse(data_type, data).map_err(|_| AbortCode::TypeLen)?;
        self.set(index, sub_index, value)
    }

    /// The current byte size a value at (index, sub_index) would
    /// serialize to, without running the upload hook — used by the SDO
    /// server to decide expedited vs. segmented transfer up front.
    pub fn current_size(&self, index: u16, sub_index: u8) -> Result<usize, AbortCode> {
        let object = self.objects.get(&index).ok_or(AbortCode::NoObj)?;
        let sub = object.sub(sub_index).ok_or(AbortCode::NoSub)?;
        Ok(sub.value().byte_len())
    }

    /// Validate that (index, sub_index) can be PDO-mapped for `bit_length`
    /// bits: object must exist, be PDO-mappable, and the bit length must
    /// not exceed the sub-entry's own size.
    pub fn validate_pdo_map(
        &self,
        index: u16,
        sub_index: u8,
        bit_length: u16,
    ) -> Result<(), AbortCode> {
        let object = self.objects.get(&index).ok_or(AbortCode::NoObj)?;
        let sub = object.sub(sub_index).ok_or(AbortCode::NoSub)?;
        if !sub.pdo_mappable {
            return Err(AbortCode::NoPdo);
        }
        let available_bits = sub.value().byte_len() as u16 * 8;
        if bit_length > available_bits {
            return Err(AbortCode::NoPdo);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dictionary() -> Dictionary {
        let mut dict = Dictionary::new(1, 500_000, 0x0192).unwrap();
        let mut obj = Object::new(0x2000, ObjectKind::Variable, "test-object");
        obj.insert_sub(SubEntry::new(0, Access::ReadWrite, Value::Unsigned16(0)).pdo_mappable(true))
            .unwrap();
        dict.insert_object(obj).unwrap();
        dict
    }

    #[test]
    fn read_after_write_round_trips() {
        let mut dict = sample_dictionary();
        dict.write_raw(0x2000, 0, &[0x34, 0x12]).unwrap();
        let bytes = dict.read_raw(0x2000, 0).unwrap();
        assert_eq!(bytes, vec![0x34, 0x12]);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut dict = sample_dictionary();
        let dup = Object::new(0x2000, ObjectKind::Variable, "dup");
        assert_eq!(
            dict.insert_object(dup),
            Err(CanOpenError::DuplicateIndex { index: 0x2000 })
        );
    }

    #[test]
    fn missing_object_reports_no_obj() {
        let mut dict = sample_dictionary();
        assert_eq!(dict.get(0x3000, 0), Err(AbortCode::NoObj));
    }

    #[test]
    fn missing_sub_reports_no_sub() {
        let mut dict = sample_dictionary();
        assert_eq!(dict.get(0x2000, 5), Err(AbortCode::NoSub));
    }

    #[test]
    fn pdo_map_validation_checks_mappable_and_length() {
        let dict = sample_dictionary();
        assert!(dict.validate_pdo_map(0x2000, 0, 16).is_ok());
        assert_eq!(
            dict.validate_pdo_map(0x2000, 0, 32),
            Err(AbortCode::NoPdo)
        );
    }
}
