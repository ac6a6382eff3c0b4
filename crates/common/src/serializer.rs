//! The abstract serializer contract.
//!
//! Every `serialize` routine in the runtime drives a [`Serializer`] with the
//! same call sequence in both modes; the mode decides whether values are
//! produced or consumed. A failed `begin_*` call pushes nothing and must not
//! be paired with an `end_*` call.

use glam::{Mat4, Quat, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeMode {
    Read,
    Write,
}

pub trait Serializer {
    fn mode(&self) -> SerializeMode;

    fn is_reading(&self) -> bool {
        self.mode() == SerializeMode::Read
    }

    fn begin_object(&mut self, name: Option<&str>) -> bool;
    fn end_object(&mut self);

    /// In write mode `len` is the number of elements that will follow; in
    /// read mode it receives the stored element count.
    fn begin_array(&mut self, len: &mut usize, name: Option<&str>) -> bool;
    fn end_array(&mut self);

    /// Whether the current object holds `name`. Always false in write mode.
    fn has_field(&self, name: &str) -> bool;

    fn value_bool(&mut self, value: &mut bool, name: Option<&str>) -> bool;
    fn value_u32(&mut self, value: &mut u32, name: Option<&str>) -> bool;
    fn value_f32(&mut self, value: &mut f32, name: Option<&str>) -> bool;
    fn value_string(&mut self, value: &mut String, name: Option<&str>) -> bool;
    /// Fixed-length float tuples: vectors, quaternions, matrices.
    fn value_floats(&mut self, values: &mut [f32], name: Option<&str>) -> bool;

    /// The first error recorded, if any.
    fn error(&self) -> Option<&str>;
    /// Record an error. Only the first one is kept.
    fn report_error(&mut self, message: String);
}

impl<'a> dyn Serializer + 'a {
    /// Serialize any [`Field`] under `name`.
    pub fn value<T: Field + ?Sized>(&mut self, value: &mut T, name: Option<&str>) -> bool {
        value.serialize_field(self, name)
    }
}

/// A value the serializer can read or write in place.
pub trait Field {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool;
}

impl Field for bool {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        s.value_bool(self, name)
    }
}

impl Field for u32 {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        s.value_u32(self, name)
    }
}

impl Field for f32 {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        s.value_f32(self, name)
    }
}

impl Field for String {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        s.value_string(self, name)
    }
}

impl Field for Vec3 {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        let mut raw = self.to_array();
        let ok = s.value_floats(&mut raw, name);
        if ok && s.is_reading() {
            *self = Vec3::from_array(raw);
        }
        ok
    }
}

impl Field for Quat {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        let mut raw = self.to_array();
        let ok = s.value_floats(&mut raw, name);
        if ok && s.is_reading() {
            *self = Quat::from_array(raw);
        }
        ok
    }
}

impl Field for Mat4 {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        let mut raw = self.to_cols_array();
        let ok = s.value_floats(&mut raw, name);
        if ok && s.is_reading() {
            *self = Mat4::from_cols_array(&raw);
        }
        ok
    }
}
