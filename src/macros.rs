//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in cowtree.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types. cowtree's persisted records (the node
//! header and the root record) only carry u16 entry counts and u64
//! keys/addresses/checksums, so those are the only widths supported.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct NodeHeader {
//!     len: U16,
//!     begin: U64,
//! }
//!
//! impl NodeHeader {
//!     zerocopy_accessors! {
//!         len: u16,
//!         begin: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn len(&self) -> u16 { self.len.get() }
//! // pub fn set_len(&mut self, val: u16) { self.len = U16::new(val); }
//! // pub fn begin(&self) -> u64 { self.begin.get() }
//! // pub fn set_begin(&mut self, val: u64) { self.begin = U64::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
