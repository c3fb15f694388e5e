#![warn(rust_2018_idioms)]
#![warn(macro_use_extern_crate, meta_variable_misuse, missing_abi)]
#![warn(unused_lifetimes, unused_macro_rules, unused_qualifications)]

//! Diagnostics for PCIe switch ports: configuration space decoding, receiver
//! lane margining, LTSSM observation and a compliance test runner that ties
//! them together.
//!
//! All hardware access goes through [`RegisterAccess`], so every component can
//! be driven by a real switch driver or by an in-memory model.

pub mod clock;
pub mod compliance;
pub mod config;
pub mod device;
pub mod error;
pub mod ext_cpb;
pub mod ltssm;
pub mod margin;
pub mod registry;

use core::ops::Range;
use std::{rc::Rc, sync::Arc};

pub use error::{AccessError, Error, ErrorKind, Result};

/// Register-level access to one opened switch device.
///
/// Configuration space is addressed with 12-bit byte offsets and is always
/// read and written a full DWORD at a time. Vendor registers live in the
/// device's memory-mapped register window.
pub trait RegisterAccess {
	fn read_config_dword(&self, offset: u16) -> Result<u32, AccessError>;
	fn write_config_dword(&self, offset: u16, val: u32) -> Result<(), AccessError>;
	fn read_vendor_reg(&self, offset: u32) -> Result<u32, AccessError>;
	fn write_vendor_reg(&self, offset: u32, val: u32) -> Result<(), AccessError>;
}

macro_rules! forward_register_access {
	($($ptr:ident),+) => {$(
		impl<T: RegisterAccess + ?Sized> RegisterAccess for $ptr<T> {
			#[inline]
			fn read_config_dword(&self, offset: u16) -> Result<u32, AccessError> {
				(**self).read_config_dword(offset)
			}
			#[inline]
			fn write_config_dword(&self, offset: u16, val: u32) -> Result<(), AccessError> {
				(**self).write_config_dword(offset, val)
			}
			#[inline]
			fn read_vendor_reg(&self, offset: u32) -> Result<u32, AccessError> {
				(**self).read_vendor_reg(offset)
			}
			#[inline]
			fn write_vendor_reg(&self, offset: u32, val: u32) -> Result<(), AccessError> {
				(**self).write_vendor_reg(offset, val)
			}
		}
	)+};
}

forward_register_access!(Box, Rc, Arc);

impl<T: RegisterAccess + ?Sized> RegisterAccess for &T {
	#[inline]
	fn read_config_dword(&self, offset: u16) -> Result<u32, AccessError> {
		(**self).read_config_dword(offset)
	}
	#[inline]
	fn write_config_dword(&self, offset: u16, val: u32) -> Result<(), AccessError> {
		(**self).write_config_dword(offset, val)
	}
	#[inline]
	fn read_vendor_reg(&self, offset: u32) -> Result<u32, AccessError> {
		(**self).read_vendor_reg(offset)
	}
	#[inline]
	fn write_vendor_reg(&self, offset: u32, val: u32) -> Result<(), AccessError> {
		(**self).write_vendor_reg(offset, val)
	}
}

trait ReprPrimitive: 'static + Copy {
	type Repr;
}

impl ReprPrimitive for u8 {
	type Repr = u8;
}

impl ReprPrimitive for u16 {
	type Repr = u16;
}

impl ReprPrimitive for u32 {
	type Repr = u32;
}

trait BitManip {
	fn bit_range(self, range: Range<u32>) -> Self;
	fn from_bit_range_masked(val: Self, range: Range<u32>) -> Self;
	fn new_bit_mask(range: Range<u32>) -> Self;
}

macro_rules! impl_bit_manip {
	($($ty:ty),+) => {$(
		impl BitManip for $ty {
			#[inline]
			fn bit_range(self, range: Range<u32>) -> Self {
				self << (Self::BITS - range.end) >> (Self::BITS + range.start - range.end)
			}

			#[inline]
			fn from_bit_range_masked(val: Self, range: Range<u32>) -> Self {
				val << (Self::BITS + range.start - range.end) >> (Self::BITS - range.end)
			}

			#[inline]
			fn new_bit_mask(range: Range<u32>) -> Self {
				Self::from_bit_range_masked(Self::MAX, range)
			}
		}
	)+};
}

impl_bit_manip!(u8, u16, u32);

/// Generates getters and builder-style setters for bit fields of a register
/// newtype `Self(u16)`/`Self(u32)`. Values are kept in host order.
macro_rules! bit_accessors {
	($($(#[$attr:meta])* $name:ident: $($ty:ty,)? $start:literal $(..$end:literal)? { get $(=> $map_get:expr)?; $($set_kw:ident $set_name:ident;)? })+) => {
		$(bit_accessors!(@single $(#[$attr])* $name: $($ty,)? $start $(..$end)? { get $(=> $map_get)?; $($set_kw $set_name;)? });)+
	};
	(@single $(#[$attr:meta])* $name:ident: $($ty:ty,)? $start:literal $(..$end:literal)? { get $(=> $map_get:expr)?; $($set_kw:ident $set_name:ident;)? }) => {
		bit_accessors!(@get $(#[$attr])* $name: $($ty,)? $start $(..$end)?, $($map_get)?);
		bit_accessors!(@set $(#[$attr])* $name: $($ty,)? $start $(..$end)?, $($set_kw $set_name)?);
	};
	(@get $(#[$attr:meta])* $name:ident: $pos:literal,) => {
		$(#[$attr])*
		#[inline]
		pub fn $name(self) -> bool {
			self.0 & (1 << $pos) != 0
		}
	};
	(@get $(#[$attr:meta])* $name:ident: $ty:ty, $start:literal..$end:literal,) => {
		$(#[$attr])*
		#[inline]
		pub fn $name(self) -> $ty {
			crate::BitManip::bit_range(self.0, $start..$end) as _
		}
	};
	(@get $(#[$attr:meta])* $name:ident: $ty:ty, $start:literal..$end:literal, $map_get:expr) => {
		$(#[$attr])*
		#[inline]
		pub fn $name(self) -> $ty {
			$map_get(crate::BitManip::bit_range(self.0, $start..$end))
		}
	};
	(@set $(#[$attr:meta])* $name:ident: $($ty:ty,)? $start:literal $(..$end:literal)?,) => {};
	(@set $(#[$attr:meta])* $name:ident: $pos:literal, set $set_name:ident) => {
		$(#[$attr])*
		#[inline]
		#[must_use]
		pub fn $set_name(self, val: bool) -> Self {
			Self(
				(self.0 & !((1 as <Self as ReprPrimitive>::Repr) << $pos))
					| ((val as <Self as ReprPrimitive>::Repr) << $pos)
			)
		}
	};
	(@set $(#[$attr:meta])* $name:ident: $ty:ty, $start:literal..$end:literal, set $set_name:ident) => {
		$(#[$attr])*
		#[inline]
		#[must_use]
		pub fn $set_name(self, val: $ty) -> Self {
			debug_assert!((val as u128) < (1_u128 << ($end - $start)), "invalid {}", stringify!($name));
			let mask: <Self as ReprPrimitive>::Repr = crate::BitManip::new_bit_mask($start..$end);
			Self((self.0 & !mask) | (((val as <Self as ReprPrimitive>::Repr) << $start) & mask))
		}
	};
}

/// Implements [`ReprPrimitive`] and the raw conversions for register
/// newtypes.
macro_rules! register {
	($($name:ident($repr:ty)),+ $(,)?) => {$(
		impl ReprPrimitive for $name {
			type Repr = $repr;
		}

		impl $name {
			#[inline]
			pub const fn from_raw(raw: $repr) -> Self {
				Self(raw)
			}

			#[inline]
			pub const fn raw(self) -> $repr {
				self.0
			}
		}

		impl From<$repr> for $name {
			#[inline]
			fn from(raw: $repr) -> Self {
				Self(raw)
			}
		}
	)+};
}

use {bit_accessors, register};
