// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro.

/// Defines a protocol enumeration whose values are not limited to the named
/// constants.
///
/// The generated type is a `#[repr(transparent)]` newtype over the storage
/// integer with one associated constant per variant, so any value read off the
/// wire is representable and can be matched against the known constants
/// without undefined behavior. Unknown values print as their number.
///
/// The type derives `Copy`, `Clone`, `Debug`, `Eq`, `PartialEq`, `Hash`,
/// `Ord` and `PartialOrd`, and converts to and from its storage type.
///
/// # Examples
///
/// ```
/// use open_enum::open_enum;
/// open_enum! {
///     pub enum PacketKind: u16 {
///         DATA = 6,
///         COMPLETION = 11,
///     }
/// }
///
/// assert_eq!(PacketKind::DATA.0, 6);
/// assert_eq!(PacketKind::from(11), PacketKind::COMPLETION);
/// assert_eq!(PacketKind::COMPLETION.name(), Some("COMPLETION"));
/// assert_eq!(PacketKind(3).name(), None);
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl $name {
            /// Returns the name of the constant matching this value, if any.
            #[allow(unreachable_patterns)]
            pub fn name(&self) -> Option<&'static str> {
                match *self {
                    $( Self::$variant => Some(stringify!($variant)), )*
                    _ => None,
                }
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match self.name() {
                    Some(s) => fmt.pad(s),
                    None => ::core::fmt::Debug::fmt(&self.0, fmt),
                }
            }
        }

        impl ::core::convert::From<$storage> for $name {
            fn from(value: $storage) -> Self {
                Self(value)
            }
        }

        impl ::core::convert::From<$name> for $storage {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}
