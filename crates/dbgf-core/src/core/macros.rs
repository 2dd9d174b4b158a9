/// Declares a guest address newtype printed as fixed-width hex.
///
/// `$digits` is the number of hex digits the `Display` form is padded to.
macro_rules! impl_address {
    ($name:ident($type:ty), $digits:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $type);

        impl $name {
            #[doc = concat!("Wraps a raw `", stringify!($type), "`.")]
            pub const fn new(value: $type) -> Self {
                Self(value)
            }
        }

        impl From<$type> for $name {
            fn from(value: $type) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $type {
            fn from(value: $name) -> $type {
                value.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "{:#0width$x}", self.0, width = $digits + 2)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

pub(crate) use impl_address;
