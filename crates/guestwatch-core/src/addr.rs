use crate::{error::Translation, Error, Introspect};

/// The number of low bits discarded when turning an address into a page
/// index. Fixed at 12 for the 4 KiB pages of an x86-64 guest.
pub const PAGE_SHIFT: u64 = 12;

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

macro_rules! addr_newtype {
    ($name:ident, $doc:expr) => {
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
        pub struct $name(pub u64);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`.")]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }

        impl ::std::ops::Add<u64> for $name {
            type Output = $name;

            fn add(self, rhs: u64) -> $name {
                Self(self.0 + rhs)
            }
        }

        impl ::std::ops::AddAssign<u64> for $name {
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl ::std::ops::Sub<u64> for $name {
            type Output = $name;

            fn sub(self, rhs: u64) -> $name {
                Self(self.0 - rhs)
            }
        }

        impl ::std::ops::Sub<$name> for $name {
            type Output = u64;

            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

addr_newtype!(Va, "A guest kernel virtual address.");
addr_newtype!(Pa, "A guest physical address.");
addr_newtype!(Gfn, "A guest frame number (physical page index).");
addr_newtype!(PageNum, "A virtual page number.");

impl Va {
    /// Checks whether the address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The virtual page this address falls in.
    pub fn page_num(self) -> PageNum {
        PageNum(self.0 >> PAGE_SHIFT)
    }

    /// Offset of this address within its page.
    pub fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Translates this kernel virtual address to a physical address by
    /// walking the guest page tables through the introspection handle.
    pub fn to_pa(self, vm: &dyn Introspect) -> Result<Pa, Error> {
        vm.kernel_to_pa(self).map_err(|source| Error::Translation {
            kind: Translation::KvaToGpa,
            va: Some(self),
            symbol: None,
            source,
        })
    }

    /// Translates this kernel virtual address to the guest frame number of
    /// the backing physical page.
    pub fn to_gfn(self, vm: &dyn Introspect) -> Result<Gfn, Error> {
        Ok(self.to_pa(vm)?.gfn())
    }
}

impl Pa {
    /// The guest frame this physical address falls in.
    pub fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Offset of this address within its frame.
    pub fn frame_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl PageNum {
    /// Base virtual address of this page.
    pub fn va(self) -> Va {
        Va(self.0 << PAGE_SHIFT)
    }

    /// Virtual address at `offset` into this page.
    pub fn va_at(self, offset: u64) -> Va {
        self.va() + offset
    }

    /// Guest frame backing this virtual page, resolved through the guest
    /// page tables.
    pub fn to_gfn(self, vm: &dyn Introspect) -> Result<Gfn, Error> {
        self.va().to_gfn(vm)
    }
}

impl Gfn {
    /// Base physical address of this frame.
    pub fn pa(self) -> Pa {
        Pa(self.0 << PAGE_SHIFT)
    }

    /// Physical address at `offset` into this frame.
    pub fn pa_at(self, offset: u64) -> Pa {
        self.pa() + offset
    }
}
