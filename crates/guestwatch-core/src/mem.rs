//! Typed guest-memory accessors and symbol-chained translations.
//!
//! Thin wrappers over the [`Introspect`] primitives that attach the
//! address and access kind to any failure. All kernel-space helpers use
//! [`KERNEL_PID`].

use crate::{
    error::{ReadAccess, Translation, WriteAccess},
    Error, Gfn, Introspect, Pa, Pid, Va, KERNEL_PID,
};

/// Reads `buf.len()` bytes at a virtual address of process `pid`.
pub fn read_va(vm: &dyn Introspect, va: Va, pid: Pid, buf: &mut [u8]) -> Result<(), Error> {
    vm.read_va(va, pid, buf).map_err(|source| Error::MemoryRead {
        addr: va,
        kind: ReadAccess::Bytes,
        source,
    })
}

/// Writes `buf` at a virtual address of process `pid`.
pub fn write_va(vm: &dyn Introspect, va: Va, pid: Pid, buf: &[u8]) -> Result<(), Error> {
    vm.write_va(va, pid, buf)
        .map_err(|source| Error::MemoryWrite {
            addr: va,
            kind: WriteAccess::Bytes,
            source,
        })
}

/// Reads `buf.len()` bytes at a kernel virtual address.
pub fn read_kva(vm: &dyn Introspect, kva: Va, buf: &mut [u8]) -> Result<(), Error> {
    read_va(vm, kva, KERNEL_PID, buf)
}

/// Writes `buf` at a kernel virtual address.
pub fn write_kva(vm: &dyn Introspect, kva: Va, buf: &[u8]) -> Result<(), Error> {
    write_va(vm, kva, KERNEL_PID, buf)
}

macro_rules! fixed_width_accessors {
    ($read_name:ident, $write_name:ident, $ty:ty, $read_kind:ident, $write_kind:ident) => {
        #[doc = concat!("Reads a little-endian `", stringify!($ty), "` at a kernel virtual address.")]
        pub fn $read_name(vm: &dyn Introspect, kva: Va) -> Result<$ty, Error> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            vm.read_va(kva, KERNEL_PID, &mut buf)
                .map_err(|source| Error::MemoryRead {
                    addr: kva,
                    kind: ReadAccess::$read_kind,
                    source,
                })?;
            Ok(<$ty>::from_le_bytes(buf))
        }

        #[doc = concat!("Writes a little-endian `", stringify!($ty), "` at a kernel virtual address.")]
        pub fn $write_name(vm: &dyn Introspect, kva: Va, value: $ty) -> Result<(), Error> {
            vm.write_va(kva, KERNEL_PID, &value.to_le_bytes())
                .map_err(|source| Error::MemoryWrite {
                    addr: kva,
                    kind: WriteAccess::$write_kind,
                    source,
                })
        }
    };
}

fixed_width_accessors!(read_u8, write_u8, u8, U8, U8);
fixed_width_accessors!(read_u16, write_u16, u16, U16, U16);
fixed_width_accessors!(read_u32, write_u32, u32, U32, U32);
fixed_width_accessors!(read_u64, write_u64, u64, U64, U64);

/// Reads a pointer-sized value at a kernel virtual address.
pub fn read_addr(vm: &dyn Introspect, kva: Va) -> Result<Va, Error> {
    let mut buf = [0u8; 8];
    vm.read_va(kva, KERNEL_PID, &mut buf)
        .map_err(|source| Error::MemoryRead {
            addr: kva,
            kind: ReadAccess::Addr,
            source,
        })?;
    Ok(Va(u64::from_le_bytes(buf)))
}

/// Reads a NUL-terminated string at a kernel virtual address.
///
/// Reads forward one page fragment at a time so a string ending just
/// before an unmapped page still resolves.
pub fn read_cstr(vm: &dyn Introspect, kva: Va) -> Result<String, Error> {
    let mut out = Vec::new();
    let mut cursor = kva;

    loop {
        let until_page_end = crate::PAGE_SIZE - cursor.page_offset();
        let mut chunk = vec![0u8; until_page_end as usize];
        vm.read_va(cursor, KERNEL_PID, &mut chunk)
            .map_err(|source| Error::MemoryRead {
                addr: cursor,
                kind: ReadAccess::Str,
                source,
            })?;

        match chunk.iter().position(|&b| b == 0) {
            Some(nul) => {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            None => {
                out.extend_from_slice(&chunk);
                cursor += until_page_end;
            }
        }
    }
}

/// Resolves a kernel symbol to its virtual address.
pub fn symbol_to_va(vm: &dyn Introspect, symbol: &str) -> Result<Va, Error> {
    vm.symbol_to_va(symbol).map_err(|source| Error::Translation {
        kind: Translation::SymToKva,
        va: None,
        symbol: Some(symbol.into()),
        source,
    })
}

/// Resolves a kernel symbol to the physical address it is backed by.
pub fn symbol_to_pa(vm: &dyn Introspect, symbol: &str) -> Result<Pa, Error> {
    let va = symbol_to_va(vm, symbol)?;
    vm.kernel_to_pa(va).map_err(|source| Error::Translation {
        kind: Translation::SymToGpa,
        va: Some(va),
        symbol: Some(symbol.into()),
        source,
    })
}

/// Resolves a kernel symbol to the guest frame it lives in.
pub fn symbol_to_gfn(vm: &dyn Introspect, symbol: &str) -> Result<Gfn, Error> {
    Ok(symbol_to_pa(vm, symbol)?.gfn())
}

/// Resolves a named structure-field offset from the kernel layout.
pub fn offset_of(vm: &dyn Introspect, name: &str) -> Result<u64, Error> {
    vm.offset_of(name).map_err(|source| Error::OffsetLookup {
        name: name.into(),
        source,
    })
}
