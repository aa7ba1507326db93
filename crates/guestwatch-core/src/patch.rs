use std::rc::Rc;

use crate::{mem, Error, Introspect, Va};

/// A scoped edit of guest memory.
///
/// [`apply`] captures the current bytes before overwriting them; [`undo`]
/// writes them back. Dropping the patch undoes it silently. The patch does
/// not serialize against the guest: the caller pauses the guest or places
/// the patch on a trapped frame.
///
/// [`apply`]: TempPatch::apply
/// [`undo`]: TempPatch::undo
pub struct TempPatch {
    vm: Rc<dyn Introspect>,
    applied: Option<Applied>,
}

struct Applied {
    addr: Va,
    old: Vec<u8>,
}

impl TempPatch {
    /// Creates an idle patch bound to one guest.
    pub fn new(vm: Rc<dyn Introspect>) -> Self {
        Self { vm, applied: None }
    }

    /// Whether an apply is outstanding.
    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    /// The bytes saved by the outstanding apply, if any.
    pub fn old_bytes(&self) -> Option<&[u8]> {
        self.applied.as_ref().map(|a| a.old.as_slice())
    }

    /// Reads the current contents at `addr` into the saved buffer, writes
    /// `new_bytes` over them, and returns the old bytes.
    ///
    /// Fails with [`Error::PatchAlreadyApplied`] when called twice without
    /// an intervening [`undo`], with [`Error::PatchNullAddress`] for a
    /// NULL target, and with any read/write failure of the underlying
    /// primitives.
    ///
    /// [`undo`]: TempPatch::undo
    pub fn apply(&mut self, addr: Va, new_bytes: &[u8]) -> Result<Vec<u8>, Error> {
        if addr.is_null() {
            return Err(Error::PatchNullAddress);
        }
        if self.applied.is_some() {
            return Err(Error::PatchAlreadyApplied);
        }

        let mut old = vec![0u8; new_bytes.len()];
        mem::read_kva(self.vm.as_ref(), addr, &mut old)?;
        mem::write_kva(self.vm.as_ref(), addr, new_bytes)?;

        tracing::debug!(%addr, len = new_bytes.len(), "patch applied");
        self.applied = Some(Applied {
            addr,
            old: old.clone(),
        });
        Ok(old)
    }

    /// Writes the saved bytes back if an apply is outstanding.
    ///
    /// Returns whether a restoration happened.
    pub fn undo(&mut self) -> Result<bool, Error> {
        let applied = match self.applied.take() {
            Some(applied) => applied,
            None => return Ok(false),
        };
        match mem::write_kva(self.vm.as_ref(), applied.addr, &applied.old) {
            Ok(()) => {
                tracing::debug!(addr = %applied.addr, "patch undone");
                Ok(true)
            }
            Err(err) => {
                // Keep the state so a retry (or the drop path) can attempt
                // the restoration again.
                self.applied = Some(applied);
                Err(err)
            }
        }
    }

    /// Applies a little-endian 8-bit overwrite, returning the old value.
    pub fn apply_u8(&mut self, addr: Va, value: u8) -> Result<u8, Error> {
        let old = self.apply(addr, &value.to_le_bytes())?;
        Ok(old[0])
    }

    /// Applies a little-endian 16-bit overwrite, returning the old value.
    pub fn apply_u16(&mut self, addr: Va, value: u16) -> Result<u16, Error> {
        let old = self.apply(addr, &value.to_le_bytes())?;
        Ok(u16::from_le_bytes([old[0], old[1]]))
    }

    /// Applies a little-endian 32-bit overwrite, returning the old value.
    pub fn apply_u32(&mut self, addr: Va, value: u32) -> Result<u32, Error> {
        let old = self.apply(addr, &value.to_le_bytes())?;
        Ok(u32::from_le_bytes([old[0], old[1], old[2], old[3]]))
    }

    /// Applies a little-endian 64-bit overwrite, returning the old value.
    pub fn apply_u64(&mut self, addr: Va, value: u64) -> Result<u64, Error> {
        let old = self.apply(addr, &value.to_le_bytes())?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&old);
        Ok(u64::from_le_bytes(bytes))
    }
}

impl Drop for TempPatch {
    fn drop(&mut self) {
        if let Err(err) = self.undo() {
            tracing::warn!(%err, "failed to undo patch on drop");
        }
    }
}
