//! Per-thread COM initialization for the DirectSound host.

use std::marker::PhantomData;

use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};

use crate::error::{Error, ErrorKind, Result};

thread_local!(static COM_INITIALIZED: ComInitialized = {
    // RPC_E_CHANGED_MODE means another library initialized this thread with a different
    // apartment model, which DirectSound tolerates.
    let result = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    ComInitialized {
        result,
        _ptr: PhantomData,
    }
});

/// RAII object that guards the fact that COM is initialized.
///
// The raw pointer removes `Send` and `Sync`: the guard belongs to one thread.
struct ComInitialized {
    result: windows::core::HRESULT,
    _ptr: PhantomData<*mut ()>,
}

impl Drop for ComInitialized {
    #[inline]
    fn drop(&mut self) {
        if self.result.is_ok() {
            unsafe { CoUninitialize() };
        }
    }
}

/// Ensures that COM is initialized in this thread.
pub(super) fn com_initialized() -> Result<()> {
    COM_INITIALIZED.with(|com| {
        if com.result.is_ok() || com.result == RPC_E_CHANGED_MODE {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::DriverError,
                format!(
                    "unable to initialize COM: {}",
                    windows::core::Error::from(com.result)
                ),
            ))
        }
    })
}
