// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The [`usvfs_core::path::FullPathResolver`] actually wired into the
//! dispatcher: on Windows, the un-hooked `GetFullPathNameW`, guarded by the
//! `FULL_PATHNAME` mutex group so the canonicalizer never recurses into our
//! own hook; off Windows (unit tests, the diagnostic CLI on a dev box),
//! `CwdResolver`'s lexical join, which is all a non-Windows host can offer.

use usvfs_core::path::FullPathResolver;

#[cfg(windows)]
mod win {
    use super::FullPathResolver;
    use usvfs_core::mutex_group::{self, MutexGroup};
    use windows_sys::Win32::Storage::FileSystem::GetFullPathNameW;

    #[derive(Default)]
    pub struct HookedResolver;

    impl FullPathResolver for HookedResolver {
        fn full_path(&self, relative: &str) -> String {
            let _guard = mutex_group::enter(MutexGroup::FullPathname);
            let wide: Vec<u16> = relative.encode_utf16().chain(std::iter::once(0)).collect();
            let mut buf = vec![0u16; 4096];
            // SAFETY: `wide` is NUL-terminated and `buf` is large enough for
            // any path this engine cares about; a return larger than the
            // buffer is vanishingly unlikely and simply falls back below.
            let len = unsafe {
                GetFullPathNameW(wide.as_ptr(), buf.len() as u32, buf.as_mut_ptr(), std::ptr::null_mut())
            };
            if len == 0 || len as usize >= buf.len() {
                return relative.to_string();
            }
            String::from_utf16_lossy(&buf[..len as usize])
        }
    }
}

#[cfg(windows)]
pub use win::HookedResolver as PlatformResolver;

#[cfg(not(windows))]
pub use usvfs_core::path::CwdResolver as PlatformResolver;
