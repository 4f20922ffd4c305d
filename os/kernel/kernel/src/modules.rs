//! # Boot modules as files
//!
//! The boot loader hands over executables as Multiboot modules. Each module
//! carries a command line whose first word is taken as its path, so
//! `module /boot/init.elf /bin/init` in a GRUB entry (or
//! `-initrd "init.elf /bin/init"` for QEMU) makes the image readable as
//! `/bin/init`.

use arrayvec::ArrayVec;
use kernel_elf::FileSource;

/// Most modules the kernel keeps track of; further ones are ignored.
pub const MAX_MODULES: usize = 16;

#[derive(Debug, Clone, Copy)]
struct BootFile {
    path: &'static str,
    bytes: &'static [u8],
}

#[derive(Debug, Default)]
pub struct BootModules {
    files: ArrayVec<BootFile, MAX_MODULES>,
}

impl BootModules {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            files: ArrayVec::new_const(),
        }
    }

    /// Register a module under the first word of `cmdline`.
    ///
    /// Returns `false` if the module has no name or the list is full.
    pub fn add(&mut self, cmdline: &'static str, bytes: &'static [u8]) -> bool {
        let Some(path) = cmdline.split_ascii_whitespace().next() else {
            log::warn!("ignoring boot module without a name ({} bytes)", bytes.len());
            return false;
        };
        if self.files.try_push(BootFile { path, bytes }).is_err() {
            log::warn!("ignoring boot module {path}: more than {MAX_MODULES} modules");
            return false;
        }
        log::info!("boot module {path}: {} bytes", bytes.len());
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.files.iter().map(|f| f.path)
    }
}

impl FileSource for BootModules {
    /// An exact path match wins; a module registered under a bare name
    /// (no `/`) also answers for any path ending in that name.
    fn read(&self, path: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .or_else(|| {
                let name = path.rsplit('/').next()?;
                self.files.iter().find(|f| !f.path.contains('/') && f.path == name)
            })
            .map(|f| f.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static INIT: [u8; 4] = *b"\x7fELF";
    static SH: [u8; 2] = *b"sh";

    #[test]
    fn first_word_is_the_path() {
        let mut m = BootModules::new();
        assert!(m.add("/bin/init quiet", &INIT));
        assert_eq!(m.read("/bin/init"), Some(&INIT[..]));
        assert_eq!(m.read("/bin/init quiet"), None);
        assert_eq!(m.read("/bin/sh"), None);
    }

    #[test]
    fn bare_names_match_any_directory() {
        let mut m = BootModules::new();
        m.add("sh", &SH);
        m.add("/bin/init", &INIT);
        assert_eq!(m.read("/usr/bin/sh"), Some(&SH[..]));
        assert_eq!(m.read("sh"), Some(&SH[..]));
        assert_eq!(m.read("/sbin/init"), None);
        assert_eq!(m.paths().collect::<Vec<_>>(), ["sh", "/bin/init"]);
    }

    #[test]
    fn nameless_and_surplus_modules_are_dropped() {
        let mut m = BootModules::new();
        assert!(!m.add("   ", &SH));
        for _ in 0..MAX_MODULES {
            assert!(m.add("x", &SH));
        }
        assert!(!m.add("y", &SH));
        assert_eq!(m.len(), MAX_MODULES);
    }
}
