#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    unsafe impl Send for Mmap {}
    unsafe impl Sync for Mmap {}

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_READWRITE);
                let mem = mem as *mut u8;
                if mem.is_null() {
                    panic!("failed to reserve {} bytes of address space", size);
                }
                Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }

    /// Back `[addr, addr + size)` with committed memory.
    pub fn commit(addr: usize, size: usize) {
        unsafe {
            VirtualAlloc(addr as _, size, MEM_COMMIT, PAGE_READWRITE);
        }
    }

    /// Return the backing of `[addr, addr + size)` to the OS. The range stays
    /// reserved.
    pub fn uncommit(addr: usize, size: usize) {
        unsafe {
            VirtualFree(addr as _, size, MEM_DECOMMIT);
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    unsafe impl Send for Mmap {}
    unsafe impl Sync for Mmap {}

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("failed to reserve {} bytes of address space", size);
                }
                Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }

    /// Back `[addr, addr + size)` with committed memory.
    pub fn commit(addr: usize, size: usize) {
        unsafe {
            libc::madvise(
                addr as *mut _,
                size as _,
                libc::MADV_WILLNEED | libc::MADV_SEQUENTIAL,
            );
        }
    }

    /// Return the backing of `[addr, addr + size)` to the OS. The range stays
    /// reserved.
    pub fn uncommit(addr: usize, size: usize) {
        unsafe {
            libc::madvise(addr as *mut _, size as _, libc::MADV_DONTNEED);
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
