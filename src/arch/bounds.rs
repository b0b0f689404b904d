//! Where does the address space end, and where does the stack start?
//!
//! Linux puts the top of the initial thread's stack one guard page below the
//! end of user space, and user space ends at one of a handful of well-known
//! ceilings (2 GB or 3 GB on 32-bit kernels, 128 TB with 4-level page tables
//! on 64-bit). Classifying the address of any local variable against those
//! ceilings tells us which addressing model we are running under. This never
//! fails -- the stack has to be *somewhere*.

/// The fixed address-space boundaries of this process. Computed once from a
/// stack address at [`crate::init()`] time and read-only afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpaceBounds {
    /// Highest addressable value (kernel mapping included).
    pub max_addr: usize,
    /// Highest user-space addressable value.
    pub max_user_addr: usize,
    /// Top of the initial thread's stack (one guard page below
    /// `max_user_addr`).
    pub stack_top: usize,
}

#[cfg(target_pointer_width = "64")]
mod limits {
    /// 256 TB, the 48-bit address limit.
    pub const MAX_ADDR_256TB: usize = 0xffff_ffff_ffff;
    /// 128 TB, the 64-bit user-space limit.
    pub const MAX_ADDR_128TB: usize = 0x7fff_ffff_ffff;
    pub const MAX_ADDR_4GB: usize = 0xffff_ffff;
    pub const MAX_ADDR_3GB: usize = 0xbfff_ffff;
    pub const MAX_ADDR_2GB: usize = 0x7fff_ffff;
}

#[cfg(target_pointer_width = "32")]
mod limits {
    pub const MAX_ADDR_4GB: usize = 0xffff_ffff;
    pub const MAX_ADDR_3GB: usize = 0xbfff_ffff;
    pub const MAX_ADDR_2GB: usize = 0x7fff_ffff;
}

pub use limits::*;

/// Classify the current stack and return the process bounds.
pub fn detect() -> AddressSpaceBounds {
    // Any local will do; we only care which ceiling its address is under.
    let probe = 0u8;
    classify(&probe as *const u8 as usize, page_size::get())
}

/// Pick the bounds triple for a stack address `sp`, with `page` bytes of
/// guard page below the user-space ceiling.
#[cfg(target_pointer_width = "64")]
pub fn classify(sp: usize, page: usize) -> AddressSpaceBounds {
    if sp < MAX_ADDR_2GB - page {
        AddressSpaceBounds {
            max_addr: MAX_ADDR_4GB,
            max_user_addr: MAX_ADDR_2GB,
            stack_top: MAX_ADDR_2GB - page,
        }
    } else if sp < MAX_ADDR_3GB - page {
        AddressSpaceBounds {
            max_addr: MAX_ADDR_4GB,
            max_user_addr: MAX_ADDR_3GB,
            stack_top: MAX_ADDR_3GB - page,
        }
    } else {
        AddressSpaceBounds {
            max_addr: MAX_ADDR_256TB,
            max_user_addr: MAX_ADDR_128TB,
            stack_top: MAX_ADDR_128TB - page,
        }
    }
}

/// Pick the bounds triple for a stack address `sp`, with `page` bytes of
/// guard page below the user-space ceiling.
#[cfg(target_pointer_width = "32")]
pub fn classify(sp: usize, page: usize) -> AddressSpaceBounds {
    if sp < MAX_ADDR_2GB - page {
        AddressSpaceBounds {
            max_addr: MAX_ADDR_4GB,
            max_user_addr: MAX_ADDR_2GB,
            stack_top: MAX_ADDR_2GB - page,
        }
    } else {
        AddressSpaceBounds {
            max_addr: MAX_ADDR_4GB,
            max_user_addr: MAX_ADDR_3GB,
            stack_top: MAX_ADDR_3GB - page,
        }
    }
}
