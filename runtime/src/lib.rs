// ppc2rs-runtime - guest runtime for recompiled Xbox 360 code
//
// Everything the emitted Rust source links against at runtime:
//
// 1. **Context** (`context.rs`): the per-thread PPC register context
// 2. **Guest memory** (`guest.rs`): big-endian load/store over the 4 GiB
//    arena, MMIO-checked variants, atomic word operations
// 3. **Dispatch** (`dispatch.rs`): the indirect-call table for computed
//    branches
// 4. **Traps** (`traps.rs`): service calls behind tw/twi/td/tdi
// 5. **Sync** (`sync.rs`): the global MSR lock, setjmp/longjmp,
//    exception-handler wrappers
// 6. **SIMD** (`simd.rs`): Altivec/VMX128 operation helpers with guest
//    element reversal
// 7. **VMM** (`vmm/`): the heap map backing the guest's Nt*/Mm* memory
//    syscalls
// 8. **Kernel** (`kernel.rs`): argument marshalling, NTSTATUS codes, and
//    the memory-family kernel exports
//
// # Memory model
//
// A single contiguous 4 GiB host arena represents the guest address
// space. Host address of guest byte `g` is `base + g + phys_offset(g)`.
// The arena is created at process start, populated by the image loader,
// and then frozen except for VMM-managed regions.

pub mod clock;
pub mod context;
pub mod dispatch;
pub mod guest;
pub mod kernel;
pub mod mmio;
pub mod simd;
pub mod sync;
pub mod traps;
pub mod vmm;

pub use context::{CrField, Fpscr, GuestContext, GuestFn, Reg, VReg, Xer};
pub use dispatch::{dispatch, FuncMapping};
pub use kernel::KernelState;
pub use vmm::{Memory, VmError};

/// One-stop startup for a recompiled image: install the kernel state,
/// register the built-in kernel exports, and build the dispatch table
/// from the emitted mapping array.
pub fn init_runtime(
    code_base: u32,
    code_size: u32,
    mappings: &[FuncMapping],
) -> std::io::Result<&'static KernelState> {
    let state = kernel::install_kernel_state()?;
    kernel::register_memory_exports();
    dispatch::install(code_base, code_size, mappings);
    Ok(state)
}
