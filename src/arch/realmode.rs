//! Bare-metal backend for the 16-bit real-mode target.
//!
//! Built for the LLVM `code16` model: instructions run in real mode, data
//! pointers are 32 bits wide with the upper half zero, and calls use
//! `calll`/`retl` with cdecl stack arguments.

use core::arch::{asm, global_asm};

use super::constants::{Flags, IVT_ENTRY_SIZE};
use super::context::{
    ContextSwitch, CpuState, CPU_STATE_AX, CPU_STATE_BP, CPU_STATE_BX, CPU_STATE_CS, CPU_STATE_CX,
    CPU_STATE_DI, CPU_STATE_DS, CPU_STATE_DX, CPU_STATE_ES, CPU_STATE_FLAGS, CPU_STATE_IP,
    CPU_STATE_SI, CPU_STATE_SP, CPU_STATE_SS,
};
use super::interrupts::{is_serviced_vector, IRQ_BASE};
use super::ivt::{FarPtr, TrapStubs, VectorTable};
use super::port::{inb, outb};
use super::{Cpu, PortIo};
use crate::config::KERNEL_DATA_SEGMENT;

#[path = "interrupts_stubs.rs"]
mod interrupts_stubs;

/// The machine the kernel was loaded on.
///
/// Kernel data, heap and stacks live in [`KERNEL_DATA_SEGMENT`], the same
/// segment the trap stubs load into ds/es.
pub struct RealModeMachine;

impl RealModeMachine {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for RealModeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIo for RealModeMachine {
    unsafe fn read_u8(&self, port: u16) -> u8 {
        inb(port)
    }

    unsafe fn write_u8(&self, port: u16, value: u8) {
        outb(port, value)
    }
}

impl Cpu for RealModeMachine {
    fn interrupts_enabled(&self) -> bool {
        let flags: u16;
        // SAFETY:
        // - Reading FLAGS via pushf/pop is side-effect free.
        unsafe {
            asm!(
                "pushf",
                "pop {0:x}",
                out(reg) flags,
                options(nomem, preserves_flags)
            );
        }
        Flags::from_bits_retain(flags).contains(Flags::INTERRUPT)
    }

    fn disable_interrupts(&self) {
        // SAFETY:
        // - `cli` only clears IF.
        unsafe {
            asm!("cli", options(nomem, nostack, preserves_flags));
        }
    }

    fn enable_interrupts(&self) {
        // SAFETY:
        // - `sti` only sets IF; the IVT is installed before anyone calls this.
        unsafe {
            asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }

    fn halt_forever(&self) -> ! {
        loop {
            // SAFETY:
            // - Masking interrupts and halting has no memory effects.
            unsafe {
                asm!("cli", "hlt", options(nomem, nostack));
            }
        }
    }

    fn kernel_code_segment(&self) -> u16 {
        let cs: u16;
        // SAFETY:
        // - Reading CS has no side effects.
        unsafe {
            asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
        }
        cs
    }

    fn kernel_data_segment(&self) -> u16 {
        KERNEL_DATA_SEGMENT
    }
}

impl VectorTable for RealModeMachine {
    fn read_vector(&self, vector: u8) -> FarPtr {
        let slot = vector as u32 * IVT_ENTRY_SIZE as u32;
        let offset: u16;
        let segment: u16;
        // SAFETY:
        // - The IVT occupies 0000:0000..0000:0400; `slot` addresses one entry.
        // - ES is restored before the block ends.
        unsafe {
            asm!(
                "push es",
                "xor ax, ax",
                "mov es, ax",
                "mov cx, word ptr es:[edi]",
                "mov dx, word ptr es:[edi + 2]",
                "pop es",
                in("edi") slot,
                out("ax") _,
                out("cx") offset,
                out("dx") segment,
                options(readonly, preserves_flags)
            );
        }
        FarPtr::new(segment, offset)
    }

    fn write_vector(&self, vector: u8, target: FarPtr) {
        let slot = vector as u32 * IVT_ENTRY_SIZE as u32;
        // SAFETY:
        // - The IVT occupies 0000:0000..0000:0400; `slot` addresses one entry.
        // - Callers keep interrupts masked, so no half-written entry is used.
        unsafe {
            asm!(
                "push es",
                "xor ax, ax",
                "mov es, ax",
                "mov word ptr es:[edi], cx",
                "mov word ptr es:[edi + 2], dx",
                "pop es",
                in("edi") slot,
                in("cx") target.offset,
                in("dx") target.segment,
                out("ax") _,
                options(preserves_flags)
            );
        }
    }
}

impl TrapStubs for RealModeMachine {
    fn stub_address(&self, vector: u8) -> Option<FarPtr> {
        if !is_serviced_vector(vector) {
            return None;
        }
        let index = if vector < IRQ_BASE {
            vector as usize
        } else {
            8 + (vector - IRQ_BASE) as usize
        };
        let stub = *interrupts_stubs::TRAP_STUBS.get(index)?;
        Some(FarPtr::new(self.kernel_code_segment(), stub as usize as u16))
    }
}

extern "C" {
    fn lidos_context_switch(old: *mut CpuState, new: *const CpuState);
}

impl ContextSwitch for RealModeMachine {
    unsafe fn switch(&self, old: *mut CpuState, new: *const CpuState) {
        lidos_context_switch(old, new);
    }
}

// Stack after the prologue (offsets from sp):
//   0 flags, 2 edi, 6 esi, 10 ebx, 14 ebp, 18 return address, 22 old, 26 new
//
// The outgoing record resumes at `.Lswitch_resume` with sp pointing at the
// saved edi, so a resumed call pops the callee-saved registers and returns.
// The incoming record is entered through `iret` after pushing its
// flags/cs/ip and ds on its own stack; both pushes are consumed again, so a
// bootstrapped task starts with sp exactly at its stack top.
global_asm!(
    ".section .text",
    ".global lidos_context_switch",
    "lidos_context_switch:",
    "    push ebp",
    "    push ebx",
    "    push esi",
    "    push edi",
    "    pushf",
    "    cli",
    "    mov ebx, dword ptr [esp + 22]",
    "    mov esi, dword ptr [esp + 26]",
    "    mov word ptr [ebx + {ax}], ax",
    "    mov word ptr [ebx + {cx}], cx",
    "    mov word ptr [ebx + {dx}], dx",
    "    mov ax, word ptr [esp + 2]",
    "    mov word ptr [ebx + {di}], ax",
    "    mov ax, word ptr [esp + 6]",
    "    mov word ptr [ebx + {si}], ax",
    "    mov ax, word ptr [esp + 10]",
    "    mov word ptr [ebx + {bx}], ax",
    "    mov ax, word ptr [esp + 14]",
    "    mov word ptr [ebx + {bp}], ax",
    "    pop ax",
    "    mov word ptr [ebx + {flags}], ax",
    "    mov word ptr [ebx + {es}], es",
    "    mov word ptr [ebx + {ds}], ds",
    "    mov word ptr [ebx + {cs}], cs",
    "    mov word ptr [ebx + {ss}], ss",
    "    mov word ptr [ebx + {sp}], sp",
    "    mov word ptr [ebx + {ip}], offset .Lswitch_resume",
    "    mov ss, word ptr [esi + {ss}]",
    "    movzx esp, word ptr [esi + {sp}]",
    "    push word ptr [esi + {flags}]",
    "    push word ptr [esi + {cs}]",
    "    push word ptr [esi + {ip}]",
    "    mov ax, word ptr [esi + {ax}]",
    "    mov cx, word ptr [esi + {cx}]",
    "    mov dx, word ptr [esi + {dx}]",
    "    mov bx, word ptr [esi + {bx}]",
    "    mov bp, word ptr [esi + {bp}]",
    "    mov di, word ptr [esi + {di}]",
    "    mov es, word ptr [esi + {es}]",
    "    push word ptr [esi + {ds}]",
    "    mov si, word ptr [esi + {si}]",
    "    pop ds",
    "    iret",
    ".Lswitch_resume:",
    "    pop edi",
    "    pop esi",
    "    pop ebx",
    "    pop ebp",
    "    retl",
    di = const CPU_STATE_DI,
    si = const CPU_STATE_SI,
    bp = const CPU_STATE_BP,
    sp = const CPU_STATE_SP,
    bx = const CPU_STATE_BX,
    dx = const CPU_STATE_DX,
    cx = const CPU_STATE_CX,
    ax = const CPU_STATE_AX,
    es = const CPU_STATE_ES,
    ds = const CPU_STATE_DS,
    flags = const CPU_STATE_FLAGS,
    ip = const CPU_STATE_IP,
    cs = const CPU_STATE_CS,
    ss = const CPU_STATE_SS,
);
