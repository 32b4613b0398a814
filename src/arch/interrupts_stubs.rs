use core::arch::global_asm;

use crate::config::KERNEL_DATA_SEGMENT;

/// Emits one 16-bit entry stub for `$vector`.
///
/// The stub saves ds/es and the `pusha` block (forming a `TrapFrame` on top
/// of the CPU-pushed ip/cs/flags), switches to the kernel data segment,
/// calls `trap_dispatch(vector, frame)` and returns with `iret`.
///
/// The frame pointer is an offset into the interrupted stack segment; it is
/// valid because every task stack lives in the kernel data segment.
macro_rules! trap_stub_asm {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                stringify!($name),
                ":\n",
                "    push ds\n",
                "    push es\n",
                "    pusha\n",
                "    mov ax, {data_segment}\n",
                "    mov ds, ax\n",
                "    mov es, ax\n",
                "    cld\n",
                "    movzx eax, sp\n",
                "    push eax\n",
                "    mov ecx, {vector}\n",
                "    push ecx\n",
                "    calll trap_dispatch\n",
                "    add sp, 8\n",
                "    popa\n",
                "    pop es\n",
                "    pop ds\n",
                "    iret\n",
            ),
            vector = const $vector,
            data_segment = const KERNEL_DATA_SEGMENT,
        );
    };
}

macro_rules! trap_stubs {
    ($($name:ident => $vector:expr),* $(,)?) => {
        $(trap_stub_asm!($name, $vector);)*

        extern "C" {
            $(fn $name();)*
        }

        /// Stubs in `SERVICED_VECTORS` order.
        pub(super) static TRAP_STUBS: [unsafe extern "C" fn(); crate::arch::interrupts::SERVICED_VECTOR_COUNT] =
            [$($name),*];
    };
}

trap_stubs! {
    isr0_divide_error_stub => 0x00,
    isr1_debug_stub => 0x01,
    isr2_nmi_stub => 0x02,
    isr3_breakpoint_stub => 0x03,
    isr4_overflow_stub => 0x04,
    isr5_bound_range_stub => 0x05,
    isr6_invalid_opcode_stub => 0x06,
    isr7_device_not_available_stub => 0x07,
    irq0_pit_timer_stub => 0x20,
    irq1_keyboard_stub => 0x21,
    irq2_pic_cascade_stub => 0x22,
    irq3_com2_stub => 0x23,
    irq4_com1_stub => 0x24,
    irq5_lpt2_stub => 0x25,
    irq6_floppy_stub => 0x26,
    irq7_lpt1_or_spurious_stub => 0x27,
    irq8_cmos_rtc_stub => 0x28,
    irq9_legacy_stub => 0x29,
    irq10_free_stub => 0x2A,
    irq11_free_stub => 0x2B,
    irq12_ps2_mouse_stub => 0x2C,
    irq13_fpu_stub => 0x2D,
    irq14_primary_ata_stub => 0x2E,
    irq15_secondary_ata_stub => 0x2F,
}
