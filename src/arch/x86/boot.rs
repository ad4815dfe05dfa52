//! Multiboot entry point.
//!
//! The bootloader drops us at `_start` with paging off, running from the
//! kernel's physical load address. We build a page directory mapping the
//! first gigabyte of physical memory at `KERNEL_VBASE` with 4 MiB pages
//! (plus a temporary identity mapping to survive the switch), enable
//! paging, and continue in the higher half. The identity mapping stays in
//! place; early boot still reads low structures through it before the
//! frame table takes over.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .multiboot.data, "a"
    .align 4
    .long 0x1badb002            # magic
    .long 0x00000003            # page-align modules, want the memory map
    .long -(0x1badb002 + 0x00000003)

    .section .bss
    .align 16
    boot_stack_bottom:
    .skip 0x4000
    boot_stack_top:

    .section .data
    .align 4096
    boot_page_directory:
    .skip 4096

    .section .multiboot.text, "ax"
    .global _start
    .type _start, @function
    _start:
        cld
        cli

        # The kernel is linked in the higher half but runs from its
        # physical load address until paging is on; every symbol reference
        # below is rebased by hand.
        movl $(boot_page_directory - 0xc0000000), %edi

        # Identity-map the first 4 MiB so the instruction after the paging
        # switch is still mapped.
        movl $0x00000083, (%edi)        # PS | RW | P

        # Entries 768..1023: the 1 GiB direct map at 0xc0000000.
        leal 3072(%edi), %edx
        movl $0x00000083, %eax
        movl $256, %ecx
    1:
        movl %eax, (%edx)
        addl $4, %edx
        addl $0x00400000, %eax
        loop 1b

        movl %cr4, %eax
        orl $0x10, %eax                 # PSE: 4 MiB pages
        movl %eax, %cr4

        movl $(boot_page_directory - 0xc0000000), %eax
        movl %eax, %cr3

        movl %cr0, %eax
        orl $0x80010000, %eax           # PG | WP
        movl %eax, %cr0

        # Jump to the higher half.
        leal 2f, %eax
        jmp *%eax
    2:
        movl $boot_stack_top, %esp
        xorl %ebp, %ebp

        pushl %ebx                      # physical address of the mb_info
        call startup

    3:
        hlt
        jmp 3b
    .size _start, . - _start
    "#,
    options(att_syntax),
);
