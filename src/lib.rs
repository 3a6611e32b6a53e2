#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod serial;

pub mod allocator;
pub mod errno;
pub mod fs;
pub mod interrupts;
pub mod loader;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod syscalls;

#[cfg(test)]
mod test_support;

/// Kernel entry, jumped to by the boot stub with the physical address of
/// the multiboot2 information structure.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    serial::init();
    log_info!("quartz kernel starting.");

    interrupts::init();
    log_info!("Traps and interrupt controller initialized.");

    memory::init(multiboot_info_addr);

    let pid = {
        let mut table = process::PROCESS_TABLE.lock();
        memory::with_kernel_space(|kernel| {
            let mut fa = memory::FRAME_ALLOCATOR.lock();
            table.spawn("/bin/init", &["/bin/init"], &[], kernel, &mut *fa)
        })
        .expect("failed to spawn init")
    };
    log_info!("init spawned as pid {}.", pid.0);

    x86_64::instructions::interrupts::enable();
    scheduler::start()
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
