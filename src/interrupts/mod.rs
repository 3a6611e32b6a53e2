pub mod gdt;
pub mod idt;
pub mod usermode;

pub use idt::{irq_done, register_irq_isr};

/// The timer keeps ticking even though scheduling is cooperative; the
/// default handler just acknowledges it.
fn timer_tick(line: u8) {
    idt::irq_done(line);
}

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
    idt::register_irq_isr(0, timer_tick);
}
