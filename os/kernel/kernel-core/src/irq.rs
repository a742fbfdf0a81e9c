use crate::KernelError;
use kernel_info::config::IRQ_LINES;
use kernel_sync::SyncOnceCell;
use log::{debug, trace};

/// Device callback bound to one interrupt line.
#[derive(Debug, Clone, Copy)]
pub struct IrqHandler {
    pub callback: fn(usize),
    /// Passed back to `callback` on every interrupt.
    pub ctx: usize,
}

/// Interrupt lines and their callbacks. A line is bound at most once.
pub struct IrqTable {
    lines: [SyncOnceCell<IrqHandler>; IRQ_LINES],
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: [const { SyncOnceCell::new() }; IRQ_LINES],
        }
    }

    /// # Errors
    /// [`KernelError::NoSuchLine`] past [`IRQ_LINES`],
    /// [`KernelError::LineTaken`] if the line already has a callback.
    pub fn bind(&self, line: usize, handler: IrqHandler) -> Result<(), KernelError> {
        let cell = self.lines.get(line).ok_or(KernelError::NoSuchLine(line))?;
        cell.set(handler).map_err(|_| KernelError::LineTaken(line))?;
        debug!("irq: line {line} bound");
        Ok(())
    }

    #[must_use]
    pub fn handler(&self, line: usize) -> Option<IrqHandler> {
        self.lines.get(line)?.get().copied()
    }

    /// Run the callback of `line`; `false` for an unbound line.
    pub fn dispatch(&self, line: usize) -> bool {
        match self.handler(line) {
            Some(h) => {
                (h.callback)(h.ctx);
                true
            }
            None => {
                trace!("irq: spurious interrupt on line {line}");
                false
            }
        }
    }
}
