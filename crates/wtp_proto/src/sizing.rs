//! See [`OpSpecSizeControl`].

use std::collections::VecDeque;

use tracing::debug;

/// Initial Read/BlockWrite OpSpec payload size in bytes.
pub const WTP_OPSPEC_INIT: usize = 24;
/// Smallest OpSpec payload size the controller will request.
pub const WTP_OPSPEC_MIN: usize = 8;
/// Largest OpSpec payload size the controller will request.
pub const WTP_OPSPEC_MAX: usize = 30;

/// Adaptive per-connection Read and BlockWrite payload sizing.
///
/// A WISP harvests power opportunistically, so the amount of data it can
/// move per tag operation varies with its energy state. This controller
/// probes additively: every OpSpec added to an in-flight AccessSpec records
/// its size, and each reported outcome nudges the corresponding budget by
/// two bytes - up on a full success, down on a failure - within
/// [`WTP_OPSPEC_MIN`]..=[`WTP_OPSPEC_MAX`]. Sizes stay even; the LLRP layer
/// converts bytes to words.
#[derive(Debug)]
pub struct OpSpecSizeControl {
    read_size: usize,
    write_size: usize,
    pending_reads: VecDeque<usize>,
    pending_writes: VecDeque<usize>,
}

impl Default for OpSpecSizeControl {
    fn default() -> Self {
        Self::new(WTP_OPSPEC_INIT, WTP_OPSPEC_INIT)
    }
}

impl OpSpecSizeControl {
    /// Creates a size controller with the given initial budgets.
    #[must_use]
    pub const fn new(read_size: usize, write_size: usize) -> Self {
        Self {
            read_size,
            write_size,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
        }
    }

    /// Current Read OpSpec budget in bytes.
    #[must_use]
    pub const fn read_size(&self) -> usize {
        self.read_size
    }

    /// Current BlockWrite OpSpec budget in bytes.
    #[must_use]
    pub const fn write_size(&self) -> usize {
        self.write_size
    }

    /// Records the size of a Read OpSpec added to the in-flight AccessSpec.
    pub fn add_read(&mut self, size: usize) {
        self.pending_reads.push_back(size);
    }

    /// Records the size of a BlockWrite OpSpec added to the in-flight
    /// AccessSpec.
    pub fn add_write(&mut self, size: usize) {
        self.pending_writes.push_back(size);
    }

    /// Reports the outcome of the oldest pending Read OpSpec.
    ///
    /// Grows the budget by 2 when the read succeeded at no less than the
    /// current budget; shrinks it by 2 on failure. A report with nothing
    /// pending is ignored.
    pub fn report_read_result(&mut self, succeeded: bool, actual_size: usize) {
        if self.pending_reads.pop_front().is_none() {
            return;
        }
        if succeeded && actual_size >= self.read_size && self.read_size < WTP_OPSPEC_MAX {
            self.read_size += 2;
            debug!(read_size = self.read_size, "Read size increased");
        }
        if !succeeded && self.read_size > WTP_OPSPEC_MIN {
            self.read_size -= 2;
            debug!(read_size = self.read_size, "Read size decreased");
        }
    }

    /// Reports the outcome of the oldest pending BlockWrite OpSpec.
    pub fn report_write_result(&mut self, succeeded: bool, actual_size: usize) {
        if self.pending_writes.pop_front().is_none() {
            return;
        }
        if succeeded && actual_size >= self.write_size && self.write_size < WTP_OPSPEC_MAX {
            self.write_size += 2;
            debug!(write_size = self.write_size, "BlockWrite size increased");
        }
        if !succeeded && self.write_size > WTP_OPSPEC_MIN {
            self.write_size -= 2;
            debug!(write_size = self.write_size, "BlockWrite size decreased");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_grows_on_full_success() {
        let mut ctrl = OpSpecSizeControl::default();
        ctrl.add_read(24);
        ctrl.report_read_result(true, 24);
        assert_eq!(ctrl.read_size(), 26);
    }

    #[test]
    fn read_does_not_grow_on_short_success() {
        let mut ctrl = OpSpecSizeControl::default();
        ctrl.add_read(24);
        ctrl.report_read_result(true, 10);
        assert_eq!(ctrl.read_size(), 24);
    }

    #[test]
    fn read_shrinks_on_failure() {
        let mut ctrl = OpSpecSizeControl::default();
        ctrl.add_read(24);
        ctrl.report_read_result(false, 0);
        assert_eq!(ctrl.read_size(), 22);
    }

    #[test]
    fn read_respects_bounds() {
        let mut ctrl = OpSpecSizeControl::new(WTP_OPSPEC_MAX, WTP_OPSPEC_INIT);
        ctrl.add_read(WTP_OPSPEC_MAX);
        ctrl.report_read_result(true, WTP_OPSPEC_MAX);
        assert_eq!(ctrl.read_size(), WTP_OPSPEC_MAX);

        let mut ctrl = OpSpecSizeControl::new(WTP_OPSPEC_MIN, WTP_OPSPEC_INIT);
        ctrl.add_read(WTP_OPSPEC_MIN);
        ctrl.report_read_result(false, 0);
        assert_eq!(ctrl.read_size(), WTP_OPSPEC_MIN);
    }

    #[test]
    fn write_symmetric() {
        let mut ctrl = OpSpecSizeControl::default();
        ctrl.add_write(24);
        ctrl.report_write_result(true, 24);
        assert_eq!(ctrl.write_size(), 26);
        ctrl.add_write(26);
        ctrl.report_write_result(false, 0);
        assert_eq!(ctrl.write_size(), 24);
    }

    #[test]
    fn results_pop_in_fifo_order() {
        let mut ctrl = OpSpecSizeControl::default();
        ctrl.add_read(24);
        ctrl.add_read(24);
        ctrl.report_read_result(true, 24);
        ctrl.report_read_result(false, 0);
        assert_eq!(ctrl.read_size(), 24);
        // nothing pending: ignored
        ctrl.report_read_result(false, 0);
        assert_eq!(ctrl.read_size(), 24);
    }
}
