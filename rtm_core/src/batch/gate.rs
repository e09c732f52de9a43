use crate::batch::record::TransferRecord;

/// Lowest accepted parallelism.
pub const MIN_ACTIVE: usize = 1;

/// Highest accepted parallelism.
pub const MAX_ACTIVE: usize = 5;

/// Keeps the number of simultaneously running transfers at or under a fixed
/// bound. Selection is FIFO over submission order with no preemption; the
/// caller does the actual starting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConcurrencyGate {
    max_active: usize,
}

impl ConcurrencyGate {
    pub fn new(requested: usize) -> Self {
        Self {
            max_active: requested.clamp(MIN_ACTIVE, MAX_ACTIVE),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Index of the next record to start, or `None` when every slot is taken
    /// or nothing is startable. A startable `preferred` record wins over the
    /// FIFO scan.
    pub fn next_to_start(
        &self,
        records: &[TransferRecord],
        preferred: Option<usize>,
    ) -> Option<usize> {
        let active = records.iter().filter(|r| r.is_active()).count();
        if active >= self.max_active {
            return None;
        }
        if let Some(index) = preferred {
            if records.get(index).is_some_and(|r| r.is_startable()) {
                return Some(index);
            }
        }
        records.iter().position(|r| r.is_startable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::batch::record::{TransferJob, TransferRecord};
    use crate::descriptor::Downloadable;

    #[test]
    fn clamps_out_of_range_parallelism() {
        assert_eq!(ConcurrencyGate::new(0).max_active(), 1);
        assert_eq!(ConcurrencyGate::new(3).max_active(), 3);
        assert_eq!(ConcurrencyGate::new(99).max_active(), 5);
    }

    #[test]
    fn records_without_tasks_are_not_startable() {
        let (record, _stream) = TransferRecord::new(
            0,
            TransferJob::Download(Downloadable::new("http://host/a.bin")),
        );
        let gate = ConcurrencyGate::new(2);
        assert_eq!(gate.next_to_start(&[record], None), None);
    }

    #[test]
    fn empty_batch_has_nothing_to_start() {
        let gate = ConcurrencyGate::new(1);
        assert_eq!(gate.next_to_start(&[], Some(3)), None);
    }
}
